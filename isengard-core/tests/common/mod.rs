//! Shared helpers for pipeline tests

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use isengard_core::dispatch::DispatchOptions;
use isengard_core::error::{Error, Result};
use isengard_core::{Agent, AgentSettings, LogLine, OverflowPolicy, Sink};

/// Short poll so tests do not wait long for growth.
pub const POLL: Duration = Duration::from_millis(20);

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// How a [`StubSink`] reacts to calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Record every line
    Capture,
    /// Record the attempt, then return an error
    Fail,
    /// Never return from `send`
    Hang,
    /// Capture lines but fail `close`
    FailClose,
}

/// What a stub observed; cloned out before the sink is handed to the agent.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    lines: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` lines were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let lines = self.lines();
            if lines.len() >= n {
                return lines;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} lines, got {:?}", n, lines);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` sends were attempted.
    pub async fn wait_for_attempts(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.attempts() < n {
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} attempts, got {}", n, self.attempts());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// In-process sink for driving the pipeline.
#[derive(Debug)]
pub struct StubSink {
    name: String,
    behavior: Behavior,
    recorder: Recorder,
}

impl StubSink {
    pub fn new(name: &str, behavior: Behavior) -> (Self, Recorder) {
        let recorder = Recorder::default();
        (
            Self {
                name: name.to_string(),
                behavior,
                recorder: recorder.clone(),
            },
            recorder,
        )
    }
}

#[async_trait]
impl Sink for StubSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, line: &LogLine) -> Result<()> {
        self.recorder.attempts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Fail => Err(Error::Sink {
                sink: self.name.clone(),
                message: "rejected".to_string(),
            }),
            Behavior::Capture | Behavior::FailClose => {
                self.recorder.lines.lock().unwrap().push(line.text.clone());
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        if self.behavior == Behavior::FailClose {
            return Err(Error::Sink {
                sink: self.name.clone(),
                message: "close failed".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for watching `dir` with test timings.
pub fn settings(dir: &Path) -> AgentSettings {
    isengard_core::logging::init_test();
    let mut settings = AgentSettings::new(dir);
    settings.name = "test".to_string();
    settings.poll_interval = POLL;
    settings.grace = Duration::from_secs(2);
    settings
}

/// Agent over `dir` with one stub per behavior, registered in order.
pub fn agent_with(dir: &Path, sinks: &[(&str, Behavior)]) -> (Agent<StubSink>, Vec<Recorder>) {
    let mut agent = Agent::new(settings(dir));
    let mut recorders = Vec::new();
    for (name, behavior) in sinks {
        let (sink, recorder) = StubSink::new(name, *behavior);
        agent.add_sink(sink, 1, OverflowPolicy::Block, DispatchOptions::default());
        recorders.push(recorder);
    }
    (agent, recorders)
}

pub fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
    f.flush().unwrap();
}

/// Paths this process currently holds open (Linux only).
#[cfg(target_os = "linux")]
pub fn open_paths() -> Vec<PathBuf> {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| std::fs::read_link(e.path()).ok())
        .collect()
}
