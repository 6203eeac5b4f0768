//! Dispatch loops
//!
//! One loop per sink: receive from the sink's bus channel until it closes and
//! hand every line to [`Sink::send`]. Failed sends are logged with the sink's
//! name and dropped. The loop never closes its sink; that happens once, during
//! shutdown, after the loop has drained.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::LineReceiver;
use crate::config::SinkConfig;
use crate::connectors::Sink;
use crate::error::Error;
use crate::types::LogLine;

/// Per-sink dispatch settings.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Deadline for a single send; `None` waits forever
    pub send_timeout: Option<Duration>,
    /// Only lines whose level is in this set are sent; empty means all
    pub levels: HashSet<String>,
}

impl DispatchOptions {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            levels: config.levels.iter().map(|l| l.to_ascii_uppercase()).collect(),
        }
    }

    /// Whether the level filter lets `line` through.
    ///
    /// Lines without a known level always pass.
    pub fn accepts(&self, line: &LogLine) -> bool {
        if self.levels.is_empty() {
            return true;
        }
        match line.level() {
            Some(level) => self.levels.contains(&level.to_ascii_uppercase()),
            None => true,
        }
    }
}

/// Counters reported when a loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub failed: u64,
    pub filtered: u64,
}

/// Drain `rx` into `sink` until the channel closes.
pub async fn dispatch_loop<S: Sink>(
    sink: Arc<S>,
    mut rx: LineReceiver,
    options: DispatchOptions,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    while let Some(line) = rx.recv().await {
        if !options.accepts(&line) {
            stats.filtered += 1;
            continue;
        }

        match send_one(&*sink, &line, options.send_timeout).await {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                stats.failed += 1;
                tracing::error!(
                    sink = %sink.name(),
                    source = %line.source.display(),
                    error = %e,
                    "Send failed, dropping line"
                );
            }
        }
    }

    tracing::info!(
        sink = %sink.name(),
        sent = stats.sent,
        failed = stats.failed,
        filtered = stats.filtered,
        "Dispatch loop finished"
    );
    stats
}

async fn send_one<S: Sink>(
    sink: &S,
    line: &LogLine,
    deadline: Option<Duration>,
) -> crate::error::Result<()> {
    match deadline {
        None => sink.send(line).await,
        Some(after) => match tokio::time::timeout(after, sink.send(line)).await {
            Ok(result) => result,
            Err(_) => Err(Error::SendTimeout {
                sink: sink.name().to_string(),
                after,
            }),
        },
    }
}
