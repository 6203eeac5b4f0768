//! Pipeline assembly
//!
//! An [`Agent`] collects sinks during setup, then [`Agent::start`] wires the
//! pipeline in dependency order:
//!
//! 1. list the files already present;
//! 2. register the directory watch, freeze the bus and spawn one dispatch
//!    loop per sink, then spawn the watch loop;
//! 3. start a tail for every file now present: at end of file for those
//!    listed in step 1, from byte zero for the rest.
//!
//! A file created while this runs is seen by the watcher, by discovery, or
//! both. Either way it is read from byte zero, and the tail registry drops
//! the duplicate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{BusBuilder, LineReceiver, OverflowPolicy};
use crate::config::{Config, SinkConfig};
use crate::connectors::Sink;
use crate::dispatch::{dispatch_loop, DispatchOptions};
use crate::error::{Error, Result};
use crate::pattern::LinePattern;
use crate::shutdown::{Dispatcher, ShutdownCoordinator};
use crate::tail::{initial_tails, list_files, DirectoryWatcher, TailLauncher, TailRegistry};

/// Everything the pipeline needs besides its sinks.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub name: String,
    pub directory: PathBuf,
    pub poll_interval: Duration,
    pub missing_timeout: Option<Duration>,
    pub pattern: Option<LinePattern>,
    pub file_filter: Option<glob::Pattern>,
    pub grace: Duration,
}

impl AgentSettings {
    /// Defaults for watching `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            name: "isengard".to_string(),
            directory: directory.into(),
            poll_interval: Duration::from_millis(250),
            missing_timeout: None,
            pattern: None,
            file_filter: None,
            grace: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            directory: config.directory.clone(),
            poll_interval: config.tail.poll_interval(),
            missing_timeout: config.tail.missing_timeout(),
            pattern: config.line_pattern()?,
            file_filter: config.file_filter()?,
            grace: config.shutdown.grace(),
        })
    }
}

struct PendingSink<S> {
    sink: Arc<S>,
    rx: LineReceiver,
    options: DispatchOptions,
}

/// A pipeline being assembled.
pub struct Agent<S: Sink> {
    settings: AgentSettings,
    bus: BusBuilder,
    sinks: Vec<PendingSink<S>>,
}

impl<S: Sink> Agent<S> {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            bus: BusBuilder::new(),
            sinks: Vec::new(),
        }
    }

    /// Agent for `config`, with `sinks` paired to `config.sinks` by position.
    pub fn from_config(config: &Config, sinks: Vec<S>) -> Result<Self> {
        if sinks.len() != config.sinks.len() {
            return Err(Error::Config(format!(
                "{} sinks configured but {} created",
                config.sinks.len(),
                sinks.len()
            )));
        }

        let mut agent = Self::new(AgentSettings::from_config(config)?);
        for (sink, sink_config) in sinks.into_iter().zip(&config.sinks) {
            agent.add_configured_sink(sink, sink_config);
        }
        Ok(agent)
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Subscribe `sink` to the bus. Subscribers receive lines in the order
    /// they were added.
    pub fn add_sink(
        &mut self,
        sink: S,
        buffer: usize,
        overflow: OverflowPolicy,
        options: DispatchOptions,
    ) -> &mut Self {
        let rx = self.bus.subscribe(sink.name(), buffer, overflow);
        self.sinks.push(PendingSink {
            sink: Arc::new(sink),
            rx,
            options,
        });
        self
    }

    /// Subscribe `sink` with the channel and dispatch settings of `config`.
    pub fn add_configured_sink(&mut self, sink: S, config: &SinkConfig) -> &mut Self {
        self.add_sink(
            sink,
            config.buffer,
            config.overflow,
            DispatchOptions::from_config(config),
        )
    }

    /// Start the pipeline and return the handle that tears it down.
    pub async fn start(self) -> Result<ShutdownCoordinator<S>> {
        let Self {
            settings,
            bus,
            sinks,
        } = self;

        if sinks.is_empty() {
            tracing::warn!(agent = %settings.name, "No sinks configured, lines will be read and discarded");
        }

        let preexisting: HashSet<PathBuf> =
            list_files(&settings.directory, settings.file_filter.as_ref())
                .await?
                .into_iter()
                .collect();
        let (directory_watcher, events) = DirectoryWatcher::watch(&settings.directory)?;
        let bus = bus.build();

        let dispatchers: Vec<Dispatcher<S>> = sinks
            .into_iter()
            .map(|pending| Dispatcher {
                task: tokio::spawn(dispatch_loop(
                    Arc::clone(&pending.sink),
                    pending.rx,
                    pending.options,
                )),
                sink: pending.sink,
            })
            .collect();

        let cancel = CancellationToken::new();
        let launcher = TailLauncher::new(
            TailRegistry::new(),
            bus.clone(),
            settings.poll_interval,
            cancel.clone(),
        )
        .with_missing_timeout(settings.missing_timeout)
        .with_pattern(settings.pattern.clone())
        .with_filter(settings.file_filter.clone());

        let watcher = tokio::spawn(directory_watcher.run(
            events,
            launcher.clone(),
            cancel.child_token(),
        ));

        let discovered = match initial_tails(&settings.directory, &launcher, &preexisting).await {
            Ok(n) => n,
            Err(e) => {
                let coordinator =
                    ShutdownCoordinator::new(cancel, launcher, bus, watcher, dispatchers, settings.grace);
                coordinator.shutdown().await;
                return Err(e);
            }
        };

        tracing::info!(
            agent = %settings.name,
            directory = %settings.directory.display(),
            tails = discovered,
            sinks = bus.subscriber_count(),
            "Agent started"
        );

        Ok(ShutdownCoordinator::new(
            cancel,
            launcher,
            bus,
            watcher,
            dispatchers,
            settings.grace,
        ))
    }
}
