//! # isengard-core
//!
//! Core library for isengard - a log forwarding agent.
//!
//! This library provides:
//! - Tail sources that follow every file in a directory, including files
//!   created while running
//! - A line bus fanning each line out to every configured sink
//! - Sinks for an S3-compatible object store, Kafka and a Rollbar-style error
//!   tracker
//! - Configuration, logging and ordered shutdown
//!
//! ## Architecture
//!
//! ```text
//! discovery ─┐                                  ┌─► dispatch loop ─► sink
//!            ├─► tail source ─► forwarder ─► bus ┤
//! watcher  ──┘     (one per file)               └─► dispatch loop ─► sink
//! ```
//!
//! Per-file line order is preserved; lines from different files interleave.
//! With the default `block` overflow policy a slow sink slows every tail.
//!
//! ## Example
//!
//! ```rust,no_run
//! use isengard_core::{connectors, shutdown, Agent, Config};
//!
//! # async fn run() -> isengard_core::Result<()> {
//! let config = Config::load(None)?;
//! let sinks = connectors::create_connectors(&config.sinks)?;
//! let agent = Agent::from_config(&config, sinks)?;
//!
//! let coordinator = agent.start().await?;
//! let report = coordinator.run(shutdown::wait_for_shutdown_signal()).await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use agent::{Agent, AgentSettings};
pub use bus::{BusBuilder, LineBus, OverflowPolicy};
pub use config::Config;
pub use connectors::{Connector, Sink};
pub use error::{Error, Result};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use types::*;

// Public modules
pub mod agent;
pub mod bus;
pub mod config;
pub mod connectors;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod pattern;
pub mod shutdown;
pub mod tail;
pub mod types;
