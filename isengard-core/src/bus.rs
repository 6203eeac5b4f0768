//! Line bus for fanning lines out to sinks.
//!
//! The bus has two phases, enforced by its types:
//!
//! - [`BusBuilder::subscribe`] registers one channel per sink during setup;
//! - [`BusBuilder::build`] freezes the subscriber list into a [`LineBus`],
//!   which can be cloned into every Tail Source but never mutated.
//!
//! [`LineBus::publish`] hands the same `Arc<LogLine>` to every subscriber in
//! registration order. With the default [`OverflowPolicy::Block`] each send
//! waits until the subscriber accepts the line, so one slow sink holds back
//! every later subscriber and, through the tails, the whole pipeline.
//!
//! The channels close once the last `LineBus` clone is dropped, which is how
//! Dispatch Loops learn that no more lines will arrive.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::types::LogLine;

/// Receiving end handed to a Dispatch Loop.
pub type LineReceiver = mpsc::Receiver<Arc<LogLine>>;

/// What the bus does when a subscriber's channel is full.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait until the subscriber accepts the line
    #[default]
    Block,
    /// Drop the line for this subscriber only and move on
    Drop,
}

/// One registered listener.
#[derive(Debug)]
struct Listener {
    name: String,
    tx: mpsc::Sender<Arc<LogLine>>,
    overflow: OverflowPolicy,
}

/// Setup-phase handle: registers subscribers, then builds the bus.
#[derive(Debug, Default)]
pub struct BusBuilder {
    listeners: Vec<Listener>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its receiving end.
    ///
    /// `capacity` is clamped to at least 1.
    pub fn subscribe(
        &mut self,
        name: impl Into<String>,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> LineReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.listeners.push(Listener {
            name: name.into(),
            tx,
            overflow,
        });
        rx
    }

    /// Freeze the subscriber list.
    pub fn build(self) -> LineBus {
        LineBus {
            listeners: self.listeners.into(),
        }
    }
}

/// Immutable, cloneable publisher.
#[derive(Debug, Clone)]
pub struct LineBus {
    listeners: Arc<[Listener]>,
}

/// Outcome of a single publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers that accepted the line
    pub delivered: usize,
    /// Subscribers that skipped it because their buffer was full
    pub dropped: usize,
    /// Subscribers whose receiver is gone
    pub closed: usize,
}

impl LineBus {
    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Send `line` to every subscriber, in registration order.
    pub async fn publish(&self, line: Arc<LogLine>) -> Delivery {
        let mut delivery = Delivery::default();

        for listener in self.listeners.iter() {
            match listener.overflow {
                OverflowPolicy::Block => match listener.tx.send(Arc::clone(&line)).await {
                    Ok(()) => delivery.delivered += 1,
                    Err(_) => {
                        delivery.closed += 1;
                        tracing::debug!(sink = %listener.name, "Subscriber channel closed, line not delivered");
                    }
                },
                OverflowPolicy::Drop => match listener.tx.try_send(Arc::clone(&line)) {
                    Ok(()) => delivery.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        delivery.dropped += 1;
                        tracing::warn!(
                            sink = %listener.name,
                            source = %line.source.display(),
                            "Subscriber buffer full, dropping line"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        delivery.closed += 1;
                        tracing::debug!(sink = %listener.name, "Subscriber channel closed, line not delivered");
                    }
                },
            }
        }

        delivery
    }
}
