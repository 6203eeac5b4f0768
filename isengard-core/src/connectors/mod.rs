//! Connector sinks
//!
//! A sink delivers lines to one remote backend. The set of backends is closed:
//!
//! | `type`    | Variant                     | Backend                    |
//! |-----------|-----------------------------|----------------------------|
//! | `s3`      | [`Connector::ObjectStore`]  | S3-compatible object store |
//! | `kafka`   | [`Connector::Broker`]       | Kafka topic                |
//! | `rollbar` | [`Connector::ErrorTracker`] | Rollbar-style item API     |
//!
//! Every sink is created once at startup by [`create_connector`] and closed
//! exactly once at shutdown. `send` never retries; a failed line is the
//! caller's to log and drop.

pub mod broker;
pub mod error_tracker;
pub mod object_store;

pub use self::broker::BrokerSink;
pub use self::error_tracker::ErrorTrackerSink;
pub use self::object_store::ObjectStoreSink;

use async_trait::async_trait;

use crate::config::{BackendConfig, SinkConfig};
use crate::error::Result;
use crate::types::LogLine;

/// Delivery contract shared by every backend.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Configured name, used in logs.
    fn name(&self) -> &str;

    /// Deliver exactly this line as one unit.
    async fn send(&self, line: &LogLine) -> Result<()>;

    /// Release the transport. Called once, after the sink's loop has drained.
    async fn close(&self) -> Result<()>;
}

/// One configured sink.
#[derive(Debug)]
pub enum Connector {
    ObjectStore(ObjectStoreSink),
    Broker(BrokerSink),
    ErrorTracker(ErrorTrackerSink),
}

impl Connector {
    /// Backend type name as written in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Connector::ObjectStore(_) => "s3",
            Connector::Broker(_) => "kafka",
            Connector::ErrorTracker(_) => "rollbar",
        }
    }
}

#[async_trait]
impl Sink for Connector {
    fn name(&self) -> &str {
        match self {
            Connector::ObjectStore(s) => s.name(),
            Connector::Broker(s) => s.name(),
            Connector::ErrorTracker(s) => s.name(),
        }
    }

    async fn send(&self, line: &LogLine) -> Result<()> {
        match self {
            Connector::ObjectStore(s) => s.send(line).await,
            Connector::Broker(s) => s.send(line).await,
            Connector::ErrorTracker(s) => s.send(line).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Connector::ObjectStore(s) => s.close().await,
            Connector::Broker(s) => s.close().await,
            Connector::ErrorTracker(s) => s.close().await,
        }
    }
}

/// Build the sink described by one validated configuration record.
pub fn create_connector(config: &SinkConfig) -> Result<Connector> {
    let connector = match &config.backend {
        BackendConfig::S3(s3) => Connector::ObjectStore(ObjectStoreSink::new(&config.name, s3)?),
        BackendConfig::Kafka(kafka) => Connector::Broker(BrokerSink::new(&config.name, kafka)?),
        BackendConfig::Rollbar(rollbar) => {
            Connector::ErrorTracker(ErrorTrackerSink::new(&config.name, rollbar)?)
        }
    };

    tracing::info!(sink = %config.name, kind = connector.kind(), "Created connector");
    Ok(connector)
}

/// Build every configured sink, in configuration order.
pub fn create_connectors(configs: &[SinkConfig]) -> Result<Vec<Connector>> {
    configs.iter().map(create_connector).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollbarSinkConfig;

    #[test]
    fn test_factory_maps_type_to_variant() {
        let config: SinkConfig = toml::from_str(
            r#"
            type = "rollbar"
            name = "errors"
            url = "http://127.0.0.1:9/item/"
            "#,
        )
        .unwrap();

        let connector = create_connector(&config).unwrap();
        assert!(matches!(connector, Connector::ErrorTracker(_)));
        assert_eq!(connector.kind(), "rollbar");
        assert_eq!(connector.name(), "errors");
    }

    #[test]
    fn test_create_connectors_keeps_order() {
        let mut configs = Vec::new();
        for name in ["first", "second"] {
            configs.push(SinkConfig {
                name: name.to_string(),
                backend: BackendConfig::Rollbar(RollbarSinkConfig {
                    url: "http://127.0.0.1:9/item/".to_string(),
                    access_token: None,
                    environment: "test".to_string(),
                }),
                levels: Vec::new(),
                buffer: 1,
                overflow: Default::default(),
                send_timeout_secs: None,
            });
        }

        let connectors = create_connectors(&configs).unwrap();
        let names: Vec<&str> = connectors.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
