//! Error tracker sink (`type = "rollbar"`)
//!
//! Posts one Rollbar item per line. The item's level comes from the line's
//! structured `level` field when the pattern extracted one, otherwise
//! `error`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;

use super::Sink;
use crate::config::RollbarSinkConfig;
use crate::error::{Error, Result};
use crate::types::LogLine;

const ACCESS_TOKEN_HEADER: &str = "X-Rollbar-Access-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LEVEL: &str = "error";

#[derive(Debug, Serialize)]
struct Item<'a> {
    data: ItemData<'a>,
}

#[derive(Debug, Serialize)]
struct ItemData<'a> {
    environment: &'a str,
    level: String,
    timestamp: i64,
    platform: &'static str,
    body: ItemBody<'a>,
    custom: Custom<'a>,
}

#[derive(Debug, Serialize)]
struct ItemBody<'a> {
    message: Message<'a>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct Custom<'a> {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a std::collections::BTreeMap<String, String>>,
}

/// Rollbar severity for a line.
fn item_level(line: &LogLine) -> String {
    match line.level().map(str::to_ascii_lowercase).as_deref() {
        Some("debug") => "debug".to_string(),
        Some("info") => "info".to_string(),
        Some("warn") | Some("warning") => "warning".to_string(),
        Some("critical") => "critical".to_string(),
        _ => DEFAULT_LEVEL.to_string(),
    }
}

/// JSON body for one line.
fn item_payload<'a>(line: &'a LogLine, environment: &'a str) -> Item<'a> {
    Item {
        data: ItemData {
            environment,
            level: item_level(line),
            timestamp: chrono::Utc::now().timestamp(),
            platform: "server",
            body: ItemBody {
                message: Message { body: &line.text },
            },
            custom: Custom {
                source: line.source.display().to_string(),
                fields: line.fields.as_ref(),
            },
        },
    }
}

/// Sink posting lines to a Rollbar-compatible endpoint.
#[derive(Debug)]
pub struct ErrorTrackerSink {
    name: String,
    url: String,
    environment: String,
    http_client: reqwest::Client,
}

impl ErrorTrackerSink {
    pub fn new(name: &str, config: &RollbarSinkConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &config.access_token {
            headers.insert(
                ACCESS_TOKEN_HEADER,
                HeaderValue::from_str(token).map_err(|e| {
                    Error::Config(format!("sinks.{}: invalid access_token: {}", name, e))
                })?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            url: config.url.clone(),
            environment: config.environment.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl Sink for ErrorTrackerSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, line: &LogLine) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&item_payload(line, &self.environment))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Sink {
                sink: self.name.clone(),
                message: format!("API error ({}): {}", status, error_text),
            })
        }
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(sink = %self.name, "Closing error tracker sink");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    fn line(text: &str) -> LogLine {
        LogLine::new(Arc::from(Path::new("/var/log/app.log")), text)
    }

    fn payload(line: &LogLine, environment: &str) -> serde_json::Value {
        serde_json::to_value(item_payload(line, environment)).unwrap()
    }

    fn config(url: &str) -> RollbarSinkConfig {
        RollbarSinkConfig {
            url: url.to_string(),
            access_token: Some("secret".to_string()),
            environment: "staging".to_string(),
        }
    }

    #[test]
    fn test_payload_carries_raw_text() {
        let payload = payload(&line("disk full"), "staging");
        assert_eq!(payload["data"]["body"]["message"]["body"], "disk full");
        assert_eq!(payload["data"]["environment"], "staging");
        assert_eq!(payload["data"]["level"], "error");
        assert_eq!(payload["data"]["custom"]["source"], "/var/log/app.log");
        assert!(payload["data"]["custom"].get("fields").is_none());
    }

    #[test]
    fn test_level_follows_structured_field() {
        let mut fields = BTreeMap::new();
        fields.insert("level".to_string(), "WARNING".to_string());
        let payload = payload(&line("slow").with_fields(fields), "prod");
        assert_eq!(payload["data"]["level"], "warning");
        assert_eq!(payload["data"]["custom"]["fields"]["level"], "WARNING");
    }

    #[test]
    fn test_invalid_token_is_config_error() {
        let mut cfg = config("http://127.0.0.1:9/");
        cfg.access_token = Some("bad\ntoken".to_string());
        let err = ErrorTrackerSink::new("errors", &cfg).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_send() {
        // Port 9 (discard) is not expected to accept connections.
        let sink = ErrorTrackerSink::new("errors", &config("http://127.0.0.1:9/item/")).unwrap();
        assert!(sink.send(&line("boom")).await.is_err());
        sink.close().await.unwrap();
    }
}
