//! Object store sink (`type = "s3"`)
//!
//! Writes one object per line. Keys look like
//! `<key_prefix>/2020-10-07T20-56-47-<uuid>` so lines arriving in the same
//! second still land in distinct objects.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use uuid::Uuid;

use super::Sink;
use crate::config::S3SinkConfig;
use crate::error::Result;
use crate::types::LogLine;

/// Build the object key for a line received at `at`.
pub fn object_key(prefix: &str, at: DateTime<Utc>, id: Uuid) -> String {
    format!(
        "{}/{}-{}",
        prefix.trim_end_matches('/'),
        at.format("%Y-%m-%dT%H-%M-%S"),
        id
    )
}

/// Sink writing each line as its own object.
#[derive(Debug)]
pub struct ObjectStoreSink {
    name: String,
    key_prefix: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreSink {
    /// S3-compatible store at the configured endpoint, path-style addressing.
    ///
    /// Credentials come from the standard `AWS_*` environment variables.
    pub fn new(name: &str, config: &S3SinkConfig) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_endpoint(&config.endpoint)
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(config.endpoint.starts_with("http://"))
            .build()?;

        tracing::debug!(
            sink = name,
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            region = %config.region,
            "Created S3 client"
        );

        Ok(Self::with_store(name, &config.key_prefix, Arc::new(store)))
    }

    /// Sink over an arbitrary store.
    pub fn with_store(name: &str, key_prefix: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.to_string(),
            key_prefix: key_prefix.to_string(),
            store,
        }
    }
}

#[async_trait]
impl Sink for ObjectStoreSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, line: &LogLine) -> Result<()> {
        let key = object_key(&self.key_prefix, Utc::now(), Uuid::new_v4());
        let location = ObjectPath::from(key.as_str());

        self.store
            .put(&location, PutPayload::from(line.text.clone()))
            .await?;

        tracing::trace!(sink = %self.name, key = %key, "Stored line");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(sink = %self.name, "Closing object store sink");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use std::path::Path;

    #[test]
    fn test_object_key_format() {
        let at = Utc.with_ymd_and_hms(2020, 10, 7, 20, 56, 47).unwrap();
        let id = Uuid::nil();
        assert_eq!(
            object_key("web/", at, id),
            "web/2020-10-07T20-56-47-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_same_second_keys_differ() {
        let at = Utc::now();
        assert_ne!(
            object_key("p", at, Uuid::new_v4()),
            object_key("p", at, Uuid::new_v4())
        );
    }

    #[tokio::test]
    async fn test_identical_lines_become_distinct_objects() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::with_store("archive", "logs", store.clone());
        let line = LogLine::new(Arc::from(Path::new("app.log")), "same text");

        sink.send(&line).await.unwrap();
        sink.send(&line).await.unwrap();
        sink.close().await.unwrap();

        let objects: Vec<_> = store
            .list(Some(&ObjectPath::from("logs")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert_ne!(objects[0].location, objects[1].location);

        let body = store.get(&objects[0].location).await.unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"same text");
    }
}
