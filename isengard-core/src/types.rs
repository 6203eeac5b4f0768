//! Core domain types for isengard
//!
//! A [`LogLine`] is the unit that flows through the pipeline: a Tail Source
//! emits it, the line pattern optionally structures it, the Line Bus shares it
//! by reference with every subscriber, and each Dispatch Loop hands it to its
//! sink.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// One line read from a tailed file.
///
/// Immutable once emitted. Sinks receive it by reference and must treat it as
/// read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// File the line was read from
    pub source: Arc<Path>,
    /// Line text without its terminator
    pub text: String,
    /// Set when the tail failed instead of producing a line
    pub read_error: Option<String>,
    /// Named fields extracted by the line pattern, if one is configured and matched
    pub fields: Option<BTreeMap<String, String>>,
}

impl LogLine {
    /// A plain line with no structure attached.
    pub fn new(source: Arc<Path>, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            read_error: None,
            fields: None,
        }
    }

    /// Terminal event emitted when a tail hits an unrecoverable error.
    pub fn failed(source: Arc<Path>, error: impl Into<String>) -> Self {
        Self {
            source,
            text: String::new(),
            read_error: Some(error.into()),
            fields: None,
        }
    }

    /// Attach extracted fields.
    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Look up one extracted field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .as_ref()
            .and_then(|f| f.get(name))
            .map(String::as_str)
    }

    /// Severity extracted from the line, if the pattern captured a `level` group.
    pub fn level(&self) -> Option<&str> {
        self.field("level")
    }
}

/// Where a new Tail Source starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Byte zero - used for files created after the directory was first listed
    Beginning,
    /// Current end of file - used for files present before startup
    End,
}
