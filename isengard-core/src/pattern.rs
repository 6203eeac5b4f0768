//! Optional line structuring
//!
//! A [`LinePattern`] is compiled from a template in which every `{name}`
//! placeholder that has a definition is replaced by `(?P<name>definition)`.
//! Placeholders without a definition are left untouched, so regular
//! expression repetitions such as `\d{4}` keep working.
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use isengard_core::pattern::{LinePattern, MismatchPolicy};
//!
//! let mut defs = BTreeMap::new();
//! defs.insert("level".to_string(), "[A-Z]+".to_string());
//! defs.insert("message".to_string(), ".*".to_string());
//!
//! let pattern = LinePattern::compile(r"^\[{level}\] {message}$", &defs, MismatchPolicy::Pass).unwrap();
//! let fields = pattern.extract("[INFO] ready").unwrap();
//! assert_eq!(fields["level"], "INFO");
//! assert_eq!(fields["message"], "ready");
//! ```

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::LogLine;

/// What happens to a line the pattern does not match.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Forward the raw line without fields
    #[default]
    Pass,
    /// Discard the line
    Drop,
}

/// Compiled line pattern.
#[derive(Debug, Clone)]
pub struct LinePattern {
    regex: Regex,
    on_mismatch: MismatchPolicy,
}

impl LinePattern {
    /// Interpolate `definitions` into `template` and compile the result.
    pub fn compile(
        template: &str,
        definitions: &BTreeMap<String, String>,
        on_mismatch: MismatchPolicy,
    ) -> Result<Self> {
        let expanded = interpolate(template, definitions);
        let regex = Regex::new(&expanded)
            .map_err(|e| Error::Config(format!("invalid line pattern: {}", e)))?;

        tracing::debug!(pattern = %expanded, "Compiled line pattern");

        Ok(Self { regex, on_mismatch })
    }

    pub fn on_mismatch(&self) -> MismatchPolicy {
        self.on_mismatch
    }

    /// The fully interpolated expression.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Extract named groups from `text`, or `None` if it does not match.
    ///
    /// Groups that did not participate in the match are omitted.
    pub fn extract(&self, text: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(text)?;
        let fields = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                caps.name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        Some(fields)
    }

    /// Structure a line according to this pattern.
    ///
    /// Returns `None` when the line should be dropped.
    pub fn apply(&self, line: LogLine) -> Option<LogLine> {
        match self.extract(&line.text) {
            Some(fields) => Some(line.with_fields(fields)),
            None => match self.on_mismatch {
                MismatchPolicy::Pass => Some(line),
                MismatchPolicy::Drop => None,
            },
        }
    }
}

fn interpolate(template: &str, definitions: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after
            .find('}')
            .and_then(|close| definitions.get_key_value(&after[..close]).map(|kv| (close, kv)))
        {
            Some((close, (name, def))) => {
                out.push_str(&format!("(?P<{}>{})", name, def));
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    const LINE: &str = "[2020-10-07 20:56:47.375586 UTC][INFO][009] Log message";

    fn definitions() -> BTreeMap<String, String> {
        let mut defs = BTreeMap::new();
        defs.insert("timestamp".to_string(), r"[^\]]+".to_string());
        defs.insert("level".to_string(), "[A-Z]+".to_string());
        defs.insert("thread".to_string(), r"\d{3}".to_string());
        defs.insert("message".to_string(), ".*".to_string());
        defs
    }

    fn pattern(policy: MismatchPolicy) -> LinePattern {
        LinePattern::compile(
            r"^\[{timestamp}\]\[{level}\]\[{thread}\] {message}$",
            &definitions(),
            policy,
        )
        .unwrap()
    }

    fn line(text: &str) -> LogLine {
        LogLine::new(Arc::from(Path::new("app.log")), text)
    }

    #[test]
    fn test_extracts_named_fields() {
        let fields = pattern(MismatchPolicy::Pass).extract(LINE).unwrap();
        assert_eq!(fields["timestamp"], "2020-10-07 20:56:47.375586 UTC");
        assert_eq!(fields["level"], "INFO");
        assert_eq!(fields["thread"], "009");
        assert_eq!(fields["message"], "Log message");
    }

    #[test]
    fn test_undefined_placeholders_are_kept() {
        let p = LinePattern::compile(r"^\d{2}-{level}$", &definitions(), MismatchPolicy::Pass)
            .unwrap();
        assert_eq!(p.as_str(), r"^\d{2}-(?P<level>[A-Z]+)$");
        assert!(p.extract("42-WARN").is_some());
    }

    #[test]
    fn test_mismatch_pass_keeps_raw_line() {
        let out = pattern(MismatchPolicy::Pass).apply(line("garbage")).unwrap();
        assert_eq!(out.text, "garbage");
        assert!(out.fields.is_none());
    }

    #[test]
    fn test_mismatch_drop_discards_line() {
        assert!(pattern(MismatchPolicy::Drop).apply(line("garbage")).is_none());
    }

    #[test]
    fn test_match_attaches_fields() {
        let out = pattern(MismatchPolicy::Drop).apply(line(LINE)).unwrap();
        assert_eq!(out.level(), Some("INFO"));
    }

    #[test]
    fn test_invalid_expression_is_config_error() {
        let err = LinePattern::compile("({level}", &definitions(), MismatchPolicy::Pass)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
