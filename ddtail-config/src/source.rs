// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::ConfigError;
use serde::{Deserialize, Serialize};

pub const MAX_EXACTLY_ONCE_CONCURRENCY: u32 = 32;

/// One log source: a set of files matched by a glob, how to split, merge and
/// parse them, and where the records go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Glob over absolute file paths, e.g. `/var/log/app/**/*.log`.
    pub path_glob: String,
    /// Directory recursion bound applied when walking under the glob root.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Character encoding label understood by WHATWG encoding (e.g. "utf-8",
    /// "gbk"). Non-UTF-8 sources are transcoded before splitting.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Line terminator byte. The splitter treats the whole buffer as one
    /// logical line when the parser is JSON-object mode.
    #[serde(default = "default_terminator")]
    pub line_terminator: char,
    #[serde(default)]
    pub multiline: MultilineConfig,
    /// What happens to lines the multiline state machine cannot attach.
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
    /// Force-emit an open multiline record after this long without a closing
    /// line, once the file is otherwise idle.
    #[serde(default = "default_multiline_timeout_ms")]
    pub multiline_timeout_ms: u64,
    #[serde(default)]
    pub parser: ParserConfig,
    /// Name of the destination records are shipped to.
    pub destination: String,
    /// Exactly-once send concurrency K. 0 disables exactly-once.
    #[serde(default)]
    pub exactly_once_concurrency: u32,
    /// Extra `key:value` tags attached to every record from this source.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    /// Files whose mtime is within this many seconds at discovery are tailed
    /// from offset 0; older files start at EOF.
    #[serde(default = "default_tail_since_secs")]
    pub tail_since_secs: u64,
    /// Records whose parsed timestamp is older than this are dropped after
    /// parsing. Note this composes with `tail_since_secs`: a file may be
    /// tailed from 0 and still contribute no records.
    #[serde(default = "default_discard_old_secs")]
    pub discard_old_secs: u64,
    /// Number of leading bytes hashed into the file signature.
    #[serde(default = "default_signature_bytes")]
    pub signature_bytes: u32,
    /// Fixed offset applied to parsed timestamps, for sources whose logs are
    /// written in a zone other than the host's.
    #[serde(default)]
    pub tz_offset_secs: Option<i32>,
    /// Batch partition key; defaults to the source name.
    #[serde(default)]
    pub partition: Option<String>,
    /// Hand records to the extended processor host instead of the native
    /// path, when a host is installed.
    #[serde(default)]
    pub forward_extended: bool,
}

fn default_max_depth() -> usize {
    10
}
fn default_encoding() -> String {
    "utf-8".to_owned()
}
fn default_terminator() -> char {
    '\n'
}
fn default_multiline_timeout_ms() -> u64 {
    3000
}
fn default_tail_since_secs() -> u64 {
    120
}
fn default_discard_old_secs() -> u64 {
    43200
}
fn default_signature_bytes() -> u32 {
    1024
}

impl SourceConfig {
    pub fn partition(&self) -> &str {
        self.partition.as_deref().unwrap_or(&self.name)
    }

    pub fn exactly_once(&self) -> bool {
        self.exactly_once_concurrency > 0
    }

    /// Validate everything that can fail later at reader-creation time:
    /// regex and glob syntax, the encoding label, K bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.contains(':') {
            // Source names are embedded in checkpoint keys, colon-delimited.
            return Err(ConfigError::Invalid {
                source_name: self.name.clone(),
                message: "source name must be non-empty and contain no colon".to_owned(),
            });
        }
        let check_regex = |pattern: &str| -> Result<(), ConfigError> {
            regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|err| ConfigError::Regex {
                    source_name: self.name.clone(),
                    pattern: pattern.to_owned(),
                    err,
                })
        };
        match &self.multiline {
            MultilineConfig::Single | MultilineConfig::Flag => {}
            MultilineConfig::Start { start } => check_regex(start)?,
            MultilineConfig::StartContinue { start, cont } => {
                check_regex(start)?;
                check_regex(cont)?;
            }
            MultilineConfig::StartEnd { start, end } => {
                check_regex(start)?;
                check_regex(end)?;
            }
            MultilineConfig::ContinueEnd { cont, end } => {
                check_regex(cont)?;
                check_regex(end)?;
            }
        }
        if let ParserConfig::Regex { pattern, .. } = &self.parser {
            check_regex(pattern)?;
        }
        glob::Pattern::new(&self.path_glob).map_err(|err| ConfigError::Glob {
            source_name: self.name.clone(),
            pattern: self.path_glob.clone(),
            err,
        })?;
        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            return Err(ConfigError::Encoding {
                source_name: self.name.clone(),
                label: self.encoding.clone(),
            });
        }
        if self.exactly_once_concurrency > MAX_EXACTLY_ONCE_CONCURRENCY {
            return Err(ConfigError::ExactlyOnceConcurrency {
                source_name: self.name.clone(),
                k: self.exactly_once_concurrency,
                max: MAX_EXACTLY_ONCE_CONCURRENCY,
            });
        }
        if !self.line_terminator.is_ascii() {
            return Err(ConfigError::Invalid {
                source_name: self.name.clone(),
                message: format!(
                    "line terminator {:?} is not a single byte",
                    self.line_terminator
                ),
            });
        }
        if let ParserConfig::Delimiter { keys, .. } = &self.parser {
            if keys.is_empty() {
                return Err(ConfigError::Invalid {
                    source_name: self.name.clone(),
                    message: "delimiter parser requires a non-empty key list".to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// How logical lines are merged into records. See the assembler for the
/// exact state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MultilineConfig {
    /// Every line is one record.
    #[default]
    Single,
    /// A record starts at a line matching `start` and runs to the next match.
    Start { start: String },
    /// A record starts at `start`; lines matching `cont` are appended.
    StartContinue {
        start: String,
        #[serde(rename = "continue")]
        cont: String,
    },
    /// A record starts at `start` and closes inclusively at `end`.
    StartEnd { start: String, end: String },
    /// A record is a maximal run of `cont` lines closed by an `end` line.
    ContinueEnd {
        #[serde(rename = "continue")]
        cont: String,
        end: String,
    },
    /// Lines carry a runtime partial flag (container log protocol); partial
    /// lines concatenate into the next full line.
    Flag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Orphan lines become individual records with their original time.
    #[default]
    Keep,
    /// Orphan lines are dropped and counted.
    Discard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Keep the record as a raw field on parser mismatch.
    #[default]
    Keep,
    /// Drop the record on parser mismatch.
    Drop,
}

/// How a merged record is decomposed into fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParserConfig {
    /// The whole record becomes one field under `key`. When `time_format` is
    /// set, a leading time expression is parsed off the record; otherwise the
    /// wall clock is used.
    Raw {
        #[serde(default = "default_raw_key")]
        key: String,
        #[serde(default)]
        time_format: Option<String>,
    },
    /// Named capture groups become fields; `time_key` names the group parsed
    /// with the strftime-style `time_format`, optionally refined by a
    /// fractional-seconds group named by `precise_key`.
    Regex {
        pattern: String,
        #[serde(default)]
        time_key: Option<String>,
        #[serde(default)]
        time_format: Option<String>,
        #[serde(default)]
        precise_key: Option<String>,
        #[serde(default)]
        on_mismatch: MismatchPolicy,
    },
    /// Positional split on a one-character delimiter with optional quoting.
    Delimiter {
        delimiter: char,
        #[serde(default)]
        quote: Option<char>,
        keys: Vec<String>,
        #[serde(default)]
        time_key: Option<String>,
        #[serde(default)]
        time_format: Option<String>,
    },
    /// The record is a single JSON object; top-level scalars become fields,
    /// nested values are rendered back to strings.
    Json {
        #[serde(default)]
        time_key: Option<String>,
        #[serde(default)]
        time_format: Option<String>,
    },
    /// Operator format: `[ts] [LEVEL] [thread] [file:line]\tk:v\tk:v...`.
    Bracketed,
}

fn default_raw_key() -> String {
    "content".to_owned()
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig::Raw {
            key: default_raw_key(),
            time_format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_source(json: serde_json::Value) -> SourceConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = base_source(serde_json::json!({
            "name": "app",
            "path_glob": "/var/log/app/*.log",
            "destination": "main",
        }));
        assert_eq!(s.line_terminator, '\n');
        assert_eq!(s.signature_bytes, 1024);
        assert_eq!(s.discard_old_secs, 43200);
        assert_eq!(s.tail_since_secs, 120);
        assert!(matches!(s.multiline, MultilineConfig::Single));
        assert!(matches!(s.parser, ParserConfig::Raw { .. }));
        assert_eq!(s.partition(), "app");
        assert!(!s.exactly_once());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_bad_regex_rejected() {
        let s = base_source(serde_json::json!({
            "name": "app",
            "path_glob": "/var/log/*.log",
            "destination": "main",
            "multiline": { "mode": "start", "start": "^([" },
        }));
        assert!(matches!(s.validate(), Err(ConfigError::Regex { .. })));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let s = base_source(serde_json::json!({
            "name": "app",
            "path_glob": "/var/log/*.log",
            "destination": "main",
            "encoding": "not-a-charset",
        }));
        assert!(matches!(s.validate(), Err(ConfigError::Encoding { .. })));
    }

    #[test]
    fn test_exactly_once_bounds() {
        let s = base_source(serde_json::json!({
            "name": "app",
            "path_glob": "/var/log/*.log",
            "destination": "main",
            "exactly_once_concurrency": 64,
        }));
        assert!(matches!(
            s.validate(),
            Err(ConfigError::ExactlyOnceConcurrency { k: 64, .. })
        ));
    }

    #[test]
    fn test_multiline_modes_deserialize() {
        let s = base_source(serde_json::json!({
            "name": "app",
            "path_glob": "/var/log/*.log",
            "destination": "main",
            "multiline": { "mode": "start_continue", "start": "^E: ", "continue": "^\\s" },
        }));
        match &s.multiline {
            MultilineConfig::StartContinue { start, cont } => {
                assert_eq!(start, "^E: ");
                assert_eq!(cont, "^\\s");
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
