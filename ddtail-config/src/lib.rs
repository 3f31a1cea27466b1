// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the ddtail agent.
//!
//! The agent is configured from a single JSON file naming log sources and
//! destinations. Loading validates each source independently; an invalid
//! source is reported and omitted rather than failing the whole file, so one
//! bad regex cannot take down collection for every other source on the host.
//!
//! A validated set of configs is published as an immutable [`Generation`].
//! Readers hold `Arc`s into the generation they were created under; a config
//! swap publishes a new generation and lets readers of the old one run to
//! completion.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod agent;
mod destination;
mod generation;
mod source;

pub use agent::{AgentConfig, GcConfig, ResourceConfig, WatchConfig};
pub use destination::DestinationConfig;
pub use generation::Generation;
pub use source::{
    MismatchPolicy, MultilineConfig, ParserConfig, SourceConfig, UnmatchedPolicy,
};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
    #[error("config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("source {source_name}: invalid regex `{pattern}`: {err}")]
    Regex {
        source_name: String,
        pattern: String,
        err: regex::Error,
    },
    #[error("source {source_name}: invalid path glob `{pattern}`: {err}")]
    Glob {
        source_name: String,
        pattern: String,
        err: glob::PatternError,
    },
    #[error("source {source_name}: unknown character encoding `{label}`")]
    Encoding { source_name: String, label: String },
    #[error("source {source_name}: references unknown destination `{destination}`")]
    UnknownDestination {
        source_name: String,
        destination: String,
    },
    #[error("source {source_name}: exactly-once concurrency {k} out of range [0, {max}]")]
    ExactlyOnceConcurrency {
        source_name: String,
        k: u32,
        max: u32,
    },
    #[error("duplicate source name `{0}`")]
    DuplicateSource(String),
    #[error("source {source_name}: {message}")]
    Invalid { source_name: String, message: String },
}
