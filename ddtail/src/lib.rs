// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent binary's library side: the lifecycle controller that owns every
//! collaborator, the resource governor, the pipeline threads, and the
//! extended-processor seam.
//!
//! Nothing in here is a singleton. The [`lifecycle::Agent`] owns one instance
//! of each component and injects references, which is also what makes the
//! whole agent testable end-to-end in one process with a fake transport.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod extension;
pub mod governor;
pub mod input;
pub mod lifecycle;
pub mod profile;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("environment preparation failed: {0}")]
    EnvPrep(String),
    #[error(transparent)]
    Config(#[from] ddtail_config::ConfigError),
    #[error(transparent)]
    Store(#[from] ddtail_checkpoint::StoreError),
    #[error(transparent)]
    Send(#[from] ddtail_sender::SendError),
}
