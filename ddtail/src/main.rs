// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use ddtail::lifecycle::Agent;
use ddtail::AgentError;
use ddtail_config::AgentConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_ENV_PREP: u8 = 3;
const EXIT_BAD_CONFIG: u8 = 4;
const EXIT_SIGNAL_INSTALL: u8 = 5;

/// Host-resident log collection agent: tails files, assembles records, and
/// ships compressed batches to a remote intake.
#[derive(Debug, Parser)]
#[command(name = "ddtail", version)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, env = "AGENT_CONFIG_PATH", default_value = "/etc/ddtail/agent.json")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match AgentConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "invalid configuration");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            return ExitCode::from(EXIT_ENV_PREP);
        }
    };

    let agent = match Agent::new(config, Some(cli.config.clone()), None) {
        Ok(agent) => agent,
        Err(AgentError::EnvPrep(message)) => {
            error!(message, "environment preparation failed");
            return ExitCode::from(EXIT_ENV_PREP);
        }
        Err(e) => {
            error!(error = %e, "agent construction failed");
            return ExitCode::from(EXIT_ENV_PREP);
        }
    };

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let reload = Arc::new(Notify::new());

        let (mut sigterm, mut sigint, mut sighup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(t), Ok(i), Ok(h)) => (t, i, h),
            _ => {
                error!("signal handler installation failed");
                return ExitCode::from(EXIT_SIGNAL_INSTALL);
            }
        };
        {
            let shutdown = shutdown.clone();
            let reload = Arc::clone(&reload);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            info!("SIGTERM received");
                            shutdown.cancel();
                        }
                        _ = sigint.recv() => {
                            info!("SIGINT received");
                            shutdown.cancel();
                        }
                        _ = sighup.recv() => {
                            info!("SIGHUP received");
                            reload.notify_one();
                        }
                    }
                }
            });
        }

        match agent.run(shutdown, reload).await {
            Ok(()) => {
                info!("agent exited cleanly");
                ExitCode::from(EXIT_OK)
            }
            Err(e) => {
                error!(error = %e, "agent failed");
                ExitCode::from(EXIT_ENV_PREP)
            }
        }
    })
}
