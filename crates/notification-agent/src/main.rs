// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use notifier::config::{DEFAULT_KMSG_PATH, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SCAN_INTERVAL};
use notifier::{Agent, AgentConfig, Identity};

const LOG_LEVEL_ENV: &str = "NOTIFIER_LOG_LEVEL";

/// Monitors VM state and sends events to the specified webhook
#[derive(Debug, Parser)]
#[command(name = "notification-agent", version, about)]
struct Cli {
    /// Webhook url
    #[arg(long)]
    webhook: String,

    /// Kernel log to scan for OOM kills
    #[arg(long, default_value = DEFAULT_KMSG_PATH)]
    kmsg_path: PathBuf,

    /// Seconds between two kernel log scans
    #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL.as_secs())]
    scan_interval: u64,

    /// Seconds before a webhook request is abandoned
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    timeout: u64,
}

impl Cli {
    fn into_config(self, identity: Identity) -> AgentConfig {
        let mut config = AgentConfig::new(self.webhook, identity);
        config.kmsg_path = self.kmsg_path;
        config.scan_interval = Duration::from_secs(self.scan_interval);
        config.request_timeout = Duration::from_secs(self.timeout);
        config
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    // exits with a usage error before anything else starts
    let cli = Cli::parse();

    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,hyper_util=off,rustls=off,{}", log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level {log_level:?}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    let config = cli.into_config(Identity::from_env());
    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Error creating notification agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    match agent.run().await {
        Ok(stats) => {
            info!(
                "notification agent is done: {} delivered, {} failed, {} dropped",
                stats.delivered, stats.failed, stats.dropped_empty
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("notification agent failed: {e}");
            ExitCode::FAILURE
        }
    }
}
