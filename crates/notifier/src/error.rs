// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that make the agent configuration unusable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("webhook url is required")]
    MissingWebhook,

    #[error("scan interval must be greater than 0")]
    InvalidScanInterval,

    #[error("request timeout must be greater than 0")]
    InvalidTimeout,
}

/// Errors that stop the agent before or after its tasks run
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Failed to install termination signal listener: {0}")]
    Signal(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
