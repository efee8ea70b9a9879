// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Kernel ring buffer exposed as a line-oriented character device.
pub const DEFAULT_KMSG_PATH: &str = "/dev/kmsg";
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Substring the kernel writes when the OOM killer terminates a process.
pub const OOM_MARKER: &str = "Killed process";
pub const EVENT_QUEUE_CAPACITY: usize = 5;

const MACHINE_ID_ENV: &str = "FLY_MACHINE_ID";
const MACHINE_VERSION_ENV: &str = "FLY_MACHINE_VERSION";
const APP_NAME_ENV: &str = "FLY_APP_NAME";

/// Identity of the machine this agent runs on.
///
/// Read once at startup and shared read-only by every task. Unset variables
/// become empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub machine_id: String,
    /// Only used as logging context, never sent on the wire.
    pub machine_version: String,
    pub app_name: String,
}

impl Identity {
    pub fn from_env() -> Self {
        Self {
            machine_id: env::var(MACHINE_ID_ENV).unwrap_or_default(),
            machine_version: env::var(MACHINE_VERSION_ENV).unwrap_or_default(),
            app_name: env::var(APP_NAME_ENV).unwrap_or_default(),
        }
    }
}

/// Configuration for the notification agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Destination URL for every event POST
    pub webhook: String,
    pub identity: Identity,
    /// Kernel log source, re-opened on every scan
    pub kmsg_path: PathBuf,
    /// Time between two kernel log scans
    pub scan_interval: Duration,
    /// Upper bound for a single webhook request
    pub request_timeout: Duration,
}

impl AgentConfig {
    /// Create a configuration with default scan settings for the given webhook.
    pub fn new(webhook: impl Into<String>, identity: Identity) -> Self {
        Self {
            webhook: webhook.into(),
            identity,
            kmsg_path: PathBuf::from(DEFAULT_KMSG_PATH),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook.trim().is_empty() {
            return Err(ConfigError::MissingWebhook);
        }

        if self.scan_interval.is_zero() {
            return Err(ConfigError::InvalidScanInterval);
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(())
    }
}
