// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-side agent relaying VM lifecycle signals and kernel OOM kills to a
//! webhook.
//!
//! Three long-lived tasks share one bounded queue and one cancellation token:
//!
//! - [`shutdown::ShutdownWatcher`] turns SIGINT/SIGTERM into a
//!   `machine_stopped` event and starts the shutdown.
//! - [`oom::OomDetector`] scans the kernel log on an interval and reports each
//!   distinct OOM kill line once.
//! - [`delivery::WebhookDelivery`] POSTs every queued event to the webhook.
//!
//! [`agent::Agent`] wires them together and enqueues `machine_started` first.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod oom;
pub mod shutdown;

pub use agent::Agent;
pub use config::{AgentConfig, Identity};
pub use delivery::DeliveryStats;
pub use error::{AgentError, ConfigError};
