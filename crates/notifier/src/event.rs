// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle events and their JSON wire encoding.
//!
//! Every event is serialized at the moment it is emitted and travels through
//! the queue as an [`EncodedEvent`]. The body is never touched again after
//! encoding; an empty body marks an event whose serialization failed.

use crate::config::Identity;
use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// Kind of lifecycle event, serialized as its snake_case tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MachineStarted,
    MachineStopped,
    Oom,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MachineStarted => "machine_started",
            Self::MachineStopped => "machine_stopped",
            Self::Oom => "oom",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct EventData<'a> {
    pub machine_id: &'a str,
    pub app_name: &'a str,
    pub at: i64,
}

#[derive(Debug, Serialize)]
pub struct Event<'a> {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData<'a>,
}

/// A serialized event ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    kind: EventKind,
    body: Vec<u8>,
}

impl EncodedEvent {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// True when encoding failed; such events must never reach the network.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
impl EncodedEvent {
    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn empty(kind: EventKind) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }
}

/// Encode an event of the given kind for this machine, stamped with the current time.
pub fn encode(kind: EventKind, identity: &Identity) -> EncodedEvent {
    let event = Event {
        kind,
        data: EventData {
            machine_id: &identity.machine_id,
            app_name: &identity.app_name,
            at: unix_now(),
        },
    };
    serialize(kind, &event)
}

fn serialize<T: Serialize>(kind: EventKind, value: &T) -> EncodedEvent {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!(event_type = %kind, "failed to marshal {kind} event: {e}");
            Vec::new()
        }
    };
    EncodedEvent { kind, body }
}

fn unix_now() -> i64 {
    unix_seconds(SystemTime::now())
}

fn unix_seconds(now: SystemTime) -> i64 {
    match now.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs().try_into().unwrap_or(i64::MAX),
        Err(e) => {
            warn!("system clock is before the Unix epoch, stamping event with 0: {e}");
            0
        }
    }
}
