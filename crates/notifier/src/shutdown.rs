// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Termination signal handling.
//!
//! [`ShutdownSignal`] installs the OS handlers eagerly, before any task is
//! spawned, so a SIGTERM arriving during startup is captured instead of
//! killing the process. [`ShutdownWatcher`] turns the first signal into a
//! `machine_stopped` event and then cancels the shared token.

use crate::config::Identity;
use crate::event::{encode, EncodedEvent, EventKind};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listener for SIGINT and SIGTERM on unix, ctrl-c elsewhere.
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Completes on the first termination signal received after `install`.
    #[cfg(unix)]
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => debug!("Received SIGINT"),
            _ = self.sigterm.recv() => debug!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

pub struct ShutdownWatcher {
    identity: Arc<Identity>,
    events: mpsc::Sender<EncodedEvent>,
    cancel_token: CancellationToken,
}

impl ShutdownWatcher {
    pub fn new(
        identity: Arc<Identity>,
        events: mpsc::Sender<EncodedEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        ShutdownWatcher {
            identity,
            events,
            cancel_token,
        }
    }

    /// Wait for `signal` once, enqueue `machine_stopped`, then cancel.
    ///
    /// The event is always in the queue before the token is cancelled. The
    /// watcher fires at most once; if the token is cancelled elsewhere first it
    /// returns without emitting anything.
    pub async fn run<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => {
                debug!("Shutdown watcher stopped before any termination signal");
                return;
            }
            () = signal => {}
        }

        info!("Received termination signal, shutting down");
        let event = encode(EventKind::MachineStopped, &self.identity);
        if self.events.send(event).await.is_err() {
            warn!(
                event_type = %EventKind::MachineStopped,
                "event queue closed, dropping event"
            );
        }
        self.cancel_token.cancel();
    }
}
