// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{AgentConfig, EVENT_QUEUE_CAPACITY};
use crate::delivery::{build_client, DeliveryStats, WebhookDelivery};
use crate::error::AgentError;
use crate::event::{encode, EventKind};
use crate::oom::OomDetector;
use crate::shutdown::{ShutdownSignal, ShutdownWatcher};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Wires the shutdown watcher, the OOM detector and the delivery loop
/// around one bounded queue and one cancellation token.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    client: reqwest::Client,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let client = build_client(config.request_timeout)?;
        Ok(Agent { config, client })
    }

    /// Run until SIGINT or SIGTERM.
    ///
    /// The signal handlers are installed before anything is spawned.
    pub async fn run(self) -> Result<DeliveryStats, AgentError> {
        let mut signal = ShutdownSignal::install()?;
        self.run_with_signal(async move { signal.recv().await })
            .await
    }

    /// Run until `signal` completes and the delivery loop has stopped.
    pub async fn run_with_signal<F>(self, signal: F) -> Result<DeliveryStats, AgentError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Agent { config, client } = self;
        let AgentConfig {
            webhook,
            identity,
            kmsg_path,
            scan_interval,
            ..
        } = config;
        let identity = Arc::new(identity);
        let span = info_span!(
            "notification_agent",
            machine = %identity.machine_id,
            machine_version = %identity.machine_version,
            app_name = %identity.app_name,
            url = %webhook,
        );

        async move {
            info!("Starting notification agent");

            let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
            let cancel_token = CancellationToken::new();

            // no other producer exists yet, so this is always first in the queue
            if events_tx
                .send(encode(EventKind::MachineStarted, &identity))
                .await
                .is_err()
            {
                warn!(
                    event_type = %EventKind::MachineStarted,
                    "event queue closed, dropping event"
                );
            }

            let watcher = ShutdownWatcher::new(
                Arc::clone(&identity),
                events_tx.clone(),
                cancel_token.clone(),
            );
            let watcher_handle = tokio::spawn(watcher.run(signal).in_current_span());

            let detector = OomDetector::new(
                kmsg_path,
                scan_interval,
                Arc::clone(&identity),
                events_tx,
                cancel_token.clone(),
            );
            let detector_handle = tokio::spawn(detector.run().in_current_span());

            let stats = WebhookDelivery::new(
                client,
                webhook,
                events_rx,
                cancel_token.clone(),
            )
            .run()
            .await;

            // the delivery loop only returns once shutdown started; make it final
            cancel_token.cancel();
            detector_handle.await?;
            watcher_handle.await?;
            debug!("All tasks stopped");

            Ok(stats)
        }
        .instrument(span)
        .await
    }
}
