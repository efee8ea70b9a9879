// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Webhook delivery.
//!
//! The delivery loop is the only consumer of the event queue and the only
//! component that talks to the network. Events are POSTed one at a time in
//! queue order. Failures are logged and the event is dropped: there is no
//! retry and the response status is never acted upon.

use crate::event::EncodedEvent;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Counters reported when the delivery loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Requests that got any HTTP response
    pub delivered: usize,
    /// Requests that could not be built or sent
    pub failed: usize,
    /// Events whose encoding failed, never sent
    pub dropped_empty: usize,
}

/// Build the client shared by every delivery.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
    events: mpsc::Receiver<EncodedEvent>,
    cancel_token: CancellationToken,
    stats: DeliveryStats,
}

impl WebhookDelivery {
    pub fn new(
        client: reqwest::Client,
        url: String,
        events: mpsc::Receiver<EncodedEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        WebhookDelivery {
            client,
            url,
            events,
            cancel_token,
            stats: DeliveryStats::default(),
        }
    }

    /// Deliver queued events until cancellation.
    ///
    /// The select is biased toward the queue: after the token fires the loop
    /// keeps attempting queued events until the queue is empty, not just the
    /// next one it happens to pick up. This is deliberate, so that the
    /// `machine_stopped` event enqueued right before cancellation is always
    /// attempted. Cancellation never interrupts a request in flight. Events
    /// enqueued after the loop returns are lost.
    pub async fn run(mut self) -> DeliveryStats {
        debug!(url = %self.url, "Delivery loop started");
        loop {
            tokio::select! {
                biased;
                maybe_event = self.events.recv() => match maybe_event {
                    Some(event) => self.deliver(event).await,
                    None => {
                        debug!("Event queue closed, stopping delivery loop");
                        break;
                    }
                },
                () = self.cancel_token.cancelled() => {
                    debug!("Delivery loop stopped");
                    break;
                }
            }
        }
        self.stats
    }

    /// POST a single event to the webhook.
    pub async fn deliver(&mut self, event: EncodedEvent) {
        let kind = event.kind();
        if event.is_empty() {
            debug!(event_type = %kind, "Dropping event with empty payload");
            self.stats.dropped_empty += 1;
            return;
        }

        let request = match self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(event.into_body())
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                error!(event_type = %kind, "failed to build request: {e}");
                self.stats.failed += 1;
                return;
            }
        };

        match self.client.execute(request).await {
            Ok(response) => {
                // any status counts as delivered, the body is discarded unread
                debug!(event_type = %kind, status = %response.status(), "Delivered event");
                self.stats.delivered += 1;
            }
            Err(e) => {
                error!(event_type = %kind, "failed to deliver event: {e}");
                self.stats.failed += 1;
            }
        }
    }
}
