//! `NotificationGateway` that POSTs each payload as JSON to a per-channel URL.
//!
//! The receiving service is responsible for turning the payload into an
//! actual SMS, email or location share. Any non-2xx response is a failure
//! and goes through the coordinator's retry policy.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::{Ack, NotificationGateway};
use crate::dispatch::payload::AlertPayload;
use crate::error::{HavenError, Result};
use crate::ipc::events::Channel;

/// Response header read into `Ack::reference` when present.
const REFERENCE_HEADER: &str = "x-request-id";

#[derive(Default)]
pub struct WebhookGateway {
    client: reqwest::Client,
    endpoints: HashMap<Channel, String>,
}

impl WebhookGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, channel: Channel, url: impl Into<String>) -> Self {
        self.endpoints.insert(channel, url.into());
        self
    }

    pub fn endpoint(&self, channel: Channel) -> Option<&str> {
        self.endpoints.get(&channel).map(String::as_str)
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    async fn send(&self, channel: Channel, payload: &AlertPayload) -> Result<Ack> {
        let url = self
            .endpoint(channel)
            .ok_or_else(|| HavenError::Gateway(format!("no webhook configured for {channel}")))?;

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| HavenError::Gateway(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HavenError::Gateway(format!("{channel} webhook returned HTTP {status}")));
        }
        let reference = response
            .headers()
            .get(REFERENCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(%channel, ?reference, "webhook accepted payload");
        Ok(Ack { channel, reference })
    }
}
