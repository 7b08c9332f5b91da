//! HTTP clients for the consumers sitting after the engine: the downstream
//! membership aggregator and the stakeholder notification webhook.
//!
//! The membership-ready announcement is sent once per run and never retried
//! here; a non-2xx response comes back as a rejected ack for the controller
//! to log. Notifications are fire-and-forget with at-least-once semantics;
//! the caller treats delivery failure as log-worthy, not fatal.

use async_trait::async_trait;
use tracing::debug;

use groupsync_common::{
    DownstreamAck, DownstreamAggregator, JobId, MembershipReady, MessageKind, NotificationSink,
    SyncError,
};

pub struct HttpDownstream {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstream {
    /// `url` is the full membership-ready endpoint.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl DownstreamAggregator for HttpDownstream {
    async fn membership_ready(
        &self,
        notice: MembershipReady,
    ) -> Result<DownstreamAck, SyncError> {
        debug!(url = %self.url, job_id = %notice.job_id, part = notice.part_number, "announcing membership");
        let response = self
            .client
            .post(&self.url)
            .json(&notice)
            .send()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            // Body is optional; an empty 2xx counts as acceptance.
            let ack = response
                .json::<DownstreamAck>()
                .await
                .unwrap_or(DownstreamAck {
                    accepted: true,
                    message: None,
                });
            Ok(ack)
        } else {
            Ok(DownstreamAck {
                accepted: false,
                message: Some(format!("downstream returned HTTP {}", status.as_u16())),
            })
        }
    }
}

#[derive(serde::Serialize)]
struct NotificationBody<'a> {
    message_type: MessageKind,
    job_id: JobId,
    details: &'a str,
}

pub struct WebhookNotificationSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn send(
        &self,
        message: MessageKind,
        job_id: JobId,
        details: &str,
    ) -> Result<(), SyncError> {
        let body = NotificationBody {
            message_type: message,
            job_id,
            details,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::UpstreamHttp {
                status: response.status().as_u16(),
                message: "notification webhook rejected message".into(),
            });
        }
        Ok(())
    }
}

/// Sink that only logs. Used when no webhook is configured.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send(
        &self,
        message: MessageKind,
        job_id: JobId,
        details: &str,
    ) -> Result<(), SyncError> {
        tracing::info!(%message, %job_id, details, "stakeholder notification");
        Ok(())
    }
}
