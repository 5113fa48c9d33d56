//! HTTP gateway client for email and SMS delivery.
//!
//! Each channel has its own endpoint. A message is POSTed as JSON with a
//! bearer token read from `LIFELINE_GATEWAY_TOKEN`.

use async_trait::async_trait;
use lifeline_core::checkin::Channel;
use lifeline_core::escalation::{DeliveryTarget, EscalationEvent, EscalationNotifier, NotifyError};
use serde::Serialize;
use tracing::{debug, warn};

use super::render_message;

/// Environment variable holding the gateway bearer token.
const GATEWAY_TOKEN_ENV: &str = "LIFELINE_GATEWAY_TOKEN";

/// Request body accepted by both gateways.
#[derive(Debug, Serialize)]
pub struct GatewayMessage {
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    /// Lets the gateway deduplicate retries.
    pub idempotency_key: String,
}

pub struct HttpGatewayNotifier {
    http: reqwest::Client,
    email_url: Option<String>,
    sms_url: Option<String>,
    token: Option<String>,
}

impl HttpGatewayNotifier {
    pub fn new(
        email_url: Option<String>,
        sms_url: Option<String>,
    ) -> Result<Self, NotifyError> {
        // No-op if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let token = std::env::var(GATEWAY_TOKEN_ENV).ok();
        if token.is_none() {
            warn!("Environment variable {GATEWAY_TOKEN_ENV} is not set; gateway requests are unauthenticated");
        }

        debug!(
            email = email_url.is_some(),
            sms = sms_url.is_some(),
            "HTTP gateway notifier initialized"
        );

        Ok(Self {
            http,
            email_url,
            sms_url,
            token,
        })
    }

    pub fn build_message(event: &EscalationEvent, target: &DeliveryTarget) -> GatewayMessage {
        let rendered = render_message(event, target);
        GatewayMessage {
            to: target.address.clone(),
            subject: (target.channel == Channel::Email).then_some(rendered.subject),
            body: rendered.body,
            idempotency_key: format!(
                "{}:{}:{}",
                event.check_in_id, target.target_id, target.channel
            ),
        }
    }

    fn endpoint(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email_url.as_deref(),
            Channel::Sms => self.sms_url.as_deref(),
        }
    }
}

#[async_trait]
impl EscalationNotifier for HttpGatewayNotifier {
    async fn deliver(
        &self,
        event: &EscalationEvent,
        target: &DeliveryTarget,
    ) -> Result<(), NotifyError> {
        let url = self
            .endpoint(target.channel)
            .ok_or(NotifyError::NotConfigured(target.channel))?;
        let message = Self::build_message(event, target);

        let mut request = self.http.post(url).json(&message);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(channel = %target.channel, "Gateway accepted message");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        warn!(status = status.as_u16(), body = %body, "Gateway returned error");
        let detail = format!("status {}: {body}", status.as_u16());
        if status.is_client_error() {
            Err(NotifyError::Rejected(detail))
        } else {
            Err(NotifyError::Transport(detail))
        }
    }
}
