//! Contact notification backends for the server.
//!
//! [`LogNotifier`] writes each delivery to the log and is the default when no
//! gateway is configured. With the `http-dispatch` feature,
//! [`HttpGatewayNotifier`] posts messages to email and SMS gateways.

#[cfg(feature = "http-dispatch")]
pub mod http;

#[cfg(feature = "http-dispatch")]
pub use http::HttpGatewayNotifier;

use async_trait::async_trait;
use lifeline_core::checkin::{Channel, EscalationReason};
use lifeline_core::escalation::{DeliveryTarget, EscalationEvent, EscalationNotifier, NotifyError};
use tracing::info;

/// Subject and body sent to a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Render the text a contact receives for `event`.
///
/// SMS bodies omit notes and companions to stay short.
pub fn render_message(event: &EscalationEvent, target: &DeliveryTarget) -> RenderedMessage {
    let subject = format!("Lifeline alert: \"{}\" was not confirmed", event.title);

    let cause = match event.reason {
        EscalationReason::AttemptsExhausted => "entered the wrong confirmation code too many times",
        EscalationReason::DeadlinePassed => "did not check in before the deadline",
    };

    let mut body = format!(
        "Hi {}, you are listed as an emergency contact. The person behind the {} check-in \
         \"{}\" {cause}.",
        target.name, event.kind, event.title
    );

    if let Some(location) = &event.location {
        let label = location.label.as_deref().unwrap_or("last known location");
        body.push_str(&format!(
            " {label}: {:.5}, {:.5}.",
            location.latitude, location.longitude
        ));
    }

    if target.channel == Channel::Email && !event.companions.is_empty() {
        let names: Vec<&str> = event.companions.iter().map(|c| c.name.as_str()).collect();
        body.push_str(&format!(" Companions: {}.", names.join(", ")));
    }

    RenderedMessage { subject, body }
}

/// Notifier that only logs. Every delivery succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl EscalationNotifier for LogNotifier {
    async fn deliver(
        &self,
        event: &EscalationEvent,
        target: &DeliveryTarget,
    ) -> Result<(), NotifyError> {
        let message = render_message(event, target);
        info!(
            check_in_id = %event.check_in_id,
            user_id = %event.user_id,
            target_id = %target.target_id,
            channel = %target.channel,
            address = %target.address,
            subject = %message.subject,
            "Escalation notification"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lifeline_core::checkin::{Companion, Location};

    use super::*;

    fn event() -> EscalationEvent {
        EscalationEvent {
            check_in_id: "k1".into(),
            user_id: "u1".into(),
            title: "Ridge hike".into(),
            kind: "hike".into(),
            reason: EscalationReason::DeadlinePassed,
            escalated_at: 5_000,
            scheduled_time: 1_000,
            response_deadline: 4_600,
            contact_ids: vec!["c1".into()],
            custom_contacts: vec![],
            location: Some(Location {
                latitude: 46.55,
                longitude: 7.98,
                label: Some("Trailhead".into()),
            }),
            companions: vec![Companion {
                name: "Robin".into(),
                phone: None,
            }],
        }
    }

    fn target(channel: Channel) -> DeliveryTarget {
        DeliveryTarget {
            target_id: "contact:c1".into(),
            contact_id: Some("c1".into()),
            name: "Alex".into(),
            channel,
            address: "alex@example.com".into(),
        }
    }

    #[test]
    fn email_body_mentions_location_and_companions() {
        let message = render_message(&event(), &target(Channel::Email));
        assert!(message.subject.contains("Ridge hike"));
        assert!(message.body.starts_with("Hi Alex"));
        assert!(message.body.contains("did not check in"));
        assert!(message.body.contains("Trailhead: 46.55000, 7.98000"));
        assert!(message.body.contains("Companions: Robin."));
    }

    #[test]
    fn sms_body_skips_companions() {
        let mut ev = event();
        ev.reason = EscalationReason::AttemptsExhausted;
        let message = render_message(&ev, &target(Channel::Sms));
        assert!(message.body.contains("wrong confirmation code"));
        assert!(!message.body.contains("Companions"));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        LogNotifier
            .deliver(&event(), &target(Channel::Sms))
            .await
            .unwrap();
    }
}
