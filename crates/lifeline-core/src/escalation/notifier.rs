//! Delivery seam between escalation and the outside world.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EscalationEvent;
use crate::checkin::Channel;

/// One concrete place an escalation is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Stable per check-in: `contact:{id}` or `custom:{index}`.
    pub target_id: String,
    /// Set for permanent contacts.
    #[serde(default)]
    pub contact_id: Option<String>,
    pub name: String,
    pub channel: Channel,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// The gateway answered but refused the message. Retrying will not help.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("delivery transport error: {0}")]
    Transport(String),

    #[error("no gateway configured for {0}")]
    NotConfigured(Channel),
}

/// Sends an escalation event to a single target.
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn deliver(
        &self,
        event: &EscalationEvent,
        target: &DeliveryTarget,
    ) -> Result<(), NotifyError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingNotifier;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{DeliveryTarget, EscalationNotifier, NotifyError};
    use crate::checkin::Channel;
    use crate::escalation::EscalationEvent;

    /// Notifier that records every delivery. Channels can be made to fail
    /// or be rejected, and every delivery can be slowed down.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        delivered: Arc<Mutex<Vec<(EscalationEvent, DeliveryTarget)>>>,
        failing: Arc<Mutex<HashSet<Channel>>>,
        rejecting: Arc<Mutex<HashSet<Channel>>>,
        delay: Arc<Mutex<Option<Duration>>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_channel(&self, channel: Channel, failing: bool) {
            let mut set = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
            if failing {
                set.insert(channel);
            } else {
                set.remove(&channel);
            }
        }

        pub fn reject_channel(&self, channel: Channel, rejecting: bool) {
            let mut set = self.rejecting.lock().unwrap_or_else(PoisonError::into_inner);
            if rejecting {
                set.insert(channel);
            } else {
                set.remove(&channel);
            }
        }

        /// Sleep this long before each delivery.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
        }

        pub fn deliveries(&self) -> Vec<(EscalationEvent, DeliveryTarget)> {
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Distinct events seen, by check-in id and escalation instant.
        pub fn event_count(&self) -> usize {
            self.deliveries()
                .iter()
                .map(|(e, _)| (e.check_in_id.clone(), e.escalated_at))
                .collect::<HashSet<_>>()
                .len()
        }
    }

    #[async_trait]
    impl EscalationNotifier for RecordingNotifier {
        async fn deliver(
            &self,
            event: &EscalationEvent,
            target: &DeliveryTarget,
        ) -> Result<(), NotifyError> {
            let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let rejected = self
                .rejecting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&target.channel);
            if rejected {
                return Err(NotifyError::Rejected(format!(
                    "{} address refused",
                    target.channel
                )));
            }
            let failing = self
                .failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&target.channel);
            if failing {
                return Err(NotifyError::Transport(format!(
                    "{} gateway unreachable",
                    target.channel
                )));
            }
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((event.clone(), target.clone()));
            Ok(())
        }
    }
}
