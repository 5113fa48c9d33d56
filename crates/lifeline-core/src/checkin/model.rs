//! Data model for check-ins and emergency contacts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::code::ConfirmationCode;

/// Lifecycle status of a check-in.
///
/// `scheduled → active → {acknowledged | escalated | missed}`, with
/// `cancelled` reachable from either open state. Everything but `scheduled`
/// and `active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInStatus {
    Scheduled,
    Active,
    Acknowledged,
    Escalated,
    Missed,
    Cancelled,
}

impl CheckInStatus {
    /// Statuses the reconciler has to watch.
    pub const OPEN: [Self; 2] = [Self::Scheduled, Self::Active];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Escalated => "escalated",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `true` while a transition out of this status is still possible.
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Scheduled | Self::Active)
    }

    pub const fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for CheckInStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown check-in status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for CheckInStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "acknowledged" => Ok(Self::Acknowledged),
            "escalated" => Ok(Self::Escalated),
            "missed" => Ok(Self::Missed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// How a contact wants to be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    #[default]
    Email,
    Sms,
    Both,
}

impl NotificationMethod {
    pub const fn channels(self) -> &'static [Channel] {
        match self {
            Self::Email => &[Channel::Email],
            Self::Sms => &[Channel::Sms],
            Self::Both => &[Channel::Email, Channel::Sms],
        }
    }
}

/// A single delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// A permanent emergency contact, stored as its own record under the
/// owner's partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub method: NotificationMethod,
}

impl Contact {
    /// Address for a channel, if the contact has one.
    pub fn address(&self, channel: Channel) -> Option<&str> {
        address_for(self.email.as_deref(), self.phone.as_deref(), channel)
    }
}

/// An inline contact used for a single check-in only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomContact {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub method: NotificationMethod,
}

impl CustomContact {
    pub fn address(&self, channel: Channel) -> Option<&str> {
        address_for(self.email.as_deref(), self.phone.as_deref(), channel)
    }
}

fn address_for<'a>(email: Option<&'a str>, phone: Option<&'a str>, channel: Channel) -> Option<&'a str> {
    let addr = match channel {
        Channel::Email => email,
        Channel::Sms => phone,
    };
    addr.map(str::trim).filter(|a| !a.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: Option<String>,
}

/// Someone present with the user. Informational only; never notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Companion {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Why a check-in was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The confirmation session ran out of attempts.
    AttemptsExhausted,
    /// The response deadline passed without acknowledgment.
    DeadlinePassed,
}

impl EscalationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::DeadlinePassed => "deadline_passed",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled safety check-in.
///
/// All instants are Unix timestamps in seconds. Construct through
/// [`CheckIn::create`] and mutate only through the lifecycle methods so the
/// invariants in [`CheckIn::check_invariants`] hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub kind: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub scheduled_time: i64,
    pub interval_minutes: u32,
    pub response_deadline: i64,
    pub status: CheckInStatus,
    pub confirmation_code: ConfirmationCode,
    #[serde(default)]
    pub contact_ids: Vec<String>,
    #[serde(default)]
    pub custom_contacts: Vec<CustomContact>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub companions: Vec<Companion>,
    #[serde(default)]
    pub acknowledged_at: Option<i64>,
    #[serde(default)]
    pub escalated_at: Option<i64>,
    /// Set when the check-in ends as `missed` or `cancelled`.
    #[serde(default)]
    pub resolved_at: Option<i64>,
    #[serde(default)]
    pub escalation_reason: Option<EscalationReason>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CheckIn {
    /// Number of escalation targets, permanent and custom.
    pub fn contact_count(&self) -> usize {
        self.contact_ids.len() + self.custom_contacts.len()
    }

    /// `true` once the response deadline has passed on an open check-in.
    pub const fn is_overdue(&self, now: i64) -> bool {
        self.status.is_open() && self.response_deadline < now
    }

    /// Last instant at which a code submission is still accepted.
    pub const fn confirmation_closes_at(&self, grace_period_secs: i64) -> i64 {
        self.response_deadline.saturating_add(grace_period_secs)
    }

    /// `true` if the device should hold a pending trigger for this check-in.
    pub fn needs_trigger(&self, now: i64) -> bool {
        self.status == CheckInStatus::Scheduled && self.scheduled_time > now
    }

    /// Verify the structural invariants of the record.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.interval_minutes == 0 {
            return Err("interval_minutes must be positive");
        }
        if Some(self.response_deadline)
            != Self::deadline_for(self.scheduled_time, self.interval_minutes)
        {
            return Err("response_deadline must equal scheduled_time + interval_minutes");
        }
        if self.response_deadline <= self.scheduled_time {
            return Err("response_deadline must be after scheduled_time");
        }
        if !ConfirmationCode::is_well_formed(self.confirmation_code.as_str()) {
            return Err("confirmation_code must be 4 digits");
        }
        if self.contact_count() == 0 {
            return Err("at least one contact is required");
        }
        if self.acknowledged_at.is_some() != (self.status == CheckInStatus::Acknowledged) {
            return Err("acknowledged_at must be set exactly when acknowledged");
        }
        if self.escalated_at.is_some() != (self.status == CheckInStatus::Escalated) {
            return Err("escalated_at must be set exactly when escalated");
        }
        Ok(())
    }

    /// `scheduled_time + interval_minutes`, or `None` on overflow.
    pub fn deadline_for(scheduled_time: i64, interval_minutes: u32) -> Option<i64> {
        scheduled_time.checked_add(i64::from(interval_minutes) * 60)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            CheckInStatus::Scheduled,
            CheckInStatus::Active,
            CheckInStatus::Acknowledged,
            CheckInStatus::Escalated,
            CheckInStatus::Missed,
            CheckInStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<CheckInStatus>().unwrap(), status);
        }
        assert!("pending".parse::<CheckInStatus>().is_err());
    }

    #[test]
    fn only_scheduled_and_active_are_open() {
        assert!(CheckInStatus::Scheduled.is_open());
        assert!(CheckInStatus::Active.is_open());
        assert!(CheckInStatus::Escalated.is_terminal());
        assert!(CheckInStatus::Missed.is_terminal());
    }

    #[test]
    fn both_method_expands_to_two_channels() {
        assert_eq!(
            NotificationMethod::Both.channels(),
            &[Channel::Email, Channel::Sms]
        );
    }

    #[test]
    fn blank_addresses_are_not_deliverable() {
        let contact = CustomContact {
            name: "Sam".into(),
            email: Some("  ".into()),
            phone: Some("+15550100".into()),
            method: NotificationMethod::Both,
        };
        assert_eq!(contact.address(Channel::Email), None);
        assert_eq!(contact.address(Channel::Sms), Some("+15550100"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&CheckInStatus::Acknowledged).unwrap();
        assert_eq!(json, "\"acknowledged\"");
    }
}
