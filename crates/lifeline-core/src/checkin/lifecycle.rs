//! Check-in lifecycle engine.
//!
//! Pure state-machine logic: creation guards, valid transitions, and the
//! derived fields (`response_deadline`, resolution timestamps). Nothing here
//! touches storage or the clock; callers pass `now` explicitly.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::code::ConfirmationCode;
use super::model::{
    Channel, CheckIn, CheckInStatus, Companion, CustomContact, EscalationReason, Location,
};

/// Upper bound on `interval_minutes` (one week).
pub const MAX_INTERVAL_MINUTES: u32 = 7 * 24 * 60;

/// Malformed creation or edit input. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,

    #[error("interval must be between 1 and {max} minutes, got {got}")]
    IntervalOutOfRange { got: i64, max: u32 },

    #[error("confirmation code must be exactly 4 ASCII digits")]
    MalformedCode,

    #[error("at least one contact is required")]
    NoContacts,

    #[error("contact id must not be blank")]
    BlankContactId,

    #[error("custom contact name must not be empty")]
    EmptyContactName,

    #[error("custom contact '{name}' has no {field} for its notification method")]
    ContactMissingAddress { name: String, field: &'static str },

    #[error("location coordinates out of range")]
    InvalidLocation,

    #[error("scheduled time is out of range")]
    TimeOutOfRange,
}

/// The operation a transition attempted, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Activate,
    Acknowledge,
    Escalate,
    MarkMissed,
    Cancel,
    Edit,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activate => "activate",
            Self::Acknowledge => "acknowledge",
            Self::Escalate => "escalate",
            Self::MarkMissed => "mark missed",
            Self::Cancel => "cancel",
            Self::Edit => "edit",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {action} a check-in that is {from}")]
    Invalid { action: Action, from: CheckInStatus },

    #[error("user {caller} does not own check-in {check_in_id}")]
    NotOwner { caller: String, check_in_id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Result of a successful transition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record changed and must be persisted.
    Applied,
    /// The record was already in the target state; nothing to persist.
    Unchanged,
}

impl Transition {
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Input for [`CheckIn::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCheckIn {
    pub title: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub scheduled_time: i64,
    pub interval_minutes: i64,
    /// Generated when absent.
    #[serde(default)]
    pub confirmation_code: Option<String>,
    #[serde(default)]
    pub contact_ids: Vec<String>,
    #[serde(default)]
    pub custom_contacts: Vec<CustomContact>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub companions: Vec<Companion>,
}

/// What to do with the confirmation code on edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "choice", content = "code")]
pub enum CodeChoice {
    #[default]
    Preserve,
    Regenerate,
    Set(String),
}

/// Replacement fields for [`CheckIn::edit`]. `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInEdit {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub notes: Option<Option<String>>,
    #[serde(default)]
    pub scheduled_time: Option<i64>,
    #[serde(default)]
    pub interval_minutes: Option<i64>,
    #[serde(default)]
    pub code: CodeChoice,
    #[serde(default)]
    pub contact_ids: Option<Vec<String>>,
    #[serde(default)]
    pub custom_contacts: Option<Vec<CustomContact>>,
    #[serde(default)]
    pub location: Option<Option<Location>>,
    #[serde(default)]
    pub companions: Option<Vec<Companion>>,
}

impl CheckInEdit {
    /// `true` if applying this edit moves the trigger instant.
    pub const fn reschedules(&self) -> bool {
        self.scheduled_time.is_some()
    }
}

const DEFAULT_KIND: &str = "general";

impl CheckIn {
    /// Build a new `scheduled` check-in, enforcing every creation guard.
    pub fn create(
        id: impl Into<String>,
        user_id: impl Into<String>,
        input: NewCheckIn,
        now: i64,
    ) -> Result<Self, ValidationError> {
        let title = validate_title(&input.title)?;
        let interval_minutes = validate_interval(input.interval_minutes)?;
        let response_deadline = Self::deadline_for(input.scheduled_time, interval_minutes)
            .ok_or(ValidationError::TimeOutOfRange)?;
        let confirmation_code = match input.confirmation_code.as_deref() {
            Some(code) => {
                ConfirmationCode::parse(code).map_err(|_| ValidationError::MalformedCode)?
            }
            None => ConfirmationCode::generate(),
        };
        let contact_ids = validate_contacts(input.contact_ids, &input.custom_contacts)?;
        if let Some(location) = &input.location {
            validate_location(location)?;
        }

        Ok(Self {
            id: id.into(),
            user_id: user_id.into(),
            title,
            kind: normalize_kind(input.kind),
            notes: input.notes,
            scheduled_time: input.scheduled_time,
            interval_minutes,
            response_deadline,
            status: CheckInStatus::Scheduled,
            confirmation_code,
            contact_ids,
            custom_contacts: input.custom_contacts,
            location: input.location,
            companions: input.companions,
            acknowledged_at: None,
            escalated_at: None,
            resolved_at: None,
            escalation_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// The device prompt has opened: `scheduled → active`.
    pub fn activate(&mut self, now: i64) -> Result<Transition, TransitionError> {
        match self.status {
            CheckInStatus::Scheduled => {
                self.status = CheckInStatus::Active;
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            CheckInStatus::Active => Ok(Transition::Unchanged),
            from => Err(TransitionError::Invalid {
                action: Action::Activate,
                from,
            }),
        }
    }

    /// A correct code arrived in time.
    pub fn acknowledge(&mut self, now: i64) -> Result<Transition, TransitionError> {
        match self.status {
            CheckInStatus::Scheduled | CheckInStatus::Active => {
                self.status = CheckInStatus::Acknowledged;
                self.acknowledged_at = Some(now);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            CheckInStatus::Acknowledged => Ok(Transition::Unchanged),
            from => Err(TransitionError::Invalid {
                action: Action::Acknowledge,
                from,
            }),
        }
    }

    /// Move to `escalated`. Calling this on an already escalated record is a
    /// no-op so racing sweeps converge.
    pub fn escalate(
        &mut self,
        reason: EscalationReason,
        now: i64,
    ) -> Result<Transition, TransitionError> {
        match self.status {
            CheckInStatus::Scheduled | CheckInStatus::Active => {
                self.status = CheckInStatus::Escalated;
                self.escalated_at = Some(now);
                self.escalation_reason = Some(reason);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            CheckInStatus::Escalated => Ok(Transition::Unchanged),
            from => Err(TransitionError::Invalid {
                action: Action::Escalate,
                from,
            }),
        }
    }

    /// The deadline passed but no notification could be (or was allowed to
    /// be) sent.
    pub fn mark_missed(
        &mut self,
        reason: EscalationReason,
        now: i64,
    ) -> Result<Transition, TransitionError> {
        match self.status {
            CheckInStatus::Scheduled | CheckInStatus::Active => {
                self.status = CheckInStatus::Missed;
                self.resolved_at = Some(now);
                self.escalation_reason = Some(reason);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            CheckInStatus::Missed => Ok(Transition::Unchanged),
            from => Err(TransitionError::Invalid {
                action: Action::MarkMissed,
                from,
            }),
        }
    }

    /// Owner-initiated cancellation.
    pub fn cancel(&mut self, caller: &str, now: i64) -> Result<Transition, TransitionError> {
        self.ensure_owner(caller)?;
        match self.status {
            CheckInStatus::Scheduled | CheckInStatus::Active => {
                self.status = CheckInStatus::Cancelled;
                self.resolved_at = Some(now);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            CheckInStatus::Cancelled => Ok(Transition::Unchanged),
            from => Err(TransitionError::Invalid {
                action: Action::Cancel,
                from,
            }),
        }
    }

    /// Guard for destroying the record: owner only, and only while it is
    /// still `scheduled` or `active`. Resolved check-ins keep their history.
    pub fn ensure_deletable(&self, caller: &str) -> Result<(), TransitionError> {
        self.ensure_owner(caller)?;
        if self.status.is_open() {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                action: Action::Delete,
                from: self.status,
            })
        }
    }

    /// Replace mutable fields while still `scheduled`. The record is left
    /// untouched if any guard fails.
    pub fn edit(
        &mut self,
        caller: &str,
        edit: CheckInEdit,
        now: i64,
    ) -> Result<(), TransitionError> {
        self.ensure_owner(caller)?;
        if self.status != CheckInStatus::Scheduled {
            return Err(TransitionError::Invalid {
                action: Action::Edit,
                from: self.status,
            });
        }

        let title = match edit.title.as_deref() {
            Some(title) => validate_title(title)?,
            None => self.title.clone(),
        };
        let interval_minutes = match edit.interval_minutes {
            Some(minutes) => validate_interval(minutes)?,
            None => self.interval_minutes,
        };
        let scheduled_time = edit.scheduled_time.unwrap_or(self.scheduled_time);
        let response_deadline = Self::deadline_for(scheduled_time, interval_minutes)
            .ok_or(ValidationError::TimeOutOfRange)?;
        let confirmation_code = match edit.code {
            CodeChoice::Preserve => self.confirmation_code.clone(),
            CodeChoice::Regenerate => ConfirmationCode::generate(),
            CodeChoice::Set(code) => {
                ConfirmationCode::parse(&code).map_err(|_| ValidationError::MalformedCode)?
            }
        };
        let custom_contacts = edit
            .custom_contacts
            .unwrap_or_else(|| self.custom_contacts.clone());
        let contact_ids = validate_contacts(
            edit.contact_ids.unwrap_or_else(|| self.contact_ids.clone()),
            &custom_contacts,
        )?;
        let location = edit.location.unwrap_or_else(|| self.location.clone());
        if let Some(location) = &location {
            validate_location(location)?;
        }

        self.title = title;
        if let Some(kind) = edit.kind {
            self.kind = normalize_kind(Some(kind));
        }
        if let Some(notes) = edit.notes {
            self.notes = notes;
        }
        self.scheduled_time = scheduled_time;
        self.interval_minutes = interval_minutes;
        self.response_deadline = response_deadline;
        self.confirmation_code = confirmation_code;
        self.contact_ids = contact_ids;
        self.custom_contacts = custom_contacts;
        self.location = location;
        if let Some(companions) = edit.companions {
            self.companions = companions;
        }
        self.updated_at = now;
        Ok(())
    }

    fn ensure_owner(&self, caller: &str) -> Result<(), TransitionError> {
        if self.user_id == caller {
            Ok(())
        } else {
            Err(TransitionError::NotOwner {
                caller: caller.to_string(),
                check_in_id: self.id.clone(),
            })
        }
    }
}

fn validate_title(title: &str) -> Result<String, ValidationError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    Ok(trimmed.to_string())
}

fn validate_interval(minutes: i64) -> Result<u32, ValidationError> {
    u32::try_from(minutes)
        .ok()
        .filter(|m| (1..=MAX_INTERVAL_MINUTES).contains(m))
        .ok_or(ValidationError::IntervalOutOfRange {
            got: minutes,
            max: MAX_INTERVAL_MINUTES,
        })
}

/// Checks the combined contact set and returns the de-duplicated ids in
/// their original order.
fn validate_contacts(
    contact_ids: Vec<String>,
    custom_contacts: &[CustomContact],
) -> Result<Vec<String>, ValidationError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(contact_ids.len());
    for id in contact_ids {
        if id.trim().is_empty() {
            return Err(ValidationError::BlankContactId);
        }
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }

    for contact in custom_contacts {
        if contact.name.trim().is_empty() {
            return Err(ValidationError::EmptyContactName);
        }
        for channel in contact.method.channels() {
            if contact.address(*channel).is_none() {
                return Err(ValidationError::ContactMissingAddress {
                    name: contact.name.clone(),
                    field: match channel {
                        Channel::Email => "email",
                        Channel::Sms => "phone",
                    },
                });
            }
        }
    }

    if ids.is_empty() && custom_contacts.is_empty() {
        return Err(ValidationError::NoContacts);
    }
    Ok(ids)
}

fn validate_location(location: &Location) -> Result<(), ValidationError> {
    let lat_ok = location.latitude.is_finite() && (-90.0..=90.0).contains(&location.latitude);
    let lon_ok = location.longitude.is_finite() && (-180.0..=180.0).contains(&location.longitude);
    if lat_ok && lon_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidLocation)
    }
}

fn normalize_kind(kind: Option<String>) -> String {
    kind.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| DEFAULT_KIND.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::checkin::NotificationMethod;

    const T: i64 = 1_750_000_000;

    fn input() -> NewCheckIn {
        NewCheckIn {
            title: "Evening hike".to_string(),
            scheduled_time: T,
            interval_minutes: 60,
            confirmation_code: Some("4821".to_string()),
            contact_ids: vec!["c1".to_string()],
            ..Default::default()
        }
    }

    fn scheduled() -> CheckIn {
        CheckIn::create("ci-1", "u1", input(), T - 600).unwrap()
    }

    #[test]
    fn create_derives_deadline_and_status() {
        let ci = scheduled();
        assert_eq!(ci.status, CheckInStatus::Scheduled);
        assert_eq!(ci.response_deadline, T + 3600);
        assert_eq!(ci.kind, "general");
        ci.check_invariants().unwrap();
    }

    #[test]
    fn create_generates_code_when_absent() {
        let ci = CheckIn::create(
            "ci-1",
            "u1",
            NewCheckIn {
                confirmation_code: None,
                ..input()
            },
            T,
        )
        .unwrap();
        assert!(ConfirmationCode::is_well_formed(ci.confirmation_code.as_str()));
    }

    #[test]
    fn create_rejects_bad_input() {
        let cases = [
            (
                NewCheckIn {
                    title: "   ".into(),
                    ..input()
                },
                ValidationError::EmptyTitle,
            ),
            (
                NewCheckIn {
                    interval_minutes: 0,
                    ..input()
                },
                ValidationError::IntervalOutOfRange {
                    got: 0,
                    max: MAX_INTERVAL_MINUTES,
                },
            ),
            (
                NewCheckIn {
                    interval_minutes: -5,
                    ..input()
                },
                ValidationError::IntervalOutOfRange {
                    got: -5,
                    max: MAX_INTERVAL_MINUTES,
                },
            ),
            (
                NewCheckIn {
                    confirmation_code: Some("48a1".into()),
                    ..input()
                },
                ValidationError::MalformedCode,
            ),
            (
                NewCheckIn {
                    contact_ids: vec![],
                    ..input()
                },
                ValidationError::NoContacts,
            ),
        ];
        for (bad, expected) in cases {
            assert_eq!(CheckIn::create("x", "u1", bad, T).unwrap_err(), expected);
        }
    }

    #[test]
    fn custom_contact_alone_satisfies_contact_guard() {
        let ci = CheckIn::create(
            "ci-1",
            "u1",
            NewCheckIn {
                contact_ids: vec![],
                custom_contacts: vec![CustomContact {
                    name: "Neighbour".into(),
                    email: None,
                    phone: Some("+15550101".into()),
                    method: NotificationMethod::Sms,
                }],
                ..input()
            },
            T,
        )
        .unwrap();
        assert_eq!(ci.contact_count(), 1);
    }

    #[test]
    fn custom_contact_needs_address_for_method() {
        let err = CheckIn::create(
            "ci-1",
            "u1",
            NewCheckIn {
                custom_contacts: vec![CustomContact {
                    name: "Neighbour".into(),
                    email: Some("n@example.com".into()),
                    phone: None,
                    method: NotificationMethod::Both,
                }],
                ..input()
            },
            T,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ContactMissingAddress { field: "phone", .. }
        ));
    }

    #[test]
    fn duplicate_contact_ids_are_collapsed() {
        let ci = CheckIn::create(
            "ci-1",
            "u1",
            NewCheckIn {
                contact_ids: vec!["c1".into(), "c2".into(), "c1".into()],
                ..input()
            },
            T,
        )
        .unwrap();
        assert_eq!(ci.contact_ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn acknowledge_sets_timestamp() {
        let mut ci = scheduled();
        assert!(ci.activate(T).unwrap().is_applied());
        assert!(ci.acknowledge(T + 60).unwrap().is_applied());
        assert_eq!(ci.acknowledged_at, Some(T + 60));
        ci.check_invariants().unwrap();
    }

    #[test]
    fn escalate_is_idempotent() {
        let mut ci = scheduled();
        assert_eq!(
            ci.escalate(EscalationReason::DeadlinePassed, T + 4000).unwrap(),
            Transition::Applied
        );
        let snapshot = ci.clone();
        assert_eq!(
            ci.escalate(EscalationReason::DeadlinePassed, T + 5000).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(ci, snapshot);
        assert_eq!(ci.escalated_at, Some(T + 4000));
        ci.check_invariants().unwrap();
    }

    #[test]
    fn terminal_states_reject_other_transitions() {
        let mut ci = scheduled();
        ci.acknowledge(T).unwrap();
        assert!(matches!(
            ci.escalate(EscalationReason::DeadlinePassed, T),
            Err(TransitionError::Invalid {
                action: Action::Escalate,
                from: CheckInStatus::Acknowledged
            })
        ));
        assert!(ci.activate(T).is_err());
        assert!(ci.cancel("u1", T).is_err());
        assert!(ci.mark_missed(EscalationReason::DeadlinePassed, T).is_err());
    }

    #[test]
    fn nothing_returns_to_scheduled() {
        let mut ci = scheduled();
        ci.activate(T).unwrap();
        let err = ci.edit("u1", CheckInEdit::default(), T).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { action: Action::Edit, .. }));
        assert_eq!(ci.status, CheckInStatus::Active);
    }

    #[test]
    fn only_open_check_ins_are_deletable() {
        let mut ci = scheduled();
        assert!(ci.ensure_deletable("u1").is_ok());
        assert!(matches!(
            ci.ensure_deletable("intruder"),
            Err(TransitionError::NotOwner { .. })
        ));
        ci.escalate(EscalationReason::AttemptsExhausted, T).unwrap();
        assert!(matches!(
            ci.ensure_deletable("u1"),
            Err(TransitionError::Invalid {
                action: Action::Delete,
                from: CheckInStatus::Escalated
            })
        ));
    }

    #[test]
    fn cancel_requires_owner() {
        let mut ci = scheduled();
        assert!(matches!(
            ci.cancel("intruder", T),
            Err(TransitionError::NotOwner { .. })
        ));
        assert!(ci.cancel("u1", T).unwrap().is_applied());
        assert_eq!(ci.status, CheckInStatus::Cancelled);
        assert_eq!(ci.resolved_at, Some(T));
    }

    #[test]
    fn edit_recomputes_deadline() {
        let mut ci = scheduled();
        ci.edit(
            "u1",
            CheckInEdit {
                scheduled_time: Some(T + 7200),
                interval_minutes: Some(30),
                ..Default::default()
            },
            T,
        )
        .unwrap();
        assert_eq!(ci.response_deadline, T + 7200 + 1800);
        assert!(ci.confirmation_code.matches("4821"));
        ci.check_invariants().unwrap();
    }

    #[test]
    fn edit_can_set_or_regenerate_code() {
        let mut ci = scheduled();
        ci.edit(
            "u1",
            CheckInEdit {
                code: CodeChoice::Set("0007".into()),
                ..Default::default()
            },
            T,
        )
        .unwrap();
        assert!(ci.confirmation_code.matches("0007"));

        ci.edit(
            "u1",
            CheckInEdit {
                code: CodeChoice::Regenerate,
                ..Default::default()
            },
            T,
        )
        .unwrap();
        assert!(ConfirmationCode::is_well_formed(ci.confirmation_code.as_str()));
    }

    #[test]
    fn failed_edit_leaves_record_untouched() {
        let mut ci = scheduled();
        let before = ci.clone();
        let err = ci
            .edit(
                "u1",
                CheckInEdit {
                    title: Some("New title".into()),
                    contact_ids: Some(vec![]),
                    ..Default::default()
                },
                T,
            )
            .unwrap_err();
        assert_eq!(err, TransitionError::Validation(ValidationError::NoContacts));
        assert_eq!(ci, before);
    }

    #[test]
    fn mark_missed_resolves_without_escalated_at() {
        let mut ci = scheduled();
        ci.mark_missed(EscalationReason::DeadlinePassed, T + 4000)
            .unwrap();
        assert_eq!(ci.status, CheckInStatus::Missed);
        assert_eq!(ci.escalated_at, None);
        ci.check_invariants().unwrap();
    }

    #[test]
    fn overdue_only_while_open() {
        let mut ci = scheduled();
        assert!(!ci.is_overdue(T + 3600));
        assert!(ci.is_overdue(T + 3601));
        ci.acknowledge(T).unwrap();
        assert!(!ci.is_overdue(T + 9999));
    }

    #[test]
    fn invalid_location_is_rejected() {
        let err = CheckIn::create(
            "ci-1",
            "u1",
            NewCheckIn {
                location: Some(Location {
                    latitude: 91.0,
                    longitude: 0.0,
                    label: None,
                }),
                ..input()
            },
            T,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidLocation);
    }
}
