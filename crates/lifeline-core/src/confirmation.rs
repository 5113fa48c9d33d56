//! Confirmation-code challenge protocol.
//!
//! When a check-in's trigger fires the device opens a [`ChallengeSession`]
//! that carries the attempt budget. Submissions within one session run
//! strictly one at a time behind the session's own mutex; different
//! check-ins never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::checkin::{CheckIn, CheckInStatus, ConfirmationCode, EscalationReason, TransitionError};
use crate::config::Config;
use crate::escalation::{DeliveryReport, EscalationError, EscalationResult, Escalator};
use crate::store::{CheckInRepository, StoreError, Stored};

/// Upper bound on re-reads after a version conflict.
const MAX_CAS_RETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// Wrong codes allowed per session before escalation.
    pub max_attempts: u32,
    /// Seconds after the response deadline during which a code is still
    /// accepted.
    pub grace_period_secs: i64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            grace_period_secs: 15 * 60,
        }
    }
}

impl From<&Config> for ChallengeConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.checkins.max_attempts,
            grace_period_secs: i64::try_from(config.checkins.grace_period_secs)
                .unwrap_or(i64::MAX),
        }
    }
}

/// Attempt budget for one open prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSession {
    pub check_in_id: String,
    pub user_id: String,
    pub attempts_remaining: u32,
    pub opened_at: i64,
}

/// Terminal result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The code matched and the check-in is acknowledged.
    Acknowledged { at: i64 },
    /// The last attempt was used up and contacts were notified.
    Escalated { at: i64, report: DeliveryReport },
    /// The last attempt was used up but nobody could be notified.
    Missed { at: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("confirmation code must be exactly {} ASCII digits", ConfirmationCode::LEN)]
    InvalidFormat,

    #[error("incorrect code, {attempts_remaining} attempts remaining")]
    CodeMismatch { attempts_remaining: u32 },

    #[error("check-in {0} not found")]
    NotFound(String),

    #[error("user {caller} does not own check-in {check_in_id}")]
    NotOwner { caller: String, check_in_id: String },

    #[error("check-in already {status}")]
    AlreadyResolved { status: CheckInStatus },

    #[error("confirmation window closed at {closed_at}")]
    WindowClosed { closed_at: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

/// Check-in ids are only unique per owner.
type SessionKey = (String, String);

fn session_key(user_id: &str, check_in_id: &str) -> SessionKey {
    (user_id.to_string(), check_in_id.to_string())
}

/// Open challenge sessions, keyed by owner and check-in id.
#[derive(Clone)]
pub struct ChallengeRegistry {
    repo: CheckInRepository,
    escalator: Escalator,
    config: ChallengeConfig,
    sessions: Arc<RwLock<HashMap<SessionKey, Arc<Mutex<ChallengeSession>>>>>,
    #[cfg(feature = "metrics")]
    metrics: Arc<crate::metrics::CheckInMetrics>,
}

impl ChallengeRegistry {
    pub fn new(escalator: Escalator, config: ChallengeConfig) -> Self {
        Self {
            repo: escalator.repository().clone(),
            escalator,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(crate::metrics::CheckInMetrics::new()),
        }
    }

    pub const fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    /// Start a challenge: activate the record and hand out a full attempt
    /// budget. An already open session is returned unchanged.
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        user_id: &str,
        check_in_id: &str,
        now: i64,
    ) -> Result<ChallengeSession, ConfirmationError> {
        if let Some(handle) = self.handle(user_id, check_in_id).await {
            let session = handle.lock().await.clone();
            return Ok(session);
        }

        for _ in 0..MAX_CAS_RETRIES {
            let stored = self.load(user_id, check_in_id).await?;
            let mut check_in = stored.value;
            if check_in.status.is_terminal() {
                return Err(ConfirmationError::AlreadyResolved {
                    status: check_in.status,
                });
            }
            if check_in.activate(now)?.is_applied() {
                match self.repo.replace(&check_in, stored.version).await {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let session = ChallengeSession {
                check_in_id: check_in_id.to_string(),
                user_id: user_id.to_string(),
                attempts_remaining: self.config.max_attempts,
                opened_at: now,
            };
            let handle = self
                .sessions
                .write()
                .await
                .entry(session_key(user_id, check_in_id))
                .or_insert_with(|| Arc::new(Mutex::new(session)))
                .clone();
            let session = handle.lock().await.clone();
            debug!(attempts = session.attempts_remaining, "Challenge session opened");
            return Ok(session);
        }

        Err(conflict_exhausted(check_in_id))
    }

    /// Check a submitted code.
    ///
    /// A malformed code is rejected before anything is loaded and costs no
    /// attempt. Without an open session one is opened first.
    #[instrument(skip(self, code))]
    pub async fn submit(
        &self,
        user_id: &str,
        check_in_id: &str,
        code: &str,
        now: i64,
    ) -> Result<SubmitOutcome, ConfirmationError> {
        if !ConfirmationCode::is_well_formed(code) {
            return Err(ConfirmationError::InvalidFormat);
        }

        let handle = match self.handle(user_id, check_in_id).await {
            Some(handle) => handle,
            None => {
                self.open(user_id, check_in_id, now).await?;
                self.handle(user_id, check_in_id)
                    .await
                    .ok_or_else(|| ConfirmationError::NotFound(check_in_id.to_string()))?
            }
        };
        let mut session = handle.lock().await;

        for _ in 0..MAX_CAS_RETRIES {
            let stored = match self.load(user_id, check_in_id).await {
                Ok(stored) => stored,
                Err(e @ ConfirmationError::NotFound(_)) => {
                    self.close(user_id, check_in_id).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let mut check_in = stored.value;

            if check_in.status.is_terminal() {
                self.close(user_id, check_in_id).await;
                return Err(ConfirmationError::AlreadyResolved {
                    status: check_in.status,
                });
            }

            let closed_at = check_in.confirmation_closes_at(self.config.grace_period_secs);
            if now > closed_at {
                debug!(closed_at, "Submission after confirmation window");
                return Err(ConfirmationError::WindowClosed { closed_at });
            }

            if !check_in.confirmation_code.matches(code) {
                return self.consume_attempt(&mut session, &check_in, now).await;
            }

            check_in.acknowledge(now)?;
            match self.repo.replace(&check_in, stored.version).await {
                Ok(_) => {
                    info!("Check-in acknowledged");
                    #[cfg(feature = "metrics")]
                    self.metrics.record_acknowledgement();
                    drop(session);
                    self.close(user_id, check_in_id).await;
                    return Ok(SubmitOutcome::Acknowledged { at: now });
                }
                Err(e) if e.is_conflict() => {
                    debug!("Version conflict on acknowledge, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(check_in_id))
    }

    /// End a session without resolving the check-in. Returns `true` if a
    /// session was open.
    pub async fn close(&self, user_id: &str, check_in_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .await
            .remove(&session_key(user_id, check_in_id))
            .is_some();
        if removed {
            debug!(user_id, check_in_id, "Challenge session closed");
        }
        removed
    }

    /// Snapshot of an open session.
    pub async fn session(&self, user_id: &str, check_in_id: &str) -> Option<ChallengeSession> {
        let handle = self.handle(user_id, check_in_id).await?;
        let session = handle.lock().await.clone();
        Some(session)
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn consume_attempt(
        &self,
        session: &mut ChallengeSession,
        check_in: &CheckIn,
        now: i64,
    ) -> Result<SubmitOutcome, ConfirmationError> {
        session.attempts_remaining = session.attempts_remaining.saturating_sub(1);
        if session.attempts_remaining > 0 {
            debug!(attempts_remaining = session.attempts_remaining, "Code mismatch");
            return Err(ConfirmationError::CodeMismatch {
                attempts_remaining: session.attempts_remaining,
            });
        }

        warn!(check_in_id = %check_in.id, "Attempts exhausted, escalating");
        let result = self
            .escalator
            .escalate(
                &check_in.user_id,
                &check_in.id,
                EscalationReason::AttemptsExhausted,
                now,
            )
            .await;
        let outcome = match result {
            Ok(EscalationResult::Escalated { report, .. }) => {
                Ok(SubmitOutcome::Escalated { at: now, report })
            }
            Ok(EscalationResult::Missed { .. }) => Ok(SubmitOutcome::Missed { at: now }),
            Ok(EscalationResult::AlreadyEscalated) => Err(ConfirmationError::AlreadyResolved {
                status: CheckInStatus::Escalated,
            }),
            Ok(EscalationResult::AlreadyResolved { status }) => {
                Err(ConfirmationError::AlreadyResolved { status })
            }
            Err(e) => {
                // Keep the last attempt so the next wrong code retries.
                session.attempts_remaining = 1;
                return Err(e.into());
            }
        };
        self.close(&check_in.user_id, &check_in.id).await;
        outcome
    }

    async fn handle(
        &self,
        user_id: &str,
        check_in_id: &str,
    ) -> Option<Arc<Mutex<ChallengeSession>>> {
        self.sessions
            .read()
            .await
            .get(&session_key(user_id, check_in_id))
            .cloned()
    }

    async fn load(
        &self,
        user_id: &str,
        check_in_id: &str,
    ) -> Result<Stored<CheckIn>, ConfirmationError> {
        let stored = self
            .repo
            .get(user_id, check_in_id)
            .await?
            .ok_or_else(|| ConfirmationError::NotFound(check_in_id.to_string()))?;
        if stored.value.user_id != user_id {
            return Err(ConfirmationError::NotOwner {
                caller: user_id.to_string(),
                check_in_id: check_in_id.to_string(),
            });
        }
        Ok(stored)
    }
}

fn conflict_exhausted(check_in_id: &str) -> ConfirmationError {
    ConfirmationError::Store(StoreError::Unavailable(format!(
        "gave up on {check_in_id} after {MAX_CAS_RETRIES} write conflicts"
    )))
}
