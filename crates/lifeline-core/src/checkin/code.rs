//! Four-digit confirmation code.

use std::fmt;

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Returned when a candidate string is not exactly four ASCII digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("confirmation code must be exactly {} ASCII digits", ConfirmationCode::LEN)]
pub struct CodeFormatError;

/// The code a user enters to prove they are safe.
///
/// Always exactly [`ConfirmationCode::LEN`] ASCII digits. Input is never
/// stripped, truncated or padded: anything else is rejected outright.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfirmationCode(String);

impl ConfirmationCode {
    pub const LEN: usize = 4;

    /// Parse a user-supplied code.
    pub fn parse(candidate: &str) -> Result<Self, CodeFormatError> {
        if Self::is_well_formed(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(CodeFormatError)
        }
    }

    /// Generate a uniformly random code, zero-padded (`"0042"` is valid).
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let n: u16 = rng.random_range(0..10_000);
        Self(format!("{n:04}"))
    }

    /// Check the shape of a candidate without allocating.
    pub fn is_well_formed(candidate: &str) -> bool {
        candidate.len() == Self::LEN && candidate.bytes().all(|b| b.is_ascii_digit())
    }

    /// Exact string comparison against a candidate.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConfirmationCode {
    type Error = CodeFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_well_formed(&value) {
            Ok(Self(value))
        } else {
            Err(CodeFormatError)
        }
    }
}

impl From<ConfirmationCode> for String {
    fn from(code: ConfirmationCode) -> Self {
        code.0
    }
}

// Keep codes out of logs.
impl fmt::Debug for ConfirmationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfirmationCode(****)")
    }
}
