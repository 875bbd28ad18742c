//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest identifier accepted from callers.
pub const MAX_ID_LEN: usize = 128;

/// Identifier of a job. Either caller-supplied at enqueue or a UUIDv7 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identity of one worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

/// Opaque token proving ownership of a claim. Replaced on every claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(String);

macro_rules! impl_string_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap an already validated raw value (e.g. read back from storage).
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate_id(s).map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_id!(JobId, "JobId");
impl_string_id!(WorkerId, "WorkerId");
impl_string_id!(ClaimToken, "ClaimToken");

impl JobId {
    /// Generate a time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl WorkerId {
    /// Generate an identity for the `index`-th worker of this process.
    pub fn generate(index: usize) -> Self {
        let suffix = Uuid::now_v7().simple().to_string();
        Self(format!(
            "worker-{}-{}-{}",
            std::process::id(),
            index,
            &suffix[suffix.len() - 8..]
        ))
    }
}

impl ClaimToken {
    /// A fresh random token; never reused across claims.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

fn validate_id(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("must not be empty");
    }
    if s.len() > MAX_ID_LEN {
        return Err("too long");
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("must not contain whitespace or control characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
        assert_ne!(ClaimToken::generate(), ClaimToken::generate());
        assert_ne!(WorkerId::generate(0), WorkerId::generate(0));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("job-1".parse::<JobId>().is_ok());
        assert!("".parse::<JobId>().is_err());
        assert!("has space".parse::<JobId>().is_err());
        assert!("x".repeat(MAX_ID_LEN + 1).parse::<JobId>().is_err());
    }
}
