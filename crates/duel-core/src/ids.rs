//! Identifiers for rounds and sessions.
//!
//! Round ids are 128-bit random tokens rendered as 32 lowercase hex chars.
//! Ids received from a peer are accepted as opaque tokens, so anything
//! non-empty and free of whitespace parses.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest id we accept from the wire or the store.
pub const MAX_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Id cannot be empty")]
    Empty,
    #[error("Id is longer than {MAX_ID_LEN} characters")]
    TooLong,
    #[error("Id contains whitespace or control characters")]
    InvalidChar,
}

fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdError::InvalidChar);
    }
    Ok(())
}

/// Identity of a single round. Generated once by the peer that starts it.
///
/// # Examples
/// ```
/// use duel_core::RoundId;
///
/// let id = RoundId::generate();
/// assert_eq!(id.as_str().len(), 32);
///
/// let parsed: RoundId = "r1".parse().unwrap();
/// assert_eq!(parsed.as_str(), "r1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(String);

impl RoundId {
    /// Generate a new random round id.
    ///
    /// Uses the thread-local CSPRNG. Never returns the all-zero token.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u128 = rand::rng().random();
            if id != 0 {
                return Self(format!("{id:032x}"));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of one host/guest role pairing. A new one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id {
    ($ty:ident) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate(s)?;
                Ok(Self(s.to_string()))
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_id!(RoundId);
string_id!(SessionId);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_format() {
        let id = RoundId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id.as_str(), "0".repeat(32));
    }

    #[test]
    fn test_generate_never_collides() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(RoundId::generate()), "round id collision");
        }
    }

    #[test]
    fn test_session_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_parse_opaque_tokens() {
        assert_eq!("r1".parse::<RoundId>().unwrap().as_str(), "r1");
        assert_eq!("abc-123_x".parse::<SessionId>().unwrap().as_str(), "abc-123_x");
    }

    #[test]
    fn test_reject_invalid() {
        assert_eq!("".parse::<RoundId>(), Err(IdError::Empty));
        assert_eq!("a b".parse::<RoundId>(), Err(IdError::InvalidChar));
        assert_eq!("x".repeat(MAX_ID_LEN + 1).parse::<RoundId>(), Err(IdError::TooLong));
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = RoundId::generate();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{original}\""));
        let parsed: RoundId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        assert!(serde_json::from_str::<SessionId>("\"\"").is_err());
    }
}
