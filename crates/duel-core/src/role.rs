//! The two sides of a round, and which end of the channel a peer sits on.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid role: expected \"A\" or \"B\", got {0:?}")]
pub struct ParseRoleError(String);

/// One of the two fixed sides of a round.
///
/// A peer votes for the *other* role; it can never score for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    A,
    B,
}

impl Role {
    /// The other role.
    pub fn complement(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Which end of the channel this peer holds.
///
/// The initiator is the host: it assigns roles and pushes snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    Initiator,
    Answerer,
}

impl Orientation {
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// The role pairing carried by `assignRoles` and optionally by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePair {
    pub host_role: Role,
    pub guest_role: Role,
}

impl RolePair {
    /// Build a pairing from the host's role. The guest always gets the complement.
    pub fn from_host(host_role: Role) -> Self {
        Self {
            host_role,
            guest_role: host_role.complement(),
        }
    }

    /// The role this pairing gives to a peer with the given orientation.
    pub fn role_for(&self, orientation: Orientation) -> Role {
        match orientation {
            Orientation::Initiator => self.host_role,
            Orientation::Answerer => self.guest_role,
        }
    }

    /// A pairing is only meaningful when the two roles differ.
    pub fn is_complementary(&self) -> bool {
        self.host_role.complement() == self.guest_role
    }
}
