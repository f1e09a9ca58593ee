//! Connection roles.
//!
//! The string forms must match what clients send in `register` payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const ROLE_CLIENT: &str = "client";
pub const ROLE_CONTRACTOR: &str = "contractor";
pub const ROLE_ADMIN: &str = "admin";

/// Role a connection registers as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Contractor,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Client, Role::Contractor, Role::Admin];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => ROLE_CLIENT,
            Role::Contractor => ROLE_CONTRACTOR,
            Role::Admin => ROLE_ADMIN,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ROLE_CLIENT => Ok(Role::Client),
            ROLE_CONTRACTOR => Ok(Role::Contractor),
            ROLE_ADMIN => Ok(Role::Admin),
            other => Err(CoreError::Validation(format!("Unknown role '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_is_validation_error() {
        assert!(matches!(
            "dispatcher".parse::<Role>(),
            Err(CoreError::Validation(_))
        ));
    }
}
