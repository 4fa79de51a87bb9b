//! Peer identity.
//!
//! Identity format: `agent@session`
//!
//! The agent part names who is connected, the session part names the login
//! that vouched for them. Both are opaque to this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An identity in the form `agent@session`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    agent: String,
    session: String,
}

impl Identity {
    /// Create a new identity.
    pub fn new(agent: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            session: session.into(),
        }
    }

    /// The agent id.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// The session id the agent logged in with.
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.agent, self.session)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, session) = s
            .split_once('@')
            .ok_or_else(|| IdentityParseError::MissingSeparator(s.to_string()))?;

        if agent.is_empty() {
            return Err(IdentityParseError::EmptyAgent);
        }

        Ok(Self {
            agent: agent.to_string(),
            session: session.to_string(),
        })
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.to_string()
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity must contain '@' separator, got: {0}")]
    MissingSeparator(String),
    #[error("identity agent cannot be empty")]
    EmptyAgent,
}
