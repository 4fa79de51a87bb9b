//! Authentication credentials.
//!
//! A credential is an opaque string. It may carry structured claims, in which
//! case its wire form is a JSON object: the claims as string members, plus
//! the reserved `jti` (token id) and `exp` (expiry, unix seconds) members.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const TOKEN_ID: &str = "jti";
const EXPIRES: &str = "exp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    token: String,
    created: SystemTime,
    expires: Option<SystemTime>,
    claims: BTreeMap<String, String>,
}

impl AuthToken {
    /// Mint a fresh random credential.
    pub fn mint() -> Self {
        Self::opaque(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing credential string with no claims.
    pub fn opaque(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            created: SystemTime::now(),
            expires: None,
            claims: BTreeMap::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.claims.insert(key.into(), value.to_string());
        self
    }

    pub fn expires_after(mut self, ttl: Duration) -> Self {
        self.expires = Some(self.created + ttl);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn claims(&self) -> &BTreeMap<String, String> {
        &self.claims
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|exp| now >= exp)
    }

    /// The string form sent on the wire.
    pub fn to_wire(&self) -> String {
        if self.claims.is_empty() && self.expires.is_none() {
            return self.token.clone();
        }
        let mut object = serde_json::Map::new();
        for (k, v) in &self.claims {
            object.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        object.insert(TOKEN_ID.into(), serde_json::Value::String(self.token.clone()));
        if let Some(exp) = self.expires {
            let secs = exp.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            object.insert(EXPIRES.into(), serde_json::Value::from(secs));
        }
        serde_json::Value::Object(object).to_string()
    }

    /// Parse a credential received from a peer.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TokenError::Empty);
        }
        if !trimmed.starts_with('{') {
            return Ok(Self::opaque(trimmed));
        }

        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(trimmed).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let mut token = Self::opaque(trimmed);
        for (key, value) in object {
            match (key.as_str(), value) {
                (TOKEN_ID, serde_json::Value::String(id)) => token.token = id,
                (EXPIRES, serde_json::Value::Number(n)) => {
                    let secs = n
                        .as_u64()
                        .ok_or_else(|| TokenError::Malformed("exp must be unix seconds".into()))?;
                    token.expires = Some(UNIX_EPOCH + Duration::from_secs(secs));
                }
                (EXPIRES, _) => {
                    return Err(TokenError::Malformed("exp must be unix seconds".into()));
                }
                (_, serde_json::Value::String(s)) => {
                    token.claims.insert(key, s);
                }
                (_, serde_json::Value::Null) => {}
                (_, other) => {
                    token.claims.insert(key, other.to_string());
                }
            }
        }
        Ok(token)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("credential is empty")]
    Empty,
    #[error("malformed credential: {0}")]
    Malformed(String),
}
