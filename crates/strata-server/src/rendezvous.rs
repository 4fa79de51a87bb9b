//! Pending invitations awaiting their invited handshake.
//!
//! A layer that invites a peer to another layer records a [`WaitingInfo`]
//! keyed by a freshly minted single-use credential. The invited handshake
//! claims it by that credential, which removes it. Entries that nobody claims
//! expire after the registry's TTL.

use crate::connection::Connection;
use crate::error::{HandshakeError, LayerError};
use crate::layers::LayerInstance;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{AuthToken, Identity, LayerKind};
use tracing::debug;

/// Builds the layer instance once the invited handshake matches.
pub type LayerConstructor =
    Box<dyn FnOnce(Connection, Identity) -> Result<Arc<dyn LayerInstance>, LayerError> + Send>;

pub struct WaitingInfo {
    pub credential: String,
    pub created: Instant,
    /// The peer the invitation was issued to.
    pub identity: Identity,
    /// The layer being offered.
    pub layer: LayerKind,
    /// Connection key of the session that issued the invitation.
    pub issuer: String,
    pub constructor: LayerConstructor,
}

impl fmt::Debug for WaitingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingInfo")
            .field("identity", &self.identity)
            .field("layer", &self.layer)
            .field("issuer", &self.issuer)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Registry of pending invitations. Every access goes through one lock that
/// is never held across an await.
pub struct Rendezvous {
    entries: Mutex<HashMap<String, WaitingInfo>>,
    ttl: Duration,
}

impl Rendezvous {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record an invitation and return its credential, unique among pending
    /// entries.
    pub fn issue(
        &self,
        identity: Identity,
        layer: LayerKind,
        issuer: &str,
        constructor: LayerConstructor,
    ) -> String {
        let mut entries = self.entries.lock();
        let credential = loop {
            let candidate = AuthToken::mint().token().to_string();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        debug!(agent = %identity, layer = %layer, "invitation issued");
        entries.insert(
            credential.clone(),
            WaitingInfo {
                credential: credential.clone(),
                created: Instant::now(),
                identity,
                layer,
                issuer: issuer.to_string(),
                constructor,
            },
        );
        credential
    }

    /// Consume the invitation for `credential` on behalf of a handshake
    /// arriving at `layer`.
    ///
    /// Unknown and expired credentials are both "unknown id". A credential
    /// presented to the wrong layer is refused but stays claimable.
    pub fn claim(&self, credential: &str, layer: LayerKind) -> Result<WaitingInfo, HandshakeError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(credential) else {
            return Err(HandshakeError::UnknownId);
        };
        if entry.created.elapsed() >= self.ttl {
            entries.remove(credential);
            debug!(layer = %layer, "expired invitation presented");
            return Err(HandshakeError::UnknownId);
        }
        if entry.layer != layer {
            debug!(offered = %entry.layer, presented = %layer, "invitation presented to wrong layer");
            return Err(HandshakeError::UnknownId);
        }
        entries.remove(credential).ok_or(HandshakeError::UnknownId)
    }

    pub fn revoke(&self, credential: &str) -> bool {
        self.entries.lock().remove(credential).is_some()
    }

    /// Drop every invitation issued by one session.
    pub fn revoke_issuer(&self, issuer: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.issuer != issuer);
        before - entries.len()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.created.elapsed() < ttl);
        before - entries.len()
    }

    /// Drop every pending invitation.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn contains(&self, credential: &str) -> bool {
        self.entries.lock().contains_key(credential)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
