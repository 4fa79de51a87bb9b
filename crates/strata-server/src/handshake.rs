//! Session establishment shared by every layer.
//!
//! The command layer authenticates peers against their login circuit
//! (bootstrap). Every other layer authenticates by the single-use credential
//! of an invitation previously sent over an authenticated session.

use crate::circuit::CircuitAuthority;
use crate::connection::{AuthPair, Connection, Dispatch, MessageProcessor};
use crate::error::{HandshakeError, LayerError, SessionError};
use crate::hub::Shared;
use crate::layers;
use std::sync::Arc;
use std::time::SystemTime;
use strata_core::{
    AuthToken, Identity, Invitation, LayerKind, Message, Op, WEBSOCKET_TRANSPORT, keys,
};
use tracing::{info, warn};

/// Check a bootstrap credential's claims against the agent's circuit.
pub fn validate_bootstrap(
    circuits: &dyn CircuitAuthority,
    raw: &str,
) -> Result<Identity, HandshakeError> {
    let token = AuthToken::parse(raw)?;
    if token.is_expired(SystemTime::now()) {
        return Err(HandshakeError::Expired);
    }
    let claim = |key: &'static str| token.claim(key).ok_or(HandshakeError::MissingClaim(key));
    let agent = claim(keys::AGENT_ID)?;
    let session = claim(keys::SESSION_ID)?;
    let secure_session = claim(keys::SECURE_SESSION_ID)?;
    let code = claim(keys::CIRCUIT_CODE)?;

    let circuit = circuits.circuit(agent).ok_or(HandshakeError::NoCircuit)?;
    if circuit.session_id != session {
        return Err(HandshakeError::SessionMismatch);
    }
    if circuit.secure_session_id != secure_session {
        return Err(HandshakeError::SecureSessionMismatch);
    }
    if code.trim().parse::<u32>() != Ok(circuit.circuit_code) {
        return Err(HandshakeError::CircuitCodeMismatch);
    }
    Ok(Identity::new(agent, session))
}

/// The OpenSessionResponse for a freshly authenticated connection.
pub fn open_reply(shared: &Shared, conn: &Connection, identity: &Identity, auth: &AuthPair) -> Message {
    let mut reply = Message::new(Op::OpenSessionResponse)
        .with_prop(keys::SERVER_VERSION, &shared.config.server_version)
        .with_prop(keys::SERVER_AUTH, &auth.presented)
        .with_prop(keys::SESSION_KEY, identity.session())
        .with_prop(keys::CONNECTION_KEY, conn.key());
    if !shared.config.services.is_empty() {
        if let Ok(services) = serde_json::to_string(&shared.config.services) {
            reply = reply.with_prop(keys::SERVICES, services);
        }
    }
    reply
}

/// Dispatch for a connection that has not completed the handshake.
pub struct HandshakeProcessor {
    kind: LayerKind,
    shared: Arc<Shared>,
}

impl HandshakeProcessor {
    pub fn new(kind: LayerKind, shared: Arc<Shared>) -> Self {
        Self { kind, shared }
    }
}

impl MessageProcessor for HandshakeProcessor {
    fn process(&mut self, conn: &Connection, msg: &Message) -> Result<Dispatch, SessionError> {
        if msg.op != Op::OpenSessionRequest {
            return Err(SessionError::NotOpen);
        }
        let client_auth = msg
            .prop(keys::CLIENT_AUTH)
            .filter(|v| !v.is_empty())
            .ok_or(HandshakeError::MissingClientAuth)?;
        let auth = msg
            .prop(keys::AUTH)
            .filter(|v| !v.is_empty())
            .ok_or(HandshakeError::MissingAuth)?;

        let instance = match self.kind {
            LayerKind::Cc => {
                let identity = validate_bootstrap(self.shared.circuits.as_ref(), auth)?;
                layers::build(LayerKind::Cc, self.shared.clone(), conn.clone(), identity)?
            }
            kind => {
                let waiting = self.shared.rendezvous.claim(auth, kind)?;
                conn.record_issuer(waiting.issuer);
                (waiting.constructor)(conn.clone(), waiting.identity)?
            }
        };

        let identity = instance.identity().clone();
        let pair = AuthPair {
            accepted: client_auth.to_string(),
            presented: AuthToken::mint().to_wire(),
        };
        conn.authenticate(identity.clone(), pair.clone())?;
        Ok(Dispatch::Open {
            reply: open_reply(&self.shared, conn, &identity, &pair),
            instance,
        })
    }
}

/// Invite the peer of `conn` to open a session on `kind`.
///
/// Resolves once the MakeConnection message is on the wire. The pending
/// invitation is revoked when it cannot be transmitted.
pub async fn invite(
    shared: &Arc<Shared>,
    conn: &Connection,
    identity: &Identity,
    kind: LayerKind,
) -> Result<(), SessionError> {
    let url = shared
        .listener_url(kind)
        .ok_or_else(|| LayerError::NotFound(format!("{kind} layer")))?;
    let credential =
        shared
            .rendezvous
            .issue(identity.clone(), kind, conn.key(), shared.constructor(kind));
    let invitation = Invitation {
        transport: WEBSOCKET_TRANSPORT.to_string(),
        transport_url: url,
        protocol: shared.codec.name().to_string(),
        service: kind.as_str().to_string(),
        service_auth: credential.clone(),
    };
    match conn.make_connection(&invitation).await {
        Ok(()) => {
            info!(agent = %identity, layer = %kind, "peer invited");
            Ok(())
        }
        Err(e) => {
            shared.rendezvous.revoke(&credential);
            warn!(agent = %identity, layer = %kind, error = %e, "invitation not transmitted");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, MemoryCircuits};

    fn circuits() -> MemoryCircuits {
        let circuits = MemoryCircuits::new();
        circuits.add(Circuit {
            agent_id: "alice".into(),
            session_id: "s1".into(),
            secure_session_id: "secret".into(),
            circuit_code: 42,
        });
        circuits
    }

    fn credential(agent: &str, session: &str, secure: &str, code: &str) -> String {
        AuthToken::mint()
            .with_claim(keys::AGENT_ID, agent)
            .with_claim(keys::SESSION_ID, session)
            .with_claim(keys::SECURE_SESSION_ID, secure)
            .with_claim(keys::CIRCUIT_CODE, code)
            .to_wire()
    }

    #[test]
    fn matching_claims_yield_identity() {
        let identity =
            validate_bootstrap(&circuits(), &credential("alice", "s1", "secret", "42")).unwrap();
        assert_eq!(identity, Identity::new("alice", "s1"));
    }

    #[test]
    fn each_mismatched_claim_is_rejected() {
        let c = circuits();
        let cases = [
            (credential("mallory", "s1", "secret", "42"), HandshakeError::NoCircuit),
            (credential("alice", "s2", "secret", "42"), HandshakeError::SessionMismatch),
            (credential("alice", "s1", "guess", "42"), HandshakeError::SecureSessionMismatch),
            (credential("alice", "s1", "secret", "43"), HandshakeError::CircuitCodeMismatch),
            (credential("alice", "s1", "secret", "x"), HandshakeError::CircuitCodeMismatch),
        ];
        for (raw, expected) in cases {
            assert_eq!(validate_bootstrap(&c, &raw).unwrap_err(), expected);
        }
    }

    #[test]
    fn incomplete_or_broken_credentials_are_rejected() {
        let c = circuits();
        let partial = AuthToken::mint()
            .with_claim(keys::AGENT_ID, "alice")
            .to_wire();
        assert_eq!(
            validate_bootstrap(&c, &partial).unwrap_err(),
            HandshakeError::MissingClaim(keys::SESSION_ID)
        );
        assert_eq!(
            validate_bootstrap(&c, "{not json").unwrap_err(),
            HandshakeError::MalformedCredential
        );
        assert_eq!(
            validate_bootstrap(&c, "opaque-token").unwrap_err(),
            HandshakeError::MissingClaim(keys::AGENT_ID)
        );
    }

    #[test]
    fn expired_credentials_are_rejected() {
        let raw = r#"{"aID":"alice","sID":"s1","SSID":"secret","CC":"42","exp":1}"#;
        assert_eq!(
            validate_bootstrap(&circuits(), raw).unwrap_err(),
            HandshakeError::Expired
        );
    }
}
