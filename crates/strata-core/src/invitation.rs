//! Invitation types for opening side-channel connections.

use crate::message::{Message, Op, keys};

/// A MakeConnection directive, telling the peer to open a new connection to
/// another layer and present `service_auth` in its OpenSessionRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Transport family (e.g. `WebSocket`).
    pub transport: String,
    /// Where to connect.
    pub transport_url: String,
    /// Codec spoken on the new connection.
    pub protocol: String,
    /// Layer type tag being offered.
    pub service: String,
    /// Single-use credential for the new connection.
    pub service_auth: String,
}

impl Invitation {
    pub fn to_message(&self) -> Message {
        Message::new(Op::MakeConnection)
            .with_prop(keys::TRANSPORT, &self.transport)
            .with_prop(keys::TRANSPORT_URL, &self.transport_url)
            .with_prop(keys::PROTOCOL, &self.protocol)
            .with_prop(keys::SERVICE, &self.service)
            .with_prop(keys::SERVICE_AUTH, &self.service_auth)
    }

    pub fn from_message(msg: &Message) -> Result<Self, InvitationError> {
        if msg.op != Op::MakeConnection {
            return Err(InvitationError::WrongOp(msg.op));
        }
        let field = |key: &'static str| {
            msg.prop(key)
                .map(str::to_string)
                .ok_or(InvitationError::MissingProperty(key))
        };
        Ok(Self {
            transport: field(keys::TRANSPORT)?,
            transport_url: field(keys::TRANSPORT_URL)?,
            protocol: field(keys::PROTOCOL)?,
            service: field(keys::SERVICE)?,
            service_auth: field(keys::SERVICE_AUTH)?,
        })
    }
}

/// Error reading an invitation out of a message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvitationError {
    #[error("expected MakeConnection, got {0}")]
    WrongOp(Op),
    #[error("MakeConnection is missing '{0}'")]
    MissingProperty(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Invitation {
        Invitation {
            transport: "WebSocket".into(),
            transport_url: "ws://127.0.0.1:9001/static".into(),
            protocol: "strata-json".into(),
            service: "static".into(),
            service_auth: "c0ffee".into(),
        }
    }

    #[test]
    fn message_carries_all_fields() {
        let msg = sample().to_message();
        assert_eq!(msg.op, Op::MakeConnection);
        assert_eq!(msg.prop(keys::SERVICE_AUTH), Some("c0ffee"));
        assert_eq!(Invitation::from_message(&msg).unwrap(), sample());
    }

    #[test]
    fn missing_field_is_named() {
        let mut msg = sample().to_message();
        msg.properties.remove(keys::TRANSPORT_URL);
        let err = Invitation::from_message(&msg).unwrap_err();
        assert!(err.to_string().contains("transportURL"));
    }
}
