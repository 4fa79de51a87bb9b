//! Core types for strata.
//!
//! This crate provides the protocol vocabulary shared by the layer server and
//! its peers: messages, codecs, credentials and invitations.

mod codec;
mod identity;
mod invitation;
mod message;
mod token;

pub use codec::{Codec, CodecError, DecodeError, JSON_PROTOCOL, JsonCodec};
pub use identity::{Identity, IdentityParseError};
pub use invitation::{Invitation, InvitationError};
pub use message::{Message, Op, Properties, keys};
pub use token::{AuthToken, TokenError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport family named in invitations.
pub const WEBSOCKET_TRANSPORT: &str = "WebSocket";

/// An independently addressable capability channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Command and control: session bootstrap and invitations.
    Cc,
    /// Static content delivery.
    Static,
    /// Live actors (avatars).
    Actor,
    /// Dynamic objects.
    Dynamic,
    /// Environment and UI.
    Environ,
}

impl LayerKind {
    pub const ALL: [LayerKind; 5] = [
        LayerKind::Cc,
        LayerKind::Static,
        LayerKind::Actor,
        LayerKind::Dynamic,
        LayerKind::Environ,
    ];

    /// The type tag used as `service` in invitations.
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Cc => "cc",
            LayerKind::Static => "static",
            LayerKind::Actor => "actor",
            LayerKind::Dynamic => "dynamic",
            LayerKind::Environ => "environ",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = UnknownLayer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownLayer(s.to_string()))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown layer type: {0}")]
pub struct UnknownLayer(pub String);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Only the OpenSession handshake is accepted.
    Unauthenticated,
    /// Handshake succeeded; the layer processor owns dispatch.
    Authenticated,
    /// Transport gone.
    Closed,
}
