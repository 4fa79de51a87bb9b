use crate::scene::SceneError;
use strata_core::{CodecError, LayerKind, Op, TokenError};
use thiserror::Error;

/// Reason sent to peers for faults whose detail stays server-side.
pub const INTERNAL_REASON: &str = "internal error";

/// Errors raised by a transport's wire pumps.
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport was closed before the operation completed.
    #[error("transport closed")]
    Closed,
}

/// Errors that stop a layer or the whole server from starting.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A layer listener could not bind its configured address.
    #[error("cannot bind {layer} layer to {addr}: {source}")]
    Bind {
        layer: LayerKind,
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Authentication faults. The display text is the reason sent to the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing clientAuth")]
    MissingClientAuth,
    #[error("missing Auth")]
    MissingAuth,
    #[error("malformed credential")]
    MalformedCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential is missing claim {0}")]
    MissingClaim(&'static str),
    #[error("no circuit for agent")]
    NoCircuit,
    #[error("session id mismatch")]
    SessionMismatch,
    #[error("secure session id mismatch")]
    SecureSessionMismatch,
    #[error("circuit code mismatch")]
    CircuitCodeMismatch,
    #[error("unknown id")]
    UnknownId,
}

impl From<TokenError> for HandshakeError {
    fn from(_: TokenError) -> Self {
        HandshakeError::MalformedCredential
    }
}

/// Faults raised by a layer's operational handlers.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("{layer} layer does not handle {op}")]
    Unhandled { layer: LayerKind, op: Op },
    #[error("unauthorized {0}")]
    Unauthorized(&'static str),
    #[error("no such item: {0}")]
    NotFound(String),
    #[error("{op} requires an item id")]
    MissingId { op: Op },
    #[error("bad property {key}: {reason}")]
    BadProperty { key: String, reason: String },
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Everything that can go wrong while serving one connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is not open")]
    NotOpen,
    #[error("session already open")]
    AlreadyOpen,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("request {0} timed out")]
    Timeout(String),
    #[error("request {0} already in flight")]
    RequestInFlight(String),
    #[error("request has no id")]
    MissingId,
    /// The peer answered a request with an exception.
    #[error("peer exception: {0}")]
    Remote(String),
    #[error("handler panicked")]
    Panicked,
}

impl SessionError {
    /// The reason string sent to the peer in an exception response.
    ///
    /// Authentication and operational faults carry their designed reason;
    /// local faults are reported generically.
    pub fn peer_reason(&self) -> String {
        match self {
            SessionError::NotOpen
            | SessionError::AlreadyOpen
            | SessionError::Handshake(_)
            | SessionError::Layer(_)
            | SessionError::MissingId => self.to_string(),
            SessionError::Transport(_)
            | SessionError::Codec(_)
            | SessionError::Timeout(_)
            | SessionError::RequestInFlight(_)
            | SessionError::Remote(_)
            | SessionError::Panicked => INTERNAL_REASON.to_string(),
        }
    }
}
