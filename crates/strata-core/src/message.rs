//! Protocol messages.
//!
//! Every frame on every layer is a [`Message`]: an operation code, an optional
//! item identifier, a flat string property map and an optional exception.
//! Requests that expect an answer are echoed back with the same `id`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Op-specific payload, flattened to strings.
pub type Properties = BTreeMap<String, String>;

/// Property keys used by the handshake and invitation messages.
pub mod keys {
    /// Credential the peer wants the server to present back.
    pub const CLIENT_AUTH: &str = "clientAuth";
    /// Service credential (bootstrap claims or a single-use invitation id).
    pub const AUTH: &str = "Auth";
    pub const SERVER_VERSION: &str = "ServerVersion";
    /// Credential minted by the server for this connection.
    pub const SERVER_AUTH: &str = "ServerAuth";
    pub const SESSION_KEY: &str = "SessionKey";
    pub const CONNECTION_KEY: &str = "ConnectionKey";
    /// Service directory for content access.
    pub const SERVICES: &str = "Services";

    pub const TRANSPORT: &str = "transport";
    pub const TRANSPORT_URL: &str = "transportURL";
    pub const PROTOCOL: &str = "protocol";
    pub const SERVICE: &str = "service";
    pub const SERVICE_AUTH: &str = "serviceAuth";

    /// Bootstrap claim: agent id.
    pub const AGENT_ID: &str = "aID";
    /// Bootstrap claim: session id.
    pub const SESSION_ID: &str = "sID";
    /// Bootstrap claim: secure session id.
    pub const SECURE_SESSION_ID: &str = "SSID";
    /// Bootstrap claim: numeric circuit code.
    pub const CIRCUIT_CODE: &str = "CC";
}

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    OpenSessionRequest,
    OpenSessionResponse,
    CloseSession,
    MakeConnection,
    AliveCheckRequest,
    AliveCheckResponse,
    CreateItemRequest,
    CreateItemResponse,
    DeleteItemRequest,
    DeleteItemResponse,
    AddItemRequest,
    AddItemResponse,
    RemoveItemRequest,
    RemoveItemResponse,
    RequestPropertiesRequest,
    RequestPropertiesResponse,
    UpdatePropertiesRequest,
    UpdatePropertiesResponse,
    /// Generic request for layer-specific extensions.
    Request,
    /// Generic response; also used for exceptions to ops without a response.
    Response,
}

impl Op {
    /// All operation codes.
    pub const ALL: [Op; 20] = [
        Op::OpenSessionRequest,
        Op::OpenSessionResponse,
        Op::CloseSession,
        Op::MakeConnection,
        Op::AliveCheckRequest,
        Op::AliveCheckResponse,
        Op::CreateItemRequest,
        Op::CreateItemResponse,
        Op::DeleteItemRequest,
        Op::DeleteItemResponse,
        Op::AddItemRequest,
        Op::AddItemResponse,
        Op::RemoveItemRequest,
        Op::RemoveItemResponse,
        Op::RequestPropertiesRequest,
        Op::RequestPropertiesResponse,
        Op::UpdatePropertiesRequest,
        Op::UpdatePropertiesResponse,
        Op::Request,
        Op::Response,
    ];

    /// The op a peer answers this request with, if any.
    pub fn response(self) -> Option<Op> {
        match self {
            Op::OpenSessionRequest => Some(Op::OpenSessionResponse),
            Op::AliveCheckRequest => Some(Op::AliveCheckResponse),
            Op::CreateItemRequest => Some(Op::CreateItemResponse),
            Op::DeleteItemRequest => Some(Op::DeleteItemResponse),
            Op::AddItemRequest => Some(Op::AddItemResponse),
            Op::RemoveItemRequest => Some(Op::RemoveItemResponse),
            Op::RequestPropertiesRequest => Some(Op::RequestPropertiesResponse),
            Op::UpdatePropertiesRequest => Some(Op::UpdatePropertiesResponse),
            Op::Request => Some(Op::Response),
            _ => None,
        }
    }

    /// Whether this op answers a request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Op::OpenSessionResponse
                | Op::AliveCheckResponse
                | Op::CreateItemResponse
                | Op::DeleteItemResponse
                | Op::AddItemResponse
                | Op::RemoveItemResponse
                | Op::RequestPropertiesResponse
                | Op::UpdatePropertiesResponse
                | Op::Response
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::OpenSessionRequest => "OpenSessionRequest",
            Op::OpenSessionResponse => "OpenSessionResponse",
            Op::CloseSession => "CloseSession",
            Op::MakeConnection => "MakeConnection",
            Op::AliveCheckRequest => "AliveCheckRequest",
            Op::AliveCheckResponse => "AliveCheckResponse",
            Op::CreateItemRequest => "CreateItemRequest",
            Op::CreateItemResponse => "CreateItemResponse",
            Op::DeleteItemRequest => "DeleteItemRequest",
            Op::DeleteItemResponse => "DeleteItemResponse",
            Op::AddItemRequest => "AddItemRequest",
            Op::AddItemResponse => "AddItemResponse",
            Op::RemoveItemRequest => "RemoveItemRequest",
            Op::RemoveItemResponse => "RemoveItemResponse",
            Op::RequestPropertiesRequest => "RequestPropertiesRequest",
            Op::RequestPropertiesResponse => "RequestPropertiesResponse",
            Op::UpdatePropertiesRequest => "UpdatePropertiesRequest",
            Op::UpdatePropertiesResponse => "UpdatePropertiesResponse",
            Op::Request => "Request",
            Op::Response => "Response",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub op: Op,
    /// Item or request identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    /// Present only on error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl Message {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            id: None,
            properties: Properties::new(),
            exception: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a property; numbers and booleans go through their `Display` form.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn with_props(mut self, props: Properties) -> Self {
        self.properties.extend(props);
        self
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse a property back into a typed value. `None` if absent or malformed.
    pub fn prop_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.prop(key).and_then(|v| v.parse().ok())
    }

    /// An empty answer to this message, echoing its id.
    ///
    /// Ops without a dedicated response are answered with [`Op::Response`].
    pub fn response(&self) -> Message {
        Message {
            op: self.op.response().unwrap_or(Op::Response),
            id: self.id.clone(),
            properties: Properties::new(),
            exception: None,
        }
    }

    /// An exception answer to this message, echoing its id.
    pub fn exception(&self, reason: impl Into<String>) -> Message {
        let mut reply = self.response();
        reply.exception = Some(reason.into());
        reply
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }
}
