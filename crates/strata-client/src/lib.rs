//! Peer-side library for strata layer servers.
//!
//! A peer connects to the command layer, opens a session with its bootstrap
//! credential, and then follows the MakeConnection invitations it receives to
//! the other layers:
//!
//! ```no_run
//! # async fn demo() -> Result<(), strata_client::ClientError> {
//! use strata_client::{Client, bootstrap_credential};
//!
//! let mut cc = Client::connect("ws://127.0.0.1:9000/cc").await?;
//! cc.open_session(&bootstrap_credential("alice", "s1", "secret", 42)).await?;
//! let invitation = cc.next_invitation().await?;
//! let (mut layer, _info) = Client::accept_invitation(&invitation).await?;
//! let first = layer.recv().await?;
//! # Ok(())
//! # }
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use strata_core::{
    AuthToken, Codec, CodecError, DecodeError, Invitation, InvitationError, JsonCodec, Message,
    Op, WEBSOCKET_TRANSPORT, keys,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Invitation(#[from] InvitationError),
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("unexpected {0} in reply")]
    UnexpectedReply(Op),
    #[error("unsupported transport {0}")]
    UnsupportedTransport(String),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// What the server reported when the session opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub server_version: String,
    /// Credential the server minted for this connection.
    pub server_auth: String,
    pub session_key: String,
    pub connection_key: String,
    pub services: BTreeMap<String, String>,
}

/// A bootstrap credential carrying the claims of a login circuit.
pub fn bootstrap_credential(agent: &str, session: &str, secure_session: &str, code: u32) -> String {
    AuthToken::mint()
        .with_claim(keys::AGENT_ID, agent)
        .with_claim(keys::SESSION_ID, session)
        .with_claim(keys::SECURE_SESSION_ID, secure_session)
        .with_claim(keys::CIRCUIT_CODE, code)
        .to_wire()
}

/// One connection to one layer.
///
/// Messages read while waiting for something specific are kept and returned
/// by later reads in arrival order. AliveCheck requests are answered
/// automatically.
pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: JsonCodec,
    backlog: VecDeque<Message>,
    next_id: u64,
    timeout: Duration,
    client_auth: String,
}

impl Client {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        debug!(url, "connected");
        Ok(Self {
            ws,
            codec: JsonCodec,
            backlog: VecDeque::new(),
            next_id: 1,
            timeout: DEFAULT_TIMEOUT,
            client_auth: AuthToken::mint().to_wire(),
        })
    }

    /// Follow an invitation: connect to the offered layer and open a session
    /// with its single-use credential.
    pub async fn accept_invitation(
        invitation: &Invitation,
    ) -> Result<(Client, SessionInfo), ClientError> {
        if invitation.transport != WEBSOCKET_TRANSPORT {
            return Err(ClientError::UnsupportedTransport(invitation.transport.clone()));
        }
        let mut client = Client::connect(&invitation.transport_url).await?;
        let info = client.open_session(&invitation.service_auth).await?;
        Ok((client, info))
    }

    /// How long reads wait before giving up.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The credential this client asks the server to present back.
    pub fn client_auth(&self) -> &str {
        &self.client_auth
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        let text = String::from_utf8_lossy(&self.codec.encode(msg)?).into_owned();
        self.ws.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Send raw text, bypassing the codec.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.ws.send(WsMessage::Text(text.to_string().into())).await?;
        Ok(())
    }

    /// The next message, backlog first.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        match self.backlog.pop_front() {
            Some(msg) => Ok(msg),
            None => self.read_wire().await,
        }
    }

    /// The first message matching `pred`; others are kept for later reads.
    pub async fn wait_for(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> Result<Message, ClientError> {
        if let Some(i) = self.backlog.iter().position(&pred) {
            if let Some(msg) = self.backlog.remove(i) {
                return Ok(msg);
            }
        }
        loop {
            let msg = self.read_wire().await?;
            if pred(&msg) {
                return Ok(msg);
            }
            self.backlog.push_back(msg);
        }
    }

    /// Send a request and wait for the answer bearing its id. Exception
    /// answers are returned as-is.
    pub async fn request(&mut self, mut msg: Message) -> Result<Message, ClientError> {
        let id = match &msg.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("c{}", self.next_id);
                self.next_id += 1;
                msg.id = Some(id.clone());
                id
            }
        };
        let expected = msg.op.response().unwrap_or(Op::Response);
        self.send(&msg).await?;
        self.wait_for(|m| {
            m.id.as_deref() == Some(id.as_str()) && (m.op == expected || m.op == Op::Response)
        })
        .await
    }

    /// Perform the OpenSession handshake with `auth` as service credential.
    pub async fn open_session(&mut self, auth: &str) -> Result<SessionInfo, ClientError> {
        let request = Message::new(Op::OpenSessionRequest)
            .with_prop(keys::CLIENT_AUTH, &self.client_auth)
            .with_prop(keys::AUTH, auth);
        let reply = self.request(request).await?;
        if let Some(reason) = &reply.exception {
            return Err(ClientError::Rejected(reason.clone()));
        }
        if reply.op != Op::OpenSessionResponse {
            return Err(ClientError::UnexpectedReply(reply.op));
        }
        let field = |key: &str| reply.prop(key).unwrap_or_default().to_string();
        let services = reply
            .prop(keys::SERVICES)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Ok(SessionInfo {
            server_version: field(keys::SERVER_VERSION),
            server_auth: field(keys::SERVER_AUTH),
            session_key: field(keys::SESSION_KEY),
            connection_key: field(keys::CONNECTION_KEY),
            services,
        })
    }

    /// The next MakeConnection invitation.
    pub async fn next_invitation(&mut self) -> Result<Invitation, ClientError> {
        let msg = self.wait_for(|m| m.op == Op::MakeConnection).await?;
        Ok(Invitation::from_message(&msg)?)
    }

    /// The next invitation to the layer tagged `service`.
    pub async fn invitation_for(&mut self, service: &str) -> Result<Invitation, ClientError> {
        let msg = self
            .wait_for(|m| m.op == Op::MakeConnection && m.prop(keys::SERVICE) == Some(service))
            .await?;
        Ok(Invitation::from_message(&msg)?)
    }

    /// End the session and close the socket.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.send(&Message::new(Op::CloseSession)).await?;
        match self.ws.close(None).await {
            Ok(())
            | Err(WsError::ConnectionClosed)
            | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_wire(&mut self) -> Result<Message, ClientError> {
        loop {
            let frame = tokio::time::timeout(self.timeout, self.ws.next())
                .await
                .map_err(|_| ClientError::Timeout)?;
            let bytes = match frame {
                Some(Ok(WsMessage::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(WsMessage::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            let msg = self.codec.decode(&bytes)?;
            if msg.op == Op::AliveCheckRequest {
                self.send(&msg.response()).await?;
                continue;
            }
            return Ok(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A one-connection server answering the handshake and then pushing a
    /// content message, an alive check and an invitation.
    async fn scripted_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let codec = JsonCodec;
            let send = |msg: Message| {
                let text = String::from_utf8(codec.encode(&msg).unwrap()).unwrap();
                WsMessage::Text(text.into())
            };

            let open = ws.next().await.unwrap().unwrap();
            let open = codec.decode(open.into_text().unwrap().as_bytes()).unwrap();
            let reply = open
                .response()
                .with_prop(keys::SERVER_VERSION, "test")
                .with_prop(keys::SERVER_AUTH, "minted")
                .with_prop(keys::SERVICES, r#"{"assets":"http://a/"}"#);
            ws.send(send(Message::new(Op::CreateItemRequest).with_id("early"))).await.unwrap();
            ws.send(send(reply)).await.unwrap();
            ws.send(send(Message::new(Op::AliveCheckRequest).with_id("ping"))).await.unwrap();
            let invitation = Invitation {
                transport: WEBSOCKET_TRANSPORT.into(),
                transport_url: "ws://127.0.0.1:1/static".into(),
                protocol: "strata-json".into(),
                service: "static".into(),
                service_auth: "single-use".into(),
            };
            ws.send(send(invitation.to_message())).await.unwrap();

            let pong = ws.next().await.unwrap().unwrap();
            let pong = codec.decode(pong.into_text().unwrap().as_bytes()).unwrap();
            assert_eq!(pong.op, Op::AliveCheckResponse);
            ws.send(send(Message::new(Op::Response).with_id("done"))).await.unwrap();
            let _ = ws.next().await;
        });
        format!("ws://{addr}/cc")
    }

    #[tokio::test]
    async fn handshake_invitation_and_backlog() {
        let url = scripted_server().await;
        let mut client = Client::connect(&url).await.unwrap();

        let info = client.open_session("credential").await.unwrap();
        assert_eq!(info.server_version, "test");
        assert_eq!(info.server_auth, "minted");
        assert_eq!(info.services["assets"], "http://a/");

        let invitation = client.next_invitation().await.unwrap();
        assert_eq!(invitation.service, "static");
        assert_eq!(invitation.service_auth, "single-use");

        // Skipped while waiting for the handshake answer.
        let early = client.recv().await.unwrap();
        assert_eq!(early.id.as_deref(), Some("early"));

        // The alive check was answered without surfacing.
        let done = client.recv().await.unwrap();
        assert_eq!(done.id.as_deref(), Some("done"));
    }

    #[test]
    fn bootstrap_credential_carries_claims() {
        let raw = bootstrap_credential("alice", "s1", "secret", 42);
        let token = AuthToken::parse(&raw).unwrap();
        assert_eq!(token.claim(keys::AGENT_ID), Some("alice"));
        assert_eq!(token.claim(keys::CIRCUIT_CODE), Some("42"));
    }
}
