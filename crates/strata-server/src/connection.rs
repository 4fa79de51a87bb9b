//! One logical session bound to one transport.
//!
//! A [`Connection`] starts unauthenticated and only accepts the OpenSession
//! handshake. The session driver ([`run`]) dispatches inbound messages one at
//! a time to the current [`MessageProcessor`]; when the handshake processor
//! opens the session, the driver swaps in the layer's processor between two
//! arrivals, so no message is seen by both.

use crate::error::{INTERNAL_REASON, SessionError, TransportError};
use crate::layers::LayerInstance;
use crate::scope::Scope;
use crate::transport::{Transport, TransportHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::{Codec, Identity, Invitation, LayerKind, Message, Op, SessionState};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Credentials exchanged by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPair {
    /// Credential the peer asked us to present back (`clientAuth`).
    pub accepted: String,
    /// Credential minted for this connection (`ServerAuth`).
    pub presented: String,
}

/// What the driver does with a processed message.
pub enum Dispatch {
    Reply(Message),
    /// No response for this arrival.
    Ignore,
    /// The handshake succeeded: send `reply`, then hand dispatch to `instance`.
    Open {
        reply: Message,
        instance: Arc<dyn LayerInstance>,
    },
}

/// Decides how a connection treats each inbound message.
pub trait MessageProcessor: Send {
    fn process(&mut self, conn: &Connection, msg: &Message) -> Result<Dispatch, SessionError>;
}

/// Dispatch for an open session: every message goes to the layer instance.
pub struct LayerProcessor {
    instance: Arc<dyn LayerInstance>,
}

impl LayerProcessor {
    pub fn new(instance: Arc<dyn LayerInstance>) -> Self {
        Self { instance }
    }
}

impl MessageProcessor for LayerProcessor {
    fn process(&mut self, _conn: &Connection, msg: &Message) -> Result<Dispatch, SessionError> {
        if msg.op == Op::OpenSessionRequest {
            return Err(SessionError::AlreadyOpen);
        }
        match self.instance.handle(msg)? {
            Some(reply) => Ok(Dispatch::Reply(reply)),
            None => Ok(Dispatch::Ignore),
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    key: String,
    layer: LayerKind,
    transport: TransportHandle,
    codec: Arc<dyn Codec>,
    state: Mutex<SessionState>,
    auth: Mutex<Option<AuthPair>>,
    identity: Mutex<Option<Identity>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    attached: Mutex<Attachments>,
    /// Key of the session whose invitation opened this one.
    issuer: Mutex<Option<String>>,
    next_request: AtomicU64,
}

/// Instances to shut down at teardown. `closed` is only flipped under the
/// same lock, so an instance is either drained by teardown or shut down by
/// `attach` itself.
#[derive(Default)]
struct Attachments {
    closed: bool,
    instances: Vec<Arc<dyn LayerInstance>>,
}

impl Connection {
    pub fn new(layer: LayerKind, transport: TransportHandle, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                key: Uuid::new_v4().simple().to_string(),
                layer,
                transport,
                codec,
                state: Mutex::new(SessionState::Unauthenticated),
                auth: Mutex::new(None),
                identity: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                attached: Mutex::new(Attachments::default()),
                issuer: Mutex::new(None),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Unique key of this connection, sent to the peer as `ConnectionKey`.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn layer(&self) -> LayerKind {
        self.inner.layer
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.lock().clone()
    }

    pub fn auth(&self) -> Option<AuthPair> {
        self.inner.auth.lock().clone()
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.inner.codec
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.inner.transport
    }

    pub fn scope(&self) -> &Scope {
        self.inner.transport.scope()
    }

    /// Install the handshake result. Only an unauthenticated connection can
    /// be authenticated.
    pub fn authenticate(&self, identity: Identity, auth: AuthPair) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        match *state {
            SessionState::Unauthenticated => {}
            SessionState::Authenticated => return Err(SessionError::AlreadyOpen),
            SessionState::Closed => return Err(TransportError::Closed.into()),
        }
        info!(conn = %self.key(), layer = %self.layer(), agent = %identity, "session authenticated");
        *self.inner.identity.lock() = Some(identity);
        *self.inner.auth.lock() = Some(auth);
        *state = SessionState::Authenticated;
        Ok(())
    }

    /// Encode and enqueue a message.
    ///
    /// Before authentication only the handshake response and exception
    /// responses may leave.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Closed => return Err(TransportError::Closed.into()),
            SessionState::Unauthenticated
                if msg.op != Op::OpenSessionResponse && !msg.is_exception() =>
            {
                return Err(SessionError::NotOpen);
            }
            _ => {}
        }
        let bytes = self.inner.codec.encode(&msg)?;
        self.inner.transport.send(bytes)?;
        Ok(())
    }

    /// Send `response` as the answer to `request`, echoing its id.
    pub fn send_response(&self, request: &Message, mut response: Message) -> Result<(), SessionError> {
        response.id = request.id.clone();
        self.send(response)
    }

    /// Send a request and wait for the peer's answer with the same id.
    ///
    /// A request without an id is given one. An exception answer becomes
    /// [`SessionError::Remote`].
    pub async fn request(&self, mut msg: Message, timeout: Duration) -> Result<Message, SessionError> {
        let id = match &msg.id {
            Some(id) => id.clone(),
            None => {
                let n = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
                let id = format!("req-{n}");
                msg.id = Some(id.clone());
                id
            }
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(SessionError::RequestInFlight(id));
            }
            pending.insert(id.clone(), tx);
        }
        if let Err(e) = self.send(msg) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }
        let answer = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(TransportError::Closed.into()),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                return Err(SessionError::Timeout(id));
            }
        };
        match answer.exception {
            Some(reason) => Err(SessionError::Remote(reason)),
            None => Ok(answer),
        }
    }

    /// Transmit a MakeConnection invitation. Resolves once the message has
    /// been written to the wire; whether the peer follows it shows up later
    /// as a handshake on another connection.
    pub async fn make_connection(&self, invitation: &Invitation) -> Result<(), SessionError> {
        if !self.is_authenticated() {
            return Err(SessionError::NotOpen);
        }
        let bytes = self.inner.codec.encode(&invitation.to_message())?;
        let written = self.inner.transport.send_confirmed(bytes)?;
        written.await.map_err(|_| TransportError::Closed)?;
        debug!(conn = %self.key(), service = %invitation.service, "invitation transmitted");
        Ok(())
    }

    /// Attach a layer instance whose shutdown runs when this connection ends.
    pub fn attach(&self, instance: Arc<dyn LayerInstance>) {
        {
            let mut attached = self.inner.attached.lock();
            if !attached.closed {
                attached.instances.push(instance);
                return;
            }
        }
        instance.shutdown();
    }

    pub fn attached_count(&self) -> usize {
        self.inner.attached.lock().instances.len()
    }

    /// Connection key of the session that invited this one, if any.
    pub fn issuer(&self) -> Option<String> {
        self.inner.issuer.lock().clone()
    }

    pub(crate) fn record_issuer(&self, issuer: impl Into<String>) {
        *self.inner.issuer.lock() = Some(issuer.into());
    }

    /// Close the transport. The driver then tears the session down.
    pub fn close(&self, reason: &str) {
        self.inner.transport.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed || self.inner.transport.is_closed()
    }

    pub async fn closed(&self) {
        self.inner.transport.closed().await;
    }

    /// Route an answer to the request waiting for it.
    fn resolve(&self, msg: Message) -> bool {
        let Some(id) = msg.id.clone() else {
            return false;
        };
        let waiter = self.inner.pending.lock().remove(&id);
        match waiter {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Answer an arrival, logging when the answer cannot be sent.
    fn reply(&self, request: &Message, response: Message) {
        if let Err(e) = self.send_response(request, response) {
            debug!(conn = %self.key(), error = %e, "reply not sent");
        }
    }

    /// Mark the session closed and shut every attached instance down once.
    fn teardown(&self, reason: &str) {
        *self.inner.state.lock() = SessionState::Closed;
        self.inner.transport.close(reason);
        self.inner.pending.lock().clear();
        let attached = {
            let mut attached = self.inner.attached.lock();
            attached.closed = true;
            std::mem::take(&mut attached.instances)
        };
        for instance in attached {
            let kind = instance.kind();
            if panic::catch_unwind(AssertUnwindSafe(|| instance.shutdown())).is_err() {
                error!(conn = %self.key(), layer = %kind, "layer shutdown panicked");
            }
        }
        debug!(conn = %self.key(), layer = %self.layer(), reason, "session torn down");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.inner.key)
            .field("layer", &self.inner.layer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Drive a connection until its transport closes or the peer ends the
/// session. Connections still unauthenticated after `handshake_timeout` are
/// closed.
pub async fn run(
    conn: Connection,
    mut transport: Transport,
    mut processor: Box<dyn MessageProcessor>,
    handshake_timeout: Duration,
) {
    transport.open();
    let deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(deadline);

    let reason = loop {
        let frame = tokio::select! {
            frame = transport.receive() => frame,
            _ = &mut deadline, if !conn.is_authenticated() => {
                warn!(conn = %conn.key(), layer = %conn.layer(), "handshake timed out");
                break "handshake timeout";
            }
        };
        let Some(frame) = frame else {
            break "transport closed";
        };

        let msg = match conn.codec().decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = %conn.key(), error = %e, "dropping malformed frame");
                if let Some(id) = e.id {
                    let mut answer = Message::new(Op::Response).with_id(id);
                    answer.exception = Some("malformed message".to_string());
                    if let Err(e) = conn.send(answer) {
                        debug!(conn = %conn.key(), error = %e, "reply not sent");
                    }
                }
                continue;
            }
        };
        debug!(conn = %conn.key(), op = %msg.op, id = ?msg.id, "received");

        if conn.is_authenticated() {
            if msg.op == Op::CloseSession {
                info!(conn = %conn.key(), layer = %conn.layer(), "peer closed session");
                break "peer closed session";
            }
            if msg.op.is_response() {
                if !conn.resolve(msg) {
                    debug!(conn = %conn.key(), "unsolicited response dropped");
                }
                continue;
            }
        }

        dispatch(&conn, &mut processor, msg);
    };

    conn.teardown(reason);
}

fn dispatch(conn: &Connection, processor: &mut Box<dyn MessageProcessor>, msg: Message) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(conn, &msg)))
        .unwrap_or_else(|_| {
            error!(conn = %conn.key(), op = %msg.op, "message handler panicked");
            Err(SessionError::Panicked)
        });

    match outcome {
        Ok(Dispatch::Reply(reply)) => conn.reply(&msg, reply),
        Ok(Dispatch::Ignore) => {}
        Ok(Dispatch::Open { reply, instance }) => {
            conn.reply(&msg, reply);
            conn.attach(instance.clone());
            *processor = Box::new(LayerProcessor::new(instance.clone()));
            let started = panic::catch_unwind(AssertUnwindSafe(|| instance.start()));
            match started {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(conn = %conn.key(), layer = %instance.kind(), error = %e, "layer failed to start");
                    conn.close("layer failed to start");
                }
                Err(_) => {
                    error!(conn = %conn.key(), layer = %instance.kind(), "layer start panicked");
                    conn.close("layer failed to start");
                }
            }
        }
        Err(err) => {
            let reason = err.peer_reason();
            match &err {
                SessionError::Handshake(e) => {
                    warn!(conn = %conn.key(), layer = %conn.layer(), reason = %e, "handshake rejected");
                }
                _ if reason == INTERNAL_REASON => {
                    error!(conn = %conn.key(), op = %msg.op, error = %err, "message failed");
                }
                _ => {
                    debug!(conn = %conn.key(), op = %msg.op, reason = %reason, "message refused");
                }
            }
            conn.reply(&msg, msg.exception(reason));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::transport::testing::{PeerSocket, peer_recv, peer_send, transport_pair};
    use strata_core::{JsonCodec, keys};

    async fn session(handshake_timeout: Duration) -> (Connection, Arc<Recorder>, PeerSocket, tokio::task::JoinHandle<()>) {
        let (transport, peer) = transport_pair("test", Scope::root("conn")).await;
        let conn = Connection::new(LayerKind::Actor, transport.handle(), Arc::new(JsonCodec));
        let recorder = Recorder::new(LayerKind::Actor);
        let processor = Box::new(OpenOnOk {
            recorder: recorder.clone(),
        });
        let driver = tokio::spawn(run(conn.clone(), transport, processor, handshake_timeout));
        (conn, recorder, peer, driver)
    }

    async fn exchange(peer: &mut PeerSocket, msg: &Message) -> Message {
        let codec = JsonCodec;
        peer_send(peer, std::str::from_utf8(&codec.encode(msg).unwrap()).unwrap()).await;
        next(peer).await
    }

    async fn next(peer: &mut PeerSocket) -> Message {
        JsonCodec.decode(&peer_recv(peer).await.unwrap()).unwrap()
    }

    fn open_request(auth: &str) -> Message {
        Message::new(Op::OpenSessionRequest)
            .with_id("open")
            .with_prop(keys::CLIENT_AUTH, "peer")
            .with_prop(keys::AUTH, auth)
    }

    #[tokio::test]
    async fn only_handshake_is_accepted_before_auth() {
        let (conn, _recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;

        let reply = exchange(&mut peer, &Message::new(Op::Request).with_id("r1")).await;
        assert_eq!(reply.id.as_deref(), Some("r1"));
        assert_eq!(reply.exception.as_deref(), Some("session is not open"));

        let reply = exchange(&mut peer, &open_request("bad")).await;
        assert_eq!(reply.exception.as_deref(), Some("unknown id"));
        assert_eq!(conn.state(), SessionState::Unauthenticated);

        assert!(matches!(
            conn.send(Message::new(Op::CreateItemRequest)),
            Err(SessionError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn handshake_swaps_processor() {
        let (conn, recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;

        let reply = exchange(&mut peer, &open_request("ok")).await;
        assert_eq!(reply.op, Op::OpenSessionResponse);
        assert!(reply.exception.is_none());
        assert!(conn.is_authenticated());
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);

        let reply = exchange(&mut peer, &Message::new(Op::Request).with_id("r2")).await;
        assert_eq!(reply.prop("echo"), Some("yes"));
        assert_eq!(reply.id.as_deref(), Some("r2"));

        let reply = exchange(&mut peer, &open_request("ok")).await;
        assert_eq!(reply.exception.as_deref(), Some("session already open"));
    }

    #[tokio::test]
    async fn faults_answer_once_and_keep_the_session() {
        let (_conn, _recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;
        exchange(&mut peer, &open_request("ok")).await;

        let reply = exchange(&mut peer, &Message::new(Op::DeleteItemRequest).with_id("d")).await;
        assert_eq!(reply.op, Op::DeleteItemResponse);
        assert_eq!(
            reply.exception.as_deref(),
            Some("actor layer does not handle DeleteItemRequest")
        );

        let boom = Message::new(Op::Request).with_id("p").with_prop("panic", 1);
        let reply = exchange(&mut peer, &boom).await;
        assert_eq!(reply.exception.as_deref(), Some(INTERNAL_REASON));

        peer_send(&mut peer, r#"{"op":"Nonsense","id":"m"}"#).await;
        let reply = next(&mut peer).await;
        assert_eq!(reply.id.as_deref(), Some("m"));
        assert_eq!(reply.exception.as_deref(), Some("malformed message"));

        // An ignored message produces nothing; the next reply belongs to the next request.
        let codec = JsonCodec;
        let ignored = Message::new(Op::AddItemRequest).with_id("ignored");
        peer_send(&mut peer, std::str::from_utf8(&codec.encode(&ignored).unwrap()).unwrap()).await;
        let reply = exchange(&mut peer, &Message::new(Op::Request).with_id("after")).await;
        assert_eq!(reply.id.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn server_requests_correlate_by_id() {
        let (conn, _recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;
        exchange(&mut peer, &open_request("ok")).await;

        let asker = conn.clone();
        let pending = tokio::spawn(async move {
            asker
                .request(Message::new(Op::AliveCheckRequest), Duration::from_secs(2))
                .await
        });
        let ping = next(&mut peer).await;
        assert_eq!(ping.op, Op::AliveCheckRequest);
        let pong = ping.response().with_prop("ok", true);
        peer_send(&mut peer, std::str::from_utf8(&JsonCodec.encode(&pong).unwrap()).unwrap()).await;

        let answer = pending.await.unwrap().unwrap();
        assert_eq!(answer.op, Op::AliveCheckResponse);
        assert_eq!(answer.prop("ok"), Some("true"));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (conn, _recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;
        exchange(&mut peer, &open_request("ok")).await;
        let err = conn
            .request(Message::new(Op::AliveCheckRequest).with_id("x"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(id) if id == "x"));
    }

    #[tokio::test]
    async fn invitation_resolves_once_written() {
        let (conn, _recorder, mut peer, _driver) = session(Duration::from_secs(5)).await;
        let invitation = Invitation {
            transport: "WebSocket".into(),
            transport_url: "ws://127.0.0.1:1/static".into(),
            protocol: "strata-json".into(),
            service: "static".into(),
            service_auth: "cred".into(),
        };
        assert!(matches!(
            conn.make_connection(&invitation).await,
            Err(SessionError::NotOpen)
        ));

        exchange(&mut peer, &open_request("ok")).await;
        conn.make_connection(&invitation).await.unwrap();
        let msg = next(&mut peer).await;
        assert_eq!(Invitation::from_message(&msg).unwrap(), invitation);
    }

    #[tokio::test]
    async fn unauthenticated_connections_time_out() {
        let (conn, _recorder, _peer, driver) = session(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn disconnect_shuts_each_attachment_down_once() {
        let (conn, recorder, mut peer, driver) = session(Duration::from_secs(5)).await;
        exchange(&mut peer, &open_request("ok")).await;

        let extra: Vec<_> = (0..3).map(|_| Recorder::new(LayerKind::Dynamic)).collect();
        for p in &extra {
            conn.attach(p.clone());
        }
        assert_eq!(conn.attached_count(), 4);
        let sent_before = conn.transport().sent_count();

        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
        for p in &extra {
            assert_eq!(p.shutdowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(conn.attached_count(), 0);
        assert!(conn.send(Message::new(Op::CreateItemRequest)).is_err());
        assert_eq!(conn.transport().sent_count(), sent_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attach_racing_teardown_still_shuts_down_once() {
        for _ in 0..20 {
            let (conn, _recorder, mut peer, driver) = session(Duration::from_secs(5)).await;
            exchange(&mut peer, &open_request("ok")).await;

            let recorders: Vec<_> = (0..8).map(|_| Recorder::new(LayerKind::Environ)).collect();
            let attachers: Vec<_> = recorders
                .iter()
                .map(|p| {
                    let conn = conn.clone();
                    let p = p.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        conn.attach(p);
                    })
                })
                .collect();
            drop(peer);
            for attacher in attachers {
                attacher.await.unwrap();
            }
            tokio::time::timeout(Duration::from_secs(2), driver)
                .await
                .unwrap()
                .unwrap();

            for p in &recorders {
                assert_eq!(p.shutdowns.load(Ordering::SeqCst), 1);
            }
            assert_eq!(conn.attached_count(), 0);
        }
    }

    #[tokio::test]
    async fn attach_after_teardown_shuts_down_immediately() {
        let (conn, _recorder, peer, driver) = session(Duration::from_secs(5)).await;
        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();

        let late = Recorder::new(LayerKind::Static);
        conn.attach(late.clone());
        assert_eq!(late.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(conn.attached_count(), 0);
    }

    #[tokio::test]
    async fn close_session_ends_the_driver() {
        let (conn, recorder, mut peer, driver) = session(Duration::from_secs(5)).await;
        exchange(&mut peer, &open_request("ok")).await;
        let close = JsonCodec.encode(&Message::new(Op::CloseSession)).unwrap();
        peer_send(&mut peer, std::str::from_utf8(&close).unwrap()).await;
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
    }
}
