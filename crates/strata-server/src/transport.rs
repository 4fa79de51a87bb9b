//! Named bidirectional byte-message channel over one physical connection.
//!
//! A [`Transport`] owns two background pumps once opened: the outbound pump
//! drains the send queue onto the wire, the inbound pump moves frames from
//! the wire into the receive queue. Sends are non-blocking and FIFO and are
//! never dropped while the transport is open. Wire faults are logged, mark
//! the transport [`TransportState::Errored`] and close it; they never reach
//! application code as panics.

use crate::error::TransportError;
use crate::scope::Scope;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

/// How long the outbound pump waits for the close handshake to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type ByteSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Open,
    Closed,
    Errored,
}

impl TransportState {
    pub fn is_closed(self) -> bool {
        matches!(self, TransportState::Closed | TransportState::Errored)
    }
}

struct Outbound {
    bytes: Vec<u8>,
    sent: Option<oneshot::Sender<()>>,
}

/// Wire halves waiting for [`Transport::open`].
struct Wire {
    sink: ByteSink,
    stream: ByteStream,
    queue: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The receiving end of a transport, owned by exactly one connection.
pub struct Transport {
    handle: TransportHandle,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    wire: Option<Wire>,
}

/// Cloneable sending and lifecycle half of a [`Transport`].
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    queue: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<TransportState>,
    scope: Scope,
    sent: AtomicU64,
}

impl Transport {
    /// Wrap an upgraded WebSocket. Pumps start on [`Transport::open`].
    pub fn websocket<S>(name: impl Into<String>, ws: WebSocketStream<S>, scope: Scope) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self::new(name.into(), ws_sink(sink), ws_stream(stream), scope)
    }

    fn new(name: String, sink: ByteSink, stream: ByteStream, scope: Scope) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::Uninitialized);
        Self {
            handle: TransportHandle {
                inner: Arc::new(HandleInner {
                    name,
                    queue: queue_tx,
                    state,
                    scope,
                    sent: AtomicU64::new(0),
                }),
            },
            inbound: inbound_rx,
            wire: Some(Wire {
                sink,
                stream,
                queue: queue_rx,
                inbound: inbound_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Start the pumps. Sends queued before this point go out first.
    pub fn open(&mut self) {
        let Some(wire) = self.wire.take() else {
            return;
        };
        if self.handle.is_closed() {
            return;
        }
        self.handle.inner.state.send_replace(TransportState::Open);
        tokio::spawn(pump_out(self.handle.clone(), wire.sink, wire.queue));
        tokio::spawn(pump_in(self.handle.clone(), wire.stream, wire.inbound));
        debug!(transport = %self.name(), "transport open");
    }

    /// Next inbound frame, or `None` once the transport is closed or the
    /// peer has gone away and every queued frame was consumed.
    pub async fn receive(&mut self) -> Option<Vec<u8>> {
        let scope = self.handle.scope().clone();
        tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            frame = self.inbound.recv() => frame,
        }
    }

    pub fn close(&self, reason: &str) {
        self.handle.close(reason);
    }
}

impl TransportHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed() || self.inner.scope.is_cancelled()
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Frames actually written to the wire.
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Enqueue a frame for transmission.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(Outbound { bytes, sent: None })
    }

    /// Enqueue a frame; the receiver fires once it has been written.
    pub fn send_confirmed(&self, bytes: Vec<u8>) -> Result<oneshot::Receiver<()>, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outbound {
            bytes,
            sent: Some(tx),
        })?;
        Ok(rx)
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .queue
            .send(outbound)
            .map_err(|_| TransportError::Closed)
    }

    /// Close the transport. Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = TransportState::Closed;
                true
            }
        });
        if changed {
            info!(transport = %self.name(), reason, "transport closed");
        }
        self.inner.scope.cancel();
    }

    fn fail(&self, err: TransportError) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = TransportState::Errored;
                true
            }
        });
        if changed {
            warn!(transport = %self.name(), error = %err, "transport fault");
        }
        self.inner.scope.cancel();
    }

    /// Resolves once the transport is closed or errored.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        tokio::select! {
            _ = state.wait_for(|s| s.is_closed()) => {}
            _ = self.inner.scope.cancelled() => {}
        }
    }
}

async fn pump_out(
    handle: TransportHandle,
    mut sink: ByteSink,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    let scope = handle.scope().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(Outbound { bytes, sent }) = next else {
            break;
        };
        let written = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            written = sink.send(bytes) => written,
        };
        if let Err(e) = written {
            handle.fail(e);
            break;
        }
        handle.inner.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(sent) = sent {
            let _ = sent.send(());
        }
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    handle.close("outbound pump stopped");
}

async fn pump_in(
    handle: TransportHandle,
    mut stream: ByteStream,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) {
    let scope = handle.scope().clone();
    loop {
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => {
                if inbound.send(bytes).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                handle.fail(e);
                break;
            }
            None => {
                debug!(transport = %handle.name(), "peer finished sending");
                break;
            }
        }
    }
}

fn ws_sink<S>(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> ByteSink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(
        sink.with(|bytes: Vec<u8>| future::ready(Ok::<_, WsError>(ws_frame(bytes))))
            .sink_map_err(TransportError::from),
    )
}

/// Text frames when the payload is UTF-8, binary otherwise.
fn ws_frame(bytes: Vec<u8>) -> WsMessage {
    match String::from_utf8(bytes) {
        Ok(text) => WsMessage::Text(text.into()),
        Err(e) => WsMessage::Binary(e.into_bytes().into()),
    }
}

fn ws_stream<S>(stream: SplitStream<WebSocketStream<S>>) -> ByteStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(futures_util::stream::unfold(stream, |mut stream| async move {
        loop {
            let Some(next) = stream.next().await else {
                return None;
            };
            let item = match next {
                Ok(WsMessage::Text(text)) => Ok(text.as_str().as_bytes().to_vec()),
                Ok(WsMessage::Binary(bytes)) => Ok(bytes.to_vec()),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => Err(TransportError::from(e)),
            };
            return Some((item, stream));
        }
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    pub type PeerSocket = WebSocketStream<DuplexStream>;

    /// An in-memory transport plus the raw WebSocket of its peer.
    pub async fn transport_pair(name: &str, scope: Scope) -> (Transport, PeerSocket) {
        let (server_io, peer_io) = tokio::io::duplex(256 * 1024);
        let (server, peer) = tokio::join!(
            WebSocketStream::from_raw_socket(server_io, Role::Server, None),
            WebSocketStream::from_raw_socket(peer_io, Role::Client, None),
        );
        (Transport::websocket(name, server, scope), peer)
    }

    /// Next text or binary payload from the peer side.
    pub async fn peer_recv(peer: &mut PeerSocket) -> Option<Vec<u8>> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), peer.next())
                .await
                .expect("timeout waiting for frame")?
                .ok()?;
            match msg {
                WsMessage::Text(text) => return Some(text.as_str().as_bytes().to_vec()),
                WsMessage::Binary(bytes) => return Some(bytes.to_vec()),
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    pub async fn peer_send(peer: &mut PeerSocket, text: &str) {
        peer.send(WsMessage::Text(text.to_string().into()))
            .await
            .unwrap();
    }
}
