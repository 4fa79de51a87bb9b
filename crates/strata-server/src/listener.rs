//! Accept loop of one layer.
//!
//! Each accepted TCP connection is upgraded to a WebSocket in its own task,
//! wrapped in a [`Transport`] and handed to the accept callback. Stopping the
//! listener stops new accepts only; accepted connections live in the session
//! scope, not the listener's.

use crate::config::ListenerConfig;
use crate::error::{ServerError, TransportError};
use crate::scope::Scope;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use strata_core::LayerKind;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info};

/// Receives every upgraded connection.
pub type AcceptCallback = Arc<dyn Fn(Transport) + Send + Sync>;

pub struct LayerListener {
    kind: LayerKind,
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
    url: String,
    no_delay: bool,
}

impl LayerListener {
    /// Bind the configured address. Failure is reported, never retried.
    pub async fn bind(kind: LayerKind, config: &ListenerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                layer: kind,
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            kind,
            listener,
            local_addr,
            path: config.path.clone(),
            url: config.advertised_url(local_addr.port()),
            no_delay: config.no_delay,
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The URL peers are invited to.
    pub fn advertised_url(&self) -> &str {
        &self.url
    }

    /// Accept until `scope` is cancelled. Transports get a child of
    /// `sessions` as their scope.
    pub async fn run(
        self,
        scope: Scope,
        sessions: Scope,
        upgrade_timeout: Duration,
        on_accept: AcceptCallback,
    ) {
        info!(layer = %self.kind, addr = %self.local_addr, url = %self.url, "layer listening");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(layer = %self.kind, error = %e, "failed to accept connection");
                    continue;
                }
            };
            if self.no_delay {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
            }
            let kind = self.kind;
            let path = self.path.clone();
            let conn_scope = sessions.child(format!("{kind}/{peer}"));
            let on_accept = on_accept.clone();
            tokio::spawn(async move {
                let ws = match tokio::time::timeout(upgrade_timeout, upgrade(stream, path)).await {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        debug!(layer = %kind, %peer, error = %e, "upgrade failed");
                        return;
                    }
                    Err(_) => {
                        debug!(layer = %kind, %peer, "upgrade timed out");
                        return;
                    }
                };
                debug!(layer = %kind, %peer, "connection accepted");
                let transport = Transport::websocket(format!("{kind}/{peer}"), ws, conn_scope.clone());
                if panic::catch_unwind(AssertUnwindSafe(|| on_accept(transport))).is_err() {
                    error!(layer = %kind, %peer, "accept callback panicked");
                    conn_scope.cancel();
                }
            });
        }
        info!(layer = %self.kind, "layer listener stopped");
    }
}

/// WebSocket upgrade; requests for any other path get 404.
async fn upgrade(stream: TcpStream, path: String) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut refusal = ErrorResponse::new(Some(format!("no layer at {}", req.uri().path())));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    Ok(tokio_tungstenite::accept_hdr_async(stream, check_path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn config(path: &str) -> ListenerConfig {
        ListenerConfig {
            path: path.into(),
            ..ListenerConfig::default()
        }
    }

    /// Runs a listener whose callback greets each peer and counts accepts.
    async fn greeting_listener(
        path: &str,
    ) -> (String, Scope, Scope, mpsc::UnboundedReceiver<String>) {
        let listener = LayerListener::bind(LayerKind::Static, &config(path)).await.unwrap();
        let url = listener.advertised_url().to_string();
        let root = Scope::root("hub");
        let listener_scope = root.child("listener");
        let sessions = root.child("sessions");
        let (tx, rx) = mpsc::unbounded_channel();
        let count = std::sync::atomic::AtomicUsize::new(0);
        let on_accept: AcceptCallback = Arc::new(move |mut transport: Transport| {
            let n = count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                panic!("first accept fails");
            }
            let _ = tx.send(transport.name().to_string());
            transport.open();
            transport.handle().send(b"hello".to_vec()).unwrap();
            tokio::spawn(async move { while transport.receive().await.is_some() {} });
        });
        tokio::spawn(listener.run(
            listener_scope.clone(),
            sessions.clone(),
            Duration::from_secs(2),
            on_accept,
        ));
        (url, listener_scope, sessions, rx)
    }

    #[tokio::test]
    async fn advertised_url_carries_bound_port() {
        let listener = LayerListener::bind(LayerKind::Actor, &config("/actor")).await.unwrap();
        let port = listener.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            listener.advertised_url(),
            format!("ws://127.0.0.1:{port}/actor")
        );
    }

    #[tokio::test]
    async fn bind_failure_names_the_layer() {
        let first = LayerListener::bind(LayerKind::Cc, &config("/cc")).await.unwrap();
        let taken = ListenerConfig {
            port: first.local_addr().port(),
            ..config("/cc")
        };
        let err = LayerListener::bind(LayerKind::Cc, &taken).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { layer: LayerKind::Cc, .. }));
    }

    #[tokio::test]
    async fn callback_panic_does_not_stop_accepting() {
        let (url, _listener, _sessions, mut accepted) = greeting_listener("/static").await;

        // The first callback panics; that connection is dropped.
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(2), first.next()).await.unwrap();
        assert!(!matches!(ended, Some(Ok(WsMessage::Text(_)))));

        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let hello = tokio::time::timeout(Duration::from_secs(2), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hello.into_text().unwrap().as_str(), "hello");
        assert!(accepted.recv().await.unwrap().starts_with("static/"));
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let (url, _listener, _sessions, _accepted) = greeting_listener("/static").await;
        let wrong = url.replace("/static", "/actor");
        let err = tokio_tungstenite::connect_async(wrong.as_str()).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), StatusCode::NOT_FOUND)
            }
            other => panic!("expected 404, got {other}"),
        }
    }

    #[tokio::test]
    async fn stopping_keeps_open_sessions() {
        let (url, listener, _sessions, _accepted) = greeting_listener("/static").await;
        // Burn the panicking first accept.
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), first.next()).await;

        let (mut open, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let hello = open.next().await.unwrap().unwrap();
        assert_eq!(hello.into_text().unwrap().as_str(), "hello");

        listener.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());

        open.send(WsMessage::Text("still here".into())).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(200), open.next()).await;
        assert!(quiet.is_err(), "open session was closed: {quiet:?}");
    }
}
