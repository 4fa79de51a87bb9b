//! The top-level session context.
//!
//! A [`Hub`] owns the rendezvous registry, the layer listeners and the list
//! of live sessions, and threads them into every handshake and layer through
//! [`Shared`]. Scopes: the hub scope parents one scope per listener and a
//! session scope that parents every connection, so stopping a listener never
//! touches open sessions.

use crate::circuit::CircuitAuthority;
use crate::config::ServerConfig;
use crate::connection::{self, Connection};
use crate::error::{LayerError, ServerError};
use crate::handshake::HandshakeProcessor;
use crate::layers;
use crate::listener::{AcceptCallback, LayerListener};
use crate::rendezvous::{LayerConstructor, Rendezvous};
use crate::scene::Scene;
use crate::scope::Scope;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Codec, Identity, JsonCodec, LayerKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long [`Hub::shutdown`] waits for sessions to finish tearing down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State every handshake and layer instance reaches through an `Arc`.
pub struct Shared {
    pub config: ServerConfig,
    pub scene: Arc<dyn Scene>,
    pub circuits: Arc<dyn CircuitAuthority>,
    pub codec: Arc<dyn Codec>,
    pub rendezvous: Rendezvous,
    sessions: Mutex<Vec<Connection>>,
    directory: RwLock<BTreeMap<LayerKind, String>>,
    scope: Scope,
    session_scope: Scope,
}

impl Shared {
    /// Advertised URL of a running layer.
    pub fn listener_url(&self, kind: LayerKind) -> Option<String> {
        self.directory.read().get(&kind).cloned()
    }

    /// Layers currently accepting connections, in [`LayerKind`] order.
    pub fn running_layers(&self) -> Vec<LayerKind> {
        self.directory.read().keys().copied().collect()
    }

    /// A constructor for invitations to `kind`.
    ///
    /// The constructor holds the hub weakly: it is stored in the rendezvous,
    /// which `Shared` itself owns.
    pub fn constructor(self: &Arc<Self>, kind: LayerKind) -> LayerConstructor {
        let shared = Arc::downgrade(self);
        Box::new(move |conn, identity| {
            let shared = shared.upgrade().ok_or(LayerError::ShuttingDown)?;
            layers::build(kind, shared, conn, identity)
        })
    }

    /// Close every session opened through an invitation of the session
    /// keyed `issuer`.
    pub fn close_invited(&self, issuer: &str) -> usize {
        let targets: Vec<Connection> = self
            .sessions
            .lock()
            .iter()
            .filter(|conn| conn.issuer().as_deref() == Some(issuer))
            .cloned()
            .collect();
        for conn in &targets {
            conn.close("peer bootstrap ended");
        }
        targets.len()
    }

    /// Whether `identity` holds another open, authenticated session on `kind`.
    pub fn has_other_session(&self, kind: LayerKind, identity: &Identity, except: &str) -> bool {
        self.sessions.lock().iter().any(|conn| {
            conn.key() != except
                && conn.layer() == kind
                && conn.is_authenticated()
                && !conn.is_closed()
                && conn.identity().as_ref() == Some(identity)
        })
    }

    fn accept(self: &Arc<Self>, kind: LayerKind, transport: Transport) {
        let conn = Connection::new(kind, transport.handle(), self.codec.clone());
        self.sessions.lock().push(conn.clone());
        let processor = Box::new(HandshakeProcessor::new(kind, self.clone()));
        let timeout = self.config.handshake_timeout();
        let shared = self.clone();
        tokio::spawn(async move {
            connection::run(conn.clone(), transport, processor, timeout).await;
            shared.sessions.lock().retain(|c| c.key() != conn.key());
        });
    }
}

struct RunningListener {
    kind: LayerKind,
    addr: SocketAddr,
    scope: Scope,
    task: JoinHandle<()>,
}

pub struct Hub {
    shared: Arc<Shared>,
    listeners: Mutex<Vec<RunningListener>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(
        config: ServerConfig,
        scene: Arc<dyn Scene>,
        circuits: Arc<dyn CircuitAuthority>,
    ) -> Self {
        let scope = Scope::root("hub");
        let session_scope = scope.child("sessions");
        let rendezvous = Rendezvous::new(config.invite_ttl());
        Self {
            shared: Arc::new(Shared {
                config,
                scene,
                circuits,
                codec: Arc::new(JsonCodec),
                rendezvous,
                sessions: Mutex::new(Vec::new()),
                directory: RwLock::new(BTreeMap::new()),
                scope,
                session_scope,
            }),
            listeners: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.shared.rendezvous
    }

    /// Bind every enabled layer and start accepting.
    ///
    /// A layer that cannot bind is reported and left stopped. Only the
    /// command layer is required, since peers cannot bootstrap without it.
    pub async fn start(&self) -> Result<(), ServerError> {
        for kind in LayerKind::ALL {
            let config = self.shared.config.layers.get(kind);
            if !config.enabled {
                debug!(layer = %kind, "layer disabled");
                continue;
            }
            let listener = match LayerListener::bind(kind, config).await {
                Ok(listener) => listener,
                Err(e) if kind == LayerKind::Cc => return Err(e),
                Err(e) => {
                    error!(error = %e, "layer not started");
                    continue;
                }
            };
            self.spawn_listener(listener);
        }
        self.spawn_sweeper();
        info!(
            layers = self.shared.directory.read().len(),
            region = %self.shared.scene.region_name(),
            "hub started"
        );
        Ok(())
    }

    fn spawn_listener(&self, listener: LayerListener) {
        let kind = listener.kind();
        let addr = listener.local_addr();
        self.shared
            .directory
            .write()
            .insert(kind, listener.advertised_url().to_string());

        let scope = self.shared.scope.child(format!("listener/{kind}"));
        let shared = self.shared.clone();
        let on_accept: AcceptCallback = Arc::new(move |transport| shared.accept(kind, transport));
        let task = tokio::spawn(listener.run(
            scope.clone(),
            self.shared.session_scope.clone(),
            self.shared.config.upgrade_timeout(),
            on_accept,
        ));
        self.listeners.lock().push(RunningListener {
            kind,
            addr,
            scope,
            task,
        });
    }

    fn spawn_sweeper(&self) {
        let shared = self.shared.clone();
        let every = shared.config.sweep_interval();
        let scope = shared.scope.child("sweeper");
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                let purged = shared.rendezvous.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired invitations swept");
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    /// Bound address of a running layer.
    pub fn local_addr(&self, kind: LayerKind) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .iter()
            .find(|l| l.kind == kind)
            .map(|l| l.addr)
    }

    pub fn listener_url(&self, kind: LayerKind) -> Option<String> {
        self.shared.listener_url(kind)
    }

    /// Stop accepting on one layer. Its open sessions keep running, and it
    /// is no longer offered in new invitations.
    pub async fn stop_layer(&self, kind: LayerKind) -> bool {
        let stopped = {
            let mut listeners = self.listeners.lock();
            let index = listeners.iter().position(|l| l.kind == kind);
            index.map(|i| listeners.remove(i))
        };
        let Some(listener) = stopped else {
            return false;
        };
        self.shared.directory.write().remove(&kind);
        listener.scope.cancel();
        if let Err(e) = listener.task.await {
            warn!(layer = %kind, error = %e, "listener task failed");
        }
        info!(layer = %kind, "layer stopped");
        true
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Layers on which `identity` currently has an authenticated session.
    pub fn sessions_of(&self, identity: &Identity) -> Vec<LayerKind> {
        let mut kinds: Vec<LayerKind> = self
            .shared
            .sessions
            .lock()
            .iter()
            .filter(|c| c.is_authenticated() && c.identity().as_ref() == Some(identity))
            .map(Connection::layer)
            .collect();
        kinds.sort();
        kinds
    }

    /// Cancel every listener and session and wait for sessions to finish.
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.shared.scope.cancel();
        let listeners: Vec<RunningListener> = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            let _ = listener.task.await;
        }
        self.shared.directory.write().clear();
        let revoked = self.shared.rendezvous.clear();
        if revoked > 0 {
            debug!(revoked, "pending invitations dropped");
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.session_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.session_count();
        if remaining > 0 {
            warn!(remaining, "sessions still tearing down at shutdown");
        }
        info!("hub stopped");
    }
}
