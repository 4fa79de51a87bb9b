use super::{HandlerTable, LayerCore, LayerInstance, alive_check};
use crate::error::LayerError;
use crate::handshake;
use std::sync::LazyLock;
use strata_core::{Identity, LayerKind, Message, Op};
use tracing::{info, warn};

static HANDLERS: LazyLock<HandlerTable<CommandLayer>> =
    LazyLock::new(|| HandlerTable::new(LayerKind::Cc).on(Op::AliveCheckRequest, alive_check));

/// Command and control: the bootstrap session of a peer.
///
/// Once open it invites the peer to every other running layer. When it ends,
/// its unclaimed invitations are revoked and the peer's other layer sessions
/// are closed.
pub struct CommandLayer {
    core: LayerCore,
}

impl CommandLayer {
    pub fn new(core: LayerCore) -> Self {
        Self { core }
    }

    fn spawn_invitations(&self) {
        let shared = self.core.shared().clone();
        let conn = self.core.conn().clone();
        let identity = self.core.identity().clone();
        let layers: Vec<LayerKind> = shared
            .running_layers()
            .into_iter()
            .filter(|kind| *kind != LayerKind::Cc)
            .collect();
        tokio::spawn(async move {
            for kind in layers {
                if conn.is_closed() {
                    break;
                }
                // Failures are logged by invite; the remaining layers are still offered.
                let _ = handshake::invite(&shared, &conn, &identity, kind).await;
            }
        });
    }

    fn spawn_alive_check(&self) {
        let Some(every) = self.core.shared().config.alive_check() else {
            return;
        };
        let timeout = self.core.shared().config.request_timeout();
        let conn = self.core.conn().clone();
        let agent = self.core.identity().clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = conn.scope().cancelled() => break,
                    _ = ticks.tick() => {}
                }
                if let Err(e) = conn.request(Message::new(Op::AliveCheckRequest), timeout).await {
                    warn!(agent = %agent, error = %e, "peer failed alive check");
                    conn.close("alive check failed");
                    break;
                }
            }
        });
    }
}

impl LayerInstance for CommandLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Cc
    }

    fn identity(&self) -> &Identity {
        self.core.identity()
    }

    fn start(&self) -> Result<(), LayerError> {
        self.spawn_invitations();
        self.spawn_alive_check();
        Ok(())
    }

    fn shutdown(&self) {
        let shared = self.core.shared();
        let conn = self.core.conn();
        let revoked = shared.rendezvous.revoke_issuer(conn.key());
        let closed = shared.close_invited(conn.key());
        if revoked > 0 || closed > 0 {
            info!(
                agent = %self.core.identity(),
                revoked,
                closed,
                "bootstrap ended; peer sessions released"
            );
        }
        self.core.shutdown();
    }

    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError> {
        HANDLERS.dispatch(self, msg)
    }
}
