//! Layer variants.
//!
//! Every variant is a [`LayerInstance`]: one per authenticated connection,
//! holding that connection and the scene subscriptions it feeds. Variants
//! share a [`LayerCore`] by composition and route inbound messages through a
//! per-variant [`HandlerTable`].

mod actor;
mod cc;
mod dynamic;
mod environ;
mod static_content;

pub use actor::ActorLayer;
pub use cc::CommandLayer;
pub use dynamic::DynamicLayer;
pub use environ::EnvironLayer;
pub use static_content::StaticLayer;

use crate::connection::Connection;
use crate::error::LayerError;
use crate::hub::Shared;
use crate::scene::{SceneEvent, SceneItem, SceneTopic, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_core::{Identity, LayerKind, Message, Op};
use tracing::{debug, info};

/// The capability set of a layer session.
pub trait LayerInstance: Send + Sync {
    fn kind(&self) -> LayerKind;

    /// The peer this instance serves.
    fn identity(&self) -> &Identity;

    /// Wire subscriptions and push initial content. Runs right after the
    /// handshake response has been queued.
    fn start(&self) -> Result<(), LayerError>;

    /// Drop subscriptions and close the connection.
    fn shutdown(&self);

    /// Handle one inbound message of an open session. `Ok(None)` sends no
    /// response.
    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError>;
}

/// Build the instance for `kind`, bound to `conn` and `identity`.
pub fn build(
    kind: LayerKind,
    shared: Arc<Shared>,
    conn: Connection,
    identity: Identity,
) -> Result<Arc<dyn LayerInstance>, LayerError> {
    let core = LayerCore::new(kind, shared, conn, identity);
    let instance: Arc<dyn LayerInstance> = match kind {
        LayerKind::Cc => Arc::new(CommandLayer::new(core)),
        LayerKind::Static => Arc::new(StaticLayer::new(core)),
        LayerKind::Actor => Arc::new(ActorLayer::new(core)),
        LayerKind::Dynamic => Arc::new(DynamicLayer::new(core)),
        LayerKind::Environ => Arc::new(EnvironLayer::new(core)),
    };
    Ok(instance)
}

/// State shared by every layer variant.
pub struct LayerCore {
    kind: LayerKind,
    identity: Identity,
    conn: Connection,
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl LayerCore {
    pub fn new(kind: LayerKind, shared: Arc<Shared>, conn: Connection, identity: Identity) -> Self {
        Self {
            kind,
            identity,
            conn,
            shared,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Send server-originated content, logging when the peer is gone.
    pub fn push(&self, msg: Message) {
        push(&self.conn, msg);
    }

    /// Announce an item: create it, then add it to the region.
    pub fn push_item(&self, item: &SceneItem) {
        for msg in item_messages(item, &self.shared.scene.region_name()) {
            self.push(msg);
        }
    }

    /// Forward scene events on `topic` to the peer until shutdown.
    pub fn follow(&self, topic: SceneTopic) {
        let conn = self.conn.clone();
        let region = self.shared.scene.region_name();
        let subscription = self.shared.scene.subscribe(
            topic,
            Arc::new(move |event: &SceneEvent| {
                for msg in event_messages(event, &region) {
                    push(&conn, msg);
                }
            }),
        );
        self.subscriptions.lock().push(subscription);
    }

    /// Follow `topic`, then push its current items. Changes racing the
    /// snapshot arrive through the subscription; a peer may see an item
    /// announced twice but never misses one.
    pub fn load(&self, topic: SceneTopic) {
        self.follow(topic);
        for item in self.shared.scene.items(topic) {
            self.push_item(&item);
        }
    }

    /// The item `id`, if it lives on one of `topics`.
    pub fn find(&self, id: &str, topics: &[SceneTopic]) -> Option<SceneItem> {
        topics
            .iter()
            .flat_map(|topic| self.shared.scene.items(*topic))
            .find(|item| item.id == id)
    }

    /// Run every pending unsubscribe handle and close the connection.
    pub fn shutdown(&self) {
        let subscriptions: Vec<_> = std::mem::take(&mut *self.subscriptions.lock());
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        self.conn.close("layer shut down");
        info!(layer = %self.kind, agent = %self.identity, unsubscribed = count, "layer session ended");
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

fn push(conn: &Connection, msg: Message) {
    if let Err(e) = conn.send(msg) {
        debug!(conn = %conn.key(), error = %e, "content not sent");
    }
}

fn item_messages(item: &SceneItem, region: &str) -> [Message; 2] {
    [
        Message::new(Op::CreateItemRequest)
            .with_id(&item.id)
            .with_props(item.properties.clone()),
        Message::new(Op::AddItemRequest)
            .with_id(&item.id)
            .with_prop("Region", region),
    ]
}

fn event_messages(event: &SceneEvent, region: &str) -> Vec<Message> {
    match event {
        SceneEvent::Added(item) => item_messages(item, region).into(),
        SceneEvent::Updated(item) => vec![
            Message::new(Op::UpdatePropertiesRequest)
                .with_id(&item.id)
                .with_props(item.properties.clone()),
        ],
        SceneEvent::Removed(id) => vec![
            Message::new(Op::RemoveItemRequest)
                .with_id(id)
                .with_prop("Region", region),
            Message::new(Op::DeleteItemRequest).with_id(id),
        ],
    }
}

pub type Handler<L> = fn(&L, &Message) -> Result<Option<Message>, LayerError>;

/// Op-code dispatch for one layer variant. Ops without an entry are
/// answered with [`LayerError::Unhandled`] naming the layer.
pub struct HandlerTable<L> {
    kind: LayerKind,
    handlers: HashMap<Op, Handler<L>>,
}

impl<L> HandlerTable<L> {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, op: Op, handler: Handler<L>) -> Self {
        self.handlers.insert(op, handler);
        self
    }

    pub fn dispatch(&self, layer: &L, msg: &Message) -> Result<Option<Message>, LayerError> {
        match self.handlers.get(&msg.op) {
            Some(handler) => handler(layer, msg),
            None => Err(LayerError::Unhandled {
                layer: self.kind,
                op: msg.op,
            }),
        }
    }
}

/// Layers that serve scene items.
pub trait ContentLayer {
    fn core(&self) -> &LayerCore;

    /// Topics whose items this layer owns.
    fn topics(&self) -> &'static [SceneTopic];
}

impl<L: ContentLayer + 'static> HandlerTable<L> {
    /// A table answering AliveCheck and RequestProperties.
    pub fn content(kind: LayerKind) -> Self {
        Self::new(kind)
            .on(Op::AliveCheckRequest, alive_check)
            .on(Op::RequestPropertiesRequest, request_properties)
    }
}

pub fn alive_check<L>(_: &L, msg: &Message) -> Result<Option<Message>, LayerError> {
    Ok(Some(msg.response()))
}

fn request_properties<L: ContentLayer>(
    layer: &L,
    msg: &Message,
) -> Result<Option<Message>, LayerError> {
    let id = msg.id.as_deref().ok_or(LayerError::MissingId { op: msg.op })?;
    let item = layer
        .core()
        .find(id, layer.topics())
        .ok_or_else(|| LayerError::NotFound(id.to_string()))?;
    Ok(Some(msg.response().with_props(item.properties)))
}

/// Content-layer update: only the owner of an item may change it.
fn update_owned<L: ContentLayer>(layer: &L, msg: &Message) -> Result<Option<Message>, LayerError> {
    let core = layer.core();
    let id = msg.id.as_deref().ok_or(LayerError::MissingId { op: msg.op })?;
    let owned = core
        .find(id, layer.topics())
        .is_some_and(|item| item.is_owned_by(core.identity().agent()));
    if !owned {
        return Err(LayerError::Unauthorized("update of non-owned item"));
    }
    let item = core.shared().scene.update_item(id, &msg.properties)?;
    Ok(Some(msg.response().with_props(item.properties)))
}
