//! The simulation side as seen by the layers.
//!
//! Layers never own world state. They read items through [`Scene`], push
//! changes back through it, and follow changes by subscribing to a
//! [`SceneTopic`]. Every subscription is a [`Subscription`] handle; dropping
//! or unsubscribing it detaches the listener.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use strata_core::Properties;
use thiserror::Error;

/// A scene object as it is shipped to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneItem {
    pub id: String,
    /// Agent allowed to modify the item, if any.
    pub owner: Option<String>,
    pub properties: Properties,
}

impl SceneItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
            properties: Properties::new(),
        }
    }

    pub fn owned_by(mut self, agent: impl Into<String>) -> Self {
        self.owner = Some(agent.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn is_owned_by(&self, agent: &str) -> bool {
        self.owner.as_deref() == Some(agent)
    }
}

/// Streams of scene changes a layer can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SceneTopic {
    /// Terrain and other content that rarely changes.
    Static,
    /// Dynamic objects.
    Objects,
    /// Avatars of connected agents.
    Avatars,
    /// Region-wide environment settings.
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneEvent {
    Added(SceneItem),
    Updated(SceneItem),
    Removed(String),
}

pub type SceneListener = Arc<dyn Fn(&SceneEvent) + Send + Sync>;

/// Detaches a scene listener when unsubscribed or dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("no such item: {0}")]
    NotFound(String),
    #[error("item {0} is read-only")]
    ReadOnly(String),
}

/// World state owned by the simulation.
pub trait Scene: Send + Sync {
    fn region_name(&self) -> String;

    /// Current items on a topic.
    fn items(&self, topic: SceneTopic) -> Vec<SceneItem>;

    fn item(&self, id: &str) -> Option<SceneItem>;

    /// The avatar of `agent`, created on first entry.
    fn enter(&self, agent: &str) -> SceneItem;

    /// Remove the avatar of `agent`, if present.
    fn leave(&self, agent: &str);

    fn avatar_for(&self, agent: &str) -> Option<SceneItem>;

    /// Merge `properties` into an item and publish the change.
    fn update_item(&self, id: &str, properties: &Properties) -> Result<SceneItem, SceneError>;

    fn subscribe(&self, topic: SceneTopic, listener: SceneListener) -> Subscription;
}

#[derive(Default)]
struct SceneState {
    items: BTreeMap<String, (SceneTopic, SceneItem)>,
    listeners: Vec<(u64, SceneTopic, SceneListener)>,
    next_listener: u64,
}

/// In-process [`Scene`] for running without a simulator.
pub struct MemoryScene {
    region: String,
    state: Arc<Mutex<SceneState>>,
}

impl MemoryScene {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Arc::new(Mutex::new(SceneState::default())),
        }
    }

    /// A small populated region.
    pub fn demo(region: impl Into<String>) -> Self {
        let scene = Self::new(region);
        scene.insert(
            SceneTopic::Static,
            SceneItem::new("terrain")
                .with_prop("Kind", "Terrain")
                .with_prop("Size", "<256,256,0>"),
        );
        scene.insert(
            SceneTopic::Static,
            SceneItem::new("sky").with_prop("Kind", "Skybox"),
        );
        scene.insert(
            SceneTopic::Objects,
            SceneItem::new("crate-1")
                .with_prop("Kind", "Box")
                .with_prop("Position", "<120,130,22>"),
        );
        scene.insert(
            SceneTopic::Environment,
            SceneItem::new("environment")
                .with_prop("RegionName", &scene.region)
                .with_prop("SunPhase", 0.25)
                .with_prop("WaterHeight", 20),
        );
        scene
    }

    /// Add or replace an item, publishing `Added` or `Updated`.
    pub fn insert(&self, topic: SceneTopic, item: SceneItem) {
        let event = {
            let mut state = self.state.lock();
            let existed = state
                .items
                .insert(item.id.clone(), (topic, item.clone()))
                .is_some();
            if existed {
                SceneEvent::Updated(item)
            } else {
                SceneEvent::Added(item)
            }
        };
        self.publish(topic, &event);
    }

    pub fn remove(&self, id: &str) -> Option<SceneItem> {
        let (topic, item) = self.state.lock().items.remove(id)?;
        self.publish(topic, &SceneEvent::Removed(id.to_string()));
        Some(item)
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Listeners run outside the lock so they may call back into the scene.
    fn publish(&self, topic: SceneTopic, event: &SceneEvent) {
        let listeners: Vec<SceneListener> = self
            .state
            .lock()
            .listeners
            .iter()
            .filter(|(_, t, _)| *t == topic)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn avatar_id(agent: &str) -> String {
        format!("avatar:{agent}")
    }
}

impl Scene for MemoryScene {
    fn region_name(&self) -> String {
        self.region.clone()
    }

    fn items(&self, topic: SceneTopic) -> Vec<SceneItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|(t, _)| *t == topic)
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn item(&self, id: &str) -> Option<SceneItem> {
        self.state.lock().items.get(id).map(|(_, item)| item.clone())
    }

    fn enter(&self, agent: &str) -> SceneItem {
        if let Some(avatar) = self.avatar_for(agent) {
            return avatar;
        }
        let avatar = SceneItem::new(Self::avatar_id(agent))
            .owned_by(agent)
            .with_prop("Name", agent)
            .with_prop("Position", "<128,128,25>");
        self.insert(SceneTopic::Avatars, avatar.clone());
        avatar
    }

    fn leave(&self, agent: &str) {
        self.remove(&Self::avatar_id(agent));
    }

    fn avatar_for(&self, agent: &str) -> Option<SceneItem> {
        self.item(&Self::avatar_id(agent))
    }

    fn update_item(&self, id: &str, properties: &Properties) -> Result<SceneItem, SceneError> {
        let (topic, item) = {
            let mut state = self.state.lock();
            let (topic, item) = state
                .items
                .get_mut(id)
                .ok_or_else(|| SceneError::NotFound(id.to_string()))?;
            if *topic == SceneTopic::Static {
                return Err(SceneError::ReadOnly(id.to_string()));
            }
            item.properties
                .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            (*topic, item.clone())
        };
        self.publish(topic, &SceneEvent::Updated(item.clone()));
        Ok(item)
    }

    fn subscribe(&self, topic: SceneTopic, listener: SceneListener) -> Subscription {
        let key = {
            let mut state = self.state.lock();
            let key = state.next_listener;
            state.next_listener += 1;
            state.listeners.push((key, topic, listener));
            key
        };
        let state: Weak<Mutex<SceneState>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().listeners.retain(|(k, _, _)| *k != key);
            }
        })
    }
}
