use super::{ContentLayer, HandlerTable, LayerCore, LayerInstance, update_owned};
use crate::error::LayerError;
use crate::scene::SceneTopic;
use std::sync::LazyLock;
use strata_core::{Identity, LayerKind, Message, Op};

static HANDLERS: LazyLock<HandlerTable<ActorLayer>> = LazyLock::new(|| {
    HandlerTable::content(LayerKind::Actor).on(Op::UpdatePropertiesRequest, update_owned)
});

/// Avatar control. The peer's avatar enters the scene when the layer starts
/// and leaves when it shuts down; the peer may only move its own avatar.
pub struct ActorLayer {
    core: LayerCore,
}

impl ActorLayer {
    pub fn new(core: LayerCore) -> Self {
        Self { core }
    }
}

impl ContentLayer for ActorLayer {
    fn core(&self) -> &LayerCore {
        &self.core
    }

    fn topics(&self) -> &'static [SceneTopic] {
        &[SceneTopic::Avatars]
    }
}

impl LayerInstance for ActorLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Actor
    }

    fn identity(&self) -> &Identity {
        self.core.identity()
    }

    fn start(&self) -> Result<(), LayerError> {
        let scene = &self.core.shared().scene;
        let agent = self.core.identity().agent();
        // Follow before entering: a fresh avatar reaches the peer through
        // its own Added event, ahead of the snapshot.
        let present = scene.avatar_for(agent).is_some();
        self.core.follow(SceneTopic::Avatars);
        let own = scene.enter(agent);
        if present {
            self.core.push_item(&own);
        }
        for avatar in scene.items(SceneTopic::Avatars) {
            if avatar.id != own.id {
                self.core.push_item(&avatar);
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.core.shutdown();
        let shared = self.core.shared();
        let identity = self.core.identity();
        if shared.has_other_session(LayerKind::Actor, identity, self.core.conn().key()) {
            return;
        }
        shared.scene.leave(identity.agent());
    }

    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError> {
        HANDLERS.dispatch(self, msg)
    }
}
