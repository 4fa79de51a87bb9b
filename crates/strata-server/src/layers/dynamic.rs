use super::{ContentLayer, HandlerTable, LayerCore, LayerInstance, update_owned};
use crate::error::LayerError;
use crate::scene::SceneTopic;
use std::sync::LazyLock;
use strata_core::{Identity, LayerKind, Message, Op};

static HANDLERS: LazyLock<HandlerTable<DynamicLayer>> = LazyLock::new(|| {
    HandlerTable::content(LayerKind::Dynamic).on(Op::UpdatePropertiesRequest, update_owned)
});

/// Dynamic objects: streams every change, accepts updates to owned objects.
pub struct DynamicLayer {
    core: LayerCore,
}

impl DynamicLayer {
    pub fn new(core: LayerCore) -> Self {
        Self { core }
    }
}

impl ContentLayer for DynamicLayer {
    fn core(&self) -> &LayerCore {
        &self.core
    }

    fn topics(&self) -> &'static [SceneTopic] {
        &[SceneTopic::Objects]
    }
}

impl LayerInstance for DynamicLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Dynamic
    }

    fn identity(&self) -> &Identity {
        self.core.identity()
    }

    fn start(&self) -> Result<(), LayerError> {
        self.core.load(SceneTopic::Objects);
        Ok(())
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError> {
        HANDLERS.dispatch(self, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::scene::{MemoryScene, SceneItem};
    use std::sync::Arc;

    #[tokio::test]
    async fn owned_objects_update_and_fan_out() {
        let scene = Arc::new(MemoryScene::new("r"));
        scene.insert(SceneTopic::Objects, SceneItem::new("cart").owned_by("alice"));
        scene.insert(SceneTopic::Objects, SceneItem::new("rock"));
        let identity = Identity::new("alice", "s1");
        let (conn, mut peer) = open_connection(LayerKind::Dynamic, &identity).await;
        let layer = DynamicLayer::new(LayerCore::new(
            LayerKind::Dynamic,
            shared_with(scene.clone()),
            conn,
            identity,
        ));
        layer.start().unwrap();
        for _ in 0..4 {
            recv(&mut peer).await;
        }

        let push = Message::new(Op::UpdatePropertiesRequest)
            .with_id("cart")
            .with_prop("Velocity", "<1,0,0>");
        layer.handle(&push).unwrap();
        let update = recv(&mut peer).await;
        assert_eq!(update.op, Op::UpdatePropertiesRequest);
        assert_eq!(update.prop("Velocity"), Some("<1,0,0>"));

        let err = layer
            .handle(&Message::new(Op::UpdatePropertiesRequest).with_id("rock"))
            .unwrap_err();
        assert!(matches!(err, LayerError::Unauthorized(_)));
    }
}
