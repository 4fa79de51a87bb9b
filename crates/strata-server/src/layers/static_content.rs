use super::{ContentLayer, HandlerTable, LayerCore, LayerInstance};
use crate::error::LayerError;
use crate::scene::SceneTopic;
use std::sync::LazyLock;
use strata_core::{Identity, LayerKind, Message};

static HANDLERS: LazyLock<HandlerTable<StaticLayer>> =
    LazyLock::new(|| HandlerTable::content(LayerKind::Static));

/// Delivers region content that rarely changes.
pub struct StaticLayer {
    core: LayerCore,
}

impl StaticLayer {
    pub fn new(core: LayerCore) -> Self {
        Self { core }
    }
}

impl ContentLayer for StaticLayer {
    fn core(&self) -> &LayerCore {
        &self.core
    }

    fn topics(&self) -> &'static [SceneTopic] {
        &[SceneTopic::Static]
    }
}

impl LayerInstance for StaticLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Static
    }

    fn identity(&self) -> &Identity {
        self.core.identity()
    }

    fn start(&self) -> Result<(), LayerError> {
        self.core.load(SceneTopic::Static);
        Ok(())
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError> {
        HANDLERS.dispatch(self, msg)
    }
}
