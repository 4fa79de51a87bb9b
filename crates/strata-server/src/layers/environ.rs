use super::{ContentLayer, HandlerTable, LayerCore, LayerInstance};
use crate::error::LayerError;
use crate::scene::SceneTopic;
use std::sync::LazyLock;
use strata_core::{Identity, LayerKind, Message};

static HANDLERS: LazyLock<HandlerTable<EnvironLayer>> =
    LazyLock::new(|| HandlerTable::content(LayerKind::Environ));

/// Region environment (sun, water, region settings).
pub struct EnvironLayer {
    core: LayerCore,
}

impl EnvironLayer {
    pub fn new(core: LayerCore) -> Self {
        Self { core }
    }
}

impl ContentLayer for EnvironLayer {
    fn core(&self) -> &LayerCore {
        &self.core
    }

    fn topics(&self) -> &'static [SceneTopic] {
        &[SceneTopic::Environment]
    }
}

impl LayerInstance for EnvironLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Environ
    }

    fn identity(&self) -> &Identity {
        self.core.identity()
    }

    fn start(&self) -> Result<(), LayerError> {
        self.core.load(SceneTopic::Environment);
        Ok(())
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn handle(&self, msg: &Message) -> Result<Option<Message>, LayerError> {
        HANDLERS.dispatch(self, msg)
    }
}
