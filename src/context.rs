use std::sync::Arc;

use crate::{
    bus::{MessageBus, NoopBus},
    config::CoreSettings,
};

/// Settings plus the change publisher, built once and shared by every manager opened from it.
pub struct EngineContext {
    settings: CoreSettings,
    bus: Arc<dyn MessageBus>,
}

impl EngineContext {
    pub fn new(settings: CoreSettings, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self { settings, bus })
    }

    /// Context whose change events go nowhere.
    pub fn without_bus(settings: CoreSettings) -> Arc<Self> {
        Self::new(settings, Arc::new(NoopBus))
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn bus(&self) -> &dyn MessageBus {
        self.bus.as_ref()
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
