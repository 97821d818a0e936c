//! Twin registry
//!
//! The engine manages multiple named twins over one shared bus:
//! create, start, stop, remove, enumerate. Registration mistakes
//! (duplicate or unknown twin ids) are configuration errors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use doppel_bus::EventBus;
use doppel_core::{TwinError, TwinId, TwinResult};

use crate::twin::DigitalTwin;

/// Registry of named twin instances sharing one bus
pub struct TwinEngine {
    bus: Arc<EventBus>,
    twins: HashMap<TwinId, DigitalTwin>,
}

impl TwinEngine {
    pub fn new() -> Self {
        TwinEngine {
            bus: Arc::new(EventBus::new()),
            twins: HashMap::new(),
        }
    }

    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        TwinEngine {
            bus,
            twins: HashMap::new(),
        }
    }

    /// The bus every twin of this engine must be constructed on
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn add_twin(&mut self, twin: DigitalTwin) -> TwinResult<()> {
        let twin_id = twin.id().clone();
        if self.twins.contains_key(&twin_id) {
            return Err(TwinError::Configuration(format!(
                "twin '{}' is already registered",
                twin_id
            )));
        }
        info!(twin = %twin_id, "twin registered");
        self.twins.insert(twin_id, twin);
        Ok(())
    }

    pub fn start_twin(&mut self, twin_id: &TwinId) -> TwinResult<()> {
        self.twin_mut(twin_id)?.start()
    }

    pub async fn stop_twin(&mut self, twin_id: &TwinId) -> TwinResult<()> {
        self.twin_mut(twin_id)?.stop().await
    }

    /// Unregister a twin, stopping it first if it is running, and clear
    /// its bus namespace.
    pub async fn remove_twin(&mut self, twin_id: &TwinId) -> TwinResult<()> {
        let mut twin = self.twins.remove(twin_id).ok_or_else(|| {
            TwinError::Configuration(format!("unknown twin '{}'", twin_id))
        })?;
        if twin.is_running() {
            twin.stop().await?;
        }
        self.bus.drop_twin(twin_id);
        info!(twin = %twin_id, "twin removed");
        Ok(())
    }

    pub fn twin(&self, twin_id: &TwinId) -> Option<&DigitalTwin> {
        self.twins.get(twin_id)
    }

    pub fn twin_ids(&self) -> Vec<TwinId> {
        self.twins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.twins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.twins.is_empty()
    }

    fn twin_mut(&mut self, twin_id: &TwinId) -> TwinResult<&mut DigitalTwin> {
        self.twins.get_mut(twin_id).ok_or_else(|| {
            TwinError::Configuration(format!("unknown twin '{}'", twin_id))
        })
    }
}

impl Default for TwinEngine {
    fn default() -> Self {
        TwinEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSignal;
    use crate::shadowing::{PhysicalSignal, ShadowingContext, ShadowingFunction};

    struct NoopShadowing;

    impl ShadowingFunction for NoopShadowing {
        fn on_lifecycle(
            &mut self,
            _ctx: &ShadowingContext,
            _signal: &LifecycleSignal,
        ) -> TwinResult<()> {
            Ok(())
        }

        fn on_physical(
            &mut self,
            _ctx: &ShadowingContext,
            _signal: PhysicalSignal,
        ) -> TwinResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_twin_id_is_a_configuration_error() {
        let mut engine = TwinEngine::new();
        engine
            .add_twin(DigitalTwin::new("hvac", engine.bus(), Box::new(NoopShadowing)))
            .unwrap();
        let err = engine
            .add_twin(DigitalTwin::new("hvac", engine.bus(), Box::new(NoopShadowing)))
            .unwrap_err();
        assert!(matches!(err, TwinError::Configuration(_)));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_unknown_twin_is_a_configuration_error() {
        let mut engine = TwinEngine::new();
        let err = engine.start_twin(&TwinId::new("ghost")).unwrap_err();
        assert!(matches!(err, TwinError::Configuration(_)));
    }

    #[test]
    fn test_twin_enumeration() {
        let mut engine = TwinEngine::new();
        assert!(engine.is_empty());
        engine
            .add_twin(DigitalTwin::new("hvac", engine.bus(), Box::new(NoopShadowing)))
            .unwrap();
        engine
            .add_twin(DigitalTwin::new("chiller", engine.bus(), Box::new(NoopShadowing)))
            .unwrap();

        let mut ids = engine.twin_ids();
        ids.sort();
        assert_eq!(ids, vec![TwinId::new("chiller"), TwinId::new("hvac")]);
    }
}
