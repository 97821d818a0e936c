//! Lifecycle coordinator
//!
//! A [`DigitalTwin`] owns one twin's adapter set, its shadowing
//! function and its state manager. On start it spawns one worker task
//! per adapter plus the shadowing worker; adapter bound/unbound
//! announcements arrive over the bus and feed per-adapter bound maps,
//! whose aggregate drives the twin-level BOUND/UN_BOUND edges. The
//! twin-level aggregate derives from physical adapters only; digital
//! adapter bound status is tracked and fanned out but never feeds it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use doppel_bus::{EventBus, EventListener};
use doppel_core::{
    topics, AdapterId, EventEnvelope, TopicFilter, TwinError, TwinId, TwinResult,
    METADATA_ADAPTER_ID, METADATA_ERROR, METADATA_LIFECYCLE_STATE,
};
use doppel_state::StateManager;

use crate::digital::{self, DigitalAdapter, DigitalAdapterEndpoint, DigitalCommand, StateForwarder};
use crate::lifecycle::{LifecycleListener, LifecycleSignal, LifecycleState};
use crate::physical::{
    self, ActionForwarder, AssetDescription, PhysicalAdapter, PhysicalAdapterEndpoint,
    PhysicalCommand,
};
use crate::shadowing::{
    self, PhysicalForwarder, ShadowingCommand, ShadowingContext, ShadowingFunction,
};

const COORDINATOR_ID: &str = "dt-lifecycle-coordinator";

/// Worker-pool limits for one twin
#[derive(Clone, Copy, Debug)]
pub struct TwinConfig {
    pub physical_adapter_cap: usize,
    pub digital_adapter_cap: usize,
}

impl Default for TwinConfig {
    fn default() -> Self {
        TwinConfig {
            physical_adapter_cap: 5,
            digital_adapter_cap: 5,
        }
    }
}

/// Coordinator state guarded by one mutex: aggregate recomputation is
/// atomic with the per-adapter map update, so BOUND/UN_BOUND edges are
/// never missed or double-fired.
struct CoordinatorInner {
    lifecycle: LifecycleState,
    twin_bound: bool,
    physical_bound: HashMap<AdapterId, bool>,
    digital_bound: HashMap<AdapterId, bool>,
    descriptions: HashMap<AdapterId, AssetDescription>,
}

/// Coordinator internals shared with the bus listener
struct TwinShared {
    twin_id: TwinId,
    bus: Arc<EventBus>,
    inner: Mutex<CoordinatorInner>,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    shadowing_tx: Mutex<Option<mpsc::UnboundedSender<ShadowingCommand>>>,
    digital_txs: Mutex<Vec<(AdapterId, mpsc::UnboundedSender<DigitalCommand>)>>,
}

impl TwinShared {
    /// Advance the twin-level state machine and fan out the signal
    fn transition(&self, state: LifecycleState, signal: LifecycleSignal) {
        self.inner.lock().lifecycle = state;
        self.fan_out(signal);
    }

    /// Deliver one signal to the `dt.lifecycle` topic (twin-level
    /// transitions only), every registered listener, the shadowing
    /// worker and every digital adapter worker.
    fn fan_out(&self, signal: LifecycleSignal) {
        if let Some(state) = signal.state() {
            info!(twin = %self.twin_id, state = %state, "lifecycle transition");
            let envelope = EventEnvelope::new(topics::LIFECYCLE)
                .with_body_value(Value::String(state.label().to_string()))
                .with_metadata(
                    METADATA_LIFECYCLE_STATE,
                    Value::String(state.label().to_string()),
                );
            if let Err(err) = self.bus.publish(&self.twin_id, COORDINATOR_ID, envelope) {
                warn!(twin = %self.twin_id, "lifecycle publish failed: {}", err);
            }
        }

        let listeners: Vec<Arc<dyn LifecycleListener>> = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_lifecycle(&signal);
        }

        if let Some(tx) = self.shadowing_tx.lock().as_ref() {
            let _ = tx.send(ShadowingCommand::Lifecycle(signal.clone()));
        }
        for (_, tx) in self.digital_txs.lock().iter() {
            let _ = tx.send(DigitalCommand::Lifecycle(signal.clone()));
        }
    }

    fn handle_runtime_event(&self, event: &Arc<EventEnvelope>) {
        let topic = event.topic().as_str();
        match topic {
            topics::PHYSICAL_ADAPTER_BOUND | topics::PHYSICAL_ADAPTER_BINDING_UPDATED => {
                let Some(adapter_id) = event.metadata_str(METADATA_ADAPTER_ID) else {
                    warn!(twin = %self.twin_id, %topic, "announcement without adapter id dropped");
                    return;
                };
                let description: AssetDescription =
                    match serde_json::from_value(event.body().clone()) {
                        Ok(description) => description,
                        Err(e) => {
                            warn!(twin = %self.twin_id, %topic,
                                  "malformed asset description dropped: {}", e);
                            return;
                        }
                    };
                if topic == topics::PHYSICAL_ADAPTER_BOUND {
                    self.on_physical_bound(AdapterId::new(adapter_id), description);
                } else {
                    self.on_physical_binding_updated(AdapterId::new(adapter_id), description);
                }
            }
            topics::PHYSICAL_ADAPTER_UNBOUND => {
                let Some(adapter_id) = event.metadata_str(METADATA_ADAPTER_ID) else {
                    warn!(twin = %self.twin_id, %topic, "announcement without adapter id dropped");
                    return;
                };
                let error = event.metadata_str(METADATA_ERROR).map(str::to_string);
                self.on_physical_unbound(AdapterId::new(adapter_id), error);
            }
            topics::DIGITAL_ADAPTER_BOUND | topics::DIGITAL_ADAPTER_UNBOUND => {
                let Some(adapter_id) = event.metadata_str(METADATA_ADAPTER_ID) else {
                    warn!(twin = %self.twin_id, %topic, "announcement without adapter id dropped");
                    return;
                };
                let error = event.metadata_str(METADATA_ERROR).map(str::to_string);
                self.on_digital_binding(
                    AdapterId::new(adapter_id),
                    topic == topics::DIGITAL_ADAPTER_BOUND,
                    error,
                );
            }
            topics::SHADOWING_SYNC => self.on_shadowing_sync(true),
            topics::SHADOWING_UNSYNC => self.on_shadowing_sync(false),
            _ => {}
        }
    }

    fn on_physical_bound(&self, adapter_id: AdapterId, description: AssetDescription) {
        let mut signals = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.physical_bound.get_mut(&adapter_id) else {
                warn!(twin = %self.twin_id, adapter = %adapter_id,
                      "bound report from unregistered physical adapter dropped");
                return;
            };
            *slot = true;
            inner
                .descriptions
                .insert(adapter_id.clone(), description.clone());
            signals.push(LifecycleSignal::PhysicalAdapterBound {
                adapter_id,
                description,
            });
            if !inner.twin_bound && inner.physical_bound.values().all(|bound| *bound) {
                inner.twin_bound = true;
                inner.lifecycle = LifecycleState::Bound;
                signals.push(LifecycleSignal::Bound {
                    descriptions: inner.descriptions.clone(),
                });
            }
        }
        for signal in signals {
            self.fan_out(signal);
        }
    }

    fn on_physical_binding_updated(&self, adapter_id: AdapterId, description: AssetDescription) {
        {
            let mut inner = self.inner.lock();
            if !inner.physical_bound.contains_key(&adapter_id) {
                warn!(twin = %self.twin_id, adapter = %adapter_id,
                      "binding update from unregistered physical adapter dropped");
                return;
            }
            inner
                .descriptions
                .insert(adapter_id.clone(), description.clone());
        }
        self.fan_out(LifecycleSignal::PhysicalAdapterBindingUpdated {
            adapter_id,
            description,
        });
    }

    fn on_physical_unbound(&self, adapter_id: AdapterId, error: Option<String>) {
        let mut signals = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.physical_bound.get_mut(&adapter_id) else {
                warn!(twin = %self.twin_id, adapter = %adapter_id,
                      "unbound report from unregistered physical adapter dropped");
                return;
            };
            *slot = false;
            signals.push(LifecycleSignal::PhysicalAdapterUnbound {
                adapter_id,
                error: error.clone(),
            });
            if inner.twin_bound {
                inner.twin_bound = false;
                inner.lifecycle = LifecycleState::Unbound;
                signals.push(LifecycleSignal::Unbound { error });
            }
        }
        for signal in signals {
            self.fan_out(signal);
        }
    }

    fn on_digital_binding(&self, adapter_id: AdapterId, bound: bool, error: Option<String>) {
        {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.digital_bound.get_mut(&adapter_id) else {
                warn!(twin = %self.twin_id, adapter = %adapter_id,
                      "binding report from unregistered digital adapter dropped");
                return;
            };
            *slot = bound;
        }
        let signal = if bound {
            LifecycleSignal::DigitalAdapterBound { adapter_id }
        } else {
            LifecycleSignal::DigitalAdapterUnbound { adapter_id, error }
        };
        self.fan_out(signal);
    }

    fn on_shadowing_sync(&self, synchronized: bool) {
        let (target, signal) = if synchronized {
            (LifecycleState::Synchronized, LifecycleSignal::Synchronized)
        } else {
            (
                LifecycleState::NotSynchronized,
                LifecycleSignal::NotSynchronized,
            )
        };
        {
            let mut inner = self.inner.lock();
            if inner.lifecycle == target {
                return;
            }
            inner.lifecycle = target;
        }
        self.fan_out(signal);
    }
}

/// Bus listener feeding adapter announcements and shadowing sync
/// signals into the coordinator
struct CoordinatorListener {
    shared: Arc<TwinShared>,
}

impl EventListener for CoordinatorListener {
    fn on_event(&self, event: &Arc<EventEnvelope>) {
        self.shared.handle_runtime_event(event);
    }
}

/// One running digital twin: adapter workers, shadowing worker, state
/// manager and the twin-level lifecycle state machine
pub struct DigitalTwin {
    shared: Arc<TwinShared>,
    state: Arc<StateManager>,
    config: TwinConfig,
    shadowing: Option<Box<dyn ShadowingFunction>>,
    pending_physical: Vec<Box<dyn PhysicalAdapter>>,
    pending_digital: Vec<Box<dyn DigitalAdapter>>,
    physical_txs: Vec<(AdapterId, mpsc::UnboundedSender<PhysicalCommand>)>,
    handles: Vec<JoinHandle<()>>,
}

impl DigitalTwin {
    pub fn new(
        twin_id: impl Into<TwinId>,
        bus: Arc<EventBus>,
        shadowing: Box<dyn ShadowingFunction>,
    ) -> Self {
        let twin_id = twin_id.into();
        let state = Arc::new(StateManager::new(twin_id.clone(), Arc::clone(&bus)));
        DigitalTwin {
            shared: Arc::new(TwinShared {
                twin_id,
                bus,
                inner: Mutex::new(CoordinatorInner {
                    lifecycle: LifecycleState::None,
                    twin_bound: false,
                    physical_bound: HashMap::new(),
                    digital_bound: HashMap::new(),
                    descriptions: HashMap::new(),
                }),
                listeners: Mutex::new(Vec::new()),
                shadowing_tx: Mutex::new(None),
                digital_txs: Mutex::new(Vec::new()),
            }),
            state,
            config: TwinConfig::default(),
            shadowing: Some(shadowing),
            pending_physical: Vec::new(),
            pending_digital: Vec::new(),
            physical_txs: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: TwinConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &TwinId {
        &self.shared.twin_id
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.inner.lock().lifecycle
    }

    pub fn is_bound(&self) -> bool {
        self.shared.inner.lock().twin_bound
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.lifecycle(),
            LifecycleState::Created
                | LifecycleState::Started
                | LifecycleState::Bound
                | LifecycleState::Unbound
                | LifecycleState::Synchronized
                | LifecycleState::NotSynchronized
        )
    }

    /// The twin's transaction engine (shared with the shadowing worker)
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.shared.listeners.lock().push(listener);
    }

    /// Register a physical adapter. Fails on a duplicate id or once the
    /// configured cap is reached. Adapters registered after start are
    /// spawned immediately and begin unbound.
    pub fn add_physical_adapter(&mut self, adapter: Box<dyn PhysicalAdapter>) -> TwinResult<()> {
        let adapter_id = adapter.id();
        {
            let mut inner = self.shared.inner.lock();
            if inner.physical_bound.contains_key(&adapter_id) {
                return Err(TwinError::Configuration(format!(
                    "physical adapter '{}' is already registered",
                    adapter_id
                )));
            }
            if inner.physical_bound.len() >= self.config.physical_adapter_cap {
                return Err(TwinError::Configuration(format!(
                    "physical adapter cap ({}) reached",
                    self.config.physical_adapter_cap
                )));
            }
            inner.physical_bound.insert(adapter_id, false);
        }
        if self.is_running() {
            self.spawn_physical(adapter);
        } else {
            self.pending_physical.push(adapter);
        }
        Ok(())
    }

    /// Register a digital adapter; same rules as physical registration.
    pub fn add_digital_adapter(&mut self, adapter: Box<dyn DigitalAdapter>) -> TwinResult<()> {
        let adapter_id = adapter.id();
        {
            let mut inner = self.shared.inner.lock();
            if inner.digital_bound.contains_key(&adapter_id) {
                return Err(TwinError::Configuration(format!(
                    "digital adapter '{}' is already registered",
                    adapter_id
                )));
            }
            if inner.digital_bound.len() >= self.config.digital_adapter_cap {
                return Err(TwinError::Configuration(format!(
                    "digital adapter cap ({}) reached",
                    self.config.digital_adapter_cap
                )));
            }
            inner.digital_bound.insert(adapter_id, false);
        }
        if self.is_running() {
            self.spawn_digital(adapter);
        } else {
            self.pending_digital.push(adapter);
        }
        Ok(())
    }

    /// Boot the twin: NONE → CREATED → STARTED.
    ///
    /// Requires at least one physical and one digital adapter; spawns
    /// one worker task per adapter plus the shadowing worker. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self) -> TwinResult<()> {
        if self.lifecycle() != LifecycleState::None {
            return Err(TwinError::BadRequest(format!(
                "twin '{}' has already been started",
                self.shared.twin_id
            )));
        }
        if self.pending_physical.is_empty() {
            return Err(TwinError::Configuration(
                "starting a twin requires at least one physical adapter".to_string(),
            ));
        }
        if self.pending_digital.is_empty() {
            return Err(TwinError::Configuration(
                "starting a twin requires at least one digital adapter".to_string(),
            ));
        }
        let shadowing = self.shadowing.take().ok_or_else(|| {
            TwinError::Configuration(format!(
                "twin '{}' cannot be restarted",
                self.shared.twin_id
            ))
        })?;

        let listener: Arc<dyn EventListener> = Arc::new(CoordinatorListener {
            shared: Arc::clone(&self.shared),
        });
        self.shared.bus.subscribe(
            &self.shared.twin_id,
            COORDINATOR_ID,
            &TopicFilter::of([
                topics::PHYSICAL_ADAPTER_BOUND,
                topics::PHYSICAL_ADAPTER_BINDING_UPDATED,
                topics::PHYSICAL_ADAPTER_UNBOUND,
                topics::DIGITAL_ADAPTER_BOUND,
                topics::DIGITAL_ADAPTER_UNBOUND,
                topics::SHADOWING_SYNC,
                topics::SHADOWING_UNSYNC,
            ]),
            listener,
        );

        // The shadowing and digital command channels exist before the
        // first transition so the Created signal is queued for every
        // worker, not only for those already spawned.
        let (shadow_tx, shadow_rx) = mpsc::unbounded_channel();
        *self.shared.shadowing_tx.lock() = Some(shadow_tx.clone());

        let pending_digital: Vec<_> = self.pending_digital.drain(..).collect();
        let mut digital = Vec::with_capacity(pending_digital.len());
        for adapter in pending_digital {
            let (endpoint, rx) = self.register_digital_channel(&adapter.id());
            digital.push((adapter, endpoint, rx));
        }

        self.shared
            .transition(LifecycleState::Created, LifecycleSignal::Created);

        let ctx = ShadowingContext::new(
            self.shared.twin_id.clone(),
            Arc::clone(&self.shared.bus),
            Arc::clone(&self.state),
            Arc::new(PhysicalForwarder::new(shadow_tx)),
        );
        self.handles
            .push(tokio::spawn(shadowing::run_worker(shadowing, ctx, shadow_rx)));

        let physical: Vec<_> = self.pending_physical.drain(..).collect();
        for adapter in physical {
            self.spawn_physical(adapter);
        }
        for (adapter, endpoint, rx) in digital {
            self.handles
                .push(tokio::spawn(digital::run_worker(adapter, endpoint, rx)));
        }

        self.shared
            .transition(LifecycleState::Started, LifecycleSignal::Started);
        Ok(())
    }

    /// Tear the twin down: issue stop commands to the shadowing,
    /// physical and digital workers in that order (each invokes its
    /// adapter's stop callback), broadcast STOPPED then DESTROYED, and
    /// join every worker handle. The command channels are FIFO, so each
    /// shadowing/digital worker runs its stop callback first and then
    /// observes the two final signals, exiting on Destroyed.
    /// Best-effort: stop requests are issued without waiting for the
    /// callbacks to complete, so registered listeners may observe the
    /// broadcast while a callback is still running; in-flight bus
    /// deliveries are not drained.
    pub async fn stop(&mut self) -> TwinResult<()> {
        match self.lifecycle() {
            LifecycleState::None => {
                return Err(TwinError::BadRequest(format!(
                    "twin '{}' was never started",
                    self.shared.twin_id
                )))
            }
            LifecycleState::Stopped | LifecycleState::Destroyed => {
                return Err(TwinError::BadRequest(format!(
                    "twin '{}' is already stopped",
                    self.shared.twin_id
                )))
            }
            _ => {}
        }

        // Stop commands go out before the broadcast: each FIFO channel
        // then delivers the stop callback first and the two final
        // signals after it, and the worker exits on Destroyed.
        if let Some(tx) = self.shared.shadowing_tx.lock().as_ref() {
            let _ = tx.send(ShadowingCommand::Stop);
        }
        for (_, tx) in &self.physical_txs {
            let _ = tx.send(PhysicalCommand::Stop);
        }
        for (_, tx) in self.shared.digital_txs.lock().iter() {
            let _ = tx.send(DigitalCommand::Stop);
        }

        self.shared
            .transition(LifecycleState::Stopped, LifecycleSignal::Stopped);
        self.shared
            .transition(LifecycleState::Destroyed, LifecycleSignal::Destroyed);

        *self.shared.shadowing_tx.lock() = None;
        self.physical_txs.clear();
        self.shared.digital_txs.lock().clear();

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(twin = %self.shared.twin_id, "worker join failed: {}", err);
            }
        }
        info!(twin = %self.shared.twin_id, "twin stopped");
        Ok(())
    }

    fn spawn_physical(&mut self, adapter: Box<dyn PhysicalAdapter>) {
        let adapter_id = adapter.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = PhysicalAdapterEndpoint::new(
            self.shared.twin_id.clone(),
            adapter_id.clone(),
            Arc::clone(&self.shared.bus),
            Arc::new(ActionForwarder::new(tx.clone())),
        );
        self.physical_txs.push((adapter_id, tx));
        self.handles
            .push(tokio::spawn(physical::run_worker(adapter, endpoint, rx)));
    }

    /// Create and register a digital worker's command channel; signals
    /// fanned out from this point on are queued for the worker.
    fn register_digital_channel(
        &self,
        adapter_id: &AdapterId,
    ) -> (
        DigitalAdapterEndpoint,
        mpsc::UnboundedReceiver<DigitalCommand>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = DigitalAdapterEndpoint::new(
            self.shared.twin_id.clone(),
            adapter_id.clone(),
            Arc::clone(&self.shared.bus),
            Arc::new(StateForwarder::new(tx.clone())),
        );
        self.shared
            .digital_txs
            .lock()
            .push((adapter_id.clone(), tx));
        (endpoint, rx)
    }

    fn spawn_digital(&mut self, adapter: Box<dyn DigitalAdapter>) {
        let (endpoint, rx) = self.register_digital_channel(&adapter.id());
        self.handles
            .push(tokio::spawn(digital::run_worker(adapter, endpoint, rx)));
    }
}
