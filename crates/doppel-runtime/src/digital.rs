//! Digital adapter contract and worker
//!
//! A digital adapter exposes the twin to external consumers. Its worker
//! receives every lifecycle signal and every state envelope the adapter
//! has observed, and the endpoint lets it publish digital action
//! requests that the shadowing function bridges towards the physical
//! asset.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use doppel_bus::{EventBus, EventListener};
use doppel_core::{
    topics, AdapterId, EventEnvelope, TopicFilter, TwinId, TwinResult, METADATA_ADAPTER_ID,
    METADATA_ERROR,
};

use crate::lifecycle::LifecycleSignal;
use crate::physical::ActionRequest;

/// Contract implemented by integrator-supplied digital adapters.
///
/// All callbacks run on the adapter's own worker task; errors are
/// caught at the worker boundary and logged, never propagated.
pub trait DigitalAdapter: Send + 'static {
    fn id(&self) -> AdapterId;

    /// Invoked once when the worker starts.
    fn on_adapter_start(&mut self, endpoint: DigitalAdapterEndpoint) -> TwinResult<()>;

    /// Invoked once when the worker stops.
    fn on_adapter_stop(&mut self) -> TwinResult<()>;

    /// Invoked for every lifecycle signal of the twin.
    fn on_lifecycle(&mut self, signal: &LifecycleSignal) -> TwinResult<()>;

    /// Invoked for every observed state envelope (see the endpoint's
    /// observation helpers).
    fn on_state_event(&mut self, event: Arc<EventEnvelope>) -> TwinResult<()>;
}

/// Handle given to a digital adapter at worker start
#[derive(Clone)]
pub struct DigitalAdapterEndpoint {
    twin_id: TwinId,
    adapter_id: AdapterId,
    bus: Arc<EventBus>,
    state_listener: Arc<dyn EventListener>,
}

impl DigitalAdapterEndpoint {
    pub(crate) fn new(
        twin_id: TwinId,
        adapter_id: AdapterId,
        bus: Arc<EventBus>,
        state_listener: Arc<dyn EventListener>,
    ) -> Self {
        DigitalAdapterEndpoint {
            twin_id,
            adapter_id,
            bus,
            state_listener,
        }
    }

    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    /// Report this adapter's external surface established
    pub fn notify_bound(&self) -> TwinResult<()> {
        let envelope = EventEnvelope::new(topics::DIGITAL_ADAPTER_BOUND)
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Report this adapter's external surface lost
    pub fn notify_unbound(&self, error: Option<String>) -> TwinResult<()> {
        let mut envelope = EventEnvelope::new(topics::DIGITAL_ADAPTER_UNBOUND)
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        if let Some(error) = error {
            envelope = envelope.with_metadata(METADATA_ERROR, Value::String(error));
        }
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Observe every full state update (`dt.state.update`)
    pub fn observe_state_updates(&self) {
        self.observe_topics(&TopicFilter::of([topics::STATE_UPDATE]));
    }

    /// Observe specific state topics (per-key property, event
    /// notification, relationship-instance topics)
    pub fn observe_topics(&self, filter: &TopicFilter) {
        self.bus.subscribe(
            &self.twin_id,
            self.adapter_id.as_str(),
            filter,
            Arc::clone(&self.state_listener),
        );
    }

    /// Stop observing the given topics
    pub fn unobserve_topics(&self, filter: &TopicFilter) {
        self.bus.unsubscribe(
            &self.twin_id,
            self.adapter_id.as_str(),
            filter,
            &self.state_listener,
        );
    }

    /// Publish an action request on behalf of a digital consumer; the
    /// shadowing function re-emits it towards the physical asset.
    pub fn publish_digital_action(&self, action_key: &str, body: Value) -> TwinResult<()> {
        let request = ActionRequest::new(action_key, body);
        let envelope = EventEnvelope::new(topics::DIGITAL_ACTION)
            .with_body(&request)?
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }
}

/// Commands drained by a digital adapter worker
pub(crate) enum DigitalCommand {
    Lifecycle(LifecycleSignal),
    StateEvent(Arc<EventEnvelope>),
    Stop,
}

/// Bus listener forwarding observed state envelopes into the worker
pub(crate) struct StateForwarder {
    tx: mpsc::UnboundedSender<DigitalCommand>,
}

impl StateForwarder {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DigitalCommand>) -> Self {
        StateForwarder { tx }
    }
}

impl EventListener for StateForwarder {
    fn on_event(&self, event: &Arc<EventEnvelope>) {
        let _ = self.tx.send(DigitalCommand::StateEvent(Arc::clone(event)));
    }
}

/// Worker loop owning one digital adapter for the twin's lifetime
pub(crate) async fn run_worker(
    mut adapter: Box<dyn DigitalAdapter>,
    endpoint: DigitalAdapterEndpoint,
    mut rx: mpsc::UnboundedReceiver<DigitalCommand>,
) {
    let adapter_id = adapter.id();
    info!(adapter = %adapter_id, "digital adapter worker started");

    if let Err(err) = adapter.on_adapter_start(endpoint.clone()) {
        warn!(adapter = %adapter_id, "digital adapter start failed: {}", err);
        if let Err(err) = endpoint.notify_unbound(Some(err.to_string())) {
            warn!(adapter = %adapter_id, "unbound notification failed: {}", err);
        }
    }

    // After the stop command the worker keeps draining lifecycle
    // signals (the coordinator queues Stopped and Destroyed behind it)
    // and exits once Destroyed is delivered.
    let mut stopping = false;
    while let Some(command) = rx.recv().await {
        match command {
            DigitalCommand::Lifecycle(signal) => {
                let terminal = stopping && matches!(signal, LifecycleSignal::Destroyed);
                if let Err(err) = adapter.on_lifecycle(&signal) {
                    warn!(adapter = %adapter_id, "lifecycle handler failed: {}", err);
                }
                if terminal {
                    break;
                }
            }
            DigitalCommand::StateEvent(event) if !stopping => {
                if let Err(err) = adapter.on_state_event(event) {
                    warn!(adapter = %adapter_id, "state event handler failed: {}", err);
                }
            }
            DigitalCommand::StateEvent(_) => {}
            DigitalCommand::Stop => {
                if let Err(err) = adapter.on_adapter_stop() {
                    warn!(adapter = %adapter_id, "digital adapter stop failed: {}", err);
                }
                stopping = true;
            }
        }
    }

    if !stopping {
        // Channel closed without a stop command (the twin was dropped);
        // still give the adapter its stop callback.
        if let Err(err) = adapter.on_adapter_stop() {
            warn!(adapter = %adapter_id, "digital adapter stop failed: {}", err);
        }
    }
    info!(adapter = %adapter_id, "digital adapter worker stopped");
}
