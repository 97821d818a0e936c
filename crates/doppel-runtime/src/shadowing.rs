//! Shadowing contract
//!
//! The shadowing function is the integrator-supplied reconciliation
//! logic: it consumes physical-side notifications and digital action
//! requests, drives the transaction engine (its only path to mutate
//! state), and tells the coordinator when its view of the asset is in
//! or out of sync. It runs on its own worker task.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use doppel_bus::{EventBus, EventListener};
use doppel_core::{
    topics, EventEnvelope, TopicFilter, TwinEventNotification, TwinId,
    TwinRelationshipInstance, TwinResult,
};
use doppel_state::StateManager;

use crate::lifecycle::LifecycleSignal;
use crate::physical::{ActionRequest, AssetDescription};

const SHADOWING_ID: &str = "dt-shadowing";

/// One physical-side notification or digital action request, as seen by
/// the shadowing function
#[derive(Clone, Debug)]
pub enum PhysicalSignal {
    PropertyVariation { key: String, value: Value },
    EventNotification(TwinEventNotification),
    RelationshipInstanceCreated(TwinRelationshipInstance),
    RelationshipInstanceDeleted(TwinRelationshipInstance),
    DigitalActionRequest(ActionRequest),
}

impl PhysicalSignal {
    /// Decode a bus envelope into a signal; `None` for unrelated topics
    /// or malformed bodies.
    pub(crate) fn from_envelope(event: &EventEnvelope) -> Option<PhysicalSignal> {
        let topic = event.topic().as_str();

        if let Some(key) = topic.strip_prefix("dt.physical.event.property.") {
            return Some(PhysicalSignal::PropertyVariation {
                key: key.to_string(),
                value: event.body().clone(),
            });
        }
        if topic.strip_prefix("dt.physical.event.event.").is_some() {
            return match serde_json::from_value(event.body().clone()) {
                Ok(notification) => Some(PhysicalSignal::EventNotification(notification)),
                Err(e) => {
                    warn!(%topic, "malformed event notification dropped: {}", e);
                    None
                }
            };
        }
        if topic.strip_prefix("dt.physical.event.relationship.created.").is_some() {
            return match serde_json::from_value(event.body().clone()) {
                Ok(instance) => Some(PhysicalSignal::RelationshipInstanceCreated(instance)),
                Err(e) => {
                    warn!(%topic, "malformed relationship instance dropped: {}", e);
                    None
                }
            };
        }
        if topic.strip_prefix("dt.physical.event.relationship.deleted.").is_some() {
            return match serde_json::from_value(event.body().clone()) {
                Ok(instance) => Some(PhysicalSignal::RelationshipInstanceDeleted(instance)),
                Err(e) => {
                    warn!(%topic, "malformed relationship instance dropped: {}", e);
                    None
                }
            };
        }
        if topic == topics::DIGITAL_ACTION {
            return match serde_json::from_value(event.body().clone()) {
                Ok(request) => Some(PhysicalSignal::DigitalActionRequest(request)),
                Err(e) => {
                    warn!(%topic, "malformed action request dropped: {}", e);
                    None
                }
            };
        }
        None
    }
}

/// Contract implemented by the integrator's reconciliation logic
pub trait ShadowingFunction: Send + 'static {
    /// Invoked for every lifecycle signal of the twin.
    fn on_lifecycle(
        &mut self,
        ctx: &ShadowingContext,
        signal: &LifecycleSignal,
    ) -> TwinResult<()>;

    /// Invoked for every observed physical notification or digital
    /// action request.
    fn on_physical(&mut self, ctx: &ShadowingContext, signal: PhysicalSignal) -> TwinResult<()>;
}

/// Handle given to the shadowing function: observation helpers, the
/// transaction engine, sync notifications and the action bridge
pub struct ShadowingContext {
    twin_id: TwinId,
    bus: Arc<EventBus>,
    state: Arc<StateManager>,
    physical_listener: Arc<dyn EventListener>,
}

impl ShadowingContext {
    pub(crate) fn new(
        twin_id: TwinId,
        bus: Arc<EventBus>,
        state: Arc<StateManager>,
        physical_listener: Arc<dyn EventListener>,
    ) -> Self {
        ShadowingContext {
            twin_id,
            bus,
            state,
            physical_listener,
        }
    }

    /// The twin's transaction engine - the only path to mutate state
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Observe every physical topic named in an asset description:
    /// property variations, event notifications and
    /// relationship-instance variations.
    pub fn observe_asset(&self, description: &AssetDescription) {
        let mut filter = TopicFilter::new();
        for property in &description.properties {
            filter.add(topics::physical_property_variation(&property.key));
        }
        for event in &description.events {
            filter.add(topics::physical_event_notification(&event.key));
        }
        for relationship in &description.relationships {
            filter.add(topics::physical_relationship_created(&relationship.name));
            filter.add(topics::physical_relationship_deleted(&relationship.name));
        }
        if filter.is_empty() {
            return;
        }
        self.bus.subscribe(
            &self.twin_id,
            SHADOWING_ID,
            &filter,
            Arc::clone(&self.physical_listener),
        );
    }

    /// Observe action requests published by digital adapters
    pub fn observe_digital_actions(&self) {
        self.bus.subscribe(
            &self.twin_id,
            SHADOWING_ID,
            &TopicFilter::of([topics::DIGITAL_ACTION]),
            Arc::clone(&self.physical_listener),
        );
    }

    /// Re-emit an action request towards the physical asset; the
    /// adapter whose description declares the action receives it.
    pub fn publish_physical_action(&self, request: ActionRequest) -> TwinResult<()> {
        let envelope = EventEnvelope::new(topics::physical_action_request(&request.action_key))
            .with_body(&request)?;
        self.bus.publish(&self.twin_id, SHADOWING_ID, envelope)
    }

    /// Tell the coordinator the digital state is reconciled with the
    /// physical asset; forwarded verbatim as SYNCHRONIZED.
    pub fn notify_sync(&self) -> TwinResult<()> {
        self.bus.publish(
            &self.twin_id,
            SHADOWING_ID,
            EventEnvelope::new(topics::SHADOWING_SYNC),
        )
    }

    /// Tell the coordinator reconciliation is lost; forwarded verbatim
    /// as NOT_SYNCHRONIZED.
    pub fn notify_out_of_sync(&self) -> TwinResult<()> {
        self.bus.publish(
            &self.twin_id,
            SHADOWING_ID,
            EventEnvelope::new(topics::SHADOWING_UNSYNC),
        )
    }
}

/// Commands drained by the shadowing worker
pub(crate) enum ShadowingCommand {
    Lifecycle(LifecycleSignal),
    Physical(PhysicalSignal),
    Stop,
}

/// Bus listener forwarding observed physical envelopes into the worker
pub(crate) struct PhysicalForwarder {
    tx: mpsc::UnboundedSender<ShadowingCommand>,
}

impl PhysicalForwarder {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ShadowingCommand>) -> Self {
        PhysicalForwarder { tx }
    }
}

impl EventListener for PhysicalForwarder {
    fn on_event(&self, event: &Arc<EventEnvelope>) {
        if let Some(signal) = PhysicalSignal::from_envelope(event) {
            let _ = self.tx.send(ShadowingCommand::Physical(signal));
        }
    }
}

/// Worker loop owning the shadowing function for the twin's lifetime
pub(crate) async fn run_worker(
    mut function: Box<dyn ShadowingFunction>,
    ctx: ShadowingContext,
    mut rx: mpsc::UnboundedReceiver<ShadowingCommand>,
) {
    // After the stop command the worker keeps draining lifecycle
    // signals (Stopped and Destroyed are queued behind it) and exits
    // once Destroyed is delivered.
    let mut stopping = false;
    while let Some(command) = rx.recv().await {
        match command {
            ShadowingCommand::Lifecycle(signal) => {
                let terminal = stopping && matches!(signal, LifecycleSignal::Destroyed);
                if let Err(err) = function.on_lifecycle(&ctx, &signal) {
                    warn!(twin = %ctx.twin_id, "shadowing lifecycle handler failed: {}", err);
                }
                if terminal {
                    break;
                }
            }
            ShadowingCommand::Physical(signal) if !stopping => {
                if let Err(err) = function.on_physical(&ctx, signal) {
                    warn!(twin = %ctx.twin_id, "shadowing physical handler failed: {}", err);
                }
            }
            ShadowingCommand::Physical(_) => {}
            ShadowingCommand::Stop => stopping = true,
        }
    }
}
