//! Physical adapter contract and worker
//!
//! A physical adapter bridges one physical asset onto the bus. Once its
//! worker starts it receives an endpoint, announces its asset
//! description via `notify_bound`, publishes property variations, event
//! notifications and relationship-instance variations, and receives
//! action requests re-emitted by the shadowing function. Each adapter
//! runs on its own tokio task, owning the adapter exclusively and
//! draining a command channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use doppel_bus::{EventBus, EventListener};
use doppel_core::{
    topics, AdapterId, EventEnvelope, Timestamp, TopicFilter, TwinEventNotification, TwinId,
    TwinRelationshipInstance, TwinResult, METADATA_ADAPTER_ID, METADATA_ERROR,
};

/// One observable property of the physical asset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetProperty {
    pub key: String,
    pub initial_value: Value,
}

impl AssetProperty {
    pub fn new(key: impl Into<String>, initial_value: Value) -> Self {
        AssetProperty {
            key: key.into(),
            initial_value,
        }
    }
}

/// One action the physical asset accepts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetAction {
    pub key: String,
    pub action_type: String,
    pub content_type: String,
}

impl AssetAction {
    pub fn new(
        key: impl Into<String>,
        action_type: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        AssetAction {
            key: key.into(),
            action_type: action_type.into(),
            content_type: content_type.into(),
        }
    }
}

/// One event family the physical asset may emit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetEvent {
    pub key: String,
    pub event_type: String,
}

impl AssetEvent {
    pub fn new(key: impl Into<String>, event_type: impl Into<String>) -> Self {
        AssetEvent {
            key: key.into(),
            event_type: event_type.into(),
        }
    }
}

/// One relationship kind the physical asset participates in
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRelationship {
    pub name: String,
    pub relationship_type: String,
}

impl AssetRelationship {
    pub fn new(name: impl Into<String>, relationship_type: impl Into<String>) -> Self {
        AssetRelationship {
            name: name.into(),
            relationship_type: relationship_type.into(),
        }
    }
}

/// Surface of one physical asset as announced by its adapter
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetDescription {
    pub properties: Vec<AssetProperty>,
    pub actions: Vec<AssetAction>,
    pub events: Vec<AssetEvent>,
    pub relationships: Vec<AssetRelationship>,
}

impl AssetDescription {
    pub fn new() -> Self {
        AssetDescription::default()
    }

    pub fn with_property(mut self, property: AssetProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_action(mut self, action: AssetAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_event(mut self, event: AssetEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_relationship(mut self, relationship: AssetRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }
}

/// An action invocation travelling towards the physical asset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_key: String,
    pub body: Value,
    pub requested_at: Timestamp,
}

impl ActionRequest {
    pub fn new(action_key: impl Into<String>, body: Value) -> Self {
        ActionRequest {
            action_key: action_key.into(),
            body,
            requested_at: Timestamp::now(),
        }
    }
}

/// Contract implemented by integrator-supplied physical adapters.
///
/// All callbacks run on the adapter's own worker task; errors are
/// caught at the worker boundary and logged, never propagated.
pub trait PhysicalAdapter: Send + 'static {
    fn id(&self) -> AdapterId;

    /// Invoked once when the worker starts; the endpoint is the
    /// adapter's only handle onto the twin.
    fn on_adapter_start(&mut self, endpoint: PhysicalAdapterEndpoint) -> TwinResult<()>;

    /// Invoked once when the worker stops.
    fn on_adapter_stop(&mut self) -> TwinResult<()>;

    /// Invoked for every action request addressed to this adapter's
    /// asset.
    fn on_incoming_action(&mut self, request: ActionRequest) -> TwinResult<()>;
}

/// Handle given to a physical adapter at worker start
#[derive(Clone)]
pub struct PhysicalAdapterEndpoint {
    twin_id: TwinId,
    adapter_id: AdapterId,
    bus: Arc<EventBus>,
    action_listener: Arc<dyn EventListener>,
}

impl PhysicalAdapterEndpoint {
    pub(crate) fn new(
        twin_id: TwinId,
        adapter_id: AdapterId,
        bus: Arc<EventBus>,
        action_listener: Arc<dyn EventListener>,
    ) -> Self {
        PhysicalAdapterEndpoint {
            twin_id,
            adapter_id,
            bus,
            action_listener,
        }
    }

    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    /// Announce the asset description and report this adapter bound.
    ///
    /// Also subscribes the adapter's worker to the incoming-action
    /// topic of every action in the description.
    pub fn notify_bound(&self, description: &AssetDescription) -> TwinResult<()> {
        self.subscribe_incoming_actions(description);
        let envelope = EventEnvelope::new(topics::PHYSICAL_ADAPTER_BOUND)
            .with_body(description)?
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Announce a changed asset description without altering the bound
    /// status.
    pub fn notify_binding_updated(&self, description: &AssetDescription) -> TwinResult<()> {
        self.subscribe_incoming_actions(description);
        let envelope = EventEnvelope::new(topics::PHYSICAL_ADAPTER_BINDING_UPDATED)
            .with_body(description)?
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Report this adapter's binding lost
    pub fn notify_unbound(&self, error: Option<String>) -> TwinResult<()> {
        let mut envelope = EventEnvelope::new(topics::PHYSICAL_ADAPTER_UNBOUND)
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        if let Some(error) = error {
            envelope = envelope.with_metadata(METADATA_ERROR, Value::String(error));
        }
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Publish one observed property variation of the physical asset
    pub fn publish_property_variation(&self, key: &str, value: Value) -> TwinResult<()> {
        let envelope = EventEnvelope::new(topics::physical_property_variation(key))
            .with_body_value(value)
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Publish one physical event occurrence
    pub fn publish_event_notification(
        &self,
        notification: TwinEventNotification,
    ) -> TwinResult<()> {
        let envelope = EventEnvelope::new(topics::physical_event_notification(&notification.key))
            .with_body(&notification)?
            .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Publish an observed relationship-instance creation
    pub fn publish_relationship_created(
        &self,
        instance: TwinRelationshipInstance,
    ) -> TwinResult<()> {
        let envelope =
            EventEnvelope::new(topics::physical_relationship_created(&instance.relationship_name))
                .with_body(&instance)?
                .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    /// Publish an observed relationship-instance deletion
    pub fn publish_relationship_deleted(
        &self,
        instance: TwinRelationshipInstance,
    ) -> TwinResult<()> {
        let envelope =
            EventEnvelope::new(topics::physical_relationship_deleted(&instance.relationship_name))
                .with_body(&instance)?
                .with_metadata(METADATA_ADAPTER_ID, Value::String(self.adapter_id.to_string()));
        self.bus
            .publish(&self.twin_id, self.adapter_id.as_str(), envelope)
    }

    fn subscribe_incoming_actions(&self, description: &AssetDescription) {
        if description.actions.is_empty() {
            return;
        }
        let filter = TopicFilter::of(
            description
                .actions
                .iter()
                .map(|a| topics::physical_action_request(&a.key)),
        );
        self.bus.subscribe(
            &self.twin_id,
            self.adapter_id.as_str(),
            &filter,
            Arc::clone(&self.action_listener),
        );
    }
}

/// Commands drained by a physical adapter worker
pub(crate) enum PhysicalCommand {
    IncomingAction(ActionRequest),
    Stop,
}

/// Bus listener forwarding action-request envelopes into the worker
pub(crate) struct ActionForwarder {
    tx: mpsc::UnboundedSender<PhysicalCommand>,
}

impl ActionForwarder {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PhysicalCommand>) -> Self {
        ActionForwarder { tx }
    }
}

impl EventListener for ActionForwarder {
    fn on_event(&self, event: &Arc<EventEnvelope>) {
        match serde_json::from_value::<ActionRequest>(event.body().clone()) {
            Ok(request) => {
                let _ = self.tx.send(PhysicalCommand::IncomingAction(request));
            }
            Err(e) => {
                warn!(topic = %event.topic(), "malformed action request dropped: {}", e);
            }
        }
    }
}

/// Worker loop owning one physical adapter for the twin's lifetime
pub(crate) async fn run_worker(
    mut adapter: Box<dyn PhysicalAdapter>,
    endpoint: PhysicalAdapterEndpoint,
    mut rx: mpsc::UnboundedReceiver<PhysicalCommand>,
) {
    let adapter_id = adapter.id();
    info!(adapter = %adapter_id, "physical adapter worker started");

    if let Err(err) = adapter.on_adapter_start(endpoint.clone()) {
        warn!(adapter = %adapter_id, "physical adapter start failed: {}", err);
        if let Err(err) = endpoint.notify_unbound(Some(err.to_string())) {
            warn!(adapter = %adapter_id, "unbound notification failed: {}", err);
        }
    }

    while let Some(command) = rx.recv().await {
        match command {
            PhysicalCommand::IncomingAction(request) => {
                if let Err(err) = adapter.on_incoming_action(request) {
                    warn!(adapter = %adapter_id, "incoming action failed: {}", err);
                }
            }
            PhysicalCommand::Stop => break,
        }
    }

    if let Err(err) = adapter.on_adapter_stop() {
        warn!(adapter = %adapter_id, "physical adapter stop failed: {}", err);
    }
    info!(adapter = %adapter_id, "physical adapter worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_builder() {
        let description = AssetDescription::new()
            .with_property(AssetProperty::new("energy", Value::Null))
            .with_action(AssetAction::new("set-target", "command", "application/json"))
            .with_event(AssetEvent::new("overheating", "alert"))
            .with_relationship(AssetRelationship::new("contains", "spatial"));

        assert_eq!(description.properties.len(), 1);
        assert_eq!(description.actions[0].key, "set-target");
        assert_eq!(description.events[0].event_type, "alert");
        assert_eq!(description.relationships[0].name, "contains");
    }

    #[test]
    fn test_action_request_roundtrip() {
        let request = ActionRequest::new("set-target", json!({"target": 21.0}));
        let value = serde_json::to_value(&request).unwrap();
        let recovered: ActionRequest = serde_json::from_value(value).unwrap();
        assert_eq!(request, recovered);
    }
}
