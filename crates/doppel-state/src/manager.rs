//! State manager
//!
//! Owns the published state snapshot and the (at most one) active
//! transaction of a twin. All mutations go through the transactional
//! path: `start_transaction`, staged-change calls, then `commit` or
//! `rollback`. Every commit swaps the published snapshot wholesale and
//! announces it on the bus: one `dt.state.update` envelope carrying the
//! new snapshot, the previous snapshot and the ordered change-list,
//! plus one topical envelope per applied change.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use doppel_bus::EventBus;
use doppel_core::{
    topics, ChangeOperation, EventEnvelope, ResourceType, StateChange, StateResource, Topic,
    TwinAction, TwinError, TwinEventDeclaration, TwinEventNotification, TwinId, TwinProperty,
    TwinRelationship, TwinRelationshipInstance, TwinResult, TwinState, METADATA_CHANGE_LIST,
    METADATA_EVENT_KEY, METADATA_PREVIOUS_STATE,
};

use crate::transaction::StateTransaction;

/// Publisher id stamped on every envelope emitted by the manager
pub const STATE_PUBLISHER_ID: &str = "dt-state-publisher";

/// Transactional gateway to a twin's state
pub struct StateManager {
    twin_id: TwinId,
    bus: Arc<EventBus>,
    snapshot: RwLock<Arc<TwinState>>,
    transaction: Mutex<Option<StateTransaction>>,
}

impl StateManager {
    /// Create a manager with an empty published snapshot
    pub fn new(twin_id: TwinId, bus: Arc<EventBus>) -> Self {
        StateManager {
            twin_id,
            bus,
            snapshot: RwLock::new(Arc::new(TwinState::new())),
            transaction: Mutex::new(None),
        }
    }

    /// The current published snapshot
    pub fn snapshot(&self) -> Arc<TwinState> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn has_active_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    /// Open a transaction over the current published snapshot.
    ///
    /// Transactions are non-reentrant: opening a second one while the
    /// first is still active is a bad request.
    pub fn start_transaction(&self) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        if slot.is_some() {
            return Err(TwinError::BadRequest(
                "a state transaction is already active".to_string(),
            ));
        }
        let start = self.snapshot.read().as_ref().clone();
        *slot = Some(StateTransaction::new(start));
        debug!(twin = %self.twin_id, "state transaction opened");
        Ok(())
    }

    /// Discard every staged change of the active transaction; the
    /// transaction stays open.
    pub fn rollback_transaction(&self) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        tx.rollback();
        debug!(twin = %self.twin_id, "state transaction rolled back");
        Ok(())
    }

    /// Commit the active transaction: apply the staged change-list in
    /// order, swap the published snapshot and announce on the bus.
    ///
    /// If any change fails to re-apply the old snapshot stays
    /// authoritative and the transaction remains open with its staged
    /// changes, so the caller can roll back or amend.
    pub fn commit_transaction(&self) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let mut tx = slot.take().ok_or(TwinError::NoActiveTransaction)?;
        if let Err(err) = tx.commit() {
            *slot = Some(tx);
            return Err(err);
        }

        let previous = serde_json::to_value(tx.start_state())
            .map_err(|e| TwinError::Runtime(format!("snapshot serialization: {}", e)))?;
        let change_list = serde_json::to_value(tx.changes())
            .map_err(|e| TwinError::Runtime(format!("change-list serialization: {}", e)))?;

        // The snapshot swap happens before the transaction slot is
        // released: a transaction opened the moment the slot frees up
        // starts from the committed state, never the pre-commit one.
        let next = Arc::new(tx.end_state().clone());
        *self.snapshot.write() = Arc::clone(&next);
        drop(slot);

        info!(twin = %self.twin_id, changes = tx.changes().len(),
              "state transaction committed");

        let update = EventEnvelope::new(topics::STATE_UPDATE)
            .with_body(next.as_ref())?
            .with_metadata(METADATA_PREVIOUS_STATE, previous)
            .with_metadata(METADATA_CHANGE_LIST, change_list);
        self.bus.publish(&self.twin_id, STATE_PUBLISHER_ID, update)?;

        for change in tx.changes() {
            for topic in change_topics(change) {
                let envelope = EventEnvelope::new(topic).with_body(change)?;
                self.bus.publish(&self.twin_id, STATE_PUBLISHER_ID, envelope)?;
            }
        }

        Ok(())
    }

    /// Publish a twin event occurrence.
    ///
    /// Notifications ride outside the transactional path: they describe
    /// something that happened, not a state mutation.
    pub fn notify_event_notification(
        &self,
        notification: TwinEventNotification,
    ) -> TwinResult<()> {
        let envelope = EventEnvelope::new(topics::event_notification(&notification.key))
            .with_body(&notification)?
            .with_metadata(METADATA_EVENT_KEY, Value::String(notification.key.clone()));
        self.bus
            .publish(&self.twin_id, STATE_PUBLISHER_ID, envelope)
    }

    /* Staged-change calls (active transaction required) */

    pub fn create_property(&self, property: TwinProperty) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Add,
            ResourceType::Property,
            StateResource::Property(property),
        ))
    }

    pub fn update_property(&self, property: TwinProperty) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Update,
            ResourceType::Property,
            StateResource::Property(property),
        ))
    }

    /// Stage a value-only update; the declared type and flags of the
    /// existing property are preserved.
    pub fn update_property_value(&self, key: impl Into<String>, value: Value) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::UpdateValue,
            ResourceType::PropertyValue,
            StateResource::Property(TwinProperty::new(key, value)),
        ))
    }

    pub fn delete_property(&self, key: &str) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        let property = tx
            .end_state()
            .properties
            .get(key)
            .cloned()
            .ok_or_else(|| TwinError::not_found("property", key))?;
        tx.stage(StateChange::new(
            ChangeOperation::Remove,
            ResourceType::Property,
            StateResource::Property(property),
        ))
    }

    pub fn enable_action(&self, action: TwinAction) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Add,
            ResourceType::Action,
            StateResource::Action(action),
        ))
    }

    pub fn update_action(&self, action: TwinAction) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Update,
            ResourceType::Action,
            StateResource::Action(action),
        ))
    }

    pub fn disable_action(&self, key: &str) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        let action = tx
            .end_state()
            .actions
            .get(key)
            .cloned()
            .ok_or_else(|| TwinError::not_found("action", key))?;
        tx.stage(StateChange::new(
            ChangeOperation::Remove,
            ResourceType::Action,
            StateResource::Action(action),
        ))
    }

    pub fn register_event(&self, event: TwinEventDeclaration) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Add,
            ResourceType::Event,
            StateResource::Event(event),
        ))
    }

    pub fn update_event(&self, event: TwinEventDeclaration) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Update,
            ResourceType::Event,
            StateResource::Event(event),
        ))
    }

    pub fn unregister_event(&self, key: &str) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        let event = tx
            .end_state()
            .events
            .get(key)
            .cloned()
            .ok_or_else(|| TwinError::not_found("event", key))?;
        tx.stage(StateChange::new(
            ChangeOperation::Remove,
            ResourceType::Event,
            StateResource::Event(event),
        ))
    }

    pub fn create_relationship(&self, relationship: TwinRelationship) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Add,
            ResourceType::Relationship,
            StateResource::Relationship(relationship),
        ))
    }

    pub fn delete_relationship(&self, name: &str) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        let relationship = tx
            .end_state()
            .relationships
            .get(name)
            .cloned()
            .ok_or_else(|| TwinError::not_found("relationship", name))?;
        tx.stage(StateChange::new(
            ChangeOperation::Remove,
            ResourceType::Relationship,
            StateResource::Relationship(relationship),
        ))
    }

    pub fn add_relationship_instance(
        &self,
        instance: TwinRelationshipInstance,
    ) -> TwinResult<()> {
        self.stage(StateChange::new(
            ChangeOperation::Add,
            ResourceType::RelationshipInstance,
            StateResource::RelationshipInstance(instance),
        ))
    }

    pub fn delete_relationship_instance(
        &self,
        name: &str,
        instance_key: &str,
    ) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        let instance = tx
            .end_state()
            .relationships
            .get(name)
            .ok_or_else(|| TwinError::not_found("relationship", name))?
            .instances
            .get(instance_key)
            .cloned()
            .ok_or_else(|| TwinError::not_found("relationship instance", instance_key))?;
        tx.stage(StateChange::new(
            ChangeOperation::Remove,
            ResourceType::RelationshipInstance,
            StateResource::RelationshipInstance(instance),
        ))
    }

    fn stage(&self, change: StateChange) -> TwinResult<()> {
        let mut slot = self.transaction.lock();
        let tx = slot.as_mut().ok_or(TwinError::NoActiveTransaction)?;
        tx.stage(change)
    }
}

/// Notification topics for one applied change, in emission order
fn change_topics(change: &StateChange) -> Vec<Topic> {
    use ChangeOperation::*;

    match (change.operation(), change.resource()) {
        (Add, StateResource::Property(_)) => vec![Topic::new(topics::PROPERTY_CREATED)],
        (Update, StateResource::Property(p)) | (UpdateValue, StateResource::Property(p)) => vec![
            Topic::new(topics::PROPERTY_UPDATED),
            topics::property_updated(&p.key),
        ],
        (Remove, StateResource::Property(p)) => vec![
            Topic::new(topics::PROPERTY_DELETED),
            topics::property_deleted(&p.key),
        ],

        (Add, StateResource::Action(_)) => vec![Topic::new(topics::ACTION_ENABLED)],
        (Update, StateResource::Action(_)) => vec![Topic::new(topics::ACTION_UPDATED)],
        (Remove, StateResource::Action(_)) => vec![Topic::new(topics::ACTION_DISABLED)],

        (Add, StateResource::Event(_)) => vec![Topic::new(topics::EVENT_REGISTERED)],
        (Update, StateResource::Event(_)) => vec![Topic::new(topics::EVENT_UPDATED)],
        (Remove, StateResource::Event(_)) => vec![Topic::new(topics::EVENT_UNREGISTERED)],

        (Add, StateResource::Relationship(_)) => {
            vec![Topic::new(topics::RELATIONSHIP_CREATED)]
        }
        (Remove, StateResource::Relationship(_)) => {
            vec![Topic::new(topics::RELATIONSHIP_DELETED)]
        }

        (Add, StateResource::RelationshipInstance(i)) => {
            vec![topics::relationship_instance_created(&i.relationship_name)]
        }
        (Remove, StateResource::RelationshipInstance(i)) => {
            vec![topics::relationship_instance_deleted(&i.relationship_name)]
        }

        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doppel_bus::EventListener;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    struct Recorder {
        received: PlMutex<Vec<Arc<EventEnvelope>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                received: PlMutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.received
                .lock()
                .iter()
                .map(|e| e.topic().as_str().to_string())
                .collect()
        }
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Arc<EventEnvelope>) {
            self.received.lock().push(Arc::clone(event));
        }
    }

    fn manager() -> (StateManager, Arc<EventBus>, TwinId) {
        let bus = Arc::new(EventBus::new());
        let twin = TwinId::new("twin-1");
        let manager = StateManager::new(twin.clone(), Arc::clone(&bus));
        (manager, bus, twin)
    }

    fn observe(bus: &Arc<EventBus>, twin: &TwinId, topics: &[&str]) -> Arc<Recorder> {
        let recorder = Recorder::new();
        bus.subscribe(
            twin,
            "test-observer",
            &doppel_core::TopicFilter::of(topics.iter().copied()),
            recorder.clone(),
        );
        recorder
    }

    #[test]
    fn test_commit_publishes_net_result_and_topical_envelopes() {
        let (manager, bus, twin) = manager();
        let recorder = observe(
            &bus,
            &twin,
            &[
                topics::STATE_UPDATE,
                topics::PROPERTY_CREATED,
                topics::PROPERTY_UPDATED,
                topics::PROPERTY_DELETED,
            ],
        );

        manager.start_transaction().unwrap();
        manager
            .create_property(TwinProperty::new("energy", json!(0.0)))
            .unwrap();
        manager.update_property_value("energy", json!(3.5)).unwrap();
        manager
            .create_property(TwinProperty::new("mode", json!("auto")))
            .unwrap();
        manager.delete_property("mode").unwrap();
        manager.commit_transaction().unwrap();

        // Net result: only `energy` survives, with the updated value.
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.properties.len(), 1);
        assert_eq!(snapshot.read_property("energy").unwrap().value, json!(3.5));

        // One dt.state.update plus one topical envelope per change.
        assert_eq!(
            recorder.topics(),
            vec![
                "dt.state.update",
                "dt.state.property.created",
                "dt.state.property.updated",
                "dt.state.property.created",
                "dt.state.property.deleted",
            ]
        );
    }

    #[test]
    fn test_state_update_metadata_carries_ordered_change_list() {
        let (manager, bus, twin) = manager();
        let recorder = observe(&bus, &twin, &[topics::STATE_UPDATE]);

        manager.start_transaction().unwrap();
        manager
            .create_property(TwinProperty::new("energy", json!(0.0)))
            .unwrap();
        manager.update_property_value("energy", json!(1.0)).unwrap();
        manager.update_property_value("energy", json!(2.0)).unwrap();
        manager.commit_transaction().unwrap();

        let received = recorder.received.lock();
        assert_eq!(received.len(), 1);
        let update = &received[0];

        let changes: Vec<StateChange> = serde_json::from_value(
            update
                .metadata_value(METADATA_CHANGE_LIST)
                .unwrap()
                .clone(),
        )
        .unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].operation(), ChangeOperation::Add);
        assert_eq!(changes[1].operation(), ChangeOperation::UpdateValue);
        assert_eq!(changes[2].operation(), ChangeOperation::UpdateValue);

        // Previous snapshot in metadata is the pre-commit (empty) state.
        let previous: TwinState = serde_json::from_value(
            update
                .metadata_value(METADATA_PREVIOUS_STATE)
                .unwrap()
                .clone(),
        )
        .unwrap();
        assert!(previous.properties.is_empty());

        // Snapshot equals the start state with the change-list applied.
        let body: TwinState = serde_json::from_value(update.body().clone()).unwrap();
        assert_eq!(body.read_property("energy").unwrap().value, json!(2.0));
    }

    #[test]
    fn test_rollback_discards_staged_changes() {
        let (manager, bus, twin) = manager();
        let recorder = observe(&bus, &twin, &[topics::STATE_UPDATE, topics::PROPERTY_CREATED]);

        manager.start_transaction().unwrap();
        manager
            .create_property(TwinProperty::new("energy", json!(1.0)))
            .unwrap();
        manager.rollback_transaction().unwrap();
        manager.commit_transaction().unwrap();

        // Snapshot unchanged, no topical envelopes, only the no-op update.
        assert!(manager.snapshot().properties.is_empty());
        assert_eq!(recorder.topics(), vec!["dt.state.update"]);
    }

    /// Opens a fresh transaction from inside the state-update delivery
    /// and records whether re-adding the just-committed property
    /// conflicts against the captured snapshot.
    struct ReentrantOpener {
        manager: PlMutex<Option<Arc<StateManager>>>,
        outcome: PlMutex<Option<TwinError>>,
    }

    impl EventListener for ReentrantOpener {
        fn on_event(&self, _event: &Arc<EventEnvelope>) {
            let Some(manager) = self.manager.lock().clone() else {
                return;
            };
            manager.start_transaction().unwrap();
            let err = manager
                .create_property(TwinProperty::new("energy", json!(9.0)))
                .unwrap_err();
            *self.outcome.lock() = Some(err);
            *self.manager.lock() = None;
        }
    }

    #[test]
    fn test_transaction_opened_during_commit_sees_committed_snapshot() {
        let bus = Arc::new(EventBus::new());
        let twin = TwinId::new("twin-1");
        let manager = Arc::new(StateManager::new(twin.clone(), Arc::clone(&bus)));

        let opener = Arc::new(ReentrantOpener {
            manager: PlMutex::new(Some(Arc::clone(&manager))),
            outcome: PlMutex::new(None),
        });
        bus.subscribe(
            &twin,
            "test-observer",
            &doppel_core::TopicFilter::of([topics::STATE_UPDATE]),
            opener.clone(),
        );

        manager.start_transaction().unwrap();
        manager
            .create_property(TwinProperty::new("energy", json!(1.0)))
            .unwrap();
        manager.commit_transaction().unwrap();

        // The transaction the listener opened captured the committed
        // snapshot, so re-adding the property conflicted.
        assert!(matches!(
            opener.outcome.lock().take(),
            Some(TwinError::Conflict { .. })
        ));
        assert!(manager.has_active_transaction());
    }

    #[test]
    fn test_calls_without_transaction_are_rejected() {
        let (manager, _bus, _twin) = manager();

        let err = manager
            .create_property(TwinProperty::new("energy", json!(1)))
            .unwrap_err();
        assert_eq!(err, TwinError::NoActiveTransaction);
        assert_eq!(
            manager.rollback_transaction().unwrap_err(),
            TwinError::NoActiveTransaction
        );
        assert_eq!(
            manager.commit_transaction().unwrap_err(),
            TwinError::NoActiveTransaction
        );
    }

    #[test]
    fn test_nested_transaction_is_rejected() {
        let (manager, _bus, _twin) = manager();
        manager.start_transaction().unwrap();
        let err = manager.start_transaction().unwrap_err();
        assert!(matches!(err, TwinError::BadRequest(_)));
        assert!(manager.has_active_transaction());
    }

    #[test]
    fn test_failed_staged_change_leaves_transaction_usable() {
        let (manager, _bus, _twin) = manager();
        manager.start_transaction().unwrap();
        manager
            .create_property(TwinProperty::new("energy", json!(0.0)))
            .unwrap();

        // Type mismatch is rejected at staging time.
        let err = manager
            .update_property_value("energy", json!("high"))
            .unwrap_err();
        assert!(matches!(err, TwinError::BadRequest(_)));

        // The transaction stays open and the valid change commits.
        manager.commit_transaction().unwrap();
        assert_eq!(
            manager.snapshot().read_property("energy").unwrap().value,
            json!(0.0)
        );
    }

    #[test]
    fn test_delete_unknown_resource_is_not_found() {
        let (manager, _bus, _twin) = manager();
        manager.start_transaction().unwrap();

        assert!(matches!(
            manager.delete_property("ghost").unwrap_err(),
            TwinError::NotFound { .. }
        ));
        assert!(matches!(
            manager.disable_action("ghost").unwrap_err(),
            TwinError::NotFound { .. }
        ));
        assert!(matches!(
            manager.unregister_event("ghost").unwrap_err(),
            TwinError::NotFound { .. }
        ));
    }

    #[test]
    fn test_event_notification_needs_no_transaction() {
        let (manager, bus, twin) = manager();
        let recorder = observe(&bus, &twin, &["dt.state.event.notification.overheating"]);

        manager
            .notify_event_notification(TwinEventNotification::new(
                "overheating",
                json!({"temperature": 97.2}),
            ))
            .unwrap();

        let received = recorder.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].metadata_str(METADATA_EVENT_KEY),
            Some("overheating")
        );
    }

    #[test]
    fn test_relationship_lifecycle_topics() {
        let (manager, bus, twin) = manager();
        let recorder = observe(
            &bus,
            &twin,
            &[
                topics::RELATIONSHIP_CREATED,
                "dt.state.relationship.contains.instance.created",
                "dt.state.relationship.contains.instance.deleted",
            ],
        );

        manager.start_transaction().unwrap();
        manager
            .create_relationship(TwinRelationship::new("contains", "spatial"))
            .unwrap();
        manager
            .add_relationship_instance(TwinRelationshipInstance::new(
                "contains",
                "sensor-7",
                "contains-sensor-7",
            ))
            .unwrap();
        manager
            .delete_relationship_instance("contains", "contains-sensor-7")
            .unwrap();
        manager.commit_transaction().unwrap();

        assert_eq!(
            recorder.topics(),
            vec![
                "dt.state.relationship.created",
                "dt.state.relationship.contains.instance.created",
                "dt.state.relationship.contains.instance.deleted",
            ]
        );
    }
}
