//! Storage observer
//!
//! Archives, in delivery order, everything an external storage backend
//! may later query: committed snapshots with their change-lists,
//! lifecycle transitions, physical action requests, twin event
//! notifications and asset-description changes. Ordering is no stronger
//! than commit/delivery order. The observer is a bus listener; since
//! filters carry no wildcards it derives per-key topics from the asset
//! descriptions and snapshots it sees and re-subscribes itself as the
//! twin's surface grows.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use doppel_bus::{EventBus, EventListener};
use doppel_core::{
    topics, AdapterId, EventEnvelope, StateChange, Timestamp, TopicFilter,
    TwinEventNotification, TwinId, TwinState, METADATA_ADAPTER_ID, METADATA_CHANGE_LIST,
    METADATA_LIFECYCLE_STATE, METADATA_PREVIOUS_STATE,
};

use crate::physical::{ActionRequest, AssetDescription};

const STORAGE_OBSERVER_ID: &str = "dt-storage-observer";

/// One archived fact about the twin
#[derive(Clone, Debug)]
pub enum StorageRecord {
    StateUpdate {
        snapshot: TwinState,
        previous: Option<TwinState>,
        changes: Vec<StateChange>,
    },
    LifecycleTransition {
        state_label: String,
        at: Timestamp,
    },
    PhysicalActionRequest(ActionRequest),
    EventNotification(TwinEventNotification),
    AssetDescriptionChange {
        adapter_id: Option<AdapterId>,
        description: AssetDescription,
    },
}

/// One storage entry: a record plus its archive position and instant
#[derive(Clone, Debug)]
pub struct StoredEntry {
    pub index: usize,
    pub recorded_at: Timestamp,
    pub record: StorageRecord,
}

/// Archive contract the observer feeds
pub trait TwinStorage: Send + Sync {
    /// Append one record; entries are indexed in arrival order.
    fn append(&self, record: StorageRecord);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries with `start <= index < end`
    fn index_range(&self, start: usize, end: usize) -> Vec<StoredEntry>;

    /// Entries with `from <= recorded_at <= to`
    fn time_range(&self, from: Timestamp, to: Timestamp) -> Vec<StoredEntry>;
}

/// Process-local archive
#[derive(Default)]
pub struct InMemoryStorage {
    entries: Mutex<Vec<StoredEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }
}

impl TwinStorage for InMemoryStorage {
    fn append(&self, record: StorageRecord) {
        let mut entries = self.entries.lock();
        let index = entries.len();
        entries.push(StoredEntry {
            index,
            recorded_at: Timestamp::now(),
            record,
        });
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn index_range(&self, start: usize, end: usize) -> Vec<StoredEntry> {
        let entries = self.entries.lock();
        let end = end.min(entries.len());
        if start >= end {
            return Vec::new();
        }
        entries[start..end].to_vec()
    }

    fn time_range(&self, from: Timestamp, to: Timestamp) -> Vec<StoredEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.recorded_at >= from && e.recorded_at <= to)
            .cloned()
            .collect()
    }
}

/// Bus listener feeding a [`TwinStorage`] archive
pub struct StorageObserver {
    twin_id: TwinId,
    bus: Arc<EventBus>,
    storage: Arc<dyn TwinStorage>,
    self_ref: Mutex<Weak<StorageObserver>>,
}

impl StorageObserver {
    /// Create the observer and subscribe it to the twin's fixed topics;
    /// per-key topics are picked up as descriptions and snapshots
    /// arrive.
    pub fn attach(
        bus: Arc<EventBus>,
        twin_id: TwinId,
        storage: Arc<dyn TwinStorage>,
    ) -> Arc<Self> {
        let observer = Arc::new(StorageObserver {
            twin_id: twin_id.clone(),
            bus: Arc::clone(&bus),
            storage,
            self_ref: Mutex::new(Weak::new()),
        });
        *observer.self_ref.lock() = Arc::downgrade(&observer);
        bus.subscribe(
            &twin_id,
            STORAGE_OBSERVER_ID,
            &TopicFilter::of([
                topics::STATE_UPDATE,
                topics::LIFECYCLE,
                topics::PHYSICAL_ADAPTER_BOUND,
                topics::PHYSICAL_ADAPTER_BINDING_UPDATED,
            ]),
            observer.clone(),
        );
        observer
    }

    /// Subscribe this observer to additional derived topics; repeat
    /// subscriptions are idempotent.
    fn observe(&self, filter: TopicFilter) {
        if filter.is_empty() {
            return;
        }
        if let Some(observer) = self.self_ref.lock().upgrade() {
            self.bus
                .subscribe(&self.twin_id, STORAGE_OBSERVER_ID, &filter, observer);
        }
    }

    fn on_state_update(&self, event: &EventEnvelope) {
        let snapshot: TwinState = match serde_json::from_value(event.body().clone()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(twin = %self.twin_id, "malformed state update dropped: {}", e);
                return;
            }
        };
        let previous = event
            .metadata_value(METADATA_PREVIOUS_STATE)
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let changes = event
            .metadata_value(METADATA_CHANGE_LIST)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        // Event declarations in the new snapshot name the notification
        // topics to archive going forward.
        let filter = TopicFilter::of(
            snapshot
                .events
                .keys()
                .map(|key| topics::event_notification(key)),
        );
        self.observe(filter);

        self.storage.append(StorageRecord::StateUpdate {
            snapshot,
            previous,
            changes,
        });
    }

    fn on_description(&self, event: &EventEnvelope) {
        let description: AssetDescription = match serde_json::from_value(event.body().clone()) {
            Ok(description) => description,
            Err(e) => {
                warn!(twin = %self.twin_id, "malformed asset description dropped: {}", e);
                return;
            }
        };
        let adapter_id = event.metadata_str(METADATA_ADAPTER_ID).map(AdapterId::new);

        // Actions in the description name the physical action-request
        // topics to archive going forward.
        let filter = TopicFilter::of(
            description
                .actions
                .iter()
                .map(|a| topics::physical_action_request(&a.key)),
        );
        self.observe(filter);

        self.storage.append(StorageRecord::AssetDescriptionChange {
            adapter_id,
            description,
        });
    }
}

impl EventListener for StorageObserver {
    fn on_event(&self, event: &Arc<EventEnvelope>) {
        let topic = event.topic().as_str();
        match topic {
            topics::STATE_UPDATE => self.on_state_update(event),
            topics::LIFECYCLE => {
                let Some(state_label) = event.metadata_str(METADATA_LIFECYCLE_STATE) else {
                    warn!(twin = %self.twin_id, "lifecycle envelope without state label dropped");
                    return;
                };
                self.storage.append(StorageRecord::LifecycleTransition {
                    state_label: state_label.to_string(),
                    at: event.created_at(),
                });
            }
            topics::PHYSICAL_ADAPTER_BOUND | topics::PHYSICAL_ADAPTER_BINDING_UPDATED => {
                self.on_description(event);
            }
            _ if topic.starts_with("dt.physical.action.") => {
                match serde_json::from_value::<ActionRequest>(event.body().clone()) {
                    Ok(request) => {
                        self.storage
                            .append(StorageRecord::PhysicalActionRequest(request));
                    }
                    Err(e) => {
                        warn!(twin = %self.twin_id, "malformed action request dropped: {}", e);
                    }
                }
            }
            _ if topic.starts_with("dt.state.event.notification.") => {
                match serde_json::from_value::<TwinEventNotification>(event.body().clone()) {
                    Ok(notification) => {
                        self.storage
                            .append(StorageRecord::EventNotification(notification));
                    }
                    Err(e) => {
                        warn!(twin = %self.twin_id, "malformed event notification dropped: {}", e);
                    }
                }
            }
            _ => {}
        }
    }
}
