//! Topics and topic filters
//!
//! A topic is a dot-delimited string naming one event category in a
//! twin's flat namespace. Filters are plain sets of exact topics:
//! adding a topic twice is idempotent and there is no wildcard
//! matching.
//!
//! The `dt.state.*` and `da.digital.action.event` topic strings form
//! the stable external contract and are reproduced bit-exact; the
//! remaining topics are internal runtime plumbing.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Event category key within a twin's namespace
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Topic(topic.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(topic: &str) -> Self {
        Topic::new(topic)
    }
}

impl From<String> for Topic {
    fn from(topic: String) -> Self {
        Topic(topic)
    }
}

/// Set of exact topics a listener is registered for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicFilter {
    topics: BTreeSet<Topic>,
}

impl TopicFilter {
    pub fn new() -> Self {
        TopicFilter::default()
    }

    /// Build a filter from any topic-like iterable
    pub fn of<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        TopicFilter {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Add one topic; returns false if it was already present
    pub fn add(&mut self, topic: impl Into<Topic>) -> bool {
        self.topics.insert(topic.into())
    }

    /// Remove one topic; removing a non-present topic is a no-op
    pub fn remove(&mut self, topic: &Topic) -> bool {
        self.topics.remove(topic)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, Topic> {
        self.topics.iter()
    }
}

impl<'a> IntoIterator for &'a TopicFilter {
    type Item = &'a Topic;
    type IntoIter = btree_set::Iter<'a, Topic>;

    fn into_iter(self) -> Self::IntoIter {
        self.topics.iter()
    }
}

/// Topic name scheme
pub mod topics {
    use super::Topic;

    /* Stable state topics (external contract, bit-exact) */

    pub const STATE_UPDATE: &str = "dt.state.update";

    pub const PROPERTY_CREATED: &str = "dt.state.property.created";
    pub const PROPERTY_UPDATED: &str = "dt.state.property.updated";
    pub const PROPERTY_DELETED: &str = "dt.state.property.deleted";

    pub const ACTION_ENABLED: &str = "dt.state.action.enabled";
    pub const ACTION_UPDATED: &str = "dt.state.action.updated";
    pub const ACTION_DISABLED: &str = "dt.state.action.disabled";

    pub const EVENT_REGISTERED: &str = "dt.state.event.registered";
    pub const EVENT_UPDATED: &str = "dt.state.event.updated";
    pub const EVENT_UNREGISTERED: &str = "dt.state.event.unregistered";

    pub const RELATIONSHIP_CREATED: &str = "dt.state.relationship.created";
    pub const RELATIONSHIP_DELETED: &str = "dt.state.relationship.deleted";

    /// Digital-to-physical action bridge
    pub const DIGITAL_ACTION: &str = "da.digital.action.event";

    /* Runtime topics (internal plumbing) */

    pub const LIFECYCLE: &str = "dt.lifecycle";

    pub const SHADOWING_SYNC: &str = "dt.shadowing.sync";
    pub const SHADOWING_UNSYNC: &str = "dt.shadowing.unsync";

    pub const PHYSICAL_ADAPTER_BOUND: &str = "dt.physical.adapter.bound";
    pub const PHYSICAL_ADAPTER_BINDING_UPDATED: &str = "dt.physical.adapter.binding.updated";
    pub const PHYSICAL_ADAPTER_UNBOUND: &str = "dt.physical.adapter.unbound";

    pub const DIGITAL_ADAPTER_BOUND: &str = "dt.digital.adapter.bound";
    pub const DIGITAL_ADAPTER_UNBOUND: &str = "dt.digital.adapter.unbound";

    /// Per-key property update: `dt.state.property.{key}.updated`
    pub fn property_updated(key: &str) -> Topic {
        Topic::new(format!("dt.state.property.{}.updated", key))
    }

    /// Per-key property deletion: `dt.state.property.{key}.deleted`
    pub fn property_deleted(key: &str) -> Topic {
        Topic::new(format!("dt.state.property.{}.deleted", key))
    }

    /// Twin event occurrence: `dt.state.event.notification.{key}`
    pub fn event_notification(key: &str) -> Topic {
        Topic::new(format!("dt.state.event.notification.{}", key))
    }

    /// `dt.state.relationship.{name}.instance.created`
    pub fn relationship_instance_created(name: &str) -> Topic {
        Topic::new(format!("dt.state.relationship.{}.instance.created", name))
    }

    /// `dt.state.relationship.{name}.instance.deleted`
    pub fn relationship_instance_deleted(name: &str) -> Topic {
        Topic::new(format!("dt.state.relationship.{}.instance.deleted", name))
    }

    /// Physical-side property variation for one asset property
    pub fn physical_property_variation(key: &str) -> Topic {
        Topic::new(format!("dt.physical.event.property.{}", key))
    }

    /// Physical-side event notification for one asset event
    pub fn physical_event_notification(key: &str) -> Topic {
        Topic::new(format!("dt.physical.event.event.{}", key))
    }

    /// Physical-side relationship instance creation
    pub fn physical_relationship_created(name: &str) -> Topic {
        Topic::new(format!("dt.physical.event.relationship.created.{}", name))
    }

    /// Physical-side relationship instance deletion
    pub fn physical_relationship_deleted(name: &str) -> Topic {
        Topic::new(format!("dt.physical.event.relationship.deleted.{}", name))
    }

    /// Action request re-emitted towards the physical asset
    pub fn physical_action_request(key: &str) -> Topic {
        Topic::new(format!("dt.physical.action.{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_add_is_idempotent() {
        let mut filter = TopicFilter::new();
        assert!(filter.add("dt.state.update"));
        assert!(!filter.add("dt.state.update"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_filter_remove_missing_is_noop() {
        let mut filter = TopicFilter::of(["dt.state.update"]);
        assert!(!filter.remove(&Topic::new("dt.lifecycle")));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_stable_topic_scheme() {
        assert_eq!(topics::STATE_UPDATE, "dt.state.update");
        assert_eq!(topics::DIGITAL_ACTION, "da.digital.action.event");
        assert_eq!(
            topics::property_updated("energy").as_str(),
            "dt.state.property.energy.updated"
        );
        assert_eq!(
            topics::property_deleted("energy").as_str(),
            "dt.state.property.energy.deleted"
        );
        assert_eq!(
            topics::event_notification("overheating").as_str(),
            "dt.state.event.notification.overheating"
        );
        assert_eq!(
            topics::relationship_instance_created("contains").as_str(),
            "dt.state.relationship.contains.instance.created"
        );
        assert_eq!(
            topics::relationship_instance_deleted("contains").as_str(),
            "dt.state.relationship.contains.instance.deleted"
        );
    }
}
