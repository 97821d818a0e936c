//! State-change records
//!
//! Every staged mutation inside a transaction produces one immutable
//! [`StateChange`]. The ordered change-list of a committed transaction
//! is what rides in the `dt.state.update` metadata and what the storage
//! layer archives.

use serde::{Deserialize, Serialize};

use crate::{
    TwinAction, TwinEventDeclaration, TwinProperty, TwinRelationship, TwinRelationshipInstance,
};

/// Kind of mutation applied to a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Add,
    Update,
    UpdateValue,
    Remove,
}

/// Kind of resource affected by a state change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Property,
    PropertyValue,
    Action,
    Event,
    Relationship,
    RelationshipInstance,
}

/// The resource payload carried by a state change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateResource {
    Property(TwinProperty),
    Action(TwinAction),
    Event(TwinEventDeclaration),
    Relationship(TwinRelationship),
    RelationshipInstance(TwinRelationshipInstance),
}

impl StateResource {
    /// The identifying key of the wrapped resource
    pub fn key(&self) -> &str {
        match self {
            StateResource::Property(p) => &p.key,
            StateResource::Action(a) => &a.key,
            StateResource::Event(e) => &e.key,
            StateResource::Relationship(r) => &r.name,
            StateResource::RelationshipInstance(i) => &i.instance_key,
        }
    }
}

/// One recorded mutation: operation, resource kind, resource payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    operation: ChangeOperation,
    resource_type: ResourceType,
    resource: StateResource,
}

impl StateChange {
    pub fn new(
        operation: ChangeOperation,
        resource_type: ResourceType,
        resource: StateResource,
    ) -> Self {
        StateChange {
            operation,
            resource_type,
            resource,
        }
    }

    #[inline]
    pub fn operation(&self) -> ChangeOperation {
        self.operation
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    #[inline]
    pub fn resource(&self) -> &StateResource {
        &self.resource
    }
}
