//! Digital twin state model
//!
//! A [`TwinState`] is one immutable snapshot of the twin: properties,
//! actions, event declarations and relationships, keyed by unique
//! string identifiers and stamped with an evaluation instant. Snapshots
//! are created empty at twin construction and replaced wholesale at
//! every committed transaction; the mutation methods on this type are
//! only ever driven by the transaction engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Timestamp, TwinError, TwinResult};

/// Runtime type of a JSON value, used to enforce the property
/// type-safety invariant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }
}

/// One observable/controllable property of the twin
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinProperty {
    pub key: String,
    pub value: Value,
    pub declared_type: ValueType,
    pub readable: bool,
    pub writable: bool,
    pub exposed: bool,
}

impl TwinProperty {
    /// Create a property, deriving the declared type from the value
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        let declared_type = ValueType::of(&value);
        TwinProperty {
            key: key.into(),
            value,
            declared_type,
            readable: true,
            writable: true,
            exposed: true,
        }
    }

    pub fn with_readable(mut self, readable: bool) -> Self {
        self.readable = readable;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_exposed(mut self, exposed: bool) -> Self {
        self.exposed = exposed;
        self
    }
}

/// A declared, invokable capability; presence in the state means
/// "currently enabled"
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinAction {
    pub key: String,
    pub action_type: String,
    pub content_type: String,
}

impl TwinAction {
    pub fn new(
        key: impl Into<String>,
        action_type: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        TwinAction {
            key: key.into(),
            action_type: action_type.into(),
            content_type: content_type.into(),
        }
    }
}

/// Declaration that the twin may emit notifications under this key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinEventDeclaration {
    pub key: String,
    pub event_type: String,
}

impl TwinEventDeclaration {
    pub fn new(key: impl Into<String>, event_type: impl Into<String>) -> Self {
        TwinEventDeclaration {
            key: key.into(),
            event_type: event_type.into(),
        }
    }
}

/// One occurrence of a declared event; never stored in the snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinEventNotification {
    pub key: String,
    pub body: Value,
    pub timestamp: Timestamp,
}

impl TwinEventNotification {
    pub fn new(key: impl Into<String>, body: Value) -> Self {
        TwinEventNotification {
            key: key.into(),
            body,
            timestamp: Timestamp::now(),
        }
    }
}

/// A named relationship kind and its current instances
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinRelationship {
    pub name: String,
    pub relationship_type: String,
    pub instances: HashMap<String, TwinRelationshipInstance>,
}

impl TwinRelationship {
    pub fn new(name: impl Into<String>, relationship_type: impl Into<String>) -> Self {
        TwinRelationship {
            name: name.into(),
            relationship_type: relationship_type.into(),
            instances: HashMap::new(),
        }
    }
}

/// One concrete link from this twin to a target entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinRelationshipInstance {
    pub relationship_name: String,
    pub target_id: String,
    pub instance_key: String,
    pub metadata: HashMap<String, Value>,
}

impl TwinRelationshipInstance {
    pub fn new(
        relationship_name: impl Into<String>,
        target_id: impl Into<String>,
        instance_key: impl Into<String>,
    ) -> Self {
        TwinRelationshipInstance {
            relationship_name: relationship_name.into(),
            target_id: target_id.into(),
            instance_key: instance_key.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One snapshot of the digital twin state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinState {
    pub properties: HashMap<String, TwinProperty>,
    pub actions: HashMap<String, TwinAction>,
    pub events: HashMap<String, TwinEventDeclaration>,
    pub relationships: HashMap<String, TwinRelationship>,
    pub evaluation_instant: Timestamp,
}

impl TwinState {
    pub fn new() -> Self {
        TwinState::default()
    }

    /// Stamp a new evaluation instant
    pub fn touch(&mut self) {
        self.evaluation_instant = Timestamp::now();
    }

    /* Properties */

    pub fn contains_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Read one property, honoring the readable flag
    pub fn read_property(&self, key: &str) -> TwinResult<&TwinProperty> {
        let property = self
            .properties
            .get(key)
            .ok_or_else(|| TwinError::not_found("property", key))?;
        if !property.readable {
            return Err(TwinError::BadRequest(format!(
                "property '{}' is not readable",
                key
            )));
        }
        Ok(property)
    }

    pub fn create_property(&mut self, property: TwinProperty) -> TwinResult<()> {
        if self.properties.contains_key(&property.key) {
            return Err(TwinError::conflict("property", &property.key));
        }
        check_property_type(&property)?;
        self.properties.insert(property.key.clone(), property);
        Ok(())
    }

    /// Replace a property wholesale (value, declared type and flags)
    pub fn update_property(&mut self, property: TwinProperty) -> TwinResult<()> {
        if !self.properties.contains_key(&property.key) {
            return Err(TwinError::not_found("property", &property.key));
        }
        check_property_type(&property)?;
        self.properties.insert(property.key.clone(), property);
        Ok(())
    }

    /// Update only a property's value, honoring the writable flag and
    /// the declared-type invariant
    pub fn update_property_value(&mut self, key: &str, value: Value) -> TwinResult<()> {
        let property = self
            .properties
            .get_mut(key)
            .ok_or_else(|| TwinError::not_found("property", key))?;
        if !property.writable {
            return Err(TwinError::BadRequest(format!(
                "property '{}' is not writable",
                key
            )));
        }
        let value_type = ValueType::of(&value);
        if value_type != property.declared_type {
            return Err(TwinError::BadRequest(format!(
                "property '{}' value type {:?} does not match declared type {:?}",
                key, value_type, property.declared_type
            )));
        }
        property.value = value;
        Ok(())
    }

    pub fn delete_property(&mut self, key: &str) -> TwinResult<TwinProperty> {
        self.properties
            .remove(key)
            .ok_or_else(|| TwinError::not_found("property", key))
    }

    /* Actions */

    pub fn contains_action(&self, key: &str) -> bool {
        self.actions.contains_key(key)
    }

    pub fn action(&self, key: &str) -> Option<&TwinAction> {
        self.actions.get(key)
    }

    pub fn enable_action(&mut self, action: TwinAction) -> TwinResult<()> {
        if self.actions.contains_key(&action.key) {
            return Err(TwinError::conflict("action", &action.key));
        }
        self.actions.insert(action.key.clone(), action);
        Ok(())
    }

    pub fn update_action(&mut self, action: TwinAction) -> TwinResult<()> {
        if !self.actions.contains_key(&action.key) {
            return Err(TwinError::not_found("action", &action.key));
        }
        self.actions.insert(action.key.clone(), action);
        Ok(())
    }

    pub fn disable_action(&mut self, key: &str) -> TwinResult<TwinAction> {
        self.actions
            .remove(key)
            .ok_or_else(|| TwinError::not_found("action", key))
    }

    /* Event declarations */

    pub fn contains_event(&self, key: &str) -> bool {
        self.events.contains_key(key)
    }

    pub fn register_event(&mut self, event: TwinEventDeclaration) -> TwinResult<()> {
        if self.events.contains_key(&event.key) {
            return Err(TwinError::conflict("event", &event.key));
        }
        self.events.insert(event.key.clone(), event);
        Ok(())
    }

    pub fn update_event(&mut self, event: TwinEventDeclaration) -> TwinResult<()> {
        if !self.events.contains_key(&event.key) {
            return Err(TwinError::not_found("event", &event.key));
        }
        self.events.insert(event.key.clone(), event);
        Ok(())
    }

    pub fn unregister_event(&mut self, key: &str) -> TwinResult<TwinEventDeclaration> {
        self.events
            .remove(key)
            .ok_or_else(|| TwinError::not_found("event", key))
    }

    /* Relationships */

    pub fn contains_relationship(&self, name: &str) -> bool {
        self.relationships.contains_key(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&TwinRelationship> {
        self.relationships.get(name)
    }

    pub fn create_relationship(&mut self, relationship: TwinRelationship) -> TwinResult<()> {
        if self.relationships.contains_key(&relationship.name) {
            return Err(TwinError::conflict("relationship", &relationship.name));
        }
        self.relationships
            .insert(relationship.name.clone(), relationship);
        Ok(())
    }

    pub fn delete_relationship(&mut self, name: &str) -> TwinResult<TwinRelationship> {
        self.relationships
            .remove(name)
            .ok_or_else(|| TwinError::not_found("relationship", name))
    }

    pub fn add_relationship_instance(
        &mut self,
        instance: TwinRelationshipInstance,
    ) -> TwinResult<()> {
        let relationship = self
            .relationships
            .get_mut(&instance.relationship_name)
            .ok_or_else(|| TwinError::not_found("relationship", &instance.relationship_name))?;
        relationship
            .instances
            .insert(instance.instance_key.clone(), instance);
        Ok(())
    }

    pub fn delete_relationship_instance(
        &mut self,
        name: &str,
        instance_key: &str,
    ) -> TwinResult<TwinRelationshipInstance> {
        let relationship = self
            .relationships
            .get_mut(name)
            .ok_or_else(|| TwinError::not_found("relationship", name))?;
        relationship
            .instances
            .remove(instance_key)
            .ok_or_else(|| TwinError::not_found("relationship instance", instance_key))
    }
}

fn check_property_type(property: &TwinProperty) -> TwinResult<()> {
    let value_type = ValueType::of(&property.value);
    if value_type != property.declared_type {
        return Err(TwinError::BadRequest(format!(
            "property '{}' value type {:?} does not match declared type {:?}",
            property.key, value_type, property.declared_type
        )));
    }
    Ok(())
}
