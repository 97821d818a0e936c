//! State transaction
//!
//! A transaction is created from the current snapshot, accepts staged
//! change requests until committed, and applies them in order on
//! commit. Staging validates each change against the working state
//! (start state plus previously staged changes); commit re-validates
//! the whole list against a fresh copy of the start state and stops at
//! the first failure, leaving the published snapshot untouched.

use doppel_core::{
    ChangeOperation, StateChange, StateResource, TwinError, TwinResult, TwinState,
};

/// One staged batch of state mutations
#[derive(Clone, Debug)]
pub struct StateTransaction {
    start_state: TwinState,
    end_state: TwinState,
    changes: Vec<StateChange>,
    committed: bool,
}

impl StateTransaction {
    /// Open a transaction over the given snapshot
    pub fn new(start_state: TwinState) -> Self {
        let end_state = start_state.clone();
        StateTransaction {
            start_state,
            end_state,
            changes: Vec::new(),
            committed: false,
        }
    }

    /// Stage one change request.
    ///
    /// The change is validated by applying it to the working state; on
    /// success it is appended to the ordered change-list. A committed
    /// transaction rejects further changes.
    pub fn stage(&mut self, change: StateChange) -> TwinResult<()> {
        if self.committed {
            return Err(TwinError::TransactionCommitted);
        }
        apply_change(&mut self.end_state, &change)?;
        self.changes.push(change);
        Ok(())
    }

    /// Discard all staged changes and reset the working state to the
    /// start snapshot. The transaction stays open for reuse.
    pub fn rollback(&mut self) {
        self.changes.clear();
        self.end_state = self.start_state.clone();
    }

    /// Apply every staged change, in order, against a fresh copy of the
    /// start state and stamp a new evaluation instant.
    ///
    /// On the first failing change the commit aborts: the transaction
    /// stays open and un-committed with its staged changes intact.
    pub fn commit(&mut self) -> TwinResult<()> {
        if self.committed {
            return Err(TwinError::TransactionCommitted);
        }

        let mut next = self.start_state.clone();
        for change in &self.changes {
            apply_change(&mut next, change)?;
        }
        next.touch();

        self.end_state = next;
        self.committed = true;
        Ok(())
    }

    #[inline]
    pub fn start_state(&self) -> &TwinState {
        &self.start_state
    }

    #[inline]
    pub fn end_state(&self) -> &TwinState {
        &self.end_state
    }

    #[inline]
    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

/// Apply one change record to a state, re-validating its preconditions
pub(crate) fn apply_change(state: &mut TwinState, change: &StateChange) -> TwinResult<()> {
    match (change.operation(), change.resource()) {
        // Properties
        (ChangeOperation::Add, StateResource::Property(p)) => state.create_property(p.clone()),
        (ChangeOperation::Update, StateResource::Property(p)) => state.update_property(p.clone()),
        (ChangeOperation::UpdateValue, StateResource::Property(p)) => {
            state.update_property_value(&p.key, p.value.clone())
        }
        (ChangeOperation::Remove, StateResource::Property(p)) => {
            state.delete_property(&p.key).map(|_| ())
        }

        // Actions
        (ChangeOperation::Add, StateResource::Action(a)) => state.enable_action(a.clone()),
        (ChangeOperation::Update, StateResource::Action(a)) => state.update_action(a.clone()),
        (ChangeOperation::Remove, StateResource::Action(a)) => {
            state.disable_action(&a.key).map(|_| ())
        }

        // Event declarations
        (ChangeOperation::Add, StateResource::Event(e)) => state.register_event(e.clone()),
        (ChangeOperation::Update, StateResource::Event(e)) => state.update_event(e.clone()),
        (ChangeOperation::Remove, StateResource::Event(e)) => {
            state.unregister_event(&e.key).map(|_| ())
        }

        // Relationships
        (ChangeOperation::Add, StateResource::Relationship(r)) => {
            state.create_relationship(r.clone())
        }
        (ChangeOperation::Remove, StateResource::Relationship(r)) => {
            state.delete_relationship(&r.name).map(|_| ())
        }

        // Relationship instances
        (ChangeOperation::Add, StateResource::RelationshipInstance(i)) => {
            state.add_relationship_instance(i.clone())
        }
        (ChangeOperation::Remove, StateResource::RelationshipInstance(i)) => state
            .delete_relationship_instance(&i.relationship_name, &i.instance_key)
            .map(|_| ()),

        (operation, _) => Err(TwinError::BadRequest(format!(
            "unsupported state change: {:?} on {:?} resource",
            operation,
            change.resource_type()
        ))),
    }
}
