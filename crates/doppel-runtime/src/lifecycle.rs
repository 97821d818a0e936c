//! Lifecycle state machine and fan-out signals
//!
//! One [`LifecycleState`] instance exists per twin and is only ever
//! advanced by the coordinator; adapters never set it directly. Every
//! transition (and every per-adapter binding change) is fanned out as a
//! single tagged [`LifecycleSignal`] through one handler per listener.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use doppel_core::AdapterId;

use crate::physical::AssetDescription;

/// Twin-level lifecycle state, advanced only by the coordinator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    #[serde(rename = "dt_none")]
    None,
    #[serde(rename = "dt_created")]
    Created,
    #[serde(rename = "dt_started")]
    Started,
    #[serde(rename = "dt_bound")]
    Bound,
    #[serde(rename = "dt_un_bound")]
    Unbound,
    #[serde(rename = "dt_synchronized")]
    Synchronized,
    #[serde(rename = "dt_not_synchronized")]
    NotSynchronized,
    #[serde(rename = "dt_stopped")]
    Stopped,
    #[serde(rename = "dt_destroyed")]
    Destroyed,
}

impl LifecycleState {
    /// Stable wire label of this state
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::None => "dt_none",
            LifecycleState::Created => "dt_created",
            LifecycleState::Started => "dt_started",
            LifecycleState::Bound => "dt_bound",
            LifecycleState::Unbound => "dt_un_bound",
            LifecycleState::Synchronized => "dt_synchronized",
            LifecycleState::NotSynchronized => "dt_not_synchronized",
            LifecycleState::Stopped => "dt_stopped",
            LifecycleState::Destroyed => "dt_destroyed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One lifecycle notification fanned out by the coordinator.
///
/// Twin-level variants correspond to a [`LifecycleState`] transition;
/// per-adapter variants report binding changes of a single adapter and
/// do not move the twin-level state machine by themselves.
#[derive(Clone, Debug)]
pub enum LifecycleSignal {
    Created,
    Started,
    /// Every physical adapter reports bound; carries all current asset
    /// descriptions keyed by adapter id.
    Bound {
        descriptions: HashMap<AdapterId, AssetDescription>,
    },
    /// At least one physical adapter dropped its binding.
    Unbound { error: Option<String> },
    Synchronized,
    NotSynchronized,
    Stopped,
    Destroyed,

    PhysicalAdapterBound {
        adapter_id: AdapterId,
        description: AssetDescription,
    },
    PhysicalAdapterBindingUpdated {
        adapter_id: AdapterId,
        description: AssetDescription,
    },
    PhysicalAdapterUnbound {
        adapter_id: AdapterId,
        error: Option<String>,
    },
    DigitalAdapterBound { adapter_id: AdapterId },
    DigitalAdapterUnbound {
        adapter_id: AdapterId,
        error: Option<String>,
    },
}

impl LifecycleSignal {
    /// The twin-level state this signal transitions to, if any.
    /// Per-adapter signals return `None`.
    pub fn state(&self) -> Option<LifecycleState> {
        match self {
            LifecycleSignal::Created => Some(LifecycleState::Created),
            LifecycleSignal::Started => Some(LifecycleState::Started),
            LifecycleSignal::Bound { .. } => Some(LifecycleState::Bound),
            LifecycleSignal::Unbound { .. } => Some(LifecycleState::Unbound),
            LifecycleSignal::Synchronized => Some(LifecycleState::Synchronized),
            LifecycleSignal::NotSynchronized => Some(LifecycleState::NotSynchronized),
            LifecycleSignal::Stopped => Some(LifecycleState::Stopped),
            LifecycleSignal::Destroyed => Some(LifecycleState::Destroyed),
            LifecycleSignal::PhysicalAdapterBound { .. }
            | LifecycleSignal::PhysicalAdapterBindingUpdated { .. }
            | LifecycleSignal::PhysicalAdapterUnbound { .. }
            | LifecycleSignal::DigitalAdapterBound { .. }
            | LifecycleSignal::DigitalAdapterUnbound { .. } => None,
        }
    }
}

/// Receiver of lifecycle fan-out, registered on the coordinator
pub trait LifecycleListener: Send + Sync {
    fn on_lifecycle(&self, signal: &LifecycleSignal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels_are_stable() {
        assert_eq!(LifecycleState::None.label(), "dt_none");
        assert_eq!(LifecycleState::Unbound.label(), "dt_un_bound");
        assert_eq!(
            LifecycleState::NotSynchronized.label(),
            "dt_not_synchronized"
        );
        assert_eq!(
            serde_json::to_value(LifecycleState::Bound).unwrap(),
            serde_json::json!("dt_bound")
        );
    }

    #[test]
    fn test_per_adapter_signals_do_not_transition() {
        let signal = LifecycleSignal::DigitalAdapterBound {
            adapter_id: AdapterId::new("rest-adapter"),
        };
        assert!(signal.state().is_none());
        assert_eq!(
            LifecycleSignal::Stopped.state(),
            Some(LifecycleState::Stopped)
        );
    }
}
