//! Controller lifecycle state machine
//!
//! Every state change of a controller is the result of feeding a [`LifecycleEvent`]
//! into [`ControllerState::transition`]. Transitions the table does not know about are
//! rejected with a [`StateTransitionError`]; the controller logs those and keeps its
//! current state.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ControllerState, Role};

// ----------------------------------------------------------------------------
// Lifecycle Events
// ----------------------------------------------------------------------------

/// Inputs of the controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The user asked to connect to the remote device
    ConnectRequested,
    /// The backend opened the link
    LinkEstablished,
    /// The backend could not open the link
    LinkFailed,
    /// The user asked for primary service discovery
    DiscoveryRequested,
    DiscoveryFinished,
    DiscoveryFailed,
    /// The user asked to close the link or stop advertising
    DisconnectRequested,
    /// The backend finished closing a link we asked to close
    LinkClosed,
    /// The link dropped without being asked to
    LinkLost,
    AdvertisingRequested,
    AdvertisingStopped,
    AdvertisingFailed,
    /// A remote central connected to our advertisement
    CentralConnected,
}

impl LifecycleEvent {
    /// Role an event is restricted to, if any
    pub fn required_role(&self) -> Option<Role> {
        match self {
            LifecycleEvent::ConnectRequested | LifecycleEvent::DiscoveryRequested => Some(Role::Central),
            LifecycleEvent::AdvertisingRequested | LifecycleEvent::CentralConnected => {
                Some(Role::Peripheral)
            }
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub new_state: ControllerState,
    pub audit_entry: AuditEntry,
}

impl StateTransition {
    /// Whether the transition actually moved to another state
    pub fn changed(&self) -> bool {
        self.audit_entry.from_state != self.audit_entry.to_state
    }
}

/// Audit trail entry for one transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
    pub role: Role,
    pub from_state: ControllerState,
    pub to_state: ControllerState,
    pub event: LifecycleEvent,
}

/// Errors of the state machine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event:?}")]
    InvalidTransition {
        from_state: ControllerState,
        event: LifecycleEvent,
    },

    #[error("Event {event:?} requires the {required:?} role")]
    WrongRole { event: LifecycleEvent, required: Role },
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl ControllerState {
    /// Processes an event for a controller acting in `role`
    pub fn transition(self, event: LifecycleEvent, role: Role) -> Result<StateTransition, StateTransitionError> {
        if let Some(required) = event.required_role() {
            if required != role {
                return Err(StateTransitionError::WrongRole { event, required });
            }
        }

        use ControllerState::*;
        use LifecycleEvent::*;

        let new_state = match (self, event) {
            // Central link setup
            (Unconnected, ConnectRequested) => Connecting,
            (Connecting, LinkEstablished) => Connected,
            (Connecting, LinkFailed) => Unconnected,

            // Service discovery
            (Connected, DiscoveryRequested) => Discovering,
            (Discovering, DiscoveryFinished) => Discovered,
            (Discovering, DiscoveryFailed) => Connected,

            // Teardown
            (Connecting | Connected | Discovering | Discovered, DisconnectRequested) => Closing,
            (Advertising, DisconnectRequested) => Unconnected,
            (Closing, LinkClosed) => Unconnected,
            (Connecting | Connected | Discovering | Discovered | Closing, LinkLost) => Unconnected,

            // Peripheral
            (Unconnected, AdvertisingRequested) => Advertising,
            (Advertising, AdvertisingStopped | AdvertisingFailed) => Unconnected,
            (Advertising, CentralConnected) => Connected,

            (from_state, event) => {
                return Err(StateTransitionError::InvalidTransition { from_state, event });
            }
        };

        Ok(StateTransition {
            new_state,
            audit_entry: AuditEntry {
                timestamp: current_timestamp(),
                role,
                from_state: self,
                to_state: new_state,
                event,
            },
        })
    }

    /// Whether `event` would be accepted in this state
    pub fn accepts(self, event: LifecycleEvent, role: Role) -> bool {
        self.transition(event, role).is_ok()
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[LifecycleEvent], role: Role) -> ControllerState {
        events.iter().fold(ControllerState::Unconnected, |state, event| {
            state.transition(*event, role).unwrap().new_state
        })
    }

    #[test]
    fn test_central_lifecycle() {
        use LifecycleEvent::*;

        assert_eq!(run(&[ConnectRequested], Role::Central), ControllerState::Connecting);
        assert_eq!(
            run(&[ConnectRequested, LinkEstablished, DiscoveryRequested, DiscoveryFinished], Role::Central),
            ControllerState::Discovered
        );
        assert_eq!(
            run(&[ConnectRequested, LinkEstablished, DisconnectRequested, LinkClosed], Role::Central),
            ControllerState::Unconnected
        );
    }

    #[test]
    fn test_discovery_failure_reverts_to_connected() {
        use LifecycleEvent::*;

        let state = run(&[ConnectRequested, LinkEstablished, DiscoveryRequested], Role::Central);
        let transition = state.transition(DiscoveryFailed, Role::Central).unwrap();
        assert_eq!(transition.new_state, ControllerState::Connected);
        assert_eq!(transition.audit_entry.from_state, ControllerState::Discovering);
    }

    #[test]
    fn test_connect_only_from_unconnected() {
        for state in [
            ControllerState::Connecting,
            ControllerState::Connected,
            ControllerState::Discovered,
            ControllerState::Closing,
            ControllerState::Advertising,
        ] {
            let result = state.transition(LifecycleEvent::ConnectRequested, Role::Central);
            assert_eq!(
                result.unwrap_err(),
                StateTransitionError::InvalidTransition {
                    from_state: state,
                    event: LifecycleEvent::ConnectRequested,
                }
            );
        }
    }

    #[test]
    fn test_role_restrictions() {
        let result = ControllerState::Unconnected.transition(LifecycleEvent::ConnectRequested, Role::Peripheral);
        assert!(matches!(result, Err(StateTransitionError::WrongRole { required: Role::Central, .. })));

        let result = ControllerState::Unconnected.transition(LifecycleEvent::AdvertisingRequested, Role::Central);
        assert!(matches!(result, Err(StateTransitionError::WrongRole { .. })));
    }

    #[test]
    fn test_peripheral_lifecycle() {
        use LifecycleEvent::*;

        assert_eq!(run(&[AdvertisingRequested], Role::Peripheral), ControllerState::Advertising);
        assert_eq!(
            run(&[AdvertisingRequested, CentralConnected], Role::Peripheral),
            ControllerState::Connected
        );
        // a dropped link does not resume advertising
        assert_eq!(
            run(&[AdvertisingRequested, CentralConnected, LinkLost], Role::Peripheral),
            ControllerState::Unconnected
        );
        assert_eq!(
            run(&[AdvertisingRequested, DisconnectRequested], Role::Peripheral),
            ControllerState::Unconnected
        );
        assert!(!ControllerState::Advertising.accepts(DiscoveryRequested, Role::Peripheral));
    }

    #[test]
    fn test_link_lost_from_every_linked_state() {
        for state in [
            ControllerState::Connecting,
            ControllerState::Connected,
            ControllerState::Discovering,
            ControllerState::Discovered,
            ControllerState::Closing,
        ] {
            let transition = state.transition(LifecycleEvent::LinkLost, Role::Central).unwrap();
            assert_eq!(transition.new_state, ControllerState::Unconnected);
            assert!(transition.changed());
        }
        assert!(!ControllerState::Unconnected.accepts(LifecycleEvent::LinkLost, Role::Central));
    }
}
