/*!
 * Allocation state machine.
 *
 * Every device carries an [`AllocationState`] that only ever changes through
 * [`AllocationState::handle_event`]. The function is pure; callers serialize
 * it per device and apply the resulting state.
 *
 * ```text
 * Unknown      --CONNECTED_ONLINE, STATE_CHANGE_ONLINE-->    Checking
 * Unknown      --CONNECTED_OFFLINE, STATE_CHANGE_OFFLINE-->  Unavailable
 * Checking     --AVAILABLE_CHECK_PASSED-->                   Available
 * Checking     --AVAILABLE_CHECK_FAILED-->                   Unavailable
 * Checking     --AVAILABLE_CHECK_IGNORED-->                  Ignored
 * Available    --ALLOCATE_REQUEST-->                         Allocated
 * Available    --STATE_CHANGE_OFFLINE-->                     Unavailable
 * Allocated    --FREE_AVAILABLE-->                           Available
 * Allocated    --FREE_UNKNOWN-->                             Unknown
 * any          --FORCE_ALLOCATE_REQUEST-->                   Allocated (not from Allocated)
 * any          --FORCE_AVAILABLE-->                          Available
 * ```
 *
 * DISCONNECTED sends every state except Allocated back to Unknown. An
 * allocated device keeps its allocation through a disconnect.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// Allocation state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AllocationState {
    /// Not seen online since the last reset
    #[default]
    Unknown,
    /// Connected, availability check in progress
    CheckingAvailability,
    /// In the allocation queue
    Available,
    /// Held by a caller
    Allocated,
    /// Excluded by the global device filter
    Ignored,
    /// Connected but unusable
    Unavailable,
}

/// Events driving the allocation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationEvent {
    /// Device connected and online
    ConnectedOnline,
    /// Device connected but offline
    ConnectedOffline,
    /// Device disconnected
    Disconnected,
    /// Connected device became online
    StateChangeOnline,
    /// Connected device became offline
    StateChangeOffline,
    /// Availability check passed
    AvailableCheckPassed,
    /// Availability check failed
    AvailableCheckFailed,
    /// Device excluded by the global filter
    AvailableCheckIgnored,
    /// Allocate an available device
    AllocateRequest,
    /// Allocate whatever the current state
    ForceAllocateRequest,
    /// Return a device to the available set
    FreeAvailable,
    /// Return a device that must be re-checked
    FreeUnknown,
    /// Make a device available without checking it
    ForceAvailable,
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventResponse {
    /// State after the event
    pub state: AllocationState,
    /// Whether the event was accepted
    pub success: bool,
}

impl EventResponse {
    const fn accepted(state: AllocationState) -> Self {
        Self { state, success: true }
    }

    const fn rejected(state: AllocationState) -> Self {
        Self { state, success: false }
    }
}

impl AllocationState {
    /// Every state
    pub const ALL: [AllocationState; 6] = [
        AllocationState::Unknown,
        AllocationState::CheckingAvailability,
        AllocationState::Available,
        AllocationState::Allocated,
        AllocationState::Ignored,
        AllocationState::Unavailable,
    ];

    /// Apply an event
    ///
    /// Rejected events leave the state unchanged and report `success = false`.
    #[must_use]
    pub const fn handle_event(self, event: AllocationEvent) -> EventResponse {
        use AllocationEvent as E;
        use AllocationState as S;

        let next = match (self, event) {
            (S::Allocated, E::ForceAllocateRequest) => None,
            (_, E::ForceAllocateRequest) => Some(S::Allocated),
            (_, E::ForceAvailable) => Some(S::Available),

            (S::Unknown, E::ConnectedOnline | E::StateChangeOnline) => {
                Some(S::CheckingAvailability)
            }
            (S::Unknown, E::ConnectedOffline | E::StateChangeOffline) => Some(S::Unavailable),

            (S::CheckingAvailability, E::AvailableCheckPassed) => Some(S::Available),
            (S::CheckingAvailability, E::AvailableCheckFailed) => Some(S::Unavailable),
            (S::CheckingAvailability, E::AvailableCheckIgnored) => Some(S::Ignored),

            (S::Available, E::AllocateRequest) => Some(S::Allocated),
            (S::Available, E::StateChangeOffline) => Some(S::Unavailable),

            (S::Allocated, E::FreeAvailable) => Some(S::Available),
            (S::Allocated, E::FreeUnknown) => Some(S::Unknown),

            (
                S::CheckingAvailability | S::Available | S::Unavailable | S::Ignored,
                E::Disconnected,
            ) => Some(S::Unknown),

            _ => None,
        };

        match next {
            Some(state) if !matches!((self, state), (S::Available, S::Available)) => {
                EventResponse::accepted(state)
            }
            // forcing an available device available again changes nothing
            Some(_) => EventResponse::rejected(self),
            None => EventResponse::rejected(self),
        }
    }

    /// Whether the device belongs in the allocation queue
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, AllocationState::Available)
    }

    /// Whether the device is held by a caller
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        matches!(self, AllocationState::Allocated)
    }
}

impl AllocationEvent {
    /// Every event
    pub const ALL: [AllocationEvent; 13] = [
        AllocationEvent::ConnectedOnline,
        AllocationEvent::ConnectedOffline,
        AllocationEvent::Disconnected,
        AllocationEvent::StateChangeOnline,
        AllocationEvent::StateChangeOffline,
        AllocationEvent::AvailableCheckPassed,
        AllocationEvent::AvailableCheckFailed,
        AllocationEvent::AvailableCheckIgnored,
        AllocationEvent::AllocateRequest,
        AllocationEvent::ForceAllocateRequest,
        AllocationEvent::FreeAvailable,
        AllocationEvent::FreeUnknown,
        AllocationEvent::ForceAvailable,
    ];
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationState::Unknown => "Unknown",
            AllocationState::CheckingAvailability => "Checking_Availability",
            AllocationState::Available => "Available",
            AllocationState::Allocated => "Allocated",
            AllocationState::Ignored => "Ignored",
            AllocationState::Unavailable => "Unavailable",
        };
        f.write_str(name)
    }
}

impl fmt::Display for AllocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationEvent::ConnectedOnline => "CONNECTED_ONLINE",
            AllocationEvent::ConnectedOffline => "CONNECTED_OFFLINE",
            AllocationEvent::Disconnected => "DISCONNECTED",
            AllocationEvent::StateChangeOnline => "STATE_CHANGE_ONLINE",
            AllocationEvent::StateChangeOffline => "STATE_CHANGE_OFFLINE",
            AllocationEvent::AvailableCheckPassed => "AVAILABLE_CHECK_PASSED",
            AllocationEvent::AvailableCheckFailed => "AVAILABLE_CHECK_FAILED",
            AllocationEvent::AvailableCheckIgnored => "AVAILABLE_CHECK_IGNORED",
            AllocationEvent::AllocateRequest => "ALLOCATE_REQUEST",
            AllocationEvent::ForceAllocateRequest => "FORCE_ALLOCATE_REQUEST",
            AllocationEvent::FreeAvailable => "FREE_AVAILABLE",
            AllocationEvent::FreeUnknown => "FREE_UNKNOWN",
            AllocationEvent::ForceAvailable => "FORCE_AVAILABLE",
        };
        f.write_str(name)
    }
}
