/*!
 * TestFleet Engine
 *
 * This crate provides the fleet-wide half of TestFleet: the allocation state
 * machine, the allocation queue, the device registry, the flashing gate and
 * the device manager that ties them to the transport and to recovery.
 */

#![warn(missing_docs)]

// Re-export core types
pub use testfleet_core::prelude;

pub mod error;
pub mod flashing;
pub mod managed;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod state_machine;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use flashing::{FlashingGate, HostOptions, StaticHostOptions};
pub use managed::{DeviceDescriptor, ManagedDevice};
pub use manager::{DeviceManager, FreeDeviceState};
pub use queue::{AllocationQueue, Keyed};
pub use registry::{FleetRegistry, RegistryEvent};
pub use state_machine::{AllocationEvent, AllocationState, EventResponse};

/// TestFleet engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("TestFleet Engine {} initialized", VERSION);
    Ok(())
}
