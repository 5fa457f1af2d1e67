/*!
 * TestFleet Devices
 *
 * This crate provides the per-device half of TestFleet: the device model,
 * the transport abstraction devices are reached through, the selector used
 * to pick devices, the connectivity state monitor with its bounded waits,
 * the staged recovery engine, and long-lived background watch actions.
 */

#![warn(missing_docs)]

// Re-export core types
pub use testfleet_core::prelude;

pub mod background;
pub mod device;
pub mod error;
pub mod monitor;
pub mod recovery;
pub mod selection;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use background::{BackgroundDeviceAction, WatchHandle};
pub use device::{ConnectivityState, DeviceHandle, DeviceInfo, DeviceKind};
pub use error::{DeviceError, TransportError};
pub use monitor::DeviceStateMonitor;
pub use recovery::{
    perform_device_action, recover_with_mode, AbortRecovery, DeviceRecovery, RecoveryMode,
    WaitDeviceRecovery,
};
pub use selection::DeviceSelection;
pub use transport::{BufferSink, OutputSink, RebootTarget, Transport, TransportResult};

/// TestFleet devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), testfleet_core::error::Error> {
    tracing::info!("TestFleet Devices {} initialized", VERSION);
    Ok(())
}
