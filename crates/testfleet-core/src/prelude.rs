/*!
 * Prelude module for TestFleet Core.
 *
 * This module re-exports commonly used types and functions from the TestFleet Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{
    AllocationConfig, ConfigBuilder, FleetConfig, FlashingConfig, MonitorConfig, RecoveryConfig,
    SharedConfig, WatchConfig,
};

// Re-export utility functions
pub use crate::utils::{poll_until, poll_until_true, remaining, sleep_or_cancel, spawn_and_log};

// Re-export logging helpers
pub use crate::logging::{device_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
