/*!
 * Managed device records.
 *
 * A [`ManagedDevice`] is the fleet's view of one device: its attributes, its
 * connectivity monitor, its allocation state and the watch actions bound to
 * it. The allocation state is guarded by a per-device lock, and queue
 * membership is brought in line with it before that lock is released.
 */
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use testfleet_devices::device::{PROP_BUILD_ID, PROP_PRODUCT_TYPE, PROP_PRODUCT_VARIANT};
use testfleet_devices::{
    ConnectivityState, DeviceInfo, DeviceKind, DeviceStateMonitor, RecoveryMode, WatchHandle,
};

use crate::queue::{AllocationQueue, Keyed};
use crate::state_machine::{AllocationEvent, AllocationState, EventResponse};

#[derive(Debug, Clone, Copy)]
struct AllocationRecord {
    state: AllocationState,
    changed_at: DateTime<Utc>,
    // set once the record left the registry, every later event is rejected
    retired: bool,
}

/// The fleet's record of one device
#[derive(Debug)]
pub struct ManagedDevice {
    serial: String,
    info: RwLock<DeviceInfo>,
    monitor: Arc<DeviceStateMonitor>,
    allocation: Mutex<AllocationRecord>,
    recovery_mode: RwLock<RecoveryMode>,
    watches: Mutex<Vec<WatchHandle>>,
}

/// Snapshot of a device for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    /// Device serial
    pub serial: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Whether the record is a placeholder
    pub placeholder: bool,
    /// Connectivity state
    pub connectivity: ConnectivityState,
    /// Allocation state
    pub allocation: AllocationState,
    /// Product type
    pub product: Option<String>,
    /// Product variant
    pub variant: Option<String>,
    /// SDK level
    pub sdk_level: Option<u32>,
    /// Build id
    pub build_id: Option<String>,
    /// Battery level in percent
    pub battery_level: Option<u32>,
    /// When the allocation state last changed
    pub last_changed: DateTime<Utc>,
}

impl ManagedDevice {
    /// Create a record in the `Unknown` allocation state
    pub fn new(info: DeviceInfo, monitor: Arc<DeviceStateMonitor>) -> Self {
        Self {
            serial: info.serial.clone(),
            info: RwLock::new(info),
            monitor,
            allocation: Mutex::new(AllocationRecord {
                state: AllocationState::Unknown,
                changed_at: Utc::now(),
                retired: false,
            }),
            recovery_mode: RwLock::new(RecoveryMode::default()),
            watches: Mutex::new(Vec::new()),
        }
    }

    /// The device serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Copy of the device attributes
    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    /// Replace the device attributes, keeping the serial
    pub fn update_info(&self, mut info: DeviceInfo) {
        info.serial = self.serial.clone();
        *self.info.write() = info;
    }

    /// Run `f` against the attributes without copying them
    pub fn with_info<R>(&self, f: impl FnOnce(&DeviceInfo) -> R) -> R {
        f(&self.info.read())
    }

    /// The connectivity monitor
    pub fn monitor(&self) -> &Arc<DeviceStateMonitor> {
        &self.monitor
    }

    /// Current connectivity state
    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// Current allocation state
    pub fn allocation_state(&self) -> AllocationState {
        self.allocation.lock().state
    }

    /// When the allocation state last changed
    pub fn last_changed(&self) -> DateTime<Utc> {
        self.allocation.lock().changed_at
    }

    /// Recovery mode used for device actions
    pub fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery_mode.read()
    }

    /// Set the recovery mode
    pub fn set_recovery_mode(&self, mode: RecoveryMode) {
        *self.recovery_mode.write() = mode;
    }

    /// Track a watch action bound to this device
    pub fn add_watch(&self, handle: WatchHandle) {
        self.watches.lock().push(handle);
    }

    /// Number of tracked watch actions
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Hand over every tracked watch action
    pub fn take_watches(&self) -> Vec<WatchHandle> {
        std::mem::take(&mut *self.watches.lock())
    }

    /// Whether the record was removed from the fleet
    pub fn is_retired(&self) -> bool {
        self.allocation.lock().retired
    }

    /// Take the record out of service unless it is allocated
    ///
    /// Runs under the allocation lock, so an allocation either lands before
    /// and blocks the retirement, or comes after and is rejected.
    pub(crate) fn retire(&self, queue: &AllocationQueue<Arc<ManagedDevice>>) -> bool {
        let mut record = self.allocation.lock();
        if record.state.is_allocated() {
            return false;
        }
        record.retired = true;
        queue.remove(&self.serial);
        true
    }

    /// Apply an allocation event and sync queue membership
    ///
    /// The device lock is held across the transition and the queue update,
    /// so no poller can observe one without the other.
    pub(crate) fn apply_event(
        self: &Arc<Self>,
        event: AllocationEvent,
        queue: &AllocationQueue<Arc<ManagedDevice>>,
    ) -> (AllocationState, EventResponse) {
        let mut record = self.allocation.lock();
        let previous = record.state;
        if record.retired {
            trace!(serial = %self.serial, "{} on retired record rejected", event);
            return (
                previous,
                EventResponse {
                    state: previous,
                    success: false,
                },
            );
        }
        let response = previous.handle_event(event);

        if response.success {
            record.state = response.state;
            record.changed_at = Utc::now();
            debug!(serial = %self.serial, "{} + {} -> {}", previous, event, response.state);
        } else {
            trace!(serial = %self.serial, "{} + {} rejected", previous, event);
        }

        if record.state.is_available() {
            queue.add(self.clone());
        } else {
            queue.remove(&self.serial);
        }
        (previous, response)
    }

    /// Snapshot for listings
    pub fn descriptor(&self) -> DeviceDescriptor {
        let record = *self.allocation.lock();
        let info = self.info.read();
        DeviceDescriptor {
            serial: self.serial.clone(),
            kind: info.kind,
            placeholder: info.placeholder,
            connectivity: self.monitor.state(),
            allocation: record.state,
            product: info.property(PROP_PRODUCT_TYPE).map(str::to_string),
            variant: info.property(PROP_PRODUCT_VARIANT).map(str::to_string),
            sdk_level: info.sdk_level(),
            build_id: info.property(PROP_BUILD_ID).map(str::to_string),
            battery_level: info.battery_level,
            last_changed: record.changed_at,
        }
    }
}

impl Keyed for Arc<ManagedDevice> {
    fn key(&self) -> &str {
        &self.serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testfleet_devices::testing::{fast_monitor_config, FakeTransport};

    fn device(serial: &str) -> Arc<ManagedDevice> {
        let transport = Arc::new(FakeTransport::new());
        let monitor = Arc::new(DeviceStateMonitor::new(
            serial,
            transport,
            fast_monitor_config(),
            ConnectivityState::Online,
        ));
        Arc::new(ManagedDevice::new(
            DeviceInfo::new(serial, DeviceKind::Physical)
                .with_property(PROP_PRODUCT_TYPE, "walleye"),
            monitor,
        ))
    }

    #[test]
    fn test_apply_event_syncs_queue() {
        let queue = AllocationQueue::new();
        let device = device("A");

        device.apply_event(AllocationEvent::ConnectedOnline, &queue);
        assert!(queue.is_empty());

        let (previous, response) =
            device.apply_event(AllocationEvent::AvailableCheckPassed, &queue);
        assert_eq!(previous, AllocationState::CheckingAvailability);
        assert!(response.success);
        assert!(queue.contains("A"));

        device.apply_event(AllocationEvent::AllocateRequest, &queue);
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
        assert!(queue.is_empty());

        let (_, response) = device.apply_event(AllocationEvent::Disconnected, &queue);
        assert!(!response.success);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rejected_event_keeps_timestamp() {
        let queue = AllocationQueue::new();
        let device = device("A");
        let before = device.last_changed();
        device.apply_event(AllocationEvent::FreeAvailable, &queue);
        assert_eq!(device.last_changed(), before);
    }

    #[test]
    fn test_retired_record_rejects_events() {
        let queue = AllocationQueue::new();
        let device = device("A");
        device.apply_event(AllocationEvent::ForceAvailable, &queue);
        assert!(queue.contains("A"));

        assert!(device.retire(&queue));
        assert!(device.is_retired());
        assert!(queue.is_empty());

        let (_, response) = device.apply_event(AllocationEvent::AllocateRequest, &queue);
        assert!(!response.success);
        assert_eq!(device.allocation_state(), AllocationState::Available);
        let (_, response) = device.apply_event(AllocationEvent::ForceAvailable, &queue);
        assert!(!response.success);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_allocated_record_cannot_retire() {
        let queue = AllocationQueue::new();
        let device = device("A");
        device.apply_event(AllocationEvent::ForceAllocateRequest, &queue);
        assert!(!device.retire(&queue));
        assert!(!device.is_retired());
    }

    #[test]
    fn test_descriptor() {
        let queue = AllocationQueue::new();
        let device = device("A");
        device.apply_event(AllocationEvent::ForceAvailable, &queue);

        let descriptor = device.descriptor();
        assert_eq!(descriptor.serial, "A");
        assert_eq!(descriptor.allocation, AllocationState::Available);
        assert_eq!(descriptor.connectivity, ConnectivityState::Online);
        assert_eq!(descriptor.product.as_deref(), Some("walleye"));
        assert_eq!(descriptor.sdk_level, None);
    }
}
