/*!
 * Fleet registry.
 *
 * Owns every [`ManagedDevice`] by serial together with the allocation queue.
 * All allocation-state changes go through [`FleetRegistry::handle_event`],
 * which keeps the queue holding exactly the devices in the `Available` state.
 *
 * Lock order: device map, then a device's allocation lock, then the queue.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use testfleet_core::config::MonitorConfig;
use testfleet_core::utils::remaining;
use testfleet_devices::{ConnectivityState, DeviceInfo, DeviceStateMonitor, Transport};

use crate::error::{Error, Result};
use crate::managed::ManagedDevice;
use crate::queue::AllocationQueue;
use crate::state_machine::{AllocationEvent, AllocationState, EventResponse};

/// Event types for the fleet registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device record was created
    DeviceAdded(String),
    /// A device record was removed
    DeviceRemoved(String),
    /// A device changed allocation state
    AllocationChanged {
        /// The device serial
        serial: String,
        /// The event that caused the change
        event: AllocationEvent,
        /// The old state
        old_state: AllocationState,
        /// The new state
        new_state: AllocationState,
    },
}

/// Registry of every device known to the fleet
#[derive(Debug)]
pub struct FleetRegistry {
    devices: RwLock<HashMap<String, Arc<ManagedDevice>>>,
    queue: AllocationQueue<Arc<ManagedDevice>>,
    transport: Arc<dyn Transport>,
    monitor_config: MonitorConfig,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl FleetRegistry {
    /// Create an empty registry
    pub fn new(transport: Arc<dyn Transport>, monitor_config: MonitorConfig) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            queue: AllocationQueue::new(),
            transport,
            monitor_config,
            event_sender,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// The transport shared by every device
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Look up a device
    pub fn find(&self, serial: &str) -> Option<Arc<ManagedDevice>> {
        self.devices.read().get(serial).cloned()
    }

    /// Look up a device, creating a record if it is unknown
    ///
    /// An existing record picks up the new attributes unless they only
    /// describe a placeholder. Returns the record and whether it was created.
    pub fn find_or_create(
        &self,
        info: DeviceInfo,
        connectivity: ConnectivityState,
    ) -> (Arc<ManagedDevice>, bool) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.get(&info.serial) {
            if !info.placeholder {
                device.update_info(info);
            }
            return (device.clone(), false);
        }

        let serial = info.serial.clone();
        let monitor = Arc::new(DeviceStateMonitor::new(
            serial.clone(),
            self.transport.clone(),
            self.monitor_config.clone(),
            connectivity,
        ));
        let device = Arc::new(ManagedDevice::new(info, monitor));
        devices.insert(serial.clone(), device.clone());
        drop(devices);

        debug!("Registered device {}", serial);
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded(serial));
        (device, true)
    }

    /// Apply an allocation event to a device
    pub fn handle_event(
        &self,
        device: &Arc<ManagedDevice>,
        event: AllocationEvent,
    ) -> EventResponse {
        let (old_state, response) = device.apply_event(event, &self.queue);
        if response.success {
            let _ = self.event_sender.send(RegistryEvent::AllocationChanged {
                serial: device.serial().to_string(),
                event,
                old_state,
                new_state: response.state,
            });
        }
        response
    }

    /// Allocate the first available device accepted by `predicate`
    ///
    /// Waits up to `timeout` for one to become available.
    pub async fn allocate<F>(&self, predicate: F, timeout: Duration) -> Option<Arc<ManagedDevice>>
    where
        F: Fn(&DeviceInfo) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let candidate = self
                .queue
                .poll(|device| device.with_info(&predicate), remaining(deadline))
                .await?;

            if self.handle_event(&candidate, AllocationEvent::AllocateRequest).success {
                info!("Allocated device {}", candidate.serial());
                return Some(candidate);
            }
            // lost to a concurrent transition, keep looking
            debug!("Device {} changed state before allocation", candidate.serial());
        }
    }

    /// Remove a device record unless it is allocated
    ///
    /// The removed record is retired: an allocation that already polled it
    /// from the queue fails instead of handing out an untracked device.
    pub fn remove(&self, serial: &str) -> Result<Arc<ManagedDevice>> {
        let mut devices = self.devices.write();
        let device = devices
            .get(serial)
            .cloned()
            .ok_or_else(|| Error::not_found(serial))?;
        if !device.retire(&self.queue) {
            return Err(Error::allocated(serial));
        }
        devices.remove(serial);
        drop(devices);

        debug!("Removed device {}", serial);
        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(serial.to_string()));
        Ok(device)
    }

    /// Every device, ordered by serial
    pub fn list(&self) -> Vec<Arc<ManagedDevice>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.serial().cmp(b.serial()));
        devices
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no device is known
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Number of queued devices
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Serials currently in the allocation queue, in queue order
    pub fn queued_serials(&self) -> Vec<String> {
        self.queue
            .snapshot()
            .iter()
            .map(|device| device.serial().to_string())
            .collect()
    }

    /// Whether queue membership matches allocation state for every device
    pub fn is_consistent(&self) -> bool {
        let devices = self.devices.read();
        let available = devices
            .values()
            .filter(|device| device.allocation_state().is_available())
            .count();
        available == self.queue.len()
            && devices
                .values()
                .all(|device| {
                    device.allocation_state().is_available()
                        == self.queue.contains(device.serial())
                })
    }
}
