/*!
 * Fleet manager.
 *
 * The [`DeviceManager`] ties the fleet together. The transport reports
 * connects, disconnects and state changes through the `notify_*` methods;
 * job callers allocate, force-allocate and free devices; recovery, device
 * actions, watch actions and flashing permits are reached through it as
 * well. It never sets an allocation state itself, every change is an event
 * applied through the registry.
 */
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use testfleet_core::config::SharedConfig;
use testfleet_core::error::Error as CoreError;
use testfleet_core::logging::{device_span, operation_span};
use testfleet_core::utils::spawn_and_log;
use testfleet_devices::device::{
    EMULATOR_SERIAL_PREFIX, NULL_DEVICE_SERIAL_PREFIX, TCP_DEVICE_SERIAL_PREFIX,
};
use testfleet_devices::recovery::{perform_device_action, recover_with_mode};
use testfleet_devices::{
    AbortRecovery, BackgroundDeviceAction, ConnectivityState, DeviceError, DeviceHandle, DeviceInfo,
    DeviceKind, DeviceRecovery, DeviceSelection, OutputSink, RecoveryMode, Transport,
    TransportResult, WaitDeviceRecovery,
};

use crate::error::{Error, Result};
use crate::flashing::{FlashingGate, HostOptions};
use crate::managed::{DeviceDescriptor, ManagedDevice};
use crate::registry::{FleetRegistry, RegistryEvent};
use crate::state_machine::{AllocationEvent, AllocationState};

const FIRST_EMULATOR_PORT: usize = 5554;

/// State a caller reports when handing a device back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreeDeviceState {
    /// The device is fine and can be allocated again
    Available,
    /// The device could not be reached
    Unavailable,
    /// The device was reachable but misbehaved
    Unresponsive,
    /// Forget the device's allocation history
    Ignore,
}

impl FreeDeviceState {
    /// The allocation event freeing with this state applies
    pub const fn event(self) -> AllocationEvent {
        match self {
            FreeDeviceState::Available => AllocationEvent::FreeAvailable,
            FreeDeviceState::Unavailable
            | FreeDeviceState::Unresponsive
            | FreeDeviceState::Ignore => AllocationEvent::FreeUnknown,
        }
    }
}

/// Device allocation and recovery manager
#[derive(Debug)]
pub struct DeviceManager {
    config: SharedConfig,
    registry: Arc<FleetRegistry>,
    flashing: FlashingGate,
    recovery: RwLock<Arc<dyn DeviceRecovery>>,
    global_filter: Option<DeviceSelection>,
    initialized: AtomicBool,
    terminated: AtomicBool,
    shutdown: CancellationToken,
    first_device_added: AtomicBool,
    device_added: Notify,
}

impl DeviceManager {
    /// Create a manager talking to devices through `transport`
    pub fn new(config: SharedConfig, transport: Arc<dyn Transport>) -> Self {
        let fleet = config.get();
        let registry = Arc::new(FleetRegistry::new(transport, fleet.monitor.clone()));
        let flashing = FlashingGate::new(fleet.flashing.concurrent_limit, None);
        let recovery: Arc<dyn DeviceRecovery> =
            Arc::new(WaitDeviceRecovery::new(fleet.recovery.clone()));
        Self {
            config,
            registry,
            flashing,
            recovery: RwLock::new(recovery),
            global_filter: None,
            initialized: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            first_device_added: AtomicBool::new(false),
            device_added: Notify::new(),
        }
    }

    /// Only devices matching `filter` can ever be allocated
    pub fn with_global_filter(mut self, filter: DeviceSelection) -> Self {
        self.global_filter = Some(filter);
        self
    }

    /// Consult `options` for the flasher limit when none is configured
    pub fn with_host_options(mut self, options: Arc<dyn HostOptions>) -> Self {
        let limit = self.config.get().flashing.concurrent_limit;
        self.flashing = FlashingGate::new(limit, Some(options));
        self
    }

    /// Use a custom recovery strategy
    pub fn with_recovery(self, recovery: Arc<dyn DeviceRecovery>) -> Self {
        *self.recovery.write() = recovery;
        self
    }

    /// Register the configured placeholder devices
    ///
    /// Calling it again has no effect.
    pub fn init(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::Terminated);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Device manager already initialized");
            return Ok(());
        }

        let allocation = &self.config.get().allocation;
        for i in 0..allocation.num_null_devices {
            self.add_placeholder(format!("{}-{}", NULL_DEVICE_SERIAL_PREFIX, i));
        }
        for i in 0..allocation.num_emulators {
            let port = FIRST_EMULATOR_PORT + 2 * i;
            self.add_placeholder(format!("{}-{}", EMULATOR_SERIAL_PREFIX, port));
        }
        for i in 0..allocation.num_tcp_devices {
            self.add_placeholder(format!("{}-{}", TCP_DEVICE_SERIAL_PREFIX, i));
        }

        info!(
            "Device manager initialized with {} placeholder devices",
            self.registry.len()
        );
        Ok(())
    }

    fn add_placeholder(&self, serial: String) {
        let (device, _) = self
            .registry
            .find_or_create(DeviceInfo::placeholder(serial), ConnectivityState::NotAvailable);
        self.registry.handle_event(&device, AllocationEvent::ForceAvailable);
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::Terminated);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// The device registry
    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Look up a device
    pub fn find_device(&self, serial: &str) -> Option<Arc<ManagedDevice>> {
        self.registry.find(serial)
    }

    /// A device connected
    pub async fn notify_connected(&self, handle: DeviceHandle) {
        let connectivity = handle.connectivity();
        let offline = handle.is_offline_report();
        let serial = handle.info.serial.clone();
        let (device, created) = self.registry.find_or_create(handle.info, connectivity);
        device.monitor().set_state(connectivity);
        if created {
            debug!("New device {} connected", serial);
        }

        if connectivity == ConnectivityState::Online {
            let response = self.registry.handle_event(&device, AllocationEvent::ConnectedOnline);
            if response.success && response.state == AllocationState::CheckingAvailability {
                self.check_and_add_available_device(device).await;
            }
        } else if offline {
            self.registry.handle_event(&device, AllocationEvent::ConnectedOffline);
        }

        if !self.first_device_added.swap(true, Ordering::SeqCst) {
            info!("First device {} added", serial);
        }
        self.device_added.notify_waiters();
    }

    /// A device disconnected
    ///
    /// The record stays registered so a reconnect attaches to it.
    pub fn notify_disconnected(&self, handle: &DeviceHandle) {
        let Some(device) = self.registry.find(handle.serial()) else {
            debug!("Disconnect of unknown device {}", handle.serial());
            return;
        };
        device.monitor().set_state(ConnectivityState::NotAvailable);
        let response = self.registry.handle_event(&device, AllocationEvent::Disconnected);
        if !response.success && response.state == AllocationState::Allocated {
            info!("Allocated device {} disconnected, keeping allocation", handle.serial());
        }
    }

    /// A connected device reported a new raw state
    pub async fn notify_state_changed(&self, serial: &str, raw_state: &str) {
        let Some(device) = self.registry.find(serial) else {
            debug!("State change of unknown device {}", serial);
            return;
        };
        let connectivity = ConnectivityState::from_raw(raw_state);
        device.monitor().set_state(connectivity);

        if connectivity == ConnectivityState::Online {
            let response = self.registry.handle_event(&device, AllocationEvent::StateChangeOnline);
            if response.success && response.state == AllocationState::CheckingAvailability {
                self.check_and_add_available_device(device).await;
            }
        } else if matches!(
            raw_state.trim().to_ascii_lowercase().as_str(),
            "offline" | "unauthorized"
        ) {
            self.registry.handle_event(&device, AllocationEvent::StateChangeOffline);
        }
    }

    /// Decide whether a freshly connected device joins the available set
    async fn check_and_add_available_device(&self, device: Arc<ManagedDevice>) {
        if let Some(filter) = &self.global_filter {
            if !device.with_info(|info| filter.matches(info)) {
                debug!("Device {} excluded by the global filter", device.serial());
                self.registry.handle_event(&device, AllocationEvent::AvailableCheckIgnored);
                return;
            }
        }

        let allocation = &self.config.get().allocation;
        let timeout = allocation.check_available();
        let registry = self.registry.clone();
        let serial = device.serial().to_string();
        let span = device_span(&serial);
        let check = run_availability_check(registry, device, timeout).instrument(span);

        if allocation.synchronous_mode {
            check.await;
        } else {
            let shutdown = self.shutdown.clone();
            let name = format!("availability-check-{}", serial);
            spawn_and_log(&name, async move {
                tokio::select! {
                    _ = shutdown.cancelled() => Err(CoreError::cancelled(format!(
                        "availability check of {} stopped by shutdown",
                        serial
                    ))),
                    _ = check => Ok(()),
                }
            });
        }
    }

    /// Allocate any regular device
    pub async fn allocate_device(&self) -> Result<Option<Arc<ManagedDevice>>> {
        self.allocate_device_matching(&DeviceSelection::new()).await
    }

    /// Allocate a device matching `selection`
    ///
    /// Waits up to `allocation.allocate_wait_ms`.
    pub async fn allocate_device_matching(
        &self,
        selection: &DeviceSelection,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        let timeout = self.config.get().allocation.allocate_wait();
        self.allocate_device_within(selection, timeout).await
    }

    /// Allocate a device matching `selection`, waiting up to `timeout`
    pub async fn allocate_device_within(
        &self,
        selection: &DeviceSelection,
        timeout: Duration,
    ) -> Result<Option<Arc<ManagedDevice>>> {
        self.ensure_ready()?;

        // a single requested serial gets a record, so a later connect attaches to it
        if selection.serials.len() == 1 {
            if let Some(serial) = selection.serials.iter().next() {
                if self.registry.find(serial).is_none() {
                    self.registry.find_or_create(
                        DeviceInfo::placeholder(serial.clone()),
                        ConnectivityState::NotAvailable,
                    );
                }
            }
        }

        let device = self
            .registry
            .allocate(|info| selection.matches(info), timeout)
            .instrument(operation_span("allocate", None))
            .await;
        if device.is_none() {
            debug!("No device matched the allocation request");
        }
        Ok(device)
    }

    /// Allocate a device by serial whatever its state
    ///
    /// Unknown serials get a placeholder record. Fails (returns `None`) only
    /// when the device is already allocated.
    pub fn force_allocate_device(&self, serial: &str) -> Result<Option<Arc<ManagedDevice>>> {
        self.ensure_ready()?;
        let (device, _) = self
            .registry
            .find_or_create(DeviceInfo::placeholder(serial), ConnectivityState::NotAvailable);
        let response = self.registry.handle_event(&device, AllocationEvent::ForceAllocateRequest);
        if response.success {
            info!("Force allocated device {}", serial);
            Ok(Some(device))
        } else {
            warn!("Device {} is already allocated", serial);
            Ok(None)
        }
    }

    /// Hand a device back
    ///
    /// Stops the device's watch actions. Freeing a device that is not
    /// allocated is logged and ignored, its watches keep running.
    pub async fn free_device(
        &self,
        device: &Arc<ManagedDevice>,
        state: FreeDeviceState,
    ) -> Result<()> {
        self.ensure_ready()?;
        let current = device.allocation_state();
        if !current.is_allocated() {
            error!(
                "Device {} was in unexpected state {} when freeing",
                device.serial(),
                current
            );
            return Ok(());
        }

        stop_watches(device).await;
        if device.with_info(|info| info.kind == DeviceKind::TcpDevice) {
            device.monitor().set_state(ConnectivityState::NotAvailable);
        }

        let response = self.registry.handle_event(device, state.event());
        if response.success {
            info!("Freed device {} as {:?}", device.serial(), state);
        } else {
            error!(
                "Device {} left the allocated state while freeing, now {}",
                device.serial(),
                response.state
            );
        }
        Ok(())
    }

    /// Descriptors of every known device, ordered by serial
    pub fn list_all_devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.list().iter().map(|device| device.descriptor()).collect()
    }

    /// Remove a device record after permanent loss
    pub async fn forget_device(&self, serial: &str) -> Result<()> {
        let device = self.registry.remove(serial)?;
        stop_watches(&device).await;
        info!("Forgot device {}", serial);
        Ok(())
    }

    /// Wait until the first device connected
    pub async fn wait_for_first_device_added(&self, timeout: Duration) -> bool {
        let added = self.device_added.notified();
        tokio::pin!(added);
        added.as_mut().enable();
        if self.first_device_added.load(Ordering::SeqCst) {
            return true;
        }
        let _ = tokio::time::timeout(timeout, added).await;
        self.first_device_added.load(Ordering::SeqCst)
    }

    /// Take a flashing permit, waiting if none is free
    pub async fn take_flashing_permit(&self) {
        self.flashing.take().await;
    }

    /// Return a flashing permit
    pub fn return_flashing_permit(&self) {
        self.flashing.return_permit();
    }

    /// Change the flashing limit, `None` for unbounded
    pub fn set_flashing_limit(&self, limit: Option<usize>) {
        self.flashing.set_limit(limit);
    }

    /// Free flashing permits, `None` when unbounded
    pub fn available_flashing_permits(&self) -> Option<usize> {
        self.flashing.available_permits()
    }

    /// Callers waiting for a flashing permit
    pub fn queued_flashers(&self) -> usize {
        self.flashing.queued()
    }

    fn current_recovery(&self) -> Arc<dyn DeviceRecovery> {
        self.recovery.read().clone()
    }

    /// Take a device out of the available set after failed recovery
    fn mark_unavailable(&self, device: &Arc<ManagedDevice>, err: &DeviceError) {
        warn!("Recovery of {} failed: {}", device.serial(), err);
        match device.allocation_state() {
            AllocationState::Available => {
                self.registry.handle_event(device, AllocationEvent::StateChangeOffline);
            }
            AllocationState::CheckingAvailability => {
                self.registry.handle_event(device, AllocationEvent::AvailableCheckFailed);
            }
            _ => {}
        }
    }

    /// Recover a device as far as its recovery mode asks
    pub async fn recover_device(&self, device: &Arc<ManagedDevice>) -> Result<()> {
        let recovery = self.current_recovery();
        let result = recover_with_mode(recovery.as_ref(), device.monitor(), device.recovery_mode())
            .instrument(operation_span("recover", Some(device.serial())))
            .await;
        result.map_err(|e| {
            self.mark_unavailable(device, &e);
            Error::from(e)
        })
    }

    /// Recover a device that should be in the bootloader
    pub async fn recover_device_bootloader(&self, device: &Arc<ManagedDevice>) -> Result<()> {
        let recovery = self.current_recovery();
        let result = recovery
            .recover_device_bootloader(device.monitor())
            .instrument(operation_span("recover-bootloader", Some(device.serial())))
            .await;
        result.map_err(|e| {
            self.mark_unavailable(device, &e);
            Error::from(e)
        })
    }

    /// Recover a device that should be in recovery
    pub async fn recover_device_recovery(&self, device: &Arc<ManagedDevice>) -> Result<()> {
        let recovery = self.current_recovery();
        let result = recovery
            .recover_device_recovery(device.monitor())
            .instrument(operation_span("recover-recovery", Some(device.serial())))
            .await;
        result.map_err(|e| {
            self.mark_unavailable(device, &e);
            Error::from(e)
        })
    }

    /// Set how far recovery goes for a device
    pub fn set_recovery_mode(&self, device: &ManagedDevice, mode: RecoveryMode) {
        device.set_recovery_mode(mode);
    }

    /// Run a transport action against a device, recovering between attempts
    pub async fn perform_device_action<T, F, Fut>(
        &self,
        device: &Arc<ManagedDevice>,
        description: &str,
        retries: u32,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let recovery = self.current_recovery();
        perform_device_action(
            recovery.as_ref(),
            device.monitor(),
            device.recovery_mode(),
            description,
            retries,
            action,
        )
        .await
        .map_err(|e| {
            self.mark_unavailable(device, &e);
            Error::from(e)
        })
    }

    /// Start a watch action streaming `command` output into `sink`
    pub fn start_watch(
        &self,
        device: &Arc<ManagedDevice>,
        command: &str,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Uuid> {
        self.ensure_ready()?;
        let restart_delay = self.config.get().watch.restart_delay();
        let monitor = device.monitor().clone();
        let handle = BackgroundDeviceAction::new(command, monitor, sink, restart_delay)
            .with_cancellation(self.shutdown.child_token())
            .spawn();
        let id = handle.id();
        device.add_watch(handle);
        Ok(id)
    }

    /// Stop every watch action bound to a device
    pub async fn stop_watches(&self, device: &ManagedDevice) {
        stop_watches(device).await;
    }

    /// Whether queue membership matches allocation state for every device
    pub fn is_consistent(&self) -> bool {
        self.registry.is_consistent()
    }

    /// Shut the manager down
    ///
    /// Later recovery calls fail with "aborted test session" and every watch
    /// action and pending availability check is cancelled.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Terminating device manager");
        *self.recovery.write() = Arc::new(AbortRecovery);
        self.shutdown.cancel();

        let devices = self.registry.list();
        join_all(devices.iter().map(|device| stop_watches(device))).await;
    }

    /// Whether `terminate` was called
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

async fn run_availability_check(
    registry: Arc<FleetRegistry>,
    device: Arc<ManagedDevice>,
    timeout: Duration,
) {
    let event = if device.monitor().wait_for_shell_responsive(timeout).await {
        AllocationEvent::AvailableCheckPassed
    } else {
        warn!("Device {} failed the availability check", device.serial());
        AllocationEvent::AvailableCheckFailed
    };
    registry.handle_event(&device, event);
}

async fn stop_watches(device: &ManagedDevice) {
    let watches = device.take_watches();
    if !watches.is_empty() {
        debug!("Stopping {} watch actions on {}", watches.len(), device.serial());
        join_all(watches.into_iter().map(|watch| watch.stop())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testfleet_core::config::FleetConfig;
    use testfleet_devices::testing::{fast_monitor_config, fast_recovery_config, FakeTransport};
    use testfleet_devices::{BufferSink, TransportError};

    fn config(synchronous: bool) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.monitor = fast_monitor_config();
        config.recovery = fast_recovery_config();
        config.allocation.check_available_ms = 50;
        config.allocation.synchronous_mode = synchronous;
        config.allocation.num_null_devices = 2;
        config.allocation.num_emulators = 1;
        config.allocation.num_tcp_devices = 1;
        config.watch.restart_delay_ms = 5;
        config
    }

    fn manager_with(config: FleetConfig) -> (Arc<FakeTransport>, DeviceManager) {
        let transport = Arc::new(FakeTransport::new());
        let manager = DeviceManager::new(SharedConfig::new(config), transport.clone());
        manager.init().unwrap();
        (transport, manager)
    }

    fn phone(serial: &str, state: &str) -> DeviceHandle {
        DeviceHandle::new(DeviceInfo::new(serial, DeviceKind::Physical), state)
    }

    #[tokio::test]
    async fn test_requires_init() {
        let transport = Arc::new(FakeTransport::new());
        let manager = DeviceManager::new(SharedConfig::new(config(true)), transport);
        assert!(matches!(manager.allocate_device().await, Err(Error::NotInitialized)));
        assert!(matches!(manager.force_allocate_device("X"), Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_placeholders() {
        let (_, manager) = manager_with(config(true));
        let serials: Vec<_> = manager
            .list_all_devices()
            .into_iter()
            .map(|descriptor| (descriptor.serial, descriptor.kind, descriptor.allocation))
            .collect();
        assert_eq!(
            serials,
            vec![
                ("emulator-5554".to_string(), DeviceKind::Emulator, AllocationState::Available),
                ("null-device-0".to_string(), DeviceKind::NullDevice, AllocationState::Available),
                ("null-device-1".to_string(), DeviceKind::NullDevice, AllocationState::Available),
                ("tcp-device-0".to_string(), DeviceKind::TcpDevice, AllocationState::Available),
            ]
        );

        // regular requests never get a placeholder
        assert!(manager.allocate_device().await.unwrap().is_none());
        let null_device = manager
            .allocate_device_matching(&DeviceSelection::new().null_device())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(null_device.serial(), "null-device-0");
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_connect_allocate_free() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;

        let device = manager.allocate_device().await.unwrap().unwrap();
        assert_eq!(device.serial(), "A");
        assert_eq!(device.allocation_state(), AllocationState::Allocated);

        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Available);
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_failed_availability_check() {
        let (transport, manager) = manager_with(config(true));
        transport.on_shell(|_, _| Err(TransportError::Timeout("shell".into())));
        manager.notify_connected(phone("A", "device")).await;

        let device = manager.find_device("A").unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Unavailable);
        assert!(manager.allocate_device().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_async_availability_check() {
        let (_, manager) = manager_with(config(false));
        manager.notify_connected(phone("A", "device")).await;

        let selection = DeviceSelection::new().with_serial("A");
        let device = manager
            .allocate_device_within(&selection, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.serial(), "A");
    }

    #[tokio::test]
    async fn test_global_filter_ignores_device() {
        let transport = Arc::new(FakeTransport::new());
        let manager = DeviceManager::new(SharedConfig::new(config(true)), transport)
            .with_global_filter(DeviceSelection::new().excluding("B"));
        manager.init().unwrap();

        manager.notify_connected(phone("B", "device")).await;
        let device = manager.find_device("B").unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Ignored);

        // reconnecting does not re-queue an ignored device
        manager.notify_state_changed("B", "device").await;
        assert_eq!(device.allocation_state(), AllocationState::Ignored);
    }

    #[tokio::test]
    async fn test_offline_connect_and_state_changes() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "offline")).await;
        let device = manager.find_device("A").unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Unavailable);
        assert_eq!(device.connectivity(), ConnectivityState::NotAvailable);

        manager.notify_disconnected(&phone("A", "offline"));
        assert_eq!(device.allocation_state(), AllocationState::Unknown);

        manager.notify_state_changed("A", "device").await;
        assert_eq!(device.allocation_state(), AllocationState::Available);

        manager.notify_state_changed("A", "offline").await;
        assert_eq!(device.allocation_state(), AllocationState::Unavailable);
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_allocated_device_survives_disconnect() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();

        manager.notify_disconnected(&phone("A", "device"));
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
        assert_eq!(device.connectivity(), ConnectivityState::NotAvailable);
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_force_allocate_unknown_serial() {
        let (_, manager) = manager_with(config(true));
        let device = manager.force_allocate_device("ZZZ").unwrap().unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Allocated);
        assert!(device.info().placeholder);
        assert!(manager.force_allocate_device("ZZZ").unwrap().is_none());

        // the real device attaches to the same record
        manager.notify_connected(phone("ZZZ", "device")).await;
        let found = manager.find_device("ZZZ").unwrap();
        assert!(Arc::ptr_eq(&device, &found));
        assert!(!found.info().placeholder);
        assert_eq!(found.allocation_state(), AllocationState::Allocated);
    }

    #[tokio::test]
    async fn test_free_states() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();

        manager.free_device(&device, FreeDeviceState::Unresponsive).await.unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Unknown);

        // freeing again is ignored
        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Unknown);
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_forget_device() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();
        assert!(matches!(manager.forget_device("A").await, Err(Error::Allocated(_))));

        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        manager.forget_device("A").await.unwrap();
        assert!(manager.find_device("A").is_none());
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_wait_for_first_device() {
        let (_, manager) = manager_with(config(true));
        assert!(!manager.wait_for_first_device_added(Duration::from_millis(10)).await);

        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_first_device_added(Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.notify_connected(phone("A", "device")).await;
        assert!(waiter.await.unwrap());
        assert!(manager.wait_for_first_device_added(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_recovery_failure_marks_unavailable() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.find_device("A").unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Available);

        device.monitor().set_state(ConnectivityState::NotAvailable);
        let err = manager.recover_device(&device).await.unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::DeviceUnavailable { .. })));
        assert_eq!(device.allocation_state(), AllocationState::Unavailable);
        assert!(!manager.registry().queued_serials().contains(&"A".to_string()));
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_perform_device_action_with_recovery() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();
        manager.set_recovery_mode(&device, RecoveryMode::Online);

        let mut failures = 1;
        let value = manager
            .perform_device_action(&device, "getprop", 2, || {
                let fail = failures > 0;
                failures -= 1;
                async move {
                    if fail {
                        Err(TransportError::Io("reset".into()))
                    } else {
                        Ok("walleye")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, Some("walleye"));
    }

    #[tokio::test]
    async fn test_terminate_aborts_recovery_and_watches() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();
        manager
            .start_watch(&device, "logcat", Arc::new(BufferSink::new()))
            .unwrap();
        assert_eq!(device.watch_count(), 1);

        manager.terminate().await;
        assert!(manager.is_terminated());
        assert_eq!(device.watch_count(), 0);

        let err = manager.recover_device(&device).await.unwrap_err();
        assert!(err.to_string().contains("aborted test session"));
        assert!(matches!(manager.allocate_device().await, Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn test_free_stops_watches() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.allocate_device().await.unwrap().unwrap();
        manager
            .start_watch(&device, "logcat", Arc::new(BufferSink::new()))
            .unwrap();

        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_free_of_unallocated_device_keeps_watches() {
        let (_, manager) = manager_with(config(true));
        manager.notify_connected(phone("A", "device")).await;
        let device = manager.find_device("A").unwrap();
        manager
            .start_watch(&device, "logcat", Arc::new(BufferSink::new()))
            .unwrap();

        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.allocation_state(), AllocationState::Available);
        assert_eq!(device.watch_count(), 1);

        manager.stop_watches(&device).await;
        assert_eq!(device.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_free_of_unallocated_tcp_device_keeps_connectivity() {
        let (_, manager) = manager_with(config(true));
        let device = manager.find_device("tcp-device-0").unwrap();
        device.monitor().set_state(ConnectivityState::Online);

        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.connectivity(), ConnectivityState::Online);

        let device = manager
            .allocate_device_matching(&DeviceSelection::new().tcp_device())
            .await
            .unwrap()
            .unwrap();
        manager.free_device(&device, FreeDeviceState::Available).await.unwrap();
        assert_eq!(device.connectivity(), ConnectivityState::NotAvailable);
    }

    #[test_log::test(tokio::test)]
    async fn test_state_change_of_unknown_device_is_ignored() {
        let (_, manager) = manager_with(config(true));
        let before = manager.list_all_devices().len();

        manager.notify_state_changed("GHOST", "device").await;
        assert!(manager.find_device("GHOST").is_none());
        assert_eq!(manager.list_all_devices().len(), before);
        assert!(manager.is_consistent());
    }

    #[tokio::test]
    async fn test_flashing_permits() {
        let mut config = config(true);
        config.flashing.concurrent_limit = Some(1);
        let (_, manager) = manager_with(config);

        assert_eq!(manager.available_flashing_permits(), Some(1));
        manager.take_flashing_permit().await;
        assert_eq!(manager.available_flashing_permits(), Some(0));
        manager.return_flashing_permit();

        manager.set_flashing_limit(None);
        assert_eq!(manager.available_flashing_permits(), None);
        assert_eq!(manager.queued_flashers(), 0);
    }
}
