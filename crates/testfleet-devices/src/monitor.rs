/*!
 * Device state monitor.
 *
 * One monitor per device. It holds the connectivity state reported by the
 * transport and offers bounded waits on it and on a handful of shell probes.
 * Every wait polls at `monitor.poll_interval_ms`, checks at least once, and
 * answers `false` on timeout instead of failing. Transport faults raised by a
 * single probe count as "not ready yet". Dropping the returned future cancels
 * the wait.
 */
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use testfleet_core::config::MonitorConfig;
use testfleet_core::utils::{poll_until, poll_until_true, remaining};

use crate::device::ConnectivityState;
use crate::transport::Transport;

const PACKAGE_MANAGER_PROBE: &str = "pm path android";
const PACKAGE_MANAGER_PREFIX: &str = "package:";
const STORAGE_MOUNT_PROBE: &str = "echo $EXTERNAL_STORAGE";
const STORAGE_PROBE_FILE: &str = "testfleet-mount-probe";
const PERMISSION_DENIED: &str = "Permission denied";

/// Tracks connectivity of one device and waits on it
#[derive(Debug)]
pub struct DeviceStateMonitor {
    serial: String,
    transport: Arc<dyn Transport>,
    config: MonitorConfig,
    state: RwLock<ConnectivityState>,
}

impl DeviceStateMonitor {
    /// Create a monitor for `serial` in the given initial state
    pub fn new<S: Into<String>>(
        serial: S,
        transport: Arc<dyn Transport>,
        config: MonitorConfig,
        initial: ConnectivityState,
    ) -> Self {
        Self {
            serial: serial.into(),
            transport,
            config,
            state: RwLock::new(initial),
        }
    }

    /// The monitored device serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The transport used for probes
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The monitor configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    /// Record a new connectivity state
    pub fn set_state(&self, state: ConnectivityState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(serial = %self.serial, "Connectivity {} -> {}", previous, state);
        }
    }

    async fn wait_for_state(&self, wanted: ConnectivityState, timeout: Duration) -> bool {
        trace!(serial = %self.serial, "Waiting {:?} for {}", timeout, wanted);
        poll_until_true(self.config.poll_interval(), timeout, || async {
            self.state() == wanted
        })
        .await
    }

    /// Wait for the device to be online
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        self.wait_for_state(ConnectivityState::Online, timeout).await
    }

    /// Wait for the device to be in the bootloader
    pub async fn wait_for_bootloader(&self, timeout: Duration) -> bool {
        self.wait_for_state(ConnectivityState::Fastboot, timeout).await
    }

    /// Wait for the device to be in recovery
    pub async fn wait_for_recovery(&self, timeout: Duration) -> bool {
        self.wait_for_state(ConnectivityState::Recovery, timeout).await
    }

    /// Wait for the device to leave the online state
    pub async fn wait_for_not_available(&self, timeout: Duration) -> bool {
        poll_until_true(self.config.poll_interval(), timeout, || async {
            self.state() != ConnectivityState::Online
        })
        .await
    }

    /// Run a probe command, folding transport faults into `None`
    async fn probe(&self, command: &str) -> Option<String> {
        match self
            .transport
            .shell(&self.serial, command, self.config.shell_probe_timeout())
            .await
        {
            Ok(output) => Some(output),
            Err(e) => {
                trace!(serial = %self.serial, "Probe '{}' failed: {}", command, e);
                None
            }
        }
    }

    /// Wait until the shell echoes the probe token back
    pub async fn wait_for_shell_responsive(&self, timeout: Duration) -> bool {
        let token = self.config.shell_probe_token.as_str();
        let command = format!("echo {}", token);
        poll_until_true(self.config.poll_interval(), timeout, || async {
            matches!(self.probe(&command).await, Some(output) if output.trim() == token)
        })
        .await
    }

    /// Wait until the boot-completed property reads "1"
    pub async fn wait_for_boot_complete(&self, timeout: Duration) -> bool {
        let property = self.config.boot_complete_property.as_str();
        poll_until_true(self.config.poll_interval(), timeout, || async {
            match self.transport.property(&self.serial, property).await {
                Ok(Some(value)) => value.trim() == "1",
                Ok(None) => false,
                Err(e) => {
                    trace!(serial = %self.serial, "Reading {} failed: {}", property, e);
                    false
                }
            }
        })
        .await
    }

    /// Wait until the package manager answers queries
    pub async fn wait_for_package_manager_responsive(&self, timeout: Duration) -> bool {
        poll_until_true(self.config.poll_interval(), timeout, || async {
            matches!(
                self.probe(PACKAGE_MANAGER_PROBE).await,
                Some(output) if output.trim_start().starts_with(PACKAGE_MANAGER_PREFIX)
            )
        })
        .await
    }

    /// Wait until external storage is mounted and writable
    ///
    /// First resolves the mount point, then writes and reads back a probe
    /// file. A permission-denied answer ends the wait immediately.
    pub async fn wait_for_storage_mounted(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = self.config.poll_interval();

        let mount_point = poll_until(interval, timeout, || async {
            self.probe(STORAGE_MOUNT_PROBE)
                .await
                .map(|output| output.trim().to_string())
                .filter(|mount| !mount.is_empty())
        })
        .await;
        let Some(mount_point) = mount_point else {
            debug!(serial = %self.serial, "External storage mount point never resolved");
            return false;
        };

        let token = self.config.shell_probe_token.as_str();
        let file = format!("{}/{}", mount_point, STORAGE_PROBE_FILE);
        let command = format!("echo {token} > {file} && cat {file} && rm {file}");

        let outcome = poll_until(interval, remaining(deadline), || async {
            match self.probe(&command).await {
                Some(output) if output.contains(PERMISSION_DENIED) => Some(false),
                Some(output) if output.contains(token) => Some(true),
                _ => None,
            }
        })
        .await;

        match outcome {
            Some(true) => true,
            Some(false) => {
                debug!(serial = %self.serial, "Storage at {} is not writable", mount_point);
                false
            }
            None => false,
        }
    }

    /// Wait until the device is fully usable
    ///
    /// Requires online, boot complete, package manager and storage in that
    /// order, each against what is left of `timeout`.
    pub async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        if !self.wait_for_online(remaining(deadline)).await {
            debug!(serial = %self.serial, "Device not online");
            return false;
        }
        if !self.wait_for_boot_complete(remaining(deadline)).await {
            debug!(serial = %self.serial, "Device boot not complete");
            return false;
        }
        if !self.wait_for_package_manager_responsive(remaining(deadline)).await {
            debug!(serial = %self.serial, "Package manager not responsive");
            return false;
        }
        if !self.wait_for_storage_mounted(remaining(deadline)).await {
            debug!(serial = %self.serial, "External storage not mounted");
            return false;
        }
        true
    }
}
