/*!
 * Staged device recovery.
 *
 * Recovery escalates: it first waits for the device to come back by itself,
 * then checks the shell, then the full availability probes. The bootloader
 * path only reboots once waiting has failed. Every stage is bounded by the
 * `recovery` section of the configuration, so the worst-case latency of a
 * call is the sum of those bounds.
 */
use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use testfleet_core::config::RecoveryConfig;

use crate::device::ConnectivityState;
use crate::error::{DeviceError, Result};
use crate::monitor::DeviceStateMonitor;
use crate::transport::{RebootTarget, TransportResult};

/// How much recovery to attempt when a device action fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Do not recover, just pause briefly
    None,
    /// Recover until the device is online and the shell responds
    Online,
    /// Recover until the device is fully available
    #[default]
    Available,
}

/// A strategy for bringing a device back
#[async_trait]
pub trait DeviceRecovery: Send + Sync + Debug {
    /// Recover a device that stopped responding
    ///
    /// With `recover_until_online_only` set, stops once the shell responds.
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        recover_until_online_only: bool,
    ) -> Result<()>;

    /// Recover a device that should be in the bootloader
    async fn recover_device_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<()>;

    /// Recover a device that should be in recovery
    async fn recover_device_recovery(&self, monitor: &DeviceStateMonitor) -> Result<()>;
}

/// Recovery that waits for the device, rebooting only as a last resort
#[derive(Debug, Clone, Default)]
pub struct WaitDeviceRecovery {
    config: RecoveryConfig,
}

impl WaitDeviceRecovery {
    /// Create a recovery with the given bounds
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// The configured bounds
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    async fn pause(&self) {
        debug!("Pausing {:?} before recovery", self.config.initial_pause());
        tokio::time::sleep(self.config.initial_pause()).await;
    }

    async fn ensure_available(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        let serial = monitor.serial();
        if monitor.wait_for_device_available(self.config.available_wait()).await {
            return Ok(());
        }

        if self.config.reboot_unresponsive {
            warn!(serial, "Device unresponsive, rebooting once");
            if let Err(e) = monitor.transport().reboot(serial, RebootTarget::Online).await {
                warn!(serial, "Reboot of unresponsive device failed: {}", e);
            } else if monitor.wait_for_device_available(self.config.available_wait()).await {
                return Ok(());
            }
        }

        Err(DeviceError::unresponsive(
            serial,
            "device online but not available after recovery",
        ))
    }

    async fn check_battery(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        let Some(min_level) = self.config.min_battery_level else {
            return Ok(());
        };
        let serial = monitor.serial();
        match monitor.transport().battery_level(serial).await {
            Ok(Some(level)) if level >= min_level => Ok(()),
            Ok(Some(level)) => Err(DeviceError::unavailable(
                serial,
                format!("battery level {}% is below required {}%", level, min_level),
            )),
            Ok(None) => Err(DeviceError::unavailable(
                serial,
                "battery level could not be read after recovery",
            )),
            Err(e) => Err(DeviceError::unavailable(
                serial,
                format!("battery level could not be read after recovery: {}", e),
            )),
        }
    }

    /// Wait for the bootloader, then retry a bounded number of rounds
    async fn wait_for_bootloader_with_retries(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        let wait = self.config.bootloader_wait();
        if monitor.wait_for_bootloader(wait).await {
            return Ok(());
        }
        for attempt in 1..=self.config.bootloader_retries {
            debug!(serial = monitor.serial(), attempt, "Bootloader not reached, retrying");
            monitor.wait_for_not_available(wait).await;
            if monitor.wait_for_bootloader(wait).await {
                return Ok(());
            }
        }
        Err(DeviceError::unavailable(
            monitor.serial(),
            "could not find device in bootloader",
        ))
    }
}

#[async_trait]
impl DeviceRecovery for WaitDeviceRecovery {
    async fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        recover_until_online_only: bool,
    ) -> Result<()> {
        let serial = monitor.serial();
        self.pause().await;

        match monitor.state() {
            ConnectivityState::Online => {}
            state => {
                if state == ConnectivityState::Fastboot {
                    info!(serial, "Found device in bootloader, rebooting");
                    if let Err(e) = monitor
                        .transport()
                        .bootloader_command(serial, &["reboot"], self.config.bootloader_wait())
                        .await
                    {
                        warn!(serial, "Bootloader reboot failed: {}", e);
                    }
                }
                if !monitor.wait_for_online(self.config.online_wait()).await {
                    return Err(DeviceError::unavailable(serial, "could not find device online"));
                }
            }
        }

        if !monitor.wait_for_shell_responsive(self.config.shell_wait()).await {
            return Err(DeviceError::unavailable(serial, "device not responsive to shell"));
        }

        if recover_until_online_only {
            info!(serial, "Device online and responsive");
            return Ok(());
        }

        self.ensure_available(monitor).await?;
        self.check_battery(monitor).await?;
        info!(serial, "Device recovered");
        Ok(())
    }

    async fn recover_device_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        let serial = monitor.serial();
        self.pause().await;

        match monitor.state() {
            ConnectivityState::Fastboot => {
                let probe = monitor
                    .transport()
                    .bootloader_command(
                        serial,
                        &["getvar", "product"],
                        self.config.bootloader_wait(),
                    )
                    .await;
                match probe {
                    Ok(_) => {
                        debug!(serial, "Bootloader responsive");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(serial, "Bootloader unresponsive ({}), rebooting into bootloader", e);
                        if let Err(e) = monitor
                            .transport()
                            .bootloader_command(
                                serial,
                                &["reboot-bootloader"],
                                self.config.bootloader_wait(),
                            )
                            .await
                        {
                            warn!(serial, "reboot-bootloader failed: {}", e);
                        }
                    }
                }
            }
            ConnectivityState::Online | ConnectivityState::Recovery => {
                info!(serial, "Rebooting device into bootloader");
                if let Err(e) = monitor
                    .transport()
                    .reboot(serial, RebootTarget::Bootloader)
                    .await
                {
                    warn!(serial, "Reboot into bootloader failed: {}", e);
                }
            }
            ConnectivityState::NotAvailable => {
                // the device may be on its way to the bootloader already
                if monitor.wait_for_bootloader(self.config.bootloader_wait()).await {
                    return Ok(());
                }
                info!(serial, "Device not found in bootloader, issuing reboot-bootloader");
                if let Err(e) = monitor
                    .transport()
                    .bootloader_command(
                        serial,
                        &["reboot-bootloader"],
                        self.config.bootloader_wait(),
                    )
                    .await
                {
                    warn!(serial, "reboot-bootloader failed: {}", e);
                }
            }
        }

        self.wait_for_bootloader_with_retries(monitor).await
    }

    async fn recover_device_recovery(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        self.pause().await;
        if monitor.wait_for_recovery(self.config.online_wait()).await {
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                monitor.serial(),
                "could not find device in recovery",
            ))
        }
    }
}

/// Recovery used once a session is aborted: every call fails immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortRecovery;

impl AbortRecovery {
    fn abort(monitor: &DeviceStateMonitor) -> DeviceError {
        DeviceError::unavailable(monitor.serial(), "aborted test session")
    }
}

#[async_trait]
impl DeviceRecovery for AbortRecovery {
    async fn recover_device(&self, monitor: &DeviceStateMonitor, _: bool) -> Result<()> {
        Err(Self::abort(monitor))
    }

    async fn recover_device_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        Err(Self::abort(monitor))
    }

    async fn recover_device_recovery(&self, monitor: &DeviceStateMonitor) -> Result<()> {
        Err(Self::abort(monitor))
    }
}

/// Recover a device as far as `mode` asks
///
/// `RecoveryMode::None` skips recovery and only pauses for one poll interval.
pub async fn recover_with_mode(
    recovery: &dyn DeviceRecovery,
    monitor: &DeviceStateMonitor,
    mode: RecoveryMode,
) -> Result<()> {
    match mode {
        RecoveryMode::None => {
            info!(serial = monitor.serial(), "Skipping recovery");
            tokio::time::sleep(monitor.config().poll_interval()).await;
            Ok(())
        }
        RecoveryMode::Online => recovery.recover_device(monitor, true).await,
        RecoveryMode::Available => recovery.recover_device(monitor, false).await,
    }
}

/// Run a transport action, recovering the device between failed attempts
///
/// The action runs at most `retries + 1` times. Returns `Ok(None)` when every
/// attempt failed and no retries were allowed; with retries, exhausting them
/// is a [`DeviceError::DeviceUnresponsive`]. Recovery failures propagate.
pub async fn perform_device_action<T, F, Fut>(
    recovery: &dyn DeviceRecovery,
    monitor: &DeviceStateMonitor,
    mode: RecoveryMode,
    description: &str,
    retries: u32,
    mut action: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let serial = monitor.serial();
    for _ in 0..=retries {
        match action().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) => {
                warn!(serial, "{} ({}) when attempting {}", e.kind(), e, description);
            }
        }
        recover_with_mode(recovery, monitor, mode).await?;
    }

    if retries > 0 {
        return Err(DeviceError::unresponsive(
            serial,
            format!("attempted {} multiple times without communication success", description),
        ));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::error::TransportError;
    use crate::testing::{fast_monitor_config, fast_recovery_config, Call, FakeTransport};

    fn setup(state: ConnectivityState) -> (Arc<FakeTransport>, Arc<DeviceStateMonitor>) {
        let transport = Arc::new(FakeTransport::new());
        let monitor = Arc::new(DeviceStateMonitor::new(
            "SERIAL1",
            transport.clone(),
            fast_monitor_config(),
            state,
        ));
        transport.attach_monitor(&monitor);
        (transport, monitor)
    }

    fn recovery() -> WaitDeviceRecovery {
        WaitDeviceRecovery::new(fast_recovery_config())
    }

    #[test_log::test(tokio::test)]
    async fn test_recover_online_device() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        recovery().recover_device(&monitor, false).await.unwrap();
        assert!(transport.bootloader_calls().is_empty());
        assert!(transport.reboot_calls().is_empty());
    }

    #[tokio::test]
    async fn test_recover_never_online_is_unavailable() {
        let (transport, monitor) = setup(ConnectivityState::NotAvailable);
        let err = recovery().recover_device(&monitor, false).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
        assert!(transport.shell_calls().is_empty());
    }

    #[tokio::test]
    async fn test_recover_shell_unresponsive_is_unavailable() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.on_shell(|_, _| Err(TransportError::Timeout("shell".into())));
        let err = recovery().recover_device(&monitor, true).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_recover_online_only_skips_availability() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.on_property(|_, _| Ok(Some("0".into())));
        recovery().recover_device(&monitor, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_not_available_is_unresponsive() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.on_property(|_, _| Ok(Some("0".into())));
        let err = recovery().recover_device(&monitor, false).await.unwrap_err();
        assert!(err.is_unresponsive());
        assert!(transport.reboot_calls().is_empty());
    }

    #[tokio::test]
    async fn test_recover_reboots_unresponsive_once() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.on_property(|_, _| Ok(Some("0".into())));
        let mut config = fast_recovery_config();
        config.reboot_unresponsive = true;

        let err = WaitDeviceRecovery::new(config)
            .recover_device(&monitor, false)
            .await
            .unwrap_err();
        assert!(err.is_unresponsive());
        assert_eq!(transport.reboot_calls(), vec![RebootTarget::Online]);
    }

    #[tokio::test]
    async fn test_recover_from_fastboot() {
        let (transport, monitor) = setup(ConnectivityState::Fastboot);
        transport.set_reboot_outcome(RebootTarget::Online, ConnectivityState::Online);

        recovery().recover_device(&monitor, true).await.unwrap();
        assert_eq!(transport.bootloader_calls(), vec![vec!["reboot".to_string()]]);
        assert_eq!(monitor.state(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_recover_device_never_reboots_to_bootloader() {
        let (transport, monitor) = setup(ConnectivityState::NotAvailable);
        let _ = recovery().recover_device(&monitor, false).await;
        assert!(!transport
            .calls()
            .iter()
            .any(|call| match call {
                Call::Reboot(target) => *target == RebootTarget::Bootloader,
                Call::Bootloader(args) => args.iter().any(|a| a == "reboot-bootloader"),
                _ => false,
            }));
    }

    #[tokio::test]
    async fn test_battery_gate() {
        let mut config = fast_recovery_config();
        config.min_battery_level = Some(20);

        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.set_battery_level(Some(50));
        WaitDeviceRecovery::new(config.clone())
            .recover_device(&monitor, false)
            .await
            .unwrap();

        transport.set_battery_level(Some(10));
        let err = WaitDeviceRecovery::new(config.clone())
            .recover_device(&monitor, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("below required"));

        transport.set_battery_level(None);
        let err = WaitDeviceRecovery::new(config)
            .recover_device(&monitor, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_bootloader_already_there() {
        let (transport, monitor) = setup(ConnectivityState::Fastboot);
        recovery().recover_device_bootloader(&monitor).await.unwrap();
        assert_eq!(
            transport.bootloader_calls(),
            vec![vec!["getvar".to_string(), "product".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_bootloader_from_online() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.set_reboot_outcome(RebootTarget::Bootloader, ConnectivityState::Fastboot);
        recovery().recover_device_bootloader(&monitor).await.unwrap();
        assert_eq!(transport.reboot_calls(), vec![RebootTarget::Bootloader]);
    }

    #[tokio::test]
    async fn test_bootloader_reboot_fault_is_unavailable() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        transport.set_reboot_outcome(RebootTarget::Bootloader, ConnectivityState::Fastboot);
        transport.on_reboot(|_, _| Err(TransportError::Io("connection reset".into())));

        let err = recovery().recover_device_bootloader(&monitor).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
        assert_eq!(monitor.state(), ConnectivityState::Online);
        assert_eq!(transport.reboot_calls(), vec![RebootTarget::Bootloader]);
    }

    #[tokio::test]
    async fn test_bootloader_reached_despite_reboot_fault() {
        let (transport, monitor) = setup(ConnectivityState::Online);
        let flipper = monitor.clone();
        transport.on_reboot(move |_, _| {
            // the command timed out but the device went down anyway
            flipper.set_state(ConnectivityState::Fastboot);
            Err(TransportError::Timeout("reboot".into()))
        });

        recovery().recover_device_bootloader(&monitor).await.unwrap();
    }

    #[tokio::test]
    async fn test_bootloader_from_not_available_polls_before_rebooting() {
        let (transport, monitor) = setup(ConnectivityState::NotAvailable);
        transport.set_reboot_outcome(RebootTarget::Bootloader, ConnectivityState::Fastboot);

        recovery().recover_device_bootloader(&monitor).await.unwrap();

        let calls = transport.bootloader_calls();
        assert_eq!(calls, vec![vec!["reboot-bootloader".to_string()]]);
        assert!(transport.reboot_calls().is_empty());
    }

    #[tokio::test]
    async fn test_bootloader_stuck_not_available() {
        let (transport, monitor) = setup(ConnectivityState::NotAvailable);
        let err = recovery().recover_device_bootloader(&monitor).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
        // exactly one reboot, however many retry rounds ran
        assert_eq!(transport.bootloader_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_mode_wait() {
        let (_, monitor) = setup(ConnectivityState::Recovery);
        recovery().recover_device_recovery(&monitor).await.unwrap();

        monitor.set_state(ConnectivityState::Online);
        assert!(recovery().recover_device_recovery(&monitor).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_recovery() {
        let (_, monitor) = setup(ConnectivityState::Online);
        let err = AbortRecovery.recover_device(&monitor, true).await.unwrap_err();
        assert_eq!(
            err,
            DeviceError::unavailable("SERIAL1", "aborted test session")
        );
        assert!(AbortRecovery.recover_device_bootloader(&monitor).await.is_err());
    }

    #[tokio::test]
    async fn test_perform_device_action_retries_then_succeeds() {
        let (_, monitor) = setup(ConnectivityState::Online);
        let attempts = AtomicUsize::new(0);
        let recovery = recovery();
        let mode = RecoveryMode::Online;
        let result = perform_device_action(&recovery, &monitor, mode, "getprop", 2, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(TransportError::Io("connection reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(1));
    }

    #[tokio::test]
    async fn test_perform_device_action_exhausts_retries() {
        let (_, monitor) = setup(ConnectivityState::Online);
        let recovery = recovery();
        let mode = RecoveryMode::None;
        let err = perform_device_action(&recovery, &monitor, mode, "push", 2, || async {
            Err::<(), _>(TransportError::CommandRejected("device offline".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_unresponsive());

        let result = perform_device_action(&recovery, &monitor, mode, "pull", 0, || async {
            Err::<(), _>(TransportError::Io("eof".into()))
        })
        .await
        .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_perform_device_action_surfaces_recovery_failure() {
        let (_, monitor) = setup(ConnectivityState::Online);
        let mode = RecoveryMode::Available;
        let err = perform_device_action(&AbortRecovery, &monitor, mode, "shell", 3, || async {
            Err::<(), _>(TransportError::Timeout("shell".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable { .. }));
    }
}
