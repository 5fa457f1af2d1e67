/*!
 * Scriptable in-memory transport for tests.
 *
 * [`FakeTransport`] answers every call with a healthy-device default and
 * records what it was asked. Individual calls can be overridden with
 * closures. Monitors attached to it follow the reboots it receives, so
 * recovery paths can be driven without a real device.
 */
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use testfleet_core::config::{MonitorConfig, RecoveryConfig};

use crate::device::ConnectivityState;
use crate::monitor::DeviceStateMonitor;
use crate::transport::{OutputSink, RebootTarget, Transport, TransportResult};

type ShellHandler = Arc<dyn Fn(&str, &str) -> TransportResult<String> + Send + Sync>;
type PropertyHandler = Arc<dyn Fn(&str, &str) -> TransportResult<Option<String>> + Send + Sync>;
type BootloaderHandler = Arc<dyn Fn(&str, &[&str]) -> TransportResult<String> + Send + Sync>;
type RebootHandler = Arc<dyn Fn(&str, RebootTarget) -> TransportResult<()> + Send + Sync>;
type StreamHandler =
    Arc<dyn Fn(&str, &str, Arc<dyn OutputSink>) -> TransportResult<()> + Send + Sync>;

/// A call received by the fake transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `shell(serial, command)`
    Shell(String, String),
    /// `property(serial, name)`
    Property(String, String),
    /// `battery_level(serial)`
    Battery(String),
    /// `reboot(target)`
    Reboot(RebootTarget),
    /// `bootloader_command(args)`
    Bootloader(Vec<String>),
    /// `stream(serial, command)`
    Stream(String, String),
}

#[derive(Default)]
struct Handlers {
    shell: Option<ShellHandler>,
    property: Option<PropertyHandler>,
    bootloader: Option<BootloaderHandler>,
    reboot: Option<RebootHandler>,
    stream: Option<StreamHandler>,
}

/// In-memory transport with scriptable replies
pub struct FakeTransport {
    handlers: Mutex<Handlers>,
    battery: Mutex<Option<u32>>,
    reboot_outcomes: Mutex<HashMap<RebootTarget, ConnectivityState>>,
    monitors: Mutex<HashMap<String, Weak<DeviceStateMonitor>>>,
    calls: Mutex<Vec<Call>>,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// A transport where every device is healthy
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Handlers::default()),
            battery: Mutex::new(Some(100)),
            reboot_outcomes: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Override shell replies
    pub fn on_shell<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> TransportResult<String> + Send + Sync + 'static,
    {
        self.handlers.lock().shell = Some(Arc::new(handler));
    }

    /// Override property replies
    pub fn on_property<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> TransportResult<Option<String>> + Send + Sync + 'static,
    {
        self.handlers.lock().property = Some(Arc::new(handler));
    }

    /// Override bootloader command replies
    pub fn on_bootloader<F>(&self, handler: F)
    where
        F: Fn(&str, &[&str]) -> TransportResult<String> + Send + Sync + 'static,
    {
        self.handlers.lock().bootloader = Some(Arc::new(handler));
    }

    /// Override reboot replies
    ///
    /// A failed reboot leaves attached monitors untouched.
    pub fn on_reboot<F>(&self, handler: F)
    where
        F: Fn(&str, RebootTarget) -> TransportResult<()> + Send + Sync + 'static,
    {
        self.handlers.lock().reboot = Some(Arc::new(handler));
    }

    /// Override streaming commands
    pub fn on_stream<F>(&self, handler: F)
    where
        F: Fn(&str, &str, Arc<dyn OutputSink>) -> TransportResult<()> + Send + Sync + 'static,
    {
        self.handlers.lock().stream = Some(Arc::new(handler));
    }

    /// Set the battery level reported for every device
    pub fn set_battery_level(&self, level: Option<u32>) {
        *self.battery.lock() = level;
    }

    /// Connectivity an attached monitor switches to after a reboot to `target`
    pub fn set_reboot_outcome(&self, target: RebootTarget, state: ConnectivityState) {
        self.reboot_outcomes.lock().insert(target, state);
    }

    /// Let reboots received for the monitor's serial update its state
    pub fn attach_monitor(&self, monitor: &Arc<DeviceStateMonitor>) {
        self.monitors
            .lock()
            .insert(monitor.serial().to_string(), Arc::downgrade(monitor));
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Shell commands received so far
    pub fn shell_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Shell(_, command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Reboots received so far
    pub fn reboot_calls(&self) -> Vec<RebootTarget> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Reboot(target) => Some(*target),
                _ => None,
            })
            .collect()
    }

    /// Bootloader commands received so far
    pub fn bootloader_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Bootloader(args) => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn apply_reboot(&self, serial: &str, target: RebootTarget) {
        let Some(state) = self.reboot_outcomes.lock().get(&target).copied() else {
            return;
        };
        let monitor = self.monitors.lock().get(serial).and_then(Weak::upgrade);
        if let Some(monitor) = monitor {
            monitor.set_state(state);
        }
    }

    fn default_shell(command: &str) -> String {
        if command == "echo $EXTERNAL_STORAGE" {
            return "/sdcard\n".to_string();
        }
        if command.starts_with("pm path") {
            return "package:/system/framework/framework-res.apk\n".to_string();
        }
        if let Some(rest) = command.strip_prefix("echo ") {
            // "echo token > file && cat file ..." prints the token once
            let word = rest.split(" > ").next().unwrap_or(rest);
            return format!("{}\n", word);
        }
        String::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn shell(
        &self,
        serial: &str,
        command: &str,
        _timeout: Duration,
    ) -> TransportResult<String> {
        self.record(Call::Shell(serial.to_string(), command.to_string()));
        let handler = self.handlers.lock().shell.clone();
        match handler {
            Some(handler) => handler(serial, command),
            None => Ok(Self::default_shell(command)),
        }
    }

    async fn property(&self, serial: &str, name: &str) -> TransportResult<Option<String>> {
        self.record(Call::Property(serial.to_string(), name.to_string()));
        let handler = self.handlers.lock().property.clone();
        match handler {
            Some(handler) => handler(serial, name),
            None if name == "sys.boot_completed" => Ok(Some("1".to_string())),
            None => Ok(None),
        }
    }

    async fn battery_level(&self, serial: &str) -> TransportResult<Option<u32>> {
        self.record(Call::Battery(serial.to_string()));
        Ok(*self.battery.lock())
    }

    async fn reboot(&self, serial: &str, target: RebootTarget) -> TransportResult<()> {
        self.record(Call::Reboot(target));
        let handler = self.handlers.lock().reboot.clone();
        if let Some(handler) = handler {
            handler(serial, target)?;
        }
        self.apply_reboot(serial, target);
        Ok(())
    }

    async fn bootloader_command(
        &self,
        serial: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> TransportResult<String> {
        self.record(Call::Bootloader(args.iter().map(|a| a.to_string()).collect()));
        let handler = self.handlers.lock().bootloader.clone();
        if let Some(handler) = handler {
            return handler(serial, args);
        }
        match args.first().copied() {
            Some("reboot") => self.apply_reboot(serial, RebootTarget::Online),
            Some("reboot-bootloader") => self.apply_reboot(serial, RebootTarget::Bootloader),
            _ => {}
        }
        Ok(format!("{}: fake\n", args.join(" ")))
    }

    async fn stream(
        &self,
        serial: &str,
        command: &str,
        sink: Arc<dyn OutputSink>,
    ) -> TransportResult<()> {
        self.record(Call::Stream(serial.to_string(), command.to_string()));
        let handler = self.handlers.lock().stream.clone();
        match handler {
            Some(handler) => handler(serial, command, sink),
            // stream nothing until the caller gives up
            None => std::future::pending().await,
        }
    }
}

/// Monitor configuration with waits short enough for tests
pub fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 5,
        shell_probe_timeout_ms: 50,
        ..MonitorConfig::default()
    }
}

/// Recovery configuration with waits short enough for tests
pub fn fast_recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        initial_pause_ms: 1,
        online_wait_ms: 50,
        shell_wait_ms: 50,
        available_wait_ms: 50,
        bootloader_wait_ms: 30,
        bootloader_retries: 1,
        min_battery_level: None,
        reboot_unresponsive: false,
    }
}
