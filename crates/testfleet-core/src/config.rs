/*!
 * Configuration management for TestFleet.
 *
 * All waits in the fleet are bounded, and every bound lives here as a
 * millisecond field with a `Duration` accessor. Tests shrink these values
 * instead of patching constants.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level fleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device state monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Recovery engine configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Allocation configuration
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Flashing gate configuration
    #[serde(default)]
    pub flashing: FlashingConfig,

    /// Background watch action configuration
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Device state monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between two polls of any wait
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Token echoed back by the shell responsiveness probe
    #[serde(default = "default_shell_probe_token")]
    pub shell_probe_token: String,

    /// Bound on a single probe command
    #[serde(default = "default_shell_probe_timeout_ms")]
    pub shell_probe_timeout_ms: u64,

    /// Property that reads "1" once the device finished booting
    #[serde(default = "default_boot_complete_property")]
    pub boot_complete_property: String,
}

/// Recovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Grace period before any recovery stage runs
    #[serde(default = "default_initial_pause_ms")]
    pub initial_pause_ms: u64,

    /// Bound on waiting for the device to come online
    #[serde(default = "default_online_wait_ms")]
    pub online_wait_ms: u64,

    /// Bound on waiting for the shell to respond
    #[serde(default = "default_shell_wait_ms")]
    pub shell_wait_ms: u64,

    /// Bound on the composite availability wait
    #[serde(default = "default_available_wait_ms")]
    pub available_wait_ms: u64,

    /// Bound on each wait for the bootloader state
    #[serde(default = "default_bootloader_wait_ms")]
    pub bootloader_wait_ms: u64,

    /// Extra not-available/bootloader wait rounds after the first one
    #[serde(default = "default_bootloader_retries")]
    pub bootloader_retries: u32,

    /// Minimum battery level required after recovery (none = unchecked)
    #[serde(default)]
    pub min_battery_level: Option<u32>,

    /// Reboot an unresponsive device once before giving up on it
    #[serde(default)]
    pub reboot_unresponsive: bool,
}

/// Allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Bound on the shell check run on freshly connected devices
    #[serde(default = "default_check_available_ms")]
    pub check_available_ms: u64,

    /// How long an allocation call waits for a match (0 = no wait)
    #[serde(default)]
    pub allocate_wait_ms: u64,

    /// Run availability checks inline instead of on spawned tasks
    #[serde(default)]
    pub synchronous_mode: bool,

    /// Number of null-device placeholders registered at init
    #[serde(default = "default_num_null_devices")]
    pub num_null_devices: usize,

    /// Number of emulator placeholders registered at init
    #[serde(default = "default_num_emulators")]
    pub num_emulators: usize,

    /// Number of tcp-device placeholders registered at init
    #[serde(default = "default_num_tcp_devices")]
    pub num_tcp_devices: usize,
}

/// Flashing gate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashingConfig {
    /// Maximum concurrent flashers (none = ask the host, else unbounded)
    #[serde(default)]
    pub concurrent_limit: Option<usize>,
}

/// Background watch action configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Pause before re-issuing a watch command
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shell_probe_token: default_shell_probe_token(),
            shell_probe_timeout_ms: default_shell_probe_timeout_ms(),
            boot_complete_property: default_boot_complete_property(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_pause_ms: default_initial_pause_ms(),
            online_wait_ms: default_online_wait_ms(),
            shell_wait_ms: default_shell_wait_ms(),
            available_wait_ms: default_available_wait_ms(),
            bootloader_wait_ms: default_bootloader_wait_ms(),
            bootloader_retries: default_bootloader_retries(),
            min_battery_level: None,
            reboot_unresponsive: false,
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            check_available_ms: default_check_available_ms(),
            allocate_wait_ms: 0,
            synchronous_mode: false,
            num_null_devices: default_num_null_devices(),
            num_emulators: default_num_emulators(),
            num_tcp_devices: default_num_tcp_devices(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl MonitorConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Single probe bound as a duration
    pub fn shell_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_probe_timeout_ms)
    }
}

impl RecoveryConfig {
    /// Grace period as a duration
    pub fn initial_pause(&self) -> Duration {
        Duration::from_millis(self.initial_pause_ms)
    }

    /// Online wait bound as a duration
    pub fn online_wait(&self) -> Duration {
        Duration::from_millis(self.online_wait_ms)
    }

    /// Shell wait bound as a duration
    pub fn shell_wait(&self) -> Duration {
        Duration::from_millis(self.shell_wait_ms)
    }

    /// Availability wait bound as a duration
    pub fn available_wait(&self) -> Duration {
        Duration::from_millis(self.available_wait_ms)
    }

    /// Bootloader wait bound as a duration
    pub fn bootloader_wait(&self) -> Duration {
        Duration::from_millis(self.bootloader_wait_ms)
    }
}

impl AllocationConfig {
    /// Availability check bound as a duration
    pub fn check_available(&self) -> Duration {
        Duration::from_millis(self.check_available_ms)
    }

    /// Allocation wait bound as a duration
    pub fn allocate_wait(&self) -> Duration {
        Duration::from_millis(self.allocate_wait_ms)
    }
}

impl WatchConfig {
    /// Restart delay as a duration
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_shell_probe_token() -> String {
    "xyzzy".to_string()
}

fn default_shell_probe_timeout_ms() -> u64 {
    5_000
}

fn default_boot_complete_property() -> String {
    "sys.boot_completed".to_string()
}

fn default_initial_pause_ms() -> u64 {
    5_000
}

fn default_online_wait_ms() -> u64 {
    60_000
}

fn default_shell_wait_ms() -> u64 {
    30_000
}

fn default_available_wait_ms() -> u64 {
    6 * 60 * 1_000
}

fn default_bootloader_wait_ms() -> u64 {
    30_000
}

fn default_bootloader_retries() -> u32 {
    1
}

fn default_check_available_ms() -> u64 {
    30_000
}

fn default_num_null_devices() -> usize {
    5
}

fn default_num_emulators() -> usize {
    1
}

fn default_num_tcp_devices() -> usize {
    1
}

fn default_restart_delay_ms() -> u64 {
    100
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<FleetConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: FleetConfig) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<FleetConfig> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let defaults = ConfigLib::try_from(&FleetConfig::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut config_builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: FleetConfig = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<FleetConfig>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: FleetConfig) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &FleetConfig {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(FleetConfig::default())
    }
}

impl From<FleetConfig> for SharedConfig {
    fn from(config: FleetConfig) -> Self {
        Self::new(config)
    }
}

impl AsRef<FleetConfig> for SharedConfig {
    fn as_ref(&self) -> &FleetConfig {
        self.get()
    }
}
