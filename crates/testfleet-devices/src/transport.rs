/*!
 * Transport capability used to reach devices.
 *
 * The wire protocol is not implemented here. Production code plugs a real
 * transport in behind [`Transport`], tests plug in the scriptable transport
 * from the `testing` module.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::TransportError;

/// Result type for transport calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Where a reboot should land
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebootTarget {
    /// Boot the regular system
    Online,
    /// Stop in the bootloader
    Bootloader,
    /// Boot into recovery
    Recovery,
}

/// Receiver of streamed command output
pub trait OutputSink: Send + Sync + Debug {
    /// Append a chunk of output
    fn add_output(&self, chunk: Bytes);

    /// Called once the command stopped producing output
    fn flush(&self) {}
}

/// Output sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: Mutex<BytesMut>,
    chunks: Mutex<usize>,
}

impl BufferSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far
    pub fn contents(&self) -> Bytes {
        self.buffer.lock().clone().freeze()
    }

    /// Received output as text, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Number of chunks received
    pub fn chunk_count(&self) -> usize {
        *self.chunks.lock()
    }
}

impl OutputSink for BufferSink {
    fn add_output(&self, chunk: Bytes) {
        self.buffer.lock().extend_from_slice(&chunk);
        *self.chunks.lock() += 1;
    }
}

/// Capability trait for talking to devices
///
/// Every call names the device by serial. Implementations must be cheap to
/// share: the monitor, the recovery engine and every watch action hold the
/// same `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Run a shell command and return its raw output
    async fn shell(&self, serial: &str, command: &str, timeout: Duration)
        -> TransportResult<String>;

    /// Read a device property
    async fn property(&self, serial: &str, name: &str) -> TransportResult<Option<String>>;

    /// Read the battery level in percent
    async fn battery_level(&self, serial: &str) -> TransportResult<Option<u32>>;

    /// Reboot the device through the online transport
    async fn reboot(&self, serial: &str, target: RebootTarget) -> TransportResult<()>;

    /// Run a bootloader-protocol command ("getvar product", "reboot", ...)
    async fn bootloader_command(
        &self,
        serial: &str,
        args: &[&str],
        timeout: Duration,
    ) -> TransportResult<String>;

    /// Run a long-lived command, pushing output into `sink` until it ends
    async fn stream(
        &self,
        serial: &str,
        command: &str,
        sink: Arc<dyn OutputSink>,
    ) -> TransportResult<()>;
}
