/*!
 * Background watch actions.
 *
 * A watch action runs one long-lived command against a device and pushes its
 * output into a sink. Transport failures do not end it: the action waits for
 * the device to be online again and re-issues the command. Only cancellation
 * ends the loop.
 */
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use testfleet_core::logging::device_span;
use testfleet_core::utils::sleep_or_cancel;

use crate::device::ConnectivityState;
use crate::monitor::DeviceStateMonitor;
use crate::transport::OutputSink;

/// A cancellable long-lived command bound to one device
#[derive(Debug)]
pub struct BackgroundDeviceAction {
    id: Uuid,
    command: String,
    monitor: Arc<DeviceStateMonitor>,
    sink: Arc<dyn OutputSink>,
    token: CancellationToken,
    restart_delay: Duration,
}

impl BackgroundDeviceAction {
    /// Create a new action
    pub fn new<S: Into<String>>(
        command: S,
        monitor: Arc<DeviceStateMonitor>,
        sink: Arc<dyn OutputSink>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            monitor,
            sink,
            token: CancellationToken::new(),
            restart_delay,
        }
    }

    /// Tie the action to an external token; cancelling it stops the action
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The action id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The watched device serial
    pub fn serial(&self) -> &str {
        self.monitor.serial()
    }

    /// The command being run
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The token that stops the action
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run until cancelled
    pub async fn run(&self) {
        let serial = self.monitor.serial();
        info!(id = %self.id, "Starting watch '{}'", self.command);

        while !self.token.is_cancelled() {
            let result = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.monitor.transport().stream(
                    serial,
                    &self.command,
                    self.sink.clone(),
                ) => result,
            };

            match result {
                Ok(()) => debug!("Watch command '{}' ended", self.command),
                Err(e) => {
                    warn!("{} while running '{}': {}", e.kind(), self.command, e);
                    if !self.wait_for_device_recovery(e.kind()).await {
                        break;
                    }
                }
            }

            if !sleep_or_cancel(self.restart_delay, &self.token).await {
                break;
            }
        }

        self.sink.flush();
        info!(id = %self.id, "Watch '{}' stopped", self.command);
    }

    /// Block until the device is online again
    ///
    /// Returns `true` right away if the device is still online, so a command
    /// failure on a healthy device costs nothing. Returns `false` once the
    /// action is cancelled.
    pub async fn wait_for_device_recovery(&self, failure: &str) -> bool {
        if self.monitor.state() == ConnectivityState::Online {
            debug!("Device still online after {} failure", failure);
            return true;
        }

        info!("Device went away after {} failure, waiting for it to return", failure);
        let interval = self.monitor.config().poll_interval();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return false,
                online = self.monitor.wait_for_online(interval) => {
                    if online {
                        info!("Device back online, resuming watch");
                        return true;
                    }
                }
            }
        }
    }

    /// Run the action on the runtime
    pub fn spawn(self) -> WatchHandle {
        let id = self.id;
        let serial = self.monitor.serial().to_string();
        let token = self.token.clone();
        let span = device_span(&serial);
        let join = tokio::spawn(async move { self.run().await }.instrument(span));
        WatchHandle {
            id,
            serial,
            token,
            join,
        }
    }
}

/// Handle to a spawned watch action
#[derive(Debug)]
pub struct WatchHandle {
    id: Uuid,
    serial: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WatchHandle {
    /// The action id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The watched device serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Ask the action to stop
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the action and wait for its task to end
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(serial = %self.serial, "Watch task {} failed: {}", self.id, e);
        }
    }
}
