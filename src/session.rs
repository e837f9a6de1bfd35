//! Coordinating context between the presentation layer and the link.
//!
//! A [`DiagSession`] owns the [`SerialLink`] and serializes everything that
//! touches it. Bulk channel reads take long enough to stall an interactive
//! caller, so they run on a blocking worker of the session's tokio runtime:
//!
//! 1. `request_channel()` moves the link into the worker.
//! 2. The worker drains, sends `<GV:n>`, decodes the 20 blocks.
//! 3. The link and the outcome come back through a one-shot channel and are
//!    picked up by `poll_read()` or `wait_read()`.
//!
//! While the link is away every other operation is rejected with
//! [`DriverError::ReadInProgress`]; nothing is queued.
//!
//! # Blocking
//!
//! `wait_read()` blocks on the runtime, so the session must be driven from
//! plain threads (UI thread, CLI, Python), not from inside async code.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::command::{Channel, CMD_AC_DISABLE, CMD_AC_ENABLE, CMD_AUX_ACTION};
use crate::config::ProtocolConfig;
use crate::errors::{DriverError, Result};
use crate::link::{SerialLink, Transport};

/// Extra time granted on top of the decoder's own worst case when waiting
/// synchronously for a read.
const WAIT_MARGIN: Duration = Duration::from_millis(500);

/// Completed channel read, successful or not.
#[derive(Debug)]
pub struct ChannelRead {
    pub channel: Channel,
    /// Exactly [`SAMPLES_PER_READ`](crate::config::SAMPLES_PER_READ) samples
    /// in time order, or the reason the read failed.
    pub outcome: Result<Vec<i16>>,
}

type WorkerReply = (SerialLink, Result<Vec<i16>>);

struct PendingRead {
    channel: Channel,
    reply: oneshot::Receiver<WorkerReply>,
}

pub struct DiagSession {
    /// Always `Some` until the session is dropped.
    runtime: Option<Runtime>,
    config: ProtocolConfig,
    /// `None` only while a read worker holds the link.
    link: Option<SerialLink>,
    pending: Option<PendingRead>,
    /// Last AC state the device acknowledged. Never read back from the
    /// device, so it is only as good as the last acknowledged command.
    ac_enabled: Option<bool>,
}

impl DiagSession {
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("motor-diag-io")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            config,
            link: Some(SerialLink::new()),
            pending: None,
            ac_enabled: None,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Open `port`. The cached AC state is forgotten.
    pub fn open(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        self.idle_link()?.open(port, baud_rate)?;
        self.ac_enabled = None;
        Ok(())
    }

    /// Connect through an existing transport (simulators, tests).
    pub fn attach(&mut self, name: &str, transport: Box<dyn Transport>) -> Result<()> {
        self.idle_link()?.attach(name, transport)?;
        self.ac_enabled = None;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let closed = self.idle_link()?.close();
        self.ac_enabled = None;
        closed
    }

    /// Whether the port is open and alive. A link busy with a read counts as
    /// connected.
    pub fn is_connected(&self) -> bool {
        self.pending.is_some() || self.link.as_ref().is_some_and(SerialLink::is_connected)
    }

    /// Channel currently being read, if any.
    pub fn read_in_progress(&self) -> Option<Channel> {
        self.pending.as_ref().map(|p| p.channel)
    }

    // ------------------------------------------------------------------------
    // Channel reads
    // ------------------------------------------------------------------------

    /// Start a background read of `channel`.
    pub fn request_channel(&mut self, channel: Channel) -> Result<()> {
        let link = self.idle_link()?;
        if !link.is_connected() {
            warn!("channel {} read requested without a connection", channel);
            return Err(DriverError::NotConnected);
        }
        let runtime = self.runtime.as_ref().ok_or(DriverError::WorkerLost)?;
        let mut link = self.link.take().ok_or(DriverError::WorkerLost)?;

        let config = self.config.clone();
        let (tx, rx) = oneshot::channel();
        runtime.spawn_blocking(move || {
            let outcome = link.read_channel(channel, &config);
            if tx.send((link, outcome)).is_err() {
                debug!("channel {} result dropped: session is gone", channel);
            }
        });

        info!("channel {} read started", channel);
        self.pending = Some(PendingRead { channel, reply: rx });
        Ok(())
    }

    /// Completed read, if the worker has finished. Never blocks.
    pub fn poll_read(&mut self) -> Option<ChannelRead> {
        let pending = self.pending.as_mut()?;
        let channel = pending.channel;
        match pending.reply.try_recv() {
            Ok((link, outcome)) => Some(self.complete(channel, link, outcome)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(self.lose_worker(channel)),
        }
    }

    /// Block until the running read completes or `timeout` passes.
    ///
    /// On timeout the read keeps running and can still be collected later.
    pub fn wait_read(&mut self, timeout: Duration) -> Result<ChannelRead> {
        let pending = self.pending.as_mut().ok_or(DriverError::NoReadPending)?;
        let runtime = self.runtime.as_ref().ok_or(DriverError::WorkerLost)?;
        let channel = pending.channel;
        let reply = &mut pending.reply;
        let received = runtime.block_on(async { tokio::time::timeout(timeout, reply).await });

        match received {
            Ok(Ok((link, outcome))) => Ok(self.complete(channel, link, outcome)),
            Ok(Err(_)) => Ok(self.lose_worker(channel)),
            Err(_) => Err(DriverError::Timeout(format!(
                "channel {channel} read still running after {timeout:?}"
            ))),
        }
    }

    /// Request `channel` and wait for the result within the configured budget.
    pub fn read_channel(&mut self, channel: Channel) -> Result<Vec<i16>> {
        self.request_channel(channel)?;
        let budget = self.config.read_budget() + WAIT_MARGIN;
        self.wait_read(budget)?.outcome
    }

    fn complete(
        &mut self,
        channel: Channel,
        link: SerialLink,
        outcome: Result<Vec<i16>>,
    ) -> ChannelRead {
        self.pending = None;
        self.link = Some(link);
        match &outcome {
            Ok(samples) => info!("channel {} read complete: {} samples", channel, samples.len()),
            Err(e) => warn!("channel {} read failed: {}", channel, e),
        }
        ChannelRead { channel, outcome }
    }

    fn lose_worker(&mut self, channel: Channel) -> ChannelRead {
        error!(
            "read worker for channel {} exited without a result; connection dropped",
            channel
        );
        self.pending = None;
        self.link = Some(SerialLink::new());
        self.ac_enabled = None;
        ChannelRead {
            channel,
            outcome: Err(DriverError::WorkerLost),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send `command` until `expected` is echoed, at most `retries` attempts.
    ///
    /// Stale input is drained first. `Ok(false)` means not acknowledged.
    pub fn send_command_with_retry(
        &mut self,
        command: &str,
        expected: &str,
        retries: u32,
    ) -> Result<bool> {
        Ok(self
            .send_command_expecting_any(command, &[expected], retries)?
            .is_some())
    }

    /// Like [`send_command_with_retry`](Self::send_command_with_retry) with
    /// several acceptable answers; returns the one received.
    pub fn send_command_expecting_any(
        &mut self,
        command: &str,
        expected: &[&str],
        retries: u32,
    ) -> Result<Option<String>> {
        let timeout = self.config.command_timeout;
        let link = self.idle_link()?;
        link.drain_available()?;
        link.send_with_responses_retry(command, expected, retries, timeout)
    }

    /// Enable or disable the AC stage and remember the acknowledged state.
    pub fn set_ac(&mut self, enabled: bool) -> Result<()> {
        let command = if enabled { CMD_AC_ENABLE } else { CMD_AC_DISABLE };
        self.acknowledged(command)?;
        self.ac_enabled = Some(enabled);
        info!("AC {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Flip the AC stage and return the new state. An unknown state is
    /// assumed enabled, the controller's power-on default.
    pub fn toggle_ac(&mut self) -> Result<bool> {
        let target = !self.ac_enabled.unwrap_or(true);
        self.set_ac(target)?;
        Ok(target)
    }

    /// Last acknowledged AC state; `None` until a command succeeded on this
    /// connection.
    pub fn ac_enabled(&self) -> Option<bool> {
        self.ac_enabled
    }

    /// Fire the auxiliary `<FS>` action.
    pub fn trigger_fs(&mut self) -> Result<()> {
        self.acknowledged(CMD_AUX_ACTION)
    }

    fn acknowledged(&mut self, command: &str) -> Result<()> {
        let retries = self.config.command_retries;
        if self.send_command_with_retry(command, command, retries)? {
            Ok(())
        } else {
            Err(DriverError::CommandNotAcknowledged {
                command: command.to_string(),
                attempts: retries,
            })
        }
    }

    fn idle_link(&mut self) -> Result<&mut SerialLink> {
        if let Some(pending) = &self.pending {
            warn!("link busy: channel {} read in progress", pending.channel);
            return Err(DriverError::ReadInProgress(pending.channel.id()));
        }
        self.link.as_mut().ok_or(DriverError::WorkerLost)
    }
}

impl Drop for DiagSession {
    // A read still in flight is abandoned, not joined: its worker may be
    // waiting on the Python GIL held by the dropping thread.
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if let Some(pending) = self.pending.take() {
            warn!(
                "session dropped during channel {} read; abandoning worker",
                pending.channel
            );
            runtime.shutdown_background();
        }
    }
}
