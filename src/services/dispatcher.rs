//! Message contract between command actions and the actor that owns live SSH sessions.
//!
//! Actions never touch sockets. They address a [`Dispatcher`] with [`DispatcherMessage`]s
//! tagged by [`Command`] id, and the engine hands the dispatcher's replies
//! ([`CommandUpdate`], [`InitializationError`], [`ConnectionTimeout`]) back to the
//! suspended action.

use crate::constants::retry::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL_SECS,
};
use crate::errors::ProxyError;
use crate::services::logger::Logger;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub retry_count: u32,
    /// Seconds between connection attempts.
    pub retry_interval: f64,
    /// Seconds allowed for one connection attempt.
    pub timeout: f64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl ConnectionOptions {
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_interval).unwrap_or(Duration::ZERO)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::ZERO)
    }
}

/// Caller-supplied connection options; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl ConnectionOptionsOverride {
    pub fn merged_over(&self, defaults: ConnectionOptions) -> ConnectionOptions {
        ConnectionOptions {
            retry_count: self.retry_count.unwrap_or(defaults.retry_count),
            retry_interval: self.retry_interval.unwrap_or(defaults.retry_interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
        }
    }
}

/// Address of a suspended action; the engine routes dispatcher replies through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedAction {
    pub execution_plan_id: String,
    pub step_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub host: String,
    pub ssh_user: String,
    pub effective_user: Option<String>,
    pub script: String,
    pub host_public_key: Option<String>,
    pub verify_host: Option<bool>,
    pub connection_options: ConnectionOptions,
    pub suspended_action: SuspendedAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub output_type: OutputStream,
    pub output: String,
    /// Fractional Unix seconds at which the chunk was read.
    pub timestamp: f64,
}

impl OutputEntry {
    pub fn new(output_type: OutputStream, output: impl Into<String>) -> Self {
        Self {
            output_type,
            output: output.into(),
            timestamp: unix_now(),
        }
    }

    pub fn stdout(output: impl Into<String>) -> Self {
        Self::new(OutputStream::Stdout, output)
    }

    pub fn stderr(output: impl Into<String>) -> Self {
        Self::new(OutputStream::Stderr, output)
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    pub buffer: Vec<OutputEntry>,
    pub exit_status: Option<i32>,
}

impl CommandUpdate {
    pub fn new(buffer: Vec<OutputEntry>, exit_status: Option<i32>) -> Self {
        Self {
            buffer,
            exit_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitializationError {
    pub exception: ProxyError,
}

#[derive(Debug, Clone)]
pub struct ConnectionTimeout {
    pub retry_number: u32,
    pub exception: ProxyError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherMessage {
    InitializeCommand { command: Command, retry_number: u32 },
    Kill { command: Command },
}

impl DispatcherMessage {
    pub fn command(&self) -> &Command {
        match self {
            DispatcherMessage::InitializeCommand { command, .. } => command,
            DispatcherMessage::Kill { command } => command,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatcherMessage::InitializeCommand { .. } => "initialize_command",
            DispatcherMessage::Kill { .. } => "kill",
        }
    }
}

pub trait Dispatcher: Send + Sync {
    fn tell(&self, message: DispatcherMessage);
}

/// Delivers a message to a dispatcher after a delay without blocking the caller.
pub trait Clock: Send + Sync {
    fn ping(&self, target: Arc<dyn Dispatcher>, delay: Duration, message: DispatcherMessage);
}

/// Dispatcher front that queues messages for the session-owning actor.
pub struct MailboxDispatcher {
    logger: Logger,
    sender: mpsc::UnboundedSender<DispatcherMessage>,
}

impl MailboxDispatcher {
    pub fn channel(logger: Logger) -> (Self, mpsc::UnboundedReceiver<DispatcherMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                logger: logger.child("dispatcher"),
                sender,
            },
            receiver,
        )
    }
}

impl Dispatcher for MailboxDispatcher {
    fn tell(&self, message: DispatcherMessage) {
        let meta = json!({ "message": message.name(), "command": message.command().id });
        if self.sender.send(message).is_err() {
            self.logger
                .warn("dispatcher mailbox closed; message dropped", Some(&meta));
        } else {
            self.logger.debug("message queued", Some(&meta));
        }
    }
}

pub struct TokioClock {
    handle: tokio::runtime::Handle,
}

impl TokioClock {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Clock for TokioClock {
    fn ping(&self, target: Arc<dyn Dispatcher>, delay: Duration, message: DispatcherMessage) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            target.tell(message);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_merges_over_defaults() {
        let merged = ConnectionOptionsOverride {
            retry_count: Some(5),
            ..Default::default()
        }
        .merged_over(ConnectionOptions::default());
        assert_eq!(merged.retry_count, 5);
        assert_eq!(merged.retry_interval, 10.0);
        assert_eq!(merged.timeout, 0.1);
    }

    #[test]
    fn invalid_intervals_collapse_to_zero() {
        let options = ConnectionOptions {
            retry_interval: -1.0,
            timeout: f64::NAN,
            ..Default::default()
        };
        assert_eq!(options.retry_delay(), Duration::ZERO);
        assert_eq!(options.connect_timeout(), Duration::ZERO);
    }

    #[test]
    fn output_entries_serialize_with_stream_tag() {
        let entry = OutputEntry::stdout("hello");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["output_type"], "stdout");
        assert_eq!(value["output"], "hello");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }
}
