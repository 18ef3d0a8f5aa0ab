//! Managed remote-command task.
//!
//! A `CommandAction` is resumed by the orchestration engine with at most one event per
//! call and suspends again until it reaches a terminal state. Its input, output and
//! state are plain serde values so the engine can persist it between resumptions.

use crate::constants::ssh::MANAGED_SSH_USER;
use crate::errors::ProxyError;
use crate::services::dispatcher::{
    Clock, Command, CommandUpdate, ConnectionOptions, ConnectionOptionsOverride,
    ConnectionTimeout, Dispatcher, DispatcherMessage, InitializationError, OutputEntry,
    SuspendedAction,
};
use crate::services::logger::Logger;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const FAILURE_MESSAGE: &str = "Script execution failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanInput {
    #[serde(default)]
    pub callback: Option<Callback>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub effective_user: Option<String>,
    pub script: String,
    #[serde(default)]
    pub host_public_key: Option<String>,
    #[serde(default)]
    pub verify_host: Option<bool>,
    #[serde(default)]
    pub connection_options: ConnectionOptionsOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInput {
    pub task_id: String,
    pub hostname: String,
    pub effective_user: Option<String>,
    pub script: String,
    pub host_public_key: Option<String>,
    pub verify_host: Option<bool>,
    pub connection_options: ConnectionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<Callback>,
    /// Unset until the first connection timeout arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMetadata {
    pub exception_kind: String,
    pub exception_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub result: Vec<OutputEntry>,
    #[serde(default)]
    pub initialization_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FailureMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Suspended,
    Success,
    Error,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Success | ActionState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueStrategy {
    Skip,
}

/// The closed set of events the engine may deliver on resumption.
#[derive(Debug, Clone)]
pub enum ActionEvent {
    Update(CommandUpdate),
    InitializationError(InitializationError),
    ConnectionTimeout(ConnectionTimeout),
    Cancel,
    Skip,
}

impl ActionEvent {
    fn name(&self) -> &'static str {
        match self {
            ActionEvent::Update(_) => "command_update",
            ActionEvent::InitializationError(_) => "initialization_error",
            ActionEvent::ConnectionTimeout(_) => "connection_timeout",
            ActionEvent::Cancel => "cancel",
            ActionEvent::Skip => "skip",
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unexpected event {event} while {state:?}")]
    UnexpectedEvent {
        event: &'static str,
        state: ActionState,
    },
    #[error("{0}")]
    Fatal(ProxyError),
    #[error("{0}")]
    TaskFailed(String),
}

pub struct ActionContext {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub logger: Logger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAction {
    input: ActionInput,
    output: ActionOutput,
    state: ActionState,
    suspended_action: SuspendedAction,
}

impl CommandAction {
    /// Resolves the task id (callback id, then explicit `task_id`, then a fresh UUID)
    /// and fixes the connection options for the lifetime of the action.
    pub fn plan(input: PlanInput, suspended_action: SuspendedAction) -> Self {
        let task_id = match (&input.callback, &input.task_id) {
            (Some(callback), _) => callback.task_id.clone(),
            (None, Some(task_id)) => task_id.clone(),
            (None, None) => Uuid::new_v4().to_string(),
        };
        let connection_options = input
            .connection_options
            .merged_over(ConnectionOptions::default());
        Self {
            input: ActionInput {
                task_id,
                hostname: input.hostname,
                effective_user: input.effective_user,
                script: input.script,
                host_public_key: input.host_public_key,
                verify_host: input.verify_host,
                connection_options,
                callback: input.callback,
                remaining_retries: None,
            },
            output: ActionOutput::default(),
            state: ActionState::Pending,
            suspended_action,
        }
    }

    pub fn input(&self) -> &ActionInput {
        &self.input
    }

    pub fn output(&self) -> &ActionOutput {
        &self.output
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn rescue_strategy(&self) -> RescueStrategy {
        RescueStrategy::Skip
    }

    pub fn command(&self) -> Command {
        Command {
            id: self.input.task_id.clone(),
            host: self.input.hostname.clone(),
            ssh_user: MANAGED_SSH_USER.to_string(),
            effective_user: self.input.effective_user.clone(),
            script: self.input.script.clone(),
            host_public_key: self.input.host_public_key.clone(),
            verify_host: self.input.verify_host,
            connection_options: self.input.connection_options,
            suspended_action: self.suspended_action.clone(),
        }
    }

    /// Processes one resumption. `None` starts the action.
    pub fn run(&mut self, event: Option<ActionEvent>, ctx: &ActionContext) -> Result<(), ActionError> {
        let Some(event) = event else {
            return self.start(ctx);
        };
        if self.state != ActionState::Suspended {
            return Err(ActionError::UnexpectedEvent {
                event: event.name(),
                state: self.state,
            });
        }
        match event {
            ActionEvent::Update(update) => {
                self.output.result.extend(update.buffer);
                if let Some(status) = update.exit_status {
                    self.output.exit_status = Some(status);
                    self.state = ActionState::Success;
                }
                Ok(())
            }
            ActionEvent::InitializationError(error) => {
                ctx.logger.warn(
                    "command initialization failed",
                    Some(&json!({ "command": self.input.task_id, "error": error.exception.message })),
                );
                self.output.initialization_error = true;
                self.output.metadata = Some(FailureMetadata {
                    exception_kind: error.exception.code.clone(),
                    exception_message: error.exception.message.clone(),
                });
                self.state = ActionState::Error;
                Ok(())
            }
            ActionEvent::ConnectionTimeout(timeout) => self.retry(timeout, ctx),
            ActionEvent::Cancel => {
                ctx.logger.info(
                    "killing command",
                    Some(&json!({ "command": self.input.task_id })),
                );
                ctx.dispatcher.tell(DispatcherMessage::Kill {
                    command: self.command(),
                });
                Ok(())
            }
            ActionEvent::Skip => {
                self.state = ActionState::Success;
                Ok(())
            }
        }
    }

    fn start(&mut self, ctx: &ActionContext) -> Result<(), ActionError> {
        if self.state != ActionState::Pending {
            return Err(ActionError::UnexpectedEvent {
                event: "start",
                state: self.state,
            });
        }
        self.output.result.clear();
        ctx.logger.info(
            "dispatching command",
            Some(&json!({ "command": self.input.task_id, "host": self.input.hostname })),
        );
        ctx.dispatcher.tell(DispatcherMessage::InitializeCommand {
            command: self.command(),
            retry_number: 0,
        });
        self.state = ActionState::Suspended;
        Ok(())
    }

    fn retry(&mut self, timeout: ConnectionTimeout, ctx: &ActionContext) -> Result<(), ActionError> {
        let options = self.input.connection_options;
        let remaining = options.retry_count.saturating_sub(timeout.retry_number);
        self.input.remaining_retries = Some(remaining);
        if timeout.retry_number >= options.retry_count {
            ctx.logger.error(
                "connection retries exhausted",
                Some(&json!({
                    "command": self.input.task_id,
                    "host": self.input.hostname,
                    "error": timeout.exception.message,
                })),
            );
            self.state = ActionState::Error;
            return Err(ActionError::Fatal(timeout.exception));
        }
        ctx.logger.warn(
            "connection timed out; retry scheduled",
            Some(&json!({
                "command": self.input.task_id,
                "retry_number": timeout.retry_number + 1,
                "remaining_retries": remaining,
            })),
        );
        ctx.clock.ping(
            ctx.dispatcher.clone(),
            options.retry_delay(),
            DispatcherMessage::InitializeCommand {
                command: self.command(),
                retry_number: timeout.retry_number + 1,
            },
        );
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.output.initialization_error || self.output.exit_status != Some(0)
    }

    /// Marks the task as a whole failed when the script did not exit cleanly.
    pub fn finalize(&self) -> Result<(), ActionError> {
        if self.is_failed() {
            return Err(ActionError::TaskFailed(FAILURE_MESSAGE.to_string()));
        }
        Ok(())
    }
}
