//! Command execution against a session.
//!
//! [`CommandExecutor`] takes one [`Command`], asks the session's
//! [`ProxyRouter`](crate::proxy::ProxyRouter) whether to forward it, and
//! either forwards it to the secondary driver or runs the native handler.
//! Each command is logged to the session journal.
//!
//! # Example
//!
//! ```no_run
//! use droidpilot_core::command::Command;
//! use droidpilot_core::executor::CommandExecutor;
//! # async fn example(session: &mut droidpilot_core::session::Session) {
//! let id = session.id().to_string();
//! let result = CommandExecutor::execute(session, &id, Command::GetPageSource).await;
//! if result.success {
//!     println!("{}", result.value);
//! }
//! # }
//! ```

use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};

use crate::command::{Command, CommandResult};
use crate::error::DriverError;
use crate::handlers::{ContextSwitchable, EmulatorControllable, TouchCapable};
use crate::session::Session;

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the command completed successfully.
    pub success: bool,
    /// Returned value (`null` when the command returns nothing).
    pub value: Value,
    /// Remote-protocol error string on failure.
    pub error: Option<&'static str>,
    /// Human-readable message on failure.
    pub message: String,
    /// True when the command went to a secondary driver.
    pub proxied: bool,
}

impl ExecutionResult {
    /// Creates a successful result.
    pub fn success(value: Value) -> Self {
        Self {
            success: true,
            value,
            error: None,
            message: String::new(),
            proxied: false,
        }
    }

    /// Creates a failure result from an error.
    pub fn failure(err: &DriverError) -> Self {
        Self {
            success: false,
            value: Value::Null,
            error: Some(err.w3c_code()),
            message: err.to_string(),
            proxied: false,
        }
    }
}

/// Executes commands against a session.
pub struct CommandExecutor;

impl CommandExecutor {
    /// Executes a command addressed to `session_id`.
    ///
    /// A `session_id` other than the session's own fails with
    /// `SessionMismatch`.
    pub async fn execute(session: &mut Session, session_id: &str, command: Command) -> ExecutionResult {
        let span = info_span!("execute_command", command = command.name());
        async {
            let start = Instant::now();
            let (result, proxied) = match Self::route(session, session_id, &command).await {
                Ok((value, proxied)) => (ExecutionResult::success(value), proxied),
                Err(e) => (ExecutionResult::failure(&e), false),
            };
            let result = ExecutionResult { proxied, ..result };
            let elapsed = start.elapsed();
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                success = result.success,
                proxied,
                "command complete"
            );

            let log_result = if result.success {
                CommandResult::Success
            } else {
                CommandResult::Failure(result.message.clone())
            };
            session
                .journal()
                .log_command(command, log_result, proxied, Some(elapsed.as_millis() as u64))
                .await;
            result
        }
        .instrument(span)
        .await
    }

    async fn route(
        session: &mut Session,
        session_id: &str,
        command: &Command,
    ) -> Result<(Value, bool), DriverError> {
        session.ensure_ready()?;
        let (method, path) = command.route(session.id());
        if session.router().should_proxy(session_id, method, &path)? {
            let value = session
                .router()
                .forward(method, &path, command.wire_body())
                .await?;
            return Ok((value, true));
        }
        Ok((Self::execute_native(session, command).await?, false))
    }

    async fn execute_native(session: &mut Session, command: &Command) -> Result<Value, DriverError> {
        match command {
            Command::FindElement { strategy, selector } => {
                let id = session.find_element(strategy, selector).await?;
                Ok(json!({ "ELEMENT": id }))
            }
            Command::FindElements { strategy, selector } => {
                let ids = session.find_elements(strategy, selector).await?;
                Ok(Value::Array(ids.into_iter().map(|id| json!({ "ELEMENT": id })).collect()))
            }
            Command::GetText { element } => Ok(Value::String(session.element_text(element)?)),
            Command::GetLocation { element } => session.element_location(element),
            Command::GetSize { element } => session.element_size(element),
            Command::Click { element } => {
                session.click(element).await?;
                Ok(Value::Null)
            }
            Command::GetPageSource => Ok(Value::String(session.page_source().await?)),
            Command::UpdateSettings { settings } => {
                let updated = session.update_settings(settings.clone());
                Ok(serde_json::to_value(updated).unwrap_or(Value::Null))
            }
            Command::GetSettings => {
                Ok(serde_json::to_value(session.settings()).unwrap_or(Value::Null))
            }
            Command::GetContexts => Ok(json!(session.contexts().await?)),
            Command::GetCurrentContext => Ok(Value::String(session.current_context_name())),
            Command::SetContext { name } => {
                session.switch_context(name).await?;
                Ok(Value::Null)
            }
            Command::Screenshot => Ok(Value::String(session.screenshot().await?)),
            Command::PerformTouch { actions } => {
                let report = session.perform_touch(actions).await?;
                Ok(serde_json::to_value(report).unwrap_or(Value::Null))
            }
            Command::PerformMultiAction { actions } => {
                let report = session.perform_multi_action(actions).await?;
                Ok(serde_json::to_value(report).unwrap_or(Value::Null))
            }
            Command::TouchDrag { gestures } => {
                let report = session.perform_drag(gestures).await?;
                Ok(serde_json::to_value(report).unwrap_or(Value::Null))
            }
            Command::StartActivity {
                app_package,
                app_activity,
            } => {
                session.start_activity(app_package, app_activity).await?;
                Ok(Value::Null)
            }
            Command::Fingerprint { finger_id } => {
                session.fingerprint(*finger_id).await?;
                Ok(Value::Null)
            }
            Command::SendSms {
                phone_number,
                message,
            } => {
                session.send_sms(phone_number, message).await?;
                Ok(Value::Null)
            }
            Command::SensorSet { sensor_type, value } => {
                session.sensor_set(sensor_type, value).await?;
                Ok(Value::Null)
            }
            Command::Raw { method, path, .. } => Err(DriverError::UnsupportedOperation(format!(
                "'{} {}' is only available in a web context",
                method, path
            ))),
        }
    }
}
