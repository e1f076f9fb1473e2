//! Session commands and the command log.
//!
//! [`Command`] is the JSON command surface a client submits against a
//! session. Every command also has a remote-protocol route
//! ([`Command::route`]) which the proxy router matches against the session's
//! avoid list, and a request body ([`Command::wire_body`]) used when the
//! command is forwarded to a secondary driver.
//!
//! Executed commands are recorded as [`CommandLog`] entries.
//!
//! # Example
//!
//! ```
//! use droidpilot_core::command::{Command, CommandLog, CommandResult};
//!
//! let command = Command::FindElement {
//!     strategy: "accessibility id".to_string(),
//!     selector: "Animation".to_string(),
//! };
//! let log = CommandLog::new(command, CommandResult::Success, None);
//! println!("{} at {}", log.command.name(), log.timestamp);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::gesture::{DragPoint, GestureAction};
use crate::secondary::HttpMethod;

/// The result of executing a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandResult {
    /// The command completed successfully.
    Success,

    /// The command failed with the given error message.
    Failure(String),
}

/// Runtime settings adjustable during a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Compress the hierarchy dump by dropping unimportant views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_unimportant_views: Option<bool>,
}

/// Commands that can be executed against a session.
///
/// Serialized as JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Find the first element matching a locator.
    FindElement {
        /// Locator strategy (`id`, `accessibility id`, `class name`, `text`).
        strategy: String,
        /// Locator value.
        selector: String,
    },

    /// Find every element matching a locator.
    FindElements {
        /// Locator strategy.
        strategy: String,
        /// Locator value.
        selector: String,
    },

    /// Visible text of a found element.
    GetText {
        /// Element id.
        element: String,
    },

    /// Top-left corner of a found element.
    GetLocation {
        /// Element id.
        element: String,
    },

    /// Size of a found element.
    GetSize {
        /// Element id.
        element: String,
    },

    /// Tap the center of a found element.
    Click {
        /// Element id.
        element: String,
    },

    /// Dump the UI hierarchy.
    GetPageSource,

    /// Change runtime settings.
    UpdateSettings {
        /// Settings to apply; unset fields are left alone.
        settings: Settings,
    },

    /// Current runtime settings.
    GetSettings,

    /// Available contexts.
    GetContexts,

    /// Active context.
    GetCurrentContext,

    /// Switch context.
    SetContext {
        /// Context name.
        name: String,
    },

    /// Capture the screen (base64 PNG).
    Screenshot,

    /// Perform one touch sequence.
    PerformTouch {
        /// Ordered actions.
        actions: Vec<GestureAction>,
    },

    /// Perform several touch sequences concurrently.
    PerformMultiAction {
        /// One action sequence per finger.
        actions: Vec<Vec<GestureAction>>,
    },

    /// Drag between two points, each an element, coordinates, or both.
    TouchDrag {
        /// Start and end point.
        gestures: Vec<DragPoint>,
    },

    /// Launch an activity of an installed package.
    StartActivity {
        /// Package id.
        app_package: String,
        /// Activity, relative (`.Main`) or fully qualified.
        app_activity: String,
    },

    /// Emulator only: touch the fingerprint sensor.
    Fingerprint {
        /// Enrolled finger id.
        finger_id: u32,
    },

    /// Emulator only: deliver an SMS.
    SendSms {
        /// Sender number.
        phone_number: String,
        /// Message text.
        message: String,
    },

    /// Emulator only: override a sensor.
    SensorSet {
        /// Sensor name (e.g. `acceleration`).
        sensor_type: String,
        /// Sensor value.
        value: String,
    },

    /// Any other remote-protocol call. Only valid in a web context.
    Raw {
        /// HTTP verb.
        method: HttpMethod,
        /// Route relative to the session (e.g. `/url`).
        path: String,
        /// Request body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Command {
    /// Returns a short, static name for this command suitable for use in
    /// tracing span metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Command::FindElement { .. } => "find_element",
            Command::FindElements { .. } => "find_elements",
            Command::GetText { .. } => "get_text",
            Command::GetLocation { .. } => "get_location",
            Command::GetSize { .. } => "get_size",
            Command::Click { .. } => "click",
            Command::GetPageSource => "get_page_source",
            Command::UpdateSettings { .. } => "update_settings",
            Command::GetSettings => "get_settings",
            Command::GetContexts => "get_contexts",
            Command::GetCurrentContext => "get_current_context",
            Command::SetContext { .. } => "set_context",
            Command::Screenshot => "screenshot",
            Command::PerformTouch { .. } => "perform_touch",
            Command::PerformMultiAction { .. } => "perform_multi_action",
            Command::TouchDrag { .. } => "touch_drag",
            Command::StartActivity { .. } => "start_activity",
            Command::Fingerprint { .. } => "fingerprint",
            Command::SendSms { .. } => "send_sms",
            Command::SensorSet { .. } => "sensor_set",
            Command::Raw { .. } => "raw",
        }
    }

    /// The remote-protocol route of this command in `session_id`.
    pub fn route(&self, session_id: &str) -> (HttpMethod, String) {
        let base = format!("/session/{}", session_id);
        let (method, suffix) = match self {
            Command::FindElement { .. } => (HttpMethod::Post, "/element".to_string()),
            Command::FindElements { .. } => (HttpMethod::Post, "/elements".to_string()),
            Command::GetText { element } => (HttpMethod::Get, format!("/element/{}/text", element)),
            Command::GetLocation { element } => {
                (HttpMethod::Get, format!("/element/{}/location", element))
            }
            Command::GetSize { element } => (HttpMethod::Get, format!("/element/{}/size", element)),
            Command::Click { element } => (HttpMethod::Post, format!("/element/{}/click", element)),
            Command::GetPageSource => (HttpMethod::Get, "/source".to_string()),
            Command::UpdateSettings { .. } => (HttpMethod::Post, "/appium/settings".to_string()),
            Command::GetSettings => (HttpMethod::Get, "/appium/settings".to_string()),
            Command::GetContexts => (HttpMethod::Get, "/contexts".to_string()),
            Command::GetCurrentContext => (HttpMethod::Get, "/context".to_string()),
            Command::SetContext { .. } => (HttpMethod::Post, "/context".to_string()),
            Command::Screenshot => (HttpMethod::Get, "/screenshot".to_string()),
            Command::PerformTouch { .. } => (HttpMethod::Post, "/touch/perform".to_string()),
            Command::PerformMultiAction { .. } => {
                (HttpMethod::Post, "/touch/multi/perform".to_string())
            }
            Command::TouchDrag { .. } => (HttpMethod::Post, "/touch/drag".to_string()),
            Command::StartActivity { .. } => {
                (HttpMethod::Post, "/appium/device/start_activity".to_string())
            }
            Command::Fingerprint { .. } => {
                (HttpMethod::Post, "/appium/device/finger_print".to_string())
            }
            Command::SendSms { .. } => (HttpMethod::Post, "/appium/device/send_sms".to_string()),
            Command::SensorSet { .. } => {
                (HttpMethod::Post, "/appium/device/sensor_set".to_string())
            }
            Command::Raw { method, path, .. } => {
                (*method, path.clone())
            }
        };
        (method, base + &suffix)
    }

    /// Request body used when the command is forwarded.
    pub fn wire_body(&self) -> Option<Value> {
        match self {
            Command::FindElement { strategy, selector }
            | Command::FindElements { strategy, selector } => Some(json!({
                "using": strategy,
                "value": selector,
            })),
            Command::Click { .. } => Some(json!({})),
            Command::Raw { body, .. } => body.clone(),
            _ => None,
        }
    }
}

/// A logged command with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
    /// Unique identifier for this log entry.
    pub id: Uuid,

    /// When the command was executed.
    pub timestamp: DateTime<Utc>,

    /// The command that was executed.
    pub command: Command,

    /// The result of the command.
    pub result: CommandResult,

    /// True when the command was forwarded to a secondary driver.
    #[serde(default)]
    pub proxied: bool,

    /// How long the command took in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl CommandLog {
    /// Creates a new log entry stamped with the current time.
    pub fn new(command: Command, result: CommandResult, duration_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            command,
            result,
            proxied: false,
            duration_ms,
        }
    }

    /// Marks the entry as forwarded.
    pub fn proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization_tag() {
        let cmd = Command::SendSms {
            phone_number: "5551234567".into(),
            message: "hi".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "sendSms");
        assert_eq!(json["phone_number"], "5551234567");

        let parsed: Command = serde_json::from_str(r#"{"type": "getPageSource"}"#).unwrap();
        assert_eq!(parsed, Command::GetPageSource);
    }

    #[test]
    fn test_routes() {
        let (method, path) = Command::Screenshot.route("abc");
        assert_eq!(method, HttpMethod::Get);
        assert_eq!(path, "/session/abc/screenshot");

        let (method, path) = Command::GetText {
            element: "e1".into(),
        }
        .route("abc");
        assert_eq!(method, HttpMethod::Get);
        assert_eq!(path, "/session/abc/element/e1/text");

        let raw = Command::Raw {
            method: HttpMethod::Post,
            path: "/url".into(),
            body: Some(json!({"url": "https://example.com"})),
        };
        assert_eq!(raw.route("abc").1, "/session/abc/url");
        assert_eq!(raw.wire_body().unwrap()["url"], "https://example.com");
    }

    #[test]
    fn test_find_body_uses_protocol_names() {
        let cmd = Command::FindElement {
            strategy: "css selector".into(),
            selector: "#login".into(),
        };
        assert_eq!(
            cmd.wire_body().unwrap(),
            json!({"using": "css selector", "value": "#login"})
        );
    }

    #[test]
    fn test_log_entry() {
        let log = CommandLog::new(Command::GetContexts, CommandResult::Success, Some(12)).proxied(true);
        assert!(log.proxied);
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("\"duration_ms\":12"));
    }
}
