//! Session state for Android automation.
//!
//! A [`Session`] binds one device to one client. It owns the device bridge
//! handle, the [`ProxyRouter`] with any secondary drivers, the element cache,
//! runtime flags recording what was changed on the device, and the command
//! [`SessionJournal`].
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Validating -> AcquiringDevice -> InstallingApp -> Starting -> Ready
//! Ready -> StoppingProxies -> ResettingApp -> ReleasingDevice -> Closed
//! ```
//!
//! Creation and teardown live in [`crate::lifecycle`]; native command handlers
//! live in [`crate::handlers`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::bridge::{DeviceBridge, DeviceInfo};
use crate::capabilities::Capabilities;
use crate::command::Settings;
use crate::element::ElementCache;
use crate::error::DriverError;
use crate::journal::SessionJournal;
use crate::proxy::ProxyRouter;
use crate::secondary::SecondaryDriverFactory;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed, nothing acquired.
    Created,
    /// Checking capabilities.
    Validating,
    /// Selecting and connecting to a device.
    AcquiringDevice,
    /// Installing or checking the app under test.
    InstallingApp,
    /// Applying device settings and launching.
    Starting,
    /// Accepting commands.
    Ready,
    /// Teardown: stopping secondary drivers.
    StoppingProxies,
    /// Teardown: restoring device settings and the app.
    ResettingApp,
    /// Teardown: stopping log capture and releasing the device.
    ReleasingDevice,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the session changed on the device and must undo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    /// Window animations were turned off by this session.
    pub animation_disabled: bool,
    /// IME that was selected before the unicode IME was swapped in.
    pub saved_ime: Option<String>,
    /// Log capture was started.
    pub logcat_started: bool,
}

/// One automation session bound to one device.
pub struct Session {
    id: String,
    pub(crate) caps: Capabilities,
    pub(crate) is_emulator: bool,
    state: SessionState,
    pub(crate) bridge: Option<Arc<dyn DeviceBridge>>,
    pub(crate) router: ProxyRouter,
    pub(crate) device_info: Option<DeviceInfo>,
    pub(crate) app_path: Option<PathBuf>,
    pub(crate) flags: RuntimeFlags,
    pub(crate) elements: ElementCache,
    pub(crate) settings: Settings,
    journal: SessionJournal,
}

impl Session {
    /// Creates a session in the `Created` state.
    ///
    /// The capability set is fixed from here on. Nothing is acquired until
    /// [`create`](Self::create) runs.
    pub fn new(
        id: impl Into<String>,
        caps: Capabilities,
        secondary: Arc<dyn SecondaryDriverFactory>,
        journal: SessionJournal,
    ) -> Self {
        let id = id.into();
        let is_emulator = caps.is_emulator();
        let settings = Settings {
            ignore_unimportant_views: Some(caps.ignore_unimportant_views),
        };
        Self {
            router: ProxyRouter::new(id.clone(), Vec::new(), secondary),
            id,
            caps,
            is_emulator,
            state: SessionState::Created,
            bridge: None,
            device_info: None,
            app_path: None,
            flags: RuntimeFlags::default(),
            elements: ElementCache::default(),
            settings,
            journal,
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The capability set the session was created with.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True when the device is an emulator.
    ///
    /// Before a device is acquired this reflects the capabilities only; once
    /// acquired it is recomputed from the actual serial.
    pub fn is_emulator(&self) -> bool {
        self.is_emulator
    }

    /// The context router.
    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    /// Mutable access to the context router.
    pub fn router_mut(&mut self) -> &mut ProxyRouter {
        &mut self.router
    }

    /// The command journal.
    pub fn journal(&self) -> &SessionJournal {
        &self.journal
    }

    /// What the session changed on the device.
    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// Device metadata, once acquired.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// API level of the device, or 0 before acquisition.
    pub fn api_level(&self) -> u32 {
        self.device_info.as_ref().map_or(0, |info| info.device_api_level)
    }

    /// The device bridge, if one was acquired.
    pub fn device(&self) -> Result<Arc<dyn DeviceBridge>, DriverError> {
        self.bridge
            .clone()
            .ok_or_else(|| DriverError::NoSuchSession(format!("{} has no device", self.id)))
    }

    /// Fails unless the session is ready for commands.
    pub fn ensure_ready(&self) -> Result<(), DriverError> {
        if self.state != SessionState::Ready {
            return Err(DriverError::NoSuchSession(format!(
                "{} is not ready (state {})",
                self.id, self.state
            )));
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        info!(session_id = %self.id, from = %self.state, state = %next, "session state");
        self.state = next;
    }

    /// Capabilities reported back to the client.
    ///
    /// The requested capabilities plus device metadata and
    /// `webStorageEnabled: false`.
    pub fn capabilities_json(&self) -> Value {
        let mut value = serde_json::to_value(&self.caps).unwrap_or_else(|_| json!({}));
        if let (Some(obj), Some(info)) = (value.as_object_mut(), &self.device_info) {
            if let Ok(Value::Object(device)) = serde_json::to_value(info) {
                obj.extend(device);
            }
        }
        if let Some(obj) = value.as_object_mut() {
            obj.retain(|_, v| !v.is_null());
            obj.insert("webStorageEnabled".to_string(), Value::Bool(false));
            if let Some(bridge) = &self.bridge {
                obj.insert("deviceUDID".to_string(), Value::String(bridge.serial().to_string()));
            }
        }
        value
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("is_emulator", &self.is_emulator)
            .field("bridge", &self.bridge.as_ref().map(|b| b.serial().to_string()))
            .field("router", &self.router)
            .field("flags", &self.flags)
            .finish()
    }
}
