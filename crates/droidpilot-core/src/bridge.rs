//! Device bridge trait for backend-agnostic device control.
//!
//! This module defines the [`DeviceBridge`] trait, the narrow contract the
//! session layer requires of a connected device: shell execution, file
//! pushes, package management, platform metadata, animation and hidden-API
//! policy toggles, log capture, UI hierarchy dumps and raw pointer events.
//!
//! [`AdbBridge`](crate::adb::AdbBridge) implements it over the `adb`
//! executable. Tests substitute a recording fake.
//!
//! Bridges are created by a [`DeviceBridgeFactory`], which is the only way
//! the session manager acquires a device.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to a device.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A device command ran but reported failure.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// No matching device is connected.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Every matching device is already held by another session.
    #[error("Device busy: {0}")]
    InUse(String),

    /// The operation did not finish in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Output from the device could not be parsed.
    #[error("Unexpected output: {0}")]
    Parse(String),

    /// An I/O error occurred (spawning the bridge executable, files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the caller wants a device selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Serial of a specific device.
    pub udid: Option<String>,
    /// Name of a running virtual device.
    pub avd: Option<String>,
    /// Port of the adb server, when not the default.
    pub adb_port: Option<u16>,
}

/// Platform metadata read at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device model (e.g. `Pixel 7`).
    pub device_model: String,
    /// Device manufacturer.
    pub device_manufacturer: String,
    /// OS version string (e.g. `13`).
    pub platform_version: String,
    /// Screen size as `WIDTHxHEIGHT`.
    pub device_screen_size: String,
    /// Platform API level.
    pub device_api_level: u32,
}

/// Phase of a single-pointer touch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerPhase {
    /// Contact starts.
    Down,
    /// Contact moves.
    Move,
    /// Contact ends.
    Up,
}

/// A low-level pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    /// Index of the simulated finger.
    pub pointer: usize,
    /// Event phase.
    pub phase: PointerPhase,
    /// X coordinate in device pixels.
    pub x: f64,
    /// Y coordinate in device pixels.
    pub y: f64,
}

/// Contract the session layer requires of a connected device.
///
/// All methods are async; implementations talk to the device over I/O and
/// are the main suspension points of a command.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Serial of the device this bridge is bound to.
    fn serial(&self) -> &str;

    /// Run a shell command on the device and return its standard output.
    async fn shell(&self, args: &[&str]) -> Result<String, DeviceError>;

    /// Copy a local file to the device.
    async fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    /// Install (or replace) an application package.
    async fn install(&self, apk: &Path) -> Result<(), DeviceError>;

    /// Uninstall a package. Returns `false` when it was not installed.
    async fn uninstall(&self, package: &str) -> Result<bool, DeviceError>;

    /// True when the package is installed.
    async fn is_installed(&self, package: &str) -> Result<bool, DeviceError>;

    /// Force-stop a running package.
    async fn force_stop(&self, package: &str) -> Result<(), DeviceError>;

    /// Clear a package's data.
    async fn clear_data(&self, package: &str) -> Result<(), DeviceError>;

    /// Launch an activity.
    async fn start_app(&self, package: &str, activity: Option<&str>) -> Result<(), DeviceError>;

    /// Platform API level.
    async fn api_level(&self) -> Result<u32, DeviceError>;

    /// OS version string.
    async fn platform_version(&self) -> Result<String, DeviceError>;

    /// Device model.
    async fn model(&self) -> Result<String, DeviceError>;

    /// Device manufacturer.
    async fn manufacturer(&self) -> Result<String, DeviceError>;

    /// Screen size as `WIDTHxHEIGHT`.
    async fn screen_size(&self) -> Result<String, DeviceError>;

    /// True when any window animation scale is non-zero.
    async fn is_animation_on(&self) -> Result<bool, DeviceError>;

    /// Turn window animations on or off.
    async fn set_animation_state(&self, on: bool) -> Result<(), DeviceError>;

    /// Relax the hidden-API policy so settings can be toggled.
    async fn set_hidden_api_policy(&self, value: &str) -> Result<(), DeviceError>;

    /// Restore the default hidden-API policy.
    async fn set_default_hidden_api_policy(&self) -> Result<(), DeviceError>;

    /// Currently selected input method.
    async fn default_ime(&self) -> Result<Option<String>, DeviceError>;

    /// Enable and select an input method.
    async fn set_ime(&self, ime: &str) -> Result<(), DeviceError>;

    /// Start capturing device logs.
    async fn start_logcat(&self) -> Result<(), DeviceError>;

    /// Stop capturing device logs. Must be safe to call when not started.
    async fn stop_logcat(&self) -> Result<(), DeviceError>;

    /// Dump the UI hierarchy as XML.
    async fn dump_hierarchy(&self, compressed: bool) -> Result<String, DeviceError>;

    /// Capture the screen as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError>;

    /// Inject one pointer event.
    async fn pointer_event(&self, event: &PointerEvent) -> Result<(), DeviceError>;

    /// How many pointers can be down at once.
    fn max_pointers(&self) -> usize {
        usize::MAX
    }

    /// True when the keyguard is showing.
    async fn is_screen_locked(&self) -> Result<bool, DeviceError>;

    /// Wake the screen and dismiss an insecure keyguard.
    async fn unlock(&self) -> Result<(), DeviceError>;

    /// Emulator console: touch the fingerprint sensor.
    async fn fingerprint(&self, finger_id: u32) -> Result<(), DeviceError>;

    /// Emulator console: deliver an SMS.
    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<(), DeviceError>;

    /// Emulator console: override a sensor value.
    async fn sensor_set(&self, sensor: &str, value: &str) -> Result<(), DeviceError>;

    /// Release the device. Called once at the end of teardown.
    async fn release(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Creates device bridges for new sessions.
#[async_trait]
pub trait DeviceBridgeFactory: Send + Sync {
    /// Select and connect to a device.
    async fn acquire(&self, request: &DeviceRequest) -> Result<Arc<dyn DeviceBridge>, DeviceError>;
}

/// Reads the platform metadata reported at session start.
pub async fn read_device_info(bridge: &dyn DeviceBridge) -> Result<DeviceInfo, DeviceError> {
    Ok(DeviceInfo {
        device_model: bridge.model().await?,
        device_manufacturer: bridge.manufacturer().await?,
        platform_version: bridge.platform_version().await?,
        device_screen_size: bridge.screen_size().await?,
        device_api_level: bridge.api_level().await?,
    })
}

/// Lists third-party packages, skipping `exclude`.
///
/// Parses `pm list packages -3` output (`package:<id>` per line). A failing
/// listing yields an empty list.
pub async fn third_party_packages(bridge: &dyn DeviceBridge, exclude: &[&str]) -> Vec<String> {
    match bridge.shell(&["pm", "list", "packages", "-3"]).await {
        Ok(output) => parse_package_list(&output)
            .into_iter()
            .filter(|pkg| !exclude.contains(&pkg.as_str()))
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "could not list third-party packages");
            Vec::new()
        }
    }
}

fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|pkg| pkg.trim().to_string())
        .filter(|pkg| !pkg.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PM_OUTPUT: &str = "package:app.bundle.id1\npackage:io.droidpilot.settings\npackage:io.droidpilot.uiautomator2.server\npackage:io.droidpilot.uiautomator2.server.test\n";

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::CommandFailed("exit 1".to_string());
        assert!(err.to_string().contains("exit 1"));

        let err = DeviceError::NotFound("emulator-5554".to_string());
        assert!(err.to_string().contains("emulator-5554"));
    }

    #[test]
    fn test_parse_package_list() {
        assert_eq!(
            parse_package_list(PM_OUTPUT),
            vec![
                "app.bundle.id1",
                "io.droidpilot.settings",
                "io.droidpilot.uiautomator2.server",
                "io.droidpilot.uiautomator2.server.test",
            ]
        );
        assert!(parse_package_list("").is_empty());
        assert!(parse_package_list("garbage\n").is_empty());
    }

    #[test]
    fn test_pointer_event_serializes_lowercase_phase() {
        let event = PointerEvent {
            pointer: 0,
            phase: PointerPhase::Down,
            x: 1.0,
            y: 2.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""phase":"down""#));
    }
}
