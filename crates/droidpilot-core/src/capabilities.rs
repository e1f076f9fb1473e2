//! Session capabilities and their validation.
//!
//! Capabilities arrive as a JSON object, either a flat legacy object or a W3C
//! `{alwaysMatch, firstMatch}` envelope. Keys may carry the `appium:` vendor
//! prefix. [`Capabilities::from_json`] folds all of these into one typed
//! record; [`validate`] then checks it without touching any device.
//!
//! # Example
//!
//! ```
//! use droidpilot_core::capabilities::{validate, Capabilities};
//! use serde_json::json;
//!
//! let caps = Capabilities::from_json(&json!({
//!     "alwaysMatch": {
//!         "platformName": "Android",
//!         "appium:deviceName": "device",
//!         "appium:appPackage": "io.example.app"
//!     }
//! })).unwrap();
//! assert!(validate(&caps).is_ok());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::DriverError;

/// The only platform this driver automates.
pub const PLATFORM_NAME: &str = "Android";

/// Browser names that start a browser session instead of an app session.
pub const SUPPORTED_BROWSERS: &[&str] = &["chrome", "chromium", "chromebeta", "browser"];

/// Default time budget for the automatic web-context switch.
pub const DEFAULT_AUTO_WEBVIEW_TIMEOUT_MS: u64 = 2000;

const VENDOR_PREFIX: &str = "appium:";

/// A capability that accepts a single string, a list of strings, or a
/// JSON-encoded list inside a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    /// A single value (possibly a JSON-encoded array).
    One(String),
    /// An explicit list.
    Many(Vec<String>),
}

impl StringList {
    /// Flattens the value into a list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringList::Many(items) => items.clone(),
            StringList::One(raw) => {
                let trimmed = raw.trim();
                if trimmed.starts_with('[') {
                    if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
                        return items;
                    }
                }
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![trimmed.to_string()]
                }
            }
        }
    }

    /// True when any entry equals `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.to_vec().iter().any(|item| item == needle)
    }
}

/// Launch options handed to the browser driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChromeOptions {
    /// Browser command-line arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<StringList>,

    /// Any other option, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of a shared-preferences file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedPreference {
    /// Value type (`string`, `boolean`, `int`, `long`, `float`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Preference key.
    pub name: String,
    /// Preference value.
    pub value: Value,
}

/// Descriptor of a shared-preferences file to seed before launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedPreferences {
    /// File name without the `.xml` extension. Nothing is written when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Entries to write.
    #[serde(default)]
    pub prefs: Vec<SharedPreference>,
}

/// Typed capability record.
///
/// Every field is optional on the wire; the defaults are those of
/// [`Capabilities::default`]: all flags off except `auto_launch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    /// Must be `Android`, compared case-insensitively.
    pub platform_name: Option<String>,
    /// Free-form device name. Informational.
    pub device_name: Option<String>,
    /// Path or URL of the application package, or a package id already on the device.
    pub app: Option<String>,
    /// Package id of the application under test.
    pub app_package: Option<String>,
    /// Activity to launch.
    pub app_activity: Option<String>,
    /// Browser to automate instead of an app.
    pub browser_name: Option<String>,
    /// Uninstall and reinstall the app around the session.
    pub full_reset: bool,
    /// Clear app data before the session.
    pub fast_reset: bool,
    /// Leave app state untouched.
    pub no_reset: bool,
    /// Launch the app after installation. Default `true`.
    pub auto_launch: bool,
    /// Switch into the app's web view after launch.
    pub auto_webview: bool,
    /// Budget for the automatic web view switch, in milliseconds.
    pub auto_webview_timeout: Option<u64>,
    /// Turn window animations off for the duration of the session.
    pub disable_window_animation: bool,
    /// Take screenshots natively even in web contexts.
    pub native_web_screenshot: bool,
    /// Extra applications to install.
    pub other_apps: Option<StringList>,
    /// Packages to uninstall before the session (`*` for all third-party ones).
    pub uninstall_other_packages: Option<StringList>,
    /// Shared preferences to seed.
    pub shared_preferences: Option<SharedPreferences>,
    /// Port of the adb server.
    pub adb_port: Option<u16>,
    /// Name of the virtual device to use.
    pub avd: Option<String>,
    /// Serial of the device to use.
    pub udid: Option<String>,
    /// Browser driver options.
    #[serde(alias = "goog:chromeOptions")]
    pub chrome_options: Option<ChromeOptions>,
    /// Compress the UI hierarchy.
    pub ignore_unimportant_views: bool,
    /// Swap in the unicode input method.
    pub unicode_keyboard: bool,
    /// Restore the original input method at teardown.
    pub reset_keyboard: bool,
    /// Do not start log capture.
    pub skip_logcat_capture: bool,
    /// Do not force-stop the app at teardown.
    pub dont_stop_app_on_reset: bool,
    /// Leave a locked screen locked at session start.
    pub skip_unlock: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            platform_name: None,
            device_name: None,
            app: None,
            app_package: None,
            app_activity: None,
            browser_name: None,
            full_reset: false,
            fast_reset: false,
            no_reset: false,
            auto_launch: true,
            auto_webview: false,
            auto_webview_timeout: None,
            disable_window_animation: false,
            native_web_screenshot: false,
            other_apps: None,
            uninstall_other_packages: None,
            shared_preferences: None,
            adb_port: None,
            avd: None,
            udid: None,
            chrome_options: None,
            ignore_unimportant_views: false,
            unicode_keyboard: false,
            reset_keyboard: false,
            skip_logcat_capture: false,
            dont_stop_app_on_reset: false,
            skip_unlock: false,
        }
    }
}

impl Capabilities {
    /// Parses a flat object or a W3C `{alwaysMatch, firstMatch}` envelope.
    ///
    /// The first `firstMatch` entry is merged into `alwaysMatch`; a key present
    /// in both is rejected. `appium:` prefixes are stripped and unknown keys
    /// are ignored.
    pub fn from_json(raw: &Value) -> Result<Self, DriverError> {
        let obj = raw.as_object().ok_or_else(|| {
            DriverError::Configuration("capabilities must be a JSON object".to_string())
        })?;

        let merged = if obj.contains_key("alwaysMatch") || obj.contains_key("firstMatch") {
            let mut merged = obj
                .get("alwaysMatch")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let first = obj
                .get("firstMatch")
                .and_then(Value::as_array)
                .and_then(|entries| entries.first())
                .and_then(Value::as_object);
            if let Some(first) = first {
                for (key, value) in first {
                    if merged.contains_key(key) {
                        return Err(DriverError::Configuration(format!(
                            "'{}' is defined in both alwaysMatch and firstMatch",
                            key
                        )));
                    }
                    merged.insert(key.clone(), value.clone());
                }
            }
            merged
        } else {
            obj.clone()
        };

        let stripped: Map<String, Value> = merged
            .into_iter()
            .map(|(key, value)| match key.strip_prefix(VENDOR_PREFIX) {
                Some(bare) => (bare.to_string(), value),
                None => (key, value),
            })
            .collect();

        let caps: Capabilities = serde_json::from_value(Value::Object(stripped))
            .map_err(|e| DriverError::Configuration(format!("invalid capabilities: {}", e)))?;
        Ok(caps.normalized())
    }

    /// Moves a package-id `app` value into `app_package`.
    pub fn normalized(mut self) -> Self {
        if let Some(app) = self.app.as_deref() {
            if is_package_id(app) {
                info!(package = %app, "app capability names a package already on the device");
                self.app_package = Some(app.to_string());
                self.app = None;
            }
        }
        self
    }

    /// True when the target device is a virtual device.
    ///
    /// An explicit `avd` always means emulator; otherwise only a serial of the
    /// form `emulator-<port>` does. Any other serial is real hardware.
    pub fn is_emulator(&self) -> bool {
        if self.avd.is_some() {
            return true;
        }
        self.udid.as_deref().map_or(false, is_emulator_serial)
    }

    /// True when `browser_name` is one of [`SUPPORTED_BROWSERS`].
    pub fn has_supported_browser(&self) -> bool {
        self.browser_name
            .as_deref()
            .map_or(false, |name| browser_package(name).is_some())
    }

    /// True when the session automates a browser rather than an app.
    ///
    /// An `app` capability takes precedence over a browser name.
    pub fn is_browser_session(&self) -> bool {
        self.app.is_none() && self.has_supported_browser()
    }

    /// True when the browser's first-run prompt should be dismissed.
    pub fn should_dismiss_chrome_welcome(&self) -> bool {
        self.chrome_options
            .as_ref()
            .and_then(|opts| opts.args.as_ref())
            .map_or(false, |args| args.contains("--no-first-run"))
    }

    /// Extra application references to install.
    pub fn other_apps(&self) -> Vec<String> {
        self.other_apps.as_ref().map(StringList::to_vec).unwrap_or_default()
    }

    /// Packages to uninstall before the session.
    pub fn uninstall_other_packages(&self) -> Vec<String> {
        self.uninstall_other_packages
            .as_ref()
            .map(StringList::to_vec)
            .unwrap_or_default()
    }

    /// Auto-webview time budget in milliseconds.
    pub fn auto_webview_timeout_ms(&self) -> u64 {
        self.auto_webview_timeout
            .unwrap_or(DEFAULT_AUTO_WEBVIEW_TIMEOUT_MS)
    }
}

/// Maps a supported browser name to its `(package, activity)` pair.
pub fn browser_package(browser_name: &str) -> Option<(&'static str, &'static str)> {
    match browser_name.to_ascii_lowercase().as_str() {
        "chrome" => Some(("com.android.chrome", "com.google.android.apps.chrome.Main")),
        "chromium" => Some(("org.chromium.chrome.shell", ".ChromeShellActivity")),
        "chromebeta" => Some(("com.chrome.beta", "com.google.android.apps.chrome.Main")),
        "browser" => Some(("com.android.browser", "com.android.browser.BrowserActivity")),
        _ => None,
    }
}

/// True for serials of the form `emulator-<port>`.
pub fn is_emulator_serial(serial: &str) -> bool {
    serial
        .strip_prefix("emulator-")
        .map_or(false, |port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
}

/// True for dotted package identifiers such as `io.example.app`.
fn is_package_id(value: &str) -> bool {
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    let lower = value.to_ascii_lowercase();
    if [".apk", ".apks", ".zip"].iter().any(|ext| lower.ends_with(ext)) {
        return false;
    }
    let segments: Vec<&str> = value.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Validates a capability set.
///
/// Fails with [`DriverError::Configuration`] when the platform is missing or
/// not Android (case-insensitive), when reset flags conflict, or when none of
/// `app`, `appPackage` or a supported `browserName` is present. An `app`
/// together with a browser name is accepted.
pub fn validate(caps: &Capabilities) -> Result<(), DriverError> {
    match caps.platform_name.as_deref() {
        None => {
            return Err(DriverError::Configuration(
                "'platformName' capability is required".to_string(),
            ))
        }
        Some(name) if !name.eq_ignore_ascii_case(PLATFORM_NAME) => {
            return Err(DriverError::Configuration(format!(
                "platformName must be '{}', got '{}'",
                PLATFORM_NAME, name
            )))
        }
        Some(_) => {}
    }

    if caps.full_reset && caps.no_reset {
        return Err(DriverError::Configuration(
            "fullReset and noReset cannot both be enabled".to_string(),
        ));
    }

    if caps.app.is_none() && caps.app_package.is_none() && !caps.has_supported_browser() {
        let browser = caps
            .browser_name
            .as_deref()
            .map(|name| format!(" ('{}' is not a supported browser)", name))
            .unwrap_or_default();
        return Err(DriverError::Configuration(format!(
            "The desired capabilities must include either an app, appPackage or browserName{}",
            browser
        )));
    }

    if caps.app.is_some() && caps.browser_name.is_some() {
        info!(
            browser = ?caps.browser_name,
            "both app and browserName are set; the app takes precedence"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(value: Value) -> Capabilities {
        Capabilities::from_json(&value).unwrap()
    }

    fn assert_must_include(value: Value) {
        let err = validate(&caps(value)).unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
        assert!(err.to_string().contains("must include"), "{}", err);
    }

    #[test]
    fn test_rejects_missing_app_package_and_browser() {
        assert_must_include(json!({"platformName": "Android", "deviceName": "device"}));
        assert_must_include(json!({
            "platformName": "Android",
            "deviceName": "device",
            "browserName": "Netscape Navigator"
        }));
    }

    #[test]
    fn test_accepts_each_single_target() {
        for value in [
            json!({"platformName": "Android", "deviceName": "device", "app": "/path/to/some.apk"}),
            json!({"platformName": "Android", "deviceName": "device", "browserName": "Chrome"}),
            json!({"platformName": "Android", "deviceName": "device", "appPackage": "some.app.package"}),
        ] {
            assert!(validate(&caps(value.clone())).is_ok(), "{}", value);
        }
    }

    #[test]
    fn test_platform_name_casing_is_ignored() {
        for platform in ["AnDrOiD", "android", "ANDROID"] {
            assert!(validate(&caps(json!({
                "platformName": platform,
                "deviceName": "device",
                "app": "/path/to/some.apk"
            })))
            .is_ok());
            assert_must_include(json!({"platformName": platform, "deviceName": "device"}));
        }
    }

    #[test]
    fn test_app_and_browser_together_is_allowed() {
        assert!(validate(&caps(json!({
            "platformName": "Android",
            "deviceName": "device",
            "app": "/path/to/some.apk",
            "browserName": "iPhone"
        })))
        .is_ok());
    }

    #[test]
    fn test_unknown_capabilities_are_ignored() {
        assert!(validate(&caps(json!({
            "platformName": "Android",
            "deviceName": "device",
            "app": "/path/to/some.apk",
            "androidScreenshotPath": "/path/to/screenshotdir"
        })))
        .is_ok());
    }

    #[test]
    fn test_rejects_other_platform() {
        let err = validate(&caps(json!({"platformName": "iOS", "app": "/a.apk"}))).unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
    }

    #[test]
    fn test_w3c_envelope_and_vendor_prefix() {
        let caps = caps(json!({
            "firstMatch": [{"appium:adbPort": 1111}],
            "alwaysMatch": {
                "platformName": "Android",
                "appium:deviceName": "device",
                "appium:appPackage": "some.app.package",
                "appium:autoLaunch": false
            }
        }));
        assert_eq!(caps.adb_port, Some(1111));
        assert_eq!(caps.app_package.as_deref(), Some("some.app.package"));
        assert!(!caps.auto_launch);
    }

    #[test]
    fn test_duplicate_key_across_envelope_is_rejected() {
        let err = Capabilities::from_json(&json!({
            "firstMatch": [{"platformName": "Android"}],
            "alwaysMatch": {"platformName": "Android"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("both alwaysMatch and firstMatch"));
    }

    #[test]
    fn test_package_in_app_capability() {
        let caps = caps(json!({"platformName": "Android", "app": "some.app.package"}));
        assert!(caps.app.is_none());
        assert_eq!(caps.app_package.as_deref(), Some("some.app.package"));

        let caps = Capabilities::from_json(&json!({"app": "/path/to/some.apk"})).unwrap();
        assert_eq!(caps.app.as_deref(), Some("/path/to/some.apk"));
    }

    #[test]
    fn test_is_emulator() {
        let mut caps = Capabilities {
            avd: Some("Nexus_5X_Api_23".to_string()),
            ..Default::default()
        };
        assert!(caps.is_emulator());

        caps.avd = None;
        caps.udid = Some("emulator-5554".to_string());
        assert!(caps.is_emulator());

        caps.udid = Some("01234567889".to_string());
        assert!(!caps.is_emulator());

        caps.udid = Some("emulator-".to_string());
        assert!(!caps.is_emulator());

        caps.udid = None;
        assert!(!caps.is_emulator());
    }

    #[test]
    fn test_dismiss_chrome_welcome_detection() {
        let with_opts = |opts: Value| -> Capabilities {
            Capabilities::from_json(&json!({"chromeOptions": opts})).unwrap()
        };
        assert!(!Capabilities::default().should_dismiss_chrome_welcome());
        assert!(!with_opts(json!({})).should_dismiss_chrome_welcome());
        assert!(!with_opts(json!({"args": []})).should_dismiss_chrome_welcome());
        assert!(!with_opts(json!({"args": ["--disable-dinosaur-easter-egg"]}))
            .should_dismiss_chrome_welcome());
        assert!(with_opts(json!({"args": ["--no-first-run"]})).should_dismiss_chrome_welcome());
        assert!(with_opts(json!({"args": "--no-first-run"})).should_dismiss_chrome_welcome());

        let goog = Capabilities::from_json(&json!({
            "goog:chromeOptions": {"args": ["--no-first-run"]}
        }))
        .unwrap();
        assert!(goog.should_dismiss_chrome_welcome());
    }

    #[test]
    fn test_string_list_forms() {
        assert_eq!(
            StringList::One("app.bundle.id1".into()).to_vec(),
            vec!["app.bundle.id1"]
        );
        assert_eq!(
            StringList::One(r#"["a.b", "c.d"]"#.into()).to_vec(),
            vec!["a.b", "c.d"]
        );
        assert_eq!(
            StringList::Many(vec!["x.y".into()]).to_vec(),
            vec!["x.y"]
        );
    }

    #[test]
    fn test_browser_session_detection() {
        let caps = Capabilities {
            browser_name: Some("Chrome".to_string()),
            ..Default::default()
        };
        assert!(caps.is_browser_session());
        assert_eq!(
            browser_package("Chrome"),
            Some(("com.android.chrome", "com.google.android.apps.chrome.Main"))
        );

        let caps = Capabilities {
            browser_name: Some("Chrome".to_string()),
            app: Some("/a.apk".to_string()),
            ..Default::default()
        };
        assert!(!caps.is_browser_session());
    }
}
