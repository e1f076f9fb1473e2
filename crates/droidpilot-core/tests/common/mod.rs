//! Shared test helpers for droidpilot-core integration tests.
//!
//! Provides a recording fake device, a scripted secondary driver factory and
//! a fake app helper, plus a manager wired to all three.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use droidpilot_core::app_helper::{render_shared_prefs, AppHelper};
use droidpilot_core::bridge::{
    DeviceBridge, DeviceBridgeFactory, DeviceError, DeviceRequest, PointerEvent, PointerPhase,
};
use droidpilot_core::capabilities::SharedPreferences;
use droidpilot_core::error::DriverError;
use droidpilot_core::manager::SessionManager;
use droidpilot_core::secondary::{
    HttpMethod, ProxyError, SecondaryDriver, SecondaryDriverConfig, SecondaryDriverFactory,
};

// ---------------------------------------------------------------------------
// Fake device
// ---------------------------------------------------------------------------

/// A device that records every call as a short string.
///
/// Calls that only read state are recorded too, so tests filter with
/// [`FakeDevice::calls_matching`].
pub struct FakeDevice {
    serial: String,
    api_level: AtomicU32,
    animation_on: AtomicBool,
    locked: AtomicBool,
    max_pointers: AtomicUsize,
    installed: Mutex<HashSet<String>>,
    third_party: Mutex<Vec<String>>,
    hierarchy: Mutex<String>,
    proc_net_unix: Mutex<String>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.to_string(),
            api_level: AtomicU32::new(30),
            animation_on: AtomicBool::new(true),
            locked: AtomicBool::new(false),
            max_pointers: AtomicUsize::new(usize::MAX),
            installed: Mutex::new(HashSet::new()),
            third_party: Mutex::new(Vec::new()),
            hierarchy: Mutex::new(sample_hierarchy()),
            proc_net_unix: Mutex::new(String::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_api_level(&self, level: u32) {
        self.api_level.store(level, Ordering::SeqCst);
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn set_max_pointers(&self, max: usize) {
        self.max_pointers.store(max, Ordering::SeqCst);
    }

    pub fn set_installed(&self, package: &str) {
        self.installed.lock().unwrap().insert(package.to_string());
    }

    pub fn set_third_party(&self, packages: &[&str]) {
        *self.third_party.lock().unwrap() = packages.iter().map(|p| p.to_string()).collect();
    }

    pub fn set_hierarchy(&self, xml: &str) {
        *self.hierarchy.lock().unwrap() = xml.to_string();
    }

    pub fn set_proc_net_unix(&self, content: &str) {
        *self.proc_net_unix.lock().unwrap() = content.to_string();
    }

    /// Makes every call named `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls_matching(prefix).len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Pointer events dispatched so far, in order.
    pub fn pointer_events(&self) -> Vec<String> {
        self.calls_matching("pointer ")
    }

    fn record(&self, op: &'static str, detail: String) -> Result<(), DeviceError> {
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        };
        self.calls.lock().unwrap().push(entry);
        if self.failing.lock().unwrap().contains(op) {
            return Err(DeviceError::CommandFailed(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        self.record("shell", args.join(" "))?;
        Ok(match args {
            ["cat", "/proc/net/unix"] => self.proc_net_unix.lock().unwrap().clone(),
            ["ps", ..] => "PID NAME\n4242 io.example.shop\n".to_string(),
            ["pm", "list", "packages", "-3"] => self
                .third_party
                .lock()
                .unwrap()
                .iter()
                .map(|p| format!("package:{}\n", p))
                .collect(),
            _ => String::new(),
        })
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        self.record("push", format!("{} {}", local.display(), remote))
    }

    async fn install(&self, apk: &Path) -> Result<(), DeviceError> {
        self.record("install", apk.display().to_string())
    }

    async fn uninstall(&self, package: &str) -> Result<bool, DeviceError> {
        self.record("uninstall", package.to_string())?;
        Ok(self.installed.lock().unwrap().remove(package))
    }

    async fn is_installed(&self, package: &str) -> Result<bool, DeviceError> {
        self.record("is_installed", package.to_string())?;
        Ok(self.installed.lock().unwrap().contains(package))
    }

    async fn force_stop(&self, package: &str) -> Result<(), DeviceError> {
        self.record("force_stop", package.to_string())
    }

    async fn clear_data(&self, package: &str) -> Result<(), DeviceError> {
        self.record("clear_data", package.to_string())
    }

    async fn start_app(&self, package: &str, activity: Option<&str>) -> Result<(), DeviceError> {
        self.record("start_app", format!("{} {}", package, activity.unwrap_or("-")))
    }

    async fn api_level(&self) -> Result<u32, DeviceError> {
        Ok(self.api_level.load(Ordering::SeqCst))
    }

    async fn platform_version(&self) -> Result<String, DeviceError> {
        Ok("11".to_string())
    }

    async fn model(&self) -> Result<String, DeviceError> {
        Ok("Pixel 4".to_string())
    }

    async fn manufacturer(&self) -> Result<String, DeviceError> {
        Ok("Google".to_string())
    }

    async fn screen_size(&self) -> Result<String, DeviceError> {
        Ok("1080x2280".to_string())
    }

    async fn is_animation_on(&self) -> Result<bool, DeviceError> {
        Ok(self.animation_on.load(Ordering::SeqCst))
    }

    async fn set_animation_state(&self, on: bool) -> Result<(), DeviceError> {
        self.record("set_animation_state", on.to_string())?;
        self.animation_on.store(on, Ordering::SeqCst);
        Ok(())
    }

    async fn set_hidden_api_policy(&self, value: &str) -> Result<(), DeviceError> {
        self.record("set_hidden_api_policy", value.to_string())
    }

    async fn set_default_hidden_api_policy(&self) -> Result<(), DeviceError> {
        self.record("set_default_hidden_api_policy", String::new())
    }

    async fn default_ime(&self) -> Result<Option<String>, DeviceError> {
        Ok(Some("com.android.inputmethod.latin/.LatinIME".to_string()))
    }

    async fn set_ime(&self, ime: &str) -> Result<(), DeviceError> {
        self.record("set_ime", ime.to_string())
    }

    async fn start_logcat(&self) -> Result<(), DeviceError> {
        self.record("start_logcat", String::new())
    }

    async fn stop_logcat(&self) -> Result<(), DeviceError> {
        self.record("stop_logcat", String::new())
    }

    async fn dump_hierarchy(&self, compressed: bool) -> Result<String, DeviceError> {
        self.record("dump_hierarchy", compressed.to_string())?;
        Ok(self.hierarchy.lock().unwrap().clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        self.record("screenshot", String::new())?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn pointer_event(&self, event: &PointerEvent) -> Result<(), DeviceError> {
        let phase = match event.phase {
            PointerPhase::Down => "down",
            PointerPhase::Move => "move",
            PointerPhase::Up => "up",
        };
        self.record(
            "pointer",
            format!("{} {} {} {}", event.pointer, phase, event.x, event.y),
        )
    }

    fn max_pointers(&self) -> usize {
        self.max_pointers.load(Ordering::SeqCst)
    }

    async fn is_screen_locked(&self) -> Result<bool, DeviceError> {
        Ok(self.locked.load(Ordering::SeqCst))
    }

    async fn unlock(&self) -> Result<(), DeviceError> {
        self.record("unlock", String::new())?;
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fingerprint(&self, finger_id: u32) -> Result<(), DeviceError> {
        self.record("fingerprint", finger_id.to_string())
    }

    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<(), DeviceError> {
        self.record("send_sms", format!("{} {}", phone_number, message))
    }

    async fn sensor_set(&self, sensor: &str, value: &str) -> Result<(), DeviceError> {
        self.record("sensor_set", format!("{} {}", sensor, value))
    }

    async fn release(&self) -> Result<(), DeviceError> {
        self.record("release", String::new())
    }
}

/// Always hands out the same fake device.
pub struct FakeDeviceFactory {
    pub device: Arc<FakeDevice>,
    pub requests: Mutex<Vec<DeviceRequest>>,
}

impl FakeDeviceFactory {
    pub fn new(device: Arc<FakeDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeviceBridgeFactory for FakeDeviceFactory {
    async fn acquire(&self, request: &DeviceRequest) -> Result<Arc<dyn DeviceBridge>, DeviceError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.device.clone())
    }
}

/// `/proc/net/unix` exposing the devtools socket of pid 4242, which `ps`
/// reports as `io.example.shop`.
pub const SHOP_WEBVIEW_SOCKETS: &str = "Num       RefCount Protocol Flags    Type St Inode Path\n\
0000000000000000: 00000002 00000000 00010000 0001 01 12345 @webview_devtools_remote_4242\n";

/// A small UI hierarchy with two buttons and a text field.
pub fn sample_hierarchy() -> String {
    r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="io.example.shop" content-desc="" bounds="[0,0][1080,2280]">
    <node index="0" text="Buy now" resource-id="io.example.shop:id/buy" class="android.widget.Button" package="io.example.shop" content-desc="buy-button" bounds="[100,200][300,260]" />
    <node index="1" text="Cancel" resource-id="io.example.shop:id/cancel" class="android.widget.Button" package="io.example.shop" content-desc="cancel-button" bounds="[400,200][600,260]" />
    <node index="2" text="Tom &amp; Jerry" resource-id="io.example.shop:id/name" class="android.widget.EditText" package="io.example.shop" content-desc="" bounds="[100,400][980,480]" />
  </node>
</hierarchy>"#
        .to_string()
}

// ---------------------------------------------------------------------------
// Scripted secondary driver
// ---------------------------------------------------------------------------

/// Records forwarded commands; answers with the relative path.
pub struct ScriptedDriver {
    context: String,
    pub forwarded: Mutex<Vec<String>>,
    pub stopped: AtomicBool,
}

#[async_trait]
impl SecondaryDriver for ScriptedDriver {
    fn context(&self) -> &str {
        &self.context
    }

    fn port(&self) -> u16 {
        9515
    }

    async fn forward(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ProxyError> {
        self.forwarded
            .lock()
            .unwrap()
            .push(format!("{} {}", method, path));
        Ok(json!({ "path": path, "body": body }))
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails with `NoSuchContext` until `ready_after` attempts have been made.
pub struct ScriptedFactory {
    ready_after: Option<u32>,
    pub attempts: AtomicU32,
    pub configs: Mutex<Vec<SecondaryDriverConfig>>,
    pub drivers: Mutex<Vec<Arc<ScriptedDriver>>>,
}

impl ScriptedFactory {
    /// Attaches on the first attempt.
    pub fn ready() -> Arc<Self> {
        Self::ready_after(Some(1))
    }

    /// Never attaches.
    pub fn never() -> Arc<Self> {
        Self::ready_after(None)
    }

    /// Attaches on attempt `n` (1-based), or never for `None`.
    pub fn ready_after(n: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            ready_after: n,
            attempts: AtomicU32::new(0),
            configs: Mutex::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_driver(&self) -> Option<Arc<ScriptedDriver>> {
        self.drivers.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SecondaryDriverFactory for ScriptedFactory {
    async fn start(
        &self,
        config: &SecondaryDriverConfig,
    ) -> Result<Arc<dyn SecondaryDriver>, DriverError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.configs.lock().unwrap().push(config.clone());
        match self.ready_after {
            Some(n) if attempt >= n => {
                let driver = Arc::new(ScriptedDriver {
                    context: config.context.clone(),
                    forwarded: Mutex::new(Vec::new()),
                    stopped: AtomicBool::new(false),
                });
                self.drivers.lock().unwrap().push(driver.clone());
                Ok(driver)
            }
            _ => Err(DriverError::NoSuchContext(format!(
                "{} is not rendered yet (attempt {})",
                config.context, attempt
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake app helper
// ---------------------------------------------------------------------------

/// Accepts any reference with the right extension without touching disk,
/// except for shared preferences which are written to a temp dir.
pub struct FakeApps {
    work_dir: PathBuf,
    pub configured: Mutex<Vec<String>>,
}

impl FakeApps {
    pub fn new() -> Arc<Self> {
        let work_dir = std::env::temp_dir().join(format!("droidpilot-test-{}", unique_session_name()));
        std::fs::create_dir_all(&work_dir).unwrap();
        Arc::new(Self {
            work_dir,
            configured: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AppHelper for FakeApps {
    async fn configure_app(&self, app: &str, extension: &str) -> Result<PathBuf, DriverError> {
        self.configured.lock().unwrap().push(app.to_string());
        if !app.ends_with(extension) {
            return Err(DriverError::Configuration(format!(
                "'{}' must have the extension {}",
                app, extension
            )));
        }
        Ok(PathBuf::from(app))
    }

    async fn build_shared_prefs(&self, prefs: &SharedPreferences) -> Result<PathBuf, DriverError> {
        let path = self.work_dir.join(format!("{}.xml", unique_session_name()));
        std::fs::write(&path, render_shared_prefs(&prefs.prefs))
            .map_err(|e| DriverError::Configuration(e.to_string()))?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything a manager-level test needs to inspect.
pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub device: Arc<FakeDevice>,
    pub devices: Arc<FakeDeviceFactory>,
    pub secondary: Arc<ScriptedFactory>,
    pub apps: Arc<FakeApps>,
}

/// A manager over a fake device with the given serial.
pub fn harness(serial: &str, secondary: Arc<ScriptedFactory>) -> Harness {
    let device = FakeDevice::new(serial);
    let devices = FakeDeviceFactory::new(device.clone());
    let apps = FakeApps::new();
    let log_dir = std::env::temp_dir().join("droidpilot-test-logs");
    let manager = SessionManager::new(devices.clone(), secondary.clone(), apps.clone())
        .with_log_dir(log_dir);
    Harness {
        manager: Arc::new(manager),
        device,
        devices,
        secondary,
        apps,
    }
}

/// Capabilities for an app already on the device.
pub fn package_caps(serial: &str) -> Value {
    json!({
        "platformName": "Android",
        "appium:udid": serial,
        "appium:appPackage": "io.example.shop",
        "appium:appActivity": ".MainActivity",
    })
}

// ---------------------------------------------------------------------------
// Unique session name
// ---------------------------------------------------------------------------

/// Generate a unique session name for test isolation.
///
/// Uses a UUID prefix to avoid collisions between concurrent test runs.
pub fn unique_session_name() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().to_string().replace('-', "")[..8]
    )
}
