//! [`DeviceBridge`] implementation over the `adb` executable.
//!
//! Every call spawns `adb [-P <port>] -s <serial> ...` through
//! `tokio::process`, so no call blocks the runtime. Emulator console
//! commands go through `adb emu`.
//!
//! [`AdbBridgeFactory`] hands each device to at most one session at a time:
//! a serial stays leased until the bridge holding it is released.
//!
//! # Example
//!
//! ```no_run
//! use droidpilot_core::adb::AdbBridgeFactory;
//! use droidpilot_core::bridge::{DeviceBridgeFactory, DeviceRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = AdbBridgeFactory::new("adb");
//! let bridge = factory.acquire(&DeviceRequest::default()).await?;
//! println!("API level {}", bridge.api_level().await?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::bridge::{
    DeviceBridge, DeviceBridgeFactory, DeviceError, DeviceRequest, PointerEvent, PointerPhase,
};
use crate::capabilities::is_emulator_serial;

const ANIMATION_SETTINGS: &[&str] = &[
    "window_animation_scale",
    "transition_animation_scale",
    "animator_duration_scale",
];

const HIDDEN_API_SETTINGS: &[&str] = &[
    "hidden_api_policy_pre_p_apps",
    "hidden_api_policy_p_apps",
    "hidden_api_policy",
];

const KEYGUARD_MARKERS: &[&str] = &[
    "mShowingLockscreen=true",
    "mDreamingLockscreen=true",
    "isStatusBarKeyguard=true",
    "mKeyguardShowing=true",
];

const KEYCODE_WAKEUP: &str = "224";
const KEYCODE_MENU: &str = "82";

type HeldSerials = Arc<std::sync::Mutex<HashSet<String>>>;

/// Exclusive claim on a device serial. Dropping it frees the serial.
#[derive(Debug)]
pub struct DeviceLease {
    serial: String,
    held: HeldSerials,
}

impl DeviceLease {
    /// Claims the first of `candidates` nobody holds yet.
    fn claim(held: &HeldSerials, candidates: &[String]) -> Option<Self> {
        let mut guard = held.lock().unwrap_or_else(PoisonError::into_inner);
        let serial = candidates.iter().find(|s| !guard.contains(*s))?.clone();
        guard.insert(serial.clone());
        Some(Self {
            serial,
            held: Arc::clone(held),
        })
    }

    /// The leased serial.
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut guard = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&self.serial);
    }
}

struct RawOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

async fn run_adb(adb: &Path, args: &[String]) -> Result<RawOutput, DeviceError> {
    trace!(?args, "adb");
    let output = Command::new(adb).args(args).output().await?;
    Ok(RawOutput {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn port_args(port: Option<u16>) -> Vec<String> {
    match port {
        Some(port) => vec!["-P".to_string(), port.to_string()],
        None => Vec::new(),
    }
}

/// A device reached through `adb`.
pub struct AdbBridge {
    adb: PathBuf,
    serial: String,
    port: Option<u16>,
    logcat: Mutex<Option<Child>>,
    lease: std::sync::Mutex<Option<DeviceLease>>,
}

impl AdbBridge {
    /// Creates a bridge bound to `serial`.
    pub fn new(adb: impl Into<PathBuf>, serial: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
            port,
            logcat: Mutex::new(None),
            lease: std::sync::Mutex::new(None),
        }
    }

    /// Holds `lease` until [`release`](DeviceBridge::release).
    pub fn with_lease(self, lease: DeviceLease) -> Self {
        *self.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
        self
    }

    fn args<S: AsRef<str>>(&self, rest: &[S]) -> Vec<String> {
        let mut args = port_args(self.port);
        args.push("-s".to_string());
        args.push(self.serial.clone());
        args.extend(rest.iter().map(|s| s.as_ref().to_string()));
        args
    }

    async fn run_bytes<S: AsRef<str>>(&self, rest: &[S]) -> Result<Vec<u8>, DeviceError> {
        let output = run_adb(&self.adb, &self.args(rest)).await?;
        if !output.success {
            return Err(DeviceError::CommandFailed(output.stderr));
        }
        Ok(output.stdout)
    }

    async fn run<S: AsRef<str>>(&self, rest: &[S]) -> Result<String, DeviceError> {
        let stdout = self.run_bytes(rest).await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn getprop(&self, prop: &str) -> Result<String, DeviceError> {
        Ok(self.shell(&["getprop", prop]).await?.trim().to_string())
    }

    async fn emu(&self, args: &[&str]) -> Result<(), DeviceError> {
        let mut rest = vec!["emu"];
        rest.extend_from_slice(args);
        let output = self.run(&rest).await?;
        if output.contains("KO") {
            return Err(DeviceError::CommandFailed(output.trim().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut rest = vec!["shell"];
        rest.extend_from_slice(args);
        self.run(&rest).await
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local = local.to_string_lossy();
        self.run(&["push", &*local, remote]).await?;
        Ok(())
    }

    async fn install(&self, apk: &Path) -> Result<(), DeviceError> {
        let apk = apk.to_string_lossy();
        let output = self.run(&["install", "-r", &*apk]).await?;
        if output.contains("Failure") {
            return Err(DeviceError::CommandFailed(output.trim().to_string()));
        }
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<bool, DeviceError> {
        let output = run_adb(&self.adb, &self.args(&["uninstall", package])).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("Success") {
            return Ok(true);
        }
        if !output.success && !output.stderr.contains("Unknown package") {
            return Err(DeviceError::CommandFailed(output.stderr));
        }
        Ok(false)
    }

    async fn is_installed(&self, package: &str) -> Result<bool, DeviceError> {
        let output = run_adb(&self.adb, &self.args(&["shell", "pm", "path", package])).await?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("package:"))
    }

    async fn force_stop(&self, package: &str) -> Result<(), DeviceError> {
        self.shell(&["am", "force-stop", package]).await?;
        Ok(())
    }

    async fn clear_data(&self, package: &str) -> Result<(), DeviceError> {
        let output = self.shell(&["pm", "clear", package]).await?;
        if !output.contains("Success") {
            return Err(DeviceError::CommandFailed(format!(
                "could not clear data of '{}': {}",
                package,
                output.trim()
            )));
        }
        Ok(())
    }

    async fn start_app(&self, package: &str, activity: Option<&str>) -> Result<(), DeviceError> {
        let output = match activity {
            Some(activity) => {
                let component = format!("{}/{}", package, activity);
                self.shell(&["am", "start", "-W", "-n", &component]).await?
            }
            None => {
                self.shell(&[
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ])
                .await?
            }
        };
        if output.contains("Error:") || output.contains("No activities found") {
            return Err(DeviceError::CommandFailed(output.trim().to_string()));
        }
        Ok(())
    }

    async fn api_level(&self) -> Result<u32, DeviceError> {
        let raw = self.getprop("ro.build.version.sdk").await?;
        raw.parse()
            .map_err(|_| DeviceError::Parse(format!("API level '{}'", raw)))
    }

    async fn platform_version(&self) -> Result<String, DeviceError> {
        self.getprop("ro.build.version.release").await
    }

    async fn model(&self) -> Result<String, DeviceError> {
        self.getprop("ro.product.model").await
    }

    async fn manufacturer(&self) -> Result<String, DeviceError> {
        self.getprop("ro.product.manufacturer").await
    }

    async fn screen_size(&self) -> Result<String, DeviceError> {
        let output = self.shell(&["wm", "size"]).await?;
        parse_wm_size(&output)
            .ok_or_else(|| DeviceError::Parse(format!("screen size '{}'", output.trim())))
    }

    async fn is_animation_on(&self) -> Result<bool, DeviceError> {
        for setting in ANIMATION_SETTINGS {
            let raw = self.shell(&["settings", "get", "global", setting]).await?;
            let scale: f64 = raw.trim().parse().unwrap_or(1.0);
            if scale != 0.0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_animation_state(&self, on: bool) -> Result<(), DeviceError> {
        let scale = if on { "1" } else { "0" };
        for setting in ANIMATION_SETTINGS {
            self.shell(&["settings", "put", "global", setting, scale]).await?;
        }
        Ok(())
    }

    async fn set_hidden_api_policy(&self, value: &str) -> Result<(), DeviceError> {
        for setting in HIDDEN_API_SETTINGS {
            self.shell(&["settings", "put", "global", setting, value]).await?;
        }
        Ok(())
    }

    async fn set_default_hidden_api_policy(&self) -> Result<(), DeviceError> {
        for setting in HIDDEN_API_SETTINGS {
            self.shell(&["settings", "delete", "global", setting]).await?;
        }
        Ok(())
    }

    async fn default_ime(&self) -> Result<Option<String>, DeviceError> {
        let raw = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?;
        let ime = raw.trim();
        if ime.is_empty() || ime == "null" {
            Ok(None)
        } else {
            Ok(Some(ime.to_string()))
        }
    }

    async fn set_ime(&self, ime: &str) -> Result<(), DeviceError> {
        self.shell(&["ime", "enable", ime]).await?;
        self.shell(&["ime", "set", ime]).await?;
        Ok(())
    }

    async fn start_logcat(&self) -> Result<(), DeviceError> {
        let mut guard = self.logcat.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        // Drop the backlog so the capture only covers this session.
        self.run(&["logcat", "-c"]).await?;

        let mut child = Command::new(&self.adb)
            .args(self.args(&["logcat", "-v", "threadtime"]))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let serial = self.serial.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "droidpilot::logcat", serial = %serial, "{}", line);
                }
            });
        }
        *guard = Some(child);
        debug!(serial = %self.serial, "logcat capture started");
        Ok(())
    }

    async fn stop_logcat(&self) -> Result<(), DeviceError> {
        if let Some(mut child) = self.logcat.lock().await.take() {
            // An already-exited child is fine.
            let _ = child.kill().await;
            debug!(serial = %self.serial, "logcat capture stopped");
        }
        Ok(())
    }

    async fn dump_hierarchy(&self, compressed: bool) -> Result<String, DeviceError> {
        let mut args = vec!["exec-out", "uiautomator", "dump"];
        if compressed {
            args.push("--compressed");
        }
        args.push("/dev/tty");
        let output = self.run(&args).await?;
        extract_xml(&output)
            .map(str::to_string)
            .ok_or_else(|| DeviceError::Parse("uiautomator produced no hierarchy".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        self.run_bytes(&["exec-out", "screencap", "-p"]).await
    }

    /// `input motionevent` drives a single contact, so only pointer 0 is
    /// accepted.
    async fn pointer_event(&self, event: &PointerEvent) -> Result<(), DeviceError> {
        if event.pointer > 0 {
            return Err(DeviceError::CommandFailed(format!(
                "input motionevent cannot drive pointer {}",
                event.pointer
            )));
        }
        let phase = match event.phase {
            PointerPhase::Down => "DOWN",
            PointerPhase::Move => "MOVE",
            PointerPhase::Up => "UP",
        };
        let x = event.x.round().to_string();
        let y = event.y.round().to_string();
        self.shell(&["input", "motionevent", phase, &x, &y]).await?;
        Ok(())
    }

    fn max_pointers(&self) -> usize {
        1
    }

    async fn is_screen_locked(&self) -> Result<bool, DeviceError> {
        let output = self.shell(&["dumpsys", "window", "policy"]).await?;
        Ok(is_keyguard_showing(&output))
    }

    async fn unlock(&self) -> Result<(), DeviceError> {
        self.shell(&["input", "keyevent", KEYCODE_WAKEUP]).await?;
        self.shell(&["input", "keyevent", KEYCODE_MENU]).await?;
        if self.is_screen_locked().await? {
            return Err(DeviceError::CommandFailed(
                "screen is still locked after dismissing the keyguard".to_string(),
            ));
        }
        Ok(())
    }

    async fn fingerprint(&self, finger_id: u32) -> Result<(), DeviceError> {
        let id = finger_id.to_string();
        self.emu(&["finger", "touch", &id]).await
    }

    async fn send_sms(&self, phone_number: &str, message: &str) -> Result<(), DeviceError> {
        self.emu(&["sms", "send", phone_number, message]).await
    }

    async fn sensor_set(&self, sensor: &str, value: &str) -> Result<(), DeviceError> {
        self.emu(&["sensor", "set", sensor, value]).await
    }

    async fn release(&self) -> Result<(), DeviceError> {
        let result = self.stop_logcat().await;
        let lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
        if lease.is_some() {
            debug!(serial = %self.serial, "device lease freed");
        }
        result
    }
}

/// Acquires [`AdbBridge`]s from the devices `adb devices` reports.
pub struct AdbBridgeFactory {
    adb: PathBuf,
    default_port: Option<u16>,
    held: HeldSerials,
}

impl AdbBridgeFactory {
    /// Creates a factory that runs the given adb executable.
    pub fn new(adb: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            default_port: None,
            held: HeldSerials::default(),
        }
    }

    /// Uses `port` for sessions that do not set `adbPort`.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    async fn online_devices(&self, port: Option<u16>) -> Result<Vec<String>, DeviceError> {
        let mut args = port_args(port);
        args.push("devices".to_string());
        let output = run_adb(&self.adb, &args).await?;
        if !output.success {
            return Err(DeviceError::CommandFailed(output.stderr));
        }
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn avd_name(&self, serial: &str, port: Option<u16>) -> Option<String> {
        let mut args = port_args(port);
        args.extend(["-s", serial, "emu", "avd", "name"].map(str::to_string));
        let output = run_adb(&self.adb, &args).await.ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    }
}

#[async_trait]
impl DeviceBridgeFactory for AdbBridgeFactory {
    async fn acquire(&self, request: &DeviceRequest) -> Result<Arc<dyn DeviceBridge>, DeviceError> {
        let port = request.adb_port.or(self.default_port);
        let devices = self.online_devices(port).await?;
        debug!(?devices, "online devices");

        let candidates: Vec<String> = if let Some(udid) = &request.udid {
            if !devices.contains(udid) {
                return Err(DeviceError::NotFound(format!("device '{}' is not connected", udid)));
            }
            vec![udid.clone()]
        } else if let Some(avd) = &request.avd {
            let mut found = Vec::new();
            for serial in devices.iter().filter(|s| is_emulator_serial(s)) {
                if self.avd_name(serial, port).await.as_deref() == Some(avd.as_str()) {
                    found.push(serial.clone());
                }
            }
            if found.is_empty() {
                return Err(DeviceError::NotFound(format!(
                    "no running emulator for AVD '{}'",
                    avd
                )));
            }
            found
        } else {
            if devices.is_empty() {
                return Err(DeviceError::NotFound("no connected Android device".to_string()));
            }
            devices
        };

        let lease = DeviceLease::claim(&self.held, &candidates).ok_or_else(|| {
            DeviceError::InUse(format!(
                "{} already in use by another session",
                candidates.join(", ")
            ))
        })?;
        info!(serial = %lease.serial(), "device leased");
        let serial = lease.serial().to_string();
        Ok(Arc::new(
            AdbBridge::new(self.adb.clone(), serial, port).with_lease(lease),
        ))
    }
}

/// Parses `adb devices` output into the serials that are online.
fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Parses `wm size`, preferring an override size when present.
fn parse_wm_size(output: &str) -> Option<String> {
    let mut physical = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(size) = line.strip_prefix("Override size:") {
            return Some(size.trim().to_string());
        }
        if let Some(size) = line.strip_prefix("Physical size:") {
            physical = Some(size.trim().to_string());
        }
    }
    physical
}

/// True when `dumpsys window policy` output shows the keyguard.
fn is_keyguard_showing(dumpsys: &str) -> bool {
    KEYGUARD_MARKERS.iter().any(|marker| dumpsys.contains(marker))
}

/// Cuts the XML document out of `uiautomator dump /dev/tty` output.
fn extract_xml(output: &str) -> Option<&str> {
    let start = output.find('<')?;
    let end = output.rfind('>')?;
    (end > start).then(|| &output[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\n0123456789ABCDEF\tunauthorized\nR58M123\tdevice\n\n";
        assert_eq!(parse_devices(output), vec!["emulator-5554", "R58M123"]);
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_parse_wm_size() {
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400\n").as_deref(),
            Some("1080x2400")
        );
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400\nOverride size: 720x1600\n").as_deref(),
            Some("720x1600")
        );
        assert!(parse_wm_size("nothing").is_none());
    }

    #[test]
    fn test_extract_xml() {
        let raw = "<?xml version='1.0'?><hierarchy rotation=\"0\"></hierarchy>UI hierchary dumped to: /dev/tty\n";
        assert_eq!(
            extract_xml(raw),
            Some("<?xml version='1.0'?><hierarchy rotation=\"0\"></hierarchy>")
        );
        assert!(extract_xml("ERROR: null root node").is_none());
    }

    #[test]
    fn test_keyguard_detection() {
        let locked = "    mShowingDream=false mDreamingLockscreen=false\n    mShowingLockscreen=true\n";
        assert!(is_keyguard_showing(locked));
        let unlocked = "    mShowingLockscreen=false mDreamingLockscreen=false\n";
        assert!(!is_keyguard_showing(unlocked));
    }

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let held = HeldSerials::default();
        let candidates = vec!["emulator-5554".to_string(), "emulator-5556".to_string()];

        let first = DeviceLease::claim(&held, &candidates).unwrap();
        let second = DeviceLease::claim(&held, &candidates).unwrap();
        assert_eq!(first.serial(), "emulator-5554");
        assert_eq!(second.serial(), "emulator-5556");
        assert!(DeviceLease::claim(&held, &candidates).is_none());

        drop(first);
        let again = DeviceLease::claim(&held, &candidates).unwrap();
        assert_eq!(again.serial(), "emulator-5554");
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let held = HeldSerials::default();
        let candidates = vec!["emulator-5554".to_string()];
        let lease = DeviceLease::claim(&held, &candidates).unwrap();
        let bridge = AdbBridge::new("adb", "emulator-5554", None).with_lease(lease);
        assert!(DeviceLease::claim(&held, &candidates).is_none());

        bridge.release().await.unwrap();
        assert!(DeviceLease::claim(&held, &candidates).is_some());
    }

    #[tokio::test]
    async fn test_only_first_pointer_is_accepted() {
        let bridge = AdbBridge::new("adb", "emulator-5554", None);
        assert_eq!(bridge.max_pointers(), 1);
        let event = PointerEvent {
            pointer: 1,
            phase: PointerPhase::Down,
            x: 10.0,
            y: 20.0,
        };
        let err = bridge.pointer_event(&event).await.unwrap_err();
        assert!(err.to_string().contains("pointer 1"));
    }

    #[test]
    fn test_bridge_args_include_port_and_serial() {
        let bridge = AdbBridge::new("adb", "emulator-5554", Some(1111));
        assert_eq!(
            bridge.args(&["shell", "true"]),
            vec!["-P", "1111", "-s", "emulator-5554", "shell", "true"]
        );
        let bridge = AdbBridge::new("adb", "R58M123", None);
        assert_eq!(bridge.args(&["devices"]), vec!["-s", "R58M123", "devices"]);
    }
}
