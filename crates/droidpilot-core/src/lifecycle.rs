//! Session creation and teardown.
//!
//! [`Session::create`] walks the creation path of the state machine. Any
//! failure runs the teardown path on whatever was acquired so far and then
//! returns the original error.
//!
//! [`Session::delete`] is best effort: every step runs even when an earlier
//! one failed, failures are collected into a [`TeardownReport`], and log
//! capture is always stopped, including on repeated calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app_helper::AppHelper;
use crate::bridge::{
    read_device_info, third_party_packages, DeviceBridge, DeviceBridgeFactory, DeviceRequest,
};
use crate::capabilities::{browser_package, is_emulator_serial, validate};
use crate::context::{Context, DeviceContexts, CHROMIUM_CONTEXT};
use crate::element::{find_all, parse_hierarchy, LocatorStrategy};
use crate::error::DriverError;
use crate::gesture::{GestureAction, GestureComposer, Target};
use crate::journal::SessionEvent;
use crate::proxy::{build_avoid_list, WebTarget};
use crate::retry::RetryDeadline;
use crate::session::{Session, SessionState};

/// Device-side settings helper. Never uninstalled.
pub const SETTINGS_HELPER_PACKAGE: &str = "io.droidpilot.settings";

/// Input method installed by the settings helper.
pub const UNICODE_IME: &str = "io.droidpilot.settings/.UnicodeIME";

/// Lowest API level whose hidden-API policy must be relaxed to change
/// animation settings.
pub const HIDDEN_API_MIN_LEVEL: u32 = 28;

/// Polling interval of the automatic web view switch.
pub const AUTO_WEBVIEW_INTERVAL_MS: u64 = 500;

/// One failed teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// Step name.
    pub step: &'static str,
    /// Error message.
    pub error: String,
}

/// Outcome of [`Session::delete`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The session was already closed; only log capture was stopped.
    pub already_closed: bool,
    /// Steps that failed.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// True when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<E: std::fmt::Display>(&mut self, step: &'static str, result: Result<(), E>) {
        if let Err(e) = result {
            warn!(step, error = %e, "teardown step failed");
            self.failures.push(TeardownFailure {
                step,
                error: e.to_string(),
            });
        }
    }
}

impl Session {
    /// Runs the creation path up to `Ready`.
    ///
    /// On failure everything acquired so far is released before the error is
    /// returned.
    pub async fn create(
        &mut self,
        devices: &dyn DeviceBridgeFactory,
        apps: &dyn AppHelper,
    ) -> Result<(), DriverError> {
        match self.create_inner(devices, apps).await {
            Ok(()) => {
                self.transition(SessionState::Ready);
                self.journal().started();
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "session creation failed, cleaning up");
                let report = self.delete().await;
                if !report.is_clean() {
                    debug!(failures = report.failures.len(), "cleanup after failed creation was partial");
                }
                Err(e)
            }
        }
    }

    async fn create_inner(
        &mut self,
        devices: &dyn DeviceBridgeFactory,
        apps: &dyn AppHelper,
    ) -> Result<(), DriverError> {
        self.transition(SessionState::Validating);
        validate(&self.caps)?;
        self.router.set_avoid_list(build_avoid_list(self.caps.native_web_screenshot)?);

        self.transition(SessionState::AcquiringDevice);
        let request = DeviceRequest {
            udid: self.caps.udid.clone(),
            avd: self.caps.avd.clone(),
            adb_port: self.caps.adb_port,
        };
        let bridge = devices.acquire(&request).await?;
        self.bridge = Some(bridge.clone());
        self.is_emulator = self.caps.avd.is_some() || is_emulator_serial(bridge.serial());
        self.router
            .set_context_source(Arc::new(DeviceContexts(Arc::clone(&bridge))));
        info!(session_id = %self.id(), serial = %bridge.serial(), emulator = self.is_emulator(), "device acquired");

        if !self.caps.skip_logcat_capture {
            bridge.start_logcat().await?;
            self.flags.logcat_started = true;
        }
        self.device_info = Some(read_device_info(bridge.as_ref()).await?);

        self.transition(SessionState::InstallingApp);
        if self.caps.is_browser_session() {
            if let Some((package, activity)) =
                self.caps.browser_name.as_deref().and_then(browser_package)
            {
                self.caps.app_package = Some(package.to_string());
                self.caps.app_activity = Some(activity.to_string());
            }
        } else {
            if let Some(app) = self.caps.app.clone() {
                self.app_path = Some(apps.configure_app(&app, ".apk").await?);
            } else if let Some(package) = self.caps.app_package.as_deref() {
                if !bridge.is_installed(package).await? {
                    return Err(DriverError::Configuration(format!(
                        "Could not find package {} on the device",
                        package
                    )));
                }
            }
            self.init_aut(apps).await?;
        }

        let args = self
            .caps
            .chrome_options
            .as_ref()
            .and_then(|opts| opts.args.as_ref())
            .map(|args| args.to_vec())
            .unwrap_or_default();
        self.router.set_web_target(WebTarget {
            device_serial: bridge.serial().to_string(),
            app_package: self.caps.app_package.clone(),
            args,
        });

        self.transition(SessionState::Starting);
        self.start_android_session().await
    }

    /// Prepares the app under test.
    ///
    /// Installs (or reinstalls on full reset) the app, clears its data on fast
    /// reset, installs auxiliary apps, uninstalls the packages named by
    /// `uninstallOtherPackages` and pushes shared preferences.
    pub async fn init_aut(&mut self, apps: &dyn AppHelper) -> Result<(), DriverError> {
        if self.caps.full_reset && self.caps.app.is_none() {
            return Err(DriverError::Configuration(
                "Full reset requires an app capability, use fastReset if app is not provided"
                    .to_string(),
            ));
        }
        let bridge = self.device()?;
        let package = self.caps.app_package.clone();

        if let Some(apk) = self.app_path.clone() {
            let install = match package.as_deref() {
                Some(pkg) if self.caps.full_reset => {
                    if bridge.uninstall(pkg).await? {
                        debug!(package = %pkg, "removed previous install");
                    }
                    true
                }
                Some(pkg) => !bridge.is_installed(pkg).await?,
                None => true,
            };
            if install {
                info!(apk = %apk.display(), "installing app under test");
                bridge.install(&apk).await?;
            }
        }

        if self.caps.fast_reset && !self.caps.full_reset && !self.caps.no_reset {
            if let Some(pkg) = package.as_deref() {
                debug!(package = %pkg, "fast reset: clearing app data");
                bridge.clear_data(pkg).await?;
            }
        }

        for other in self.caps.other_apps() {
            let apk = apps.configure_app(&other, ".apk").await?;
            info!(app = %other, "installing auxiliary app");
            bridge.install(&apk).await?;
        }

        let requested = self.caps.uninstall_other_packages();
        let targets: Vec<String> = if requested.iter().any(|p| p == "*") {
            let mut exclude = vec![SETTINGS_HELPER_PACKAGE];
            if let Some(pkg) = package.as_deref() {
                exclude.push(pkg);
            }
            third_party_packages(bridge.as_ref(), &exclude).await
        } else {
            requested
                .into_iter()
                .filter(|p| p != SETTINGS_HELPER_PACKAGE)
                .collect()
        };
        for pkg in targets {
            if !bridge.uninstall(&pkg).await? {
                debug!(package = %pkg, "package was not installed");
            }
        }

        self.set_shared_preferences(apps).await?;
        Ok(())
    }

    /// Pushes the capability's shared preferences into the app's data dir.
    ///
    /// Returns `false` when there is nothing to push.
    pub async fn set_shared_preferences(&self, apps: &dyn AppHelper) -> Result<bool, DriverError> {
        let Some(prefs) = self.caps.shared_preferences.as_ref() else {
            return Ok(false);
        };
        let (Some(name), Some(package)) = (prefs.name.as_deref(), self.caps.app_package.as_deref())
        else {
            debug!("shared preferences have no file name or package, skipping");
            return Ok(false);
        };

        let bridge = self.device()?;
        let local = apps.build_shared_prefs(prefs).await?;
        let remote_dir = format!("/data/data/{}/shared_prefs", package);
        bridge.shell(&["mkdir", "-p", &remote_dir]).await?;
        bridge
            .push(&local, &format!("{}/{}.xml", remote_dir, name))
            .await?;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            debug!(path = %local.display(), error = %e, "could not remove local preferences file");
        }
        Ok(true)
    }

    /// Applies device settings and launches the app or browser.
    pub async fn start_android_session(&mut self) -> Result<(), DriverError> {
        let bridge = self.device()?;
        let api_level = self.api_level();

        if !self.caps.skip_unlock && bridge.is_screen_locked().await? {
            info!(session_id = %self.id(), "unlocking screen");
            bridge.unlock().await?;
        }

        if self.caps.disable_window_animation && bridge.is_animation_on().await? {
            if api_level >= HIDDEN_API_MIN_LEVEL {
                bridge.set_hidden_api_policy("1").await?;
            }
            bridge.set_animation_state(false).await?;
            self.flags.animation_disabled = true;
        }

        if self.caps.unicode_keyboard {
            self.flags.saved_ime = bridge.default_ime().await?;
            bridge.set_ime(UNICODE_IME).await?;
        }

        if self.caps.is_browser_session() {
            return self.start_chrome_session().await;
        }

        if self.caps.auto_launch {
            if let Some(pkg) = self.caps.app_package.clone() {
                bridge
                    .start_app(&pkg, self.caps.app_activity.as_deref())
                    .await?;
            }
        }

        if self.caps.auto_webview {
            let pkg = self.caps.app_package.clone().ok_or_else(|| {
                DriverError::Configuration("autoWebview needs an app package".to_string())
            })?;
            let name = Context::webview_for(&pkg).name();
            let deadline =
                RetryDeadline::from_millis(AUTO_WEBVIEW_INTERVAL_MS, self.caps.auto_webview_timeout_ms());
            self.router.set_context(&name, Some(deadline)).await?;
            self.journal()
                .emit(SessionEvent::ContextChanged { context: name });
        }
        Ok(())
    }

    async fn start_chrome_session(&mut self) -> Result<(), DriverError> {
        self.router.start_browser().await?;
        self.journal().emit(SessionEvent::ContextChanged {
            context: CHROMIUM_CONTEXT.to_string(),
        });
        if self.caps.should_dismiss_chrome_welcome() {
            self.dismiss_chrome_welcome().await;
        }
        Ok(())
    }

    /// Taps through the browser's first-run screens. Failures are logged.
    async fn dismiss_chrome_welcome(&self) {
        let (Ok(bridge), Some(package)) = (self.device(), self.caps.app_package.as_deref()) else {
            return;
        };
        for button in ["terms_accept", "negative_button"] {
            let resource_id = format!("{}:id/{}", package, button);
            match self.tap_resource(bridge.as_ref(), &resource_id).await {
                Ok(true) => debug!(button, "dismissed first-run prompt"),
                Ok(false) => debug!(button, "first-run prompt not shown"),
                Err(e) => warn!(button, error = %e, "could not dismiss first-run prompt"),
            }
        }
    }

    /// Taps the center of the first node with `resource_id`, if on screen.
    async fn tap_resource(
        &self,
        bridge: &dyn DeviceBridge,
        resource_id: &str,
    ) -> Result<bool, DriverError> {
        let xml = bridge.dump_hierarchy(false).await?;
        let nodes = parse_hierarchy(&xml)?;
        let Some(bounds) = find_all(&nodes, LocatorStrategy::Id, resource_id, None)
            .into_iter()
            .find_map(|node| node.bounds)
        else {
            return Ok(false);
        };
        let (x, y) = bounds.center();
        GestureComposer::new(bridge)
            .perform_touch(&[GestureAction::Tap(Target::Point { x, y })], &self.elements)
            .await?;
        Ok(true)
    }

    /// Tears the session down.
    ///
    /// Secondary drivers are stopped, device settings restored, the app
    /// stopped (or uninstalled on full reset), log capture stopped and the
    /// device released. Calling it on a closed session only stops log
    /// capture again.
    pub async fn delete(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let bridge = self.bridge.clone();

        if self.state() == SessionState::Closed {
            report.already_closed = true;
            if let Some(bridge) = &bridge {
                report.record("stop log capture", bridge.stop_logcat().await);
            }
            return report;
        }

        self.transition(SessionState::StoppingProxies);
        for e in self.router.stop_all().await {
            report.record("stop secondary driver", Err(e));
        }
        self.elements.clear();

        self.transition(SessionState::ResettingApp);
        if let Some(bridge) = &bridge {
            if self.caps.reset_keyboard {
                if let Some(ime) = self.flags.saved_ime.take() {
                    report.record("restore input method", bridge.set_ime(&ime).await);
                }
            }

            if self.flags.animation_disabled {
                report.record("restore animations", bridge.set_animation_state(true).await);
                if self.api_level() >= HIDDEN_API_MIN_LEVEL {
                    report.record(
                        "reset hidden api policy",
                        bridge.set_default_hidden_api_policy().await,
                    );
                }
                self.flags.animation_disabled = false;
            }

            if let Some(pkg) = self.caps.app_package.clone() {
                if !self.caps.is_browser_session() && !self.caps.dont_stop_app_on_reset {
                    report.record("stop app", bridge.force_stop(&pkg).await);
                }
                if self.caps.full_reset && self.caps.app.is_some() {
                    report.record(
                        "uninstall app",
                        bridge.uninstall(&pkg).await.map(|_| ()),
                    );
                }
            }
        }

        self.transition(SessionState::ReleasingDevice);
        if let Some(bridge) = &bridge {
            report.record("stop log capture", bridge.stop_logcat().await);
            self.flags.logcat_started = false;
            report.record("release device", bridge.release().await);
        }

        self.transition(SessionState::Closed);
        self.journal().ended();
        info!(session_id = %self.id(), failures = report.failures.len(), "session closed");
        report
    }
}
