//! Native-versus-forwarded command routing.
//!
//! [`ProxyRouter`] tracks a session's active [`Context`] and the secondary
//! drivers started for its web contexts. A command is forwarded when the
//! active context is a web context and the command's route is not on the
//! session's proxy-avoid list.
//!
//! Switching to a web context first checks that the device currently lists
//! it, then starts a secondary driver for it if none is running yet. Both
//! steps fail with `NoSuchContext` while the web view is still loading;
//! callers may pass a [`RetryDeadline`] to poll for it.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::{is_listed, Context, ContextSource};
use crate::error::DriverError;
use crate::retry::{retry_with_deadline, RetryDeadline};
use crate::secondary::{
    HttpMethod, ProxyError, SecondaryDriver, SecondaryDriverConfig, SecondaryDriverFactory,
};

/// Routes that always run natively, whatever the active context.
const NATIVE_ONLY_ROUTES: &[(HttpMethod, &str)] = &[
    (HttpMethod::Delete, r"^/session/[^/]+$"),
    (HttpMethod::Get, r"^/session/[^/]+/context$"),
    (HttpMethod::Post, r"^/session/[^/]+/context$"),
    (HttpMethod::Get, r"^/session/[^/]+/contexts$"),
    (HttpMethod::Post, r"^/session/[^/]+/touch/perform$"),
    (HttpMethod::Post, r"^/session/[^/]+/touch/multi/perform$"),
    (HttpMethod::Post, r"^/session/[^/]+/touch/drag$"),
    (HttpMethod::Post, r"^/session/[^/]+/appium/device/start_activity$"),
    (HttpMethod::Get, r"^/session/[^/]+/appium/settings$"),
    (HttpMethod::Post, r"^/session/[^/]+/appium/settings$"),
    (HttpMethod::Post, r"^/session/[^/]+/appium/device/finger_print$"),
    (HttpMethod::Post, r"^/session/[^/]+/appium/device/send_sms$"),
    (HttpMethod::Post, r"^/session/[^/]+/appium/device/sensor_set$"),
];

const SCREENSHOT_ROUTE: (HttpMethod, &str) = (HttpMethod::Get, r"^/session/[^/]+/screenshot$");

/// A (method, path pattern) pair that must never be forwarded.
#[derive(Debug, Clone)]
pub struct ProxyAvoidEntry {
    /// HTTP verb.
    pub method: HttpMethod,
    pattern: Regex,
}

impl ProxyAvoidEntry {
    /// Creates an entry from a path regex.
    pub fn new(method: HttpMethod, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            method,
            pattern: Regex::new(pattern)?,
        })
    }

    /// The path pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// True when the route matches this entry.
    pub fn matches(&self, method: HttpMethod, path: &str) -> bool {
        self.method == method && self.pattern.is_match(path)
    }
}

/// Builds the proxy-avoid list for a session.
///
/// Session deletion and the other native-only routes are always present; the
/// screenshot route is added when screenshots should come from the device.
pub fn build_avoid_list(native_web_screenshot: bool) -> Result<Vec<ProxyAvoidEntry>, DriverError> {
    let mut routes: Vec<(HttpMethod, &str)> = NATIVE_ONLY_ROUTES.to_vec();
    if native_web_screenshot {
        routes.push(SCREENSHOT_ROUTE);
    }
    routes
        .into_iter()
        .map(|(method, pattern)| {
            ProxyAvoidEntry::new(method, pattern)
                .map_err(|e| DriverError::Configuration(format!("bad avoid pattern: {}", e)))
        })
        .collect()
}

/// What web contexts attach to on this session's device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebTarget {
    /// Serial of the device.
    pub device_serial: String,
    /// Package under test (the browser package for browser sessions).
    pub app_package: Option<String>,
    /// Extra browser launch arguments.
    pub args: Vec<String>,
}

/// Per-session context tracking and dispatch decision.
pub struct ProxyRouter {
    session_id: String,
    avoid: Vec<ProxyAvoidEntry>,
    active: Context,
    drivers: HashMap<Context, Arc<dyn SecondaryDriver>>,
    factory: Arc<dyn SecondaryDriverFactory>,
    contexts: Option<Arc<dyn ContextSource>>,
    target: WebTarget,
}

impl ProxyRouter {
    /// Creates a router bound to `session_id`, starting in the native context.
    pub fn new(
        session_id: impl Into<String>,
        avoid: Vec<ProxyAvoidEntry>,
        factory: Arc<dyn SecondaryDriverFactory>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            avoid,
            active: Context::Native,
            drivers: HashMap::new(),
            factory,
            contexts: None,
            target: WebTarget::default(),
        }
    }

    /// Replaces the proxy-avoid list.
    pub fn set_avoid_list(&mut self, avoid: Vec<ProxyAvoidEntry>) {
        self.avoid = avoid;
    }

    /// Sets what web contexts attach to. Called once the device is known.
    pub fn set_web_target(&mut self, target: WebTarget) {
        self.target = target;
    }

    /// Sets where available contexts are listed from. Called once the
    /// device is known; until then no web context can be entered.
    pub fn set_context_source(&mut self, source: Arc<dyn ContextSource>) {
        self.contexts = Some(source);
    }

    fn check_session(&self, session_id: &str) -> Result<(), DriverError> {
        if session_id != self.session_id {
            return Err(DriverError::SessionMismatch {
                expected: self.session_id.clone(),
                actual: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// True while the active context is a web context.
    pub fn proxy_active(&self, session_id: &str) -> Result<bool, DriverError> {
        self.check_session(session_id)?;
        Ok(self.active.is_web())
    }

    /// True when a secondary driver is running for the active context.
    pub fn can_proxy(&self, session_id: &str) -> Result<bool, DriverError> {
        self.check_session(session_id)?;
        Ok(self.drivers.contains_key(&self.active))
    }

    /// The session's proxy-avoid list.
    pub fn proxy_avoid_list(&self, session_id: &str) -> Result<&[ProxyAvoidEntry], DriverError> {
        self.check_session(session_id)?;
        Ok(&self.avoid)
    }

    /// The active context.
    pub fn current_context(&self) -> &Context {
        &self.active
    }

    /// True when the route is on the avoid list.
    pub fn is_avoided(&self, method: HttpMethod, path: &str) -> bool {
        self.avoid.iter().any(|entry| entry.matches(method, path))
    }

    /// Decides whether a route is forwarded for the given session.
    pub fn should_proxy(
        &self,
        session_id: &str,
        method: HttpMethod,
        path: &str,
    ) -> Result<bool, DriverError> {
        Ok(self.proxy_active(session_id)? && !self.is_avoided(method, path))
    }

    fn config_for(&self, context: &Context) -> Result<SecondaryDriverConfig, DriverError> {
        let package = match (context.process(), &self.target.app_package) {
            (_, Some(pkg)) => pkg.clone(),
            (Some(process), None) => process.to_string(),
            (None, None) => {
                return Err(DriverError::NoSuchContext(format!(
                    "{} (no package to attach to)",
                    context
                )))
            }
        };
        Ok(SecondaryDriverConfig {
            context: context.name(),
            process: context.process().map(str::to_string),
            use_running_app: !matches!(context, Context::Chromium),
            package,
            device_serial: self.target.device_serial.clone(),
            args: self.target.args.clone(),
        })
    }

    /// Switches the active context.
    ///
    /// A web context must be among the contexts the device lists at the
    /// time of the attempt. On failure the active context is unchanged.
    /// With a deadline, failures reporting `NoSuchContext` are retried at
    /// the deadline's interval until its budget runs out, re-listing the
    /// contexts on every attempt.
    pub async fn set_context(
        &mut self,
        name: &str,
        deadline: Option<RetryDeadline>,
    ) -> Result<(), DriverError> {
        let target = Context::parse(name)?;
        if target == self.active {
            return Ok(());
        }

        if target.is_web() {
            let this: &Self = self;
            let target_ref = &target;
            let driver = match deadline {
                Some(deadline) => {
                    retry_with_deadline(
                        &deadline,
                        || this.attach(target_ref, true),
                        DriverError::is_no_such_context,
                    )
                    .await?
                }
                None => this.attach(target_ref, true).await?,
            };
            self.drivers.insert(target.clone(), driver);
        }

        info!(session_id = %self.session_id, from = %self.active, to = %target, "context switched");
        self.active = target;
        Ok(())
    }

    /// Enters the browser context of a browser session.
    ///
    /// The secondary driver launches the browser itself, so the context is
    /// not expected to be listed beforehand.
    pub async fn start_browser(&mut self) -> Result<(), DriverError> {
        let driver = self.attach(&Context::Chromium, false).await?;
        self.drivers.insert(Context::Chromium, driver);
        info!(session_id = %self.session_id, from = %self.active, to = %Context::Chromium, "context switched");
        self.active = Context::Chromium;
        Ok(())
    }

    async fn list_contexts(&self) -> Result<Vec<Context>, DriverError> {
        match &self.contexts {
            Some(source) => source.list_contexts().await,
            None => Ok(vec![Context::Native]),
        }
    }

    /// One attach attempt: check the listing, then reuse or start a driver.
    async fn attach(
        &self,
        target: &Context,
        require_listed: bool,
    ) -> Result<Arc<dyn SecondaryDriver>, DriverError> {
        if require_listed {
            let listed = self.list_contexts().await?;
            if !is_listed(target, &listed) {
                let names: Vec<String> = listed.iter().map(Context::name).collect();
                return Err(DriverError::NoSuchContext(format!(
                    "{} is not among the available contexts [{}]",
                    target,
                    names.join(", ")
                )));
            }
        }
        if let Some(driver) = self.drivers.get(target) {
            return Ok(Arc::clone(driver));
        }
        let config = self.config_for(target)?;
        let driver = self.factory.start(&config).await?;
        debug!(context = %target, port = driver.port(), "secondary driver attached");
        Ok(driver)
    }

    /// Forwards a command to the active context's secondary driver.
    ///
    /// `path` is the full session route; the `/session/<id>` prefix is
    /// stripped before forwarding.
    pub async fn forward(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let driver = self
            .drivers
            .get(&self.active)
            .ok_or_else(|| ProxyError::NotRunning(self.active.name()))?;
        let prefix = format!("/session/{}", self.session_id);
        let relative = path.strip_prefix(&prefix).unwrap_or(path);
        Ok(driver.forward(method, relative, body).await?)
    }

    /// Stops every secondary driver and returns to the native context.
    ///
    /// Every driver is stopped even if some fail; the failures are returned.
    pub async fn stop_all(&mut self) -> Vec<ProxyError> {
        let mut failures = Vec::new();
        for (context, driver) in self.drivers.drain() {
            debug!(context = %context, "stopping secondary driver");
            if let Err(e) = driver.stop().await {
                failures.push(e);
            }
        }
        self.active = Context::Native;
        failures
    }
}

impl std::fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("session_id", &self.session_id)
            .field("active", &self.active)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("avoid", &self.avoid.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct EchoDriver {
        context: String,
        stopped: AtomicU32,
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecondaryDriver for EchoDriver {
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
            _body: Option<Value>,
        ) -> Result<Value, ProxyError> {
            self.paths.lock().unwrap().push(format!("{} {}", method, path));
            Ok(Value::String(path.to_string()))
        }

        async fn stop(&self) -> Result<(), ProxyError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails with NoSuchContext `failures` times, then succeeds.
    struct FlakyFactory {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SecondaryDriverFactory for FlakyFactory {
        async fn start(
            &self,
            config: &SecondaryDriverConfig,
        ) -> Result<Arc<dyn SecondaryDriver>, DriverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(DriverError::NoSuchContext(config.context.clone()));
            }
            Ok(Arc::new(EchoDriver {
                context: config.context.clone(),
                stopped: AtomicU32::new(0),
                paths: Mutex::new(Vec::new()),
            }))
        }
    }

    /// Lists `hidden_for` calls with native only, then `listed`.
    struct StaticContexts {
        listed: Vec<Context>,
        hidden_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContextSource for StaticContexts {
        async fn list_contexts(&self) -> Result<Vec<Context>, DriverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.hidden_for {
                return Ok(vec![Context::Native]);
            }
            Ok(self.listed.clone())
        }
    }

    fn listing(hidden_for: u32) -> Arc<StaticContexts> {
        Arc::new(StaticContexts {
            listed: vec![
                Context::Native,
                Context::webview_for("io.example.shop"),
                Context::Chromium,
            ],
            hidden_for,
            calls: AtomicU32::new(0),
        })
    }

    fn make_router(failures: u32, screenshot: bool) -> (ProxyRouter, Arc<FlakyFactory>) {
        let factory = Arc::new(FlakyFactory {
            failures,
            calls: AtomicU32::new(0),
        });
        let mut router = ProxyRouter::new(
            "abc",
            build_avoid_list(screenshot).unwrap(),
            factory.clone(),
        );
        router.set_web_target(WebTarget {
            device_serial: "emulator-5554".into(),
            app_package: Some("io.example.shop".into()),
            args: Vec::new(),
        });
        router.set_context_source(listing(0));
        (router, factory)
    }

    #[test]
    fn test_session_id_is_checked() {
        let (router, _) = make_router(0, false);
        assert!(!router.proxy_active("abc").unwrap());
        assert!(matches!(
            router.proxy_active("aaa"),
            Err(DriverError::SessionMismatch { .. })
        ));
        assert!(matches!(
            router.can_proxy("aaa"),
            Err(DriverError::SessionMismatch { .. })
        ));
        assert!(router.proxy_avoid_list("aaa").is_err());
    }

    #[test]
    fn test_avoid_list_screenshot_entry() {
        let (router, _) = make_router(0, false);
        let list = router.proxy_avoid_list("abc").unwrap();
        assert!(!list
            .iter()
            .any(|e| e.matches(HttpMethod::Get, "/session/abc/screenshot")));
        assert!(list.iter().any(|e| e.matches(HttpMethod::Delete, "/session/abc")));

        let (router, _) = make_router(0, true);
        let list = router.proxy_avoid_list("abc").unwrap();
        assert!(list
            .iter()
            .any(|e| e.matches(HttpMethod::Get, "/session/abc/screenshot")));
        assert!(list.iter().any(|e| e.matches(HttpMethod::Delete, "/session/abc")));
    }

    #[test]
    fn test_avoid_entry_is_method_specific() {
        let entry = ProxyAvoidEntry::new(HttpMethod::Delete, r"^/session/[^/]+$").unwrap();
        assert!(entry.matches(HttpMethod::Delete, "/session/xyz"));
        assert!(!entry.matches(HttpMethod::Get, "/session/xyz"));
        assert!(!entry.matches(HttpMethod::Delete, "/session/xyz/window"));
    }

    #[tokio::test]
    async fn test_set_context_starts_driver_and_forwards() {
        let (mut router, factory) = make_router(0, false);
        assert!(!router.can_proxy("abc").unwrap());

        router.set_context("WEBVIEW_io.example.shop", None).await.unwrap();
        assert!(router.proxy_active("abc").unwrap());
        assert!(router.can_proxy("abc").unwrap());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        assert!(router
            .should_proxy("abc", HttpMethod::Post, "/session/abc/element")
            .unwrap());
        assert!(!router
            .should_proxy("abc", HttpMethod::Delete, "/session/abc")
            .unwrap());

        let value = router
            .forward(HttpMethod::Post, "/session/abc/element", None)
            .await
            .unwrap();
        assert_eq!(value, Value::String("/element".into()));

        // Back to native and into the same web view reuses the driver.
        router.set_context("NATIVE_APP", None).await.unwrap();
        assert!(!router.proxy_active("abc").unwrap());
        router.set_context("WEBVIEW_io.example.shop", None).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_context_unchanged() {
        let (mut router, _) = make_router(u32::MAX, false);
        let err = router
            .set_context("WEBVIEW_io.example.shop", None)
            .await
            .unwrap_err();
        assert!(err.is_no_such_context());
        assert_eq!(router.current_context(), &Context::Native);
        assert!(!router.can_proxy("abc").unwrap());
    }

    #[tokio::test]
    async fn test_unlisted_context_is_rejected_before_attach() {
        let (mut router, factory) = make_router(0, false);
        let err = router
            .set_context("WEBVIEW_does.not.exist", None)
            .await
            .unwrap_err();
        assert!(err.is_no_such_context());
        assert!(err.to_string().contains("not among the available contexts"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.current_context(), &Context::Native);
    }

    #[tokio::test]
    async fn test_no_context_source_means_native_only() {
        let factory = Arc::new(FlakyFactory {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut router = ProxyRouter::new("abc", Vec::new(), factory.clone());
        assert!(router.set_context("CHROMIUM", None).await.is_err());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_waits_for_context_to_be_listed() {
        let (mut router, factory) = make_router(0, false);
        let source = listing(2);
        router.set_context_source(source.clone());
        router
            .set_context(
                "WEBVIEW_io.example.shop",
                Some(RetryDeadline::from_millis(500, 5000)),
            )
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_browser_start_skips_listing() {
        let (mut router, factory) = make_router(0, false);
        let source = listing(u32::MAX);
        router.set_context_source(source.clone());
        router.start_browser().await.unwrap();
        assert_eq!(router.current_context(), &Context::Chromium);
        assert!(router.can_proxy("abc").unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_retries_until_attachable() {
        let (mut router, factory) = make_router(3, false);
        router
            .set_context("CHROMIUM", Some(RetryDeadline::from_millis(500, 5000)))
            .await
            .unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);
        assert_eq!(router.current_context(), &Context::Chromium);
    }

    #[tokio::test]
    async fn test_forward_without_driver() {
        let (router, _) = make_router(0, false);
        let err = router
            .forward(HttpMethod::Get, "/session/abc/url", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Proxy(ProxyError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_stop_all_returns_to_native() {
        let (mut router, factory) = make_router(0, false);
        router.set_context("CHROMIUM", None).await.unwrap();
        let failures = router.stop_all().await;
        assert!(failures.is_empty());
        assert_eq!(router.current_context(), &Context::Native);

        // Drivers are gone, so re-entering starts a new one.
        router.set_context("CHROMIUM", None).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }
}
