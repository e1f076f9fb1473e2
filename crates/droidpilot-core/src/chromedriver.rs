//! Chromedriver as the secondary browser driver.
//!
//! [`ChromedriverFactory`] spawns one `chromedriver` process per web context,
//! each on its own local port, waits for `/status` to report ready, and opens
//! a remote session attached to the app's web view through
//! `goog:chromeOptions`. Forwarded commands are rewritten onto the remote
//! session id.
//!
//! A remote `session not created` that says the web view is missing is
//! reported as [`DriverError::NoSuchContext`] so the caller can retry.
//!
//! Ports come from a fixed window above the configured base port. A port is
//! leased while its driver is alive and returns to the window when the
//! driver is dropped; ports something else already listens on are skipped.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::retry::{retry_with_deadline, RetryDeadline};
use crate::secondary::{
    HttpMethod, ProxyError, SecondaryDriver, SecondaryDriverConfig, SecondaryDriverFactory,
};

/// Readiness polling of a freshly spawned chromedriver.
const STARTUP_POLL: RetryDeadline = RetryDeadline {
    interval: std::time::Duration::from_millis(200),
    max_elapsed: std::time::Duration::from_secs(10),
};

/// Number of ports tried above the base port.
pub const PORT_WINDOW: u16 = 100;

/// Ports of live chromedrivers within the window.
#[derive(Debug)]
struct PortPool {
    base: u16,
    window: u16,
    leased: HashSet<u16>,
}

type SharedPortPool = Arc<std::sync::Mutex<PortPool>>;

/// A port held for one chromedriver. Dropping it frees the port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: SharedPortPool,
}

impl PortLease {
    /// The leased port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.leased.remove(&self.port);
    }
}

/// Leases the lowest free port of the window that nothing listens on.
fn lease_port(pool: &SharedPortPool) -> Result<PortLease, DriverError> {
    let mut guard = pool.lock().unwrap_or_else(PoisonError::into_inner);
    let (base, window) = (guard.base, guard.window);
    let port = (0..window)
        .filter_map(|offset| base.checked_add(offset))
        .find(|port| {
            !guard.leased.contains(port)
                && StdTcpListener::bind((Ipv4Addr::LOCALHOST, *port)).is_ok()
        })
        .ok_or_else(|| {
            ProxyError::Startup(format!(
                "no free chromedriver port in {}..{}",
                base,
                base.saturating_add(window)
            ))
        })?;
    guard.leased.insert(port);
    Ok(PortLease {
        port,
        pool: Arc::clone(pool),
    })
}

/// A chromedriver process with one remote session.
pub struct Chromedriver {
    context: String,
    port: u16,
    port_lease: Option<PortLease>,
    base_url: String,
    remote_session: String,
    client: reqwest::Client,
    process: Mutex<Option<Child>>,
}

impl Chromedriver {
    /// Spawns chromedriver on `port` and attaches it to the configured web view.
    pub async fn spawn(
        executable: &Path,
        port: u16,
        config: &SecondaryDriverConfig,
    ) -> Result<Self, DriverError> {
        info!(port, context = %config.context, "starting chromedriver");
        let child = Command::new(executable)
            .arg(format!("--port={}", port))
            .arg("--allowed-ips=127.0.0.1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProxyError::Startup(format!("cannot run {}: {}", executable.display(), e))
            })?;

        let base_url = format!("http://127.0.0.1:{}", port);
        Self::attach(&base_url, port, config, Some(child)).await
    }

    /// Attaches to a chromedriver already listening at `base_url`.
    ///
    /// `process`, when given, is killed if attaching fails or on
    /// [`stop`](SecondaryDriver::stop).
    pub async fn attach(
        base_url: &str,
        port: u16,
        config: &SecondaryDriverConfig,
        process: Option<Child>,
    ) -> Result<Self, DriverError> {
        let mut driver = Self {
            context: config.context.clone(),
            port,
            port_lease: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            remote_session: String::new(),
            client: reqwest::Client::new(),
            process: Mutex::new(process),
        };

        let attached = async {
            retry_with_deadline(&STARTUP_POLL, || driver.wait_ready(), |_| true).await?;
            driver.create_remote_session(config).await
        }
        .await;

        match attached {
            Ok(session) => {
                debug!(remote_session = %session, "chromedriver session created");
                driver.remote_session = session;
                Ok(driver)
            }
            Err(e) => {
                driver.kill().await;
                Err(e)
            }
        }
    }

    async fn wait_ready(&self) -> Result<(), ProxyError> {
        let body: Value = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        if body["value"]["ready"].as_bool() == Some(true) {
            Ok(())
        } else {
            Err(ProxyError::Startup("chromedriver is not ready".to_string()))
        }
    }

    async fn create_remote_session(&self, config: &SecondaryDriverConfig) -> Result<String, DriverError> {
        let body: Value = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&session_request(config))
            .send()
            .await
            .map_err(ProxyError::from)?
            .json()
            .await
            .map_err(ProxyError::from)?;

        match unwrap_value(body) {
            Ok(value) => value["sessionId"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProxyError::InvalidResponse("missing sessionId".to_string()).into()),
            Err(ProxyError::Remote { error, message }) if is_missing_webview(&error, &message) => {
                Err(DriverError::NoSuchContext(format!("{}: {}", config.context, message)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "chromedriver already exited");
            }
        }
    }
}

#[async_trait]
impl SecondaryDriver for Chromedriver {
    fn context(&self) -> &str {
        &self.context
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn forward(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ProxyError> {
        let url = format!("{}/session/{}{}", self.base_url, self.remote_session, path);
        let request = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Delete => self.client.delete(&url),
            HttpMethod::Post => self
                .client
                .post(&url)
                .json(&body.unwrap_or_else(|| Value::Object(Map::new()))),
        };
        let response: Value = request.send().await?.json().await?;
        unwrap_value(response)
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let deleted = self
            .client
            .delete(format!("{}/session/{}", self.base_url, self.remote_session))
            .send()
            .await;
        if let Err(e) = &deleted {
            warn!(error = %e, "could not delete chromedriver session");
        }
        self.kill().await;
        deleted.map(|_| ()).map_err(ProxyError::from)
    }
}

/// Builds the `POST /session` body for a web context.
pub fn session_request(config: &SecondaryDriverConfig) -> Value {
    let mut options = json!({
        "androidPackage": config.package,
        "androidDeviceSerial": config.device_serial,
    });
    if let Some(process) = &config.process {
        options["androidProcess"] = json!(process);
    }
    if config.use_running_app {
        options["androidUseRunningApp"] = json!(true);
    }
    if !config.args.is_empty() {
        options["args"] = json!(config.args);
    }
    json!({ "capabilities": { "alwaysMatch": { "goog:chromeOptions": options } } })
}

/// Extracts `value` from a reply, turning protocol errors into
/// [`ProxyError::Remote`].
fn unwrap_value(mut body: Value) -> Result<Value, ProxyError> {
    let value = body
        .get_mut("value")
        .map(Value::take)
        .ok_or_else(|| ProxyError::InvalidResponse(body.to_string()))?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ProxyError::Remote {
            error: error.to_string(),
            message: value["message"].as_str().unwrap_or_default().to_string(),
        });
    }
    Ok(value)
}

fn is_missing_webview(error: &str, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    (error == "session not created" || error == "unknown error")
        && (message.contains("webview")
            || message.contains("no such")
            || message.contains("failed to get pid"))
}

/// Starts a [`Chromedriver`] per web context, each on a leased port.
pub struct ChromedriverFactory {
    executable: PathBuf,
    ports: SharedPortPool,
}

impl ChromedriverFactory {
    /// Creates a factory leasing ports from `base_port` upwards.
    pub fn new(executable: impl Into<PathBuf>, base_port: u16) -> Self {
        Self {
            executable: executable.into(),
            ports: Arc::new(std::sync::Mutex::new(PortPool {
                base: base_port,
                window: PORT_WINDOW,
                leased: HashSet::new(),
            })),
        }
    }

    /// Leases a port for the next chromedriver.
    pub fn lease_port(&self) -> Result<PortLease, DriverError> {
        lease_port(&self.ports)
    }
}

#[async_trait]
impl SecondaryDriverFactory for ChromedriverFactory {
    async fn start(
        &self,
        config: &SecondaryDriverConfig,
    ) -> Result<Arc<dyn SecondaryDriver>, DriverError> {
        let lease = self.lease_port()?;
        let mut driver = Chromedriver::spawn(&self.executable, lease.port(), config).await?;
        driver.port_lease = Some(lease);
        Ok(Arc::new(driver))
    }
}
