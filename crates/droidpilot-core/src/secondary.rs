//! Secondary browser-driver abstraction.
//!
//! While a web context is active, commands are forwarded to a separate
//! browser-automation process. The session layer only sees the
//! [`SecondaryDriver`] trait; [`Chromedriver`](crate::chromedriver::Chromedriver)
//! is the production implementation and tests substitute scripted fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::DriverError;

/// Errors from the secondary driver transport.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The driver process could not be started or never became ready.
    #[error("Failed to start secondary driver: {0}")]
    Startup(String),

    /// The HTTP exchange with the driver failed.
    #[error("Secondary driver unreachable: {0}")]
    Transport(String),

    /// The driver answered with a protocol error.
    #[error("{error}: {message}")]
    Remote {
        /// Remote-protocol error string.
        error: String,
        /// Human-readable message.
        message: String,
    },

    /// The driver's reply did not have the expected shape.
    #[error("Invalid response from secondary driver: {0}")]
    InvalidResponse(String),

    /// No secondary driver is bound to the active context.
    #[error("No secondary driver is running for context '{0}'")]
    NotRunning(String),

    /// An I/O error occurred (spawning the driver process).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Transport(e.to_string())
    }
}

/// HTTP verbs used by the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Upper-case verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a secondary driver must attach to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondaryDriverConfig {
    /// Context name the driver serves (e.g. `CHROMIUM`, `WEBVIEW_com.example`).
    pub context: String,
    /// Package hosting the web content.
    pub package: String,
    /// Serial of the device.
    pub device_serial: String,
    /// Process hosting the web view, when it differs from the package.
    pub process: Option<String>,
    /// Attach to the already running app instead of relaunching it.
    pub use_running_app: bool,
    /// Extra browser launch arguments.
    pub args: Vec<String>,
}

/// A running secondary driver bound to one web context.
#[async_trait]
pub trait SecondaryDriver: Send + Sync {
    /// Context this driver serves.
    fn context(&self) -> &str;

    /// Local port the driver listens on.
    fn port(&self) -> u16;

    /// Forward one command. `path` is relative to the remote session
    /// (e.g. `/element`, `/url`); an empty path addresses the session itself.
    async fn forward(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ProxyError>;

    /// Stop the driver and release its port.
    async fn stop(&self) -> Result<(), ProxyError>;
}

/// Starts secondary drivers for web contexts.
///
/// A web view that is not attachable yet must surface as
/// [`DriverError::NoSuchContext`] so that callers can retry.
#[async_trait]
pub trait SecondaryDriverFactory: Send + Sync {
    /// Start a driver and attach it to the configured context.
    async fn start(
        &self,
        config: &SecondaryDriverConfig,
    ) -> Result<Arc<dyn SecondaryDriver>, DriverError>;
}
