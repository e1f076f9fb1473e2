//! Automation contexts.
//!
//! A session is always in exactly one [`Context`]: the native UI surface or a
//! web view. Web views are discovered from the devtools sockets the device
//! exposes in `/proc/net/unix`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::DeviceBridge;
use crate::error::DriverError;

/// Name of the native context.
pub const NATIVE_CONTEXT: &str = "NATIVE_APP";
/// Name of the browser-hosted context.
pub const CHROMIUM_CONTEXT: &str = "CHROMIUM";
/// Name of the generic web view context, and the prefix of specific ones.
pub const WEBVIEW_CONTEXT: &str = "WEBVIEW";

const WEBVIEW_SOCKET_PREFIX: &str = "@webview_devtools_remote_";
const CHROME_SOCKET: &str = "@chrome_devtools_remote";

/// The automation target of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Context {
    /// Native UI automation surface.
    Native,
    /// Whatever web view the app exposes first.
    WebviewBase,
    /// A specific web view, named `WEBVIEW_<process>`.
    Webview(String),
    /// The browser itself.
    Chromium,
}

impl Context {
    /// Parses a context name.
    pub fn parse(name: &str) -> Result<Self, DriverError> {
        match name {
            NATIVE_CONTEXT => Ok(Context::Native),
            CHROMIUM_CONTEXT => Ok(Context::Chromium),
            WEBVIEW_CONTEXT => Ok(Context::WebviewBase),
            other => match other.strip_prefix("WEBVIEW_") {
                Some(process) if !process.is_empty() => Ok(Context::Webview(process.to_string())),
                _ => Err(DriverError::NoSuchContext(other.to_string())),
            },
        }
    }

    /// Web view of a given process.
    pub fn webview_for(process: &str) -> Self {
        Context::Webview(process.to_string())
    }

    /// True for every context other than native.
    pub fn is_web(&self) -> bool {
        !matches!(self, Context::Native)
    }

    /// Wire name of the context.
    pub fn name(&self) -> String {
        match self {
            Context::Native => NATIVE_CONTEXT.to_string(),
            Context::WebviewBase => WEBVIEW_CONTEXT.to_string(),
            Context::Webview(process) => format!("{}_{}", WEBVIEW_CONTEXT, process),
            Context::Chromium => CHROMIUM_CONTEXT.to_string(),
        }
    }

    /// Process hosting the web content, if the context names one.
    pub fn process(&self) -> Option<&str> {
        match self {
            Context::Webview(process) => Some(process),
            _ => None,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Lists the contexts currently available on the device, native first.
pub async fn available_contexts(bridge: &dyn DeviceBridge) -> Result<Vec<Context>, DriverError> {
    let sockets = bridge.shell(&["cat", "/proc/net/unix"]).await?;
    let mut contexts = vec![Context::Native];

    let names = devtools_sockets(&sockets);
    if names.is_empty() {
        return Ok(contexts);
    }

    let processes = bridge.shell(&["ps", "-A", "-o", "PID,NAME"]).await.unwrap_or_default();
    for socket in names {
        let context = if socket == CHROME_SOCKET {
            Context::Chromium
        } else if let Some(pid) = socket.strip_prefix(WEBVIEW_SOCKET_PREFIX) {
            Context::Webview(process_name(&processes, pid).unwrap_or_else(|| pid.to_string()))
        } else {
            continue;
        };
        if !contexts.contains(&context) {
            contexts.push(context);
        }
    }
    Ok(contexts)
}

/// Where a session's available contexts come from.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// The contexts available right now, native first.
    async fn list_contexts(&self) -> Result<Vec<Context>, DriverError>;
}

/// Lists contexts from a device's devtools sockets.
pub struct DeviceContexts(pub Arc<dyn DeviceBridge>);

#[async_trait]
impl ContextSource for DeviceContexts {
    async fn list_contexts(&self) -> Result<Vec<Context>, DriverError> {
        available_contexts(self.0.as_ref()).await
    }
}

/// True when `target` is among `listed`.
///
/// The generic `WEBVIEW` context is available whenever any web view is.
pub fn is_listed(target: &Context, listed: &[Context]) -> bool {
    match target {
        Context::WebviewBase => listed.iter().any(|c| matches!(c, Context::Webview(_))),
        other => listed.contains(other),
    }
}

/// Extracts devtools socket names from `/proc/net/unix`.
fn devtools_sockets(proc_net_unix: &str) -> Vec<String> {
    proc_net_unix
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter(|name| name.starts_with(WEBVIEW_SOCKET_PREFIX) || *name == CHROME_SOCKET)
        .map(str::to_string)
        .collect()
}

fn process_name(ps_output: &str, pid: &str) -> Option<String> {
    ps_output.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        match (cols.next(), cols.next()) {
            (Some(p), Some(name)) if p == pid => Some(name.to_string()),
            _ => None,
        }
    })
}
