//! # droidpilot-core
//!
//! Core library for Android device automation sessions.
//!
//! A client creates a session from a capability set; the session acquires a
//! device over adb, installs or locates the app under test and then executes
//! commands against the device's native UI, or forwards them to a
//! chromedriver process while a web view context is active.
//!
//! ## Modules
//!
//! - [`capabilities`] - Capability parsing, normalization and validation
//! - [`bridge`] / [`adb`] - Device bridge contract and its adb implementation
//! - [`session`] / [`lifecycle`] - Session state machine, creation and teardown
//! - [`manager`] - Registry of live sessions with per-session serialization
//! - [`proxy`] / [`context`] / [`retry`] - Native-vs-forwarded routing and bounded context switching
//! - [`secondary`] / [`chromedriver`] - Secondary browser driver contract and chromedriver
//! - [`gesture`] - Touch and multi-touch composition
//! - [`command`] / [`executor`] / [`handlers`] - Command surface and dispatch
//! - [`journal`] - Command history and session events
//! - [`ipc`] - Unix socket server and client
//!
//! ## External Dependencies
//!
//! - **adb** (Android platform tools) - device control
//! - **chromedriver** - only needed for web view and browser sessions
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use droidpilot_core::adb::AdbBridgeFactory;
//! use droidpilot_core::app_helper::LocalAppHelper;
//! use droidpilot_core::chromedriver::ChromedriverFactory;
//! use droidpilot_core::command::Command;
//! use droidpilot_core::manager::SessionManager;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), droidpilot_core::error::DriverError> {
//! let manager = SessionManager::new(
//!     Arc::new(AdbBridgeFactory::new("adb")),
//!     Arc::new(ChromedriverFactory::new("chromedriver", 9515)),
//!     Arc::new(LocalAppHelper::new(std::env::temp_dir())),
//! );
//! let (id, _caps) = manager
//!     .create_session(&json!({"platformName": "Android", "appPackage": "io.example.shop"}))
//!     .await?;
//! let result = manager.execute(&id, Command::GetPageSource).await?;
//! println!("{}", result.value);
//! manager.delete_session(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod adb;
pub mod app_helper;
pub mod bridge;
pub mod capabilities;
pub mod chromedriver;
pub mod command;
pub mod config;
pub mod context;
pub mod element;
pub mod error;
pub mod executor;
pub mod gesture;
pub mod handlers;
pub mod ipc;
pub mod journal;
pub mod lifecycle;
pub mod manager;
pub mod proxy;
pub mod retry;
pub mod secondary;
pub mod session;
