//! # rnetsh - Pooled Interactive Shell Sessions for Network Devices
//!
//! `rnetsh` is the transport/session layer of a device-automation client. It
//! drives a remote router's interactive command-line shell over authenticated
//! SSH in place of a native management API: a persistent shell session with
//! prompt-detection framing, a bounded connection pool with privilege-aware
//! reuse, and a command executor with retries and multi-command batching.
//!
//! Command rendering and response parsing belong to the caller; this crate
//! only moves exact command text in and raw response bytes (including the
//! trailing prompt) out.
//!
//! ## Features
//!
//! - **Prompt-Detection Framing**: the shell has no length or delimiter
//!   framing, so response boundaries are recovered by classifying completed
//!   lines against the device's prompt shape
//! - **Connection Pooling**: bounded pool with acquire timeouts, idle
//!   reaping, and usage statistics
//! - **Privilege-Aware Reuse**: a released connection keeps its elevated
//!   mode, so later callers skip re-authentication and the device is never
//!   re-initialized behind the operator's back
//! - **Retries with Explicit Policy**: transient transport failures retry
//!   under a configurable backoff; the retryable/fatal boundary is an
//!   explicit, configurable classifier
//! - **Async/Await**: built on Tokio, one task per concurrent caller
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rnetsh::session::{
//!     CommandExecutor, ConnectionPool, ElevationConfig, PoolConfig, SshSessionFactory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rnetsh::error::SessionError> {
//!     let factory = SshSessionFactory::new("admin", "192.168.100.1", 22, "password");
//!     let pool = ConnectionPool::new(Arc::new(factory), PoolConfig::default());
//!
//!     let executor = CommandExecutor::new(pool.clone())
//!         .with_elevation(ElevationConfig::new("admin-secret"));
//!
//!     let output = executor.run("show config").await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::InteractiveSession`] - One authenticated shell channel with
//!   the framing state machine
//! - [`session::ConnectionPool`] - Bounded pool with privilege-aware reuse
//! - [`session::CommandExecutor`] - `run`/`run_batch` entry points with
//!   retry and privilege elevation
//! - [`prompt::PromptDetector`] - Pure prompt-boundary classification
//! - [`retry`] - Backoff policies and the retryable/fatal error classifier
//! - [`error::SessionError`] - Error taxonomy for all session operations

pub mod config;
pub mod error;
pub mod prompt;
pub mod retry;
pub mod session;
