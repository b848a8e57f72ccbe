//! Interactive shell sessions, connection pooling, and command execution.
//!
//! This module owns the lifecycle of authenticated shell channels to a
//! network device: [`InteractiveSession`] frames individual commands against
//! the device's prompt, [`ConnectionPool`] bounds and reuses sessions with
//! their privilege mode intact, and [`CommandExecutor`] is the narrow
//! `run`/`run_batch` contract the translation layer calls.
//!
//! # Main Components
//!
//! - [`InteractiveSession`] - One shell channel with the framing state machine
//! - [`ConnectionPool`] / [`PooledConnection`] - Bounded checkout pool
//! - [`CommandExecutor`] - Retrying executor with privilege elevation
//! - [`SshSessionFactory`] - Opens authenticated shells over SSH
//! - [`ConnectionSecurityOptions`] - SSH algorithm profile selection

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::prompt::PromptDetector;

mod executor;
mod pool;
mod security;
mod shell;
mod transport;

pub use executor::{CommandExecutor, ElevationConfig};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use transport::{SessionFactory, ShellChannel, SshSessionFactory};

/// Framing state of an interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Construction state: banner output is discarded until the first
    /// prompt appears.
    AwaitingInitialPrompt,
    /// A prompt has been seen and no command is in flight.
    Idle,
    /// A command was written; output is accumulating until the next
    /// prompt boundary.
    AwaitingResponse,
    /// Terminal state, via explicit close or unrecoverable read error.
    Closed,
}

/// Tunables for a single interactive session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Per-command deadline for the read-until-prompt loop.
    ///
    /// Deliberately long: full configuration dumps and key generation run
    /// for minutes on small devices.
    pub command_timeout: Duration,
    /// Deadline for the banner/first-prompt phase on construction.
    pub initial_prompt_timeout: Duration,
    /// Deadline for short interactive exchanges (credential prompts,
    /// terminal setup).
    pub interact_timeout: Duration,
    /// Deadline for each step of the graceful shutdown dialogue.
    pub close_timeout: Duration,
    /// Command issued once after the first prompt to normalize terminal
    /// behavior. Failure is tolerated; some models do not support it.
    pub terminal_setup: Option<String>,
    /// Marker the device prints when asking for the elevation credential.
    pub credential_prompt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(180),
            initial_prompt_timeout: Duration::from_secs(15),
            interact_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            terminal_setup: Some("console character en.ascii".to_string()),
            credential_prompt: "Password:".to_string(),
        }
    }
}

/// One authenticated interactive shell on a remote device.
///
/// Owns the duplex byte stream exclusively; `send` takes `&mut self`, so at
/// most one command is in flight per session. Created by a
/// [`SessionFactory`] on pool miss, destroyed by graceful [`close`] or by
/// the pool discarding it.
///
/// [`close`]: InteractiveSession::close
#[derive(Debug)]
pub struct InteractiveSession {
    sender: Sender<String>,
    recv: Receiver<String>,
    detector: PromptDetector,
    config: SessionConfig,
    state: SessionState,
    privileged: bool,
    prompt: String,
}
