//! Error types for session, pool, and executor operations.
//!
//! The taxonomy matters to callers: transport errors are the only class the
//! executor retries, framing timeouts and pool errors surface immediately,
//! and batch failures always carry the output accumulated before the failing
//! command.

use thiserror::Error;

/// Errors that can occur during session I/O, pooling, and command execution.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The shell channel broke: a write failed or the byte stream ended
    /// while a response was still expected.
    ///
    /// Transport errors discard the connection and are retryable up to the
    /// executor's policy limits.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An error occurred in the async-ssh2-tokio library while opening or
    /// driving the connection.
    #[error("ssh client error: {0}")]
    Ssh(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// The session has been closed; no further commands are accepted.
    #[error("session is closed")]
    SessionClosed,

    /// No prompt boundary was seen before the per-command deadline.
    ///
    /// Carries whatever output arrived before the deadline. Never retried;
    /// the caller decides whether the partial output is salvageable.
    #[error("no prompt boundary before deadline ({} bytes buffered)", partial.len())]
    FramingTimeout {
        /// Output accumulated before the deadline expired.
        partial: String,
    },

    /// Waiting for a pooled connection exceeded the acquire timeout.
    #[error("timeout waiting for available connection")]
    PoolExhausted,

    /// The pool has been closed; acquires fail fast.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The remote reported an application error in its own response text.
    ///
    /// The session and framing are healthy (the device answered and
    /// re-printed its prompt), so this is never retried and the connection
    /// is returned to the pool. Interpretation is left to the caller's
    /// parser.
    #[error("device rejected '{command}': {detail}")]
    CommandFailed {
        /// The command the device rejected.
        command: String,
        /// The matched error line from the response.
        detail: String,
    },

    /// Privilege elevation was rejected or did not reach the elevated prompt.
    #[error("privilege elevation failed: {0}")]
    AuthenticationFailed(String),

    /// The caller's cancellation token fired.
    ///
    /// Distinguishable from [`SessionError::FramingTimeout`]: the remote may
    /// still be healthy, the caller just stopped waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// All retry attempts were consumed by transient failures.
    #[error("command '{command}' failed after {attempts} attempts")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        #[source]
        source: Box<SessionError>,
    },

    /// A batch command failed part-way through.
    ///
    /// `partial` holds the combined output of every command that succeeded
    /// before `command`; it is never silently dropped.
    #[error("batch command '{command}' (index {index}) failed")]
    BatchCommandFailed {
        command: String,
        index: usize,
        partial: Vec<u8>,
        #[source]
        source: Box<SessionError>,
    },

    /// A configuration value could not be compiled or parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Output preserved by failures that interrupt a response mid-stream.
    ///
    /// Batch failures return the combined output of the commands that
    /// succeeded; framing timeouts return whatever arrived before the
    /// deadline.
    pub fn partial_output(&self) -> Option<&[u8]> {
        match self {
            SessionError::BatchCommandFailed { partial, .. } => Some(partial),
            SessionError::FramingTimeout { partial } => Some(partial.as_bytes()),
            SessionError::RetriesExhausted { source, .. } => source.partial_output(),
            _ => None,
        }
    }
}
