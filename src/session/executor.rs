use super::*;

use std::sync::Arc;

use log::{debug, trace, warn};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::retry::{ErrorClassifier, LinearBackoff, RetryPolicy};

/// How to reach privileged mode on a connection that is not there yet.
#[derive(Clone)]
pub struct ElevationConfig {
    /// The elevation command ("administrator" on RTX-style devices).
    pub command: String,
    /// The secondary credential supplied at the device's password prompt.
    pub secret: String,
}

impl ElevationConfig {
    /// Elevation with the default `administrator` command.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            command: "administrator".to_string(),
            secret: secret.into(),
        }
    }

    /// Overrides the elevation command.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }
}

/// The `run`/`run_batch` contract the translation layer calls.
///
/// Composes the pool, a retry policy, and the error classifier. Safe for
/// concurrent use; each call checks out its own connection.
pub struct CommandExecutor {
    pool: ConnectionPool,
    retry: Arc<dyn RetryPolicy>,
    classifier: ErrorClassifier,
    elevation: Option<ElevationConfig>,
}

impl CommandExecutor {
    /// Executor with the default retry policy (two linear 100ms retries)
    /// and the default classifier.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            retry: Arc::new(LinearBackoff::new(Duration::from_millis(100), 2)),
            classifier: ErrorClassifier::default(),
            elevation: None,
        }
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    /// Replaces the retryable/fatal classifier.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Configures privilege elevation. When set, every command runs in
    /// privileged mode; devices answer read commands more completely
    /// there, and reuse keeps the cost to one elevation per connection.
    pub fn with_elevation(mut self, elevation: ElevationConfig) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Executes one command and returns the raw response including the
    /// trailing prompt.
    pub async fn run(&self, command: &str) -> Result<Vec<u8>, SessionError> {
        self.run_with_cancel(command, &CancellationToken::new())
            .await
    }

    /// [`run`](Self::run) that observes a cancellation token while waiting
    /// to acquire and between retry attempts. An in-flight `send` is not
    /// interrupted; the session's own deadline governs that.
    pub async fn run_with_cancel(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, SessionError> {
        debug!("device command: {command}");
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let mut conn = self.pool.acquire_with_cancel(cancel).await?;

            match self.execute_on(&mut conn, command).await {
                Ok(output) => {
                    self.pool.release(conn).await;
                    return Ok(output);
                }
                Err(err @ SessionError::CommandFailed { .. }) => {
                    // The device answered and re-printed its prompt; the
                    // connection is healthy even though the command failed.
                    self.pool.release(conn).await;
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "command execution failed (attempt {}): {err}",
                        attempt + 1
                    );
                    self.pool.discard(conn).await;

                    if !self.classifier.is_retryable(&err) {
                        return Err(err);
                    }
                    let (delay, give_up) = self.retry.next(attempt);
                    if give_up {
                        return Err(SessionError::RetriesExhausted {
                            command: command.to_string(),
                            attempts: attempt + 1,
                            source: Box::new(err),
                        });
                    }
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                    }
                }
            }
        }
    }

    /// Executes commands strictly in order on one connection.
    ///
    /// On command N's failure the returned error carries the output
    /// accumulated from commands 1..N-1 and names command N; earlier
    /// successful output is never dropped. Never retried internally, since a
    /// mid-batch replay could re-execute side-effecting commands. Empty
    /// input returns empty output without touching the pool.
    pub async fn run_batch(&self, commands: &[String]) -> Result<Vec<u8>, SessionError> {
        self.run_batch_with_cancel(commands, &CancellationToken::new())
            .await
    }

    /// [`run_batch`](Self::run_batch) observing a cancellation token while
    /// waiting to acquire.
    pub async fn run_batch_with_cancel(
        &self,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, SessionError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire_with_cancel(cancel).await?;

        if let Err(err) = self.ensure_privilege(&mut conn).await {
            self.pool.discard(conn).await;
            return Err(err);
        }

        let mut combined: Vec<u8> = Vec::new();
        for (index, command) in commands.iter().enumerate() {
            debug!("batch command [{index}]: {command}");
            match conn.send(command).await {
                Ok(output) => {
                    if let Some(detail) = self.classifier.command_failure(&output) {
                        self.pool.release(conn).await;
                        return Err(SessionError::BatchCommandFailed {
                            command: command.clone(),
                            index,
                            partial: combined,
                            source: Box::new(SessionError::CommandFailed {
                                command: command.clone(),
                                detail,
                            }),
                        });
                    }
                    combined.extend_from_slice(&output);
                }
                Err(err) => {
                    self.pool.discard(conn).await;
                    return Err(SessionError::BatchCommandFailed {
                        command: command.clone(),
                        index,
                        partial: combined,
                        source: Box::new(err),
                    });
                }
            }
        }

        self.pool.release(conn).await;
        Ok(combined)
    }

    async fn execute_on(
        &self,
        conn: &mut PooledConnection,
        command: &str,
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_privilege(conn).await?;
        let output = conn.send(command).await?;
        if let Some(detail) = self.classifier.command_failure(&output) {
            return Err(SessionError::CommandFailed {
                command: command.to_string(),
                detail,
            });
        }
        Ok(output)
    }

    /// Elevates the connection if elevation is configured and the pooled
    /// privilege (validated by credential hash) cannot be reused.
    async fn ensure_privilege(&self, conn: &mut PooledConnection) -> Result<(), SessionError> {
        let Some(elevation) = &self.elevation else {
            return Ok(());
        };

        let hash = secret_digest(&elevation.secret);
        if conn.privileged() && conn.elevation_hash() == Some(hash) {
            trace!("connection {} already privileged", conn.pool_id());
            return Ok(());
        }

        conn.elevate(&elevation.command, &elevation.secret).await?;
        conn.record_elevation(hash);
        Ok(())
    }
}

fn secret_digest(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}
