use super::*;

use std::future::Future;
use std::pin::Pin;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::Config;
use log::debug;
use russh::ChannelMsg;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// The duplex byte stream an [`InteractiveSession`] owns.
///
/// Writes go to `tx` as whole strings; reads arrive on `rx` as whatever
/// chunks the transport delivered. The SSH factory backs these with a
/// spawned channel pump; tests back them with plain in-memory channels.
pub struct ShellChannel {
    pub(super) tx: mpsc::Sender<String>,
    pub(super) rx: mpsc::Receiver<String>,
}

impl ShellChannel {
    /// Wraps a pair of channel halves as a shell stream.
    pub fn new(tx: mpsc::Sender<String>, rx: mpsc::Receiver<String>) -> Self {
        Self { tx, rx }
    }
}

/// Opens authenticated sessions for the pool.
///
/// The pool calls `create` outside its lock on every miss, so
/// implementations may be slow. Custom implementations let tests (and
/// non-SSH transports) inject sessions.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<InteractiveSession, SessionError>> + Send + '_>>;
}

/// Opens interactive shells over SSH.
pub struct SshSessionFactory {
    user: String,
    addr: String,
    port: u16,
    password: String,
    security: ConnectionSecurityOptions,
    detector: PromptDetector,
    session_config: SessionConfig,
}

impl SshSessionFactory {
    pub fn new(
        user: impl Into<String>,
        addr: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            addr: addr.into(),
            port,
            password: password.into(),
            security: ConnectionSecurityOptions::default(),
            detector: PromptDetector::default(),
            session_config: SessionConfig::default(),
        }
    }

    /// Selects the SSH algorithm profile and host-key check.
    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }

    /// Replaces the prompt detector new sessions are built with.
    pub fn with_detector(mut self, detector: PromptDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Replaces the per-session timeouts and setup command.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    async fn open_shell(&self) -> Result<ShellChannel, SessionError> {
        let device_addr = format!("{}@{}:{}", self.user, self.addr, self.port);

        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let client = Client::connect_with_config(
            (self.addr.clone(), self.port),
            &self.user,
            AuthMethod::with_password(&self.password),
            self.security.server_check.clone(),
            config,
        )
        .await?;
        debug!("{device_addr} TCP connection successful");

        let mut channel = client.get_channel().await?;
        // Wide terminal keeps long configuration lines unwrapped; filter
        // lists routinely exceed 200 columns.
        channel
            .request_pty(false, "vt100", 512, 48, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{device_addr} shell request successful");

        let (tx_in, mut rx_in) = mpsc::channel::<String>(256);
        let (tx_out, rx_out) = mpsc::channel::<String>(256);

        tokio::spawn(async move {
            // Moving the client in keeps the TCP connection alive for as
            // long as the pump runs.
            let _client = client;
            loop {
                tokio::select! {
                    outbound = rx_in.recv() => match outbound {
                        Some(data) => {
                            if let Err(e) = channel.data(data.as_bytes()).await {
                                debug!("{device_addr} failed to send data to shell: {e:?}");
                                break;
                            }
                        }
                        None => {
                            // Session dropped its sender; wind the channel down.
                            let _ = channel.eof().await;
                            break;
                        }
                    },
                    inbound = channel.wait() => match inbound {
                        Some(ChannelMsg::Data { ref data }) => {
                            if let Ok(s) = std::str::from_utf8(data)
                                && tx_out.send(s.to_string()).await.is_err()
                            {
                                debug!("{device_addr} shell output receiver dropped");
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("{device_addr} shell exited with status {exit_status}");
                            let _ = channel.eof().await;
                            break;
                        }
                        Some(ChannelMsg::Eof) | None => {
                            debug!("{device_addr} shell sent EOF");
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            debug!("{device_addr} SSH I/O task ended");
        });

        Ok(ShellChannel::new(tx_in, rx_out))
    }
}

impl SessionFactory for SshSessionFactory {
    fn create(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<InteractiveSession, SessionError>> + Send + '_>> {
        Box::pin(async move {
            let shell = self.open_shell().await?;
            let mut session = InteractiveSession::from_channel(
                shell,
                self.detector.clone(),
                self.session_config.clone(),
            );
            session.start().await?;
            Ok(session)
        })
    }
}
