use super::*;

use log::{debug, trace, warn};
use tokio::time::timeout;

use crate::error::SessionError;
use crate::prompt::{PromptHit, PromptMode};

/// Substrings (lowercased) that mark a rejected elevation credential.
const AUTH_FAILURE_MARKERS: &[&str] = &["incorrect", "failed", "invalid"];

/// Substrings (lowercased) that mark the "save configuration?" question some
/// devices ask when leaving privileged mode.
const SAVE_CONFIRMATION_MARKERS: &[&str] = &[
    "save configuration?",
    "save config?",
    "save changes?",
    "(y/n)",
    "(yes/no)",
    "設定を保存しますか",
    "保存しますか",
];

impl InteractiveSession {
    /// Wraps an already-open shell channel.
    ///
    /// The session starts in [`SessionState::AwaitingInitialPrompt`]; call
    /// [`start`](Self::start) before sending commands. Factories use this to
    /// build sessions over transports other than SSH (tests drive it with
    /// in-memory channels).
    pub fn from_channel(
        shell: ShellChannel,
        detector: PromptDetector,
        config: SessionConfig,
    ) -> Self {
        Self {
            sender: shell.tx,
            recv: shell.rx,
            detector,
            config,
            state: SessionState::AwaitingInitialPrompt,
            privileged: false,
            prompt: String::new(),
        }
    }

    /// Discards the login banner until the first prompt, then applies the
    /// optional terminal-setup command.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let hit = self
            .await_initial_prompt(self.config.initial_prompt_timeout)
            .await?;
        debug!("initial prompt detected: {:?}", hit.prompt);
        self.apply_prompt(&hit);
        self.state = SessionState::Idle;

        if let Some(setup) = self.config.terminal_setup.clone() {
            if let Err(err) = self
                .send_with_deadline(&setup, self.config.interact_timeout)
                .await
            {
                warn!("terminal setup command failed: {err} (continuing)");
            }
        }
        Ok(())
    }

    /// Executes a command and returns the raw response.
    ///
    /// The returned bytes include the trailing prompt (mode-revealing); the
    /// remote's echo of the command itself is located and stripped.
    /// Precondition: the session is not closed.
    pub async fn send(&mut self, command: &str) -> Result<Vec<u8>, SessionError> {
        self.send_with_deadline(command, self.config.command_timeout)
            .await
    }

    /// Current privilege mode flag.
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// The most recent prompt the device printed.
    pub fn last_prompt(&self) -> &str {
        &self.prompt
    }

    /// Current framing state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn send_with_deadline(
        &mut self,
        command: &str,
        deadline: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }

        trace!("send: {command:?}");
        self.drain_residue();
        self.write_line(command).await?;
        self.state = SessionState::AwaitingResponse;

        let mut buffer = String::new();
        let result = timeout(deadline, async {
            loop {
                match self.recv.recv().await {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        if let Some(hit) = self.detector.detect(buffer.as_bytes()) {
                            return Ok(hit);
                        }
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "shell channel closed while awaiting response".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match result {
            Err(_) => {
                debug!(
                    "no prompt boundary within {:?} ({} bytes buffered)",
                    deadline,
                    buffer.len()
                );
                Err(SessionError::FramingTimeout { partial: buffer })
            }
            Ok(Err(err)) => {
                self.state = SessionState::Closed;
                Err(err)
            }
            Ok(Ok(hit)) => {
                self.apply_prompt(&hit);
                self.state = SessionState::Idle;
                Ok(strip_echo(&buffer, command).into_bytes())
            }
        }
    }

    /// Elevates the session to privileged mode.
    ///
    /// Sends the elevation command, waits for the credential prompt (or an
    /// already-elevated prompt), supplies the secret, and verifies the
    /// privileged marker comes back. The privilege flag is set exactly once
    /// here; the framing states are untouched by it.
    pub async fn elevate(&mut self, command: &str, secret: &str) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        if self.privileged {
            trace!("session already privileged");
            return Ok(());
        }

        debug!("elevating session privilege");
        self.drain_residue();
        self.write_line(command).await?;

        match self.await_challenge().await? {
            Challenge::Credential => {}
            Challenge::Prompt(hit) if hit.mode == PromptMode::Privileged => {
                // The device skipped the credential (no secret configured
                // remotely, or elevation is implicit for this account).
                self.apply_prompt(&hit);
                return Ok(());
            }
            Challenge::Prompt(_) => {
                return Err(SessionError::AuthenticationFailed(
                    "elevation command was not accepted".to_string(),
                ));
            }
        }

        self.write_line(secret).await?;

        let (response, hit) = self
            .read_until_prompt(self.config.interact_timeout)
            .await?;
        let lowered = response.to_lowercase();
        if AUTH_FAILURE_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(SessionError::AuthenticationFailed(
                "device rejected the elevation credential".to_string(),
            ));
        }
        if hit.mode != PromptMode::Privileged {
            return Err(SessionError::AuthenticationFailed(format!(
                "expected privileged prompt, got {:?}",
                hit.prompt
            )));
        }
        self.apply_prompt(&hit);
        Ok(())
    }

    /// Gracefully shuts the session down. Idempotent.
    ///
    /// The dialogue is asymmetric because the remote nests an extra prompt
    /// layer while elevated: privileged sessions exit once back to user
    /// mode, decline the save-configuration question if asked, then exit
    /// again; user-mode sessions exit once. Shutdown failures are logged,
    /// not surfaced; the channel is torn down regardless.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        if self.privileged {
            debug!("closing privileged session: exit, optional decline, exit");
            if self.write_line("exit").await.is_ok() {
                match self.await_prompt_or_confirmation().await {
                    Ok(Farewell::SaveConfirmation) => {
                        // Never persist configuration implicitly.
                        let _ = self.write_line("N").await;
                        let _ = self.read_until_prompt(self.config.close_timeout).await;
                    }
                    Ok(Farewell::Prompt) => {}
                    Err(err) => debug!("error leaving privileged mode: {err}"),
                }
            }
            self.privileged = false;
            let _ = self.write_line("exit").await;
        } else {
            debug!("closing user-mode session: single exit");
            let _ = self.write_line("exit").await;
        }

        self.recv.close();
        self.state = SessionState::Closed;
        Ok(())
    }

    fn apply_prompt(&mut self, hit: &PromptHit) {
        self.prompt = hit.prompt.clone();
        self.privileged = hit.mode == PromptMode::Privileged;
    }

    /// Clears data left over from a previous exchange so stale bytes cannot
    /// satisfy the next boundary search.
    fn drain_residue(&mut self) {
        while self.recv.try_recv().is_ok() {}
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.sender
            .send(format!("{line}\n"))
            .await
            .map_err(|_| SessionError::Transport("shell channel closed on write".to_string()))
    }

    async fn await_initial_prompt(
        &mut self,
        deadline: Duration,
    ) -> Result<PromptHit, SessionError> {
        let mut buffer = String::new();
        let result = timeout(deadline, async {
            loop {
                match self.recv.recv().await {
                    Some(chunk) => {
                        trace!("banner chunk: {chunk:?}");
                        buffer.push_str(&chunk);
                        if let Some(hit) = self.detector.detect(buffer.as_bytes()) {
                            return Ok(hit);
                        }
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "shell channel closed during banner".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match result {
            Err(_) => Err(SessionError::FramingTimeout { partial: buffer }),
            Ok(Err(err)) => {
                self.state = SessionState::Closed;
                Err(err)
            }
            Ok(Ok(hit)) => Ok(hit),
        }
    }

    /// Waits for either the credential prompt or a full prompt boundary
    /// after sending the elevation command.
    async fn await_challenge(&mut self) -> Result<Challenge, SessionError> {
        let mut buffer = String::new();
        let marker = self.config.credential_prompt.clone();
        let result = timeout(self.config.interact_timeout, async {
            loop {
                match self.recv.recv().await {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        if buffer.contains(&marker) {
                            return Ok(Challenge::Credential);
                        }
                        if let Some(hit) = self.detector.detect(buffer.as_bytes()) {
                            return Ok(Challenge::Prompt(hit));
                        }
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "shell channel closed awaiting credential prompt".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match result {
            Err(_) => Err(SessionError::FramingTimeout { partial: buffer }),
            Ok(Err(err)) => {
                self.state = SessionState::Closed;
                Err(err)
            }
            Ok(Ok(challenge)) => Ok(challenge),
        }
    }

    /// Reads until a prompt boundary; returns accumulated text and the hit.
    async fn read_until_prompt(
        &mut self,
        deadline: Duration,
    ) -> Result<(String, PromptHit), SessionError> {
        let mut buffer = String::new();
        let result = timeout(deadline, async {
            loop {
                match self.recv.recv().await {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        if let Some(hit) = self.detector.detect(buffer.as_bytes()) {
                            return Ok(hit);
                        }
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "shell channel closed awaiting prompt".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match result {
            Err(_) => Err(SessionError::FramingTimeout { partial: buffer }),
            Ok(Err(err)) => {
                self.state = SessionState::Closed;
                Err(err)
            }
            Ok(Ok(hit)) => Ok((buffer, hit)),
        }
    }

    /// During shutdown: waits for either a prompt or the save-configuration
    /// question.
    async fn await_prompt_or_confirmation(&mut self) -> Result<Farewell, SessionError> {
        let mut buffer = String::new();
        let result = timeout(self.config.close_timeout, async {
            loop {
                match self.recv.recv().await {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        if is_save_confirmation(&buffer) {
                            return Ok(Farewell::SaveConfirmation);
                        }
                        if self.detector.detect(buffer.as_bytes()).is_some() {
                            return Ok(Farewell::Prompt);
                        }
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "shell channel closed during shutdown".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match result {
            Err(_) => Err(SessionError::FramingTimeout { partial: buffer }),
            Ok(inner) => inner,
        }
    }
}

enum Challenge {
    Credential,
    Prompt(PromptHit),
}

enum Farewell {
    Prompt,
    SaveConfirmation,
}

fn is_save_confirmation(text: &str) -> bool {
    let lowered = text.to_lowercase();
    SAVE_CONFIRMATION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Removes the echoed command line, keeping everything after it (including
/// the trailing prompt).
fn strip_echo(output: &str, command: &str) -> String {
    let mut start = 0;
    for line in output.split_inclusive('\n') {
        let end = start + line.len();
        if line.trim() == command.trim() {
            return output[end..].to_string();
        }
        start = end;
    }
    output.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    use crate::prompt::PromptDetector;

    fn test_config() -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_millis(500),
            initial_prompt_timeout: Duration::from_millis(500),
            interact_timeout: Duration::from_millis(500),
            close_timeout: Duration::from_millis(200),
            terminal_setup: None,
            credential_prompt: "Password:".to_string(),
        }
    }

    /// A hand-driven device: the test owns both channel ends directly.
    fn raw_session() -> (InteractiveSession, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let session = InteractiveSession::from_channel(
            ShellChannel::new(cmd_tx, out_rx),
            PromptDetector::default(),
            test_config(),
        );
        (session, cmd_rx, out_tx)
    }

    #[tokio::test]
    async fn banner_is_discarded_and_echo_stripped() {
        let (mut session, mut cmd_rx, out_tx) = raw_session();

        out_tx
            .send("Welcome to RTX1210\n[RTX1210] > ".to_string())
            .await
            .unwrap();
        session.start().await.expect("start");
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.last_prompt(), "[RTX1210] >");

        let device = tokio::spawn(async move {
            let line = cmd_rx.recv().await.unwrap();
            assert_eq!(line, "show version\n");
            out_tx
                .send("show version\nRTX1210 Rev.14\n[RTX1210] > ".to_string())
                .await
                .unwrap();
        });

        let output = session.send("show version").await.expect("send");
        device.await.unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "RTX1210 Rev.14\n[RTX1210] > "
        );
    }

    #[tokio::test]
    async fn silent_device_yields_framing_timeout_with_partial() {
        let (mut session, _cmd_rx, out_tx) = raw_session();
        out_tx.send("[RTX1210] > ".to_string()).await.unwrap();
        session.start().await.expect("start");

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = out_tx
                .send("show config\npartial line without prompt".to_string())
                .await;
        });
        let err = session.send("show config").await.expect_err("must time out");
        feeder.await.unwrap();
        match err {
            SessionError::FramingTimeout { partial } => {
                assert!(partial.contains("partial line without prompt"));
            }
            other => panic!("expected framing timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn elevation_sets_flag_and_detects_rejection() {
        let (mut session, mut cmd_rx, out_tx) = raw_session();
        out_tx.send("[RTX1210] > ".to_string()).await.unwrap();
        session.start().await.expect("start");

        let device = tokio::spawn(async move {
            assert_eq!(cmd_rx.recv().await.unwrap(), "administrator\n");
            out_tx.send("administrator\nPassword: ".to_string()).await.unwrap();
            assert_eq!(cmd_rx.recv().await.unwrap(), "secret\n");
            out_tx.send("\n[RTX1210] # ".to_string()).await.unwrap();
        });

        session.elevate("administrator", "secret").await.expect("elevate");
        device.await.unwrap();
        assert!(session.privileged());
        assert_eq!(session.last_prompt(), "[RTX1210] #");
    }

    #[tokio::test]
    async fn rejected_credential_is_authentication_failure() {
        let (mut session, mut cmd_rx, out_tx) = raw_session();
        out_tx.send("[RTX1210] > ".to_string()).await.unwrap();
        session.start().await.expect("start");

        let device = tokio::spawn(async move {
            assert_eq!(cmd_rx.recv().await.unwrap(), "administrator\n");
            out_tx.send("Password: ".to_string()).await.unwrap();
            let _ = cmd_rx.recv().await.unwrap();
            out_tx
                .send("Password incorrect\n[RTX1210] > ".to_string())
                .await
                .unwrap();
        });

        let err = session
            .elevate("administrator", "wrong")
            .await
            .expect_err("must fail");
        device.await.unwrap();
        assert!(matches!(err, SessionError::AuthenticationFailed(_)));
        assert!(!session.privileged());
    }

    #[tokio::test]
    async fn privileged_close_declines_save_confirmation() {
        let (mut session, cmd_rx, out_tx) = raw_session();
        out_tx.send("[RTX1210] # ".to_string()).await.unwrap();
        session.start().await.expect("start");
        assert!(session.privileged());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut cmd_rx = cmd_rx;
        let device = tokio::spawn(async move {
            while let Some(line) = cmd_rx.recv().await {
                let cmd = line.trim_end().to_string();
                let count = {
                    let mut seen = seen_clone.lock().unwrap();
                    seen.push(cmd.clone());
                    seen.len()
                };
                match (cmd.as_str(), count) {
                    ("exit", 1) => {
                        out_tx
                            .send("Save configuration? (Y/N)".to_string())
                            .await
                            .unwrap();
                    }
                    ("N", _) => {
                        out_tx.send("\n[RTX1210] > ".to_string()).await.unwrap();
                    }
                    _ => break,
                }
            }
        });

        session.close().await.expect("close");
        device.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*seen.lock().unwrap(), vec!["exit", "N", "exit"]);

        // Idempotent, and further sends are refused.
        session.close().await.expect("second close");
        let err = session.send("show config").await.expect_err("closed");
        assert!(matches!(err, SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn user_mode_close_sends_single_exit() {
        let (mut session, mut cmd_rx, out_tx) = raw_session();
        out_tx.send("[RTX1210] > ".to_string()).await.unwrap();
        session.start().await.expect("start");

        session.close().await.expect("close");
        assert_eq!(cmd_rx.recv().await.unwrap(), "exit\n");
        assert!(cmd_rx.try_recv().is_err());
    }
}
