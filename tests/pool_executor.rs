//! Pool and executor behavior against an in-memory scripted device.
//!
//! The device task speaks just enough of an RTX-style dialogue to exercise
//! framing, elevation, and failure paths: a banner, `>` / `#` prompts, a
//! `Password:` challenge on `administrator`, canned output for everything
//! else, and a few trapdoor commands (`boom` reports an error line, `hang`
//! never answers, `drop` kills the connection).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rnetsh::error::SessionError;
use rnetsh::prompt::PromptDetector;
use rnetsh::retry::{ClassifierRules, ErrorClassifier, LinearBackoff};
use rnetsh::session::{
    CommandExecutor, ConnectionPool, ElevationConfig, InteractiveSession, PoolConfig,
    SessionConfig, SessionFactory, ShellChannel,
};

const USER_PROMPT: &str = "[router] > ";
const ADMIN_PROMPT: &str = "[router] # ";

fn session_config() -> SessionConfig {
    SessionConfig {
        command_timeout: Duration::from_millis(300),
        initial_prompt_timeout: Duration::from_millis(500),
        interact_timeout: Duration::from_millis(500),
        close_timeout: Duration::from_millis(100),
        terminal_setup: None,
        credential_prompt: "Password:".to_string(),
    }
}

fn pool_config(max_sessions: usize) -> PoolConfig {
    PoolConfig {
        max_sessions,
        idle_timeout: Duration::from_secs(60),
        acquire_timeout: Duration::from_millis(300),
        run_idle_reaper: false,
    }
}

fn spawn_device(elevations: Arc<AtomicUsize>) -> ShellChannel {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(32);
    let (out_tx, out_rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        if out_tx
            .send(format!("RTX1210 BootROM Ver.1.03\n{USER_PROMPT}"))
            .await
            .is_err()
        {
            return;
        }
        let mut privileged = false;
        let mut awaiting_secret = false;

        while let Some(line) = cmd_rx.recv().await {
            let cmd = line.trim_end().to_string();

            if awaiting_secret {
                awaiting_secret = false;
                privileged = true;
                if out_tx.send(format!("\n{ADMIN_PROMPT}")).await.is_err() {
                    break;
                }
                continue;
            }

            let prompt = if privileged { ADMIN_PROMPT } else { USER_PROMPT };
            match cmd.as_str() {
                "administrator" => {
                    elevations.fetch_add(1, Ordering::SeqCst);
                    awaiting_secret = true;
                    let _ = out_tx.send(format!("{cmd}\nPassword: ")).await;
                }
                "drop" => break,
                "hang" => {}
                "exit" => {
                    if privileged {
                        privileged = false;
                        let _ = out_tx.send(format!("{cmd}\n{USER_PROMPT}")).await;
                    } else {
                        break;
                    }
                }
                "boom" => {
                    let _ = out_tx
                        .send(format!("{cmd}\nError: bad command\n{prompt}"))
                        .await;
                }
                other => {
                    let _ = out_tx
                        .send(format!("{other}\noutput of {other}\n{prompt}"))
                        .await;
                }
            }
        }
    });

    ShellChannel::new(cmd_tx, out_rx)
}

struct ScriptedFactory {
    created: Arc<AtomicUsize>,
    elevations: Arc<AtomicUsize>,
    failing_creates: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            elevations: Arc::new(AtomicUsize::new(0)),
            failing_creates: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<InteractiveSession, SessionError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing_creates.load(Ordering::SeqCst) > 0 {
                self.failing_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(SessionError::Transport("connection refused".to_string()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut session = InteractiveSession::from_channel(
                spawn_device(self.elevations.clone()),
                PromptDetector::default(),
                session_config(),
            );
            session.start().await?;
            Ok(session)
        })
    }
}

struct Counters {
    created: Arc<AtomicUsize>,
    elevations: Arc<AtomicUsize>,
    failing_creates: Arc<AtomicUsize>,
}

fn make_pool(max_sessions: usize) -> (ConnectionPool, Counters) {
    let factory = ScriptedFactory::new();
    let counters = Counters {
        created: factory.created.clone(),
        elevations: factory.elevations.clone(),
        failing_creates: factory.failing_creates.clone(),
    };
    let pool = ConnectionPool::new(Arc::new(factory), pool_config(max_sessions));
    (pool, counters)
}

fn batch_classifier() -> ErrorClassifier {
    ErrorClassifier::from_rules(&ClassifierRules {
        command_error_patterns: vec!["^Error:".to_string()],
        ..Default::default()
    })
    .expect("rules compile")
}

#[tokio::test]
async fn acquire_then_release_restores_stats() {
    let (pool, _counters) = make_pool(2);

    let before = pool.stats().await;
    let conn = pool.acquire().await.expect("acquire");
    let during = pool.stats().await;
    assert_eq!(during.in_use, before.in_use + 1);

    pool.release(conn).await;
    let after = pool.stats().await;
    assert_eq!(after.in_use, before.in_use);
    assert_eq!(after.available, before.available + 1);
    assert_eq!(after.total_acquisitions, before.total_acquisitions + 1);
}

#[tokio::test]
async fn cycles_below_capacity_reuse_one_connection() {
    let (pool, counters) = make_pool(2);

    let mut first_id = None;
    for _ in 0..5 {
        let conn = pool.acquire().await.expect("acquire");
        match &first_id {
            None => first_id = Some(conn.pool_id().to_string()),
            Some(id) => assert_eq!(conn.pool_id(), id),
        }
        pool.release(conn).await;
    }

    let stats = pool.stats().await;
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_acquisitions, 5);
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn discard_never_returns_connection_to_available() {
    let (pool, counters) = make_pool(2);

    let conn = pool.acquire().await.expect("acquire");
    pool.discard(conn).await;

    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.total_created, 1);

    // The next acquire must dial a fresh connection.
    let conn = pool.acquire().await.expect("acquire after discard");
    assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    pool.release(conn).await;
}

#[tokio::test]
async fn foreign_connection_discard_is_a_no_op() {
    let (pool_a, _ca) = make_pool(2);
    let (pool_b, _cb) = make_pool(2);

    let conn_a = pool_a.acquire().await.expect("acquire a");
    let conn_b = pool_b.acquire().await.expect("acquire b");

    let before = pool_a.stats().await;
    pool_a.discard(conn_b).await;
    let after = pool_a.stats().await;
    assert_eq!(before, after);

    pool_a.release(conn_a).await;
}

#[tokio::test]
async fn closed_pool_fails_fast_and_close_is_idempotent() {
    let (pool, _counters) = make_pool(2);

    let conn = pool.acquire().await.expect("acquire");
    pool.close().await;
    pool.close().await;

    let err = pool.acquire().await.expect_err("acquire after close");
    assert!(matches!(err, SessionError::PoolClosed));

    // In-use connections are closed as they come back.
    pool.release(conn).await;
    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 0);
}

#[tokio::test]
async fn blocked_acquire_unblocks_with_same_connection() {
    let (pool, _counters) = make_pool(1);

    let conn = pool.acquire().await.expect("acquire");
    let first_id = conn.pool_id().to_string();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.release(conn).await;

    let conn = waiter
        .await
        .expect("join")
        .expect("acquire unblocks after release");
    assert_eq!(conn.pool_id(), first_id);
    assert_eq!(conn.use_count(), 2);
    pool.release(conn).await;
}

#[tokio::test]
async fn exhausted_pool_times_out_with_pool_error() {
    let (pool, _counters) = make_pool(1);

    let held = pool.acquire().await.expect("acquire");
    let started = Instant::now();
    let err = pool.acquire().await.expect_err("second acquire must time out");
    assert!(matches!(err, SessionError::PoolExhausted));
    assert!(started.elapsed() >= Duration::from_millis(280));
    pool.release(held).await;
}

#[tokio::test]
async fn cancellation_is_distinguishable_from_timeouts() {
    let (pool, _counters) = make_pool(1);

    let held = pool.acquire().await.expect("acquire");
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let executor = CommandExecutor::new(pool.clone());
    let err = executor
        .run_with_cancel("show version", &cancel)
        .await
        .expect_err("must cancel");
    assert!(matches!(err, SessionError::Cancelled));
    assert!(!matches!(err, SessionError::FramingTimeout { .. }));
    pool.release(held).await;
}

#[tokio::test]
async fn factory_failure_surfaces_from_acquire() {
    let (pool, counters) = make_pool(2);
    counters.failing_creates.store(1, Ordering::SeqCst);

    let err = pool.acquire().await.expect_err("dial failure");
    assert!(matches!(err, SessionError::Transport(_)));

    // Accounting recovered: the next acquire dials successfully.
    let conn = pool.acquire().await.expect("acquire after failure");
    assert_eq!(pool.stats().await.total_created, 1);
    pool.release(conn).await;
}

#[tokio::test]
async fn executor_runs_command_and_returns_prompt_bearing_output() {
    let (pool, _counters) = make_pool(2);
    let executor = CommandExecutor::new(pool.clone());

    let output = executor.run("show version").await.expect("run");
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("output of show version"));
    assert!(text.ends_with(USER_PROMPT));

    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 1);
}

#[tokio::test]
async fn retries_exhaust_after_transport_failures() {
    let (pool, counters) = make_pool(1);
    let executor = CommandExecutor::new(pool.clone()).with_retry_policy(Arc::new(
        LinearBackoff::new(Duration::from_millis(100), 2),
    ));

    let started = Instant::now();
    let err = executor.run("drop").await.expect_err("retries must exhaust");
    let elapsed = started.elapsed();

    match &err {
        SessionError::RetriesExhausted {
            command, attempts, ..
        } => {
            assert_eq!(command, "drop");
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
    // Two backoff sleeps of 100ms each separate the three attempts.
    assert!(elapsed >= Duration::from_millis(200));
    // A fourth attempt never occurs.
    assert_eq!(counters.created.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn framing_timeout_is_surfaced_without_retry() {
    let (pool, counters) = make_pool(1);
    let executor = CommandExecutor::new(pool.clone());

    let err = executor.run("hang").await.expect_err("must time out");
    assert!(matches!(err, SessionError::FramingTimeout { .. }));
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);

    // The wedged connection was discarded, not returned.
    let stats = pool.stats().await;
    assert_eq!(stats.available, 0);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn batch_preserves_partial_output_and_names_failing_command() {
    let (pool, _counters) = make_pool(2);
    let executor = CommandExecutor::new(pool.clone()).with_classifier(batch_classifier());

    let commands = vec![
        "show a".to_string(),
        "boom".to_string(),
        "show c".to_string(),
    ];
    let err = executor.run_batch(&commands).await.expect_err("batch fails");

    match &err {
        SessionError::BatchCommandFailed {
            command,
            index,
            partial,
            ..
        } => {
            assert_eq!(command, "boom");
            assert_eq!(*index, 1);
            let partial = String::from_utf8_lossy(partial);
            assert!(partial.contains("output of show a"));
            assert!(!partial.contains("show c"));
        }
        other => panic!("expected batch failure, got {other:?}"),
    }
    assert!(err.partial_output().is_some());
}

#[tokio::test]
async fn batch_runs_in_order_on_one_connection() {
    let (pool, counters) = make_pool(2);
    let executor = CommandExecutor::new(pool.clone()).with_classifier(batch_classifier());

    let commands = vec![
        "show a".to_string(),
        "show b".to_string(),
        "show c".to_string(),
    ];
    let output = executor.run_batch(&commands).await.expect("batch");
    let text = String::from_utf8(output).expect("utf8");

    let pos_a = text.find("output of show a").expect("a present");
    let pos_b = text.find("output of show b").expect("b present");
    let pos_c = text.find("output of show c").expect("c present");
    assert!(pos_a < pos_b && pos_b < pos_c);
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_batch_never_touches_the_pool() {
    let (pool, _counters) = make_pool(2);
    let executor = CommandExecutor::new(pool.clone());

    let output = executor.run_batch(&[]).await.expect("empty batch");
    assert!(output.is_empty());
    assert_eq!(pool.stats().await.total_acquisitions, 0);
}

#[tokio::test]
async fn privilege_survives_release_and_skips_reauthentication() {
    let (pool, counters) = make_pool(1);
    let executor = CommandExecutor::new(pool.clone())
        .with_elevation(ElevationConfig::new("admin-secret"));

    let first = executor.run("show config").await.expect("first run");
    assert!(String::from_utf8_lossy(&first).ends_with(ADMIN_PROMPT));

    let second = executor.run("show status").await.expect("second run");
    assert!(String::from_utf8_lossy(&second).ends_with(ADMIN_PROMPT));

    // One connection, one elevation: the drift-regression property.
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(counters.elevations.load(Ordering::SeqCst), 1);

    // The reused connection still carries the privileged flag.
    let conn = pool.acquire().await.expect("acquire");
    assert!(conn.privileged());
    pool.release(conn).await;
}
