//! End-to-end tests for `TcpServerOutput` over loopback sockets.
//!
//! Each test starts a real server, talks to it with the `Collector` client
//! (or raw sockets), and checks what arrives on the wire together with the
//! server's lifecycle state.
//!
//! ```text
//! test ── startup() ──► TcpServerOutput ◄── TCP ── Collector
//!   │                        │
//!   └── write_execution_data / shutdown
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mockall::mock;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use covstream_agent::application::output::{render_chain, AgentOutput, ExceptionLogger};
use covstream_agent::application::registration::{RegistrationMessage, RegistrationNotifier};
use covstream_agent::infrastructure::network::collector::{Collector, CollectorError};
use covstream_agent::infrastructure::network::server::{
    AcceptLoopState, OutputError, ServerSettings, TcpServerOutput,
};
use covstream_agent::infrastructure::network::session::SessionError;
use covstream_core::protocol::Block;
use covstream_core::{ExecutionDataSource, ExecutionStore};

const WAIT: Duration = Duration::from_secs(5);
const REGISTRY: &str = "http://registry.test/apps/42";

mock! {
    Notifier {}
    impl RegistrationNotifier for Notifier {
        fn notify(&self, url: &str, message: &RegistrationMessage);
    }
}

#[derive(Default)]
struct RecordingLogger {
    errors: Mutex<Vec<String>>,
}

impl RecordingLogger {
    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExceptionLogger for RecordingLogger {
    fn log_exception(&self, error: &(dyn std::error::Error + 'static)) {
        self.errors.lock().unwrap().push(render_chain(error));
    }
}

/// Serves a fixed byte string as the snapshot.
struct FixedSource(Vec<u8>);

impl ExecutionDataSource for FixedSource {
    fn serialize_current(&self) -> Vec<u8> {
        self.0.clone()
    }
    fn reset(&self) {}
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn settings(port: u16) -> ServerSettings {
    ServerSettings {
        address: "127.0.0.1".to_string(),
        port,
        registry_url: Some(REGISTRY.to_string()),
    }
}

fn store_with_hit() -> Arc<ExecutionStore> {
    let store = Arc::new(ExecutionStore::new("it"));
    store.register(10, "app/Main", 4);
    store.hit(10, 3);
    store
}

fn quiet_notifier() -> Arc<MockNotifier> {
    let mut notifier = MockNotifier::new();
    notifier.expect_notify().times(0);
    Arc::new(notifier)
}

async fn started(
    data: Arc<dyn ExecutionDataSource>,
    logger: Arc<RecordingLogger>,
) -> TcpServerOutput {
    let output = TcpServerOutput::new(settings(0), data, logger).with_notifier(quiet_notifier());
    assert_ok!(output.startup().await);
    output
}

async fn connect(output: &TcpServerOutput) -> Collector {
    let addr = output.local_addr().expect("server is listening");
    timeout(WAIT, Collector::connect(addr))
        .await
        .expect("handshake timed out")
        .expect("handshake failed")
}

// ── Binding ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_free_port_is_bound_exactly_without_notification() {
    // Arrange
    let port = free_port();
    let output = TcpServerOutput::new(
        settings(port),
        store_with_hit(),
        Arc::new(RecordingLogger::default()),
    )
    .with_notifier(quiet_notifier());

    // Act
    assert_ok!(output.startup().await);

    // Assert
    assert_eq!(output.local_addr().unwrap().port(), port);
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_occupied_port_falls_back_to_next_and_notifies_registry_once() {
    // Arrange: someone else already listens on the configured port
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = holder.local_addr().unwrap().port();
    let expected = taken + 1;

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(move |url, message| {
            url == REGISTRY && *message == RegistrationMessage::update_port(expected)
        })
        .times(1)
        .return_const(());
    let output = TcpServerOutput::new(
        settings(taken),
        store_with_hit(),
        Arc::new(RecordingLogger::default()),
    )
    .with_notifier(Arc::new(notifier));

    // Act
    assert_ok!(output.startup().await);

    // Assert
    assert_eq!(output.local_addr().unwrap().port(), expected);
    let mut collector = connect(&output).await;
    assert_ok!(collector.request_dump(false).await);
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_wildcard_address_accepts_loopback_connections() {
    let output = TcpServerOutput::new(
        ServerSettings {
            address: "*".to_string(),
            port: 0,
            registry_url: None,
        },
        store_with_hit(),
        Arc::new(RecordingLogger::default()),
    );
    assert_ok!(output.startup().await);

    let addr = output.local_addr().unwrap();
    assert!(addr.ip().is_unspecified());
    let loopback = std::net::SocketAddr::from(([127, 0, 0, 1], addr.port()));
    let collector = timeout(WAIT, Collector::connect(loopback)).await.unwrap();
    assert_ok!(collector);

    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_unresolvable_address_fails_startup() {
    let output = TcpServerOutput::new(
        ServerSettings {
            address: "no-such-host.invalid".to_string(),
            port: 0,
            registry_url: None,
        },
        store_with_hit(),
        Arc::new(RecordingLogger::default()),
    );

    let err = assert_err!(output.startup().await);
    assert!(matches!(err, OutputError::Address(_)));
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successive_collectors_are_served_one_after_another() {
    // Arrange
    let store = store_with_hit();
    let logger = Arc::new(RecordingLogger::default());
    let output = started(store.clone(), logger.clone()).await;

    // Act: first collector comes and goes, second one stays
    drop(connect(&output).await);
    let mut second = connect(&output).await;
    assert_ok!(output.write_execution_data(false).await);

    // Assert: the snapshot reached the second collector
    let first_block = assert_ok!(second.next_block(WAIT).await);
    assert!(matches!(first_block, Block::SessionInfo(ref info) if info.id == "it"));
    let second_block = assert_ok!(second.next_block(WAIT).await);
    assert!(matches!(second_block, Block::ExecutionData(ref r) if r.class_id == 10));
    assert_eq!(store.snapshot().1.len(), 1, "reset=false keeps the data");

    assert_ok!(output.shutdown().await);
    assert!(logger.errors().is_empty(), "{:?}", logger.errors());
}

#[tokio::test]
async fn test_write_with_reset_clears_data_after_delivery() {
    let store = store_with_hit();
    let output = started(store.clone(), Arc::new(RecordingLogger::default())).await;
    let mut collector = connect(&output).await;

    assert_ok!(output.write_execution_data(true).await);

    let dump = assert_ok!(collector.collect_until_idle(Duration::from_millis(300)).await);
    assert_eq!(dump.records.len(), 1);
    assert!(store.snapshot().1.is_empty());
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_collector_dump_command_with_reset() {
    // Arrange
    let store = store_with_hit();
    let output = started(store, Arc::new(RecordingLogger::default())).await;
    let mut collector = connect(&output).await;

    // Act
    let first = assert_ok!(collector.request_dump(true).await);
    let second = assert_ok!(collector.request_dump(false).await);

    // Assert
    assert_eq!(first.sessions.len(), 1);
    assert_eq!(first.records.len(), 1);
    assert_eq!(second.sessions.len(), 1);
    assert!(second.records.is_empty());
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_reset_only_command_is_acknowledged() {
    let store = store_with_hit();
    let output = started(store.clone(), Arc::new(RecordingLogger::default())).await;
    let mut collector = connect(&output).await;

    assert_ok!(collector.request_reset().await);

    assert!(store.snapshot().1.is_empty());
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_write_without_collector_succeeds() {
    let output = started(store_with_hit(), Arc::new(RecordingLogger::default())).await;

    assert_ok!(output.write_execution_data(false).await);
    assert!(output.active_peer().is_none());

    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_collector_disconnect_drops_writes_then_next_collector_is_served() {
    // Arrange: 128 bytes of CmdOk blocks stand in for a snapshot
    let data = Arc::new(FixedSource(vec![0x20; 128]));
    let output = started(data, Arc::new(RecordingLogger::default())).await;
    drop(connect(&output).await);

    // Act: keep writing until the server has closed the departed session
    let mut outcomes = Vec::new();
    for _ in 0..100 {
        outcomes.push(output.write_execution_data(false).await);
        if output.active_peer().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Assert: only an in-flight I/O failure may surface; afterwards writes
    // are dropped silently
    assert!(output.active_peer().is_none(), "session was never closed");
    for outcome in &outcomes {
        assert!(
            matches!(outcome, Ok(()) | Err(OutputError::Session(SessionError::Io(_)))),
            "unexpected outcome {outcome:?}"
        );
    }
    assert_ok!(output.write_execution_data(false).await);
    let mut next = connect(&output).await;
    assert_ok!(output.write_execution_data(false).await);
    assert_eq!(assert_ok!(next.next_block(WAIT).await), Block::CmdOk);
    assert_ok!(output.shutdown().await);
}

#[tokio::test]
async fn test_concurrent_snapshots_and_command_replies_do_not_interleave() {
    // Arrange
    let output = Arc::new(started(store_with_hit(), Arc::new(RecordingLogger::default())).await);
    let mut collector = connect(&output).await;

    // Act: agent-initiated snapshots race with collector-requested dumps
    let writer = tokio::spawn({
        let output = output.clone();
        async move {
            for _ in 0..20 {
                output.write_execution_data(false).await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, OutputError>(())
        }
    });
    for _ in 0..5 {
        // Any torn block would surface as a protocol or unexpected-block error.
        let dump = assert_ok!(collector.request_dump(false).await);
        assert!(!dump.sessions.is_empty());
    }

    // Assert
    assert_ok!(timeout(WAIT, writer).await.unwrap().unwrap());
    assert_ok!(output.shutdown().await);
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_while_waiting_for_connection_is_clean() {
    // Arrange
    let logger = Arc::new(RecordingLogger::default());
    let output = started(store_with_hit(), logger.clone()).await;
    let addr = output.local_addr().unwrap();
    tokio::task::yield_now().await;

    // Act
    assert_ok!(timeout(WAIT, output.shutdown()).await.unwrap());

    // Assert
    assert_eq!(output.accept_loop_state(), AcceptLoopState::Stopped);
    assert!(logger.errors().is_empty(), "{:?}", logger.errors());
    assert_err!(TcpStream::connect(addr).await);
}

#[tokio::test]
async fn test_shutdown_closes_the_connected_collector() {
    // Arrange
    let logger = Arc::new(RecordingLogger::default());
    let output = started(store_with_hit(), logger.clone()).await;
    let mut collector = connect(&output).await;

    // Act
    assert_ok!(timeout(WAIT, output.shutdown()).await.unwrap());

    // Assert
    assert!(matches!(
        collector.next_block(WAIT).await,
        Err(CollectorError::Closed | CollectorError::Io(_))
    ));
    assert!(logger.errors().is_empty(), "{:?}", logger.errors());
    assert!(output.active_peer().is_none());
    assert_ok!(output.write_execution_data(false).await);
}

#[tokio::test]
async fn test_lifecycle_misuse_is_reported() {
    let output = TcpServerOutput::new(
        settings(0),
        store_with_hit(),
        Arc::new(RecordingLogger::default()),
    );

    assert!(matches!(
        output.shutdown().await,
        Err(OutputError::NotStarted)
    ));
    assert_ok!(output.startup().await);
    assert!(matches!(
        output.startup().await,
        Err(OutputError::AlreadyStarted)
    ));
    assert_ok!(output.shutdown().await);
    assert_ok!(output.shutdown().await, "second shutdown is a no-op");
}
