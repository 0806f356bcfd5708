//! Bridge orchestration tests

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use test_case::test_case;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use super::heartbeat::HeartbeatError;
use super::*;
use crate::config::{BridgeUser, Secret, User};
use crate::hooks::{BrokerHooks, ConnectionValidatorContext, PublishContext, SubscriptionContext};
use crate::protocol::{ProtocolVersion, QoS, ReasonCode};
use crate::upstream::{LinkStatus, OutboundMessage, UpstreamError};

type Timeline = Arc<Mutex<Vec<&'static str>>>;

struct FakeUpstream {
    /// Scripted connect results; an empty script succeeds
    script: Mutex<VecDeque<bool>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    fail_publish: AtomicBool,
    publishes: Mutex<Vec<OutboundMessage>>,
    timeline: Timeline,
    events: broadcast::Sender<LinkEvent>,
}

impl FakeUpstream {
    fn new(timeline: Timeline, script: &[bool]) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            publishes: Mutex::new(Vec::new()),
            timeline,
            events,
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Disconnected {
            reason: "connection reset".to_string(),
        });
    }
}

#[async_trait]
impl UpstreamLink for FakeUpstream {
    async fn connect(
        &self,
        _options: &UpstreamOptions,
        _cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.timeline.lock().push("connect");
        let ok = self.script.lock().pop_front().unwrap_or(true);
        if ok {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(UpstreamError::ConnectionLost("connection refused".to_string()))
        }
    }

    async fn publish(
        &self,
        message: OutboundMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        self.publishes.lock().push(message);
        if self.fail_publish.load(Ordering::SeqCst) {
            Err(UpstreamError::NotConnected)
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.timeline.lock().push("disconnect");
    }

    fn status(&self) -> LinkStatus {
        if self.connected.load(Ordering::SeqCst) {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

struct FakeBroker {
    timeline: Timeline,
    fail: bool,
    hooks: Mutex<Option<BrokerHooks>>,
}

impl FakeBroker {
    fn new(timeline: Timeline) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            fail: false,
            hooks: Mutex::new(None),
        })
    }

    fn failing(timeline: Timeline) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            fail: true,
            hooks: Mutex::new(None),
        })
    }
}

#[async_trait]
impl LocalBrokerAdapter for FakeBroker {
    async fn start(
        &self,
        hooks: BrokerHooks,
        _cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.timeline.lock().push("broker_start");
        if self.fail {
            return Err(BrokerError::Bind {
                addr: "0.0.0.0:1883".parse().unwrap(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        *self.hooks.lock() = Some(hooks);
        Ok(())
    }
}

#[derive(Default)]
struct CountingProbe {
    samples: AtomicUsize,
    fail: bool,
}

impl MemoryProbe for CountingProbe {
    fn sample(&self) -> Result<MemorySample, HeartbeatError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(HeartbeatError::ProcessNotFound);
        }
        Ok(MemorySample {
            resident_bytes: 12 * 1024 * 1024,
            virtual_bytes: 64 * 1024 * 1024,
            system_used_bytes: 1024 * 1024 * 1024,
            system_total_bytes: 4 * 1024 * 1024 * 1024,
        })
    }
}

fn test_config() -> Config {
    Config {
        bridge_url: "upstream.example.com".to_string(),
        bridge_user: Some(BridgeUser {
            user_name: "bridge".to_string(),
            password: Secret::new("bridge-secret"),
            client_id: "bridge-01".to_string(),
        }),
        users: vec![User::new("u1", "p1")],
        ..Default::default()
    }
}

fn test_options() -> UpstreamOptions {
    UpstreamOptions::from_config(&test_config()).unwrap()
}

fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

fn orchestrator(
    config: Config,
    upstream: Arc<FakeUpstream>,
    broker: Arc<FakeBroker>,
    probe: Arc<CountingProbe>,
) -> BridgeOrchestrator {
    BridgeOrchestrator::new(config, upstream, broker, probe)
}

/// Poll until `condition` holds, failing after a generous virtual timeout
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

fn endpoint() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn connect_context(username: Option<&str>, password: Option<&'static str>) -> ConnectionValidatorContext {
    ConnectionValidatorContext {
        client_id: "sensor-1".to_string(),
        endpoint: endpoint(),
        username: username.map(str::to_string),
        password: password.map(|p| Bytes::from_static(p.as_bytes())),
        clean_session: true,
        protocol_version: ProtocolVersion::V311,
    }
}

fn callback_hooks(upstream: Arc<FakeUpstream>, log_password_on_failure: bool) -> BrokerHooks {
    BridgeCallbacks::new(
        CredentialStore::new(&[User::new("u1", "p1")]),
        upstream,
        log_password_on_failure,
        CancellationToken::new(),
    )
    .into_hooks()
}

#[test_case(0, 1; "first attempt")]
#[test_case(1, 2; "second attempt")]
#[test_case(2, 4; "third attempt")]
#[test_case(3, 8; "fourth attempt")]
#[test_case(4, 16; "fifth attempt")]
#[test_case(5, 32; "sixth attempt")]
#[test_case(6, 60; "capped")]
#[test_case(40, 60; "large attempt stays capped")]
#[test_case(100, 60; "overflowing exponent stays capped")]
fn test_backoff_delay(attempt: u32, expected_secs: u64) {
    assert_eq!(
        backoff_delay(attempt, Duration::from_secs(60)),
        Duration::from_secs(expected_secs)
    );
}

#[test]
fn test_retry_state_counts_and_resets() {
    let mut retry = RetryState::default();
    assert_eq!(retry.attempts(), 0);
    retry.record_failure();
    retry.record_failure();
    assert_eq!(retry.attempts(), 2);
    retry.reset();
    assert_eq!(retry.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnector_counts_failures_then_resets() {
    let upstream = FakeUpstream::new(timeline(), &[false, false, true]);
    let reconnector = Reconnector::new(
        upstream.clone(),
        test_options(),
        Duration::from_secs(60),
        false,
    );
    let cancel = CancellationToken::new();
    let started = Instant::now();

    assert_eq!(reconnector.handle_link_lost(&cancel).await, ReconnectOutcome::Failed);
    assert_eq!(reconnector.attempts(), 1);

    assert_eq!(reconnector.handle_link_lost(&cancel).await, ReconnectOutcome::Failed);
    assert_eq!(reconnector.attempts(), 2);

    assert_eq!(reconnector.handle_link_lost(&cancel).await, ReconnectOutcome::Connected);
    assert_eq!(reconnector.attempts(), 0);

    // 1s + 2s + 4s of backoff
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(upstream.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconnector_retry_until_connected_loops() {
    let upstream = FakeUpstream::new(timeline(), &[false, false, false, true]);
    let reconnector = Reconnector::new(
        upstream.clone(),
        test_options(),
        Duration::from_secs(2),
        true,
    );

    let outcome = reconnector.handle_link_lost(&CancellationToken::new()).await;
    assert_eq!(outcome, ReconnectOutcome::Connected);
    assert_eq!(upstream.connects(), 4);
    assert_eq!(reconnector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnector_skips_when_already_connected() {
    let upstream = FakeUpstream::new(timeline(), &[]);
    upstream.connected.store(true, Ordering::SeqCst);
    let reconnector = Reconnector::new(upstream.clone(), test_options(), Duration::from_secs(60), false);

    let outcome = reconnector.handle_link_lost(&CancellationToken::new()).await;
    assert_eq!(outcome, ReconnectOutcome::AlreadyConnected);
    assert_eq!(upstream.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_link_loss_is_handled_in_turn() {
    let upstream = FakeUpstream::new(timeline(), &[false, true]);
    let reconnector = Reconnector::new(
        upstream.clone(),
        test_options(),
        Duration::from_secs(60),
        false,
    );
    let cancel = CancellationToken::new();
    let started = Instant::now();

    let (first, second) = tokio::join!(
        reconnector.handle_link_lost(&cancel),
        reconnector.handle_link_lost(&cancel)
    );

    assert_eq!(first, ReconnectOutcome::Failed);
    assert_eq!(second, ReconnectOutcome::Connected);
    assert_eq!(upstream.connects(), 2);
    // The second handler saw the first failure: 1s then 2s
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(reconnector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_link_loss_after_success_is_skipped() {
    let upstream = FakeUpstream::new(timeline(), &[true]);
    let reconnector = Reconnector::new(
        upstream.clone(),
        test_options(),
        Duration::from_secs(60),
        false,
    );
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        reconnector.handle_link_lost(&cancel),
        reconnector.handle_link_lost(&cancel)
    );

    assert_eq!(first, ReconnectOutcome::Connected);
    assert_eq!(second, ReconnectOutcome::AlreadyConnected);
    assert_eq!(upstream.connects(), 1);
    assert_eq!(reconnector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_readable_during_backoff() {
    let upstream = FakeUpstream::new(timeline(), &[false, true]);
    let reconnector = Arc::new(Reconnector::new(
        upstream.clone(),
        test_options(),
        Duration::from_secs(60),
        false,
    ));
    let cancel = CancellationToken::new();

    assert_eq!(reconnector.handle_link_lost(&cancel).await, ReconnectOutcome::Failed);

    let handler = {
        let reconnector = reconnector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reconnector.handle_link_lost(&cancel).await })
    };
    // Part way into the 2s backoff the handler still holds the retry lock
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!handler.is_finished());
    assert_eq!(reconnector.attempts(), 1);

    assert_eq!(handler.await.unwrap(), ReconnectOutcome::Connected);
    assert_eq!(reconnector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnector_cancelled_during_backoff() {
    let upstream = FakeUpstream::new(timeline(), &[]);
    let reconnector = Reconnector::new(upstream.clone(), test_options(), Duration::from_secs(60), false);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(reconnector.handle_link_lost(&cancel).await, ReconnectOutcome::Cancelled);
    assert_eq!(upstream.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_connects_upstream_before_broker() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    assert_ok!(bridge.start().await);

    assert_eq!(bridge.state(), BridgeState::Running);
    assert_eq!(*timeline.lock(), vec!["connect", "broker_start"]);
    assert!(upstream.is_connected());

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_makes_no_connection() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let config = Config {
        users: Vec::new(),
        ..test_config()
    };
    let bridge = orchestrator(
        config,
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    let err = assert_err!(bridge.start().await);
    match err {
        BridgeError::Config(e) => assert_eq!(e.field(), Some("users")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(upstream.connects(), 0);
    assert!(timeline.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
    let timeline = timeline();
    let bridge = orchestrator(
        test_config(),
        FakeUpstream::new(timeline.clone(), &[]),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    assert_ok!(bridge.start().await);
    assert!(matches!(bridge.start().await, Err(BridgeError::AlreadyRunning)));
    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_failure_stops_bridge() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        FakeBroker::failing(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    let err = assert_err!(bridge.start().await);
    assert!(matches!(err, BridgeError::Broker(BrokerError::Bind { .. })));
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(*timeline.lock(), vec!["connect", "broker_start", "disconnect"]);
    assert!(!upstream.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_is_retried() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[false, true]);
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    assert_ok!(bridge.start().await);
    assert_eq!(timeline.lock()[..2], ["connect", "broker_start"]);

    wait_until(|| upstream.connects() == 2).await;
    wait_until(|| bridge.state() == BridgeState::Running).await;
    assert!(upstream.is_connected());
    assert_eq!(bridge.retry_attempts(), 0);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_triggers_reconnect() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[true, false, true]);
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );
    assert_ok!(bridge.start().await);

    upstream.drop_link();
    wait_until(|| upstream.connects() == 2).await;
    assert!(!upstream.is_connected());
    assert_eq!(bridge.retry_attempts(), 1);

    // The next event retries with the longer backoff
    upstream.drop_link();
    wait_until(|| upstream.connects() == 3).await;
    assert!(upstream.is_connected());
    assert_eq!(bridge.retry_attempts(), 0);
    wait_until(|| bridge.state() == BridgeState::Running).await;

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_halts_heartbeat() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let probe = Arc::new(CountingProbe::default());
    let config = Config {
        delay_in_milliseconds: 1_000,
        ..test_config()
    };
    let bridge = orchestrator(
        config,
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        probe.clone(),
    );

    // Stop before start does nothing
    bridge.stop().await;
    assert!(timeline.lock().is_empty());

    assert_ok!(bridge.start().await);
    wait_until(|| probe.samples.load(Ordering::SeqCst) >= 3).await;

    bridge.stop().await;
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(bridge.cancellation_token().is_cancelled());
    bridge.stop().await;
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let samples = probe.samples.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.samples.load(Ordering::SeqCst), samples);
    assert_eq!(
        timeline.lock().iter().filter(|e| **e == "disconnect").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_bridge_restarts_after_stop() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        FakeBroker::new(timeline.clone()),
        Arc::new(CountingProbe::default()),
    );

    assert_ok!(bridge.start().await);
    bridge.stop().await;
    assert_ok!(bridge.start().await);

    assert_eq!(bridge.state(), BridgeState::Running);
    assert!(!bridge.cancellation_token().is_cancelled());
    assert_eq!(upstream.connects(), 2);
    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_survives_probe_failure() {
    let probe = Arc::new(CountingProbe {
        fail: true,
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let task = tokio::spawn(heartbeat::run(
        "MqttBridge".to_string(),
        Duration::from_secs(1),
        probe.clone(),
        cancel.clone(),
    ));

    wait_until(|| probe.samples.load(Ordering::SeqCst) >= 3).await;
    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn test_sysinfo_probe_reads_current_process() {
    let probe = SysinfoProbe::new().unwrap();
    let sample = probe.sample().unwrap();
    assert!(sample.resident_bytes > 0);
    assert!(sample.system_total_bytes >= sample.system_used_bytes);
}

#[tokio::test]
async fn test_publish_callback_forwards_once() {
    let upstream = FakeUpstream::new(timeline(), &[]);
    let hooks = callback_hooks(upstream.clone(), false);

    let accepted = hooks
        .intercept_publish(&PublishContext {
            client_id: "sensor-1".to_string(),
            topic: "t/1".to_string(),
            payload: Bytes::from_static(&[0x01, 0x02]),
            qos: QoS::AtLeastOnce,
            retain: false,
        })
        .await;

    assert!(accepted);
    assert_eq!(
        *upstream.publishes.lock(),
        vec![OutboundMessage {
            topic: "t/1".to_string(),
            payload: Bytes::from_static(&[0x01, 0x02]),
            qos: QoS::AtLeastOnce,
            retain: false,
        }]
    );
}

#[tokio::test]
async fn test_publish_callback_accepts_when_upstream_fails() {
    let upstream = FakeUpstream::new(timeline(), &[]);
    upstream.fail_publish.store(true, Ordering::SeqCst);
    let hooks = callback_hooks(upstream.clone(), false);

    let accepted = hooks
        .intercept_publish(&PublishContext {
            client_id: "sensor-1".to_string(),
            topic: "status".to_string(),
            payload: Bytes::from("offline"),
            qos: QoS::AtMostOnce,
            retain: true,
        })
        .await;

    assert!(accepted);
    assert_eq!(upstream.publishes.lock().len(), 1);
}

#[test_case(Some("u1"), Some("p1"), ReasonCode::Success; "valid credentials")]
#[test_case(Some("u1"), Some("wrong"), ReasonCode::BadUserNameOrPassword; "wrong password")]
#[test_case(Some("nobody"), Some("p1"), ReasonCode::BadUserNameOrPassword; "unknown user")]
#[test_case(None, None, ReasonCode::BadUserNameOrPassword; "anonymous")]
#[test_case(Some("U1"), Some("p1"), ReasonCode::BadUserNameOrPassword; "user name is case sensitive")]
#[tokio::test]
async fn test_connection_validator(
    username: Option<&str>,
    password: Option<&'static str>,
    expected: ReasonCode,
) {
    for log_password_on_failure in [false, true] {
        let hooks = callback_hooks(FakeUpstream::new(timeline(), &[]), log_password_on_failure);
        let code = hooks
            .validate_connection(&connect_context(username, password))
            .await;
        assert_eq!(code, expected);
    }
}

#[test_case("sensors/+/temp"; "single level wildcard")]
#[test_case("#"; "multi level wildcard")]
#[test_case(""; "empty filter")]
#[tokio::test]
async fn test_subscription_interceptor_accepts_everything(filter: &str) {
    let hooks = callback_hooks(FakeUpstream::new(timeline(), &[]), false);
    let accepted = hooks
        .intercept_subscription(&SubscriptionContext {
            client_id: "sensor-1".to_string(),
            topic_filter: filter.to_string(),
            qos: QoS::ExactlyOnce,
        })
        .await;
    assert!(accepted);
}

#[tokio::test]
async fn test_orchestrator_binds_callbacks_to_broker() {
    let timeline = timeline();
    let upstream = FakeUpstream::new(timeline.clone(), &[]);
    let broker = FakeBroker::new(timeline.clone());
    let bridge = orchestrator(
        test_config(),
        upstream.clone(),
        broker.clone(),
        Arc::new(CountingProbe::default()),
    );
    assert_ok!(bridge.start().await);

    let hooks = broker.hooks.lock().clone().unwrap();
    assert_eq!(
        hooks
            .validate_connection(&connect_context(Some("u1"), Some("p1")))
            .await,
        ReasonCode::Success
    );
    hooks
        .intercept_publish(&PublishContext {
            client_id: "sensor-1".to_string(),
            topic: "t/1".to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
            retain: false,
        })
        .await;
    hooks.client_disconnected("sensor-1", endpoint(), true).await;
    assert_eq!(upstream.publishes.lock().len(), 1);

    bridge.stop().await;
}
