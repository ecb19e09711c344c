//! End-to-end consumer tests against an in-memory queue.
//!
//! The mock queue models SQS visibility semantics: received messages become
//! invisible until their visibility timeout passes, visibility changes move
//! the deadline, deletes remove the current reception, and stale receipt
//! handles fail with `InvalidHandle`. Tests run under paused tokio time so
//! visibility expiries and long handler sleeps resolve instantly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use drover_common::{BatchResult, Message};
use drover_consumer::{
    BatchHandler, Handler, Listener, ListenerConfig, MessageHandler, Registry, RunOutcome,
    ShutdownToken, Supervisor, SupervisorOptions,
};
use drover_queue::{
    DeleteOutcome, QueueClient, QueueError, ReceiveOptions, VisibilityOutcome,
};

const QUEUE_URL: &str = "https://sqs.test/000000000000/drover-test";

// ---------------------------------------------------------------------------
// Mock queue
// ---------------------------------------------------------------------------

struct Stored {
    message_id: String,
    body: String,
    delivery_count: u32,
}

struct InFlightEntry {
    stored: Stored,
    visible_at: Instant,
}

#[derive(Default)]
struct MockState {
    visible: VecDeque<Stored>,
    in_flight: HashMap<String, InFlightEntry>,
    receive_calls: usize,
    delete_calls: Vec<usize>,
    deleted: Vec<String>,
    visibility_calls: Vec<(String, i32)>,
}

struct MockQueue {
    state: Mutex<MockState>,
}

impl MockQueue {
    fn with_messages(bodies: &[&str]) -> Arc<Self> {
        let mut state = MockState::default();
        for (index, body) in bodies.iter().enumerate() {
            state.visible.push_back(Stored {
                message_id: format!("m-{}", index + 1),
                body: body.to_string(),
                delivery_count: 0,
            });
        }
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn release_expired(state: &mut MockState) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(entry) = state.in_flight.remove(&handle) {
                state.visible.push_back(entry.stored);
            }
        }
    }

    fn deleted_count(&self) -> usize {
        self.state.lock().deleted.len()
    }

    fn deleted_handles(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    fn delete_calls(&self) -> Vec<usize> {
        self.state.lock().delete_calls.clone()
    }

    fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    fn visibility_calls(&self) -> Vec<(String, i32)> {
        self.state.lock().visibility_calls.clone()
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.visible.is_empty() && state.in_flight.is_empty()
    }
}

#[async_trait]
impl QueueClient for MockQueue {
    async fn receive(
        &self,
        _queue_url: &str,
        opts: ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        let messages = {
            let mut state = self.state.lock();
            state.receive_calls += 1;
            Self::release_expired(&mut state);

            let mut messages = Vec::new();
            while messages.len() < opts.max_messages as usize {
                let Some(mut stored) = state.visible.pop_front() else {
                    break;
                };
                stored.delivery_count += 1;
                let handle = format!("rh-{}-{}", stored.message_id, stored.delivery_count);
                let message = Message::new(
                    stored.message_id.clone(),
                    handle.clone(),
                    stored.body.clone(),
                    HashMap::new(),
                );
                state.in_flight.insert(
                    handle,
                    InFlightEntry {
                        stored,
                        visible_at: Instant::now()
                            + Duration::from_secs(opts.visibility_timeout_seconds as u64),
                    },
                );
                messages.push(message);
            }
            messages
        };

        if messages.is_empty() {
            // Model the long poll: block for the wait time, then come back
            // empty.
            tokio::time::sleep(Duration::from_secs(opts.wait_time_seconds.max(0) as u64)).await;
        }
        Ok(messages)
    }

    async fn delete_batch(
        &self,
        _queue_url: &str,
        handles: &[String],
    ) -> Result<DeleteOutcome, QueueError> {
        let mut state = self.state.lock();
        Self::release_expired(&mut state);
        state.delete_calls.push(handles.len());

        let mut outcome = DeleteOutcome::default();
        for handle in handles {
            if state.in_flight.remove(handle).is_some() {
                state.deleted.push(handle.clone());
                outcome.deleted.push(handle.clone());
            } else {
                outcome.failed.push((
                    handle.clone(),
                    QueueError::InvalidHandle(format!("unknown handle {handle}")),
                ));
            }
        }
        Ok(outcome)
    }

    async fn change_visibility(
        &self,
        _queue_url: &str,
        handle: &str,
        timeout_seconds: i32,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        Self::release_expired(&mut state);
        state
            .visibility_calls
            .push((handle.to_string(), timeout_seconds));
        match state.in_flight.get_mut(handle) {
            Some(entry) => {
                entry.visible_at = Instant::now() + Duration::from_secs(timeout_seconds as u64);
                Ok(())
            }
            None => Err(QueueError::InvalidHandle(format!("unknown handle {handle}"))),
        }
    }

    async fn change_visibility_batch(
        &self,
        _queue_url: &str,
        entries: &[(String, i32)],
    ) -> Result<VisibilityOutcome, QueueError> {
        let mut state = self.state.lock();
        Self::release_expired(&mut state);

        let mut outcome = VisibilityOutcome::default();
        for (handle, timeout_seconds) in entries {
            state
                .visibility_calls
                .push((handle.clone(), *timeout_seconds));
            match state.in_flight.get_mut(handle) {
                Some(entry) => {
                    entry.visible_at =
                        Instant::now() + Duration::from_secs(*timeout_seconds as u64);
                    outcome.changed.push(handle.clone());
                }
                None => outcome.failed.push((
                    handle.clone(),
                    QueueError::InvalidHandle(format!("unknown handle {handle}")),
                )),
            }
        }
        Ok(outcome)
    }

    async fn get_queue_attributes(
        &self,
        _queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError> {
        let state = self.state.lock();
        let mut attributes = HashMap::new();
        attributes.insert(
            "ApproximateNumberOfMessages".to_string(),
            state.visible.len().to_string(),
        );
        attributes.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            state.in_flight.len().to_string(),
        );
        Ok(attributes)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config() -> ListenerConfig {
    ListenerConfig::builder()
        .wait_time_seconds(1)
        .batch_size(10)
        .visibility_timeout_seconds(10)
        .max_extend_seconds(60)
        .worker_threads(1)
        .idle_sleep_max(Duration::from_secs(1))
        .build()
        .expect("test config must validate")
}

struct Running {
    token: ShutdownToken,
    task: tokio::task::JoinHandle<Result<RunOutcome, drover_consumer::SupervisorError>>,
}

impl Running {
    fn start(queue: Arc<MockQueue>, handler: Handler, config: ListenerConfig) -> Self {
        Self::start_with_grace(queue, handler, config, Duration::from_secs(60))
    }

    fn start_with_grace(
        queue: Arc<MockQueue>,
        handler: Handler,
        config: ListenerConfig,
        grace_period: Duration,
    ) -> Self {
        let client: Arc<dyn QueueClient> = queue.clone();
        let registry = Registry::new().listener(Listener {
            queue_url: QUEUE_URL.to_string(),
            handler,
            config,
        });
        let supervisor = Supervisor::with_options(
            client,
            registry,
            SupervisorOptions {
                grace_period,
                strict_startup: false,
            },
        );
        let token = supervisor.shutdown_token();
        let task = tokio::spawn(supervisor.run_all());
        Self { token, task }
    }

    async fn drain_and_finish(self) -> RunOutcome {
        self.token.drain();
        self.task
            .await
            .expect("supervisor task panicked")
            .expect("run_all failed")
    }
}

/// Poll a condition under virtual time, panicking after `deadline`.
async fn wait_until(deadline: Duration, what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct OkBatchHandler {
    calls: AtomicUsize,
}

impl OkBatchHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BatchHandler for OkBatchHandler {
    async fn handle(&self, messages: &[Message]) -> anyhow::Result<BatchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for message in messages {
            // Payloads in these tests are JSON; exercise the cached view.
            assert!(message.as_json().is_ok());
        }
        Ok(BatchResult::ok())
    }
}

/// Fails one message (by id) on the first invocation, succeeds afterwards.
struct FailOnceBatchHandler {
    fail_message_id: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl BatchHandler for FailOnceBatchHandler {
    async fn handle(&self, messages: &[Message]) -> anyhow::Result<BatchResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = BatchResult::ok();
        if call == 0 {
            for message in messages {
                if message.message_id() == self.fail_message_id {
                    result = result.fail_message(message);
                }
            }
        }
        Ok(result)
    }
}

/// Raises on the first invocation, succeeds afterwards.
struct RaiseOnceBatchHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl BatchHandler for RaiseOnceBatchHandler {
    async fn handle(&self, _messages: &[Message]) -> anyhow::Result<BatchResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("downstream dependency unavailable");
        }
        Ok(BatchResult::ok())
    }
}

/// Sleeps on the first invocation only, then settles instantly.
struct SleepOnceBatchHandler {
    sleep: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl BatchHandler for SleepOnceBatchHandler {
    async fn handle(&self, _messages: &[Message]) -> anyhow::Result<BatchResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.sleep).await;
        }
        Ok(BatchResult::ok())
    }
}

/// Per-message handler that sleeps on the first invocation only.
struct SleepOnceMessageHandler {
    sleep: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SleepOnceMessageHandler {
    async fn handle(&self, _message: &Message) -> anyhow::Result<bool> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.sleep).await;
        }
        Ok(true)
    }
}

/// Per-message handler tracking how many invocations run concurrently.
struct GaugeMessageHandler {
    started: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
    sleep: Duration,
}

impl GaugeMessageHandler {
    fn new(sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            sleep,
        })
    }
}

#[async_trait]
impl MessageHandler for GaugeMessageHandler {
    async fn handle(&self, _message: &Message) -> anyhow::Result<bool> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.sleep).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn happy_path_batch_deletes_everything_in_one_call() {
    let queue = MockQueue::with_messages(&[r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]);
    let handler = OkBatchHandler::new();
    let running = Running::start(
        queue.clone(),
        Handler::Batch(handler.clone()),
        test_config(),
    );

    wait_until(Duration::from_secs(30), "all three deleted", || {
        queue.deleted_count() == 3
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert!(queue.is_empty());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    // All three handles settled through a single batched delete.
    assert_eq!(queue.delete_calls(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_failure_redelivers_only_the_failed_message() {
    let queue = MockQueue::with_messages(&[r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]);
    let handler = Arc::new(FailOnceBatchHandler {
        fail_message_id: "m-2",
        calls: AtomicUsize::new(0),
    });
    let running = Running::start(queue.clone(), Handler::Batch(handler), test_config());

    wait_until(Duration::from_secs(120), "all three deleted", || {
        queue.deleted_count() == 3
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert!(queue.is_empty());

    // First round deletes messages 1 and 3; message 2 redelivers after its
    // visibility expires and is deleted on the second round.
    assert_eq!(queue.delete_calls(), vec![2, 1]);
    let deleted = queue.deleted_handles();
    assert!(deleted.contains(&"rh-m-1-1".to_string()));
    assert!(deleted.contains(&"rh-m-3-1".to_string()));
    assert!(deleted.contains(&"rh-m-2-2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn handler_error_fails_the_whole_batch() {
    let queue = MockQueue::with_messages(&[r#"{"id":1}"#, r#"{"id":2}"#]);
    let handler = Arc::new(RaiseOnceBatchHandler {
        calls: AtomicUsize::new(0),
    });
    let running = Running::start(queue.clone(), Handler::Batch(handler.clone()), test_config());

    wait_until(Duration::from_secs(120), "both deleted after retry", || {
        queue.deleted_count() == 2
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert!(queue.is_empty());

    // No deletes from the failed invocation; both messages came back and
    // were deleted together on the retry.
    assert_eq!(queue.delete_calls(), vec![2]);
    assert!(handler.calls.load(Ordering::SeqCst) >= 2);
    for handle in queue.deleted_handles() {
        assert!(handle.ends_with("-2"), "expected second delivery, got {handle}");
    }
}

#[tokio::test(start_paused = true)]
async fn long_job_keeps_its_lease_through_heartbeats() {
    let queue = MockQueue::with_messages(&[r#"{"job":"long"}"#]);
    let handler = Arc::new(SleepOnceBatchHandler {
        sleep: Duration::from_secs(40),
        calls: AtomicUsize::new(0),
    });
    let running = Running::start(queue.clone(), Handler::Batch(handler), test_config());

    wait_until(Duration::from_secs(120), "message deleted", || {
        queue.deleted_count() == 1
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert!(queue.is_empty());

    // Visibility 10s with a 5s margin: the 40s job needs several extensions.
    assert!(
        queue.visibility_calls().len() >= 3,
        "expected at least 3 extensions, saw {:?}",
        queue.visibility_calls()
    );
    // Delivered exactly once; the lease never lapsed.
    assert_eq!(queue.deleted_handles(), vec!["rh-m-1-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn capped_lease_refuses_delete_and_message_redelivers() {
    let queue = MockQueue::with_messages(&[r#"{"job":"too-long"}"#]);
    let handler = Arc::new(SleepOnceMessageHandler {
        sleep: Duration::from_secs(120),
        calls: AtomicUsize::new(0),
    });
    let mut config = test_config();
    config.worker_threads = 2;
    let running = Running::start_with_grace(
        queue.clone(),
        Handler::PerMessage(handler.clone()),
        config,
        Duration::from_secs(180),
    );

    // The first delivery's heartbeat caps at max_extend (60s); the message
    // redelivers and the second delivery settles instantly.
    wait_until(Duration::from_secs(200), "redelivery deleted", || {
        queue.deleted_count() == 1
    })
    .await;

    // Let the capped first handler run to completion before draining, to
    // prove its late success does not produce a delete.
    wait_until(Duration::from_secs(200), "both handler calls finished", || {
        handler.calls.load(Ordering::SeqCst) >= 2
    })
    .await;
    tokio::time::sleep(Duration::from_secs(130)).await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert!(queue.is_empty());

    // Only the second reception was deleted; the capped first handle never
    // was, even though its handler returned success.
    assert_eq!(queue.deleted_handles(), vec!["rh-m-1-2".to_string()]);
    // Every extension belongs to the first reception; heartbeats stopped at
    // the cap instead of extending the redelivered reception.
    let calls = queue.visibility_calls();
    assert!(calls.len() >= 3);
    assert!(calls.iter().all(|(handle, _)| handle == "rh-m-1-1"));
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_finishes_in_flight_work() {
    let queue = MockQueue::with_messages(&[r#"{"id":1}"#, r#"{"id":2}"#]);
    let handler = GaugeMessageHandler::new(Duration::from_secs(5));
    let mut config = test_config();
    config.worker_threads = 2;
    let running = Running::start_with_grace(
        queue.clone(),
        Handler::PerMessage(handler.clone()),
        config,
        Duration::from_secs(30),
    );

    wait_until(Duration::from_secs(30), "both handlers started", || {
        handler.started.load(Ordering::SeqCst) == 2
    })
    .await;

    let receives_at_drain = queue.receive_calls();
    let outcome = running.drain_and_finish().await;

    assert!(outcome.drained_cleanly);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(queue.deleted_count(), 2);
    assert!(queue.is_empty());
    // No new polls beyond those already in flight when the signal landed
    // (at most one per poller).
    assert!(queue.receive_calls() <= receives_at_drain + 2);
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_abandons_in_flight_work() {
    let queue = MockQueue::with_messages(&[r#"{"id":1}"#]);
    let handler = Arc::new(SleepOnceMessageHandler {
        sleep: Duration::from_secs(600),
        calls: AtomicUsize::new(0),
    });
    let running = Running::start_with_grace(
        queue.clone(),
        Handler::PerMessage(handler.clone()),
        test_config(),
        Duration::from_secs(2),
    );

    wait_until(Duration::from_secs(30), "handler started", || {
        handler.calls.load(Ordering::SeqCst) == 1
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert!(!outcome.drained_cleanly);
    assert_eq!(outcome.abandoned_in_flight, 1);
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(queue.deleted_count(), 0);

    // The abandoned message's heartbeat must stop extending, so the lease
    // lapses and the queue service can redeliver.
    let calls_at_abandon = queue.visibility_calls().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(queue.visibility_calls().len(), calls_at_abandon);
}

#[tokio::test(start_paused = true)]
async fn per_message_concurrency_is_bounded_by_worker_threads() {
    let queue = MockQueue::with_messages(&[
        r#"{"id":1}"#,
        r#"{"id":2}"#,
        r#"{"id":3}"#,
        r#"{"id":4}"#,
        r#"{"id":5}"#,
        r#"{"id":6}"#,
    ]);
    let handler = GaugeMessageHandler::new(Duration::from_millis(200));
    let mut config = test_config();
    config.worker_threads = 2;
    let running = Running::start(queue.clone(), Handler::PerMessage(handler.clone()), config);

    wait_until(Duration::from_secs(60), "all six deleted", || {
        queue.deleted_count() == 6
    })
    .await;

    let outcome = running.drain_and_finish().await;
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(handler.started.load(Ordering::SeqCst), 6);
    assert!(
        handler.peak.load(Ordering::SeqCst) <= 2,
        "handler concurrency exceeded worker_threads"
    );
}
