//! Task pipeline: distributor -> broker -> processor -> handler

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ledgerd::mail::RecordingEmailSender;
use ledgerd::random::{RandomSource, SeededRandom};
use ledgerd::store::{MemoryStore, Store};
use ledgerd::user_auth::{CreateUserRequest, UserService};
use ledgerd::worker::{
    BrokerTaskDistributor, HandlerError, MemoryTaskBroker, PayloadSendVerifyEmail,
    ProcessorConfig, QUEUE_CRITICAL, QUEUE_DEFAULT, RetryPolicy, SendVerifyEmailHandler, ServeMux,
    TASK_SEND_VERIFY_EMAIL, Task, TaskBroker, TaskDistributor, TaskId, TaskOptions, TaskOutcome,
    TaskProcessor, TaskState, verify_email_url,
};

use common::{init_tracing, seed_user};

const VERIFY_HOST: &str = "http://ledger.test";

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        concurrency: 4,
        poll_interval: Duration::from_millis(10),
        handler_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(50),
        stale_after: Duration::from_secs(3_600),
        recovery_interval: Duration::from_secs(3_600),
        retry_policy: RetryPolicy::fixed(Duration::ZERO),
        ..ProcessorConfig::default()
    }
}

async fn enqueue(broker: &MemoryTaskBroker, task_type: &str, max_retry: u32) -> TaskId {
    let task = Task::json(task_type, &serde_json::json!({ "n": 1 })).unwrap();
    broker
        .enqueue(task, TaskOptions::default().max_retry(max_retry))
        .await
        .unwrap()
        .id
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ========================================================================
// Distribution and dispatch
// ========================================================================

#[tokio::test]
async fn test_enqueue_then_consume_preserves_payload() {
    init_tracing();
    let broker = Arc::new(MemoryTaskBroker::new());
    let distributor = BrokerTaskDistributor::new(broker.clone());

    let seen: Arc<Mutex<Vec<PayloadSendVerifyEmail>>> = Arc::new(Mutex::new(Vec::new()));
    let mut mux = ServeMux::new();
    let sink = seen.clone();
    mux.handle_fn(TASK_SEND_VERIFY_EMAIL, move |task| {
        let sink = sink.clone();
        async move {
            let payload: PayloadSendVerifyEmail =
                serde_json::from_slice(&task.payload).map_err(HandlerError::skip_retry)?;
            sink.lock().unwrap().push(payload);
            Ok::<(), HandlerError>(())
        }
    });
    let processor = TaskProcessor::new(broker.clone(), mux, test_config());

    let info = distributor
        .distribute_task_send_verify_email(
            &PayloadSendVerifyEmail {
                username: "alice".to_string(),
            },
            TaskOptions::default().queue(QUEUE_CRITICAL),
        )
        .await
        .unwrap();

    let (id, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(id, info.id);
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![PayloadSendVerifyEmail {
            username: "alice".to_string()
        }]
    );
    assert_eq!(
        broker.get(id).await.unwrap().unwrap().state,
        TaskState::Succeeded
    );
    assert!(processor.process_one().await.unwrap().is_none());
}

#[tokio::test]
async fn test_delayed_task_is_not_claimed_early() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let task = Task::json("task:noop", &serde_json::json!({})).unwrap();
    let info = broker
        .enqueue(task, TaskOptions::default().process_in(Duration::from_secs(60)))
        .await
        .unwrap();

    let mut mux = ServeMux::new();
    mux.handle_fn("task:noop", |_task| async { Ok::<(), HandlerError>(()) });
    let processor = TaskProcessor::new(broker.clone(), mux, test_config());

    assert!(processor.process_one().await.unwrap().is_none());
    broker.make_due(info.id).await.unwrap();
    let (_, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);
}

// ========================================================================
// Failure handling
// ========================================================================

#[tokio::test]
async fn test_retry_exhaustion_attempts_one_plus_max_retry() {
    init_tracing();
    let broker = Arc::new(MemoryTaskBroker::new());
    let attempts = Arc::new(AtomicU32::new(0));

    let mut mux = ServeMux::new();
    let counter = attempts.clone();
    mux.handle_fn("task:flaky", move |_task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(HandlerError::retry("downstream unavailable"))
        }
    });
    let processor = TaskProcessor::new(broker.clone(), mux, test_config());

    let max_retry = 3;
    let id = enqueue(&broker, "task:flaky", max_retry).await;

    let mut outcomes = Vec::new();
    loop {
        broker.make_due(id).await.unwrap();
        match processor.process_one().await.unwrap() {
            Some((_, outcome)) => outcomes.push(outcome),
            None => break,
        }
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 1 + max_retry);
    assert_eq!(
        outcomes,
        vec![
            TaskOutcome::Retried,
            TaskOutcome::Retried,
            TaskOutcome::Retried,
            TaskOutcome::Failed
        ]
    );
    let task = broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.retried, max_retry);
    assert_eq!(task.last_error.as_deref(), Some("downstream unavailable"));
}

#[tokio::test]
async fn test_skip_retry_fails_immediately() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let mut mux = ServeMux::new();
    mux.handle_fn("task:bad", |_task| async {
        Err::<(), _>(HandlerError::skip_retry("malformed payload"))
    });
    let processor = TaskProcessor::new(broker.clone(), mux, test_config());
    let id = enqueue(&broker, "task:bad", 5).await;

    let (_, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Failed);
    let task = broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.retried, 0);
}

#[tokio::test]
async fn test_panicking_handler_is_recorded_and_retried() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let mut mux = ServeMux::new();
    mux.handle_fn("task:panic", |task| async move {
        if !task.task_type.is_empty() {
            panic!("boom");
        }
        Ok::<(), HandlerError>(())
    });
    let processor = TaskProcessor::new(broker.clone(), mux, test_config());
    let id = enqueue(&broker, "task:panic", 2).await;

    let (_, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Retried);
    let task = broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Retrying);
    assert_eq!(task.retried, 1);
    assert!(task.last_error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_unknown_task_type_is_retryable() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let processor = TaskProcessor::new(broker.clone(), ServeMux::new(), test_config());
    let id = enqueue(&broker, "task:unregistered", 1).await;

    let (_, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Retried);
    let task = broker.get(id).await.unwrap().unwrap();
    assert!(task.last_error.unwrap().contains("handler not found"));
}

#[tokio::test]
async fn test_handler_deadline_counts_as_failure() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let mut mux = ServeMux::new();
    mux.handle_fn("task:slow", |_task| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<(), HandlerError>(())
    });
    let config = ProcessorConfig {
        handler_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let processor = TaskProcessor::new(broker.clone(), mux, config);
    let id = enqueue(&broker, "task:slow", 0).await;

    let (_, outcome) = processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Failed);
    let task = broker.get(id).await.unwrap().unwrap();
    assert!(task.last_error.unwrap().contains("deadline"));
}

// ========================================================================
// Processor loop
// ========================================================================

#[tokio::test]
async fn test_running_processor_drains_queues() {
    init_tracing();
    let broker = Arc::new(MemoryTaskBroker::new());
    let done = Arc::new(AtomicU32::new(0));

    let mut mux = ServeMux::new();
    let counter = done.clone();
    mux.handle_fn("task:count", move |_task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    });
    let handle = TaskProcessor::new(broker.clone(), mux, test_config())
        .with_seed(3)
        .start()
        .unwrap();

    for queue in [QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_DEFAULT] {
        let task = Task::json("task:count", &serde_json::json!({})).unwrap();
        broker
            .enqueue(task, TaskOptions::default().queue(queue))
            .await
            .unwrap();
    }

    wait_for(|| {
        let broker = broker.clone();
        async move { broker.count_in_state(TaskState::Succeeded).await == 3 }
    })
    .await;
    handle.shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_task() {
    init_tracing();
    let broker = Arc::new(MemoryTaskBroker::new());
    let mut mux = ServeMux::new();
    mux.handle_fn("task:stuck", |_task| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<(), HandlerError>(())
    });
    let config = ProcessorConfig {
        handler_timeout: Duration::from_secs(120),
        ..test_config()
    };
    let handle = TaskProcessor::new(broker.clone(), mux, config)
        .start()
        .unwrap();
    let id = enqueue(&broker, "task:stuck", 3).await;

    wait_for(|| {
        let broker = broker.clone();
        async move { broker.count_in_state(TaskState::Processing).await == 1 }
    })
    .await;
    handle.shutdown().await;

    let task = broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.retried, 0, "requeue must not consume a retry");
}

#[tokio::test]
async fn test_start_rejects_zero_recovery_interval() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let config = ProcessorConfig {
        recovery_interval: Duration::ZERO,
        ..test_config()
    };
    let result = TaskProcessor::new(broker, ServeMux::new(), config).start();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_start_rejects_stale_window_shorter_than_handler_timeout() {
    let broker = Arc::new(MemoryTaskBroker::new());
    let config = ProcessorConfig {
        handler_timeout: Duration::from_secs(5),
        stale_after: Duration::from_millis(100),
        recovery_interval: Duration::from_millis(50),
        ..test_config()
    };
    let result = TaskProcessor::new(broker, ServeMux::new(), config).start();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_recovery_scan_leaves_running_task_alone() {
    init_tracing();
    let broker = Arc::new(MemoryTaskBroker::new());
    let starts = Arc::new(AtomicU32::new(0));

    let mut mux = ServeMux::new();
    let counter = starts.clone();
    mux.handle_fn("task:slow", move |_task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<(), HandlerError>(())
        }
    });
    let config = ProcessorConfig {
        handler_timeout: Duration::from_secs(1),
        stale_after: Duration::from_millis(1_500),
        recovery_interval: Duration::from_millis(50),
        ..test_config()
    };
    let handle = TaskProcessor::new(broker.clone(), mux, config)
        .start()
        .unwrap();
    let id = enqueue(&broker, "task:slow", 3).await;

    wait_for(|| {
        let broker = broker.clone();
        async move { broker.count_in_state(TaskState::Succeeded).await == 1 }
    })
    .await;
    handle.shutdown().await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    let task = broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
}

// ========================================================================
// Verification email handler
// ========================================================================

struct MailHarness {
    store: MemoryStore,
    broker: Arc<MemoryTaskBroker>,
    mailer: Arc<RecordingEmailSender>,
    processor: TaskProcessor,
}

impl MailHarness {
    fn new() -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let broker = Arc::new(MemoryTaskBroker::new());
        let mailer = Arc::new(RecordingEmailSender::new());

        let mut mux = ServeMux::new();
        mux.handle(
            TASK_SEND_VERIFY_EMAIL,
            Arc::new(SendVerifyEmailHandler::new(
                Arc::new(store.clone()),
                mailer.clone(),
                Arc::new(SeededRandom::new(42)),
                VERIFY_HOST,
            )),
        );
        let processor = TaskProcessor::new(broker.clone(), mux, test_config());
        Self {
            store,
            broker,
            mailer,
            processor,
        }
    }

    async fn enqueue_for(&self, username: &str) -> TaskId {
        BrokerTaskDistributor::new(self.broker.clone())
            .distribute_task_send_verify_email(
                &PayloadSendVerifyEmail {
                    username: username.to_string(),
                },
                TaskOptions::default().max_retry(2),
            )
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_verify_email_handler_sends_link() {
    let h = MailHarness::new();
    seed_user(&h.store, "alice").await;
    h.enqueue_for("alice").await;

    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);

    let expected_code = SeededRandom::new(42).random_string(32);
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Welcome to Ledger");
    assert_eq!(sent[0].to, vec!["alice@example.com".to_string()]);
    assert!(
        sent[0]
            .content
            .contains(&verify_email_url(VERIFY_HOST, 1, &expected_code))
    );

    // The mailed code verifies the address
    let result = h
        .store
        .verify_email_tx(ledgerd::store::VerifyEmailTxParams {
            email_id: 1,
            secret_code: expected_code,
        })
        .await
        .unwrap();
    assert!(result.user.is_email_verified);
}

#[tokio::test]
async fn test_verify_email_handler_retries_until_user_exists() {
    let h = MailHarness::new();
    let id = h.enqueue_for("late").await;

    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Retried);
    assert!(h.mailer.sent().is_empty());

    seed_user(&h.store, "late").await;
    h.broker.make_due(id).await.unwrap();
    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_verify_email_handler_retries_mail_failures() {
    let h = MailHarness::new();
    seed_user(&h.store, "alice").await;
    let id = h.enqueue_for("alice").await;
    h.mailer.fail_next(1);

    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Retried);

    h.broker.make_due(id).await.unwrap();
    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_verify_email_handler_rejects_bad_payload() {
    let h = MailHarness::new();
    let task = Task::new(TASK_SEND_VERIFY_EMAIL, b"not json".to_vec());
    let id = h.broker.enqueue(task, TaskOptions::default()).await.unwrap().id;

    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Failed);
    let task = h.broker.get(id).await.unwrap().unwrap();
    assert_eq!(task.retried, 0);
}

#[tokio::test]
async fn test_registration_to_verified_email() {
    let h = MailHarness::new();
    let service = UserService::new(
        Arc::new(h.store.clone()),
        Arc::new(BrokerTaskDistributor::new(h.broker.clone())),
    );

    service
        .register(CreateUserRequest {
            username: "dora".to_string(),
            password: "explorer".to_string(),
            full_name: "Dora Marquez".to_string(),
            email: "dora@example.com".to_string(),
        })
        .await
        .unwrap();

    // Registration schedules the task in the future
    assert!(h.processor.process_one().await.unwrap().is_none());
    let task = h.broker.all().await.remove(0);
    h.broker.make_due(task.id).await.unwrap();

    let (_, outcome) = h.processor.process_one().await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);

    let code = SeededRandom::new(42).random_string(32);
    let result = service.verify_email(1, &code).await.unwrap();
    assert_eq!(result.user.username, "dora");
    assert!(result.user.is_email_verified);
}
