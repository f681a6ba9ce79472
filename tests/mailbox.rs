use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use strata::actor::{ActorError, Message, SystemMsg};
use strata::kernel::{Mailbox, MailboxConfig, MailboxInvoker, TokioDispatcher};

const WAIT: Duration = Duration::from_secs(5);

/// Records every invocation; optionally fails configured message types.
struct RecordingInvoker {
    log: Mutex<Vec<String>>,
    notify: tokio::sync::Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_user_type: Option<String>,
    fail_system: bool,
    delay: Option<Duration>,
}

impl RecordingInvoker {
    fn new() -> Arc<RecordingInvoker> {
        Arc::new(RecordingInvoker {
            log: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_user_type: None,
            fail_system: false,
            delay: None,
        })
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) {
        timeout(WAIT, async {
            loop {
                if self.log.lock().unwrap().len() >= count {
                    break;
                }
                self.notify.notified().await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {} entries, have {:?}",
                count,
                self.entries()
            )
        });
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
        self.notify.notify_waiters();
    }

    async fn track<F, T>(&self, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let result = work.await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

#[async_trait]
impl MailboxInvoker for RecordingInvoker {
    async fn invoke_system(&self, msg: SystemMsg) -> Result<(), ActorError> {
        self.track(async {
            let label = match &msg {
                SystemMsg::Init => "init",
                SystemMsg::Stop => "stop",
                SystemMsg::Restart { .. } => "restart",
                SystemMsg::Failure { .. } => "failure",
            };
            if self.fail_system {
                self.record(format!("sys-failed:{}", label));
                return Err(ActorError::new("system handler failed"));
            }
            self.record(format!("sys:{}", label));
            Ok(())
        })
        .await
    }

    async fn invoke_user(&self, msg: Message) -> Result<(), ActorError> {
        self.track(async {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_user_type.as_deref() == Some(msg.msg_type.as_str()) {
                self.record(format!("user-failed:{}", msg.msg_type));
                return Err(ActorError::new("user handler failed"));
            }
            self.record(format!("user:{}", msg.msg_type));
            Ok(())
        })
        .await
    }
}

fn mailbox_with(invoker: Arc<RecordingInvoker>, config: MailboxConfig) -> Mailbox {
    let mailbox = Mailbox::new(config);
    mailbox.register_handlers(invoker, Arc::new(TokioDispatcher::new()));
    mailbox
}

#[tokio::test]
async fn system_messages_overtake_user_messages() {
    let invoker = RecordingInvoker::new();
    let mailbox = mailbox_with(invoker.clone(), MailboxConfig::default());

    // Queue U1, S1, U2 while the mailbox is still suspended, then start.
    mailbox
        .post_user_message(Message::new("u1", json!(null)))
        .unwrap();
    mailbox.post_system_message(SystemMsg::Init).unwrap();
    mailbox
        .post_user_message(Message::new("u2", json!(null)))
        .unwrap();
    mailbox.start();

    invoker.wait_for(3).await;
    assert_eq!(invoker.entries(), vec!["sys:init", "user:u1", "user:u2"]);
}

#[tokio::test]
async fn suspension_keeps_messages_queued_in_order() {
    let invoker = RecordingInvoker::new();
    let mailbox = mailbox_with(invoker.clone(), MailboxConfig::default());
    mailbox.start();

    mailbox.suspend();
    for t in ["a", "b", "c"] {
        mailbox.post_user_message(Message::new(t, json!(null))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(invoker.entries().is_empty());
    assert_eq!(mailbox.metrics().user_enqueued, 3);

    mailbox.resume();
    invoker.wait_for(3).await;
    assert_eq!(invoker.entries(), vec!["user:a", "user:b", "user:c"]);
}

#[tokio::test]
async fn at_most_one_batch_in_flight() {
    let invoker = Arc::new(RecordingInvoker {
        log: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        fail_user_type: None,
        fail_system: false,
        delay: Some(Duration::from_millis(2)),
    });
    let mailbox = mailbox_with(invoker.clone(), MailboxConfig::default());
    mailbox.start();

    // Posts race the drain from many tasks; invocations must never overlap.
    let mut handles = Vec::new();
    for i in 0..8 {
        let mailbox = mailbox.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..5 {
                mailbox
                    .post_user_message(Message::new(format!("m{}-{}", i, j), json!(null)))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    invoker.wait_for(40).await;
    assert_eq!(invoker.max_in_flight.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn user_failure_reports_and_continues_the_batch() {
    let hook_hits = Arc::new(AtomicUsize::new(0));
    let hook_count = hook_hits.clone();
    let invoker = Arc::new(RecordingInvoker {
        log: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        fail_user_type: Some("poison".into()),
        fail_system: false,
        delay: None,
    });
    let config = MailboxConfig {
        on_error: Some(Arc::new(move |_err, msg| {
            assert_eq!(msg.msg_type, "poison");
            hook_count.fetch_add(1, Ordering::AcqRel);
        })),
        ..MailboxConfig::default()
    };
    let mailbox = mailbox_with(invoker.clone(), config);
    mailbox.start();

    for t in ["ok1", "poison", "ok2"] {
        mailbox.post_user_message(Message::new(t, json!(null))).unwrap();
    }
    invoker.wait_for(3).await;
    assert_eq!(
        invoker.entries(),
        vec!["user:ok1", "user-failed:poison", "user:ok2"]
    );
    assert_eq!(hook_hits.load(Ordering::Acquire), 1);
    assert!(!mailbox.is_suspended());
    assert!(mailbox.error().is_none());
}

#[tokio::test]
async fn system_failure_suspends_until_cleared() {
    let invoker = Arc::new(RecordingInvoker {
        log: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        fail_user_type: None,
        fail_system: true,
        delay: None,
    });
    let mailbox = mailbox_with(invoker.clone(), MailboxConfig::default());
    mailbox.post_system_message(SystemMsg::Init).unwrap();
    mailbox
        .post_user_message(Message::new("queued", json!(null)))
        .unwrap();
    mailbox.start();

    invoker.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(invoker.entries(), vec!["sys-failed:init"]);
    assert!(mailbox.is_suspended());
    assert!(mailbox.error().is_some());
    // The user message never ran and stays queued.
    assert_eq!(mailbox.metrics().user_dequeued, 0);
}

#[tokio::test]
async fn bounded_mailbox_rejects_when_full() {
    let invoker = RecordingInvoker::new();
    let config = MailboxConfig {
        user_queue_capacity: 2,
        auto_resize: false,
        ..MailboxConfig::default()
    };
    // Never started: everything stays queued.
    let mailbox = mailbox_with(invoker, config);

    assert!(mailbox.post_user_message(Message::new("a", json!(null))).is_ok());
    assert!(mailbox.post_user_message(Message::new("b", json!(null))).is_ok());
    assert!(mailbox.post_user_message(Message::new("c", json!(null))).is_err());
    assert_eq!(mailbox.metrics().rejected, 1);
}

#[tokio::test]
async fn metrics_account_for_every_message() {
    let invoker = RecordingInvoker::new();
    let mailbox = mailbox_with(invoker.clone(), MailboxConfig::default());
    mailbox.post_system_message(SystemMsg::Init).unwrap();
    for i in 0..10 {
        mailbox
            .post_user_message(Message::new(format!("m{}", i), json!(null)))
            .unwrap();
    }
    mailbox.start();
    invoker.wait_for(11).await;

    let metrics = mailbox.metrics();
    assert_eq!(metrics.user_enqueued, 10);
    assert_eq!(metrics.user_dequeued, 10);
    assert_eq!(metrics.system_enqueued, 1);
    assert_eq!(metrics.system_dequeued, 1);
    assert!(metrics.user_peak_depth >= 1);
    assert!(metrics.batches >= 1);
}
