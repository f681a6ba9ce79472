use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use config::Config;
use tracing::{debug, trace, warn};

use crate::actor::{ActorError, Message, SystemMsg};
use crate::kernel::Dispatcher;
use crate::sync::{RingOptions, RingQueue, SyncState};

// Lifecycle traffic is never rejected: a dropped restart or stop would wedge
// supervision, so the system queue always resizes up to this cap.
const SYSTEM_QUEUE_MAX: usize = 8192;
const USER_QUEUE_GROWTH_FACTOR: usize = 16;
const BATCH_EWMA_ALPHA: f64 = 0.2;

/// Hook invoked when a user-message handler fails. The batch continues.
pub type ErrorHook = Arc<dyn Fn(&ActorError, &Message) + Send + Sync>;

/// Consumes drained messages on behalf of the owning actor.
#[async_trait]
pub trait MailboxInvoker: Send + Sync + 'static {
    async fn invoke_system(&self, msg: SystemMsg) -> Result<(), ActorError>;
    async fn invoke_user(&self, msg: Message) -> Result<(), ActorError>;
}

#[derive(Clone)]
pub struct MailboxConfig {
    pub system_queue_capacity: usize,
    pub user_queue_capacity: usize,
    pub auto_resize: bool,
    pub batch_size: usize,
    pub max_batch_processing_ms: u64,
    pub debug: bool,
    pub on_error: Option<ErrorHook>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig {
            system_queue_capacity: 64,
            user_queue_capacity: 1024,
            auto_resize: true,
            batch_size: 32,
            max_batch_processing_ms: 50,
            debug: false,
            on_error: None,
        }
    }
}

impl<'a> From<&'a Config> for MailboxConfig {
    fn from(cfg: &Config) -> Self {
        MailboxConfig {
            system_queue_capacity: cfg.get_int("mailbox.system_queue_capacity").unwrap() as usize,
            user_queue_capacity: cfg.get_int("mailbox.user_queue_capacity").unwrap() as usize,
            auto_resize: cfg.get_bool("mailbox.auto_resize").unwrap(),
            batch_size: cfg.get_int("mailbox.batch_size").unwrap() as usize,
            max_batch_processing_ms: cfg.get_int("mailbox.max_batch_processing_ms").unwrap() as u64,
            debug: cfg.get_bool("debug").unwrap(),
            on_error: None,
        }
    }
}

/// Error returned when a post is not accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxError {
    Full,
    Closed,
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::Full => f.write_str("mailbox queue is full"),
            MailboxError::Closed => f.write_str("mailbox is closed"),
        }
    }
}

impl Error for MailboxError {}

/// Counter snapshot returned by [`Mailbox::metrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxMetrics {
    pub system_enqueued: u64,
    pub system_dequeued: u64,
    pub user_enqueued: u64,
    pub user_dequeued: u64,
    pub rejected: u64,
    pub system_peak_depth: u64,
    pub user_peak_depth: u64,
    pub batches: u64,
    pub last_batch_ms: u64,
    pub avg_batch_ms: f64,
}

#[derive(Clone)]
struct Handlers {
    invoker: Arc<dyn MailboxInvoker>,
    dispatcher: Arc<dyn Dispatcher>,
}

struct MailboxInner {
    sys_queue: RingQueue<SystemMsg>,
    user_queue: RingQueue<Message>,
    processing: AtomicBool,
    scheduled: AtomicBool,
    suspended: AtomicBool,
    errored: AtomicBool,
    error: RwLock<Option<ActorError>>,
    handlers: RwLock<Option<Handlers>>,
    config: MailboxConfig,
    sys_peak: AtomicU64,
    user_peak: AtomicU64,
    batches: AtomicU64,
    last_batch_ms: AtomicU64,
    avg_batch_bits: AtomicU64,
}

/// Per-actor two-priority queue with batched draining.
///
/// System messages overtake user messages within every batch; at most one
/// drain batch is in flight (`processing`); a suspended or errored mailbox
/// never starts a drain. Enqueues never block and never run the batch
/// inline: the mailbox schedules itself onto its registered dispatcher.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub fn new(config: MailboxConfig) -> Mailbox {
        let sys_queue = RingQueue::with_options(
            config.system_queue_capacity,
            RingOptions {
                auto_resize: true,
                max_capacity: SYSTEM_QUEUE_MAX,
                overflow: None,
            },
        );
        let user_queue = RingQueue::with_options(
            config.user_queue_capacity,
            RingOptions {
                auto_resize: config.auto_resize,
                max_capacity: if config.auto_resize {
                    config.user_queue_capacity * USER_QUEUE_GROWTH_FACTOR
                } else {
                    config.user_queue_capacity
                },
                overflow: None,
            },
        );

        Mailbox {
            inner: Arc::new(MailboxInner {
                sys_queue,
                user_queue,
                processing: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                // Suspended until the owning actor finishes starting.
                suspended: AtomicBool::new(true),
                errored: AtomicBool::new(false),
                error: RwLock::new(None),
                handlers: RwLock::new(None),
                config,
                sys_peak: AtomicU64::new(0),
                user_peak: AtomicU64::new(0),
                batches: AtomicU64::new(0),
                last_batch_ms: AtomicU64::new(0),
                avg_batch_bits: AtomicU64::new(0f64.to_bits()),
            }),
        }
    }

    /// Wires the invoker/dispatcher pair. Must happen before the first post
    /// can be drained; posts before registration stay queued.
    pub fn register_handlers(
        &self,
        invoker: Arc<dyn MailboxInvoker>,
        dispatcher: Arc<dyn Dispatcher>,
    ) {
        *self.inner.handlers.write().unwrap() = Some(Handlers {
            invoker,
            dispatcher,
        });
    }

    /// Lifts the initial suspension and schedules a drain if work is queued.
    pub fn start(&self) {
        trace!("mailbox started");
        self.resume();
    }

    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
        self.try_schedule();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<ActorError> {
        self.inner.error.read().unwrap().clone()
    }

    pub fn clear_error(&self) {
        *self.inner.error.write().unwrap() = None;
        self.inner.errored.store(false, Ordering::Release);
    }

    fn record_error(&self, err: ActorError) {
        *self.inner.error.write().unwrap() = Some(err);
        self.inner.errored.store(true, Ordering::Release);
    }

    pub fn post_system_message(&self, msg: SystemMsg) -> Result<(), MailboxError> {
        if self.inner.sys_queue.state() != SyncState::Open {
            return Err(MailboxError::Closed);
        }
        if !self.inner.sys_queue.enqueue(msg) {
            return Err(self.post_failure(&self.inner.sys_queue));
        }
        self.update_peak(&self.inner.sys_peak, self.inner.sys_queue.len());
        self.try_schedule();
        Ok(())
    }

    pub fn post_user_message(&self, msg: Message) -> Result<(), MailboxError> {
        if self.inner.user_queue.state() != SyncState::Open {
            return Err(MailboxError::Closed);
        }
        if !self.inner.user_queue.enqueue(msg) {
            return Err(self.post_failure(&self.inner.user_queue));
        }
        self.update_peak(&self.inner.user_peak, self.inner.user_queue.len());
        self.try_schedule();
        Ok(())
    }

    fn post_failure<T>(&self, queue: &RingQueue<T>) -> MailboxError {
        if queue.state() == SyncState::Open {
            MailboxError::Full
        } else {
            MailboxError::Closed
        }
    }

    pub fn has_messages(&self) -> bool {
        !self.inner.sys_queue.is_empty() || !self.inner.user_queue.is_empty()
    }

    /// Closes both queues. Remaining traffic is dropped; the counts are
    /// logged at debug.
    pub fn close(&self) {
        let pending = self.inner.sys_queue.len() + self.inner.user_queue.len();
        self.inner.sys_queue.close();
        self.inner.user_queue.close();
        if pending > 0 {
            debug!(pending, "mailbox closed with undelivered messages");
        }
    }

    pub fn metrics(&self) -> MailboxMetrics {
        let sys = self.inner.sys_queue.metrics();
        let user = self.inner.user_queue.metrics();
        MailboxMetrics {
            system_enqueued: sys.enqueued,
            system_dequeued: sys.dequeued,
            user_enqueued: user.enqueued,
            user_dequeued: user.dequeued,
            rejected: sys.rejected + user.rejected,
            system_peak_depth: self.inner.sys_peak.load(Ordering::Relaxed),
            user_peak_depth: self.inner.user_peak.load(Ordering::Relaxed),
            batches: self.inner.batches.load(Ordering::Relaxed),
            last_batch_ms: self.inner.last_batch_ms.load(Ordering::Relaxed),
            avg_batch_ms: f64::from_bits(self.inner.avg_batch_bits.load(Ordering::Relaxed)),
        }
    }

    fn update_peak(&self, peak: &AtomicU64, depth: usize) {
        peak.fetch_max(depth as u64, Ordering::Relaxed);
    }

    // An enqueue only hands a drain to the dispatcher when no batch is in
    // flight and none is already queued; the drain itself re-schedules if
    // messages remain.
    fn try_schedule(&self) {
        let inner = &self.inner;
        if inner.suspended.load(Ordering::Acquire)
            || inner.errored.load(Ordering::Acquire)
            || inner.processing.load(Ordering::Acquire)
        {
            return;
        }
        if inner
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let handlers = inner.handlers.read().unwrap().clone();
        match handlers {
            Some(handlers) => {
                let mailbox = self.clone();
                handlers
                    .dispatcher
                    .schedule(Box::pin(async move { mailbox.drain_batch().await }));
            }
            None => inner.scheduled.store(false, Ordering::Release),
        }
    }

    pub(crate) async fn drain_batch(&self) {
        let inner = &self.inner;
        inner.scheduled.store(false, Ordering::Release);
        if inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if inner.suspended.load(Ordering::Acquire) || inner.errored.load(Ordering::Acquire) {
            inner.processing.store(false, Ordering::Release);
            return;
        }

        let handlers = inner.handlers.read().unwrap().clone();
        let handlers = match handlers {
            Some(h) => h,
            None => {
                inner.processing.store(false, Ordering::Release);
                return;
            }
        };

        let started = Instant::now();
        let budget = inner.config.batch_size.max(1);
        let mut processed = 0usize;

        // System messages drain first and any failure is fatal for the
        // mailbox until supervision acts.
        while processed < budget {
            let msg = match inner.sys_queue.dequeue() {
                Some(m) => m,
                None => break,
            };
            match handlers.invoker.invoke_system(msg).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    warn!(%err, "system message handler failed; suspending mailbox");
                    self.record_error(err);
                    self.suspend();
                    break;
                }
            }
        }

        if !inner.suspended.load(Ordering::Acquire) && !inner.errored.load(Ordering::Acquire) {
            while processed < budget {
                if started.elapsed().as_millis() as u64 >= inner.config.max_batch_processing_ms {
                    trace!("batch wall-clock budget exhausted");
                    break;
                }
                let msg = match inner.user_queue.dequeue() {
                    Some(m) => m,
                    None => break,
                };
                if let Err(err) = handlers.invoker.invoke_user(msg.clone()).await {
                    // User failures never suspend the mailbox; supervision
                    // was already consulted by the invoker.
                    if let Some(hook) = &inner.config.on_error {
                        hook(&err, &msg);
                    }
                }
                processed += 1;
            }
        }

        self.record_batch(started.elapsed().as_secs_f64() * 1000.0);
        inner.processing.store(false, Ordering::Release);

        if self.has_messages() {
            self.try_schedule();
        }
    }

    fn record_batch(&self, ms: f64) {
        let inner = &self.inner;
        let batches = inner.batches.fetch_add(1, Ordering::Relaxed) + 1;
        inner.last_batch_ms.store(ms as u64, Ordering::Relaxed);
        let mut current = inner.avg_batch_bits.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if batches == 1 {
                ms
            } else {
                avg * (1.0 - BATCH_EWMA_ALPHA) + ms * BATCH_EWMA_ALPHA
            };
            match inner.avg_batch_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
