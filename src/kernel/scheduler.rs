use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use config::Config;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::kernel::{Dispatcher, LoadSampler, ProcLoadSampler, SystemLoad};
use crate::sync::{RingOptions, RingQueue};

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;

const TIER_COUNT: usize = 5;
const AVG_EWMA_ALPHA: f64 = 0.2;
const SLOW_LOW_LATENCY_MS: f64 = 100.0;

/// Classification bucket for submitted tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskTier {
    CpuIntensive,
    IoIntensive,
    LowLatency,
    Batch,
    Default,
}

impl TaskTier {
    pub const ALL: [TaskTier; TIER_COUNT] = [
        TaskTier::CpuIntensive,
        TaskTier::IoIntensive,
        TaskTier::LowLatency,
        TaskTier::Batch,
        TaskTier::Default,
    ];

    // Round-robin order for everything below strict priority.
    const ROUND_ROBIN: [usize; 4] = [0, 1, 3, 4];

    pub(crate) fn index(self) -> usize {
        match self {
            TaskTier::CpuIntensive => 0,
            TaskTier::IoIntensive => 1,
            TaskTier::LowLatency => 2,
            TaskTier::Batch => 3,
            TaskTier::Default => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskTier::CpuIntensive => "cpu_intensive",
            TaskTier::IoIntensive => "io_intensive",
            TaskTier::LowLatency => "low_latency",
            TaskTier::Batch => "batch",
            TaskTier::Default => "default",
        }
    }
}

impl fmt::Display for TaskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a task is not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// The tier's waiting queue is at its cap. The task was not run.
    Rejected { tier: TaskTier },
    ShuttingDown,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Rejected { tier } => {
                write!(f, "task rejected: {} tier queue is full", tier)
            }
            ScheduleError::ShuttingDown => f.write_str("scheduler is shutting down"),
        }
    }
}

impl Error for ScheduleError {}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Concurrency budgets indexed by [`TaskTier::ALL`] order.
    pub concurrency_limits: [usize; TIER_COUNT],
    /// Waiting-queue caps indexed by [`TaskTier::ALL`] order.
    pub queue_limits: [usize; TIER_COUNT],
    pub enable_adaptive: bool,
    pub adaptation_interval_ms: u64,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub target_cpu_utilization: f64,
    pub elasticity_factor: f64,
    pub metrics_collection_interval_ms: u64,
    pub debug: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        SchedulerConfig {
            concurrency_limits: [cores, cores * 2, (cores / 2).max(2), 2, cores],
            queue_limits: [1000; TIER_COUNT],
            enable_adaptive: false,
            adaptation_interval_ms: 2000,
            min_concurrency: 1,
            max_concurrency: 128,
            target_cpu_utilization: 0.7,
            elasticity_factor: 0.5,
            metrics_collection_interval_ms: 1000,
            debug: false,
        }
    }
}

impl<'a> From<&'a Config> for SchedulerConfig {
    fn from(cfg: &Config) -> Self {
        let limit = |key: &str| cfg.get_int(key).unwrap() as usize;
        SchedulerConfig {
            concurrency_limits: [
                limit("scheduler.concurrency.cpu_intensive"),
                limit("scheduler.concurrency.io_intensive"),
                limit("scheduler.concurrency.low_latency"),
                limit("scheduler.concurrency.batch"),
                limit("scheduler.concurrency.default"),
            ],
            queue_limits: [
                limit("scheduler.queue_size.cpu_intensive"),
                limit("scheduler.queue_size.io_intensive"),
                limit("scheduler.queue_size.low_latency"),
                limit("scheduler.queue_size.batch"),
                limit("scheduler.queue_size.default"),
            ],
            enable_adaptive: cfg.get_bool("scheduler.adaptive.enabled").unwrap(),
            adaptation_interval_ms: cfg.get_int("scheduler.adaptive.interval_ms").unwrap() as u64,
            min_concurrency: limit("scheduler.adaptive.min_concurrency"),
            max_concurrency: limit("scheduler.adaptive.max_concurrency"),
            target_cpu_utilization: cfg
                .get_float("scheduler.adaptive.target_cpu_utilization")
                .unwrap(),
            elasticity_factor: cfg.get_float("scheduler.adaptive.elasticity_factor").unwrap(),
            metrics_collection_interval_ms: cfg.get_int("scheduler.metrics_interval_ms").unwrap()
                as u64,
            debug: cfg.get_bool("debug").unwrap(),
        }
    }
}

/// Per-tier counters at a point in time.
#[derive(Clone, Copy, Debug)]
pub struct TierMetrics {
    pub tier: TaskTier,
    pub queued: usize,
    pub active: usize,
    pub concurrency_limit: usize,
    pub completed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub avg_processing_ms: f64,
    pub utilization: f64,
    pub peak_utilization: f64,
}

#[derive(Clone, Debug)]
pub struct SchedulerMetrics {
    pub tiers: [TierMetrics; TIER_COUNT],
}

impl SchedulerMetrics {
    pub fn tier(&self, tier: TaskTier) -> &TierMetrics {
        &self.tiers[tier.index()]
    }
}

struct TierTask {
    future: BoxFuture<'static, ()>,
}

struct Tier {
    tier: TaskTier,
    queue: RingQueue<TierTask>,
    limit: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    avg_ms_bits: AtomicU64,
    util_bits: AtomicU64,
    peak_util_bits: AtomicU64,
}

impl Tier {
    fn new(tier: TaskTier, limit: usize, queue_cap: usize) -> Tier {
        Tier {
            tier,
            queue: RingQueue::with_options(
                queue_cap.max(1),
                RingOptions {
                    auto_resize: false,
                    max_capacity: queue_cap.max(1),
                    overflow: None,
                },
            ),
            limit: AtomicUsize::new(limit.max(1)),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            avg_ms_bits: AtomicU64::new(0f64.to_bits()),
            util_bits: AtomicU64::new(0f64.to_bits()),
            peak_util_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn metrics(&self) -> TierMetrics {
        TierMetrics {
            tier: self.tier,
            queued: self.queue.len(),
            active: self.active.load(Ordering::Acquire),
            concurrency_limit: self.limit.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            avg_processing_ms: f64::from_bits(self.avg_ms_bits.load(Ordering::Relaxed)),
            utilization: f64::from_bits(self.util_bits.load(Ordering::Relaxed)),
            peak_utilization: f64::from_bits(self.peak_util_bits.load(Ordering::Relaxed)),
        }
    }
}

pub type TierClassifier = Box<dyn Fn(&str) -> TaskTier + Send + Sync>;

/// Builds a [`TierScheduler`], optionally overriding the load sampler and
/// classification heuristic.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    sampler: Option<Arc<dyn LoadSampler>>,
    classifier: Option<TierClassifier>,
}

impl SchedulerBuilder {
    pub fn sampler(mut self, sampler: Arc<dyn LoadSampler>) -> SchedulerBuilder {
        self.sampler = Some(sampler);
        self
    }

    pub fn classifier(mut self, classifier: TierClassifier) -> SchedulerBuilder {
        self.classifier = Some(classifier);
        self
    }

    /// # Panics
    /// Outside of a tokio runtime context.
    pub fn build(self) -> Arc<TierScheduler> {
        TierScheduler::build(
            self.config,
            self.sampler
                .unwrap_or_else(|| Arc::new(ProcLoadSampler::new())),
            self.classifier,
        )
    }
}

/// Dispatcher that classifies tasks into tiers, each with its own bounded
/// waiting queue and concurrency budget.
///
/// The LOW_LATENCY tier is drained with strict priority; the remaining tiers
/// share the rest of the budget round-robin, FIFO within each tier. With
/// `enable_adaptive` set, a background loop periodically rewrites per-tier
/// concurrency limits from measured system load and queue pressure. Layered
/// and adaptive are one scheduler, two modes.
pub struct TierScheduler {
    tiers: [Tier; TIER_COUNT],
    classifier: Option<TierClassifier>,
    rr_cursor: AtomicUsize,
    state: AtomicU8,
    handle: Handle,
    config: SchedulerConfig,
    total_active: AtomicUsize,
    idle: Notify,
    // Fractional limits accumulated by the adaptive loop so an elasticity
    // factor below 1 still makes progress across ticks.
    shadow_limits: Mutex<[f64; TIER_COUNT]>,
    self_ref: RwLock<Weak<TierScheduler>>,
}

impl TierScheduler {
    /// # Panics
    /// Outside of a tokio runtime context.
    pub fn new(config: SchedulerConfig) -> Arc<TierScheduler> {
        TierScheduler::builder(config).build()
    }

    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            sampler: None,
            classifier: None,
        }
    }

    fn build(
        config: SchedulerConfig,
        sampler: Arc<dyn LoadSampler>,
        classifier: Option<TierClassifier>,
    ) -> Arc<TierScheduler> {
        let tiers = TaskTier::ALL.map(|tier| {
            Tier::new(
                tier,
                config.concurrency_limits[tier.index()],
                config.queue_limits[tier.index()],
            )
        });
        let shadow = TaskTier::ALL.map(|tier| config.concurrency_limits[tier.index()] as f64);

        let scheduler = Arc::new(TierScheduler {
            tiers,
            classifier,
            rr_cursor: AtomicUsize::new(0),
            state: AtomicU8::new(RUNNING),
            handle: Handle::current(),
            config,
            total_active: AtomicUsize::new(0),
            idle: Notify::new(),
            shadow_limits: Mutex::new(shadow),
            self_ref: RwLock::new(Weak::new()),
        });
        *scheduler.self_ref.write().unwrap() = Arc::downgrade(&scheduler);

        scheduler.spawn_metrics_loop();
        if scheduler.config.enable_adaptive {
            scheduler.spawn_adaptive_loop(sampler);
        }
        scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Admits a task into the given tier. A full tier queue rejects: the
    /// task is dropped and the caller decides whether to retry or degrade.
    pub fn submit(
        &self,
        tier: TaskTier,
        task: BoxFuture<'static, ()>,
    ) -> Result<(), ScheduleError> {
        if !self.is_running() {
            return Err(ScheduleError::ShuttingDown);
        }
        let slot = &self.tiers[tier.index()];
        match slot.queue.offer(TierTask { future: task }) {
            Ok(()) => {
                self.pump();
                Ok(())
            }
            Err(_task) => {
                slot.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ScheduleError::Rejected { tier })
            }
        }
    }

    /// Admits a task classified by the construction-time heuristic from its
    /// tag; unclassified tasks land in the default tier.
    pub fn submit_tagged(
        &self,
        tag: &str,
        task: BoxFuture<'static, ()>,
    ) -> Result<(), ScheduleError> {
        let tier = match &self.classifier {
            Some(classify) => classify(tag),
            None => TaskTier::Default,
        };
        self.submit(tier, task)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            tiers: [
                self.tiers[0].metrics(),
                self.tiers[1].metrics(),
                self.tiers[2].metrics(),
                self.tiers[3].metrics(),
                self.tiers[4].metrics(),
            ],
        }
    }

    /// Refuses new tasks, drops every waiting queue (counting the drops) and
    /// waits for in-flight tasks to finish. Returns per-tier drop counts.
    pub async fn drain_shutdown(&self) -> [u64; TIER_COUNT] {
        self.state.store(SHUTTING_DOWN, Ordering::Release);

        let mut drops = [0u64; TIER_COUNT];
        for (i, tier) in self.tiers.iter().enumerate() {
            tier.queue.close();
            while tier.queue.dequeue().is_some() {
                drops[i] += 1;
            }
            tier.dropped.store(drops[i], Ordering::Relaxed);
        }
        if drops.iter().sum::<u64>() > 0 {
            warn!(?drops, "scheduler shutdown dropped waiting tasks");
        }

        // The timeout bounds the race between the emptiness check and the
        // notification registration.
        while self.total_active.load(Ordering::Acquire) > 0 {
            let _ = tokio::time::timeout(Duration::from_millis(20), self.idle.notified()).await;
        }
        drops
    }

    // Reserves an execution slot: strict priority for LOW_LATENCY, then
    // round-robin across the remaining tiers with pending work.
    fn acquire_next(&self) -> Option<usize> {
        let ll = TaskTier::LowLatency.index();
        if self.try_acquire(ll) {
            return Some(ll);
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..TaskTier::ROUND_ROBIN.len() {
            let idx = TaskTier::ROUND_ROBIN[(start + i) % TaskTier::ROUND_ROBIN.len()];
            if self.try_acquire(idx) {
                return Some(idx);
            }
        }
        None
    }

    fn try_acquire(&self, idx: usize) -> bool {
        let tier = &self.tiers[idx];
        if tier.queue.is_empty() {
            return false;
        }
        let mut active = tier.active.load(Ordering::Acquire);
        loop {
            if active >= tier.limit.load(Ordering::Acquire) {
                return false;
            }
            match tier.active.compare_exchange_weak(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => active = observed,
            }
        }
    }

    fn pump(&self) {
        let me = match self.self_ref.read().unwrap().upgrade() {
            Some(me) => me,
            None => return,
        };
        loop {
            let idx = match self.acquire_next() {
                Some(idx) => idx,
                None => break,
            };
            match self.tiers[idx].queue.dequeue() {
                Some(task) => {
                    self.total_active.fetch_add(1, Ordering::AcqRel);
                    let scheduler = me.clone();
                    self.handle.spawn(async move {
                        let started = Instant::now();
                        task.future.await;
                        scheduler.complete(idx, started.elapsed().as_secs_f64() * 1000.0);
                    });
                }
                None => {
                    // Lost the race for the last queued task; hand the slot back.
                    self.tiers[idx].active.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    fn complete(&self, idx: usize, elapsed_ms: f64) {
        let tier = &self.tiers[idx];
        let completed = tier.completed.fetch_add(1, Ordering::Relaxed) + 1;
        ewma_update(&tier.avg_ms_bits, completed, elapsed_ms);
        tier.active.fetch_sub(1, Ordering::AcqRel);
        self.total_active.fetch_sub(1, Ordering::AcqRel);

        if self.is_running() {
            self.pump();
        } else {
            self.idle.notify_waiters();
        }
    }

    fn spawn_metrics_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.metrics_collection_interval_ms.max(10));
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let scheduler = match weak.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if !scheduler.is_running() {
                    break;
                }
                scheduler.sample_utilization();
            }
        });
    }

    fn sample_utilization(&self) {
        for tier in &self.tiers {
            let limit = tier.limit.load(Ordering::Acquire).max(1);
            let util = tier.active.load(Ordering::Acquire) as f64 / limit as f64;
            tier.util_bits.store(util.to_bits(), Ordering::Relaxed);
            // Bit comparison orders the same as value comparison for
            // non-negative floats, so fetch_max works on the raw bits.
            tier.peak_util_bits
                .fetch_max(util.to_bits(), Ordering::Relaxed);
        }
    }

    fn spawn_adaptive_loop(self: &Arc<Self>, sampler: Arc<dyn LoadSampler>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.adaptation_interval_ms.max(10));
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let scheduler = match weak.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if !scheduler.is_running() {
                    break;
                }
                let load = sampler.sample();
                scheduler.rebalance(load);
            }
        });
    }

    // One adaptation tick: every rule adjusts a fractional shadow limit by
    // one step scaled with the elasticity factor, then the rounded, clamped
    // results are written back.
    fn rebalance(&self, load: SystemLoad) {
        let cfg = &self.config;
        let step = cfg.elasticity_factor.clamp(0.05, 1.0);
        let cpu = TaskTier::CpuIntensive.index();
        let io = TaskTier::IoIntensive.index();
        let ll = TaskTier::LowLatency.index();
        let batch = TaskTier::Batch.index();

        let mut shadow = self.shadow_limits.lock().unwrap();

        let cpu_excess = load.cpu_utilization - cfg.target_cpu_utilization;
        if cpu_excess > 0.1 {
            shadow[cpu] -= step;
            shadow[io] += step;
        } else if cpu_excess < -0.1 {
            shadow[cpu] += step;
        }

        for idx in 0..TIER_COUNT {
            let queued = self.tiers[idx].queue.len();
            let active = self.tiers[idx].active.load(Ordering::Acquire);
            if queued > 3 * active {
                shadow[idx] += step;
            } else if queued == 0 && active < 2 {
                shadow[idx] -= step;
            }
        }

        if f64::from_bits(self.tiers[ll].avg_ms_bits.load(Ordering::Relaxed))
            > SLOW_LOW_LATENCY_MS
        {
            shadow[ll] += step;
        }

        if load.load_average > 2.0 {
            shadow[batch] -= step;
        } else if load.load_average < 1.0 && !self.tiers[batch].queue.is_empty() {
            shadow[batch] += step;
        }

        for idx in 0..TIER_COUNT {
            shadow[idx] = shadow[idx].clamp(cfg.min_concurrency as f64, cfg.max_concurrency as f64);
            let next = shadow[idx].round() as usize;
            let prev = self.tiers[idx].limit.swap(next, Ordering::AcqRel);
            if prev != next {
                debug!(
                    tier = self.tiers[idx].tier.name(),
                    prev, next, "adaptive concurrency adjustment"
                );
            }
        }
        drop(shadow);

        trace!(
            cpu = load.cpu_utilization,
            mem = load.memory_utilization,
            loadavg = load.load_average,
            "adaptation tick"
        );
        // Raised limits may have opened slots.
        self.pump();
    }
}

impl Dispatcher for TierScheduler {
    // Mailbox drains are latency-critical: they go to the LOW_LATENCY tier,
    // and an admission rejection falls back to a direct spawn. A lost
    // wake-up would strand the mailbox.
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        if !self.is_running() {
            return;
        }
        let ll = TaskTier::LowLatency.index();
        match self.tiers[ll].queue.offer(TierTask { future: task }) {
            Ok(()) => self.pump(),
            Err(task) => {
                self.tiers[ll].rejected.fetch_add(1, Ordering::Relaxed);
                warn!("low-latency queue full; spawning drain task directly");
                self.handle.spawn(task.future);
            }
        }
    }

    fn shutdown(&self) {
        self.state.store(SHUTTING_DOWN, Ordering::Release);
        for tier in &self.tiers {
            tier.queue.close();
            let mut drops = 0;
            while tier.queue.dequeue().is_some() {
                drops += 1;
            }
            tier.dropped.fetch_add(drops, Ordering::Relaxed);
        }
    }
}

fn ewma_update(bits: &AtomicU64, count: u64, sample: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let avg = f64::from_bits(current);
        let next = if count == 1 {
            sample
        } else {
            avg * (1.0 - AVG_EWMA_ALPHA) + sample * AVG_EWMA_ALPHA
        };
        match bits.compare_exchange_weak(
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
