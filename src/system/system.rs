use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use config::Config;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::actor::{
    Actor, ActorError, CellState, Directive, Dock, Message, Pid, Props, RequestError,
    RestartTracker, SendError, SpawnError, SystemMsg, SYSTEM_ACK,
};
use crate::config::{load_config, RequestConfig};
use crate::kernel::{
    Dispatcher, Mailbox, MailboxConfig, MailboxError, MailboxInvoker, SchedulerConfig,
    SchedulerMetrics, TierScheduler,
};
use crate::remote::{MessageStore, RemoteEnvelope, Transport};
use crate::sync::{MapStats, SegmentedMap, SegmentedSet};
use crate::system::{RequestTable, SystemError};
use crate::validate::validate_name;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;

#[derive(Clone)]
pub(crate) struct ActorEntry {
    pub(crate) cell: Arc<CellState>,
    // Kept alive here: the registry owns the only strong reference to each
    // actor's dock.
    #[allow(dead_code)]
    pub(crate) invoker: Arc<dyn MailboxInvoker>,
}

struct SystemInner {
    id: Uuid,
    name: String,
    started_at: DateTime<Utc>,
    debug: bool,
    config: Config,
    registry: SegmentedMap<String, ActorEntry>,
    paths: SegmentedSet<String>,
    scheduler: Arc<TierScheduler>,
    dispatcher: Arc<dyn Dispatcher>,
    requests: RequestTable,
    request_config: RequestConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    store: RwLock<Option<Arc<dyn MessageStore>>>,
    root_directive: Directive,
    state: AtomicU8,
}

/// The actor runtime coordinator: owns the pid registry, the tier
/// scheduler that executes every mailbox, the request-correlation table,
/// and the optional remote transport and message store hooks.
///
/// Create one per application, inside a tokio runtime. Cloning is cheap and
/// shares the same system.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    /// Creates a system named `strata` with configuration from
    /// [`load_config`].
    ///
    /// # Panics
    /// Outside of a tokio runtime context.
    pub fn new() -> Result<ActorSystem, SystemError> {
        ActorSystem::with_config("strata", load_config())
    }

    pub fn with_name(name: &str) -> Result<ActorSystem, SystemError> {
        ActorSystem::with_config(name, load_config())
    }

    pub fn with_config(name: &str, config: Config) -> Result<ActorSystem, SystemError> {
        validate_name(name).map_err(|_| SystemError::InvalidName(name.into()))?;

        let debug = config.get_bool("debug").unwrap();
        let scheduler = TierScheduler::new(SchedulerConfig::from(&config));
        let dispatcher: Arc<dyn Dispatcher> = scheduler.clone();
        let request_config = RequestConfig::from(&config);

        let inner = Arc::new(SystemInner {
            id: Uuid::new_v4(),
            name: name.to_string(),
            started_at: Utc::now(),
            debug,
            config,
            registry: SegmentedMap::new(),
            paths: SegmentedSet::new(),
            scheduler,
            dispatcher,
            requests: RequestTable::new(),
            request_config,
            transport: RwLock::new(None),
            store: RwLock::new(None),
            root_directive: Directive::Stop,
            state: AtomicU8::new(RUNNING),
        });

        spawn_request_reaper(&inner);

        debug!(system = name, id = %inner.id, "actor system started");
        Ok(ActorSystem { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn start_date(&self) -> &DateTime<Utc> {
        &self.inner.started_at
    }

    /// Seconds since the system started.
    pub fn uptime(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.inner.started_at)
            .num_seconds()
            .max(0) as u64
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn actor_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    pub fn scheduler_metrics(&self) -> SchedulerMetrics {
        self.inner.scheduler.metrics()
    }

    pub fn registry_stats(&self) -> MapStats {
        self.inner.registry.stats()
    }

    pub fn scheduler(&self) -> &Arc<TierScheduler> {
        &self.inner.scheduler
    }

    // ---- spawning -------------------------------------------------------

    /// Spawns a top-level actor. Construction completes before the pid is
    /// returned; the first message can arrive at any moment afterwards, but
    /// never before `pre_start` has run.
    pub fn spawn<A: Actor>(&self, props: Props<A>) -> Result<Pid, SpawnError> {
        self.spawn_internal(props, None)
    }

    pub(crate) fn spawn_child<A: Actor>(
        &self,
        props: Props<A>,
        parent: &Arc<CellState>,
    ) -> Result<Pid, SpawnError> {
        self.spawn_internal(props, Some(parent))
    }

    fn spawn_internal<A: Actor>(
        &self,
        props: Props<A>,
        parent: Option<&Arc<CellState>>,
    ) -> Result<Pid, SpawnError> {
        if !self.is_running() {
            return Err(SpawnError::SystemShuttingDown);
        }
        if let Some(name) = &props.name {
            validate_name(name).map_err(|_| SpawnError::InvalidName(name.clone()))?;
        }

        let id = Uuid::new_v4().to_string();
        let parent_path = match parent {
            Some(cell) => cell.path.clone(),
            None => format!("/{}", self.inner.name),
        };
        let leaf = props.name.clone().unwrap_or_else(|| id.clone());
        let path = format!("{}/{}", parent_path, leaf);
        if !self.inner.paths.insert(path.clone()) {
            return Err(SpawnError::AlreadyExists(path));
        }

        let pid = Pid {
            id: id.clone(),
            address: props.address.clone(),
        };
        trace!(%pid, path = %path, "spawning actor");

        let actor = props.produce();
        let supervisor = props
            .supervisor
            .clone()
            .unwrap_or_else(|| actor.supervisor_strategy());
        let restarts = RestartTracker::new(supervisor.max_restarts, supervisor.window);
        let mailbox = Mailbox::new(
            props
                .mailbox
                .clone()
                .unwrap_or_else(|| MailboxConfig::from(&self.inner.config)),
        );

        let cell = Arc::new(CellState {
            pid: pid.clone(),
            parent: parent.map(|cell| cell.pid.clone()),
            path,
            children: SegmentedSet::new(),
            behavior: RwLock::new(A::initial_behavior().to_string()),
            stopped: AtomicBool::new(false),
            supervisor,
            restarts,
            mailbox: mailbox.clone(),
        });

        let dock: Arc<Dock<A>> = Arc::new(Dock::new(
            actor,
            A::behaviors(),
            props.producer.clone(),
            cell.clone(),
            self.clone(),
        ));
        let dispatcher = props
            .dispatcher
            .clone()
            .unwrap_or_else(|| self.inner.dispatcher.clone());
        mailbox.register_handlers(dock.clone(), dispatcher);

        self.inner.registry.insert(
            id,
            ActorEntry {
                cell: cell.clone(),
                invoker: dock,
            },
        );
        if let Some(parent) = parent {
            parent.children.insert(pid.clone());
        }

        // Init goes in before the initial suspension lifts, so pre_start
        // always precedes the first user message.
        if let Err(e) = mailbox.post_system_message(SystemMsg::Init) {
            warn!(%pid, %e, "failed to queue init message");
        }
        mailbox.start();
        Ok(pid)
    }

    // ---- sending --------------------------------------------------------

    pub(crate) fn entry(&self, pid: &Pid) -> Option<ActorEntry> {
        self.inner.registry.get(&pid.id)
    }

    fn local_address(&self) -> Option<String> {
        self.inner
            .transport
            .read()
            .unwrap()
            .as_ref()
            .map(|t| t.local_address())
    }

    fn is_remote(&self, pid: &Pid) -> bool {
        match &pid.address {
            None => false,
            Some(addr) => self.local_address().as_deref() != Some(addr.as_str()),
        }
    }

    /// Delivers `msg` to the target's mailbox. Resolves once the mailbox
    /// accepts the message, not when it is processed. Remote pids delegate
    /// to the registered transport.
    pub async fn send(&self, target: &Pid, msg: Message) -> Result<(), SendError> {
        if self.is_remote(target) {
            return self.send_remote(target, msg).await;
        }
        let entry = self
            .entry(target)
            .ok_or_else(|| SendError::UnknownTarget(target.clone()))?;

        let posted = if msg.is_system() {
            match SystemMsg::from_message(&msg) {
                Some(sys) => entry.cell.mailbox.post_system_message(sys),
                None => {
                    warn!(msg_type = %msg.msg_type, "unrecognized reserved message dropped");
                    return Ok(());
                }
            }
        } else {
            entry.cell.mailbox.post_user_message(msg)
        };

        posted.map_err(|e| match e {
            MailboxError::Full => SendError::MailboxFull(target.clone()),
            MailboxError::Closed => SendError::MailboxClosed(target.clone()),
        })
    }

    async fn send_remote(&self, target: &Pid, msg: Message) -> Result<(), SendError> {
        let address = match &target.address {
            Some(addr) => addr.clone(),
            None => return Err(SendError::UnknownTarget(target.clone())),
        };
        let transport = self
            .inner
            .transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SendError::NoTransport(address.clone()))?;
        let store = self.inner.store.read().unwrap().clone();

        let envelope = RemoteEnvelope::new(target.clone(), msg.sender.clone(), msg);
        if let Some(store) = &store {
            store
                .save(&envelope)
                .await
                .map_err(|e| SendError::Transport(e.to_string()))?;
        }
        transport
            .send(&address, envelope.clone())
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        if let Some(store) = &store {
            if let Err(e) = store.mark_delivered(&envelope.id).await {
                warn!(id = %envelope.id, %e, "failed to mark envelope delivered");
            }
        }
        Ok(())
    }

    // ---- request / response ---------------------------------------------

    /// Ask pattern: registers a correlation entry, sends, and awaits the
    /// response or the deadline.
    pub async fn request(
        &self,
        target: &Pid,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, RequestError> {
        self.request_with_sender(target, msg, timeout, None).await
    }

    pub(crate) async fn request_with_sender(
        &self,
        target: &Pid,
        msg: Message,
        timeout: Option<Duration>,
        sender: Option<Pid>,
    ) -> Result<Message, RequestError> {
        let timeout =
            timeout.unwrap_or(Duration::from_millis(self.inner.request_config.timeout_ms));
        let response_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .requests
            .register(response_id.clone(), tx, Instant::now() + timeout);

        // A caller without a mailbox gets a synthetic requester pid; the
        // response resolves through the table, never through a mailbox.
        let mut sender = sender.unwrap_or_else(|| Pid::local(format!("$ask-{}", response_id)));
        // A remote responder needs our address to route the reply back.
        if self.is_remote(target) && sender.address.is_none() {
            sender.address = self.local_address();
        }
        let msg = msg.with_response_id(response_id.clone()).with_sender(sender);

        if let Err(e) = self.send(target, msg).await {
            self.inner.requests.remove(&response_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Canceled),
            Err(_) => {
                self.inner.requests.remove(&response_id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Resolves the request that produced `incoming` with a value or an
    /// error. Local requesters are completed through the request table;
    /// remote ones get a reply envelope.
    pub async fn respond(
        &self,
        incoming: &Message,
        result: Result<Value, ActorError>,
    ) -> Result<(), SendError> {
        let response_id = match &incoming.response_id {
            Some(rid) => rid.clone(),
            None => {
                warn!(msg_type = %incoming.msg_type, "respond called on a message without responseId");
                return Ok(());
            }
        };

        match &incoming.sender {
            Some(sender) if self.is_remote(sender) => {
                let reply = match result {
                    Ok(value) => Message::new(incoming.msg_type.clone(), value)
                        .with_response_id(response_id),
                    Err(err) => Message::new(incoming.msg_type.clone(), Value::Null)
                        .with_response_id(response_id)
                        .with_metadata("$error", json!(err.to_string())),
                };
                self.send(sender, reply).await
            }
            _ => {
                let completion = result
                    .map(|value| {
                        Message::new(incoming.msg_type.clone(), value)
                            .with_response_id(response_id.clone())
                    })
                    .map_err(RequestError::Rejected);
                if !self.inner.requests.complete(&response_id, completion) {
                    debug!(response_id = %response_id, "response arrived for an expired request");
                }
                Ok(())
            }
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Stops an actor: children first, `post_stop` exactly once, registry
    /// removal. Idempotent; unknown pids are ignored.
    pub fn stop(&self, pid: &Pid) {
        let entry = match self.entry(pid) {
            Some(entry) => entry,
            None => return,
        };
        if let Err(e) = entry.cell.mailbox.post_system_message(SystemMsg::Stop) {
            warn!(%pid, %e, "failed to queue stop");
            return;
        }
        // A stop must get through even on an errored, suspended mailbox.
        entry.cell.mailbox.clear_error();
        entry.cell.mailbox.resume();
    }

    pub(crate) fn restart_child(&self, pid: &Pid, reason: ActorError) {
        let entry = match self.entry(pid) {
            Some(entry) => entry,
            None => return,
        };
        if let Err(e) = entry
            .cell
            .mailbox
            .post_system_message(SystemMsg::Restart { reason })
        {
            warn!(%pid, %e, "failed to queue restart");
            return;
        }
        entry.cell.mailbox.clear_error();
        entry.cell.mailbox.resume();
    }

    pub(crate) fn resume_child(&self, pid: &Pid) {
        if let Some(entry) = self.entry(pid) {
            entry.cell.mailbox.clear_error();
            entry.cell.mailbox.resume();
        }
    }

    pub(crate) fn post_failure(&self, supervisor: &Pid, child: Pid, error: ActorError) {
        if let Some(entry) = self.entry(supervisor) {
            if let Err(e) = entry
                .cell
                .mailbox
                .post_system_message(SystemMsg::Failure { child, error })
            {
                warn!(%supervisor, %e, "failed to queue failure notification");
            }
        }
    }

    /// Routes a handler failure to the supervisor: the parent when there is
    /// one, else the system root policy (stop, by default).
    pub(crate) fn handle_actor_error(&self, pid: &Pid, error: ActorError) {
        let entry = match self.entry(pid) {
            Some(entry) => entry,
            None => return,
        };
        if self.inner.debug {
            debug!(%pid, %error, "actor failure reported");
        }
        match &entry.cell.parent {
            Some(parent) if self.entry(parent).is_some() => {
                self.post_failure(parent, pid.clone(), error);
            }
            _ => self.apply_root_policy(pid, error),
        }
    }

    fn apply_root_policy(&self, pid: &Pid, error: ActorError) {
        warn!(%pid, %error, "unhandled failure at root");
        match self.inner.root_directive {
            Directive::Resume => self.resume_child(pid),
            Directive::Restart => self.restart_child(pid, error),
            _ => self.stop(pid),
        }
    }

    pub(crate) fn unregister(&self, cell: &CellState) {
        self.inner.registry.remove(&cell.pid.id);
        self.inner.paths.remove(&cell.path);
        if let Some(parent) = &cell.parent {
            if let Some(entry) = self.entry(parent) {
                entry.cell.children.remove(&cell.pid);
                entry.cell.restarts.forget(&cell.pid.id);
            }
        }
        cell.mailbox.close();
        debug!(pid = %cell.pid, "actor stopped");
    }

    /// Graceful shutdown: stops every top-level actor, waits for the stop
    /// cascade, then drains the scheduler.
    pub async fn shutdown(&self) {
        self.inner.state.store(SHUTTING_DOWN, Ordering::Release);

        let top_level: Vec<Pid> = self
            .inner
            .registry
            .entries()
            .into_iter()
            .filter(|(_, entry)| entry.cell.parent.is_none())
            .map(|(_, entry)| entry.cell.pid.clone())
            .collect();
        for pid in &top_level {
            self.stop(pid);
        }

        for _ in 0..200 {
            if self.inner.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.inner.registry.is_empty() {
            warn!(
                remaining = self.inner.registry.len(),
                "shutdown timed out waiting for actors to stop"
            );
        }

        self.inner.scheduler.drain_shutdown().await;
        debug!(system = %self.inner.name, "actor system stopped");
    }

    // ---- remote hooks ---------------------------------------------------

    /// Installs the transport and wires its inbound path into this system.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let system = self.clone();
        transport.set_message_handler(Arc::new(move |envelope| {
            system.handle_remote_envelope(envelope);
        }));
        *self.inner.transport.write().unwrap() = Some(transport);
    }

    /// Installs the message store that upgrades remote sends to
    /// at-least-once.
    pub fn register_store(&self, store: Arc<dyn MessageStore>) {
        *self.inner.store.write().unwrap() = Some(store);
    }

    /// Entry point for envelopes arriving from a transport.
    pub fn handle_remote_envelope(&self, envelope: RemoteEnvelope) {
        let system = self.clone();
        self.inner.dispatcher.schedule(Box::pin(async move {
            system.process_inbound(envelope).await;
        }));
    }

    async fn process_inbound(&self, envelope: RemoteEnvelope) {
        let msg = envelope.message.clone();

        if msg.msg_type == SYSTEM_ACK {
            if let Some(id) = msg.payload.get("id").and_then(Value::as_str) {
                let store = self.inner.store.read().unwrap().clone();
                if let Some(store) = store {
                    if let Err(e) = store.mark_acknowledged(id).await {
                        warn!(id, %e, "failed to acknowledge envelope");
                    }
                }
            }
            return;
        }

        // Responses resolve the request table instead of a mailbox.
        if let Some(rid) = &msg.response_id {
            if self.inner.requests.contains(rid) {
                let completion = match msg.metadata.get("$error").and_then(Value::as_str) {
                    Some(err) => Err(RequestError::Rejected(ActorError::new(err))),
                    None => Ok(msg.clone()),
                };
                self.inner.requests.complete(rid, completion);
                return;
            }
        }

        let local_target = Pid::local(envelope.to.id.clone());
        match self.send(&local_target, msg).await {
            Ok(()) => self.acknowledge(&envelope).await,
            Err(e) => warn!(to = %envelope.to, %e, "inbound envelope not delivered"),
        }
    }

    async fn acknowledge(&self, envelope: &RemoteEnvelope) {
        let origin = match &envelope.from {
            Some(from) if from.address.is_some() => from.clone(),
            _ => return,
        };
        let ack = Message::new(SYSTEM_ACK, json!({ "id": envelope.id }));
        if let Err(e) = self.send(&origin, ack).await {
            debug!(origin = %origin, %e, "ack not delivered");
        }
    }

    /// Replays stored, never-acknowledged envelopes for `receiver` through
    /// the transport. Returns how many were resent.
    pub async fn redeliver_unacknowledged(&self, receiver: &Pid) -> Result<usize, SendError> {
        let store = self
            .inner
            .store
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SendError::Transport("no message store registered".into()))?;
        let transport = self
            .inner
            .transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SendError::NoTransport("<unset>".into()))?;

        let backlog = store
            .get_unacknowledged(receiver)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let mut resent = 0;
        for envelope in backlog {
            let address = match &envelope.to.address {
                Some(addr) => addr.clone(),
                None => continue,
            };
            transport
                .send(&address, envelope)
                .await
                .map_err(|e| SendError::Transport(e.to_string()))?;
            resent += 1;
        }
        Ok(resent)
    }
}

impl fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ActorSystem[name: {}, actors: {}, uptime: {}s]",
            self.inner.name,
            self.actor_count(),
            self.uptime()
        )
    }
}

fn spawn_request_reaper(inner: &Arc<SystemInner>) {
    let weak: Weak<SystemInner> = Arc::downgrade(inner);
    let period = Duration::from_millis(inner.request_config.reap_interval_ms.max(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            if inner.state.load(Ordering::Acquire) != RUNNING {
                break;
            }
            inner.requests.reap_expired();
        }
    });
}
