use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{trace, warn};

use crate::actor::{
    Actor, ActorError, Behaviors, Directive, Message, Pid, Props, RequestError, RestartTracker,
    SendError, SpawnError, SupervisionScope, SupervisorStrategy, SystemMsg,
};
use crate::kernel::{Mailbox, MailboxInvoker};
use crate::sync::SegmentedSet;
use crate::system::ActorSystem;

/// Shared, non-generic slice of an actor's runtime state: identity, family
/// links, the active behavior, and the mailbox.
///
/// The children set holds pids only; the registry holds the sole strong
/// reference to each actor, so parent/child cycles never pin memory.
pub(crate) struct CellState {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    pub(crate) path: String,
    pub(crate) children: SegmentedSet<Pid>,
    pub(crate) behavior: RwLock<String>,
    pub(crate) stopped: AtomicBool,
    pub(crate) supervisor: SupervisorStrategy,
    pub(crate) restarts: RestartTracker,
    pub(crate) mailbox: Mailbox,
}

/// Owns the actor instance and its behavior table; implements the invoker
/// its mailbox drains into.
///
/// The instance sits in an async mutex, but the mailbox's `processing` flag
/// already guarantees one batch in flight, so the lock is uncontended; it
/// exists to move the instance out during restart.
pub(crate) struct Dock<A: Actor> {
    actor: tokio::sync::Mutex<Option<A>>,
    behaviors: Behaviors<A>,
    producer: Arc<dyn Fn() -> A + Send + Sync>,
    cell: Arc<CellState>,
    system: ActorSystem,
}

impl<A: Actor> Dock<A> {
    pub(crate) fn new(
        actor: A,
        behaviors: Behaviors<A>,
        producer: Arc<dyn Fn() -> A + Send + Sync>,
        cell: Arc<CellState>,
        system: ActorSystem,
    ) -> Dock<A> {
        Dock {
            actor: tokio::sync::Mutex::new(Some(actor)),
            behaviors,
            producer,
            cell,
            system,
        }
    }

    async fn handle_init(&self) -> Result<(), ActorError> {
        let mut guard = self.actor.lock().await;
        if let Some(actor) = guard.as_mut() {
            let ctx = Context::for_cell(&self.cell, &self.system);
            let outcome = std::panic::AssertUnwindSafe(actor.pre_start(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ActorError::new("panicked in pre_start")));
            if let Err(err) = outcome {
                self.system.handle_actor_error(&self.cell.pid, err.clone());
                return Err(err);
            }
            trace!(pid = %self.cell.pid, "actor started");
        }
        Ok(())
    }

    async fn handle_restart(&self, reason: ActorError) {
        let mut guard = self.actor.lock().await;
        if guard.is_none() {
            return;
        }
        // Children go down first; their stops complete asynchronously.
        for child in self.cell.children.iter() {
            self.system.stop(&child);
        }
        let ctx = Context::for_cell(&self.cell, &self.system);
        if let Some(actor) = guard.as_mut() {
            let _ = std::panic::AssertUnwindSafe(actor.pre_restart(&ctx, &reason))
                .catch_unwind()
                .await;
        }
        let mut fresh = (self.producer)();
        let _ = std::panic::AssertUnwindSafe(fresh.post_restart(&ctx, &reason))
            .catch_unwind()
            .await;
        *guard = Some(fresh);
        *self.cell.behavior.write().unwrap() = A::initial_behavior().to_string();
        self.cell.mailbox.clear_error();
        self.cell.mailbox.resume();
        trace!(pid = %self.cell.pid, %reason, "actor restarted");
    }

    async fn handle_stop(&self) {
        if self.cell.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for child in self.cell.children.iter() {
            self.system.stop(&child);
        }
        let mut guard = self.actor.lock().await;
        if let Some(mut actor) = guard.take() {
            let _ = std::panic::AssertUnwindSafe(actor.post_stop())
                .catch_unwind()
                .await;
        }
        drop(guard);
        self.system.unregister(&self.cell);
    }

    async fn handle_child_failure(&self, child: Pid, error: ActorError) {
        let strategy = &self.cell.supervisor;
        let directive = strategy.decide(&error);
        let targets: Vec<Pid> = match strategy.scope {
            SupervisionScope::OneForOne => vec![child.clone()],
            SupervisionScope::OneForAll => self.cell.children.iter(),
        };
        trace!(
            parent = %self.cell.pid, failed = %child, ?directive, %error,
            "supervising child failure"
        );

        match directive {
            Directive::Resume => {
                for target in &targets {
                    self.system.resume_child(target);
                }
            }
            Directive::Restart => {
                for target in &targets {
                    if self.cell.restarts.allow(&target.id) {
                        self.system.restart_child(target, error.clone());
                    } else {
                        warn!(pid = %target, "restart budget exhausted; stopping");
                        self.cell.restarts.forget(&target.id);
                        self.system.stop(target);
                    }
                }
            }
            Directive::Stop => {
                for target in &targets {
                    self.system.stop(target);
                }
            }
            Directive::Escalate => match &self.cell.parent {
                Some(parent) => {
                    self.system
                        .post_failure(parent, self.cell.pid.clone(), error);
                }
                None => {
                    // Escalation past the root degenerates to stopping the
                    // failed child.
                    warn!(failed = %child, "failure escalated past root; stopping child");
                    self.system.stop(&child);
                }
            },
        }
    }
}

#[async_trait]
impl<A: Actor> MailboxInvoker for Dock<A> {
    async fn invoke_system(&self, msg: SystemMsg) -> Result<(), ActorError> {
        match msg {
            SystemMsg::Init => self.handle_init().await,
            SystemMsg::Restart { reason } => {
                self.handle_restart(reason).await;
                Ok(())
            }
            SystemMsg::Stop => {
                self.handle_stop().await;
                Ok(())
            }
            SystemMsg::Failure { child, error } => {
                self.handle_child_failure(child, error).await;
                Ok(())
            }
        }
    }

    async fn invoke_user(&self, msg: Message) -> Result<(), ActorError> {
        let mut guard = self.actor.lock().await;
        let actor = match guard.as_mut() {
            // Stopped or mid-restart: the message is dropped.
            None => return Ok(()),
            Some(actor) => actor,
        };
        let behavior = self.cell.behavior.read().unwrap().clone();
        let handler = match self.behaviors.get(&behavior) {
            Some(handler) => handler,
            None => {
                warn!(pid = %self.cell.pid, behavior = %behavior, "no handler for current behavior; message dropped");
                return Ok(());
            }
        };

        let ctx = Context::for_cell(&self.cell, &self.system);
        let outcome = std::panic::AssertUnwindSafe(handler(actor, &ctx, msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ActorError::new("panicked in message handler")));
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                self.system.handle_actor_error(&self.cell.pid, err.clone());
                Err(err)
            }
        }
    }
}

/// The actor's private interface to the runtime, rebuilt per invocation
/// from the shared cell.
pub struct Context {
    pid: Pid,
    parent: Option<Pid>,
    system: ActorSystem,
    cell: Arc<CellState>,
}

impl Context {
    pub(crate) fn for_cell(cell: &Arc<CellState>, system: &ActorSystem) -> Context {
        Context {
            pid: cell.pid.clone(),
            parent: cell.parent.clone(),
            system: system.clone(),
            cell: cell.clone(),
        }
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    pub fn parent(&self) -> Option<&Pid> {
        self.parent.as_ref()
    }

    /// Snapshot of this actor's children.
    pub fn children(&self) -> Vec<Pid> {
        self.cell.children.iter()
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Switches the behavior that receives subsequent user messages. An
    /// unknown name is reported at dispatch time and messages are dropped
    /// until a valid behavior is set.
    pub fn set_behavior(&self, name: impl Into<String>) {
        *self.cell.behavior.write().unwrap() = name.into();
    }

    pub fn behavior(&self) -> String {
        self.cell.behavior.read().unwrap().clone()
    }

    /// Spawns a child of this actor.
    pub fn spawn<A: Actor>(&self, props: Props<A>) -> Result<Pid, SpawnError> {
        self.system.spawn_child(props, &self.cell)
    }

    pub fn stop(&self, pid: &Pid) {
        self.system.stop(pid);
    }

    /// Sends with this actor as the sender unless one is already set.
    pub async fn send(&self, target: &Pid, msg: Message) -> Result<(), SendError> {
        let msg = if msg.sender.is_none() {
            msg.with_sender(self.pid.clone())
        } else {
            msg
        };
        self.system.send(target, msg).await
    }

    /// Ask pattern. Awaiting a request to this same actor deadlocks until
    /// the timeout: the mailbox cannot drain the response while this
    /// handler is still running.
    pub async fn request(
        &self,
        target: &Pid,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, RequestError> {
        self.system
            .request_with_sender(target, msg, timeout, Some(self.pid.clone()))
            .await
    }

    /// Resolves (or rejects) the request that produced `incoming`.
    pub async fn respond(
        &self,
        incoming: &Message,
        result: Result<Value, ActorError>,
    ) -> Result<(), SendError> {
        self.system.respond(incoming, result).await
    }
}
