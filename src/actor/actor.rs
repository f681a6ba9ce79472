use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::actor::{ActorError, Context, Message, SupervisorStrategy};

/// Name of the behavior an actor starts in unless it overrides
/// [`Actor::initial_behavior`].
pub const DEFAULT_BEHAVIOR: &str = "default";

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ActorError>> + Send + 'a>>;

/// A named message handler. Handlers are plain functions over the actor's
/// state; the runtime dispatches whichever one the current behavior names.
pub type Handler<A> =
    Box<dyn for<'a> Fn(&'a mut A, &'a Context, Message) -> HandlerFuture<'a> + Send + Sync>;

/// The actor's name → handler map. The current behavior selects which
/// handler receives user messages; `Context::set_behavior` switches.
pub struct Behaviors<A> {
    handlers: HashMap<&'static str, Handler<A>>,
}

impl<A> Behaviors<A> {
    pub fn new() -> Behaviors<A> {
        Behaviors {
            handlers: HashMap::new(),
        }
    }

    pub fn with<F>(mut self, name: &'static str, handler: F) -> Behaviors<A>
    where
        F: for<'a> Fn(&'a mut A, &'a Context, Message) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name, Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Handler<A>> {
        self.handlers.get(name)
    }
}

impl<A> Default for Behaviors<A> {
    fn default() -> Self {
        Behaviors::new()
    }
}

/// An isolated, message-driven entity.
///
/// At most one handler or lifecycle hook of an actor runs at any instant;
/// the mailbox's `processing` flag guarantees it. Handlers may await freely:
/// the drain batch awaits each invocation before moving on.
///
/// # Examples
///
/// ```ignore
/// struct Counter {
///     count: u64,
/// }
///
/// fn counting<'a>(actor: &'a mut Counter, ctx: &'a Context, msg: Message) -> HandlerFuture<'a> {
///     Box::pin(async move {
///         actor.count += 1;
///         if actor.count >= 10 {
///             ctx.set_behavior("saturated");
///         }
///         Ok(())
///     })
/// }
///
/// fn saturated<'a>(_: &'a mut Counter, _: &'a Context, _: Message) -> HandlerFuture<'a> {
///     Box::pin(async move { Err(ActorError::new("counter saturated")) })
/// }
///
/// impl Actor for Counter {
///     fn behaviors() -> Behaviors<Self> {
///         Behaviors::new()
///             .with(DEFAULT_BEHAVIOR, counting)
///             .with("saturated", saturated)
///     }
/// }
/// ```
#[async_trait]
pub trait Actor: Send + Sized + 'static {
    /// The full set of named behaviors this actor can switch between.
    fn behaviors() -> Behaviors<Self>;

    fn initial_behavior() -> &'static str {
        DEFAULT_BEHAVIOR
    }

    /// Invoked once before the first message. An error here suspends the
    /// mailbox and escalates to the supervisor.
    async fn pre_start(&mut self, _ctx: &Context) -> Result<(), ActorError> {
        Ok(())
    }

    /// Invoked on the old instance before a restart replaces it.
    async fn pre_restart(&mut self, _ctx: &Context, _reason: &ActorError) {}

    /// Invoked on the fresh instance after a restart.
    async fn post_restart(&mut self, _ctx: &Context, _reason: &ActorError) {}

    /// Invoked exactly once after the actor has stopped.
    async fn post_stop(&mut self) {}

    /// Strategy applied to failures of this actor's children.
    fn supervisor_strategy(&self) -> SupervisorStrategy {
        SupervisorStrategy::default()
    }
}
