#![crate_name = "strata"]
#![deny(clippy::all)]
#![allow(clippy::new_ret_no_self)]
#![allow(clippy::large_enum_variant)]

//! A tiered-scheduling actor runtime.
//!
//! Applications are built as networks of isolated, message-passing actors.
//! Each actor owns a two-priority mailbox (system traffic overtakes user
//! traffic) drained in batches on a layered scheduler that classifies work
//! into CPU / IO / low-latency / batch / default tiers, each with its own
//! concurrency budget and bounded queue. An optional adaptive loop
//! rebalances those budgets from measured load. Failures stay contained:
//! they travel up the supervision hierarchy as directives, never across
//! actor boundaries.

mod validate;

pub mod actor;
pub mod config;
pub mod kernel;
pub mod remote;
pub mod sync;
pub mod system;

/// Convenience re-exports for building applications.
pub mod actors {
    pub use crate::actor::{
        Actor, ActorError, Behaviors, Context, Directive, Handler, HandlerFuture, Message, Pid,
        Props, RequestError, Router, RouterActor, RouterConfig, RouterStrategy, SendError,
        SpawnError, SupervisionScope, SupervisorStrategy, SystemMsg, DEFAULT_BEHAVIOR,
    };
    pub use crate::config::load_config;
    pub use crate::kernel::{
        Dispatcher, Mailbox, MailboxConfig, ScheduleError, SchedulerConfig, TaskTier,
        TierScheduler, TokioDispatcher,
    };
    pub use crate::system::{ActorSystem, SystemError};
}
