//! The runtime engine: mailboxes, the dispatcher seam, and the layered
//! scheduler that dispenses the execution budget across tiers.

mod dispatcher;
mod load;
mod mailbox;
mod scheduler;

pub use self::dispatcher::{Dispatcher, TokioDispatcher};
pub use self::load::{LoadSampler, ProcLoadSampler, StaticLoadSampler, SystemLoad};
pub use self::mailbox::{
    ErrorHook, Mailbox, MailboxConfig, MailboxError, MailboxInvoker, MailboxMetrics,
};
pub use self::scheduler::{
    ScheduleError, SchedulerBuilder, SchedulerConfig, SchedulerMetrics, TaskTier, TierClassifier,
    TierMetrics, TierScheduler,
};
