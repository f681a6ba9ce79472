use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::actor::ActorError;

/// What a supervisor does about one child failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Clear the error and resume the child's mailbox. The failing message
    /// is lost.
    Resume,
    /// Replace the child's state with a fresh instance, then resume.
    Restart,
    /// Stop the child (children first) and remove it from the registry.
    Stop,
    /// Report the failure to the grandparent. At the root this becomes
    /// `Stop`.
    Escalate,
}

/// Whether a directive applies to the failed child alone or to every
/// sibling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisionScope {
    OneForOne,
    OneForAll,
}

pub type Decider = Arc<dyn Fn(&ActorError) -> Directive + Send + Sync>;

/// Parent-owned policy mapping child failures to directives, with a
/// sliding-window restart budget: once a child exhausts `max_restarts`
/// within `window`, a `Restart` directive falls through to `Stop`.
#[derive(Clone)]
pub struct SupervisorStrategy {
    pub scope: SupervisionScope,
    pub max_restarts: u32,
    pub window: Duration,
    decider: Decider,
}

impl SupervisorStrategy {
    pub fn one_for_one(max_restarts: u32, window: Duration) -> SupervisorStrategy {
        SupervisorStrategy {
            scope: SupervisionScope::OneForOne,
            max_restarts,
            window,
            decider: Arc::new(|_| Directive::Restart),
        }
    }

    pub fn one_for_all(max_restarts: u32, window: Duration) -> SupervisorStrategy {
        SupervisorStrategy {
            scope: SupervisionScope::OneForAll,
            ..SupervisorStrategy::one_for_one(max_restarts, window)
        }
    }

    pub fn with_decider<F>(mut self, decider: F) -> SupervisorStrategy
    where
        F: Fn(&ActorError) -> Directive + Send + Sync + 'static,
    {
        self.decider = Arc::new(decider);
        self
    }

    pub fn decide(&self, error: &ActorError) -> Directive {
        (self.decider)(error)
    }
}

impl Default for SupervisorStrategy {
    fn default() -> Self {
        SupervisorStrategy::one_for_one(10, Duration::from_secs(10))
    }
}

impl fmt::Debug for SupervisorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorStrategy")
            .field("scope", &self.scope)
            .field("max_restarts", &self.max_restarts)
            .field("window", &self.window)
            .finish()
    }
}

/// Per-child sliding-window restart counter.
pub struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    history: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RestartTracker {
    pub fn new(max_restarts: u32, window: Duration) -> RestartTracker {
        RestartTracker {
            max_restarts,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Records a restart attempt for `child_id` and reports whether it is
    /// still within budget.
    pub fn allow(&self, child_id: &str) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock().unwrap();
        let attempts = history.entry(child_id.to_string()).or_default();
        attempts.retain(|at| now.duration_since(*at) < self.window);
        if attempts.len() as u32 >= self.max_restarts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drops the history for a child that stopped.
    pub fn forget(&self, child_id: &str) {
        self.history.lock().unwrap().remove(child_id);
    }
}
