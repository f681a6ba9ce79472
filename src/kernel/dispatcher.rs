use futures::future::BoxFuture;
use tokio::runtime::Handle;

/// Execution resource that runs mailbox drain batches and other runtime
/// tasks.
pub trait Dispatcher: Send + Sync + 'static {
    fn schedule(&self, task: BoxFuture<'static, ()>);

    /// Stops accepting work. In-flight tasks are left to the underlying
    /// executor.
    fn shutdown(&self);
}

/// Default dispatcher: forwards every task to a tokio runtime handle.
pub struct TokioDispatcher {
    handle: Handle,
}

impl TokioDispatcher {
    /// Captures the current runtime.
    ///
    /// # Panics
    /// Outside of a tokio runtime context.
    pub fn new() -> TokioDispatcher {
        TokioDispatcher {
            handle: Handle::current(),
        }
    }

    pub fn from_handle(handle: Handle) -> TokioDispatcher {
        TokioDispatcher { handle }
    }
}

impl Default for TokioDispatcher {
    fn default() -> Self {
        TokioDispatcher::new()
    }
}

impl Dispatcher for TokioDispatcher {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn shutdown(&self) {
        // The runtime is owned by the embedding application.
    }
}
