use std::sync::Arc;

use crate::actor::{Actor, SupervisorStrategy};
use crate::kernel::{Dispatcher, MailboxConfig};

/// Spawn recipe: the producer that builds (and rebuilds, on restart) the
/// actor instance, plus optional overrides.
///
/// Arguments travel by closure capture:
///
/// ```ignore
/// let greeting = "hello".to_string();
/// let props = Props::new(move || Greeter::new(greeting.clone())).with_name("greeter");
/// ```
pub struct Props<A: Actor> {
    pub(crate) producer: Arc<dyn Fn() -> A + Send + Sync>,
    pub(crate) name: Option<String>,
    pub(crate) address: Option<String>,
    pub(crate) mailbox: Option<MailboxConfig>,
    pub(crate) supervisor: Option<SupervisorStrategy>,
    pub(crate) dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl<A: Actor> Props<A> {
    pub fn new<F>(producer: F) -> Props<A>
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Props {
            producer: Arc::new(producer),
            name: None,
            address: None,
            mailbox: None,
            supervisor: None,
            dispatcher: None,
        }
    }

    /// Names the actor. Names are unique per parent; unnamed actors get a
    /// generated id.
    pub fn with_name(mut self, name: impl Into<String>) -> Props<A> {
        self.name = Some(name.into());
        self
    }

    /// Tags the pid with a transport address.
    pub fn with_address(mut self, address: impl Into<String>) -> Props<A> {
        self.address = Some(address.into());
        self
    }

    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Props<A> {
        self.mailbox = Some(mailbox);
        self
    }

    /// Overrides the strategy the actor applies to its children.
    pub fn with_supervisor(mut self, supervisor: SupervisorStrategy) -> Props<A> {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Props<A> {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub(crate) fn produce(&self) -> A {
        (self.producer)()
    }
}

impl<A: Actor> Clone for Props<A> {
    fn clone(&self) -> Self {
        Props {
            producer: self.producer.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            mailbox: self.mailbox.clone(),
            supervisor: self.supervisor.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}
