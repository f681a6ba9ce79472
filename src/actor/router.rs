use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::actor::{
    Actor, ActorError, Behaviors, Context, HandlerFuture, Message, Pid, Props, SendError,
    DEFAULT_BEHAVIOR,
};
use crate::sync::{fnv_hash_bytes, AtomicRef};
use crate::system::ActorSystem;

/// Slots each routee occupies on the consistent-hash ring. More virtual
/// nodes smooth the key distribution when routees come and go.
pub const VIRTUAL_NODES_PER_ROUTEE: usize = 100;

/// Metadata key consulted first when extracting a consistent-hash key.
pub const ROUTING_KEY: &str = "routingKey";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterStrategy {
    RoundRobin,
    Random,
    Broadcast,
    ConsistentHash,
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub strategy: RouterStrategy,
    pub routees: Vec<Pid>,
}

impl RouterConfig {
    pub fn new(strategy: RouterStrategy, routees: Vec<Pid>) -> RouterConfig {
        RouterConfig { strategy, routees }
    }
}

pub type HashKeyFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

fn default_hash_key(msg: &Message) -> String {
    match msg.metadata.get(ROUTING_KEY).and_then(Value::as_str) {
        Some(key) => key.to_string(),
        None => msg.msg_type.clone(),
    }
}

fn build_ring(routees: &[Pid]) -> BTreeMap<u64, Pid> {
    let mut ring = BTreeMap::new();
    for routee in routees {
        for vnode in 0..VIRTUAL_NODES_PER_ROUTEE {
            let point = fnv_hash_bytes(format!("{}#{}", routee.id, vnode).as_bytes());
            ring.insert(point, routee.clone());
        }
    }
    ring
}

/// Maps one inbound message to one or more outbound sends.
///
/// The routee list is a copy-on-write snapshot: mutations CAS in a new list
/// (and hash ring) while in-flight routing keeps the snapshot it read.
pub struct Router {
    strategy: RouterStrategy,
    routees: AtomicRef<Vec<Pid>>,
    ring: AtomicRef<BTreeMap<u64, Pid>>,
    next: AtomicUsize,
    hash_key: HashKeyFn,
}

impl Router {
    pub fn new(config: RouterConfig) -> Router {
        let ring = build_ring(&config.routees);
        Router {
            strategy: config.strategy,
            routees: AtomicRef::new(config.routees),
            ring: AtomicRef::new(ring),
            next: AtomicUsize::new(0),
            hash_key: Arc::new(default_hash_key),
        }
    }

    /// Overrides how a message maps to a consistent-hash key. The default
    /// consults the `routingKey` metadata entry, then the message type.
    pub fn with_hash_key<F>(mut self, f: F) -> Router
    where
        F: Fn(&Message) -> String + Send + Sync + 'static,
    {
        self.hash_key = Arc::new(f);
        self
    }

    pub fn routees(&self) -> Arc<Vec<Pid>> {
        self.routees.get()
    }

    pub fn add_routee(&self, pid: Pid) {
        let updated = self.routees.update_and_get(|current| {
            if current.contains(&pid) {
                current.clone()
            } else {
                let mut next = current.clone();
                next.push(pid.clone());
                next
            }
        });
        self.ring.set(build_ring(&updated));
    }

    pub fn remove_routee(&self, pid: &Pid) {
        let updated = self.routees.update_and_get(|current| {
            current.iter().filter(|p| *p != pid).cloned().collect()
        });
        self.ring.set(build_ring(&updated));
    }

    /// Resolves the targets for one message against the current snapshot.
    pub fn route_targets(&self, msg: &Message) -> Vec<Pid> {
        let snapshot = self.routees.get();
        if snapshot.is_empty() {
            return Vec::new();
        }
        match self.strategy {
            RouterStrategy::RoundRobin => {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % snapshot.len();
                vec![snapshot[index].clone()]
            }
            RouterStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..snapshot.len());
                vec![snapshot[index].clone()]
            }
            RouterStrategy::Broadcast => snapshot.as_ref().clone(),
            RouterStrategy::ConsistentHash => {
                let ring = self.ring.get();
                if ring.is_empty() {
                    return Vec::new();
                }
                let point = fnv_hash_bytes((self.hash_key)(msg).as_bytes());
                let routee = ring
                    .range(point..)
                    .next()
                    .or_else(|| ring.iter().next())
                    .map(|(_, pid)| pid.clone());
                routee.into_iter().collect()
            }
        }
    }

    /// Routes a message, preserving its original sender. Returns how many
    /// deliveries were accepted; the first rejection aborts.
    pub async fn route(&self, msg: Message, system: &ActorSystem) -> Result<usize, SendError> {
        let targets = self.route_targets(&msg);
        let mut delivered = 0;
        for target in &targets {
            system.send(target, msg.clone()).await?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

fn route_message<'a>(
    actor: &'a mut RouterActor,
    ctx: &'a Context,
    msg: Message,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let router = actor.router.clone();
        match router.route(msg, ctx.system()).await {
            Ok(0) => {
                warn!(pid = %ctx.pid(), "router has no routees; message dropped");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(ActorError::new(err.to_string())),
        }
    })
}

/// A router spawned as a virtual actor: inbound user messages fan out to
/// the routees, while the shared [`Router`] handle stays available for
/// concurrent `add_routee`/`remove_routee`.
pub struct RouterActor {
    router: Arc<Router>,
}

impl RouterActor {
    pub fn new(router: Arc<Router>) -> RouterActor {
        RouterActor { router }
    }

    pub fn props(router: Arc<Router>) -> Props<RouterActor> {
        Props::new(move || RouterActor::new(router.clone()))
    }
}

impl Actor for RouterActor {
    fn behaviors() -> Behaviors<Self> {
        Behaviors::new().with(DEFAULT_BEHAVIOR, route_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pids(n: usize) -> Vec<Pid> {
        (0..n).map(|i| Pid::local(format!("routee-{}", i))).collect()
    }

    #[test]
    fn round_robin_cycles_in_insertion_order() {
        let router = Router::new(RouterConfig::new(RouterStrategy::RoundRobin, pids(3)));
        let msg = Message::new("work", json!({}));
        let order: Vec<String> = (0..6)
            .map(|_| router.route_targets(&msg)[0].id.clone())
            .collect();
        assert_eq!(
            order,
            vec!["routee-0", "routee-1", "routee-2", "routee-0", "routee-1", "routee-2"]
        );
    }

    #[test]
    fn broadcast_targets_every_routee() {
        let router = Router::new(RouterConfig::new(RouterStrategy::Broadcast, pids(4)));
        let targets = router.route_targets(&Message::new("work", json!({})));
        assert_eq!(targets.len(), 4);
    }

    #[test]
    fn random_stays_within_routee_set() {
        let routees = pids(3);
        let router = Router::new(RouterConfig::new(RouterStrategy::Random, routees.clone()));
        for _ in 0..50 {
            let targets = router.route_targets(&Message::new("work", json!({})));
            assert_eq!(targets.len(), 1);
            assert!(routees.contains(&targets[0]));
        }
    }

    #[test]
    fn consistent_hash_is_stable_for_a_key() {
        let router = Router::new(RouterConfig::new(RouterStrategy::ConsistentHash, pids(5)));
        let msg = Message::new("work", json!({})).with_metadata(ROUTING_KEY, json!("user-42"));
        let first = router.route_targets(&msg)[0].clone();
        for _ in 0..20 {
            assert_eq!(router.route_targets(&msg)[0], first);
        }
    }

    #[test]
    fn consistent_hash_survives_unrelated_membership_churn() {
        let router = Router::new(RouterConfig::new(RouterStrategy::ConsistentHash, pids(5)));
        let msg = Message::new("work", json!({})).with_metadata(ROUTING_KEY, json!("user-42"));
        let owner = router.route_targets(&msg)[0].clone();

        let extra = Pid::local("routee-extra");
        router.add_routee(extra.clone());
        // The key either stays put or moves to the new routee, never to an
        // arbitrary third node.
        let after_add = router.route_targets(&msg)[0].clone();
        assert!(after_add == owner || after_add == extra);

        router.remove_routee(&extra);
        assert_eq!(router.route_targets(&msg)[0], owner);
    }

    #[test]
    fn routee_mutation_is_copy_on_write() {
        let router = Router::new(RouterConfig::new(RouterStrategy::Broadcast, pids(2)));
        let snapshot = router.routees();
        router.add_routee(Pid::local("routee-2"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(router.routees().len(), 3);
        router.add_routee(Pid::local("routee-2"));
        assert_eq!(router.routees().len(), 3);
    }

    #[test]
    fn empty_router_routes_nowhere() {
        let router = Router::new(RouterConfig::new(RouterStrategy::RoundRobin, Vec::new()));
        assert!(router.route_targets(&Message::new("work", json!({}))).is_empty());
    }
}
