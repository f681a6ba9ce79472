use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use strata::actors::*;

const WAIT: Duration = Duration::from_secs(5);

struct Worker {
    label: String,
    probe: mpsc::UnboundedSender<(String, u64)>,
}

fn work<'a>(actor: &'a mut Worker, _ctx: &'a Context, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let seq = msg.payload.as_u64().unwrap_or(u64::MAX);
        let _ = actor.probe.send((actor.label.clone(), seq));
        Ok(())
    })
}

impl Actor for Worker {
    fn behaviors() -> Behaviors<Self> {
        Behaviors::new().with(DEFAULT_BEHAVIOR, work)
    }
}

fn spawn_workers(
    sys: &ActorSystem,
    count: usize,
) -> (Vec<Pid>, mpsc::UnboundedReceiver<(String, u64)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pids = (0..count)
        .map(|i| {
            let tx = tx.clone();
            let label = format!("w{}", i);
            sys.spawn(Props::new(move || Worker {
                label: label.clone(),
                probe: tx.clone(),
            }))
            .unwrap()
        })
        .collect();
    (pids, rx)
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<(String, u64)>,
    count: usize,
) -> Vec<(String, u64)> {
    let mut events = Vec::new();
    for _ in 0..count {
        events.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    events
}

#[tokio::test]
async fn round_robin_deals_k_messages_to_each_of_n_routees() {
    let sys = ActorSystem::with_name("rr-law").unwrap();
    let (pids, mut rx) = spawn_workers(&sys, 3);
    let router = Arc::new(Router::new(RouterConfig::new(
        RouterStrategy::RoundRobin,
        pids,
    )));
    let router_pid = sys.spawn(RouterActor::props(router)).unwrap();

    for seq in 0..6u64 {
        sys.send(&router_pid, Message::new("job", json!(seq)))
            .await
            .unwrap();
    }

    let events = collect(&mut rx, 6).await;
    let mut per_routee: HashMap<String, Vec<u64>> = HashMap::new();
    for (label, seq) in events {
        per_routee.entry(label).or_default().push(seq);
    }
    assert_eq!(per_routee.len(), 3);
    assert_eq!(per_routee["w0"], vec![0, 3]);
    assert_eq!(per_routee["w1"], vec![1, 4]);
    assert_eq!(per_routee["w2"], vec![2, 5]);
    sys.shutdown().await;
}

#[tokio::test]
async fn broadcast_delivers_once_per_routee_per_message() {
    let sys = ActorSystem::with_name("broadcast-law").unwrap();
    let (pids, mut rx) = spawn_workers(&sys, 3);
    let router = Arc::new(Router::new(RouterConfig::new(
        RouterStrategy::Broadcast,
        pids,
    )));
    let router_pid = sys.spawn(RouterActor::props(router)).unwrap();

    for seq in 0..2u64 {
        sys.send(&router_pid, Message::new("job", json!(seq)))
            .await
            .unwrap();
    }

    let events = collect(&mut rx, 6).await;
    let mut per_routee: HashMap<String, Vec<u64>> = HashMap::new();
    for (label, seq) in events {
        per_routee.entry(label).or_default().push(seq);
    }
    for label in ["w0", "w1", "w2"] {
        let mut seqs = per_routee[label].clone();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1], "{} deliveries wrong", label);
    }
    sys.shutdown().await;
}

#[tokio::test]
async fn random_spreads_across_the_routee_set() {
    let sys = ActorSystem::with_name("random-route").unwrap();
    let (pids, mut rx) = spawn_workers(&sys, 3);
    let router = Arc::new(Router::new(RouterConfig::new(
        RouterStrategy::Random,
        pids,
    )));
    let router_pid = sys.spawn(RouterActor::props(router)).unwrap();

    for seq in 0..30u64 {
        sys.send(&router_pid, Message::new("job", json!(seq)))
            .await
            .unwrap();
    }
    let events = collect(&mut rx, 30).await;
    assert_eq!(events.len(), 30);
    for (label, _) in &events {
        assert!(["w0", "w1", "w2"].contains(&label.as_str()));
    }
    sys.shutdown().await;
}

#[tokio::test]
async fn consistent_hash_pins_a_key_to_one_worker() {
    let sys = ActorSystem::with_name("hash-route").unwrap();
    let (pids, mut rx) = spawn_workers(&sys, 4);
    let router = Arc::new(Router::new(RouterConfig::new(
        RouterStrategy::ConsistentHash,
        pids,
    )));
    let router_pid = sys.spawn(RouterActor::props(router.clone())).unwrap();

    for seq in 0..10u64 {
        let msg = Message::new("job", json!(seq)).with_metadata("routingKey", json!("user-7"));
        sys.send(&router_pid, msg).await.unwrap();
    }

    let events = collect(&mut rx, 10).await;
    let owner = events[0].0.clone();
    assert!(events.iter().all(|(label, _)| *label == owner));
    sys.shutdown().await;
}

#[tokio::test]
async fn routee_mutations_take_effect_for_later_messages() {
    let sys = ActorSystem::with_name("router-mutate").unwrap();
    let (pids, mut rx) = spawn_workers(&sys, 2);
    let router = Arc::new(Router::new(RouterConfig::new(
        RouterStrategy::RoundRobin,
        pids.clone(),
    )));
    let router_pid = sys.spawn(RouterActor::props(router.clone())).unwrap();

    router.remove_routee(&pids[0]);
    for seq in 0..3u64 {
        sys.send(&router_pid, Message::new("job", json!(seq)))
            .await
            .unwrap();
    }
    let events = collect(&mut rx, 3).await;
    assert!(events.iter().all(|(label, _)| label == "w1"));
    sys.shutdown().await;
}
