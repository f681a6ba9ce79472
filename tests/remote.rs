use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use strata::actors::*;
use strata::remote::{
    FileMessageStore, InboundHandler, MessageStatus, MessageStore, RemoteEnvelope, Transport,
    TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

/// In-process wire connecting loopback transports by address.
#[derive(Default)]
struct LoopbackNet {
    peers: Mutex<HashMap<String, InboundHandler>>,
}

struct LoopbackTransport {
    address: String,
    net: Arc<LoopbackNet>,
    handler: RwLock<Option<InboundHandler>>,
}

impl LoopbackTransport {
    fn new(address: &str, net: Arc<LoopbackNet>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            address: address.to_string(),
            net,
            handler: RwLock::new(None),
        })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let handler = self
            .handler
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::new("no message handler installed"))?;
        self.net
            .peers
            .lock()
            .unwrap()
            .insert(self.address.clone(), handler);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.net.peers.lock().unwrap().remove(&self.address);
        Ok(())
    }

    async fn send(&self, address: &str, envelope: RemoteEnvelope) -> Result<(), TransportError> {
        // The envelope crosses the boundary as UTF-8 JSON, like a real wire.
        let bytes = envelope.to_bytes()?;
        let peer = self
            .net
            .peers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::new(format!("unreachable address {}", address)))?;
        peer(RemoteEnvelope::from_bytes(&bytes)?);
        Ok(())
    }

    async fn dial(&self, address: &str) -> Result<(), TransportError> {
        if self.net.peers.lock().unwrap().contains_key(address) {
            Ok(())
        } else {
            Err(TransportError::new(format!("unknown address {}", address)))
        }
    }

    fn set_message_handler(&self, handler: InboundHandler) {
        *self.handler.write().unwrap() = Some(handler);
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }

    fn listen_addresses(&self) -> Vec<String> {
        vec![self.address.clone()]
    }
}

struct Echo;

fn echo<'a>(_actor: &'a mut Echo, ctx: &'a Context, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        if msg.response_id.is_some() {
            ctx.respond(&msg, Ok(json!(format!("echo:{}", msg.payload.as_str().unwrap_or("")))))
                .await
                .map_err(|e| ActorError::new(e.to_string()))?;
        }
        Ok(())
    })
}

impl Actor for Echo {
    fn behaviors() -> Behaviors<Self> {
        Behaviors::new().with(DEFAULT_BEHAVIOR, echo)
    }
}

struct Recorder {
    probe: mpsc::UnboundedSender<String>,
}

fn record<'a>(actor: &'a mut Recorder, _ctx: &'a Context, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = actor
            .probe
            .send(msg.payload.as_str().unwrap_or("?").to_string());
        Ok(())
    })
}

impl Actor for Recorder {
    fn behaviors() -> Behaviors<Self> {
        Behaviors::new().with(DEFAULT_BEHAVIOR, record)
    }
}

async fn two_nodes() -> (ActorSystem, ActorSystem, Arc<LoopbackNet>) {
    let net = Arc::new(LoopbackNet::default());

    let sys_a = ActorSystem::with_name("node-a-sys").unwrap();
    let transport_a = LoopbackTransport::new("node-a", net.clone());
    sys_a.register_transport(transport_a.clone());
    transport_a.start().await.unwrap();

    let sys_b = ActorSystem::with_name("node-b-sys").unwrap();
    let transport_b = LoopbackTransport::new("node-b", net.clone());
    sys_b.register_transport(transport_b.clone());
    transport_b.start().await.unwrap();

    (sys_a, sys_b, net)
}

#[tokio::test]
async fn send_crosses_the_transport_boundary() {
    let (sys_a, sys_b, _net) = two_nodes().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = sys_b
        .spawn(Props::new(move || Recorder { probe: tx.clone() }))
        .unwrap();

    let remote_pid = Pid::remote(recorder.id.clone(), "node-b");
    sys_a
        .send(&remote_pid, Message::new("note", json!("over the wire")))
        .await
        .unwrap();

    let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "over the wire");
    sys_a.shutdown().await;
    sys_b.shutdown().await;
}

#[tokio::test]
async fn request_resolves_across_nodes() {
    let (sys_a, sys_b, _net) = two_nodes().await;
    let echo_pid = sys_b.spawn(Props::new(|| Echo)).unwrap();

    let remote_pid = Pid::remote(echo_pid.id.clone(), "node-b");
    let reply = sys_a
        .request(
            &remote_pid,
            Message::new("ask", json!("hello")),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, json!("echo:hello"));
    sys_a.shutdown().await;
    sys_b.shutdown().await;
}

#[tokio::test]
async fn send_to_an_unreachable_address_fails() {
    let (sys_a, sys_b, _net) = two_nodes().await;
    let ghost = Pid::remote("nobody", "node-z");
    let result = sys_a.send(&ghost, Message::new("note", json!(null))).await;
    assert!(matches!(result, Err(SendError::Transport(_))));
    sys_a.shutdown().await;
    sys_b.shutdown().await;
}

#[tokio::test]
async fn send_without_a_transport_is_rejected() {
    let sys = ActorSystem::with_name("no-transport").unwrap();
    let remote = Pid::remote("someone", "node-q");
    let result = sys.send(&remote, Message::new("note", json!(null))).await;
    assert!(matches!(result, Err(SendError::NoTransport(_))));
    sys.shutdown().await;
}

#[tokio::test]
async fn store_backed_send_reaches_acknowledged() {
    let (sys_a, sys_b, _net) = two_nodes().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path()));
    sys_a.register_store(store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = sys_b
        .spawn(Props::new(move || Recorder { probe: tx.clone() }))
        .unwrap();
    let remote_pid = Pid::remote(recorder.id.clone(), "node-b");

    // The sender pid carries node-a so the receiver can ack back.
    let msg = Message::new("note", json!("durable"))
        .with_sender(Pid::remote("ask-origin", "node-a"));
    sys_a.send(&remote_pid, msg).await.unwrap();

    let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "durable");

    // Delivery then acknowledgement land in the store.
    timeout(WAIT, async {
        loop {
            let backlog = store.get_unacknowledged(&remote_pid).await.unwrap();
            if backlog.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    sys_a.shutdown().await;
    sys_b.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_backlog_can_be_redelivered() {
    let (sys_a, sys_b, net) = two_nodes().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path()));
    sys_a.register_store(store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = sys_b
        .spawn(Props::new(move || Recorder { probe: tx.clone() }))
        .unwrap();
    let remote_pid = Pid::remote(recorder.id.clone(), "node-b");

    // Partition node-b, then attempt a store-backed send.
    net.peers.lock().unwrap().remove("node-b");
    let msg = Message::new("note", json!("deferred"))
        .with_sender(Pid::remote("ask-origin", "node-a"));
    assert!(sys_a.send(&remote_pid, msg).await.is_err());

    let backlog = store.get_unacknowledged(&remote_pid).await.unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(
        store.message_status(&backlog[0].id).await.unwrap(),
        Some(MessageStatus::Pending)
    );

    // Heal the partition and replay.
    let transport_b = LoopbackTransport::new("node-b", net.clone());
    sys_b.register_transport(transport_b.clone());
    transport_b.start().await.unwrap();

    let resent = sys_a.redeliver_unacknowledged(&remote_pid).await.unwrap();
    assert_eq!(resent, 1);
    let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "deferred");

    sys_a.shutdown().await;
    sys_b.shutdown().await;
}
