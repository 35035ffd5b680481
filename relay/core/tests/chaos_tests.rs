//! Chaos tests for subscription failure and misbehaving sessions
//!
//! A scripted broker feeds the relay through the same subscription pump the
//! Redis broker uses, so transport disconnects can be injected mid-stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use relay_core::{
    spawn_subscription, Broker, BrokerError, CloseReason, InProcessStream, QueueMessage, Relay,
    RelayError, Subscription, TransportError, TunnelRequest, TunnelResponse, TunnelStream,
};

type TransportEvent = Result<Vec<u8>, BrokerError>;

/// Broker whose transport events are pushed by the test
struct ScriptedBroker {
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl ScriptedBroker {
    fn new() -> (Self, mpsc::Sender<TransportEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                events: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn broadcast(&self, _message: QueueMessage) -> Result<(), BrokerError> {
        Err(BrokerError::Transport("scripted broker is receive-only".into()))
    }

    async fn listen(&self) -> Result<Subscription, BrokerError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Connect("already subscribed".into()))?;
        let (subscription, _pump) = spawn_subscription(ReceiverStream::new(events), 4);
        Ok(subscription)
    }
}

/// Broker that cannot be reached at all
struct UnreachableBroker;

#[async_trait]
impl Broker for UnreachableBroker {
    async fn broadcast(&self, _message: QueueMessage) -> Result<(), BrokerError> {
        Err(BrokerError::Transport("unreachable".into()))
    }

    async fn listen(&self) -> Result<Subscription, BrokerError> {
        Err(BrokerError::Connect("connection refused".into()))
    }
}

/// Stream that accepts a fixed number of sends, then fails every one
struct FlakyStream {
    inner: InProcessStream,
    remaining: Mutex<usize>,
}

#[async_trait]
impl TunnelStream for FlakyStream {
    async fn send(&self, response: &TunnelResponse) -> Result<(), TransportError> {
        {
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return Err(TransportError::SendFailed("write timed out".into()));
            }
            *remaining -= 1;
        }
        self.inner.send(response).await
    }

    async fn closed(&self) -> CloseReason {
        self.inner.closed().await
    }
}

fn encoded(body: &[u8]) -> Vec<u8> {
    QueueMessage::new(body.to_vec()).encode().unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn open_tunnel(relay: &Relay) -> mpsc::Receiver<TunnelResponse> {
    let (stream, client) = InProcessStream::new_pair(16);
    let relay = relay.clone();
    tokio::spawn(async move { relay.tunnel(TunnelRequest::default(), Arc::new(stream)).await });
    client
}

#[tokio::test]
async fn chaos_transport_disconnect_mid_stream() {
    let (broker, events) = ScriptedBroker::new();
    let (relay, dispatcher) = Relay::start(&broker).await.unwrap();

    let mut client = open_tunnel(&relay);
    wait_until(|| relay.sessions().count() == 1).await;

    events.send(Ok(encoded(b"one"))).await.unwrap();
    assert_eq!(client.recv().await.unwrap().body(), b"one");

    events
        .send(Err(BrokerError::Transport("connection reset by peer".into())))
        .await
        .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(2), dispatcher.wait())
        .await
        .expect("dispatch task should exit once the subscription closes")
        .unwrap();
    assert_eq!(summary.messages_dispatched, 1);

    // Nothing published after the disconnect reaches the client
    let _ = events.send(Ok(encoded(b"lost"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.try_recv().is_err());

    // Existing tunnels are left to close on their own
    assert_eq!(relay.sessions().count(), 1);
}

#[tokio::test]
async fn chaos_transport_stream_ends() {
    let (broker, events) = ScriptedBroker::new();
    let (_relay, dispatcher) = Relay::start(&broker).await.unwrap();

    events.send(Ok(encoded(b"only"))).await.unwrap();
    drop(events);

    let summary = tokio::time::timeout(Duration::from_secs(2), dispatcher.wait())
        .await
        .expect("dispatch task should exit when the transport ends")
        .unwrap();
    assert_eq!(summary.messages_dispatched, 1);
    assert_eq!(summary.failed_deliveries, 0);
}

#[tokio::test]
async fn chaos_undecodable_messages_are_skipped() {
    let (broker, events) = ScriptedBroker::new();
    let (relay, dispatcher) = Relay::start(&broker).await.unwrap();

    let mut client = open_tunnel(&relay);
    wait_until(|| relay.sessions().count() == 1).await;

    events.send(Ok(b"{not json".to_vec())).await.unwrap();
    events.send(Ok(br#"{"intent":"x"}"#.to_vec())).await.unwrap();
    events.send(Ok(encoded(b"good"))).await.unwrap();

    assert_eq!(client.recv().await.unwrap().body(), b"good");
    assert!(!dispatcher.is_finished());
}

#[tokio::test]
async fn chaos_unreachable_broker_prevents_start() {
    let result = Relay::start(&UnreachableBroker).await;
    assert!(matches!(
        result,
        Err(RelayError::Subscribe(BrokerError::Connect(_)))
    ));
}

#[tokio::test]
async fn chaos_failing_session_does_not_stall_others() {
    let (broker, events) = ScriptedBroker::new();
    let (relay, dispatcher) = Relay::start(&broker).await.unwrap();

    let (flaky_inner, mut flaky_client) = InProcessStream::new_pair(16);
    let flaky = FlakyStream {
        inner: flaky_inner,
        remaining: Mutex::new(1),
    };
    {
        let relay = relay.clone();
        tokio::spawn(async move { relay.tunnel(TunnelRequest::default(), Arc::new(flaky)).await });
    }
    let mut healthy = open_tunnel(&relay);
    wait_until(|| relay.sessions().count() == 2).await;

    for body in [b"m1", b"m2", b"m3"] {
        events.send(Ok(encoded(body))).await.unwrap();
    }

    assert_eq!(healthy.recv().await.unwrap().body(), b"m1");
    assert_eq!(healthy.recv().await.unwrap().body(), b"m2");
    assert_eq!(healthy.recv().await.unwrap().body(), b"m3");

    assert_eq!(flaky_client.recv().await.unwrap().body(), b"m1");
    assert!(flaky_client.try_recv().is_err());

    // Failing session stays registered until its own stream closes
    assert_eq!(relay.sessions().count(), 2);

    drop(events);
    let summary = dispatcher.wait().await.unwrap();
    assert_eq!(summary.messages_dispatched, 3);
    assert_eq!(summary.failed_deliveries, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_churn_during_fanout() {
    let (broker, events) = ScriptedBroker::new();
    let (relay, dispatcher) = Relay::start(&broker).await.unwrap();

    let mut steady = open_tunnel(&relay);
    wait_until(|| relay.sessions().count() == 1).await;

    // Clients connect and vanish while messages flow
    let churn = {
        let relay = relay.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let client = open_tunnel(&relay);
                tokio::task::yield_now().await;
                drop(client);
            }
        })
    };

    for i in 0..20u8 {
        events.send(Ok(encoded(&[i]))).await.unwrap();
    }

    for i in 0..20u8 {
        assert_eq!(steady.recv().await.unwrap().body(), &[i]);
    }

    churn.await.unwrap();
    wait_until(|| relay.sessions().count() == 1).await;

    drop(events);
    assert_eq!(dispatcher.wait().await.unwrap().messages_dispatched, 20);
}
