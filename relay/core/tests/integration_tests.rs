//! Integration tests for broker → relay → tunnel delivery
//!
//! These tests drive the public API the way a relay process does:
//! - Fanout reaches every registered session exactly once
//! - Sessions only see messages dispatched while they are registered
//! - In-memory broker blocking semantics
//! - TCP tunnels end to end

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_test::{assert_pending, assert_ready_ok};

use relay_core::{
    Broker, CloseReason, InMemoryBroker, InProcessStream, QueueMessage, Relay, TcpTunnelStream,
    TunnelClient, TunnelRequest, TunnelResponse,
};

const INTENT: &[u8] = br#"{"intent":"x"}"#;

/// Poll until `cond` holds, failing the test after two seconds
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Open an in-process tunnel on `relay`, returning the client end
fn open_tunnel(relay: &Relay, label: &str) -> mpsc::Receiver<TunnelResponse> {
    let (stream, client) = InProcessStream::new_pair(16);
    let relay = relay.clone();
    let request = TunnelRequest {
        client: Some(label.to_string()),
    };
    tokio::spawn(async move { relay.tunnel(request, Arc::new(stream)).await });
    client
}

// =============================================================================
// Fanout
// =============================================================================

#[tokio::test]
async fn test_every_session_receives_exactly_one_copy() {
    let broker = InMemoryBroker::new();
    let (relay, _dispatcher) = Relay::start(&broker).await.unwrap();

    let mut a = open_tunnel(&relay, "a");
    let mut b = open_tunnel(&relay, "b");
    let mut c = open_tunnel(&relay, "c");
    wait_until(|| relay.sessions().count() == 3).await;

    broker.broadcast(QueueMessage::new(INTENT.to_vec())).await.unwrap();
    broker.broadcast(QueueMessage::new(b"sentinel".to_vec())).await.unwrap();

    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(client.recv().await.unwrap().body(), INTENT);
        // The next frame is the sentinel, so the intent arrived only once
        assert_eq!(client.recv().await.unwrap().body(), b"sentinel");
    }
}

#[tokio::test]
async fn test_removed_session_misses_later_messages() {
    let relay = Relay::new();

    let mut a = open_tunnel(&relay, "a");
    wait_until(|| relay.sessions().count() == 1).await;
    let a_id = relay.sessions().ids()[0];

    let mut witness = open_tunnel(&relay, "witness");
    wait_until(|| relay.sessions().count() == 2).await;

    let first = relay.fanout(&QueueMessage::new(b"message 1".to_vec())).await;
    assert_eq!(first.delivered, 2);

    relay.sessions().remove(&a_id).unwrap();

    let second = relay.fanout(&QueueMessage::new(b"message 2".to_vec())).await;
    assert_eq!(second.delivered, 1);

    assert_eq!(a.recv().await.unwrap().body(), b"message 1");
    assert!(a.try_recv().is_err());

    assert_eq!(witness.recv().await.unwrap().body(), b"message 1");
    assert_eq!(witness.recv().await.unwrap().body(), b"message 2");
}

#[tokio::test]
async fn test_late_session_gets_no_replay() {
    let broker = InMemoryBroker::new();
    let (relay, _dispatcher) = Relay::start(&broker).await.unwrap();

    let mut early = open_tunnel(&relay, "early");
    wait_until(|| relay.sessions().count() == 1).await;

    broker.broadcast(QueueMessage::new(b"before".to_vec())).await.unwrap();
    assert_eq!(early.recv().await.unwrap().body(), b"before");

    let mut late = open_tunnel(&relay, "late");
    wait_until(|| relay.sessions().count() == 2).await;

    broker.broadcast(QueueMessage::new(b"after".to_vec())).await.unwrap();

    assert_eq!(late.recv().await.unwrap().body(), b"after");
    assert_eq!(early.recv().await.unwrap().body(), b"after");
}

#[tokio::test]
async fn test_per_session_order_follows_dispatch_order() {
    let broker = InMemoryBroker::new();
    let (relay, _dispatcher) = Relay::start(&broker).await.unwrap();

    let mut client = open_tunnel(&relay, "ordered");
    wait_until(|| relay.sessions().count() == 1).await;

    let producer = tokio::spawn(async move {
        for i in 0..10u8 {
            broker.broadcast(QueueMessage::new(vec![i])).await.unwrap();
        }
        broker
    });

    for i in 0..10u8 {
        assert_eq!(client.recv().await.unwrap().body(), &[i]);
    }
    producer.await.unwrap();
}

#[tokio::test]
async fn test_disconnected_client_is_dropped_from_fanout() {
    let broker = InMemoryBroker::new();
    let (relay, _dispatcher) = Relay::start(&broker).await.unwrap();

    let gone = open_tunnel(&relay, "gone");
    let mut stays = open_tunnel(&relay, "stays");
    wait_until(|| relay.sessions().count() == 2).await;

    drop(gone);
    wait_until(|| relay.sessions().count() == 1).await;

    broker.broadcast(QueueMessage::new(INTENT.to_vec())).await.unwrap();
    assert_eq!(stays.recv().await.unwrap().body(), INTENT);
}

#[tokio::test]
async fn test_stalled_client_does_not_starve_the_process() {
    let broker = InMemoryBroker::with_capacity(16);
    let (relay, dispatcher) = Relay::new()
        .with_send_timeout(Duration::from_millis(50))
        .attach(&broker)
        .await
        .unwrap();

    // One-slot client that never reads
    let (stalled, _stalled_client) = InProcessStream::new_pair(1);
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .tunnel(TunnelRequest::default(), Arc::new(stalled))
                .await
        });
    }
    let mut healthy = open_tunnel(&relay, "healthy");
    wait_until(|| relay.sessions().count() == 2).await;

    for i in 0..5u8 {
        broker.broadcast(QueueMessage::new(vec![i])).await.unwrap();
    }

    for i in 0..5u8 {
        let response = tokio::time::timeout(Duration::from_secs(2), healthy.recv())
            .await
            .expect("healthy session starved by a stalled one")
            .unwrap();
        assert_eq!(response.body(), &[i]);
    }

    // The stalled session is kept; only its own close removes it
    assert_eq!(relay.sessions().count(), 2);

    drop(broker);
    let summary = dispatcher.wait().await.unwrap();
    assert_eq!(summary.messages_dispatched, 5);
    assert_eq!(summary.failed_deliveries, 4);
}

// =============================================================================
// In-memory broker semantics
// =============================================================================

#[tokio::test]
async fn test_in_memory_broadcast_waits_for_a_free_slot() {
    let broker = InMemoryBroker::new();

    // First message parks in the single slot
    broker.broadcast(QueueMessage::new(b"1".to_vec())).await.unwrap();

    let mut blocked = tokio_test::task::spawn(broker.broadcast(QueueMessage::new(b"2".to_vec())));
    assert_pending!(blocked.poll());

    let mut rx = broker.listen().await.unwrap();
    assert_eq!(rx.recv().await.unwrap().body(), b"1");

    assert!(blocked.is_woken());
    assert_ready_ok!(blocked.poll());
    assert_eq!(rx.recv().await.unwrap().body(), b"2");
}

#[tokio::test]
async fn test_in_memory_message_waits_for_late_listener() {
    let broker = Arc::new(InMemoryBroker::new());

    let producer = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.broadcast(QueueMessage::new(INTENT.to_vec())).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut rx = broker.listen().await.unwrap();

    assert_eq!(rx.recv().await.unwrap().body(), INTENT);
    producer.await.unwrap().unwrap();
}

// =============================================================================
// TCP tunnels
// =============================================================================

#[tokio::test]
async fn test_tcp_tunnels_end_to_end() {
    let broker = InMemoryBroker::new();
    let (relay, _dispatcher) = Relay::start(&broker).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (reasons_tx, mut reasons) = mpsc::unbounded_channel();
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let relay = relay.clone();
                let shutdown = shutdown_rx.clone();
                let reasons_tx = reasons_tx.clone();
                tokio::spawn(async move {
                    let (request, stream) = TcpTunnelStream::accept(tcp, shutdown).await.unwrap();
                    let reason = relay.tunnel(request, Arc::new(stream)).await;
                    let _ = reasons_tx.send(reason);
                });
            }
        });
    }

    let kiosk_request = TunnelRequest {
        client: Some("kiosk".into()),
    };
    let mut kiosk = TunnelClient::connect(addr, &kiosk_request).await.unwrap();
    let mut phone = TunnelClient::connect(addr, &TunnelRequest::default())
        .await
        .unwrap();
    wait_until(|| relay.sessions().count() == 2).await;

    broker.broadcast(QueueMessage::new(INTENT.to_vec())).await.unwrap();

    assert_eq!(kiosk.recv().await.unwrap().body(), INTENT);
    assert_eq!(phone.recv().await.unwrap().body(), INTENT);

    drop(phone);
    wait_until(|| relay.sessions().count() == 1).await;
    assert!(matches!(
        reasons.recv().await.unwrap(),
        CloseReason::Disconnected
    ));

    broker.broadcast(QueueMessage::new(b"still here".to_vec())).await.unwrap();
    assert_eq!(kiosk.recv().await.unwrap().body(), b"still here");
}

#[tokio::test]
async fn test_tcp_shutdown_cancels_tunnels() {
    let relay = Relay::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = {
        let relay = relay.clone();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (request, stream) = TcpTunnelStream::accept(tcp, shutdown_rx).await.unwrap();
            relay.tunnel(request, Arc::new(stream)).await
        })
    };

    let _client = TunnelClient::connect(addr, &TunnelRequest::default())
        .await
        .unwrap();
    wait_until(|| relay.sessions().count() == 1).await;

    shutdown_tx.send(true).unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("tunnel should end on shutdown")
        .unwrap();
    assert!(matches!(reason, CloseReason::Cancelled));
    assert_eq!(relay.sessions().count(), 0);
}
