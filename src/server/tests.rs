use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, channel::mpsc as frame_channel};
use rstest::{fixture, rstest};
use serde_json::json;
use tokio::time::timeout;

use super::*;
use crate::{
    envelope::Envelope,
    transport::{Killable, Transmittable, TransportError},
};

const WAIT: Duration = Duration::from_secs(5);

#[fixture]
fn server() -> Server { Server::new(Config::default()) }

fn connect(server: &Server) -> (ConnectionId, StreamConnection) {
    let (near, far) = tokio::io::duplex(4096);
    let id = server.accept_stream(far, None);
    let client = StreamConnection::spawn(Engine::new(Config::default()), near, None);
    (id, client)
}

async fn next_event(events: &mut events::Receiver<ServerEvent>) -> ServerEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

/// Link whose teardown never completes.
struct StuckLink;

#[async_trait]
impl Transmittable for StuckLink {
    fn is_connected(&self) -> bool { true }

    async fn transmit(&self, _envelope: Envelope) -> Result<(), TransportError> { Ok(()) }
}

#[async_trait]
impl Killable for StuckLink {
    async fn kill(&self) -> Result<(), TransportError> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[rstest]
#[tokio::test]
async fn first_and_last_fire_once(server: Server) {
    let mut events = server.events();
    let peers: Vec<_> = (0..3).map(|_| connect(&server)).collect();

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next_event(&mut events).await);
    }
    assert_eq!(seen.iter().filter(|e| **e == ServerEvent::First).count(), 1);
    assert_eq!(server.len(), 3);

    for (_, client) in &peers {
        client.kill().await;
    }
    let mut last = 0;
    let mut disconnected = 0;
    while disconnected < 3 || last == 0 {
        match next_event(&mut events).await {
            ServerEvent::Disconnected(_) => disconnected += 1,
            ServerEvent::Last => last += 1,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(last, 1);
    assert!(server.is_empty());
}

#[rstest]
#[tokio::test]
async fn broadcast_to_empty_group_sends_nothing(server: Server) {
    let (_id, client) = connect(&server);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    client.on_any(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let sent = server
        .broadcast(Broadcast::to_group("nobody").data(json!(1)))
        .await
        .expect("broadcast");
    assert_eq!(sent, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[rstest]
#[tokio::test]
async fn broadcast_reaches_group_members_except_excluded(server: Server) {
    let (a, client_a) = connect(&server);
    let (b, client_b) = connect(&server);
    let (_c, client_c) = connect(&server);

    assert_eq!(client_a.request("subscribe", "room").await.expect("join"), json!(true));
    assert_eq!(client_b.request("subscribe", "room").await.expect("join"), json!(true));
    assert_eq!(client_b.request("subscribe", "room").await.expect("rejoin"), json!(false));
    assert_eq!(server.group_members("room"), {
        let mut ids = vec![a, b];
        ids.sort_unstable();
        ids
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (name, client) in [("a", &client_a), ("b", &client_b), ("c", &client_c)] {
        let tx = tx.clone();
        client.on("room", move |incoming| {
            let _ = tx.send((name, incoming.data));
        });
    }

    let sent = server
        .broadcast(Broadcast::to_group("room").data(json!("hi")).exclude(a))
        .await
        .expect("broadcast");
    assert_eq!(sent, 1);
    let (who, data) = timeout(WAIT, rx.recv()).await.expect("delivered").expect("open");
    assert_eq!((who, data), ("b", Some(json!("hi"))));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[rstest]
#[tokio::test]
async fn leaving_last_member_removes_group(server: Server) {
    let (id, client) = connect(&server);
    client.request("subscribe", "solo").await.expect("join");
    assert_eq!(server.groups(), ["solo"]);
    assert_eq!(client.request("unsubscribe", "solo").await.expect("leave"), json!(true));
    assert!(server.groups().is_empty());
    assert!(!server.unsubscribe("solo", id));
}

#[rstest]
#[tokio::test]
async fn disconnect_removes_peer_from_groups(server: Server) {
    let mut events = server.events();
    let (id, client) = connect(&server);
    assert!(server.subscribe("g", id));
    client.kill().await;
    loop {
        if next_event(&mut events).await == ServerEvent::Disconnected(id) {
            break;
        }
    }
    assert!(server.group_members("g").is_empty());
    assert!(server.client(id).is_none());
}

#[rstest]
#[tokio::test]
async fn peers_call_server_endpoints(server: Server) {
    server
        .engine()
        .register_endpoint("time", EndpointOptions::new(), |_| async { Ok(json!(42)) })
        .expect("register");
    let (_id, client) = connect(&server);
    assert_eq!(client.request("time", ()).await.expect("call"), json!(42));
    let help = client.remote_endpoints().await.expect("help");
    assert!(help.contains("subscribe(group) Join a group"), "{help}");
    assert!(help.contains("time()"), "{help}");
}

#[rstest]
#[tokio::test]
async fn shutdown_notifies_and_drains_peers(server: Server) {
    let (_id, client) = connect(&server);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    client.on(SHUTDOWN_SUBJECT, move |_| {
        if let Some(tx) = lock(&tx).take() {
            let _ = tx.send(());
        }
    });
    let report = server.shutdown_with_timeout(WAIT).await;
    assert!(report.is_clean());
    timeout(WAIT, rx).await.expect("notice in time").expect("notice");
    timeout(WAIT, client.wait_disconnected()).await.expect("client closed");
}

#[rstest]
#[tokio::test]
async fn shutdown_with_stuck_peer_still_resolves(server: Server) {
    let (_ok, _client) = connect(&server);
    let (stuck, engine) = server.attach(Arc::new(StuckLink));
    let report = timeout(WAIT, server.shutdown_with_timeout(Duration::from_millis(50)))
        .await
        .expect("shutdown resolves");
    assert_eq!(report.undrained, [stuck]);
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert!(matches!(
        server.listen(ListenTarget::Port(0)).await,
        Err(ServerError::ShuttingDown)
    ));
}

#[rstest]
#[tokio::test]
async fn listening_twice_on_one_address_is_idempotent(server: Server) {
    let mut events = server.events();
    let first = server
        .listen(ListenTarget::Addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
        .await
        .expect("bind");
    let Listening::Tcp(addr) = first.clone() else {
        panic!("expected a TCP listener");
    };
    let again = server.listen(ListenTarget::Addr(addr)).await.expect("same listener");
    assert_eq!(first, again);
    assert_eq!(server.listening(), [first.clone()]);
    assert_eq!(next_event(&mut events).await, ServerEvent::Listening(first.clone()));

    assert!(server.unlisten(&first));
    assert_eq!(next_event(&mut events).await, ServerEvent::Unlistening(first));
    assert!(server.listening().is_empty());
}

#[rstest]
#[tokio::test]
async fn tcp_peers_are_served(server: Server) {
    server
        .engine()
        .register_endpoint("echo", EndpointOptions::positional(1), |call| async move {
            Ok(call.arg(0).cloned().unwrap_or(Value::Null))
        })
        .expect("register");
    let Listening::Tcp(addr) = server
        .listen(ListenTarget::Addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
        .await
        .expect("bind")
    else {
        panic!("expected a TCP listener");
    };
    let client = StreamConnection::connect_tcp(Engine::new(Config::default()), addr)
        .await
        .expect("connect");
    assert_eq!(client.request("echo", json!(["x"])).await.expect("echo"), json!("x"));
    assert_eq!(server.len(), 1);
    let report = server.shutdown_with_timeout(WAIT).await;
    assert!(report.is_clean());
}

#[rstest]
#[tokio::test]
async fn broadcast_collects_per_peer_failures(server: Server) {
    let (good, _client) = connect(&server);
    let (bad, engine) = server.attach(Arc::new(StuckLink));
    engine.detach_link();
    let err = server
        .broadcast(Broadcast::new("news").data(json!(1)))
        .await
        .expect_err("one peer fails");
    let ServerError::Broadcast {
        attempted,
        failures,
    } = err
    else {
        panic!("expected a broadcast failure");
    };
    assert_eq!(attempted, 2);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, bad);
    assert_ne!(failures[0].0, good);
}

#[rstest]
#[tokio::test]
async fn frame_acceptor_admits_offered_peers(server: Server) {
    server
        .engine()
        .register_endpoint("ping", EndpointOptions::new(), |_| async { Ok(json!("pong")) })
        .expect("register");
    let (offer, acceptor) = mpsc::channel(4);
    let listening = server
        .listen(ListenTarget::Frames {
            name: "ws".into(),
            acceptor,
        })
        .await
        .expect("attach acceptor");
    assert_eq!(listening, Listening::Frames("ws".into()));

    let (to_server, server_rx) = frame_channel::unbounded::<String>();
    let (to_client, client_rx) = frame_channel::unbounded::<String>();
    let broken = |e| io::Error::new(io::ErrorKind::BrokenPipe, e);
    let peer = FramePeer::new(to_client.sink_map_err(broken), server_rx.map(Ok), Some("ws-client".into()));
    assert!(offer.send(peer).await.is_ok());
    let client = FrameConnection::spawn(
        Engine::new(Config::default()),
        to_server.sink_map_err(broken),
        client_rx.map(Ok),
        None,
    );
    assert_eq!(client.request("ping", ()).await.expect("ping"), json!("pong"));
    assert_eq!(server.len(), 1);
}
