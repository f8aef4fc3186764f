//! Fan-out server behaviour over real TCP connections.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tokio::time::timeout;
use unisoc::{
    Broadcast,
    Config,
    EndpointOptions,
    Engine,
    Flow,
    ListenTarget,
    Listening,
    Server,
    ServerEvent,
    StreamConnection,
};
use unisoc_testing::eventually;

const WAIT: Duration = Duration::from_secs(5);

#[fixture]
fn server() -> Server { Server::builder().name("test-server").build() }

async fn listen(server: &Server) -> SocketAddr {
    let listening = server
        .listen(ListenTarget::Addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
        .await
        .expect("bind");
    let Listening::Tcp(addr) = listening else {
        panic!("expected a TCP listener, got {listening:?}");
    };
    addr
}

async fn client(addr: SocketAddr, name: &'static str) -> StreamConnection {
    let conn = StreamConnection::connect_tcp(Engine::builder().name(name).build(), addr)
        .await
        .expect("connect");
    conn.register_endpoint("whoami", EndpointOptions::new(), move |_| async move {
        Ok(json!(name))
    })
    .expect("register whoami");
    conn
}

#[rstest]
#[tokio::test]
async fn broadcast_requests_collect_every_response(server: Server) {
    let addr = listen(&server).await;
    let _a = client(addr, "a").await;
    let _b = client(addr, "b").await;
    let _c = client(addr, "c").await;
    assert!(eventually(WAIT, || server.len() == 3).await);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sent = server
        .broadcast(Broadcast::new("whoami").on_response(move |response| {
            if let Ok(Value::String(name)) = response.result {
                sink.lock().expect("lock").push(name);
            }
            Flow::Cancel
        }))
        .await
        .expect("broadcast");
    assert_eq!(sent, 3);
    assert!(eventually(WAIT, || seen.lock().expect("lock").len() == 3).await);
    let mut names = seen.lock().expect("lock").clone();
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);
}

#[rstest]
#[tokio::test]
async fn group_broadcast_reaches_subscribers_only(server: Server) {
    let addr = listen(&server).await;
    let a = client(addr, "a").await;
    let b = client(addr, "b").await;
    assert!(eventually(WAIT, || server.len() == 2).await);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for (name, conn) in [("a", &a), ("b", &b)] {
        let tx = tx.clone();
        conn.on("lobby", move |incoming| {
            let _ = tx.send((name, incoming.data));
        });
    }
    assert_eq!(a.request("subscribe", "lobby").await.expect("join"), json!(true));

    let sent = server
        .broadcast(Broadcast::to_group("lobby").data(json!({"motd": "hi"})))
        .await
        .expect("broadcast");
    assert_eq!(sent, 1);
    let delivered = timeout(WAIT, rx.recv()).await.expect("in time").expect("open");
    assert_eq!(delivered, ("a", Some(json!({"motd": "hi"}))));

    assert_eq!(a.request("unsubscribe", "lobby").await.expect("leave"), json!(true));
    assert!(server.groups().is_empty());
}

#[rstest]
#[tokio::test]
async fn peers_share_server_endpoints_and_hooks(server: Server) {
    server
        .engine()
        .register_endpoint("peer_name", EndpointOptions::new().with_engine(), |call| async move {
            Ok(json!(call.engine().map(Engine::name)))
        })
        .expect("register");
    server
        .engine()
        .register_endpoint("fail", EndpointOptions::new(), |_| async {
            Err(unisoc::Fault::Value(json!({"code": "EDENIED", "why": "secret"})))
        })
        .expect("register fail");
    server
        .engine()
        .hooks()
        .set_error_policy(Some(unisoc::ErrorPolicy::Code));

    let addr = listen(&server).await;
    let conn = client(addr, "solo").await;
    let name = conn.request("peer_name", ()).await.expect("call");
    assert!(name.as_str().is_some_and(|n| n.starts_with("peer_")), "{name}");

    let err = conn.request("fail", ()).await.expect_err("fails");
    assert_eq!(err.as_remote().expect("remote").value(), &json!("EDENIED"));
}

#[rstest]
#[tokio::test]
async fn shutdown_closes_listeners_and_peers(server: Server) {
    let mut events = server.events();
    let addr = listen(&server).await;
    let conn = client(addr, "a").await;
    assert!(eventually(WAIT, || server.len() == 1).await);

    let report = server.shutdown_with_timeout(WAIT).await;
    assert!(report.is_clean());
    timeout(WAIT, conn.wait_disconnected()).await.expect("client closed");
    assert!(server.listening().is_empty());
    assert!(StreamConnection::connect_tcp(Engine::new(Config::default()), addr).await.is_err());

    let mut saw_last = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        saw_last |= event == ServerEvent::Last;
    }
    assert!(saw_last);
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn unix_socket_listener_serves_peers(server: Server) {
    let path = std::env::temp_dir().join(format!("unisoc-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    server
        .engine()
        .register_endpoint("ping", EndpointOptions::new(), |_| async { Ok(json!("pong")) })
        .expect("register");
    let listening = server
        .listen(ListenTarget::Path(path.clone()))
        .await
        .expect("bind unix socket");
    assert_eq!(listening, Listening::Unix(path.clone()));

    let conn = StreamConnection::connect_unix(Engine::new(Config::default()), &path)
        .await
        .expect("connect");
    assert_eq!(conn.request("ping", ()).await.expect("ping"), json!("pong"));
    server.shutdown_with_timeout(WAIT).await;
    let _ = std::fs::remove_file(&path);
}
