#![cfg(unix)]
//! Handing a child process to a peer over a handle-carrying channel.

use std::{sync::Mutex, time::Duration};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::oneshot,
    time::timeout,
};
use unisoc::{
    Attachment,
    ChannelConnection,
    Config,
    EndpointOptions,
    Engine,
    RemoteComposite,
    Subprocess,
    multiplex::{STDIN, STDOUT},
};
use unisoc_testing::eventually;

const WAIT: Duration = Duration::from_secs(5);

async fn hand_over(mut command: Command) -> (ChannelConnection, ChannelConnection, RemoteComposite) {
    let (parent, child) =
        ChannelConnection::pair(Engine::new(Config::default()), Engine::new(Config::default()));
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    child
        .register_endpoint("adopt", EndpointOptions::new(), move |mut call| {
            if let Some(tx) = tx.lock().expect("lock").take() {
                let _ = tx.send(call.take_attachment());
            }
            async { Ok(Value::Null) }
        })
        .expect("register");

    let process = Subprocess::spawn(&mut command).expect("spawn");
    let pid = process.id();
    parent
        .send_composite("adopt", (), Box::new(process))
        .await
        .expect("transfer");
    let Some(Attachment::Remote(remote)) = timeout(WAIT, rx).await.expect("in time").expect("sent") else {
        panic!("expected a remote composite");
    };
    assert_eq!(remote.transfer_id(), pid);
    (parent, child, remote)
}

#[tokio::test]
async fn adopted_process_streams_and_exit_event() {
    let (_parent, _child, mut remote) = hand_over(Command::new("cat")).await;
    let proxy = remote.proxy().expect("proxy").clone();
    let mut events = proxy.subscribe();
    let mut methods = proxy.methods();
    methods.sort_unstable();
    assert_eq!(methods, ["exit_code", "id", "kill", "killed"]);

    let mut stdin = remote.take_writer(STDIN).expect("stdin");
    let mut stdout = remote.take_reader(STDOUT).expect("stdout");
    stdin.write_all(b"over the wire\n").await.expect("write");
    stdin.shutdown().await.expect("close stdin");
    drop(stdin);

    let mut echoed = String::new();
    timeout(WAIT, stdout.read_to_string(&mut echoed))
        .await
        .expect("in time")
        .expect("read");
    assert_eq!(echoed, "over the wire\n");

    let exit = timeout(WAIT, events.recv()).await.expect("in time").expect("event");
    assert_eq!(exit.name, "exit");
    assert_eq!(exit.args, [json!(0), json!(false)]);
    assert_eq!(proxy.call("exit_code", vec![]).await.expect("code"), json!(0));
}

#[tokio::test]
async fn adopted_process_can_be_killed_remotely() {
    let mut command = Command::new("sleep");
    command.arg("30");
    let (_parent, _child, remote) = hand_over(command).await;
    let proxy = remote.proxy().expect("proxy").clone();
    let mut events = proxy.subscribe();

    assert_eq!(proxy.call("kill", vec![]).await.expect("kill"), json!(true));
    let exit = timeout(WAIT, events.recv()).await.expect("in time").expect("event");
    assert_eq!(exit.args, [Value::Null, json!(true)]);
    assert_eq!(proxy.call("killed", vec![]).await.expect("killed"), json!(true));
    assert_eq!(proxy.call("kill", vec![]).await.expect("second kill"), json!(false));
}

#[tokio::test]
async fn releasing_the_proxy_withdraws_process_endpoints() {
    let (parent, child, remote) = hand_over(Command::new("true")).await;
    let proxy = remote.proxy().expect("proxy").clone();
    let kill = format!("/{}/kill", proxy.prefix());
    timeout(WAIT, async {
        while proxy.call("exit_code", vec![]).await.expect("exit_code") != json!(0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("child exited");
    assert!(parent.endpoint(&kill).is_some());
    assert_eq!(child.listener_count(), 1);

    drop(proxy);
    drop(remote);
    assert_eq!(child.listener_count(), 0);
    assert!(eventually(WAIT, || parent.endpoint(&kill).is_none()).await);
}
