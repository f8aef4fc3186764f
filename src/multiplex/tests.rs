use std::sync::Mutex;

use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::oneshot,
};

use super::*;
use crate::{
    config::Config,
    engine::lock,
    error::Fault,
    transport::channel::ChannelConnection,
};

fn metadata(id: u32, pieces: usize) -> TransferPiece {
    let mut envelope = Envelope::message("take", Some(json!("payload"))).expect("subject");
    envelope.mark();
    TransferPiece {
        header: PieceHeader {
            id,
            pieces: Some(pieces),
            endpoints: vec![format!("/p{id}/ping")],
            subject: Some(format!("p{id}")),
            ..PieceHeader::default()
        },
        payload: Some(envelope),
    }
}

fn slot_piece(id: u32, slot: usize) -> TransferPiece {
    TransferPiece {
        header: PieceHeader {
            id,
            slot: Some(slot),
            ..PieceHeader::default()
        },
        payload: None,
    }
}

fn reader() -> Handle { Handle::Reader(Box::new(tokio::io::empty())) }

#[test]
fn pieces_complete_in_any_order() {
    let mut table = TransferTable::default();
    assert!(table.accept(slot_piece(7, 2), Some(reader())).is_none());
    assert!(table.accept(slot_piece(7, 0), Some(reader())).is_none());
    let done = table.accept(metadata(7, 3), None).expect("complete");
    assert_eq!(done.id, 7);
    assert_eq!(done.handles.keys().copied().collect::<Vec<_>>(), [0, 2]);
    assert_eq!(done.envelope.subject, "take");
    assert_eq!(done.subject.as_deref(), Some("p7"));
    assert_eq!(table.in_progress(), 0);
}

#[test]
fn interleaved_transfers_stay_separate() {
    let mut table = TransferTable::default();
    assert!(table.accept(metadata(1, 2), None).is_none());
    assert!(table.accept(metadata(2, 2), None).is_none());
    let second = table.accept(slot_piece(2, 1), Some(reader())).expect("second done");
    assert_eq!(second.id, 2);
    assert_eq!(table.in_progress(), 1);
    let first = table.accept(slot_piece(1, 0), Some(reader())).expect("first done");
    assert_eq!(first.id, 1);
}

#[test]
fn metadata_only_transfer_completes_at_once() {
    let mut table = TransferTable::default();
    let done = table.accept(metadata(3, 1), None).expect("complete");
    assert!(done.handles.is_empty());
}

#[test]
fn stale_partials_are_purged() {
    let mut table = TransferTable::default();
    assert!(table.accept(slot_piece(9, 0), Some(reader())).is_none());
    assert_eq!(table.purge_older_than(Duration::from_secs(60)), 0);
    assert_eq!(table.purge_older_than(Duration::ZERO), 1);
    assert_eq!(table.in_progress(), 0);
}

#[tokio::test]
async fn proxies_group_subjects_by_prefix() {
    let engine = Engine::new(Config::default());
    let subjects = [
        "/abc/kill",
        "/abc/pid/get",
        "/abc/pid/set",
        "/xyz/ping",
        "orphan",
    ]
    .map(String::from);
    let proxies = RemoteProxy::from_endpoints(&engine, &subjects);
    assert_eq!(proxies.keys().collect::<Vec<_>>(), ["abc", "xyz"]);
    let abc = &proxies["abc"];
    assert_eq!(abc.methods(), ["kill"]);
    assert_eq!(abc.properties(), ["pid"]);
    assert_eq!(proxies["xyz"].methods(), ["ping"]);
}

#[tokio::test]
async fn object_endpoints_are_registered_under_prefix() {
    let engine = Engine::new(Config::default());
    let subjects = engine
        .register_object_endpoints(
            "obj",
            vec![
                Operation::new("ping", EndpointOptions::new(), |_| async { Ok(json!("pong")) }),
                Operation::getter("size", |_| async { Ok(json!(3)) }),
            ],
            true,
        )
        .expect("register");
    assert_eq!(subjects, ["/obj/ping", "/obj/size/get"]);
    assert!(engine.endpoint("/obj/ping").is_some_and(|e| e.is_secret()));
    assert_eq!(engine.call_endpoint("/obj/size/get", ()).await.ok(), Some(json!(3)));
}

/// Two-slot composite backed by in-memory pipes.
struct Pipe {
    id: u32,
    input: DuplexStream,
    output: DuplexStream,
    events: broadcast::Sender<ResourceEvent>,
}

impl Composite for Pipe {
    fn transfer_id(&self) -> u32 { self.id }

    fn slots(&self) -> &'static [&'static str] { &["input", "output"] }

    fn into_parts(self: Box<Self>) -> CompositeParts {
        CompositeParts {
            handles: vec![
                Some(Handle::Writer(Box::new(self.input))),
                Some(Handle::Reader(Box::new(self.output))),
            ],
            operations: vec![Operation::new(
                "double",
                EndpointOptions::positional(1),
                |call| async move {
                    let n: i64 = call.arg_as(0)?;
                    Ok(json!(n * 2))
                },
            )],
            events: Some(self.events.subscribe()),
        }
    }
}

#[tokio::test]
async fn composite_arrives_with_handles_and_proxy() {
    let (left, right) =
        ChannelConnection::pair(Engine::new(Config::default()), Engine::new(Config::default()));
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    right
        .register_endpoint("take", EndpointOptions::new(), move |mut call| {
            let attachment = call.take_attachment();
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(attachment);
            }
            async { Ok::<_, Fault>(Value::Null) }
        })
        .expect("register");

    let (input, mut input_peer) = tokio::io::duplex(64);
    let (output, mut output_peer) = tokio::io::duplex(64);
    let (events, _) = broadcast::channel(4);
    let pipe = Pipe {
        id: 42,
        input,
        output,
        events: events.clone(),
    };
    left.send_composite("take", "payload", Box::new(pipe))
        .await
        .expect("transfer");

    let Some(Attachment::Remote(mut remote)) = rx.await.expect("delivered") else {
        panic!("expected a remote composite");
    };
    assert_eq!(remote.transfer_id(), 42);

    let mut writer = remote.take_writer(0).expect("input slot");
    writer.write_all(b"hi").await.expect("write");
    let mut buf = [0u8; 2];
    input_peer.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"hi");

    let mut reader = remote.take_reader(1).expect("output slot");
    output_peer.write_all(b"yo").await.expect("write");
    reader.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"yo");

    let proxy = remote.proxy().expect("proxy").clone();
    assert_eq!(proxy.methods(), ["double"]);
    assert_eq!(proxy.call("double", vec![json!(21)]).await.expect("call"), json!(42));
    assert!(proxy.call("missing", vec![]).await.is_err());

    let mut remote_events = proxy.subscribe();
    events
        .send(ResourceEvent::new("tick", vec![json!(1)]))
        .expect("subscriber");
    let event = tokio::time::timeout(Duration::from_secs(5), remote_events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event, ResourceEvent::new("tick", vec![json!(1)]));
}

#[tokio::test]
async fn composite_sends_run_on_spawned_tasks() {
    let (left, right) =
        ChannelConnection::pair(Engine::new(Config::default()), Engine::new(Config::default()));
    let (delivered_tx, mut delivered) = tokio::sync::mpsc::unbounded_channel();
    right.on("take", move |incoming| {
        let _ = delivered_tx.send(incoming.take_attachment().is_some());
    });
    let (input, _input_peer) = tokio::io::duplex(8);
    let (output, _output_peer) = tokio::io::duplex(8);
    let pipe = Pipe {
        id: 11,
        input,
        output,
        events: broadcast::channel(4).0,
    };
    let engine = left.engine().clone();
    let sending = tokio::spawn(async move { engine.send_composite("take", (), Box::new(pipe)).await });
    sending.await.expect("joined").expect("transfer");
    let attached = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("in time");
    assert_eq!(attached, Some(true));
}

#[tokio::test]
async fn dropping_the_remote_side_releases_transfer_state() {
    let (left, right) =
        ChannelConnection::pair(Engine::new(Config::default()), Engine::new(Config::default()));
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    right
        .register_endpoint("take", EndpointOptions::new(), move |mut call| {
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(call.take_attachment());
            }
            async { Ok::<_, Fault>(Value::Null) }
        })
        .expect("register");
    let (input, _input_peer) = tokio::io::duplex(8);
    let (output, _output_peer) = tokio::io::duplex(8);
    let pipe = Pipe {
        id: 5,
        input,
        output,
        events: broadcast::channel(4).0,
    };
    left.send_composite("take", (), Box::new(pipe))
        .await
        .expect("transfer");
    let Some(Attachment::Remote(remote)) = rx.await.expect("delivered") else {
        panic!("expected a remote composite");
    };

    let prefix = remote.proxy().expect("proxy").prefix().to_owned();
    let double = format!("/{prefix}/double");
    let release = format!("/{prefix}/{RELEASE_OP}");
    assert!(left.endpoint(&double).is_some());
    assert!(left.endpoint(&release).is_some_and(|e| e.is_secret()));
    assert_eq!(right.listener_count(), 1);
    assert_eq!(remote.proxy().expect("proxy").methods(), ["double"]);

    let extra = remote.proxy().expect("proxy").clone();
    drop(remote);
    assert_eq!(right.listener_count(), 1, "a proxy clone is still alive");
    drop(extra);
    assert_eq!(right.listener_count(), 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while left.endpoint(&double).is_some() || left.endpoint(&release).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sender endpoints released");
    assert!(!left.help_text().contains(&prefix));
}

#[tokio::test]
async fn byte_streams_cannot_carry_composites() {
    let (a, b) = tokio::io::duplex(1024);
    let left = crate::transport::stream::StreamConnection::spawn(
        Engine::new(Config::default()),
        a,
        None,
    );
    let _right = crate::transport::stream::StreamConnection::spawn(
        Engine::new(Config::default()),
        b,
        None,
    );
    let (input, _) = tokio::io::duplex(8);
    let (output, _) = tokio::io::duplex(8);
    let pipe = Pipe {
        id: 1,
        input,
        output,
        events: broadcast::channel(1).0,
    };
    let err = left
        .send_composite("take", (), Box::new(pipe))
        .await
        .expect_err("stream links reject handles");
    assert!(matches!(
        err,
        UnisocError::Transport(TransportError::AttachmentUnsupported)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn subprocess_reports_exit_and_honours_kill() {
    let mut command = tokio::process::Command::new("sleep");
    command.arg("30");
    let process = Subprocess::spawn(&mut command).expect("spawn sleep");
    assert!(process.id() > 0);
    assert!(!process.killed());
    let mut events = process.subscribe();
    assert!(process.kill().await);
    let status = process.wait().await.expect("exit status");
    assert!(status.killed);
    assert_eq!(status.code, None);
    let event = events.recv().await.expect("exit event");
    assert_eq!(event.name, "exit");
    assert!(!process.kill().await);
}
