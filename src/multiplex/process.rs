//! A child process exposed as a transferable composite.

use std::{
    io,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{broadcast, mpsc, oneshot, watch},
};

use super::{Composite, CompositeParts, Operation};
use crate::{
    engine::{EndpointOptions, ResourceEvent},
    envelope::Handle,
};

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;
pub const STDERR: usize = 2;

const SLOTS: [&str; 3] = ["stdin", "stdout", "stderr"];
const EVENT_BUFFER: usize = 16;

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Whether a kill was delivered through [`Subprocess::kill`].
    pub killed: bool,
}

struct State {
    pid: u32,
    killed: AtomicBool,
    exit: watch::Sender<Option<ExitStatus>>,
}

#[derive(Clone)]
struct Control {
    state: Arc<State>,
    kills: mpsc::Sender<oneshot::Sender<bool>>,
}

impl Control {
    async fn kill(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.kills.send(tx).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    fn killed(&self) -> bool { self.state.killed.load(Ordering::Acquire) }

    fn exit_status(&self) -> Option<ExitStatus> { *self.state.exit.borrow() }
}

/// A spawned child with piped stdio.
///
/// Sending it as an attachment moves the stdio handles to the peer and
/// exposes `kill`, `id`, `killed` and `exit_code` as remote operations.
/// Its `exit` event carries `[code, killed]`.
pub struct Subprocess {
    control: Control,
    events: broadcast::Sender<ResourceEvent>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl Subprocess {
    /// Spawn `command` with all three stdio streams piped.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the spawn error.
    pub fn spawn(command: &mut Command) -> io::Result<Self> {
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Self::from_child(child)
    }

    /// Wrap an already spawned child. Stdio that was not piped stays
    /// absent.
    ///
    /// # Errors
    ///
    /// Fails if the child has already been reaped.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child process already exited"))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit, _) = watch::channel(None);
        let state = Arc::new(State {
            pid,
            killed: AtomicBool::new(false),
            exit,
        });
        let (kills, kill_rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        tokio::spawn(supervise(child, kill_rx, state.clone(), events.clone()));
        Ok(Self {
            control: Control { state, kills },
            events,
            stdin,
            stdout,
            stderr,
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 { self.control.state.pid }

    /// Ask the process to terminate. Returns whether the signal was
    /// delivered; `false` once the process has exited.
    pub async fn kill(&self) -> bool { self.control.kill().await }

    #[must_use]
    pub fn killed(&self) -> bool { self.control.killed() }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> { self.control.exit_status() }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut exit = self.control.state.exit.subscribe();
        let status = exit.wait_for(Option::is_some).await.ok()?;
        *status
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> { self.events.subscribe() }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> { self.stdin.take() }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> { self.stdout.take() }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> { self.stderr.take() }

    fn operations(&self) -> Vec<Operation> {
        let kill = self.control.clone();
        let id = self.control.clone();
        let killed = self.control.clone();
        let exit_code = self.control.clone();
        vec![
            Operation::new("kill", EndpointOptions::new(), move |_| {
                let control = kill.clone();
                async move { Ok(Value::Bool(control.kill().await)) }
            }),
            Operation::new("id", EndpointOptions::new(), move |_| {
                let pid = id.state.pid;
                async move { Ok(json!(pid)) }
            }),
            Operation::new("killed", EndpointOptions::new(), move |_| {
                let value = killed.killed();
                async move { Ok(Value::Bool(value)) }
            }),
            Operation::new("exit_code", EndpointOptions::new(), move |_| {
                let code = exit_code.exit_status().and_then(|s| s.code);
                async move { Ok(json!(code)) }
            }),
        ]
    }
}

impl Composite for Subprocess {
    fn transfer_id(&self) -> u32 { self.id() }

    fn slots(&self) -> &'static [&'static str] { &SLOTS }

    fn into_parts(mut self: Box<Self>) -> CompositeParts {
        let operations = self.operations();
        let handles = vec![
            self.stdin.take().map(|h| Handle::Writer(Box::new(h))),
            self.stdout.take().map(|h| Handle::Reader(Box::new(h))),
            self.stderr.take().map(|h| Handle::Reader(Box::new(h))),
        ];
        CompositeParts {
            handles,
            operations,
            events: Some(self.events.subscribe()),
        }
    }
}

async fn supervise(
    mut child: Child,
    mut kills: mpsc::Receiver<oneshot::Sender<bool>>,
    state: Arc<State>,
    events: broadcast::Sender<ResourceEvent>,
) {
    let mut accepting = true;
    let waited = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kills.recv(), if accepting => match request {
                Some(reply) => {
                    let delivered = match child.start_kill() {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("failed to kill child process: pid={}, error={e}", state.pid);
                            false
                        }
                    };
                    if delivered {
                        state.killed.store(true, Ordering::Release);
                    }
                    let _ = reply.send(delivered);
                }
                None => accepting = false,
            },
        }
    };
    let status = ExitStatus {
        code: match waited {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("failed to wait for child process: pid={}, error={e}", state.pid);
                None
            }
        },
        killed: state.killed.load(Ordering::Acquire),
    };
    info!(
        "child process exited: pid={}, code={:?}, killed={}",
        state.pid, status.code, status.killed
    );
    state.exit.send_replace(Some(status));
    if events
        .send(ResourceEvent::new("exit", vec![json!(status.code), json!(status.killed)]))
        .is_err()
    {
        debug!("no subscribers for exit event: pid={}", state.pid);
    }
    // Fail kill requests that raced with the exit.
    kills.close();
    while let Ok(reply) = kills.try_recv() {
        let _ = reply.send(false);
    }
}
