//! Writer-task plumbing shared by the stream and frame transports.

use std::{
    future::Future,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{Sink, SinkExt};
use log::debug;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::TransportError;
use crate::engine::lock;

const WRITE_QUEUE: usize = 64;

pub(crate) struct Outgoing<T> {
    item: T,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Connection flag, cancellation and a writer task fed through a queue.
///
/// Each queued item carries a completion channel so callers learn whether
/// their own write succeeded.
pub(crate) struct LinkCore<T> {
    tx: mpsc::Sender<Outgoing<T>>,
    connected: AtomicBool,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> LinkCore<T> {
    pub(crate) fn spawn<S>(sink: S) -> Self
    where
        S: Sink<T> + Send + Unpin + 'static,
        TransportError: From<S::Error>,
    {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(drive_sink(sink, rx, cancel.clone()));
        Self {
            tx,
            connected: AtomicBool::new(true),
            cancel,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled(&self) -> impl Future<Output = ()> + '_ { self.cancel.cancelled() }

    pub(crate) async fn send(&self, item: T) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Outgoing { item, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Stop accepting writes, let the writer close the sink and wait for it.
    pub(crate) async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            debug!("writer task ended abnormally: error={e}");
        }
    }
}

async fn drive_sink<T, S>(mut sink: S, mut rx: mpsc::Receiver<Outgoing<T>>, cancel: CancellationToken)
where
    S: Sink<T> + Unpin,
    TransportError: From<S::Error>,
{
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(Outgoing { item, done }) = next else {
            break;
        };
        let result = sink.send(item).await.map_err(TransportError::from);
        let _ = done.send(result);
    }
    rx.close();
    while let Ok(Outgoing { done, .. }) = rx.try_recv() {
        let _ = done.send(Err(TransportError::Closed));
    }
    if let Err(e) = sink.close().await {
        debug!("failed to close sink: error={}", TransportError::from(e));
    }
}
