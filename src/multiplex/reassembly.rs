//! Collects the pieces of inbound composite transfers.
//!
//! Pieces are keyed by transfer id and may arrive in any order; a transfer
//! completes once the number of pieces announced by its metadata piece has
//! been received.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use log::warn;

use super::{PieceHeader, TransferPiece};
use crate::envelope::{Envelope, Handle};

#[derive(Debug)]
struct PartialTransfer {
    expected: Option<usize>,
    received: usize,
    handles: BTreeMap<usize, Handle>,
    metadata: Option<(PieceHeader, Envelope)>,
    started_at: Instant,
}

impl PartialTransfer {
    fn new() -> Self {
        Self {
            expected: None,
            received: 0,
            handles: BTreeMap::new(),
            metadata: None,
            started_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool { self.expected.is_some_and(|n| self.received >= n) }
}

/// A transfer whose pieces have all arrived.
#[derive(Debug)]
pub(crate) struct CompletedTransfer {
    pub(crate) id: u32,
    pub(crate) envelope: Envelope,
    pub(crate) handles: BTreeMap<usize, Handle>,
    pub(crate) endpoints: Vec<String>,
    pub(crate) subject: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct TransferTable {
    partial: HashMap<u32, PartialTransfer>,
}

impl TransferTable {
    /// Record one piece. Returns the finished transfer when this piece
    /// completes it.
    pub(crate) fn accept(
        &mut self,
        piece: TransferPiece,
        handle: Option<Handle>,
    ) -> Option<CompletedTransfer> {
        let id = piece.header.id;
        let entry = self.partial.entry(id).or_insert_with(PartialTransfer::new);
        entry.received += 1;
        match (piece.payload, piece.header.slot, handle) {
            (Some(envelope), _, _) => {
                entry.expected = Some(piece.header.pieces.unwrap_or(1));
                entry.metadata = Some((piece.header, envelope));
            }
            (None, Some(slot), Some(handle)) => {
                if entry.handles.insert(slot, handle).is_some() {
                    warn!("duplicate transfer slot replaced: transfer={id}, slot={slot}");
                }
            }
            (None, Some(slot), None) => {
                warn!("transfer piece arrived without its handle: transfer={id}, slot={slot}");
            }
            (None, None, _) => {
                warn!("transfer piece has neither slot nor payload: transfer={id}");
            }
        }
        if !entry.is_complete() {
            return None;
        }
        let done = self.partial.remove(&id)?;
        let (header, envelope) = done.metadata?;
        Some(CompletedTransfer {
            id,
            envelope,
            handles: done.handles,
            endpoints: header.endpoints,
            subject: header.subject,
        })
    }

    /// Drop partial transfers older than `max_age`. Returns how many were
    /// dropped.
    pub(crate) fn purge_older_than(&mut self, max_age: Duration) -> usize {
        let before = self.partial.len();
        self.partial.retain(|_, t| t.started_at.elapsed() < max_age);
        before - self.partial.len()
    }

    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> usize { self.partial.len() }
}
