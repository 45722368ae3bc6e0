//! Client-side view of a page that converges on the relay's order.
//!
//! Local edits show up immediately in the visible [`Editor`], but the
//! relay decides the final order of concurrent operations. A `Replica`
//! therefore keeps two editors:
//!
//! ```text
//! confirmed = every operation the relay has sequenced, in relay order
//! visible   = confirmed + pending local operations, replayed in order
//! ```
//!
//! When a remote batch arrives while local ops are still pending, the
//! visible editor is rebuilt from `confirmed` and the pending ops are
//! replayed on top. Once every pending op is acknowledged, `visible` equals
//! the relay's own replica.

use std::collections::VecDeque;

use log::{debug, warn};

use crate::editor::Editor;
use crate::error::CrdtError;
use crate::identity::ClientId;
use crate::op::Operation;

/// Batch of local operations handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundBatch {
    pub id: u64,
    pub ops: Vec<Operation>,
}

/// Result of applying a batch of relay-sequenced operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct Replica {
    confirmed: Editor,
    visible: Editor,
    /// Local ops not yet acknowledged, oldest first. The first
    /// `in_flight` ops have been sent.
    pending: VecDeque<Operation>,
    in_flight: VecDeque<(u64, usize)>,
    next_batch: u64,
}

impl Replica {
    pub fn new(editor: Editor) -> Self {
        Self {
            visible: editor.clone(),
            confirmed: editor,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            next_batch: 1,
        }
    }

    /// The editor the user sees and edits.
    pub fn editor(&self) -> &Editor {
        &self.visible
    }

    /// State as sequenced by the relay.
    pub fn confirmed(&self) -> &Editor {
        &self.confirmed
    }

    pub fn client(&self) -> ClientId {
        self.visible.client()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn unsent_len(&self) -> usize {
        self.pending.len() - self.sent_len()
    }

    /// Run local intent against the visible editor and queue the
    /// operations it returns.
    ///
    /// On error the visible editor is rebuilt, so a closure that fails
    /// half way leaves no unreplicated change behind.
    pub fn edit<F>(&mut self, f: F) -> Result<usize, CrdtError>
    where
        F: FnOnce(&mut Editor) -> Result<Vec<Operation>, CrdtError>,
    {
        match f(&mut self.visible) {
            Ok(ops) => {
                let count = ops.len();
                self.pending.extend(ops);
                Ok(count)
            }
            Err(e) => {
                self.rebuild();
                Err(e)
            }
        }
    }

    /// Mark up to `max` unsent ops as in flight and return them.
    pub fn take_unsent(&mut self, max: usize) -> Option<OutboundBatch> {
        let ops: Vec<Operation> = self
            .pending
            .iter()
            .skip(self.sent_len())
            .take(max)
            .cloned()
            .collect();
        if ops.is_empty() {
            return None;
        }
        let id = self.next_batch;
        self.next_batch += 1;
        self.in_flight.push_back((id, ops.len()));
        Some(OutboundBatch { id, ops })
    }

    /// Apply operations the relay sequenced from other peers.
    pub fn receive(&mut self, ops: &[Operation]) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for op in ops {
            if self.confirmed.apply_logged(op) {
                outcome.applied += 1;
            } else {
                outcome.dropped += 1;
            }
        }

        if self.pending.is_empty() {
            for op in ops {
                // Same state as `confirmed`, so failures were already logged.
                let _ = self.visible.apply(op);
            }
        } else {
            self.rebuild();
        }
        outcome
    }

    /// The relay's echo of one of our batches, holding only the ops it
    /// accepted. Returns how many of the batch's ops were rejected.
    pub fn acknowledge(&mut self, batch: u64, accepted: &[Operation]) -> usize {
        let Some(pos) = self.in_flight.iter().position(|(id, _)| *id == batch) else {
            debug!("Ack for unknown batch {}, applying as remote", batch);
            self.receive(accepted);
            return 0;
        };
        if pos != 0 {
            warn!("Batch {} acknowledged out of order", batch);
        }

        let preceding: usize = self.in_flight.iter().take(pos).map(|(_, n)| n).sum();
        let (_, sent) = self.in_flight.remove(pos).unwrap_or((batch, 0));
        let end = (preceding + sent).min(self.pending.len());
        self.pending.drain(preceding.min(end)..end);

        for op in accepted {
            self.confirmed.apply_logged(op);
        }

        let rejected = sent.saturating_sub(accepted.len());
        if rejected > 0 || pos != 0 {
            self.rebuild();
        }
        rejected
    }

    /// Adopt a fresh relay snapshot, e.g. after (re)joining a room.
    ///
    /// Every pending op becomes unsent again and is replayed on top.
    /// Resending ops the relay already applied is harmless.
    pub fn reset(&mut self, mut confirmed: Editor, client: ClientId) {
        confirmed.set_client(client);
        self.confirmed = confirmed;
        self.in_flight.clear();
        self.rebuild();
    }

    fn sent_len(&self) -> usize {
        self.in_flight.iter().map(|(_, n)| n).sum()
    }

    fn rebuild(&mut self) {
        let mut visible = self.confirmed.clone();
        for op in &self.pending {
            if let Err(e) = visible.apply(op) {
                debug!("Pending {} no longer applies: {}", op.kind(), e);
            }
        }
        self.visible = visible;
    }
}
