//! Durable FIFO of writes the remote has not confirmed yet.
//!
//! Every mutating call is journaled and fsynced before it returns, and then
//! announced on a [`QueueChanged`] broadcast so badges and the sync driver see
//! the new count without polling.

use crate::error::{Error, Result};
use crate::operation::{OperationId, OperationKind, PendingOperation};
use crate::storage::{JournalRecord, Storage};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChanged {
    pub pending: usize,
}

struct QueueState {
    storage: Storage,
    ops: BTreeMap<OperationId, PendingOperation>,
    next_id: u64,
    journal_len: usize,
    compact_after: usize,
}

pub struct PendingQueue {
    state: Mutex<QueueState>,
    changes: broadcast::Sender<QueueChanged>,
}

impl PendingQueue {
    /// Opens the queue and replays its journal.
    pub fn open(mut storage: Storage, compact_after: usize) -> Result<Self> {
        let records = storage.load()?;
        let journal_len = records.len();
        let mut ops = BTreeMap::new();
        let mut next_id = 1u64;

        for record in records {
            match record {
                JournalRecord::Checkpoint { next_id: OperationId(n) } => {
                    next_id = next_id.max(n);
                }
                JournalRecord::Enqueued { operation } => {
                    next_id = next_id.max(operation.id.0 + 1);
                    ops.insert(operation.id, operation);
                }
                JournalRecord::Updated {
                    id,
                    attempts,
                    last_error,
                    last_attempt_at,
                } => {
                    if let Some(op) = ops.get_mut(&id) {
                        op.attempts = attempts;
                        op.last_error = last_error;
                        op.last_attempt_at = last_attempt_at;
                    }
                }
                JournalRecord::Removed { id } => {
                    ops.remove(&id);
                }
            }
        }

        tracing::info!(
            journal = %storage.journal_path().display(),
            pending = ops.len(),
            next_id,
            "pending queue opened"
        );

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            state: Mutex::new(QueueState {
                storage,
                ops,
                next_id,
                journal_len,
                compact_after: compact_after.max(1),
            }),
            changes,
        })
    }

    /// Appends an operation. The record is on disk when this returns.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<PendingOperation> {
        self.enqueue_with(kind, payload, |_| {})
    }

    /// Like [`enqueue`](Self::enqueue), but runs `on_durable` once the record
    /// is journaled and before any reader can see the entry.
    pub fn enqueue_with<F>(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
        on_durable: F,
    ) -> Result<PendingOperation>
    where
        F: FnOnce(&PendingOperation),
    {
        let (operation, pending) = {
            let mut state = self.lock();
            let operation = PendingOperation {
                id: OperationId(state.next_id),
                kind,
                payload,
                created_at: Utc::now(),
                attempts: 0,
                last_error: None,
                last_attempt_at: None,
            };
            state.write(&JournalRecord::Enqueued {
                operation: operation.clone(),
            })?;
            state.next_id += 1;
            on_durable(&operation);
            state.ops.insert(operation.id, operation.clone());
            state.maybe_compact();
            (operation, state.ops.len())
        };

        tracing::debug!(id = %operation.id, kind = %operation.kind, pending, "operation enqueued");
        self.notify(pending);
        Ok(operation)
    }

    pub fn enqueue_payload<T: Serialize>(
        &self,
        kind: OperationKind,
        payload: &T,
    ) -> Result<PendingOperation> {
        self.enqueue(kind, serde_json::to_value(payload)?)
    }

    /// Snapshot in FIFO order.
    pub fn all(&self) -> Vec<PendingOperation> {
        self.lock().ops.values().cloned().collect()
    }

    pub fn front(&self) -> Option<PendingOperation> {
        self.lock().ops.values().next().cloned()
    }

    pub fn get(&self, id: OperationId) -> Option<PendingOperation> {
        self.lock().ops.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ops.is_empty()
    }

    /// Deletes an entry. Returns `None` if it was already gone.
    pub fn remove(&self, id: OperationId) -> Result<Option<PendingOperation>> {
        let (removed, pending) = {
            let mut state = self.lock();
            if !state.ops.contains_key(&id) {
                return Ok(None);
            }
            state.write(&JournalRecord::Removed { id })?;
            let removed = state.ops.remove(&id);
            state.maybe_compact();
            (removed, state.ops.len())
        };

        tracing::debug!(%id, pending, "operation removed");
        self.notify(pending);
        Ok(removed)
    }

    /// Records a failed attempt without removing the entry.
    pub fn mark_attempt(&self, id: OperationId, error: &str) -> Result<PendingOperation> {
        let (updated, pending) = {
            let mut state = self.lock();
            let Some(current) = state.ops.get(&id) else {
                return Err(Error::UnknownOperation(id));
            };
            let mut updated = current.clone();
            updated.attempts = updated.attempts.saturating_add(1);
            updated.last_error = Some(error.to_string());
            updated.last_attempt_at = Some(Utc::now());
            state.write(&JournalRecord::Updated {
                id,
                attempts: updated.attempts,
                last_error: updated.last_error.clone(),
                last_attempt_at: updated.last_attempt_at,
            })?;
            state.ops.insert(id, updated.clone());
            state.maybe_compact();
            (updated, state.ops.len())
        };

        tracing::debug!(%id, attempts = updated.attempts, error, "attempt recorded");
        self.notify(pending);
        Ok(updated)
    }

    /// Clears attempt counters on every entry. Returns how many were reset.
    pub fn reset_attempts(&self) -> Result<usize> {
        let (reset, pending) = {
            let mut state = self.lock();
            let ids: Vec<OperationId> = state
                .ops
                .values()
                .filter(|op| op.attempts > 0 || op.last_error.is_some())
                .map(|op| op.id)
                .collect();
            for id in &ids {
                state.write(&JournalRecord::Updated {
                    id: *id,
                    attempts: 0,
                    last_error: None,
                    last_attempt_at: None,
                })?;
                if let Some(op) = state.ops.get_mut(id) {
                    op.attempts = 0;
                    op.last_error = None;
                    op.last_attempt_at = None;
                }
            }
            state.maybe_compact();
            (ids.len(), state.ops.len())
        };

        if reset > 0 {
            tracing::info!(reset, "attempt counters reset");
            self.notify(pending);
        }
        Ok(reset)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueChanged> {
        self.changes.subscribe()
    }

    fn notify(&self, pending: usize) {
        let _ = self.changes.send(QueueChanged { pending });
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueState {
    fn write(&mut self, record: &JournalRecord) -> Result<()> {
        self.storage.append(record)?;
        self.journal_len += 1;
        Ok(())
    }

    /// Rewrites the journal as a checkpoint plus live entries once it has
    /// grown past the threshold. Runs after the in-memory map is updated; the
    /// triggering append is already durable, so a failure is only logged.
    fn maybe_compact(&mut self) {
        if self.journal_len <= self.compact_after || self.journal_len <= self.ops.len() * 2 {
            return;
        }

        let mut records = Vec::with_capacity(self.ops.len() + 1);
        records.push(JournalRecord::Checkpoint {
            next_id: OperationId(self.next_id),
        });
        records.extend(
            self.ops
                .values()
                .cloned()
                .map(|operation| JournalRecord::Enqueued { operation }),
        );

        match self.storage.rewrite(&records) {
            Ok(()) => {
                tracing::debug!(before = self.journal_len, after = records.len(), "journal compacted");
                self.journal_len = records.len();
            }
            Err(err) => tracing::warn!(%err, "journal compaction failed"),
        }
    }
}
