//! Synchronization driver.
//!
//! Drains the pending queue against the remote, oldest first, on a fixed
//! interval and immediately whenever connectivity comes back. Only one pass
//! runs at a time; triggers that arrive while a pass is running are coalesced.

use crate::config::RetryPolicy;
use crate::ledger::{HoldKey, StockLedger};
use crate::network::{ConnectivityMonitor, ConnectivitySignal};
use crate::operation::{OperationId, PendingOperation, SyncDomain};
use crate::queue::PendingQueue;
use crate::remote::{self, ApplyOutcome, RemoteStore};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The remote applied this operation and it left the queue.
    Completed {
        operation: PendingOperation,
        domain: SyncDomain,
        synced_at: DateTime<Utc>,
    },
    /// The operation was dropped from the queue without being applied.
    Failed {
        operation: PendingOperation,
        reason: FailureReason,
    },
    PassFinished {
        applied: usize,
        dropped: usize,
        remaining: usize,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Rejected(String),
    RetriesExhausted {
        attempts: u32,
        last_error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic timer. Honors per-operation backoff.
    Tick,
    /// Connectivity came back.
    Reconnect,
    /// Explicit user request.
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub applied: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// The pass ended with operations it did not try.
    pub stopped_early: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    pub syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncDriver {
    queue: Arc<PendingQueue>,
    ledger: Arc<StockLedger>,
    monitor: Arc<ConnectivityMonitor>,
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    events: broadcast::Sender<SyncEvent>,
    draining: AtomicBool,
    not_before: Mutex<HashMap<OperationId, Instant>>,
    /// Applied remotely but not yet dequeued. Never sent again.
    settled: Mutex<HashSet<OperationId>>,
    last_synced_at: Mutex<Option<DateTime<Utc>>>,
    runner: Mutex<Option<Runner>>,
}

/// Clears the draining flag however the pass ends, including cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncDriver {
    pub fn new(
        queue: Arc<PendingQueue>,
        ledger: Arc<StockLedger>,
        monitor: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteStore>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            queue,
            ledger,
            monitor,
            remote,
            policy,
            events,
            draining: AtomicBool::new(false),
            not_before: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashSet::new()),
            last_synced_at: Mutex::new(None),
            runner: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Starts the periodic timer and the reconnect listener. A second call
    /// while running is ignored.
    pub fn start(self: &Arc<Self>, every: Duration) {
        let mut runner = lock(&self.runner);
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::warn!("sync driver already started");
            return;
        }

        let cancel = CancellationToken::new();
        let signals = self.monitor.signals();
        let handle = tokio::spawn(run(Arc::downgrade(self), every, signals, cancel.clone()));
        *runner = Some(Runner { cancel, handle });
        tracing::info!(interval = ?every, "sync driver started");
    }

    /// Stops the timer and detaches from connectivity. A pass already running
    /// finishes the operation in hand and then stops; no new pass starts.
    pub fn stop(&self) {
        if let Some(runner) = lock(&self.runner).take() {
            runner.cancel.cancel();
            tracing::info!("sync driver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runner)
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }

    pub fn is_syncing(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_synced_at)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.monitor.is_online(),
            pending: self.queue.len(),
            syncing: self.is_syncing(),
            last_synced_at: self.last_synced_at(),
        }
    }

    /// Clears retry counters and backoff, then drains right away.
    pub async fn force_sync(&self) -> Option<PassSummary> {
        tracing::info!("forced sync requested");
        if let Err(err) = self.queue.reset_attempts() {
            tracing::error!(%err, "could not reset attempt counters");
        }
        lock(&self.not_before).clear();
        self.drain(Trigger::Manual).await
    }

    /// Runs one pass. Returns `None` when offline or when another pass is
    /// already running.
    pub async fn drain(&self, trigger: Trigger) -> Option<PassSummary> {
        self.drain_until(trigger, None).await
    }

    async fn drain_until(
        &self,
        trigger: Trigger,
        cancel: Option<&CancellationToken>,
    ) -> Option<PassSummary> {
        if !self.monitor.is_online() {
            tracing::trace!(?trigger, "offline, drain skipped");
            return None;
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(?trigger, "drain already running, trigger coalesced");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let mut summary = PassSummary::default();
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) || !self.monitor.is_online() {
                summary.stopped_early = !self.queue.is_empty();
                break;
            }
            let Some(operation) = self.queue.front() else {
                break;
            };

            if lock(&self.settled).contains(&operation.id) {
                if !self.complete_operation(operation) {
                    summary.stopped_early = true;
                    break;
                }
                summary.applied += 1;
                continue;
            }

            if self.policy.exhausted(operation.attempts) {
                let reason = FailureReason::RetriesExhausted {
                    attempts: operation.attempts,
                    last_error: operation.last_error.clone(),
                };
                if !self.drop_operation(operation, reason) {
                    summary.stopped_early = true;
                    break;
                }
                summary.dropped += 1;
                continue;
            }

            if trigger == Trigger::Tick && !self.is_due(operation.id) {
                tracing::debug!(id = %operation.id, "head operation backing off");
                summary.stopped_early = true;
                break;
            }

            tracing::debug!(id = %operation.id, kind = %operation.kind, attempt = operation.attempts + 1, "applying");
            match remote::dispatch(self.remote.as_ref(), operation.kind, &operation.payload).await {
                ApplyOutcome::Applied => {
                    if !self.complete_operation(operation) {
                        summary.stopped_early = true;
                        break;
                    }
                    summary.applied += 1;
                }
                ApplyOutcome::Transient(reason) => {
                    self.defer_operation(&operation, &reason);
                    summary.stopped_early = true;
                    break;
                }
                ApplyOutcome::Permanent(reason) => {
                    if !self.drop_operation(operation, FailureReason::Rejected(reason)) {
                        summary.stopped_early = true;
                        break;
                    }
                    summary.dropped += 1;
                }
            }
        }

        summary.remaining = self.queue.len();
        tracing::info!(
            ?trigger,
            applied = summary.applied,
            dropped = summary.dropped,
            remaining = summary.remaining,
            "sync pass finished"
        );
        let _ = self.events.send(SyncEvent::PassFinished {
            applied: summary.applied,
            dropped: summary.dropped,
            remaining: summary.remaining,
            at: Utc::now(),
        });
        Some(summary)
    }

    fn is_due(&self, id: OperationId) -> bool {
        lock(&self.not_before)
            .get(&id)
            .is_none_or(|deadline| Instant::now() >= *deadline)
    }

    fn complete_operation(&self, operation: PendingOperation) -> bool {
        if let Err(err) = self.queue.remove(operation.id) {
            // Still queued: later passes retry the dequeue without resending.
            lock(&self.settled).insert(operation.id);
            tracing::error!(id = %operation.id, %err, "applied operation could not be dequeued");
            return false;
        }
        lock(&self.settled).remove(&operation.id);
        self.ledger.confirm(HoldKey::Operation(operation.id));
        lock(&self.not_before).remove(&operation.id);

        let synced_at = Utc::now();
        *lock(&self.last_synced_at) = Some(synced_at);
        tracing::info!(id = %operation.id, kind = %operation.kind, "operation synced");
        let _ = self.events.send(SyncEvent::Completed {
            domain: operation.kind.domain(),
            operation,
            synced_at,
        });
        true
    }

    fn defer_operation(&self, operation: &PendingOperation, reason: &str) {
        match self.queue.mark_attempt(operation.id, reason) {
            Ok(updated) => {
                let wait = self.policy.backoff(updated.attempts);
                lock(&self.not_before).insert(operation.id, Instant::now() + wait);
                tracing::warn!(
                    id = %operation.id,
                    attempts = updated.attempts,
                    retry_in = ?wait,
                    reason,
                    "transient sync failure, will retry"
                );
            }
            Err(err) => {
                tracing::error!(id = %operation.id, %err, "could not record failed attempt");
            }
        }
    }

    fn drop_operation(&self, operation: PendingOperation, reason: FailureReason) -> bool {
        if let Err(err) = self.queue.remove(operation.id) {
            tracing::error!(id = %operation.id, %err, "failed operation could not be dequeued");
            return false;
        }
        self.ledger.release(HoldKey::Operation(operation.id));
        lock(&self.not_before).remove(&operation.id);

        tracing::error!(id = %operation.id, kind = %operation.kind, ?reason, "operation dropped");
        let _ = self.events.send(SyncEvent::Failed { operation, reason });
        true
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    driver: Weak<SyncDriver>,
    every: Duration,
    mut signals: broadcast::Receiver<ConnectivitySignal>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconnect_pending = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let trigger = if reconnect_pending {
            reconnect_pending = false;
            Trigger::Reconnect
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Ok(ConnectivitySignal::SyncRequested) | Err(RecvError::Lagged(_)) => Trigger::Reconnect,
                    Ok(ConnectivitySignal::WentOffline) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => Trigger::Tick,
            }
        };

        let Some(driver) = driver.upgrade() else {
            break;
        };
        driver.drain_until(trigger, Some(&cancel)).await;
        drop(driver);

        // Collapse whatever piled up during the pass into at most one rerun.
        loop {
            match signals.try_recv() {
                Ok(ConnectivitySignal::SyncRequested) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    reconnect_pending = true;
                }
                Ok(ConnectivitySignal::WentOffline) => {}
                Err(_) => break,
            }
        }
    }
    tracing::debug!("sync runner exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
