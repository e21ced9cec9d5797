//! Connectivity monitor.
//!
//! Tracks the last known online state, calls listeners on every transition and
//! republishes transitions as [`ConnectivitySignal`]s. Going online always asks
//! for a sync.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    /// Offline to online. The sync driver drains immediately.
    SyncRequested,
    /// Online to offline. User-facing advisory only.
    WentOffline,
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

pub struct ConnectivityMonitor {
    online: AtomicBool,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    signals: broadcast::Sender<ConnectivitySignal>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Arc<Self> {
        let (signals, _) = broadcast::channel(32);
        Arc::new(Self {
            online: AtomicBool::new(initially_online),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            signals,
        })
    }

    /// Builds a monitor from a startup probe. An unavailable signal falls
    /// back to `assume_online`.
    pub async fn initialize(probe: &dyn ConnectivityProbe, assume_online: bool) -> Arc<Self> {
        let online = probe.probe().await.unwrap_or(assume_online);
        tracing::info!(online, "connectivity initialized");
        Self::new(online)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Registers a transition callback. Dropping the returned handle
    /// unregisters it, including from inside the callback itself.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push((id, Arc::new(listener)));
        Subscription {
            monitor: Arc::downgrade(self),
            id,
        }
    }

    pub fn signals(&self) -> broadcast::Receiver<ConnectivitySignal> {
        self.signals.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    pub fn set_online(&self, online: bool) {
        self.report(Some(online));
    }

    /// Feeds one observation of the runtime signal. `None` means the signal
    /// could not be read; the last known state is kept.
    pub fn report(&self, observed: Option<bool>) {
        let Some(online) = observed else {
            tracing::debug!(online = self.is_online(), "connectivity signal unavailable, keeping last state");
            return;
        };

        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        if online {
            tracing::info!("connectivity restored, requesting sync");
            let _ = self.signals.send(ConnectivitySignal::SyncRequested);
        } else {
            tracing::warn!("connectivity lost, writes will be queued");
            let _ = self.signals.send(ConnectivitySignal::WentOffline);
        }

        // Dispatch on a snapshot so listeners may (un)subscribe re-entrantly.
        let snapshot: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(online);
        }
    }

    /// Polls `probe` every `every` and reports what it sees. The task ends on
    /// its own once the monitor is dropped.
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let observed = probe.probe().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.report(observed);
            }
        })
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_listeners().retain(|(listener_id, _)| *listener_id != id);
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    monitor: Weak<ConnectivityMonitor>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unsubscribe(self.id);
        }
    }
}

/// Source of raw connectivity observations.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Some(online)` when the signal could be read, `None` otherwise.
    async fn probe(&self) -> Option<bool>;
}

/// Considers the device online when a TCP connection to the backend opens
/// within the timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> Option<bool> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => Some(true),
            Ok(Err(err)) => {
                tracing::debug!(addr = %self.addr, %err, "probe connect failed");
                Some(false)
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "probe timed out");
                Some(false)
            }
        }
    }
}
