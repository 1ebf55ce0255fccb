//! Per-node worker bookkeeping and cooperative cancellation.
//!
//! Each node owns one slot per worker kind. A worker registers itself in its
//! slot when spawned and clears the slot when its future is dropped, whether
//! it finished or was aborted. Every slot mutation happens under the node's
//! slot lock, and a slot is only cleared by the worker that filled it, so a
//! canceller that sees a registered handle always aborts a live task.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Boot,
    State,
    Monitor,
    Crash,
    Stop,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::State => "state",
            Self::Monitor => "monitor",
            Self::Crash => "crash",
            Self::Stop => "stop",
        }
    }
}

struct Slot {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Slots {
    boot: Option<Slot>,
    state: Option<Slot>,
    monitor: Option<Slot>,
    crash: Option<Slot>,
    stop: Option<Slot>,
}

impl Slots {
    fn get_mut(&mut self, kind: WorkerKind) -> &mut Option<Slot> {
        match kind {
            WorkerKind::Boot => &mut self.boot,
            WorkerKind::State => &mut self.state,
            WorkerKind::Monitor => &mut self.monitor,
            WorkerKind::Crash => &mut self.crash,
            WorkerKind::Stop => &mut self.stop,
        }
    }
}

/// The worker handle bundle of one node.
#[derive(Default)]
pub struct Workers {
    slots: Mutex<Slots>,
    next_generation: AtomicU64,
}

/// Clears the worker's slot when the worker future is dropped.
struct SlotGuard {
    workers: Arc<Workers>,
    kind: WorkerKind,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.workers.lock();
        let slot = slots.get_mut(self.kind);
        if slot.as_ref().is_some_and(|s| s.generation == self.generation) {
            *slot = None;
        }
    }
}

impl Workers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, kind: WorkerKind) -> bool {
        self.lock().get_mut(kind).is_some()
    }

    fn spawn_locked<F>(self: &Arc<Self>, slots: &mut Slots, kind: WorkerKind, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = SlotGuard {
            workers: Arc::clone(self),
            kind,
            generation,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
        *slots.get_mut(kind) = Some(Slot {
            generation,
            handle: handle.abort_handle(),
        });
        handle
    }

    /// Spawn a worker unless one of this kind is already registered.
    pub fn spawn<F>(self: &Arc<Self>, kind: WorkerKind, fut: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.lock();
        if slots.get_mut(kind).is_some() {
            return None;
        }
        Some(self.spawn_locked(&mut slots, kind, fut))
    }

    /// Spawn a worker, aborting any registered worker of the same kind.
    /// Returns the handle and whether a previous worker was replaced.
    pub fn replace<F>(self: &Arc<Self>, kind: WorkerKind, fut: F) -> (JoinHandle<()>, bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.lock();
        let replaced = match slots.get_mut(kind).take() {
            Some(old) => {
                old.handle.abort();
                true
            }
            None => false,
        };
        (self.spawn_locked(&mut slots, kind, fut), replaced)
    }

    /// Abort every registered worker of the given kinds. Returns how many
    /// were aborted.
    pub fn cancel(&self, kinds: &[WorkerKind]) -> usize {
        let mut slots = self.lock();
        let mut aborted = 0;
        for kind in kinds {
            if let Some(slot) = slots.get_mut(*kind).take() {
                slot.handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

/// A per-node stop flag that blocking waits can select on.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`. Returns `false` if stopped first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts in-flight work and lets a waiter block until it drains.
///
/// Used for the "still starting" boot counter and the shutdown helper
/// counter.
#[derive(Clone)]
pub struct Countdown {
    tx: Arc<watch::Sender<usize>>,
}

/// Decrements its countdown on drop.
pub struct CountdownGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Countdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn enter(&self) -> CountdownGuard {
        self.tx.send_modify(|count| *count += 1);
        CountdownGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn pending(&self) -> usize {
        *self.tx.borrow()
    }

    pub async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }
}
