//! Background release worker.
//!
//! Freeing device memory can fail transiently while a kernel still uses it.
//! Instead of blocking the caller or leaking the allocation, the context hands
//! such releases to a [`GarbageWorker`], which retries them from a FIFO on its
//! own thread until they succeed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace, warn};

use crate::error::{Error, ReleaseError, Result};

/// Something the [`GarbageWorker`] knows how to destroy.
pub trait Reclaim: Send + 'static {
    /// Attempts the release once.
    ///
    /// # Errors
    ///
    /// [`ReleaseError::Busy`] requeues the item; any other error drops it.
    fn reclaim(&mut self) -> Result<(), ReleaseError>;
}

/// Retry behaviour of a [`GarbageWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause before the first retry; later retries wait proportionally longer.
    pub backoff: Duration,
    /// Retries after which an item is dropped. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_micros(50),
            max_retries: None,
        }
    }
}

/// Counters of a [`GarbageWorker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Items released successfully.
    pub reclaimed: u64,
    /// Items given up on.
    pub dropped: u64,
    /// Busy results observed.
    pub retries: u64,
}

struct Pending<T> {
    item: T,
    attempts: u32,
}

enum Message<T> {
    Item(Pending<T>),
    Shutdown,
}

struct Queue<T> {
    messages: VecDeque<Message<T>>,
    in_progress: usize,
}

impl<T> Queue<T> {
    fn pending_items(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::Item(_)))
            .count()
    }
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    idle: Condvar,
    policy: RetryPolicy,
    reclaimed: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

/// Blocking FIFO of pending releases drained by a dedicated thread.
pub struct GarbageWorker<T: Reclaim> {
    shared: Arc<Shared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Reclaim> GarbageWorker<T> {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the thread cannot be spawned.
    pub fn spawn(policy: RetryPolicy) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                messages: VecDeque::new(),
                in_progress: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
            policy,
            reclaimed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("wmatrix-gc".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::DeviceExecution(format!("failed to spawn release worker: {e}")))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues an item for release. Never blocks on the device.
    pub fn push(&self, item: T) {
        let mut queue = self.shared.queue.lock();
        queue.messages.push_back(Message::Item(Pending { item, attempts: 0 }));
        self.shared.available.notify_one();
    }

    /// Number of items waiting or being released.
    #[must_use]
    pub fn len(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.pending_items() + queue.in_progress
    }

    /// Returns `true` when nothing is waiting for release.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until every queued item has been released or dropped.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.pending_items() + queue.in_progress > 0 {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> GcStats {
        GcStats {
            reclaimed: self.shared.reclaimed.load(Ordering::Acquire),
            dropped: self.shared.dropped.load(Ordering::Acquire),
            retries: self.shared.retries.load(Ordering::Acquire),
        }
    }

    /// Enqueues the shutdown sentinel and joins the worker.
    ///
    /// The worker drains every item queued before it stops, so this blocks
    /// until all of them were released. Calling it twice is a no-op.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        {
            let mut queue = self.shared.queue.lock();
            queue.messages.push_back(Message::Shutdown);
            self.shared.available.notify_one();
        }
        if thread.join().is_err() {
            error!("release worker panicked");
        }
    }
}

impl<T: Reclaim> Drop for GarbageWorker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Reclaim> Shared<T> {
    fn run(&self) {
        loop {
            let mut queue = self.queue.lock();
            let message = loop {
                if let Some(message) = queue.messages.pop_front() {
                    break message;
                }
                self.available.wait(&mut queue);
            };

            let mut pending = match message {
                Message::Shutdown if queue.messages.is_empty() => {
                    trace!("release worker stopping");
                    return;
                }
                Message::Shutdown => {
                    queue.messages.push_back(Message::Shutdown);
                    continue;
                }
                Message::Item(pending) => pending,
            };
            queue.in_progress += 1;
            drop(queue);

            if pending.attempts > 0 {
                thread::sleep(self.policy.backoff * pending.attempts.min(16));
            }
            let requeue = self.attempt(&mut pending);

            let mut queue = self.queue.lock();
            queue.in_progress -= 1;
            if requeue {
                queue.messages.push_back(Message::Item(pending));
            }
            if queue.pending_items() + queue.in_progress == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Returns `true` when the item must go back into the queue.
    fn attempt(&self, pending: &mut Pending<T>) -> bool {
        match pending.item.reclaim() {
            Ok(()) => {
                self.reclaimed.fetch_add(1, Ordering::AcqRel);
                false
            }
            Err(ReleaseError::Busy) => {
                self.retries.fetch_add(1, Ordering::AcqRel);
                pending.attempts += 1;
                if self.policy.max_retries.is_some_and(|cap| pending.attempts > cap) {
                    error!(
                        attempts = pending.attempts,
                        "giving up on busy release; memory is leaked"
                    );
                    self.dropped.fetch_add(1, Ordering::AcqRel);
                    return false;
                }
                if pending.attempts % 1024 == 0 {
                    warn!(attempts = pending.attempts, "release still busy");
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "dropping unreleasable item");
                self.dropped.fetch_add(1, Ordering::AcqRel);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Item {
        busy: Arc<AtomicBool>,
        frees: Arc<AtomicUsize>,
    }

    impl Reclaim for Item {
        fn reclaim(&mut self) -> Result<(), ReleaseError> {
            if self.busy.load(Ordering::Acquire) {
                return Err(ReleaseError::Busy);
            }
            self.frees.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_micros(10),
            max_retries: None,
        }
    }

    #[test]
    fn busy_items_are_retried_until_free() {
        let gc = GarbageWorker::spawn(fast()).unwrap();
        let busy = Arc::new(AtomicBool::new(true));
        let frees = Arc::new(AtomicUsize::new(0));
        gc.push(Item {
            busy: Arc::clone(&busy),
            frees: Arc::clone(&frees),
        });
        thread::sleep(Duration::from_millis(5));
        assert_eq!(frees.load(Ordering::Acquire), 0);
        assert_eq!(gc.len(), 1);

        busy.store(false, Ordering::Release);
        gc.wait_idle();
        assert_eq!(frees.load(Ordering::Acquire), 1);
        assert!(gc.stats().retries > 0);
    }

    #[test]
    fn capped_retries_drop_the_item() {
        let gc = GarbageWorker::spawn(RetryPolicy {
            backoff: Duration::from_micros(1),
            max_retries: Some(3),
        })
        .unwrap();
        let frees = Arc::new(AtomicUsize::new(0));
        gc.push(Item {
            busy: Arc::new(AtomicBool::new(true)),
            frees: Arc::clone(&frees),
        });
        gc.wait_idle();
        assert_eq!(gc.stats().dropped, 1);
        assert_eq!(frees.load(Ordering::Acquire), 0);
    }

    #[test]
    fn shutdown_drains_the_queue_first() {
        let gc = GarbageWorker::spawn(fast()).unwrap();
        let busy = Arc::new(AtomicBool::new(true));
        let frees = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            gc.push(Item {
                busy: Arc::clone(&busy),
                frees: Arc::clone(&frees),
            });
        }
        let release = Arc::clone(&busy);
        let unblock = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            release.store(false, Ordering::Release);
        });
        gc.shutdown();
        unblock.join().unwrap();
        assert_eq!(frees.load(Ordering::Acquire), 4);
        gc.shutdown();
    }
}
