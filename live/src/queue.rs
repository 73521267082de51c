//! Serial dispatch queues and confinement contexts.
//!
//! A [`Queue`] runs jobs one at a time, in submission order, on a dedicated
//! thread. Every confined handle belongs to exactly one [`Confinement`]
//! context: either a queue, or a plain thread that is not running a queue.

use crate::error::{LiveError, Result};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: RefCell<Option<Weak<QueueInner>>> = const { RefCell::new(None) };
}

/// Identifier of a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

/// The context a confined handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Confinement {
    /// A thread that is not running a dispatch queue
    Thread(ThreadId),
    /// A serial dispatch queue
    Queue(QueueId),
}

impl Confinement {
    /// The context of the caller.
    pub fn current() -> Self {
        match Queue::current() {
            Some(queue) => Confinement::Queue(queue.id()),
            None => Confinement::Thread(thread::current().id()),
        }
    }
}

impl fmt::Display for Confinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confinement::Thread(id) => write!(f, "thread {id:?}"),
            Confinement::Queue(id) => write!(f, "queue #{}", id.0),
        }
    }
}

struct QueueInner {
    id: QueueId,
    label: String,
    sender: mpsc::UnboundedSender<Job>,
}

/// A named serial dispatch queue.
///
/// Cloning yields another handle to the same queue. The worker thread exits
/// once every handle is dropped and the remaining jobs have run.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl Queue {
    /// Start a queue on a new thread named `label`.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let inner = Arc::new(QueueInner {
            id: QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.clone(),
            sender,
        });

        let weak = Arc::downgrade(&inner);
        let thread_label = label.clone();
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                CURRENT_QUEUE.with(|current| *current.borrow_mut() = Some(weak));
                while let Some(job) = receiver.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(queue = %thread_label, "Job panicked");
                    }
                }
                tracing::trace!(queue = %thread_label, "Queue drained and closed");
            })
            .map_err(|e| LiveError::Spawn(e.to_string()))?;

        tracing::debug!(queue = %label, "Queue started");
        Ok(Self { inner })
    }

    /// The queue the caller is running on, if any.
    pub fn current() -> Option<Queue> {
        CURRENT_QUEUE.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|inner| Queue { inner })
        })
    }

    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the caller is running on this queue.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.inner)))
        })
    }

    /// Enqueue a job. Returns `false` if the queue has shut down.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.sender.send(Box::new(job)).is_err() {
            tracing::warn!(queue = %self.inner.label, "Dispatch to closed queue dropped");
            return false;
        }
        true
    }

    /// Run a job on the queue and wait for its result.
    ///
    /// Runs inline when called from the queue itself.
    pub fn sync<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(job());
        });
        rx.blocking_recv()
            .map_err(|_| LiveError::QueueClosed(self.inner.label.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order_on_the_queue() {
        let queue = Queue::new("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().push(i));
        }
        queue.sync(|| ()).unwrap();

        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn confinement_reflects_queue() {
        let queue = Queue::new("confined").unwrap();
        let id = queue.id();

        let inside = queue.sync(Confinement::current).unwrap();
        assert_eq!(inside, Confinement::Queue(id));
        assert_eq!(
            Confinement::current(),
            Confinement::Thread(thread::current().id())
        );
        assert!(!queue.is_current());
        assert!(queue.sync({
            let q = queue.clone();
            move || q.is_current()
        })
        .unwrap());
    }

    #[test]
    fn sync_from_queue_runs_inline() {
        let queue = Queue::new("inline").unwrap();
        let inner = queue.clone();
        let value = queue
            .sync(move || inner.sync(|| 41).map(|v| v + 1))
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn panicking_job_does_not_kill_queue() {
        let queue = Queue::new("panics").unwrap();
        queue.dispatch(|| panic!("boom"));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.sync(|| 7).unwrap(), 7);
    }
}
