use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use bitscrape_types::{Event, SubscriptionToken};

use crate::bus::{EventBus, EventHandler};
use crate::filter::EventFilter;

type Job = Box<dyn FnOnce() + Send + 'static>;

const STOP_JOIN_BUDGET: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Running,
}

struct RunningPool {
    tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

struct PoolInner {
    n_workers: usize,
    running: Mutex<Option<RunningPool>>,
    depth: AtomicUsize,
    empty: tokio::sync::Notify,
}

/// A pool of worker tasks draining a FIFO queue of jobs.
///
/// Jobs submitted while the pool is stopped are dropped silently. The
/// queue is FIFO; fan-out across workers means cross-job ordering is not
/// guaranteed once more than one worker runs.
#[derive(Clone)]
pub struct AsyncProcessor {
    inner: Arc<PoolInner>,
}

impl AsyncProcessor {
    /// `n_workers == 0` means `max(2, hardware parallelism)`.
    pub fn spawn(n_workers: usize) -> Self {
        let n_workers = if n_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(2)
        } else {
            n_workers
        };
        let this = AsyncProcessor {
            inner: Arc::new(PoolInner {
                n_workers,
                running: Mutex::new(None),
                depth: AtomicUsize::new(0),
                empty: tokio::sync::Notify::new(),
            }),
        };
        this.start();
        this
    }

    pub fn state(&self) -> ProcessorState {
        if self.inner.running.lock().is_some() {
            ProcessorState::Running
        } else {
            ProcessorState::Stopped
        }
    }

    /// Idempotent.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();
        let workers = (0..self.inner.n_workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let cancel = cancel.clone();
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    trace!(worker_id, "processor worker started");
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!(worker_id, "event handler panicked; continuing");
                        }
                        if inner.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
                            inner.empty.notify_waiters();
                        }
                    }
                    trace!(worker_id, "processor worker exiting");
                })
            })
            .collect();
        *running = Some(RunningPool {
            tx,
            cancel,
            workers,
        });
    }

    /// Enqueues a job. Returns false (and drops the job) when stopped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let running = self.inner.running.lock();
        let Some(pool) = running.as_ref() else {
            return false;
        };
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        if pool.tx.send(Box::new(job)).is_err() {
            self.inner.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Blocks until the queue drains or `timeout` elapses. Returns true
    /// when the queue was observed empty.
    pub async fn wait_for_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.depth.load(Ordering::Acquire) == 0 {
                return true;
            }
            let notified = self.inner.empty.notified();
            if self.inner.depth.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.depth.load(Ordering::Acquire) == 0;
            }
        }
    }

    /// Idempotent. Signals workers and joins them within one second;
    /// whatever is still queued is discarded.
    pub async fn stop(&self) {
        let pool = self.inner.running.lock().take();
        let Some(pool) = pool else {
            return;
        };
        pool.cancel.cancel();
        drop(pool.tx);

        let join_all = async {
            for w in pool.workers {
                let _ = w.await;
            }
        };
        if tokio::time::timeout(STOP_JOIN_BUDGET, join_all).await.is_err() {
            debug!("processor workers did not join in {STOP_JOIN_BUDGET:?}");
        }
        self.inner.depth.store(0, Ordering::Release);
        self.inner.empty.notify_waiters();
    }
}

/// One consumer on the bus: a filter deciding which events it accepts,
/// a handler, and a pool the handler runs on. The filter lives here, not
/// on the subscription.
pub struct EventProcessor {
    pool: AsyncProcessor,
    filter: Option<EventFilter>,
    handler: EventHandler,
    token: Mutex<Option<SubscriptionToken>>,
}

impl EventProcessor {
    pub fn new(
        n_workers: usize,
        filter: Option<EventFilter>,
        handler: EventHandler,
    ) -> Self {
        EventProcessor {
            pool: AsyncProcessor::spawn(n_workers),
            filter,
            handler,
            token: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &AsyncProcessor {
        &self.pool
    }

    /// Subscribes this processor to the bus. Events passing the filter
    /// are queued onto the pool; the rest are ignored on the publish
    /// thread without any queueing cost.
    pub fn attach(&self, bus: &EventBus) {
        let mut token = self.token.lock();
        if token.is_some() {
            return;
        }
        let filter = self.filter.clone();
        let handler = self.handler.clone();
        let pool = self.pool.clone();
        *token = Some(bus.subscribe(move |event: &Event| {
            if let Some(f) = &filter {
                if !f.matches(event) {
                    return;
                }
            }
            let handler = handler.clone();
            let event = event.clone();
            pool.submit(move || handler(&event));
        }));
    }

    pub fn detach(&self, bus: &EventBus) {
        if let Some(token) = self.token.lock().take() {
            bus.unsubscribe(token);
        }
    }

    pub async fn stop(&self) {
        self.pool.stop().await
    }
}
