use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use bitscrape_types::{Event, EventTag, SubscriptionToken};

use crate::processor::AsyncProcessor;

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

struct Subscription {
    token: SubscriptionToken,
    tag: Option<EventTag>,
    handler: EventHandler,
}

struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_token: AtomicU64,
    pool: AsyncProcessor,
}

/// The in-process pub/sub bus. Synchronous publishes run handlers on the
/// publishing task in registration order; asynchronous publishes run them
/// on the bus's worker pool. A panicking handler is caught and logged,
/// never propagated to the other subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Cheap handle subsystems hold to publish without owning the bus.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(1),
                pool: AsyncProcessor::spawn(0),
            }),
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            inner: self.inner.clone(),
        }
    }

    /// Subscribes to every event.
    pub fn subscribe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionToken {
        self.subscribe_inner(None, Arc::new(handler))
    }

    /// Subscribes to events of one tag only.
    pub fn subscribe_tag(
        &self,
        tag: EventTag,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.subscribe_inner(Some(tag), Arc::new(handler))
    }

    fn subscribe_inner(&self, tag: Option<EventTag>, handler: EventHandler) -> SubscriptionToken {
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            token,
            tag,
            handler,
        });
        token
    }

    /// Idempotent; returns whether the token was still registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.inner.subscriptions.write();
        match subs.iter().position(|s| s.token == token) {
            Some(pos) => {
                subs.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    pub fn publish(&self, event: &Event) {
        self.inner.deliver(event)
    }

    /// Queues delivery onto the pool. The returned future resolves once
    /// every handler has run (immediately if the pool is stopped).
    pub fn publish_async(&self, event: Event) -> impl std::future::Future<Output = ()> {
        self.inner.publish_async(event)
    }

    /// Stops the internal pool; queued async publishes are discarded.
    pub async fn shutdown(&self) {
        self.inner.pool.stop().await;
    }
}

impl EventSender {
    pub fn publish(&self, event: Event) {
        self.inner.deliver(&event)
    }

    pub fn publish_async(&self, event: Event) -> impl std::future::Future<Output = ()> {
        self.inner.publish_async(event)
    }
}

impl BusInner {
    fn deliver(&self, event: &Event) {
        // Handlers are cloned out so a subscriber can (un)subscribe from
        // within its own callback without deadlocking the registry.
        let handlers: Vec<EventHandler> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| s.tag.is_none() || s.tag == Some(event.tag()))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(tag = ?event.tag(), "event handler panicked; continuing delivery");
            }
        }
    }

    fn publish_async(self: &Arc<Self>, event: Event) -> impl std::future::Future<Output = ()> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let this = self.clone();
        let submitted = self.pool.submit(move || {
            this.deliver(&event);
            let _ = done_tx.send(());
        });
        async move {
            if submitted {
                let _ = done_rx.await;
            }
        }
    }
}
