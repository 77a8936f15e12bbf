//! Named resources with priority-ordered shared/exclusive locks.
//!
//! Deadlock avoidance is by construction, not detection: every task
//! acquires guards in strictly descending resource priority. A task that
//! holds nothing may take any resource; once it holds a guard, it may
//! only add resources of strictly lower priority. Violations fail fast
//! with [`LockError::OrderViolation`] instead of blocking.
//!
//! The manager is a session-scoped dependency: construct one per session
//! and pass handles down. There is no global singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourcePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for ResourcePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourcePriority::Low => "low",
            ResourcePriority::Normal => "normal",
            ResourcePriority::High => "high",
            ResourcePriority::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {resource}")]
    Timeout {
        resource: Arc<str>,
        waited: Duration,
    },
    #[error(
        "ordering violation: cannot take {acquiring} ({acquiring_priority}) while holding a \
         {held_priority} guard"
    )]
    OrderViolation {
        acquiring: Arc<str>,
        acquiring_priority: ResourcePriority,
        held_priority: ResourcePriority,
    },
    #[error("unknown resource id {0:?}")]
    UnknownResource(ResourceId),
    #[error("{name} already registered with priority {registered}, not {requested}")]
    PriorityMismatch {
        name: Arc<str>,
        registered: ResourcePriority,
        requested: ResourcePriority,
    },
}

#[derive(Debug)]
struct Resource {
    name: Arc<str>,
    priority: ResourcePriority,
    lock: Arc<tokio::sync::RwLock<()>>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

#[derive(Default)]
struct Registry {
    resources: Vec<Arc<Resource>>,
    by_name: HashMap<Arc<str>, ResourceId>,
}

/// Per-task record of currently held guard priorities. Cheap to clone;
/// clones share the record, so hand each independent task its own
/// `LockContext::new()`.
#[derive(Clone, Default)]
pub struct LockContext {
    held: Arc<Mutex<Vec<(ResourceId, ResourcePriority)>>>,
}

impl LockContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn min_held_priority(&self) -> Option<ResourcePriority> {
        self.held.lock().iter().map(|(_, p)| *p).min()
    }
}

#[derive(Debug)]
enum GuardInner {
    Shared(tokio::sync::OwnedRwLockReadGuard<()>),
    Exclusive(tokio::sync::OwnedRwLockWriteGuard<()>),
}

/// Scoped handle to one acquired resource. Releases on drop on all paths.
#[derive(Debug)]
pub struct LockGuard {
    resource: Arc<Resource>,
    id: ResourceId,
    mode: LockMode,
    held: Arc<Mutex<Vec<(ResourceId, ResourcePriority)>>>,
    _inner: GuardInner,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn resource_name(&self) -> &str {
        &self.resource.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.mode {
            LockMode::Shared => {
                self.resource.readers.fetch_sub(1, Ordering::Relaxed);
            }
            LockMode::Exclusive => {
                self.resource.writers.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let mut held = self.held.lock();
        if let Some(pos) = held.iter().rposition(|(id, _)| *id == self.id) {
            held.remove(pos);
        }
    }
}

#[derive(Default)]
pub struct LockManager {
    registry: RwLock<Registry>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named resource. Idempotent: a second registration of
    /// the same name returns the original id, provided the priority
    /// matches.
    pub fn register(
        &self,
        name: &str,
        priority: ResourcePriority,
    ) -> Result<ResourceId, LockError> {
        let mut reg = self.registry.write();
        if let Some(&id) = reg.by_name.get(name) {
            let registered = reg.resources[id.0].priority;
            if registered != priority {
                return Err(LockError::PriorityMismatch {
                    name: reg.resources[id.0].name.clone(),
                    registered,
                    requested: priority,
                });
            }
            return Ok(id);
        }
        let name: Arc<str> = name.into();
        let id = ResourceId(reg.resources.len());
        reg.resources.push(Arc::new(Resource {
            name: name.clone(),
            priority,
            lock: Arc::new(tokio::sync::RwLock::new(())),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        }));
        reg.by_name.insert(name, id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceId> {
        self.registry.read().by_name.get(name).copied()
    }

    fn resource(&self, id: ResourceId) -> Result<Arc<Resource>, LockError> {
        self.registry
            .read()
            .resources
            .get(id.0)
            .cloned()
            .ok_or(LockError::UnknownResource(id))
    }

    /// Acquires `id` in `mode`, waiting at most `timeout`.
    ///
    /// The ordering rule is checked before waiting: if the context holds
    /// any guard whose priority is not strictly greater than the
    /// requested resource's, the call fails immediately with
    /// `OrderViolation`.
    ///
    /// The underlying lock is FIFO: a queued writer blocks later readers,
    /// so writers do not starve.
    pub async fn acquire(
        &self,
        ctx: &LockContext,
        id: ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let resource = self.resource(id)?;

        if let Some(min_held) = ctx.min_held_priority() {
            if resource.priority >= min_held {
                return Err(LockError::OrderViolation {
                    acquiring: resource.name.clone(),
                    acquiring_priority: resource.priority,
                    held_priority: min_held,
                });
            }
        }

        let inner = match mode {
            LockMode::Shared => {
                let fut = resource.lock.clone().read_owned();
                match tokio::time::timeout(timeout, fut).await {
                    Ok(g) => GuardInner::Shared(g),
                    Err(_) => {
                        return Err(LockError::Timeout {
                            resource: resource.name.clone(),
                            waited: timeout,
                        })
                    }
                }
            }
            LockMode::Exclusive => {
                let fut = resource.lock.clone().write_owned();
                match tokio::time::timeout(timeout, fut).await {
                    Ok(g) => GuardInner::Exclusive(g),
                    Err(_) => {
                        return Err(LockError::Timeout {
                            resource: resource.name.clone(),
                            waited: timeout,
                        })
                    }
                }
            }
        };

        match mode {
            LockMode::Shared => resource.readers.fetch_add(1, Ordering::Relaxed),
            LockMode::Exclusive => resource.writers.fetch_add(1, Ordering::Relaxed),
        };
        trace!(resource = %resource.name, ?mode, "acquired");

        ctx.held.lock().push((id, resource.priority));
        Ok(LockGuard {
            resource,
            id,
            mode,
            held: ctx.held.clone(),
            _inner: inner,
        })
    }

    /// Human-readable snapshot of every resource and its current holders.
    pub fn dump_state(&self) -> String {
        use std::fmt::Write;
        let reg = self.registry.read();
        let mut out = String::new();
        for r in &reg.resources {
            let _ = writeln!(
                out,
                "{} priority={} readers={} writers={}",
                r.name,
                r.priority,
                r.readers.load(Ordering::Relaxed),
                r.writers.load(Ordering::Relaxed),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn register_is_idempotent_by_name() {
        let m = LockManager::new();
        let a = m.register("routing-table", ResourcePriority::Normal).unwrap();
        let b = m.register("routing-table", ResourcePriority::Normal).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            m.register("routing-table", ResourcePriority::High),
            Err(LockError::PriorityMismatch { .. })
        ));
        assert_eq!(m.lookup("routing-table"), Some(a));
        assert_eq!(m.lookup("nope"), None);
    }

    #[tokio::test]
    async fn shared_guards_coexist_exclusive_excludes() {
        let m = LockManager::new();
        let id = m.register("peers", ResourcePriority::Normal).unwrap();

        let ctx1 = LockContext::new();
        let ctx2 = LockContext::new();
        let g1 = m.acquire(&ctx1, id, LockMode::Shared, T).await.unwrap();
        let _g2 = m.acquire(&ctx2, id, LockMode::Shared, T).await.unwrap();

        let ctx3 = LockContext::new();
        let err = m
            .acquire(&ctx3, id, LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        drop(g1);
        drop(_g2);
        let _w = m.acquire(&ctx3, id, LockMode::Exclusive, T).await.unwrap();
    }

    #[tokio::test]
    async fn descending_priority_order_is_enforced() {
        let m = LockManager::new();
        let txns = m.register("transactions", ResourcePriority::High).unwrap();
        let table = m.register("routing-table", ResourcePriority::Normal).unwrap();
        let boot = m.register("bootstrap", ResourcePriority::Low).unwrap();

        let ctx = LockContext::new();
        let _g_txns = m.acquire(&ctx, txns, LockMode::Exclusive, T).await.unwrap();
        let _g_table = m.acquire(&ctx, table, LockMode::Shared, T).await.unwrap();
        let _g_boot = m.acquire(&ctx, boot, LockMode::Shared, T).await.unwrap();
    }

    #[tokio::test]
    async fn order_violation_fails_fast() {
        let m = LockManager::new();
        let high = m.register("transactions", ResourcePriority::High).unwrap();
        let normal = m.register("routing-table", ResourcePriority::Normal).unwrap();
        let normal2 = m.register("peers", ResourcePriority::Normal).unwrap();

        let ctx = LockContext::new();
        let _g = m.acquire(&ctx, normal, LockMode::Shared, T).await.unwrap();

        // Going back up is a bug, not a wait.
        let err = m.acquire(&ctx, high, LockMode::Shared, T).await.unwrap_err();
        assert!(matches!(err, LockError::OrderViolation { .. }));

        // Equal priority is rejected too; a strict order leaves no ties.
        let err = m
            .acquire(&ctx, normal2, LockMode::Shared, T)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::OrderViolation { .. }));
    }

    #[tokio::test]
    async fn order_violation_randomized() {
        let m = LockManager::new();
        let prios = [
            ResourcePriority::Low,
            ResourcePriority::Normal,
            ResourcePriority::High,
            ResourcePriority::Critical,
        ];
        let ids: Vec<_> = prios
            .iter()
            .enumerate()
            .map(|(i, &p)| m.register(&format!("r{i}"), p).unwrap())
            .collect();

        for first in 0..prios.len() {
            for second in 0..prios.len() {
                let ctx = LockContext::new();
                let _g = m
                    .acquire(&ctx, ids[first], LockMode::Shared, T)
                    .await
                    .unwrap();
                let res = m.acquire(&ctx, ids[second], LockMode::Shared, T).await;
                if prios[second] < prios[first] {
                    assert!(res.is_ok(), "{first}->{second} should be allowed");
                } else {
                    assert!(
                        matches!(res, Err(LockError::OrderViolation { .. })),
                        "{first}->{second} should violate"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn guard_release_unblocks_on_all_paths() {
        let m = Arc::new(LockManager::new());
        let id = m.register("table", ResourcePriority::Normal).unwrap();

        {
            let ctx = LockContext::new();
            let _g = m.acquire(&ctx, id, LockMode::Exclusive, T).await.unwrap();
            // dropped at scope end
        }

        let ctx = LockContext::new();
        let _g = m.acquire(&ctx, id, LockMode::Exclusive, T).await.unwrap();
        assert_eq!(ctx.min_held_priority(), Some(ResourcePriority::Normal));
        drop(_g);
        assert_eq!(ctx.min_held_priority(), None);
    }

    #[tokio::test]
    async fn writers_do_not_starve() {
        let m = Arc::new(LockManager::new());
        let id = m.register("table", ResourcePriority::Normal).unwrap();

        let reader_ctx = LockContext::new();
        let g = m
            .acquire(&reader_ctx, id, LockMode::Shared, T)
            .await
            .unwrap();

        let writer = {
            let m = m.clone();
            tokio::spawn(async move {
                let ctx = LockContext::new();
                m.acquire(&ctx, id, LockMode::Exclusive, Duration::from_secs(5))
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A new reader queues behind the waiting writer instead of
        // overtaking it.
        let late_ctx = LockContext::new();
        let late = m
            .acquire(&late_ctx, id, LockMode::Shared, Duration::from_millis(50))
            .await;
        assert!(matches!(late, Err(LockError::Timeout { .. })));

        drop(g);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dump_state_lists_resources() {
        let m = LockManager::new();
        let id = m.register("tokens", ResourcePriority::High).unwrap();
        let ctx = LockContext::new();
        let _g = m.acquire(&ctx, id, LockMode::Exclusive, T).await.unwrap();
        let dump = m.dump_state();
        assert!(dump.contains("tokens"));
        assert!(dump.contains("writers=1"));
    }
}
