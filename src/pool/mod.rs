//! Bounded, blocking pool of reusable resources.
//!
//! The pool does not know what it holds. A [`ResourceFactory`] creates,
//! validates and destroys resources and gets a hook on every borrow and
//! return. A borrowed resource comes back as a [`Pooled`] guard that returns
//! itself to the pool when dropped, so a resource is never lent to two
//! callers at once.

pub mod factory;

use crate::error::{Error, PoolOp, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

pub use factory::{ClientFactory, ClientPool, ShardedClientFactory, ShardedClientPool};

/// Lifecycle of the resources in a [`Pool`].
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    fn create(&self) -> Result<Self::Resource>;

    fn destroy(&self, resource: Self::Resource) -> Result<()>;

    /// Cheap liveness check, used when `test_on_borrow` / `test_on_return`
    /// are enabled.
    fn validate(&self, resource: &mut Self::Resource) -> bool;

    /// Runs before a resource is handed out.
    fn on_borrow(&self, _resource: &mut Self::Resource) -> Result<()> {
        Ok(())
    }

    /// Runs before a healthy resource goes back to the idle set.
    fn on_return(&self, _resource: &mut Self::Resource) -> Result<()> {
        Ok(())
    }

    /// A broken resource is destroyed instead of recycled, whichever way it
    /// is returned.
    fn is_broken(&self, _resource: &Self::Resource) -> bool {
        false
    }
}

/// Pool policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Most resources alive at once, idle and borrowed together.
    pub max_total: usize,
    /// Most idle resources kept; extras are destroyed on return.
    pub max_idle: usize,
    /// Wait for a resource when the pool is at `max_total` instead of failing.
    pub block_when_exhausted: bool,
    /// Upper bound on that wait. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    /// Hand out the most recently returned resource first.
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            block_when_exhausted: true,
            max_wait_ms: None,
            test_on_borrow: false,
            test_on_return: false,
            lifo: true,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}

struct PoolState<R> {
    idle: VecDeque<R>,
    /// Borrowed resources plus slots reserved for resources being created.
    active: usize,
    closed: bool,
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Resource>>,
    available: Condvar,
}

enum Slot<R> {
    Idle(R),
    Create,
}

/// Thread-safe handle to a pool. Cloning is cheap and clones share the pool.
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("active", &state.active)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<F: ResourceFactory> Pool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a resource, reusing an idle one or creating a new one while
    /// under `max_total`. At capacity this waits or fails according to the
    /// pool config.
    pub fn borrow(&self) -> Result<Pooled<F>> {
        self.try_borrow()
            .map(|resource| Pooled {
                pool: self.clone(),
                resource: Some(resource),
            })
            .map_err(|e| Error::pool(PoolOp::Borrow, e))
    }

    fn try_borrow(&self) -> Result<F::Resource> {
        let deadline = self.inner.config.max_wait().map(|wait| Instant::now() + wait);
        loop {
            match self.acquire_slot(deadline)? {
                Slot::Idle(mut resource) => match self.activate(&mut resource) {
                    Ok(()) => {
                        trace!("Borrowed idle resource");
                        return Ok(resource);
                    }
                    Err(e) => {
                        // Stale idle resource: drop it and try the next one.
                        warn!(error = %e, "Idle resource failed activation, destroying");
                        if let Err(e) = self.discard(resource) {
                            warn!(error = %e, "Failed to destroy resource");
                        }
                    }
                },
                Slot::Create => {
                    let mut resource = match self.inner.factory.create() {
                        Ok(resource) => resource,
                        Err(e) => {
                            self.release_slot();
                            return Err(e);
                        }
                    };
                    if let Err(e) = self.activate(&mut resource) {
                        if let Err(destroy_err) = self.discard(resource) {
                            warn!(error = %destroy_err, "Failed to destroy resource");
                        }
                        return Err(e);
                    }
                    trace!("Borrowed new resource");
                    return Ok(resource);
                }
            }
        }
    }

    fn acquire_slot(&self, deadline: Option<Instant>) -> Result<Slot<F::Resource>> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        let mut timed_out = false;
        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }

            let idle = if config.lifo {
                state.idle.pop_back()
            } else {
                state.idle.pop_front()
            };
            if let Some(resource) = idle {
                state.active += 1;
                return Ok(Slot::Idle(resource));
            }

            if state.active + state.idle.len() < config.max_total {
                state.active += 1;
                return Ok(Slot::Create);
            }

            if !config.block_when_exhausted {
                return Err(Error::PoolExhausted);
            }
            if timed_out {
                return Err(Error::PoolTimeout(config.max_wait().unwrap_or_default()));
            }

            trace!(active = state.active, "Pool exhausted, waiting");
            match deadline {
                Some(deadline) => {
                    timed_out = self.inner.available.wait_until(&mut state, deadline).timed_out();
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }

    fn activate(&self, resource: &mut F::Resource) -> Result<()> {
        let factory = &self.inner.factory;
        factory.on_borrow(resource)?;
        if self.inner.config.test_on_borrow && !factory.validate(resource) {
            return Err(Error::Validation);
        }
        Ok(())
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Destroy a borrowed resource and free its slot.
    fn discard(&self, resource: F::Resource) -> Result<()> {
        let result = self.inner.factory.destroy(resource);
        self.release_slot();
        trace!("Destroyed resource");
        result
    }

    /// Give a healthy resource back. Resources over `max_idle`, or returned
    /// after the pool closed, are destroyed.
    fn checkin(&self, mut resource: F::Resource) -> Result<()> {
        let factory = &self.inner.factory;
        if factory.is_broken(&resource) {
            warn!("Broken resource returned as healthy, destroying");
            return self.discard(resource);
        }
        if let Err(e) = factory.on_return(&mut resource) {
            if let Err(destroy_err) = self.discard(resource) {
                warn!(error = %destroy_err, "Failed to destroy resource");
            }
            return Err(e);
        }
        if self.inner.config.test_on_return && !factory.validate(&mut resource) {
            self.discard(resource)?;
            return Err(Error::Validation);
        }

        let mut state = self.inner.state.lock();
        if state.closed || state.idle.len() >= self.inner.config.max_idle {
            drop(state);
            return self.discard(resource);
        }
        state.active = state.active.saturating_sub(1);
        state.idle.push_back(resource);
        drop(state);
        self.inner.available.notify_one();
        trace!("Returned resource to idle set");
        Ok(())
    }

    /// Return a borrowed resource for reuse.
    pub fn return_healthy(&self, mut pooled: Pooled<F>) -> Result<()> {
        let resource = self.take_from(&mut pooled)?;
        self.checkin(resource)
            .map_err(|e| Error::pool(PoolOp::ReturnHealthy, e))
    }

    /// Return a resource that must not be reused. It is always destroyed.
    pub fn return_broken(&self, mut pooled: Pooled<F>) -> Result<()> {
        let resource = self.take_from(&mut pooled)?;
        self.discard(resource)
            .map_err(|e| Error::pool(PoolOp::ReturnBroken, e))
    }

    fn take_from(&self, pooled: &mut Pooled<F>) -> Result<F::Resource> {
        if !Arc::ptr_eq(&self.inner, &pooled.pool.inner) {
            return Err(Error::InvalidArgument(
                "resource was borrowed from a different pool".to_string(),
            ));
        }
        pooled.resource.take().ok_or_else(|| {
            Error::InvalidArgument("resource was already returned".to_string())
        })
    }

    /// Close the pool and destroy idle resources. Borrowed resources are
    /// destroyed as they come back. Waiting borrowers fail with
    /// [`Error::PoolClosed`]. Calling this twice is harmless.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_all();

        let mut first_err = None;
        for resource in idle {
            if let Err(e) = self.inner.factory.destroy(resource) {
                warn!(error = %e, "Failed to destroy idle resource");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(Error::pool(PoolOp::Destroy, e)),
            None => Ok(()),
        }
    }

    pub fn destroy(&self) -> Result<()> {
        self.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Resources currently borrowed.
    pub fn num_active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn num_idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }
}

/// A borrowed resource. Dropping it returns the resource to the pool, or
/// destroys it if the factory reports it broken.
pub struct Pooled<F: ResourceFactory> {
    pool: Pool<F>,
    resource: Option<F::Resource>,
}

impl<F: ResourceFactory> Pooled<F> {
    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }
}

impl<F: ResourceFactory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("returned", &self.resource.is_none())
            .finish()
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().unwrap()
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().unwrap()
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let result = if self.pool.inner.factory.is_broken(&resource) {
                self.pool.discard(resource)
            } else {
                self.pool.checkin(resource)
            };
            if let Err(e) = result {
                warn!(error = %e, "Failed to return pooled resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct Widget {
        id: usize,
        broken: bool,
        in_use: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct WidgetFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_create: AtomicBool,
        reject_all: AtomicBool,
    }

    impl ResourceFactory for Arc<WidgetFactory> {
        type Resource = Widget;

        fn create(&self) -> Result<Widget> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed("refused".to_string()));
            }
            Ok(Widget {
                id: self.created.fetch_add(1, Ordering::SeqCst),
                broken: false,
                in_use: Arc::new(AtomicBool::new(false)),
            })
        }

        fn destroy(&self, _widget: Widget) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate(&self, widget: &mut Widget) -> bool {
            !widget.broken && !self.reject_all.load(Ordering::SeqCst)
        }

        fn is_broken(&self, widget: &Widget) -> bool {
            widget.broken
        }
    }

    fn pool_with(config: PoolConfig) -> (Pool<Arc<WidgetFactory>>, Arc<WidgetFactory>) {
        let factory = Arc::new(WidgetFactory::default());
        (Pool::new(factory.clone(), config), factory)
    }

    fn config(max_total: usize) -> PoolConfig {
        PoolConfig {
            max_total,
            max_idle: max_total,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn borrows_up_to_capacity_then_fails_fast() {
        let (pool, _) = pool_with(PoolConfig {
            block_when_exhausted: false,
            ..config(2)
        });
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.num_active(), 2);

        let err = pool.borrow().unwrap_err();
        assert!(err.is_connection_error());
        assert!(err.to_string().starts_with("Could not get a resource from the pool"));
        assert!(matches!(
            err,
            Error::Pool { op: PoolOp::Borrow, ref source } if matches!(**source, Error::PoolExhausted)
        ));
    }

    #[test]
    fn blocking_borrow_times_out() {
        let (pool, _) = pool_with(PoolConfig {
            max_wait_ms: Some(50),
            ..config(1)
        });
        let _held = pool.borrow().unwrap();
        let started = Instant::now();
        let err = pool.borrow().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err,
            Error::Pool { ref source, .. } if matches!(**source, Error::PoolTimeout(_))
        ));
    }

    #[test]
    fn blocked_borrower_wakes_on_return() {
        let (pool, _) = pool_with(config(1));
        let held = pool.borrow().unwrap();
        let held_id = held.id;

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow().map(|w| w.id))
        };
        thread::sleep(Duration::from_millis(50));
        pool.return_healthy(held).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), held_id);
    }

    #[test]
    fn healthy_resources_are_recycled() {
        let (pool, factory) = pool_with(config(2));
        let first = pool.borrow().unwrap();
        let id = first.id;
        pool.return_healthy(first).unwrap();
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_active(), 0);

        let again = pool.borrow().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broken_resources_are_never_recycled() {
        let (pool, factory) = pool_with(config(2));
        let first = pool.borrow().unwrap();
        let id = first.id;
        pool.return_broken(first).unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let next = pool.borrow().unwrap();
        assert_ne!(next.id, id);
    }

    #[test]
    fn dropping_guard_returns_or_destroys() {
        let (pool, factory) = pool_with(config(2));
        {
            let _w = pool.borrow().unwrap();
        }
        assert_eq!(pool.num_idle(), 1);

        {
            let mut w = pool.borrow().unwrap();
            w.broken = true;
        }
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_borrow_replaces_invalid_idle_resource() {
        let (pool, factory) = pool_with(PoolConfig {
            test_on_borrow: true,
            ..config(2)
        });
        let first = pool.borrow().unwrap();
        let id = first.id;
        drop(first);

        factory.reject_all.store(true, Ordering::SeqCst);
        assert!(pool.borrow().is_err());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);

        factory.reject_all.store(false, Ordering::SeqCst);
        let next = pool.borrow().unwrap();
        assert_ne!(next.id, id);
    }

    #[test]
    fn create_failure_frees_the_slot() {
        let (pool, factory) = pool_with(config(1));
        factory.fail_create.store(true, Ordering::SeqCst);
        let err = pool.borrow().unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(pool.num_active(), 0);

        factory.fail_create.store(false, Ordering::SeqCst);
        pool.borrow().unwrap();
    }

    #[test]
    fn max_idle_caps_the_idle_set() {
        let (pool, factory) = pool_with(PoolConfig {
            max_total: 3,
            max_idle: 1,
            ..PoolConfig::default()
        });
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fifo_order_when_not_lifo() {
        let (pool, _) = pool_with(PoolConfig {
            lifo: false,
            ..config(2)
        });
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        let first_returned = a.id;
        drop(a);
        drop(b);
        assert_eq!(pool.borrow().unwrap().id, first_returned);

        let (pool, _) = pool_with(config(2));
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        let last_returned = b.id;
        drop(a);
        drop(b);
        assert_eq!(pool.borrow().unwrap().id, last_returned);
    }

    #[test]
    fn close_is_idempotent_and_rejects_borrowers() {
        let (pool, factory) = pool_with(config(2));
        let held = pool.borrow().unwrap();
        drop(pool.borrow().unwrap());
        assert_eq!(pool.num_idle(), 1);

        pool.close().unwrap();
        pool.close().unwrap();
        assert!(pool.is_closed());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let err = pool.borrow().unwrap_err();
        assert!(matches!(
            err,
            Error::Pool { ref source, .. } if matches!(**source, Error::PoolClosed)
        ));

        // Outstanding resources are destroyed when they come back.
        pool.return_healthy(held).unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_resource_from_another_pool() {
        let (pool_a, _) = pool_with(config(1));
        let (pool_b, _) = pool_with(config(1));
        let w = pool_a.borrow().unwrap();
        assert!(matches!(
            pool_b.return_healthy(w),
            Err(Error::InvalidArgument(_))
        ));
        // The guard went back to its own pool on drop.
        assert_eq!(pool_a.num_idle(), 1);
    }

    #[test]
    fn never_lends_one_resource_twice() {
        let (pool, _) = pool_with(config(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let w = pool.borrow().unwrap();
                        assert!(!w.in_use.swap(true, Ordering::SeqCst));
                        thread::yield_now();
                        w.in_use.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.num_idle() <= 3);
        assert_eq!(pool.num_active(), 0);
    }
}
