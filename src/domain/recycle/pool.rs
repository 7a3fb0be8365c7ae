use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::domain::recycle::{Recyclable, RecycleError};
use crate::domain::utils::sync::{lock, read, write};

const DEFAULT_MAX_IDLE: usize = 4096;

struct Slot<T> {
    refs: AtomicUsize,
    value: RwLock<T>,
    home: Weak<PoolInner<T>>,
}

struct PoolInner<T> {
    shape: String,
    free: Mutex<Vec<Arc<Slot<T>>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max_idle: usize,
    created: AtomicU64,
    reused: AtomicU64,
    reclaimed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub reclaimed: u64,
    pub idle: usize,
}

/// A pool of recyclable objects of one shape.
///
/// Cloning the pool clones the handle; all clones share one free list.
pub struct RecyclePool<T: Recyclable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Recyclable> Clone for RecyclePool<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Recyclable> fmt::Debug for RecyclePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecyclePool").field("shape", &self.inner.shape).field("stats", &self.stats()).finish()
    }
}

impl<T: Recyclable> RecyclePool<T> {
    pub fn new(shape: impl Into<String>, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_max_idle(shape, DEFAULT_MAX_IDLE, factory)
    }

    /// Objects released while `max_idle` instances are already waiting are
    /// dropped instead of kept.
    pub fn with_max_idle(shape: impl Into<String>, max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let inner = PoolInner {
            shape: shape.into(),
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            max_idle,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn shape(&self) -> &str {
        &self.inner.shape
    }

    /// Returns a recycled instance if one is idle, else a fresh one. The
    /// caller holds the single reference.
    pub fn acquire(&self) -> Pooled<T> {
        let recycled = lock(&self.inner.free).pop();

        let slot = match recycled {
            Some(slot) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                slot.refs.store(1, Ordering::Release);
                slot
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(Slot { refs: AtomicUsize::new(1), value: RwLock::new((self.inner.factory)()), home: Arc::downgrade(&self.inner) })
            }
        };

        Pooled { slot }
    }

    pub fn share(&self, item: &Pooled<T>, n: usize) -> Result<(), RecycleError> {
        item.share(n)
    }

    pub fn release(&self, item: &Pooled<T>, n: usize) -> Result<bool, RecycleError> {
        item.release(n)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            reclaimed: self.inner.reclaimed.load(Ordering::Relaxed),
            idle: lock(&self.inner.free).len(),
        }
    }
}

impl<T> PoolInner<T> {
    fn reclaim(&self, slot: Arc<Slot<T>>) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        let mut free = lock(&self.free);
        if free.len() < self.max_idle {
            free.push(slot);
        }
    }
}

/// Handle to a pooled object.
///
/// Cloning a handle does not touch the reference count; the count tracks
/// logical holders and is driven only by [`share`](Pooled::share) and
/// [`release`](Pooled::release).
pub struct Pooled<T: Recyclable> {
    slot: Arc<Slot<T>>,
}

impl<T: Recyclable> Clone for Pooled<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T: Recyclable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("refs", &self.ref_count()).field("value", &*self.read()).finish()
    }
}

impl<T: Recyclable> Pooled<T> {
    /// Adds `n` holders. Fails if the object already went back to its pool.
    pub fn share(&self, n: usize) -> Result<(), RecycleError> {
        self.slot
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| if held == 0 { None } else { held.checked_add(n) })
            .map(|_| ())
            .map_err(|_| RecycleError::Reclaimed { shape: self.shape() })
    }

    /// Removes `n` holders. Returns `true` if this call returned the object to
    /// its pool.
    pub fn release(&self, n: usize) -> Result<bool, RecycleError> {
        let previous = self
            .slot
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(n))
            .map_err(|held| RecycleError::Underflow { shape: self.shape(), requested: n, held })?;

        if previous != n || n == 0 {
            return Ok(false);
        }

        write(&self.slot.value).recycle();
        match self.slot.home.upgrade() {
            Some(home) => home.reclaim(self.slot.clone()),
            None => log::trace!("Pool dropped before object was released; discarding it"),
        }
        Ok(true)
    }

    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        read(&self.slot.value)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        write(&self.slot.value)
    }

    /// True if both handles point at the same pooled storage.
    pub fn ptr_eq(&self, other: &Pooled<T>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    fn shape(&self) -> String {
        self.slot.home.upgrade().map(|home| home.shape.clone()).unwrap_or_default()
    }
}
