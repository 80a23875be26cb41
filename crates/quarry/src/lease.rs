//! Reference-counted leases around shared resources.
//!
//! A [`ConnectionLease`] opens its resource on the first acquire, hands out
//! [`Lease`] guards, and closes the resource when the last guard is dropped.
//! The next acquire after that opens a fresh generation.

use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct LeaseState<R> {
    resource: Option<R>,
    count: usize,
}

/// Shared resource with open-on-first-use, close-on-last-release semantics.
pub struct ConnectionLease<R> {
    /// Current resource and holder count; open and close happen under it.
    state: Mutex<LeaseState<R>>,
    close: Box<dyn Fn(R) + Send + Sync>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl<R: Clone> fmt::Debug for ConnectionLease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("count", &self.count())
            .field("opened", &self.opened_count())
            .field("closed", &self.closed_count())
            .finish()
    }
}

impl<R: Clone> ConnectionLease<R> {
    /// Create a lease that physically closes resources with `close`.
    pub fn new(close: impl Fn(R) + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(LeaseState {
                resource: None,
                count: 0,
            }),
            close: Box::new(close),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Acquire a guard, opening the resource with `open` if nobody holds it.
    ///
    /// `open` runs under the lease's lock, so concurrent first acquires open
    /// exactly once. If it fails, the lease stays closed.
    pub fn acquire<E>(self: &Arc<Self>, open: impl FnOnce() -> Result<R, E>) -> Result<Lease<R>, E> {
        let mut state = self.state.lock();
        let resource = match &state.resource {
            Some(resource) => resource.clone(),
            None => {
                let resource = open()?;
                self.opened.fetch_add(1, Ordering::AcqRel);
                state.resource = Some(resource.clone());
                resource
            }
        };
        state.count += 1;
        Ok(Lease {
            owner: Arc::clone(self),
            resource,
        })
    }

    /// Number of guards currently held.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().resource.is_some()
    }

    /// How many times the resource was physically opened.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// How many times the resource was physically closed.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    /// Release one holder (called by Lease::drop).
    fn release(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            if let Some(resource) = state.resource.take() {
                (self.close)(resource);
                self.closed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

/// RAII guard for a leased resource. Releases the lease when dropped.
pub struct Lease<R: Clone> {
    owner: Arc<ConnectionLease<R>>,
    resource: R,
}

impl<R: Clone> Lease<R> {
    pub fn resource(&self) -> &R {
        &self.resource
    }
}

impl<R: Clone> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R: Clone> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("owner", &self.owner).finish()
    }
}

impl<R: Clone> Drop for Lease<R> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn counting_lease() -> Arc<ConnectionLease<u32>> {
        Arc::new(ConnectionLease::new(|_| {}))
    }

    #[test]
    fn test_open_once_close_once() {
        let lease = counting_lease();

        let a = lease.acquire(|| Ok::<_, ()>(7)).unwrap();
        let b = lease.acquire(|| Ok::<_, ()>(8)).unwrap();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
        assert_eq!(lease.count(), 2);

        drop(a);
        assert!(lease.is_open());
        assert_eq!(lease.closed_count(), 0);

        drop(b);
        assert!(!lease.is_open());
        assert_eq!(lease.opened_count(), 1);
        assert_eq!(lease.closed_count(), 1);
    }

    #[test]
    fn test_reopen_after_zero() {
        let lease = counting_lease();

        drop(lease.acquire(|| Ok::<_, ()>(1)).unwrap());
        let again = lease.acquire(|| Ok::<_, ()>(2)).unwrap();

        assert_eq!(*again, 2);
        assert_eq!(lease.opened_count(), 2);
        assert_eq!(lease.closed_count(), 1);
    }

    #[test]
    fn test_failed_open_leaves_lease_closed() {
        let lease = counting_lease();

        let err = lease.acquire(|| Err::<u32, _>("refused")).unwrap_err();
        assert_eq!(err, "refused");
        assert_eq!(lease.count(), 0);
        assert_eq!(lease.opened_count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let lease = counting_lease();
        let threads = 8;
        let barrier = Barrier::new(threads);

        // Hold a guard across the race so the count never reaches zero
        let anchor = lease.acquire(|| Ok::<_, ()>(1)).unwrap();
        std::thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..100 {
                        let guard = lease.acquire(|| Ok::<_, ()>(2)).unwrap();
                        assert_eq!(*guard, 1);
                    }
                });
            }
        });
        drop(anchor);

        assert_eq!(lease.opened_count(), 1);
        assert_eq!(lease.closed_count(), 1);
    }

    #[test]
    fn test_opens_match_closes_under_contention() {
        let lease = counting_lease();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for i in 0..200 {
                        let _guard = lease.acquire(|| Ok::<_, ()>(i)).unwrap();
                    }
                });
            }
        });

        assert_eq!(lease.count(), 0);
        assert!(!lease.is_open());
        assert_eq!(lease.opened_count(), lease.closed_count());
    }
}
