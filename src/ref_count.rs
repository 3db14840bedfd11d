#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// A resource whose lifetime is governed by an explicit reference count.
///
/// A freshly created resource holds one reference, owned by its creator. Every call to
/// [`retain`](ReferenceCounted::retain) must be paired with exactly one call to
/// [`release`](ReferenceCounted::release); the release that brings the count to zero runs the
/// resource's teardown (closing a connection, closing an owned session, releasing a wrapped
/// binding) exactly once. Retaining a resource whose count already reached zero, or releasing it
/// more often than it was retained, returns an
/// [`ErrorKind::ResourceLifecycle`](crate::error::ErrorKind::ResourceLifecycle) error.
pub trait ReferenceCounted: Send + Sync {
    /// The number of outstanding references.
    fn count(&self) -> usize;

    /// Adds a reference.
    fn retain(&self) -> Result<()>;

    /// Drops a reference, tearing the resource down if it was the last one.
    ///
    /// An error returned from the teardown itself is reported here, after the count has already
    /// reached zero; the resource is considered released either way.
    fn release(&self) -> Result<()>;
}

/// An atomic reference count with an exactly-once teardown latch.
#[derive(Debug)]
pub(crate) struct RefCount {
    name: &'static str,
    count: AtomicUsize,
    torn_down: AtomicBool,
}

impl RefCount {
    /// Creates a count holding the creator's single reference.
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicUsize::new(1),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether the count has reached zero.
    pub(crate) fn is_released(&self) -> bool {
        self.get() == 0
    }

    /// Fails with a lifecycle error if the count already reached zero.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::lifecycle(format!(
                "{} used after its reference count reached zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Increments the count, returning the new value.
    pub(crate) fn retain(&self) -> Result<usize> {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count > 0).then(|| count + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| {
                Error::lifecycle(format!(
                    "attempted to retain a {} whose reference count already reached zero",
                    self.name
                ))
            })
    }

    /// Decrements the count. Returns `true` for exactly one caller: the one whose release
    /// brought the count to zero.
    pub(crate) fn release(&self) -> Result<bool> {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| {
                Error::lifecycle(format!(
                    "attempted to decrement the reference count of a {} below 0",
                    self.name
                ))
            })?;

        if previous != 1 {
            return Ok(false);
        }

        Ok(self
            .torn_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Decrements the count and runs `teardown` if this release was the last one.
    pub(crate) fn release_then(&self, teardown: impl FnOnce() -> Result<()>) -> Result<()> {
        if self.release()? {
            teardown()?;
        }
        Ok(())
    }
}
