use std::ops::Deref;
use std::sync::Arc;

use super::resource_pool::{Closeable, ResourcePool};

/// Checked-out pool resource. Dropping the lease marks the checkout as
/// finished, the same way `ResourcePool::release` does, but only on the
/// entry it was taken from: a lease that outlived an evict-and-reload of its
/// key leaves the replacement's checkout count alone.
pub struct PoolLease<'a, R: Closeable + 'static> {
    pool: &'a ResourcePool<R>,
    key: String,
    generation: u64,
    resource: Arc<R>,
}

impl<'a, R: Closeable + 'static> PoolLease<'a, R> {
    pub(crate) fn new(
        pool: &'a ResourcePool<R>,
        key: String,
        generation: u64,
        resource: Arc<R>,
    ) -> Self {
        Self {
            pool,
            key,
            generation,
            resource,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Shared handle that outlives the lease
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }
}

impl<R: Closeable + 'static> Deref for PoolLease<'_, R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<R: Closeable + 'static> Drop for PoolLease<'_, R> {
    fn drop(&mut self) {
        self.pool.release_generation(&self.key, self.generation);
    }
}
