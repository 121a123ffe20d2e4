//! Thread-safe wrapper around [`HandleTable`].
//!
//! Issuing a handle takes the write lock, so handles come out strictly
//! increasing and never twice. Lookups share the read lock; the tree is only
//! `log_F(n)` levels deep, so they hold it briefly.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::{Config, HandleId, HandleTable, Handled, TableStats, WireHandle};

/// A [`HandleTable`] behind a reader/writer lock.
pub struct SharedHandleTable<T> {
    inner: RwLock<HandleTable<T>>,
}

impl<T> SharedHandleTable<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HandleTable::new()),
        }
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(HandleTable::with_config(config)?),
        })
    }

    /// See [`HandleTable::insert`].
    pub fn insert(&self, object: Arc<T>) -> Result<HandleId> {
        self.inner.write().insert(object)
    }

    /// See [`HandleTable::assign`].
    ///
    /// The cached-handle check happens under the write lock, so two threads
    /// assigning the same object agree on its handle.
    pub fn assign(&self, object: &Arc<T>) -> Result<HandleId>
    where
        T: Handled,
    {
        self.inner.write().assign(object)
    }

    pub fn lookup(&self, handle: HandleId) -> Result<Arc<T>> {
        self.inner.read().lookup(handle)
    }

    pub fn get(&self, handle: HandleId) -> Option<Arc<T>> {
        self.inner.read().get(handle).cloned()
    }

    pub fn lookup_wire(&self, wire: WireHandle<'_>) -> Result<Arc<T>> {
        self.inner.read().lookup_wire(wire)
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.inner.read().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.inner.read().stats()
    }

    /// Snapshot of every issued handle and its object, in ascending order.
    pub fn entries(&self) -> Vec<(HandleId, Arc<T>)> {
        self.inner
            .read()
            .iter()
            .map(|(handle, object)| (handle, Arc::clone(object)))
            .collect()
    }

    pub fn into_inner(self) -> HandleTable<T> {
        self.inner.into_inner()
    }
}

impl<T> Default for SharedHandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<HandleTable<T>> for SharedHandleTable<T> {
    fn from(table: HandleTable<T>) -> Self {
        Self {
            inner: RwLock::new(table),
        }
    }
}
