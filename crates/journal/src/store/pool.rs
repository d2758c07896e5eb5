// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use super::Connector;

/// Fixed set of connectors with non-blocking borrow.
#[derive(Clone, Default)]
pub struct ConnectorPool {
    idle: Arc<Mutex<Vec<Arc<dyn Connector>>>>,
    size: usize,
}

impl ConnectorPool {
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        let size = connectors.len();
        ConnectorPool {
            idle: Arc::new(Mutex::new(connectors)),
            size,
        }
    }

    /// A pool without connectors: every borrow fails and callers stay on the cache.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Borrows an idle connector, or returns `None` right away when all are in use.
    /// The connector goes back to the pool when the guard is dropped.
    pub fn try_get(&self) -> Option<PooledConnector> {
        #[allow(clippy::expect_used)]
        let connector = self.idle.lock().expect("lock poisoned").pop()?;
        Some(PooledConnector {
            connector,
            idle: Arc::clone(&self.idle),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.idle.lock().expect("lock poisoned").len()
    }
}

pub struct PooledConnector {
    connector: Arc<dyn Connector>,
    idle: Arc<Mutex<Vec<Arc<dyn Connector>>>>,
}

impl Deref for PooledConnector {
    type Target = dyn Connector;

    fn deref(&self) -> &Self::Target {
        self.connector.as_ref()
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(Arc::clone(&self.connector));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryConnector;

    #[test]
    fn test_borrow_never_blocks() {
        let pool = ConnectorPool::new(vec![Arc::new(MemoryConnector::new())]);
        assert_eq!(pool.size(), 1);

        let first = pool.try_get().expect("one idle connector");
        assert!(pool.try_get().is_none());
        assert_eq!(pool.idle(), 0);

        drop(first);
        assert_eq!(pool.idle(), 1);
        assert!(pool.try_get().is_some());
    }

    #[test]
    fn test_empty_pool() {
        let pool = ConnectorPool::empty();
        assert_eq!(pool.size(), 0);
        assert!(pool.try_get().is_none());
    }
}
