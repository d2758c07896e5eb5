// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use crate::entry::Entry;

/// Shared accumulation buffer. The lock only ever covers the vector mutation.
#[derive(Debug)]
pub struct IngestBuffer {
    entries: Mutex<Vec<Arc<Entry>>>,
    capacity: usize,
}

impl IngestBuffer {
    pub fn new(capacity: usize) -> Self {
        IngestBuffer {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends entries. Once the buffer reaches its capacity its content is taken and
    /// returned so the caller can force a flush.
    pub fn push(&self, entries: Vec<Arc<Entry>>) -> Option<Vec<Arc<Entry>>> {
        #[allow(clippy::expect_used)]
        let mut buffered = self.entries.lock().expect("lock poisoned");
        buffered.extend(entries);
        if buffered.len() >= self.capacity {
            return Some(std::mem::take(&mut *buffered));
        }
        None
    }

    /// Takes everything buffered so far.
    pub fn take(&self) -> Vec<Arc<Entry>> {
        #[allow(clippy::expect_used)]
        let mut buffered = self.entries.lock().expect("lock poisoned");
        std::mem::take(&mut *buffered)
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
