// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::config::JournalConfig;

/// Additive-increase/additive-decrease flush cadence, driven by the number of batches
/// dispatched but not yet completed. Owned by the controller task only.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushControl {
    interval: Duration,
    floor: Duration,
    step: Duration,
    high_watermark: usize,
    low_watermark: usize,
    pending: usize,
}

impl FlushControl {
    pub fn new(config: &JournalConfig) -> Self {
        let floor = config.flush_interval.max(Duration::from_millis(1));
        FlushControl {
            interval: floor,
            floor,
            step: config.flush_interval_step,
            high_watermark: config.pool_high_watermark,
            low_watermark: config.pool_low_watermark,
            pending: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn dispatched(&mut self) {
        self.pending += 1;
    }

    pub fn completed(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Moves the interval one step according to the current backlog.
    /// Returns whether it changed.
    pub fn adjust(&mut self) -> bool {
        if self.pending > self.high_watermark {
            self.interval += self.step;
            return true;
        }
        if self.pending < self.low_watermark && self.interval > self.floor {
            self.interval = self.interval.saturating_sub(self.step).max(self.floor);
            return true;
        }
        false
    }
}
