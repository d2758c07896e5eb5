// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_MAX_ENTRIES_LIMIT: usize = 1000;
pub const DEFAULT_CACHE_ENTRY_LIMIT: usize = 1000;
pub const DEFAULT_CACHE_VALUES_LIMIT: usize = 1000;
pub const MAX_DATABASE_CONNECTIONS: usize = 10;

pub const DEFAULT_BUFFER_CAPACITY: usize = 150 << 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_FLUSH_INTERVAL_STEP: Duration = Duration::from_millis(100);
pub const DEFAULT_POOL_HIGH_WATERMARK: usize = 10;
pub const DEFAULT_POOL_LOW_WATERMARK: usize = 5;
pub const DEFAULT_DISPATCH_CAPACITY: usize = 1 << 7;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1 << 12;
pub const DEFAULT_LIVE_PUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_WARM_UP_ROWS: usize = 50;

/// Tunables shared by the ingest service, the cache and the read path.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Upper bound for any query's `Limit`.
    pub max_entries_limit: usize,
    /// Ring capacity per environment.
    pub cache_entry_limit: usize,
    /// Distinct values remembered per tag key, also the `TagsInit` sample size.
    pub cache_values_limit: usize,

    pub database_address: Option<String>,
    pub database_connections: usize,
    pub database_user: Option<String>,
    pub database_password: Option<String>,
    pub database_timeout: Duration,

    pub buffer_capacity: usize,
    /// Floor of the adaptive flush interval, also its starting value.
    pub flush_interval: Duration,
    pub flush_interval_step: Duration,
    pub pool_high_watermark: usize,
    pub pool_low_watermark: usize,
    pub dispatch_capacity: usize,

    pub subscriber_capacity: usize,
    pub live_push_interval: Duration,
    pub warm_up_rows: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            max_entries_limit: DEFAULT_MAX_ENTRIES_LIMIT,
            cache_entry_limit: DEFAULT_CACHE_ENTRY_LIMIT,
            cache_values_limit: DEFAULT_CACHE_VALUES_LIMIT,
            database_address: None,
            database_connections: 1,
            database_user: None,
            database_password: None,
            database_timeout: Duration::from_secs(30),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_interval_step: DEFAULT_FLUSH_INTERVAL_STEP,
            pool_high_watermark: DEFAULT_POOL_HIGH_WATERMARK,
            pool_low_watermark: DEFAULT_POOL_LOW_WATERMARK,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            live_push_interval: DEFAULT_LIVE_PUSH_INTERVAL,
            warm_up_rows: DEFAULT_WARM_UP_ROWS,
        }
    }
}

impl JournalConfig {
    /// Number of store connectors the pool is built with, never above
    /// [`MAX_DATABASE_CONNECTIONS`]. Zero when no store is configured.
    pub fn connector_count(&self) -> usize {
        match self.database_address {
            Some(ref address) if !address.is_empty() => self
                .database_connections
                .clamp(1, MAX_DATABASE_CONNECTIONS),
            _ => 0,
        }
    }
}
