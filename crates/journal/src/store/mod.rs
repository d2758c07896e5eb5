// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Columnar store access.
//!
//! Every environment owns two tables, `logs_<env>` and `events_<env>`, in the `logs` schema.
//! Connectors are handed out by a [`pool::ConnectorPool`] that never blocks: callers that get
//! nothing back degrade to the cache.

pub mod clickhouse;
pub mod memory;
pub mod pool;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::JournalConfig;
use crate::entry::Entry;
use crate::errors::StoreError;
use crate::query::{Query, QueryOutput, TableKind};
use crate::util::env_key;
use clickhouse::{ClickHouseConfig, ClickHouseConnector, TableRegistry};
use pool::ConnectorPool;
use tracing::{error, info};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Checks the store is reachable and prepares the schema.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Outcome of the last exchange with the store.
    fn connected(&self) -> bool;

    /// Creates both tables of an environment. Idempotent.
    async fn create_tables(&self, env_id: &str) -> Result<(), StoreError>;

    async fn drop_tables(&self, env_id: &str) -> Result<(), StoreError>;

    async fn insert_one(&self, entry: &Entry) -> Result<(), StoreError>;

    /// Inserts entries into their destination tables, creating missing tables first.
    async fn insert_multi(&self, entries: &[Arc<Entry>]) -> Result<(), StoreError>;

    /// Runs a query. Missing tables yield an empty result shaped for the query.
    async fn exec_query(&self, query: &Query) -> Result<QueryOutput, StoreError>;

    /// Environments that already have a logs table.
    async fn existing_envs(&self) -> Result<Vec<String>, StoreError>;
}

/// Groups entries by canonical environment and destination table, keeping arrival order.
pub fn group_by_table(entries: &[Arc<Entry>]) -> BTreeMap<(String, TableKind), Vec<Arc<Entry>>> {
    let mut groups: BTreeMap<(String, TableKind), Vec<Arc<Entry>>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((env_key(&entry.env_id), TableKind::of(entry.event)))
            .or_default()
            .push(Arc::clone(entry));
    }
    groups
}

/// Builds the connector pool for the configured store. Without a store address, or when
/// the HTTP client cannot be built, the pool is empty and every caller stays on the cache.
pub fn build_pool(config: &JournalConfig) -> ConnectorPool {
    let Some(store) = ClickHouseConfig::from_journal(config) else {
        info!("No store configured, serving from cache only");
        return ConnectorPool::empty();
    };

    let tables = TableRegistry::default();
    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
    for _ in 0..config.connector_count() {
        match ClickHouseConnector::new(store.clone(), Arc::clone(&tables)) {
            Ok(connector) => connectors.push(Arc::new(connector)),
            Err(e) => {
                error!("Unable to create store connector: {e}");
                return ConnectorPool::empty();
            }
        }
    }
    info!(
        "Store pool ready with {} connectors to {}",
        connectors.len(),
        store.address
    );
    ConnectorPool::new(connectors)
}
