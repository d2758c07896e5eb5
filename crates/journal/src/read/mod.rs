// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read path: batched point queries and live tails.

pub mod live;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::JournalConfig;
use crate::entry::Entry;
use crate::query::{Query, QueryOutput, TagRow};
use crate::store::pool::ConnectorPool;

/// Merged answer to a batch of queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GetResult {
    #[serde(rename = "Entries")]
    pub entries: Vec<Arc<Entry>>,
    #[serde(rename = "Tags")]
    pub tags: Vec<TagRow>,
}

#[derive(Clone)]
pub struct Reader {
    cache: Cache,
    pool: ConnectorPool,
    max_entries_limit: usize,
    live_push_interval: Duration,
}

impl Reader {
    pub fn new(config: &JournalConfig, cache: Cache, pool: ConnectorPool) -> Self {
        Reader {
            cache,
            pool,
            max_entries_limit: config.max_entries_limit.max(1),
            live_push_interval: config.live_push_interval,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectorPool {
        &self.pool
    }

    pub fn max_entries_limit(&self) -> usize {
        self.max_entries_limit
    }

    /// Runs every query concurrently, against the store when a connector is idle and
    /// against the cache otherwise. A query the store fails on is answered by the cache.
    ///
    /// Entries are merged in ascending time order and the newest ones are kept, up to the
    /// largest limit among the queries.
    pub async fn get(&self, queries: &[Query]) -> GetResult {
        let outputs: Vec<QueryOutput> = match self.pool.try_get() {
            Some(connector) => {
                let connector = &connector;
                futures_util::future::join_all(queries.iter().map(|query| async move {
                    match connector.exec_query(query).await {
                        Ok(output) => output,
                        Err(e) => {
                            warn!("Store query failed, answering from cache: {e}");
                            self.cache.execute(query)
                        }
                    }
                }))
                .await
            }
            None => {
                debug!("No idle store connector, answering {} queries from cache", queries.len());
                queries.iter().map(|query| self.cache.execute(query)).collect()
            }
        };

        let mut result = GetResult::default();
        for output in outputs {
            output.collect_into(&mut result.entries, &mut result.tags);
        }
        result.entries.sort_by_key(|entry| entry.time);

        let limit = queries.iter().map(Query::limit).max().unwrap_or(1);
        if result.entries.len() > limit {
            let excess = result.entries.len() - limit;
            result.entries.drain(..excess);
        }
        result
    }
}
