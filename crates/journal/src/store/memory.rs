// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process store used as a test double.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{group_by_table, Connector};
use crate::entry::Entry;
use crate::errors::StoreError;
use crate::query::{Direction, Query, QueryOutput, TableKind, TagInitRow, TagRow};
use crate::util::env_key;

type Tables = HashMap<(String, TableKind), Vec<Arc<Entry>>>;

/// Keeps every table as a time-ordered vector and answers queries the way the
/// columnar store orders them.
pub struct MemoryConnector {
    tables: Mutex<Tables>,
    available: AtomicBool,
    inserted: AtomicUsize,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        MemoryConnector {
            tables: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            inserted: AtomicUsize::new(0),
        }
    }

    /// Simulates the store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total entries accepted since creation.
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::SeqCst)
    }

    pub fn table_len(&self, env_id: &str, kind: TableKind) -> usize {
        #[allow(clippy::expect_used)]
        let tables = self.tables.lock().expect("lock poisoned");
        tables
            .get(&(env_key(env_id), kind))
            .map_or(0, Vec::len)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn snapshot(&self, env_id: &str, kind: TableKind) -> Option<Vec<Arc<Entry>>> {
        #[allow(clippy::expect_used)]
        let tables = self.tables.lock().expect("lock poisoned");
        tables.get(&(env_key(env_id), kind)).cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn create_tables(&self, env_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let env = env_key(env_id);
        #[allow(clippy::expect_used)]
        let mut tables = self.tables.lock().expect("lock poisoned");
        for kind in [TableKind::Logs, TableKind::Events] {
            tables.entry((env.clone(), kind)).or_default();
        }
        Ok(())
    }

    async fn drop_tables(&self, env_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let env = env_key(env_id);
        #[allow(clippy::expect_used)]
        let mut tables = self.tables.lock().expect("lock poisoned");
        tables.retain(|(table_env, _), _| *table_env != env);
        Ok(())
    }

    async fn insert_one(&self, entry: &Entry) -> Result<(), StoreError> {
        self.insert_multi(&[Arc::new(entry.clone())]).await
    }

    async fn insert_multi(&self, entries: &[Arc<Entry>]) -> Result<(), StoreError> {
        self.check()?;
        #[allow(clippy::expect_used)]
        let mut tables = self.tables.lock().expect("lock poisoned");
        for (key, group) in group_by_table(entries) {
            let table = tables.entry(key).or_default();
            table.extend(group);
            table.sort_by_key(|entry| entry.time);
        }
        self.inserted.fetch_add(entries.len(), Ordering::SeqCst);
        debug!("Stored {} entries in memory", entries.len());
        Ok(())
    }

    async fn exec_query(&self, query: &Query) -> Result<QueryOutput, StoreError> {
        self.check()?;
        if let Query::Multi { queries } = query {
            let mut outputs = Vec::with_capacity(queries.len());
            for query in queries {
                outputs.push(self.exec_query(query).await?);
            }
            return Ok(QueryOutput::Multi(outputs));
        }

        let Some(base) = query.base() else {
            return Ok(QueryOutput::empty(query));
        };
        match self.snapshot(&base.env_id, base.kind()) {
            Some(table) => Ok(evaluate(query, &table)),
            None => Ok(QueryOutput::empty(query)),
        }
    }

    async fn existing_envs(&self) -> Result<Vec<String>, StoreError> {
        self.check()?;
        #[allow(clippy::expect_used)]
        let tables = self.tables.lock().expect("lock poisoned");
        let mut envs: Vec<String> = tables
            .keys()
            .filter(|(_, kind)| *kind == TableKind::Logs)
            .map(|(env, _)| env.clone())
            .collect();
        envs.sort();
        Ok(envs)
    }
}

/// Answers a single query over a table sorted by ascending time, with the row
/// order the SQL rendering produces.
fn evaluate(query: &Query, table: &[Arc<Entry>]) -> QueryOutput {
    let matching = table.iter().filter(|entry| query.matches(entry));
    match query {
        Query::One { .. } => QueryOutput::One(matching.cloned().next()),
        Query::Vector {
            direction: Direction::Before,
            ..
        } => QueryOutput::Entries(matching.rev().take(query.limit()).cloned().collect()),
        Query::Vector { .. } | Query::Range { .. } => {
            QueryOutput::Entries(matching.take(query.limit()).cloned().collect())
        }
        Query::Tags { field, .. } => {
            QueryOutput::Tags(TagRow::from_entries(matching.map(Arc::as_ref), field.as_deref()))
        }
        Query::TagsInit { sample_size, .. } => {
            QueryOutput::TagsInit(TagInitRow::from_entries(matching.map(Arc::as_ref), *sample_size))
        }
        Query::Multi { .. } => QueryOutput::empty(query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: u64) -> Arc<Entry> {
        Arc::new(Entry {
            time,
            env_id: "prod".to_string(),
            message: format!("m{time}"),
            ..Default::default()
        })
    }

    fn times(output: QueryOutput) -> Vec<u64> {
        match output {
            QueryOutput::Entries(entries) => entries.iter().map(|e| e.time).collect(),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vector_and_range_order() {
        let store = MemoryConnector::new();
        store
            .insert_multi(&[entry(3), entry(1), entry(2), entry(5), entry(4)])
            .await
            .expect("insert");
        assert_eq!(store.inserted(), 5);

        let before = Query::decode(
            br#"{"Type":"VECTOR","EnvID":"prod","Time":"5","Direction":"BEFORE","Limit":3}"#,
            100,
        )
        .expect("decode");
        assert_eq!(times(store.exec_query(&before).await.expect("query")), vec![4, 3, 2]);

        let range = Query::decode(
            br#"{"Type":"RANGE","EnvID":"prod","TimeBegin":"2","Limit":2}"#,
            100,
        )
        .expect("decode");
        assert_eq!(times(store.exec_query(&range).await.expect("query")), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_missing_table_is_empty() {
        let store = MemoryConnector::new();
        let one = Query::decode(br#"{"Type":"ONE","EnvID":"nowhere","Time":"1"}"#, 100)
            .expect("decode");
        assert_eq!(
            store.exec_query(&one).await.expect("query"),
            QueryOutput::One(None)
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryConnector::new();
        store.set_available(false);
        assert!(!store.connected());
        assert!(matches!(
            store.insert_one(&entry(1)).await,
            Err(StoreError::NotConnected)
        ));
        assert_eq!(store.inserted(), 0);
    }

    #[tokio::test]
    async fn test_tables_lifecycle() {
        let store = MemoryConnector::new();
        store.create_tables("Prod").await.expect("create");
        store.create_tables("dev").await.expect("create");
        assert_eq!(
            store.existing_envs().await.expect("envs"),
            vec!["dev".to_string(), "prod".to_string()]
        );

        store.insert_one(&entry(1)).await.expect("insert");
        assert_eq!(store.table_len("prod", TableKind::Logs), 1);

        store.drop_tables("PROD").await.expect("drop");
        assert_eq!(store.existing_envs().await.expect("envs"), vec!["dev".to_string()]);
        assert_eq!(store.table_len("prod", TableKind::Logs), 0);
    }
}
