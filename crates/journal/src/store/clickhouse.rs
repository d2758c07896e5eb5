// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ClickHouse connector over the HTTP interface.
//!
//! Statements are sent as POST bodies, rows come back as `JSONEachRow`. 64-bit integers are
//! requested unquoted so `time` decodes as a number.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{group_by_table, Connector};
use crate::config::JournalConfig;
use crate::entry::Entry;
use crate::errors::StoreError;
use crate::query::{Query, QueryOutput, TableKind, TagRow, DATABASE};
use crate::util::env_key;

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";
const USER_HEADER: &str = "X-ClickHouse-User";
const KEY_HEADER: &str = "X-ClickHouse-Key";

/// Exception codes for a missing table or database.
const UNKNOWN_TABLE_CODES: [&str; 2] = ["60", "81"];

/// Environments whose tables are known to exist, shared by every connector of a pool.
pub type TableRegistry = Arc<Mutex<HashSet<String>>>;

#[derive(Clone, Debug)]
pub struct ClickHouseConfig {
    pub address: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl ClickHouseConfig {
    /// `None` when no store address is configured.
    pub fn from_journal(config: &JournalConfig) -> Option<ClickHouseConfig> {
        let address = config.database_address.as_ref().filter(|a| !a.is_empty())?;
        Some(ClickHouseConfig {
            address: address.trim_end_matches('/').to_string(),
            user: config.database_user.clone(),
            password: config.database_password.clone(),
            timeout: config.database_timeout,
        })
    }
}

pub struct ClickHouseConnector {
    client: reqwest::Client,
    config: ClickHouseConfig,
    connected: AtomicBool,
    tables: TableRegistry,
}

impl ClickHouseConnector {
    pub fn new(config: ClickHouseConfig, tables: TableRegistry) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(ClickHouseConnector {
            client,
            config,
            connected: AtomicBool::new(false),
            tables,
        })
    }

    async fn execute(&self, statement: String) -> Result<String, StoreError> {
        let mut request = self
            .client
            .post(format!("{}/", self.config.address))
            .query(&[("output_format_json_quote_64bit_integers", "0")])
            .body(statement);
        if let Some(ref user) = self.config.user {
            request = request.header(USER_HEADER, user);
        }
        if let Some(ref password) = self.config.password {
            request = request.header(KEY_HEADER, password);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!("Lost connection to store: {e}");
                }
                return Err(e.into());
            }
        };
        self.connected.store(true, Ordering::SeqCst);

        let status = response.status();
        let code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        if is_unknown_table(code.as_deref(), &body) {
            return Err(StoreError::UnknownTable);
        }
        Err(StoreError::Server {
            status: status.as_u16(),
            message: body.trim().to_string(),
        })
    }

    async fn select(&self, query: &Query) -> Result<QueryOutput, StoreError> {
        let (Some(base), Some(sql)) = (query.base(), query.sql()) else {
            return Ok(QueryOutput::empty(query));
        };
        let statement = format!("{} FORMAT JSONEachRow", sql.bind());
        debug!("Running store query: {statement}");

        let body = match self.execute(statement).await {
            Ok(body) => body,
            Err(StoreError::UnknownTable) => return Ok(QueryOutput::empty(query)),
            Err(e) => return Err(e),
        };

        match query {
            Query::One { .. } => {
                let mut entries = decode_entries(&body, &base.env_id, base.events)?;
                Ok(QueryOutput::One(entries.pop().map(Arc::new)))
            }
            Query::Vector { .. } | Query::Range { .. } => Ok(QueryOutput::Entries(
                decode_entries(&body, &base.env_id, base.events)?
                    .into_iter()
                    .map(Arc::new)
                    .collect(),
            )),
            Query::Tags { field, .. } => {
                let mut row: TagRow = decode_first_row(&body)?;
                row.field = field.clone();
                row.normalize();
                Ok(QueryOutput::Tags(row))
            }
            Query::TagsInit { .. } => Ok(QueryOutput::TagsInit(decode_first_row(&body)?)),
            Query::Multi { .. } => Ok(QueryOutput::empty(query)),
        }
    }

    async fn insert_table(
        &self,
        env: &str,
        kind: TableKind,
        entries: &[Arc<Entry>],
    ) -> Result<(), StoreError> {
        let mut statement = format!(
            "INSERT INTO {DATABASE}.{} FORMAT JSONEachRow\n",
            kind.table(env)
        );
        for entry in entries {
            statement.push_str(&serde_json::to_string(&InsertRow::new(entry, env))?);
            statement.push('\n');
        }
        self.execute(statement).await.map(|_| ())
    }

    fn forget_tables(&self, env: &str) {
        #[allow(clippy::expect_used)]
        self.tables.lock().expect("lock poisoned").remove(env);
    }
}

#[async_trait]
impl Connector for ClickHouseConnector {
    async fn connect(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(format!("{}/ping", self.config.address))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                self.execute(format!("CREATE DATABASE IF NOT EXISTS {DATABASE}"))
                    .await?;
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(response) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(StoreError::Server {
                    status: response.status().as_u16(),
                    message: "ping failed".to_string(),
                })
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_tables(&self, env_id: &str) -> Result<(), StoreError> {
        let env = env_key(env_id);
        {
            #[allow(clippy::expect_used)]
            let tables = self.tables.lock().expect("lock poisoned");
            if tables.contains(&env) {
                return Ok(());
            }
        }

        self.execute(format!("CREATE DATABASE IF NOT EXISTS {DATABASE}"))
            .await?;
        for kind in [TableKind::Logs, TableKind::Events] {
            self.execute(create_table_statement(&kind.table(&env)))
                .await?;
        }
        debug!("Created tables for environment {env}");

        #[allow(clippy::expect_used)]
        self.tables.lock().expect("lock poisoned").insert(env);
        Ok(())
    }

    async fn drop_tables(&self, env_id: &str) -> Result<(), StoreError> {
        let env = env_key(env_id);
        self.forget_tables(&env);
        for kind in [TableKind::Logs, TableKind::Events] {
            self.execute(format!(
                "DROP TABLE IF EXISTS {DATABASE}.{}",
                kind.table(&env)
            ))
            .await?;
        }
        Ok(())
    }

    async fn insert_one(&self, entry: &Entry) -> Result<(), StoreError> {
        self.insert_multi(&[Arc::new(entry.clone())]).await
    }

    async fn insert_multi(&self, entries: &[Arc<Entry>]) -> Result<(), StoreError> {
        for ((env, kind), group) in group_by_table(entries) {
            self.create_tables(&env).await?;
            match self.insert_table(&env, kind, &group).await {
                Err(StoreError::UnknownTable) => {
                    // Dropped behind our back: recreate once and retry.
                    warn!("Table {} disappeared, recreating it", kind.table(&env));
                    self.forget_tables(&env);
                    self.create_tables(&env).await?;
                    self.insert_table(&env, kind, &group).await?;
                }
                result => result?,
            }
        }
        Ok(())
    }

    async fn exec_query(&self, query: &Query) -> Result<QueryOutput, StoreError> {
        match query {
            Query::Multi { queries } => {
                let results =
                    futures_util::future::join_all(queries.iter().map(|q| self.exec_query(q)))
                        .await;
                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result?);
                }
                Ok(QueryOutput::Multi(outputs))
            }
            _ => self.select(query).await,
        }
    }

    async fn existing_envs(&self) -> Result<Vec<String>, StoreError> {
        #[derive(Deserialize)]
        struct TableName {
            name: String,
        }

        let prefix = format!("{}_", TableKind::Logs.prefix());
        let body = self
            .execute(format!(
                "SELECT name FROM system.tables WHERE database = '{DATABASE}' \
                 AND startsWith(name, '{prefix}') ORDER BY name FORMAT JSONEachRow"
            ))
            .await;
        let body = match body {
            Ok(body) => body,
            Err(StoreError::UnknownTable) => return Ok(Vec::new()),
            Err(e) => {
                error!("Unable to list environments: {e}");
                return Err(e);
            }
        };

        let mut envs = Vec::new();
        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let table: TableName = serde_json::from_str(line)?;
            if let Some(env) = table.name.strip_prefix(&prefix) {
                envs.push(env.to_string());
            }
        }
        Ok(envs)
    }
}

fn is_unknown_table(code: Option<&str>, body: &str) -> bool {
    if let Some(code) = code {
        return UNKNOWN_TABLE_CODES.contains(&code.trim());
    }
    UNKNOWN_TABLE_CODES
        .iter()
        .any(|code| body.contains(&format!("Code: {code}.")))
}

fn create_table_statement(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {DATABASE}.{table} (\
         time UInt64, \
         level LowCardinality(String), \
         message String, \
         env_id LowCardinality(String), \
         element LowCardinality(String), \
         pod String, \
         version String, \
         git_repo String, \
         user_email String, \
         tags_string Map(String, String), \
         tags_number Map(String, Float64)\
         ) ENGINE = MergeTree \
         PARTITION BY toYYYYMMDD(fromUnixTimestamp64Nano(toInt64(time))) \
         ORDER BY (time, element)"
    )
}

fn decode_entries(body: &str, env_id: &str, events: bool) -> Result<Vec<Entry>, StoreError> {
    let mut entries = Vec::new();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let mut entry: Entry = serde_json::from_str(line)?;
        entry.env_id = env_id.to_string();
        entry.event = events
            || entry
                .tags_string
                .get("event")
                .is_some_and(|value| value == "true");
        entries.push(entry);
    }
    Ok(entries)
}

fn decode_first_row<T>(body: &str) -> Result<T, StoreError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match body.lines().find(|line| !line.trim().is_empty()) {
        Some(line) => Ok(serde_json::from_str(line)?),
        None => Ok(T::default()),
    }
}

/// Row layout written to the store. `time` goes out as a number, `env_id` as the table's
/// canonical env key.
#[derive(Serialize)]
struct InsertRow<'a> {
    time: u64,
    level: &'a str,
    message: &'a str,
    env_id: &'a str,
    element: &'a str,
    pod: &'a str,
    version: &'a str,
    git_repo: &'a str,
    user_email: &'a str,
    tags_string: BTreeMap<&'a str, &'a str>,
    tags_number: &'a BTreeMap<String, f64>,
}

impl<'a> InsertRow<'a> {
    fn new(entry: &'a Entry, env_id: &'a str) -> Self {
        let mut tags_string: BTreeMap<&str, &str> = entry
            .tags_string
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if entry.event {
            tags_string.insert("event", "true");
        }
        InsertRow {
            time: entry.time,
            level: &entry.level,
            message: &entry.message,
            env_id,
            element: &entry.element,
            pod: &entry.pod,
            version: &entry.version,
            git_repo: &entry.git_repo,
            user_email: &entry.user_email,
            tags_string,
            tags_number: &entry.tags_number,
        }
    }
}
