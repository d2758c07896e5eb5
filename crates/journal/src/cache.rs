// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-environment ring of recent entries with live fan-out.
//!
//! Entries are kept in arrival order. Live updates are pushed to subscribers without ever
//! waiting on them: a subscriber whose channel is full misses entries, a subscriber whose
//! receiver is gone is removed. Seeding at warm-up fills rings and tag indexes silently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::config::JournalConfig;
use crate::entry::Entry;
use crate::query::{Base, Direction, Query, QueryOutput, TableKind, TagInitRow, TagRow};
use crate::store::Connector;
use crate::util::{env_key, now_nanos};

/// Recent distinct values of every tag key seen in one table kind.
#[derive(Debug, Default)]
struct TagIndex {
    strings: BTreeMap<String, VecDeque<String>>,
    numbers: BTreeMap<String, VecDeque<f64>>,
}

impl TagIndex {
    fn record(&mut self, entry: &Entry, limit: usize) {
        for (key, value) in &entry.tags_string {
            remember(self.strings.entry(key.clone()).or_default(), value, limit);
        }
        for (key, value) in &entry.tags_number {
            remember(self.numbers.entry(key.clone()).or_default(), value, limit);
        }
    }

    fn seed(&mut self, row: TagInitRow, limit: usize) {
        for (key, values) in row.strings {
            let known = self.strings.entry(key).or_default();
            values.iter().for_each(|value| remember(known, value, limit));
        }
        for (key, values) in row.numbers {
            let known = self.numbers.entry(key).or_default();
            values.iter().for_each(|value| remember(known, value, limit));
        }
    }

    fn row(&self, field: Option<&str>) -> TagRow {
        let mut row = TagRow {
            field: field.map(str::to_string),
            ..Default::default()
        };
        match field {
            Some(field) => {
                row.strings = self
                    .strings
                    .get(field)
                    .map(|values| values.iter().cloned().collect())
                    .unwrap_or_default();
                row.numbers = self
                    .numbers
                    .get(field)
                    .map(|values| values.iter().copied().collect())
                    .unwrap_or_default();
            }
            None => {
                row.keys = self
                    .strings
                    .keys()
                    .chain(self.numbers.keys())
                    .cloned()
                    .collect();
            }
        }
        row.normalize();
        row
    }
}

/// Keeps `value` among the most recent distinct values, evicting the oldest beyond `limit`.
fn remember<T: Clone + PartialEq>(values: &mut VecDeque<T>, value: &T, limit: usize) {
    if values.contains(value) {
        return;
    }
    values.push_back(value.clone());
    while values.len() > limit {
        values.pop_front();
    }
}

struct Subscriber {
    elements: Vec<String>,
    sender: mpsc::Sender<Arc<Entry>>,
}

impl Subscriber {
    fn wants(&self, entry: &Entry) -> bool {
        self.elements.is_empty() || self.elements.iter().any(|e| *e == entry.element)
    }
}

#[derive(Default)]
struct EnvCache {
    ring: VecDeque<Arc<Entry>>,
    subscribers: HashMap<u64, Subscriber>,
    tags: BTreeMap<TableKind, TagIndex>,
}

impl EnvCache {
    fn push(&mut self, entry: Arc<Entry>, entry_limit: usize, values_limit: usize) {
        self.tags
            .entry(TableKind::of(entry.event))
            .or_default()
            .record(&entry, values_limit);
        self.ring.push_back(entry);
        while self.ring.len() > entry_limit {
            self.ring.pop_front();
        }
    }

    fn execute(&self, query: &Query) -> QueryOutput {
        match query {
            Query::One { .. } => {
                QueryOutput::One(self.ring.iter().rev().find(|e| query.matches(e)).cloned())
            }
            Query::Vector {
                direction: Direction::Before,
                ..
            } => QueryOutput::Entries(
                self.ring
                    .iter()
                    .rev()
                    .filter(|e| query.matches(e))
                    .take(query.limit())
                    .cloned()
                    .collect(),
            ),
            // Ascending, so the limit cuts the same rows as `ORDER BY time LIMIT`.
            Query::Vector { .. } | Query::Range { .. } => QueryOutput::Entries(
                self.ring
                    .iter()
                    .filter(|e| query.matches(e))
                    .take(query.limit())
                    .cloned()
                    .collect(),
            ),
            Query::Tags { base, field } if base.filter.is_none() => QueryOutput::Tags(
                self.tags
                    .get(&base.kind())
                    .map(|index| index.row(field.as_deref()))
                    .unwrap_or_else(|| TagRow {
                        field: field.clone(),
                        ..Default::default()
                    }),
            ),
            Query::Tags { field, .. } => QueryOutput::Tags(TagRow::from_entries(
                self.ring.iter().filter(|e| query.matches(e)).map(Arc::as_ref),
                field.as_deref(),
            )),
            Query::TagsInit { sample_size, .. } => QueryOutput::TagsInit(TagInitRow::from_entries(
                self.ring.iter().filter(|e| query.matches(e)).map(Arc::as_ref),
                *sample_size,
            )),
            Query::Multi { .. } => QueryOutput::empty(query),
        }
    }
}

struct Inner {
    envs: RwLock<HashMap<String, EnvCache>>,
    entry_limit: usize,
    values_limit: usize,
    subscriber_capacity: usize,
    next_subscriber: AtomicU64,
}

/// Shared handle to the hot cache. Cloning is cheap.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    pub fn new(config: &JournalConfig) -> Self {
        Cache {
            inner: Arc::new(Inner {
                envs: RwLock::new(HashMap::new()),
                entry_limit: config.cache_entry_limit.max(1),
                values_limit: config.cache_values_limit.max(1),
                subscriber_capacity: config.subscriber_capacity.max(1),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Appends live entries to their rings and pushes them to matching subscribers.
    pub fn update(&self, entries: &[Arc<Entry>]) {
        #[allow(clippy::expect_used)]
        let mut envs = self.inner.envs.write().expect("lock poisoned");
        for entry in entries {
            let env = envs.entry(env_key(&entry.env_id)).or_default();
            env.push(
                Arc::clone(entry),
                self.inner.entry_limit,
                self.inner.values_limit,
            );

            env.subscribers.retain(|id, subscriber| {
                if !subscriber.wants(entry) {
                    return true;
                }
                match subscriber.sender.try_send(Arc::clone(entry)) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        trace!("Subscriber {id} is full, dropping entry {}", entry.time);
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Subscriber {id} is gone, removing it");
                        false
                    }
                }
            });
        }
    }

    /// Fills rings without notifying subscribers. Entries are ordered by time first.
    pub fn seed(&self, entries: Vec<Arc<Entry>>) {
        let mut entries = entries;
        entries.sort_by_key(|entry| entry.time);
        #[allow(clippy::expect_used)]
        let mut envs = self.inner.envs.write().expect("lock poisoned");
        for entry in entries {
            envs.entry(env_key(&entry.env_id)).or_default().push(
                entry,
                self.inner.entry_limit,
                self.inner.values_limit,
            );
        }
    }

    /// Adds sampled tag values to an environment's index.
    pub fn seed_tags(&self, env_id: &str, kind: TableKind, row: TagInitRow) {
        #[allow(clippy::expect_used)]
        let mut envs = self.inner.envs.write().expect("lock poisoned");
        envs.entry(env_key(env_id))
            .or_default()
            .tags
            .entry(kind)
            .or_default()
            .seed(row, self.inner.values_limit);
    }

    /// Snapshot of an environment's ring in arrival order, restricted to `elements` unless empty.
    pub fn entries(&self, env_id: &str, elements: &[String]) -> Vec<Arc<Entry>> {
        #[allow(clippy::expect_used)]
        let envs = self.inner.envs.read().expect("lock poisoned");
        envs.get(&env_key(env_id))
            .map(|env| {
                env.ring
                    .iter()
                    .filter(|e| elements.is_empty() || elements.contains(&e.element))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Answers a query from the ring. `Vector` before a time walks newest to oldest, every
    /// other variant oldest to newest, stopping at the limit.
    pub fn execute(&self, query: &Query) -> QueryOutput {
        if let Query::Multi { queries } = query {
            return QueryOutput::Multi(queries.iter().map(|q| self.execute(q)).collect());
        }
        let Some(base) = query.base() else {
            return QueryOutput::empty(query);
        };

        #[allow(clippy::expect_used)]
        let envs = self.inner.envs.read().expect("lock poisoned");
        match envs.get(&base.env_key()) {
            Some(env) => env.execute(query),
            None => QueryOutput::empty(query),
        }
    }

    /// Registers a live subscriber for an environment, optionally limited to some elements.
    /// It is removed when `token` is cancelled or the subscription is dropped.
    pub fn subscribe(
        &self,
        token: &CancellationToken,
        env_id: &str,
        elements: &[String],
    ) -> Subscription {
        let env = env_key(env_id);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.subscriber_capacity);
        {
            #[allow(clippy::expect_used)]
            let mut envs = self.inner.envs.write().expect("lock poisoned");
            envs.entry(env.clone()).or_default().subscribers.insert(
                id,
                Subscriber {
                    elements: elements.to_vec(),
                    sender,
                },
            );
        }
        debug!("Subscriber {id} registered for environment {env}");

        let scope = token.child_token();
        let watcher = scope.clone();
        let cache = self.clone();
        let watched_env = env.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            cache.unsubscribe(&watched_env, id);
        });

        Subscription {
            id,
            env,
            receiver,
            _guard: scope.drop_guard(),
        }
    }

    fn unsubscribe(&self, env: &str, id: u64) {
        #[allow(clippy::expect_used)]
        let mut envs = self.inner.envs.write().expect("lock poisoned");
        if let Some(cache) = envs.get_mut(env) {
            if cache.subscribers.remove(&id).is_some() {
                debug!("Subscriber {id} removed from environment {env}");
            }
        }
    }

    /// Forgets an environment: its ring, tag index and subscribers.
    pub fn drop_env(&self, env_id: &str) -> bool {
        #[allow(clippy::expect_used)]
        let mut envs = self.inner.envs.write().expect("lock poisoned");
        envs.remove(&env_key(env_id)).is_some()
    }

    pub fn subscriber_count(&self, env_id: &str) -> usize {
        #[allow(clippy::expect_used)]
        let envs = self.inner.envs.read().expect("lock poisoned");
        envs.get(&env_key(env_id))
            .map_or(0, |env| env.subscribers.len())
    }

    pub fn len(&self, env_id: &str) -> usize {
        #[allow(clippy::expect_used)]
        let envs = self.inner.envs.read().expect("lock poisoned");
        envs.get(&env_key(env_id)).map_or(0, |env| env.ring.len())
    }

    pub fn is_empty(&self, env_id: &str) -> bool {
        self.len(env_id) == 0
    }

    /// Seeds every environment the store knows about with its newest entries and a sample
    /// of its tag values. Returns the number of environments seeded.
    pub async fn warm_up(&self, connector: &dyn Connector, rows: usize, sample_size: usize) -> usize {
        let envs = match connector.existing_envs().await {
            Ok(envs) => envs,
            Err(e) => {
                warn!("Skipping cache warm-up, unable to list environments: {e}");
                return 0;
            }
        };

        let now = now_nanos();
        for env in &envs {
            for events in [false, true] {
                let base = Base {
                    env_id: env.clone(),
                    events,
                    full_log: true,
                    limit_rows: rows,
                    filter: None,
                };
                let recent = Query::Vector {
                    base: base.clone(),
                    time: now,
                    direction: Direction::Before,
                };
                match connector.exec_query(&recent).await {
                    Ok(QueryOutput::Entries(entries)) => self.seed(entries),
                    Ok(_) => {}
                    Err(e) => warn!("Unable to warm up {env}: {e}"),
                }

                let tags = Query::TagsInit { base, sample_size };
                match connector.exec_query(&tags).await {
                    Ok(QueryOutput::TagsInit(row)) => {
                        self.seed_tags(env, TableKind::of(events), row)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Unable to seed tags of {env}: {e}"),
                }
            }
        }
        debug!("Cache warmed up with {} environments", envs.len());
        envs.len()
    }
}

/// Receiving side of a live subscription.
pub struct Subscription {
    id: u64,
    env: String,
    receiver: mpsc::Receiver<Arc<Entry>>,
    _guard: DropGuard,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    /// Next live entry, or `None` once the subscription has been removed.
    pub async fn recv(&mut self) -> Option<Arc<Entry>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Entry>> {
        self.receiver.try_recv().ok()
    }
}
