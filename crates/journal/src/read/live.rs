// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live tail: a backlog of the most recent matching entries, then batched pushes of new ones.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Reader;
use crate::cache::Subscription;
use crate::entry::Entry;
use crate::errors::QueryError;
use crate::query::{Base, Direction, Query, QueryOutput};
use crate::util::now_nanos;

/// One tailed filter.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LiveSub {
    #[serde(flatten)]
    pub base: Base,
    #[serde(rename = "Elements", default)]
    pub elements: Vec<String>,
}

impl LiveSub {
    pub fn matches(&self, entry: &Entry) -> bool {
        self.matches_element(entry) && self.base.matches(entry)
    }

    /// Element check alone. Store rows already passed `Where` and may be summary
    /// projections without tags, so they are only checked against this.
    pub fn matches_element(&self, entry: &Entry) -> bool {
        self.elements.is_empty() || self.elements.contains(&entry.element)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LiveRequest {
    #[serde(rename = "Subs", default)]
    pub subs: Vec<LiveSub>,
    /// Stops the current tail without starting a new one.
    #[serde(rename = "Cancel", default)]
    pub cancel: bool,
}

impl LiveRequest {
    pub fn decode(payload: &[u8], max_limit: usize) -> Result<LiveRequest, QueryError> {
        let mut request: LiveRequest = serde_json::from_slice(payload)?;
        let max_limit = max_limit.max(1);
        for sub in &mut request.subs {
            sub.base.validate()?;
            sub.base.limit_rows = sub.base.limit_rows.clamp(1, max_limit);
        }
        Ok(request)
    }
}

impl Reader {
    /// Starts one tail per filter. Each sends its backlog to `sink` right away, then pushes
    /// new matching entries every push interval until `token` is cancelled or `sink` closes.
    pub async fn live(
        &self,
        subs: &[LiveSub],
        token: &CancellationToken,
        sink: mpsc::Sender<Vec<Arc<Entry>>>,
    ) {
        for sub in subs {
            let subscription = self.cache.subscribe(token, &sub.base.env_id, &sub.elements);
            let backlog = self.backlog(sub).await;
            let newest = backlog.last().map_or(0, |entry| entry.time);

            if sink.send(backlog).await.is_err() {
                debug!("Live sink closed before the backlog was sent");
                return;
            }
            tokio::spawn(tail(
                sub.clone(),
                subscription,
                newest,
                token.clone(),
                sink.clone(),
                self.live_push_interval,
            ));
        }
    }

    /// Most recent matching entries from the cache, completed from the store when the cache
    /// holds fewer than the limit and a connector is idle.
    async fn backlog(&self, sub: &LiveSub) -> Vec<Arc<Entry>> {
        let limit = sub.base.limit();
        let mut by_time: BTreeMap<u64, Arc<Entry>> = self
            .cache
            .entries(&sub.base.env_id, &sub.elements)
            .into_iter()
            .filter(|entry| sub.matches(entry))
            .map(|entry| (entry.time, entry))
            .collect();

        if by_time.len() < limit {
            if let Some(connector) = self.pool.try_get() {
                let query = Query::Vector {
                    base: sub.base.clone(),
                    time: now_nanos(),
                    direction: Direction::Before,
                };
                match connector.exec_query(&query).await {
                    Ok(QueryOutput::Entries(entries)) => {
                        let entries = entries.into_iter().filter(|e| sub.matches_element(e));
                        for entry in entries {
                            by_time.entry(entry.time).or_insert(entry);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Unable to load live backlog from store: {e}"),
                }
            }
        }

        let skip = by_time.len().saturating_sub(limit);
        by_time.into_values().skip(skip).collect()
    }
}

async fn tail(
    sub: LiveSub,
    mut subscription: Subscription,
    newest: u64,
    token: CancellationToken,
    sink: mpsc::Sender<Vec<Arc<Entry>>>,
    push_interval: Duration,
) {
    let limit = sub.base.limit();
    let push_interval = push_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + push_interval, push_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Vec<Arc<Entry>> = Vec::new();

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            received = subscription.recv() => match received {
                Some(entry) => {
                    if entry.time > newest && sub.matches(&entry) {
                        pending.push(entry);
                        if pending.len() > limit {
                            let excess = pending.len() - limit;
                            pending.drain(..excess);
                        }
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                if sink.send(std::mem::take(&mut pending)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Live tail {} stopped", subscription.id());
}
