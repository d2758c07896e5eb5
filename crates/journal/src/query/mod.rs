// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Query variants, their SQL rendering and their cache-side predicates.

pub mod sql;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::entry::{front_time, Entry};
use crate::errors::QueryError;
use crate::operator::{self, Operator};
use crate::util::env_key;
use sql::{Sql, SqlArg};

/// Schema holding every environment's tables.
pub const DATABASE: &str = "logs";

const SELECT_SUMMARY: &str = "SELECT time, level, left(message, 500) AS message, element";
const SELECT_FULL: &str = "SELECT *";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Logs,
    Events,
}

impl TableKind {
    pub fn of(events: bool) -> TableKind {
        if events {
            TableKind::Events
        } else {
            TableKind::Logs
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            TableKind::Logs => "logs",
            TableKind::Events => "events",
        }
    }

    /// Table name for an environment, without the schema.
    pub fn table(self, env_id: &str) -> String {
        format!("{}_{}", self.prefix(), env_key(env_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BEFORE")]
    Before,
    #[serde(rename = "AFTER")]
    After,
}

/// Fields shared by every query variant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Base {
    #[serde(rename = "EnvID", default)]
    pub env_id: String,
    #[serde(rename = "Events", default)]
    pub events: bool,
    #[serde(rename = "FullLog", default)]
    pub full_log: bool,
    #[serde(rename = "Limit", default)]
    pub limit_rows: usize,
    #[serde(
        rename = "Where",
        default,
        deserialize_with = "operator::deserialize_where",
        skip_serializing_if = "Option::is_none"
    )]
    pub filter: Option<Operator>,
}

impl Base {
    pub fn kind(&self) -> TableKind {
        TableKind::of(self.events)
    }

    pub fn env_key(&self) -> String {
        env_key(&self.env_id)
    }

    /// Row limit, at least one.
    pub fn limit(&self) -> usize {
        self.limit_rows.max(1)
    }

    /// Entry-level filter shared by every variant: table kind and `Where`.
    pub fn matches(&self, entry: &Entry) -> bool {
        entry.event == self.events && operator::matches(self.filter.as_ref(), entry)
    }

    fn select(&self) -> &'static str {
        if self.full_log {
            SELECT_FULL
        } else {
            SELECT_SUMMARY
        }
    }

    fn from(&self) -> String {
        format!("FROM {DATABASE}.{}", self.kind().table(&self.env_id))
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.env_key().is_empty() {
            return Err(QueryError::MissingEnv);
        }
        Ok(())
    }

    /// Appends ` WHERE c1 AND c2 ...` built from `conditions` followed by the filter.
    fn push_where(&self, sql: &mut Sql, conditions: Vec<Sql>) {
        let mut conditions = conditions;
        if let Some(ref filter) = self.filter {
            conditions.push(filter.sql());
        }
        for (i, condition) in conditions.into_iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.append(condition);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Query {
    #[serde(rename = "ONE")]
    One {
        #[serde(flatten)]
        base: Base,
        #[serde(rename = "Time", default, with = "front_time")]
        time: u64,
    },
    #[serde(rename = "VECTOR")]
    Vector {
        #[serde(flatten)]
        base: Base,
        #[serde(rename = "Time", default, with = "front_time")]
        time: u64,
        #[serde(rename = "Direction")]
        direction: Direction,
    },
    #[serde(rename = "RANGE")]
    Range {
        #[serde(flatten)]
        base: Base,
        #[serde(rename = "TimeBegin", default, with = "front_time::option")]
        time_begin: Option<u64>,
        #[serde(rename = "TimeEnd", default, with = "front_time::option")]
        time_end: Option<u64>,
    },
    #[serde(rename = "TAGS")]
    Tags {
        #[serde(flatten)]
        base: Base,
        #[serde(rename = "Field", default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// Bulk facet seed used at cache warm-up. Never decoded from clients.
    #[serde(skip)]
    TagsInit { base: Base, sample_size: usize },
    #[serde(rename = "MULTI")]
    Multi {
        #[serde(rename = "Queries", default)]
        queries: Vec<Query>,
    },
}

impl Query {
    /// Decodes, validates and clamps a client query.
    pub fn decode(payload: &[u8], max_limit: usize) -> Result<Query, QueryError> {
        let mut query: Query = serde_json::from_slice(payload)?;
        query.validate()?;
        query.clamp_limits(max_limit);
        Ok(query)
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        match self {
            Query::One { base, time } => {
                base.validate()?;
                if *time == 0 {
                    return Err(QueryError::MissingTime("ONE"));
                }
                Ok(())
            }
            Query::Vector { base, time, .. } => {
                base.validate()?;
                if *time == 0 {
                    return Err(QueryError::MissingTime("VECTOR"));
                }
                Ok(())
            }
            Query::Range {
                base,
                time_begin,
                time_end,
            } => {
                base.validate()?;
                if time_begin.is_none() && time_end.is_none() {
                    return Err(QueryError::MissingRangeBound);
                }
                Ok(())
            }
            Query::Tags { base, .. } | Query::TagsInit { base, .. } => base.validate(),
            Query::Multi { queries } => queries.iter().try_for_each(Query::validate),
        }
    }

    /// Clamps every row limit into `[1, max]`.
    pub fn clamp_limits(&mut self, max: usize) {
        let max = max.max(1);
        match self {
            Query::Multi { queries } => queries.iter_mut().for_each(|q| q.clamp_limits(max)),
            _ => {
                if let Some(base) = self.base_mut() {
                    base.limit_rows = base.limit_rows.clamp(1, max);
                }
            }
        }
    }

    pub fn base(&self) -> Option<&Base> {
        match self {
            Query::One { base, .. }
            | Query::Vector { base, .. }
            | Query::Range { base, .. }
            | Query::Tags { base, .. }
            | Query::TagsInit { base, .. } => Some(base),
            Query::Multi { .. } => None,
        }
    }

    fn base_mut(&mut self) -> Option<&mut Base> {
        match self {
            Query::One { base, .. }
            | Query::Vector { base, .. }
            | Query::Range { base, .. }
            | Query::Tags { base, .. }
            | Query::TagsInit { base, .. } => Some(base),
            Query::Multi { .. } => None,
        }
    }

    /// Row limit; for `Multi` the largest limit among its sub-queries.
    pub fn limit(&self) -> usize {
        match self {
            Query::One { .. } => 1,
            Query::Multi { queries } => queries.iter().map(Query::limit).max().unwrap_or(1),
            _ => self.base().map_or(1, Base::limit),
        }
    }

    /// Store SQL for this query. `Multi` has none of its own.
    pub fn sql(&self) -> Option<Sql> {
        match self {
            Query::One { base, time } => {
                let mut sql = Sql::new(format!("{} {}", base.select(), base.from()));
                base.push_where(&mut sql, vec![time_condition("=", *time)]);
                sql.push_str(" LIMIT 1");
                Some(sql)
            }
            Query::Vector {
                base,
                time,
                direction,
            } => {
                let (cmp, order) = match direction {
                    Direction::Before => ("<", " DESC"),
                    Direction::After => (">", ""),
                };
                let mut sql = Sql::new(format!("{} {}", base.select(), base.from()));
                base.push_where(&mut sql, vec![time_condition(cmp, *time)]);
                sql.push_str(&format!(" ORDER BY time{order} LIMIT {}", base.limit()));
                Some(sql)
            }
            Query::Range {
                base,
                time_begin,
                time_end,
            } => {
                let mut conditions = Vec::new();
                if let Some(begin) = time_begin {
                    conditions.push(time_condition(">=", *begin));
                }
                if let Some(end) = time_end {
                    conditions.push(time_condition("<=", *end));
                }
                let mut sql = Sql::new(format!("{} {}", base.select(), base.from()));
                base.push_where(&mut sql, conditions);
                sql.push_str(&format!(" ORDER BY time LIMIT {}", base.limit()));
                Some(sql)
            }
            Query::Tags { base, field } => {
                let mut sql = match field {
                    Some(field) => Sql::with_args(
                        "SELECT groupUniqArrayIf(tags_string[?], mapContains(tags_string, ?)) AS strings, \
                         groupUniqArrayIf(tags_number[?], mapContains(tags_number, ?)) AS numbers",
                        vec![
                            SqlArg::Str(field.clone()),
                            SqlArg::Str(field.clone()),
                            SqlArg::Str(field.clone()),
                            SqlArg::Str(field.clone()),
                        ],
                    ),
                    None => Sql::new(
                        "SELECT groupUniqArrayArray(arrayConcat(mapKeys(tags_string), mapKeys(tags_number))) AS keys",
                    ),
                };
                sql.push_str(" ").push_str(&base.from());
                base.push_where(&mut sql, Vec::new());
                sql.push_str(" LIMIT 1");
                Some(sql)
            }
            Query::TagsInit { base, sample_size } => Some(Sql::new(format!(
                "SELECT groupUniqArrayMap({n})(tags_string) AS strings, \
                 groupUniqArrayMap({n})(tags_number) AS numbers {from}",
                n = (*sample_size).max(1),
                from = base.from(),
            ))),
            Query::Multi { .. } => None,
        }
    }

    /// Whether an entry belongs to this query's result set, ignoring the row limit.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Query::One { base, time } => entry.time == *time && base.matches(entry),
            Query::Vector {
                base,
                time,
                direction,
            } => {
                let in_window = match direction {
                    Direction::Before => entry.time < *time,
                    Direction::After => entry.time > *time,
                };
                in_window && base.matches(entry)
            }
            Query::Range {
                base,
                time_begin,
                time_end,
            } => {
                time_begin.map_or(true, |b| entry.time >= b)
                    && time_end.map_or(true, |e| entry.time <= e)
                    && base.matches(entry)
            }
            Query::Tags { base, .. } | Query::TagsInit { base, .. } => base.matches(entry),
            Query::Multi { queries } => queries.iter().any(|q| q.matches(entry)),
        }
    }
}

fn time_condition(cmp: &str, time: u64) -> Sql {
    let mut sql = Sql::new(format!("time {cmp} "));
    sql.push_arg(SqlArg::UInt(time));
    sql
}

/// Distinct tag keys, or distinct values of one field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numbers: Vec<f64>,
}

impl TagRow {
    /// Aggregates tag keys, or the values of `field`, over `entries`. Output is sorted.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>, field: Option<&str>) -> TagRow {
        let mut row = TagRow {
            field: field.map(str::to_string),
            ..Default::default()
        };
        let mut keys = BTreeSet::new();
        let mut strings = BTreeSet::new();
        let mut numbers = Vec::new();

        for entry in entries {
            match field {
                Some(field) => {
                    if let Some(value) = entry.tags_string.get(field) {
                        strings.insert(value.clone());
                    }
                    if let Some(value) = entry.tags_number.get(field) {
                        numbers.push(*value);
                    }
                }
                None => {
                    keys.extend(entry.tags_string.keys().cloned());
                    keys.extend(entry.tags_number.keys().cloned());
                }
            }
        }

        numbers.sort_by(f64::total_cmp);
        numbers.dedup();
        row.keys = keys.into_iter().collect();
        row.strings = strings.into_iter().collect();
        row.numbers = numbers;
        row
    }

    /// Sorts and deduplicates every list, for rows coming back from the store.
    pub fn normalize(&mut self) {
        self.keys.sort();
        self.keys.dedup();
        self.strings.sort();
        self.strings.dedup();
        self.numbers.sort_by(f64::total_cmp);
        self.numbers.dedup();
    }
}

/// Sampled distinct values of every tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInitRow {
    #[serde(default)]
    pub strings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub numbers: BTreeMap<String, Vec<f64>>,
}

impl TagInitRow {
    /// Up to `sample_size` distinct values per tag over `entries`.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>, sample_size: usize) -> TagInitRow {
        let mut row = TagInitRow::default();
        for entry in entries {
            for (key, value) in &entry.tags_string {
                let values = row.strings.entry(key.clone()).or_default();
                if values.len() < sample_size && !values.contains(value) {
                    values.push(value.clone());
                }
            }
            for (key, value) in &entry.tags_number {
                let values = row.numbers.entry(key.clone()).or_default();
                if values.len() < sample_size && !values.contains(value) {
                    values.push(*value);
                }
            }
        }
        row
    }
}

/// Result of executing one query. The variant follows the query's.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutput {
    One(Option<Arc<Entry>>),
    Entries(Vec<Arc<Entry>>),
    Tags(TagRow),
    TagsInit(TagInitRow),
    Multi(Vec<QueryOutput>),
}

impl QueryOutput {
    /// Empty result shaped for `query`.
    pub fn empty(query: &Query) -> QueryOutput {
        match query {
            Query::One { .. } => QueryOutput::One(None),
            Query::Vector { .. } | Query::Range { .. } => QueryOutput::Entries(Vec::new()),
            Query::Tags { field, .. } => QueryOutput::Tags(TagRow {
                field: field.clone(),
                ..Default::default()
            }),
            Query::TagsInit { .. } => QueryOutput::TagsInit(TagInitRow::default()),
            Query::Multi { queries } => {
                QueryOutput::Multi(queries.iter().map(QueryOutput::empty).collect())
            }
        }
    }

    /// Flattens entry results into `entries` and tag results into `tags`.
    pub fn collect_into(self, entries: &mut Vec<Arc<Entry>>, tags: &mut Vec<TagRow>) {
        match self {
            QueryOutput::One(entry) => entries.extend(entry),
            QueryOutput::Entries(list) => entries.extend(list),
            QueryOutput::Tags(row) => tags.push(row),
            QueryOutput::TagsInit(_) => {}
            QueryOutput::Multi(outputs) => outputs
                .into_iter()
                .for_each(|output| output.collect_into(entries, tags)),
        }
    }
}
