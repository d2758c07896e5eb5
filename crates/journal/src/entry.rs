// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One structured log or event record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default, with = "front_time")]
    pub time: u64,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub env_id: String,
    #[serde(default)]
    pub element: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub git_repo: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub tags_string: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_number: BTreeMap<String, f64>,
    #[serde(default)]
    pub event: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    /// Classifies a free-form level hint by its first character.
    pub fn from_hint(hint: &str) -> Level {
        match hint.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('d') | Some('t') => Level::Debug,
            Some('w') => Level::Warning,
            Some('e') => Level::Error,
            Some('f') => Level::Fatal,
            _ => Level::Info,
        }
    }

    /// Level implied by an HTTP status code.
    pub fn from_status(status: f64) -> Level {
        match status {
            s if (400.0..500.0).contains(&s) => Level::Warning,
            s if (500.0..600.0).contains(&s) => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingest envelope. Consumed once by the parser.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Message {
    #[serde(rename = "EnvID", default)]
    pub env_id: String,
    #[serde(rename = "Element", default)]
    pub element: String,
    #[serde(rename = "Pod", default)]
    pub pod: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "GitRepo", default)]
    pub git_repo: String,
    #[serde(rename = "UserEmail", default)]
    pub user_email: String,
    /// Template grammar applied to non-JSON lines.
    #[serde(rename = "Parser", default)]
    pub parser: String,
    #[serde(rename = "Data", default, deserialize_with = "deserialize_data")]
    pub data: String,
    #[serde(rename = "Level", default)]
    pub level: String,
}

impl Message {
    /// Entry skeleton carrying the envelope's source fields.
    pub fn to_entry(&self) -> Entry {
        Entry {
            level: self.level.clone(),
            env_id: self.env_id.clone(),
            element: self.element.clone(),
            pod: self.pod.clone(),
            version: self.version.clone(),
            git_repo: self.git_repo.clone(),
            user_email: self.user_email.clone(),
            ..Default::default()
        }
    }
}

fn deserialize_data<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Data {
        Text(String),
        Bytes(Vec<u8>),
    }

    Ok(match Option::<Data>::deserialize(deserializer)? {
        Some(Data::Text(text)) => text,
        Some(Data::Bytes(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        None => String::new(),
    })
}

/// Storage kind of a column as seen by filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    UInt,
    Map,
}

/// Value of a column read from an entry.
pub enum ColumnValue<'a> {
    Text(&'a str),
    UInt(u64),
    StringMap(&'a BTreeMap<String, String>),
    NumberMap(&'a BTreeMap<String, f64>),
}

/// Stored columns that filters address directly. Any other field name refers to a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Column {
    Time,
    Level,
    Message,
    Element,
    Pod,
    Version,
    GitRepo,
    UserEmail,
    TagsString,
    TagsNumber,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Column::Time,
        Column::Level,
        Column::Message,
        Column::Element,
        Column::Pod,
        Column::Version,
        Column::GitRepo,
        Column::UserEmail,
        Column::TagsString,
        Column::TagsNumber,
    ];

    pub fn lookup(field: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == field)
    }

    pub fn name(self) -> &'static str {
        match self {
            Column::Time => "time",
            Column::Level => "level",
            Column::Message => "message",
            Column::Element => "element",
            Column::Pod => "pod",
            Column::Version => "version",
            Column::GitRepo => "git_repo",
            Column::UserEmail => "user_email",
            Column::TagsString => "tags_string",
            Column::TagsNumber => "tags_number",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            Column::Time => ColumnKind::UInt,
            Column::TagsString | Column::TagsNumber => ColumnKind::Map,
            _ => ColumnKind::Text,
        }
    }

    pub fn read(self, entry: &Entry) -> ColumnValue<'_> {
        match self {
            Column::Time => ColumnValue::UInt(entry.time),
            Column::Level => ColumnValue::Text(&entry.level),
            Column::Message => ColumnValue::Text(&entry.message),
            Column::Element => ColumnValue::Text(&entry.element),
            Column::Pod => ColumnValue::Text(&entry.pod),
            Column::Version => ColumnValue::Text(&entry.version),
            Column::GitRepo => ColumnValue::Text(&entry.git_repo),
            Column::UserEmail => ColumnValue::Text(&entry.user_email),
            Column::TagsString => ColumnValue::StringMap(&entry.tags_string),
            Column::TagsNumber => ColumnValue::NumberMap(&entry.tags_number),
        }
    }
}

/// Times travel to clients as decimal strings and are accepted as strings or numbers.
pub mod front_time {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(time: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(time)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimeVisitor)
    }

    struct TimeVisitor;

    impl<'de> Visitor<'de> for TimeVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a nanosecond timestamp as a string or an unsigned integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative time {v}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<u64, E> {
            if v.is_finite() && v >= 0.0 {
                Ok(v as u64)
            } else {
                Err(E::custom(format!("invalid time {v}")))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            if v.is_empty() {
                return Ok(0);
            }
            v.parse::<u64>()
                .map_err(|_| E::custom(format!("invalid time {v:?}")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    /// Optional bound, where absent, `null` and `0` all mean unset.
    pub mod option {
        use serde::{Deserializer, Serializer};

        pub fn serialize<S>(time: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match time {
                Some(t) => serializer.collect_str(t),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let time = super::deserialize(deserializer)?;
            Ok((time != 0).then_some(time))
        }
    }
}
