// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boolean filter expressions.
//!
//! Every operator renders to SQL for the store and to an in-memory predicate for the cache.
//! Both paths resolve field names through [`Column::lookup`] and read absent tags the way the
//! store reads missing map keys (`""` for strings, `0` for numbers), so a filter selects the
//! same entries wherever it runs.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

use crate::entry::{Column, ColumnKind, ColumnValue, Entry};
use crate::errors::QueryError;
use crate::query::sql::{Sql, SqlArg};
use crate::util::is_numeric;

/// Numeric bound of a `BETWEEN`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    fn arg(self) -> SqlArg {
        match self {
            Number::Int(v) => SqlArg::Int(v),
            Number::Float(v) => SqlArg::Float(v),
        }
    }

    /// Orders an entry time against this bound without going through `f64` for integers.
    fn cmp_time(self, time: u64) -> Option<Ordering> {
        match self {
            Number::Int(v) => Some(i128::from(time).cmp(&i128::from(v))),
            Number::Float(v) => (time as f64).partial_cmp(&v),
        }
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Number::Int(v) => serializer.serialize_i64(*v),
            Number::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NumberVisitor;

        impl<'de> Visitor<'de> for NumberVisitor {
            type Value = Number;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number or a numeric string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Number, E> {
                Ok(Number::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Number, E> {
                Ok(i64::try_from(v)
                    .map(Number::Int)
                    .unwrap_or(Number::Float(v as f64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Number, E> {
                Ok(Number::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Number, E> {
                if let Ok(i) = v.parse::<i64>() {
                    return Ok(Number::Int(i));
                }
                v.parse::<f64>()
                    .map(Number::Float)
                    .map_err(|_| E::custom(format!("invalid number {v:?}")))
            }
        }

        deserializer.deserialize_any(NumberVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Value")]
pub enum Operator {
    #[serde(rename = "AND")]
    And(Vec<Operator>),
    #[serde(rename = "OR")]
    Or(Vec<Operator>),
    #[serde(rename = "NOT")]
    Not(Box<Operator>),
    #[serde(rename = "IS")]
    Is {
        #[serde(rename = "Field")]
        field: String,
        #[serde(rename = "Value")]
        value: String,
    },
    #[serde(rename = "EXISTS")]
    Exists {
        #[serde(rename = "Field")]
        field: String,
    },
    #[serde(rename = "BETWEEN")]
    Between {
        #[serde(rename = "Field")]
        field: String,
        #[serde(rename = "From", default, skip_serializing_if = "Option::is_none")]
        from: Option<Number>,
        #[serde(rename = "To", default, skip_serializing_if = "Option::is_none")]
        to: Option<Number>,
    },
}

impl Operator {
    /// Decodes a filter payload. An empty payload means no filter.
    pub fn decode(payload: &[u8]) -> Result<Option<Operator>, QueryError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        Ok(where_from_value(value)?)
    }

    /// SQL boolean expression. Never empty.
    pub fn sql(&self) -> Sql {
        match self {
            Operator::And(ops) if ops.is_empty() => Sql::new("1"),
            Operator::And(ops) => Sql::join(ops.iter().map(Operator::sql).collect(), " AND "),
            Operator::Or(ops) if ops.is_empty() => Sql::new("0"),
            Operator::Or(ops) => Sql::join(ops.iter().map(Operator::sql).collect(), " OR "),
            Operator::Not(op) => {
                let mut sql = Sql::new("NOT (");
                sql.append(op.sql()).push_str(")");
                sql
            }
            Operator::Is { field, value } => is_sql(field, value),
            Operator::Exists { field } => exists_sql(field),
            Operator::Between { field, from, to } => between_sql(field, *from, *to),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Operator::And(ops) => ops.iter().all(|op| op.matches(entry)),
            Operator::Or(ops) => ops.iter().any(|op| op.matches(entry)),
            Operator::Not(op) => !op.matches(entry),
            Operator::Is { field, value } => is_match(entry, field, value),
            Operator::Exists { field } => exists_match(entry, field),
            Operator::Between { field, from, to } => between_match(entry, field, *from, *to),
        }
    }
}

/// Applies an optional filter, where no filter matches everything.
pub fn matches(filter: Option<&Operator>, entry: &Entry) -> bool {
    filter.map_or(true, |op| op.matches(entry))
}

fn never() -> Sql {
    Sql::new("1 = 0")
}

fn is_sql(field: &str, value: &str) -> Sql {
    match Column::lookup(field) {
        Some(column) => match column.kind() {
            ColumnKind::Text => {
                let mut sql = Sql::new(format!("{} = ", column.name()));
                sql.push_arg(SqlArg::Str(value.to_string()));
                sql
            }
            ColumnKind::UInt => match value.parse::<u64>() {
                Ok(v) => {
                    let mut sql = Sql::new(format!("{} = ", column.name()));
                    sql.push_arg(SqlArg::UInt(v));
                    sql
                }
                Err(_) => never(),
            },
            ColumnKind::Map => never(),
        },
        None => match number_tag_value(value) {
            Some(v) => Sql::with_args(
                "tags_number[?] = ?",
                vec![SqlArg::Str(field.to_string()), SqlArg::Float(v)],
            ),
            None => Sql::with_args(
                "tags_string[?] = ?",
                vec![
                    SqlArg::Str(field.to_string()),
                    SqlArg::Str(value.to_string()),
                ],
            ),
        },
    }
}

fn is_match(entry: &Entry, field: &str, value: &str) -> bool {
    match Column::lookup(field) {
        Some(column) => match column.read(entry) {
            ColumnValue::Text(text) => text == value,
            ColumnValue::UInt(v) => value.parse::<u64>().is_ok_and(|want| want == v),
            ColumnValue::StringMap(_) | ColumnValue::NumberMap(_) => false,
        },
        None => match number_tag_value(value) {
            Some(want) => entry.tags_number.get(field).copied().unwrap_or(0.0) == want,
            None => entry.tags_string.get(field).map_or("", String::as_str) == value,
        },
    }
}

fn number_tag_value(value: &str) -> Option<f64> {
    if is_numeric(value) {
        value.parse::<f64>().ok()
    } else {
        None
    }
}

fn exists_sql(field: &str) -> Sql {
    match Column::lookup(field) {
        Some(column) => match column.kind() {
            ColumnKind::Text => Sql::new(format!("{} != ''", column.name())),
            ColumnKind::UInt => Sql::new(format!("{} != 0", column.name())),
            ColumnKind::Map => Sql::new(format!("notEmpty({})", column.name())),
        },
        None => Sql::with_args(
            "(mapContains(tags_string, ?) OR mapContains(tags_number, ?))",
            vec![SqlArg::Str(field.to_string()), SqlArg::Str(field.to_string())],
        ),
    }
}

fn exists_match(entry: &Entry, field: &str) -> bool {
    match Column::lookup(field) {
        Some(column) => match column.read(entry) {
            ColumnValue::Text(text) => !text.is_empty(),
            ColumnValue::UInt(v) => v != 0,
            ColumnValue::StringMap(map) => !map.is_empty(),
            ColumnValue::NumberMap(map) => !map.is_empty(),
        },
        None => entry.tags_string.contains_key(field) || entry.tags_number.contains_key(field),
    }
}

fn between_sql(field: &str, from: Option<Number>, to: Option<Number>) -> Sql {
    let bounds: Vec<(&str, Number)> = [(">= ", from), ("<= ", to)]
        .into_iter()
        .filter_map(|(op, bound)| bound.map(|b| (op, b)))
        .collect();
    if bounds.is_empty() {
        return Sql::new("1");
    }

    let is_time = Column::lookup(field) == Some(Column::Time);
    let parts = bounds
        .into_iter()
        .map(|(op, bound)| {
            let mut sql = if is_time {
                Sql::new("time ")
            } else {
                Sql::with_args("tags_number[?] ", vec![SqlArg::Str(field.to_string())])
            };
            sql.push_str(op).push_arg(bound.arg());
            sql
        })
        .collect();
    Sql::join(parts, " AND ")
}

fn between_match(entry: &Entry, field: &str, from: Option<Number>, to: Option<Number>) -> bool {
    if Column::lookup(field) == Some(Column::Time) {
        let above = from.map_or(true, |b| {
            matches!(
                b.cmp_time(entry.time),
                Some(Ordering::Greater | Ordering::Equal)
            )
        });
        let below = to.map_or(true, |b| {
            matches!(b.cmp_time(entry.time), Some(Ordering::Less | Ordering::Equal))
        });
        return above && below;
    }

    let value = entry.tags_number.get(field).copied().unwrap_or(0.0);
    from.map_or(true, |b| value >= b.as_f64()) && to.map_or(true, |b| value <= b.as_f64())
}

/// Filter payloads that are `null`, `{}` or carry an empty `Type` mean no filter.
fn where_from_value(value: serde_json::Value) -> Result<Option<Operator>, serde_json::Error> {
    let empty = match &value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => {
            map.is_empty() || map.get("Type").map_or(true, |t| t.as_str() == Some(""))
        }
        _ => false,
    };
    if empty {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some)
}

/// `deserialize_with` helper for optional `Where` fields.
pub fn deserialize_where<'de, D>(deserializer: D) -> Result<Option<Operator>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        Some(value) => where_from_value(value).map_err(de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn entry() -> Entry {
        let mut entry = Entry {
            time: 15,
            level: "ERROR".to_string(),
            message: "boom".to_string(),
            env_id: "prod".to_string(),
            element: "api".to_string(),
            ..Default::default()
        };
        entry.tags_string.insert("user".to_string(), "bob".to_string());
        entry.tags_number.insert("status".to_string(), 500.0);
        entry
    }

    fn is(field: &str, value: &str) -> Operator {
        Operator::Is {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    fn between(field: &str, from: Option<i64>, to: Option<i64>) -> Operator {
        Operator::Between {
            field: field.to_string(),
            from: from.map(Number::Int),
            to: to.map(Number::Int),
        }
    }

    #[test]
    fn test_is_routes_by_column_and_value() {
        assert_eq!(is("level", "ERROR").sql().bind(), "level = 'ERROR'");
        assert_eq!(is("time", "15").sql().bind(), "time = 15");
        assert_eq!(is("time", "soon").sql().bind(), "1 = 0");
        assert_eq!(is("tags_string", "x").sql().bind(), "1 = 0");
        assert_eq!(
            is("status", "500").sql().bind(),
            "tags_number['status'] = 500"
        );
        assert_eq!(
            is("user", "bob").sql().bind(),
            "tags_string['user'] = 'bob'"
        );

        let e = entry();
        assert!(is("level", "ERROR").matches(&e));
        assert!(is("time", "15").matches(&e));
        assert!(!is("time", "soon").matches(&e));
        assert!(!is("tags_string", "x").matches(&e));
        assert!(is("status", "500").matches(&e));
        assert!(is("user", "bob").matches(&e));
        assert!(!is("user", "alice").matches(&e));
        assert!(is("missing", "").matches(&e));
        assert!(is("missing", "0").matches(&e));
    }

    #[test]
    fn test_exists() {
        let exists = |field: &str| Operator::Exists {
            field: field.to_string(),
        };
        assert_eq!(exists("pod").sql().bind(), "pod != ''");
        assert_eq!(exists("time").sql().bind(), "time != 0");
        assert_eq!(exists("tags_number").sql().bind(), "notEmpty(tags_number)");
        assert_eq!(
            exists("user").sql().bind(),
            "(mapContains(tags_string, 'user') OR mapContains(tags_number, 'user'))"
        );

        let e = entry();
        assert!(!exists("pod").matches(&e));
        assert!(exists("element").matches(&e));
        assert!(exists("tags_number").matches(&e));
        assert!(exists("user").matches(&e));
        assert!(exists("status").matches(&e));
        assert!(!exists("missing").matches(&e));
    }

    #[test]
    fn test_between_is_inclusive() {
        let op = between("status", Some(10), Some(20));
        assert_eq!(
            op.sql().bind(),
            "(tags_number['status'] >= 10 AND tags_number['status'] <= 20)"
        );
        for (status, expected) in [(9.0, false), (10.0, true), (20.0, true), (21.0, false)] {
            let mut e = entry();
            e.tags_number.insert("status".to_string(), status);
            assert_eq!(op.matches(&e), expected, "status {status}");
        }

        let op = between("time", Some(10), Some(20));
        assert_eq!(op.sql().bind(), "(time >= 10 AND time <= 20)");
        for (time, expected) in [(9, false), (10, true), (20, true), (21, false)] {
            let e = Entry {
                time,
                ..Default::default()
            };
            assert_eq!(op.matches(&e), expected, "time {time}");
        }
    }

    #[test]
    fn test_between_bounds_are_optional() {
        assert_eq!(between("time", None, Some(5)).sql().bind(), "(time <= 5)");
        assert_eq!(between("time", None, None).sql().bind(), "1");
        assert!(between("time", None, None).matches(&entry()));
        assert!(!between("time", Some(16), None).matches(&entry()));
    }

    #[test]
    fn test_composites() {
        let e = entry();
        let op = Operator::And(vec![
            is("level", "ERROR"),
            Operator::Not(Box::new(is("user", "alice"))),
        ]);
        assert_eq!(
            op.sql().bind(),
            "(level = 'ERROR' AND NOT (tags_string['user'] = 'alice'))"
        );
        assert!(op.matches(&e));

        assert_eq!(Operator::And(vec![]).sql().bind(), "1");
        assert!(Operator::And(vec![]).matches(&e));
        assert_eq!(Operator::Or(vec![]).sql().bind(), "0");
        assert!(!Operator::Or(vec![]).matches(&e));
    }

    #[test]
    fn test_json_envelope() {
        let json = r#"{"Type":"OR","Value":[
            {"Type":"IS","Value":{"Field":"level","Value":"ERROR"}},
            {"Type":"NOT","Value":{"Type":"EXISTS","Value":{"Field":"user"}}},
            {"Type":"BETWEEN","Value":{"Field":"time","From":"10","To":20.5}}
        ]}"#;
        let op = Operator::decode(json.as_bytes())
            .expect("decode")
            .expect("filter");
        assert_eq!(
            op,
            Operator::Or(vec![
                is("level", "ERROR"),
                Operator::Not(Box::new(Operator::Exists {
                    field: "user".to_string()
                })),
                Operator::Between {
                    field: "time".to_string(),
                    from: Some(Number::Int(10)),
                    to: Some(Number::Float(20.5)),
                },
            ])
        );
    }

    #[test]
    fn test_empty_payloads_mean_no_filter() {
        assert_eq!(Operator::decode(b"").expect("decode"), None);
        assert_eq!(Operator::decode(b"null").expect("decode"), None);
        assert_eq!(Operator::decode(b"{}").expect("decode"), None);
        assert_eq!(
            Operator::decode(br#"{"Type":"","Value":null}"#).expect("decode"),
            None
        );
        assert!(Operator::decode(br#"{"Type":"LIKE","Value":{}}"#).is_err());
        assert!(Operator::decode(br#"{"Value":{}}"#).expect("decode").is_none());
    }

    // Minimal evaluator for the SQL the operators render, reading columns from one entry.
    mod sql_eval {
        use super::*;

        #[derive(Clone, Debug)]
        enum V {
            Int(i128),
            Float(f64),
            Str(String),
            Bool(bool),
            StrMap(BTreeMap<String, String>),
            NumMap(BTreeMap<String, f64>),
        }

        impl V {
            fn truthy(&self) -> bool {
                match self {
                    V::Bool(b) => *b,
                    V::Int(i) => *i != 0,
                    V::Float(f) => *f != 0.0,
                    other => panic!("not a boolean: {other:?}"),
                }
            }
        }

        #[derive(Clone, Debug, PartialEq)]
        enum Tok {
            LParen,
            RParen,
            LBracket,
            RBracket,
            Comma,
            Op(String),
            Word(String),
            Num(String),
            Str(String),
            Arg,
        }

        fn tokenize(text: &str) -> Vec<Tok> {
            let chars: Vec<char> = text.chars().collect();
            let mut toks = Vec::new();
            let mut i = 0;
            while i < chars.len() {
                let c = chars[i];
                match c {
                    ' ' => i += 1,
                    '(' => {
                        toks.push(Tok::LParen);
                        i += 1
                    }
                    ')' => {
                        toks.push(Tok::RParen);
                        i += 1
                    }
                    '[' => {
                        toks.push(Tok::LBracket);
                        i += 1
                    }
                    ']' => {
                        toks.push(Tok::RBracket);
                        i += 1
                    }
                    ',' => {
                        toks.push(Tok::Comma);
                        i += 1
                    }
                    '?' => {
                        toks.push(Tok::Arg);
                        i += 1
                    }
                    '\'' => {
                        let mut s = String::new();
                        i += 1;
                        while chars[i] != '\'' {
                            s.push(chars[i]);
                            i += 1;
                        }
                        i += 1;
                        toks.push(Tok::Str(s));
                    }
                    '=' | '!' | '<' | '>' => {
                        let mut op = c.to_string();
                        if chars.get(i + 1) == Some(&'=') {
                            op.push('=');
                            i += 1;
                        }
                        i += 1;
                        toks.push(Tok::Op(op));
                    }
                    c if c.is_ascii_digit() => {
                        let start = i;
                        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                            i += 1;
                        }
                        toks.push(Tok::Num(chars[start..i].iter().collect()));
                    }
                    _ => {
                        let start = i;
                        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                            i += 1;
                        }
                        toks.push(Tok::Word(chars[start..i].iter().collect()));
                    }
                }
            }
            toks
        }

        struct Eval<'a> {
            toks: Vec<Tok>,
            pos: usize,
            args: std::slice::Iter<'a, SqlArg>,
            entry: &'a Entry,
        }

        impl Eval<'_> {
            fn peek(&self) -> Option<&Tok> {
                self.toks.get(self.pos)
            }

            fn next(&mut self) -> Tok {
                self.pos += 1;
                self.toks[self.pos - 1].clone()
            }

            fn expect(&mut self, tok: Tok) {
                assert_eq!(self.next(), tok);
            }

            fn or(&mut self) -> bool {
                let mut value = self.and();
                while self.peek() == Some(&Tok::Word("OR".to_string())) {
                    self.next();
                    let rhs = self.and();
                    value = value || rhs;
                }
                value
            }

            fn and(&mut self) -> bool {
                let mut value = self.unary();
                while self.peek() == Some(&Tok::Word("AND".to_string())) {
                    self.next();
                    let rhs = self.unary();
                    value = value && rhs;
                }
                value
            }

            fn unary(&mut self) -> bool {
                if self.peek() == Some(&Tok::Word("NOT".to_string())) {
                    self.next();
                    return !self.unary();
                }
                if self.peek() == Some(&Tok::LParen) {
                    self.next();
                    let value = self.or();
                    self.expect(Tok::RParen);
                    return value;
                }
                self.comparison()
            }

            fn comparison(&mut self) -> bool {
                let lhs = self.operand();
                let op = match self.peek() {
                    Some(Tok::Op(op)) => op.clone(),
                    _ => return lhs.truthy(),
                };
                self.next();
                let rhs = self.operand();
                let ordering = match (&lhs, &rhs) {
                    (V::Str(a), V::Str(b)) => a.partial_cmp(b),
                    (V::Int(a), V::Int(b)) => a.partial_cmp(b),
                    (a, b) => num(a).partial_cmp(&num(b)),
                };
                match op.as_str() {
                    "=" => ordering == Some(Ordering::Equal),
                    "!=" => ordering != Some(Ordering::Equal),
                    ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    "<=" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    other => panic!("unsupported operator {other}"),
                }
            }

            fn operand(&mut self) -> V {
                match self.next() {
                    Tok::Num(n) => n
                        .parse::<i128>()
                        .map(V::Int)
                        .unwrap_or_else(|_| V::Float(n.parse().expect("number"))),
                    Tok::Str(s) => V::Str(s),
                    Tok::Arg => match self.args.next().expect("missing argument") {
                        SqlArg::Str(s) => V::Str(s.clone()),
                        SqlArg::UInt(v) => V::Int(i128::from(*v)),
                        SqlArg::Int(v) => V::Int(i128::from(*v)),
                        SqlArg::Float(v) => V::Float(*v),
                    },
                    Tok::Word(word) => {
                        if self.peek() == Some(&Tok::LParen) {
                            return self.call(&word);
                        }
                        let column = self.column(&word);
                        if self.peek() == Some(&Tok::LBracket) {
                            self.next();
                            let key = match self.operand() {
                                V::Str(s) => s,
                                other => panic!("bad key {other:?}"),
                            };
                            self.expect(Tok::RBracket);
                            return match column {
                                V::StrMap(map) => V::Str(map.get(&key).cloned().unwrap_or_default()),
                                V::NumMap(map) => V::Float(map.get(&key).copied().unwrap_or(0.0)),
                                other => panic!("not a map {other:?}"),
                            };
                        }
                        column
                    }
                    other => panic!("unexpected token {other:?}"),
                }
            }

            fn call(&mut self, name: &str) -> V {
                self.expect(Tok::LParen);
                let mut args = vec![self.operand()];
                while self.peek() == Some(&Tok::Comma) {
                    self.next();
                    args.push(self.operand());
                }
                self.expect(Tok::RParen);
                match (name, args.as_slice()) {
                    ("notEmpty", [V::StrMap(m)]) => V::Bool(!m.is_empty()),
                    ("notEmpty", [V::NumMap(m)]) => V::Bool(!m.is_empty()),
                    ("mapContains", [V::StrMap(m), V::Str(k)]) => V::Bool(m.contains_key(k)),
                    ("mapContains", [V::NumMap(m), V::Str(k)]) => V::Bool(m.contains_key(k)),
                    _ => panic!("unsupported call {name}"),
                }
            }

            fn column(&self, name: &str) -> V {
                match Column::lookup(name).expect("unknown column").read(self.entry) {
                    ColumnValue::Text(s) => V::Str(s.to_string()),
                    ColumnValue::UInt(v) => V::Int(i128::from(v)),
                    ColumnValue::StringMap(m) => V::StrMap(m.clone()),
                    ColumnValue::NumberMap(m) => V::NumMap(m.clone()),
                }
            }
        }

        fn num(v: &V) -> f64 {
            match v {
                V::Int(i) => *i as f64,
                V::Float(f) => *f,
                other => panic!("not a number {other:?}"),
            }
        }

        pub fn eval(sql: &Sql, entry: &Entry) -> bool {
            let mut eval = Eval {
                toks: tokenize(&sql.text),
                pos: 0,
                args: sql.args.iter(),
                entry,
            };
            let value = eval.or();
            assert_eq!(eval.pos, eval.toks.len(), "trailing tokens in {}", sql.text);
            assert!(eval.args.next().is_none(), "unused arguments in {}", sql.text);
            value
        }
    }

    const FIELDS: [&str; 10] = [
        "time", "level", "element", "pod", "tags_string", "tags_number", "status", "user",
        "code", "missing",
    ];

    fn arb_entry() -> impl Strategy<Value = Entry> {
        (
            0u64..40,
            prop::sample::select(vec!["INFO", "ERROR", ""]),
            prop::sample::select(vec!["api", "web", ""]),
            prop::collection::btree_map(
                prop::sample::select(vec!["user".to_string(), "code".to_string()]),
                prop::sample::select(vec!["bob".to_string(), "7".to_string(), String::new()]),
                0..2,
            ),
            prop::collection::btree_map(
                prop::sample::select(vec!["status".to_string(), "code".to_string()]),
                prop::sample::select(vec![0.0, 7.0, 404.0, 500.0, 2.5]),
                0..2,
            ),
        )
            .prop_map(|(time, level, element, tags_string, tags_number)| Entry {
                time,
                level: level.to_string(),
                element: element.to_string(),
                tags_string,
                tags_number,
                ..Default::default()
            })
    }

    fn arb_number() -> impl Strategy<Value = Number> {
        prop_oneof![
            (0i64..50).prop_map(Number::Int),
            (0i64..100).prop_map(|v| Number::Float(v as f64 / 2.0)),
        ]
    }

    fn arb_operator() -> impl Strategy<Value = Operator> {
        let field = prop::sample::select(FIELDS.to_vec()).prop_map(str::to_string);
        let value = prop::sample::select(vec![
            "", "0", "7", "500", "2.5", "15", "bob", "api", "INFO", "ERROR",
        ])
        .prop_map(str::to_string);
        let leaf = prop_oneof![
            (field.clone(), value).prop_map(|(field, value)| Operator::Is { field, value }),
            field.clone().prop_map(|field| Operator::Exists { field }),
            (
                field,
                prop::option::of(arb_number()),
                prop::option::of(arb_number())
            )
                .prop_map(|(field, from, to)| Operator::Between { field, from, to }),
        ];
        leaf.prop_recursive(4, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Operator::And),
                prop::collection::vec(inner.clone(), 0..4).prop_map(Operator::Or),
                inner.prop_map(|op| Operator::Not(Box::new(op))),
            ]
        })
    }

    proptest! {
        #[test]
        fn sql_and_predicate_agree(op in arb_operator(), entry in arb_entry()) {
            let sql = op.sql();
            prop_assert_eq!(sql_eval::eval(&sql, &entry), op.matches(&entry), "sql: {}", sql.bind());
        }

        #[test]
        fn envelope_round_trip(op in arb_operator()) {
            let json = serde_json::to_vec(&op).expect("serialize");
            let decoded = Operator::decode(&json).expect("decode");
            prop_assert_eq!(decoded, Some(op));
        }

        #[test]
        fn not_negates(op in arb_operator(), entry in arb_entry()) {
            let not = Operator::Not(Box::new(op.clone()));
            prop_assert_eq!(not.matches(&entry), !op.matches(&entry));
        }
    }
}
