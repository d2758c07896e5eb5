// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw ingest messages into entries.

pub mod template;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::entry::{Entry, Level, Message};
use crate::util::{env_key, is_numeric, now_nanos};
use template::Template;

/// Parses ingest messages. Compiled templates are cached per grammar string.
#[derive(Default)]
pub struct Parser {
    templates: Mutex<HashMap<String, Option<Arc<Template>>>>,
    last_time: AtomicU64,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&self, message: &Message) -> Vec<Entry> {
        let template = if message.parser.is_empty() {
            None
        } else {
            self.template(&message.parser)
        };

        split_logs(&message.data)
            .into_iter()
            .map(|line| {
                let mut entry = message.to_entry();
                match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(object)) => {
                        entry.message = line;
                        flatten_json(&mut entry, &object, "");
                    }
                    Ok(_) => entry.message = line,
                    Err(_) => {
                        if let Some(ref template) = template {
                            apply_template(&mut entry, template, &line);
                        }
                        if entry.message.is_empty() {
                            entry.message = line;
                        }
                    }
                }
                self.finish(&mut entry);
                entry
            })
            .collect()
    }

    fn template(&self, grammar: &str) -> Option<Arc<Template>> {
        #[allow(clippy::expect_used)]
        let mut templates = self.templates.lock().expect("lock poisoned");
        templates
            .entry(grammar.to_string())
            .or_insert_with(|| match Template::compile(grammar) {
                Ok(template) => Some(Arc::new(template)),
                Err(e) => {
                    warn!("Ignoring parser template {grammar:?}: {e}");
                    None
                }
            })
            .clone()
    }

    fn finish(&self, entry: &mut Entry) {
        let mut level = Level::from_hint(&entry.level);
        if let Some(status) = entry
            .tags_number
            .iter()
            .find(|(key, _)| key.ends_with("status"))
            .map(|(_, status)| *status)
        {
            level = Level::from_status(status);
        }
        entry.level = level.as_str().to_string();
        entry.event = entry.tags_string.get("event").is_some_and(|v| v == "true");
        entry.env_id = env_key(&entry.env_id);
        entry.time = self.next_time();
    }

    /// Ingest clock: wall-clock nanoseconds, strictly increasing per parser.
    fn next_time(&self) -> u64 {
        let now = now_nanos();
        let previous = self
            .last_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }
}

/// Splits raw data into logical lines without breaking multi-line JSON objects.
pub fn split_logs(data: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut depth = 0usize;
    let mut last = 0;

    for (idx, c) in data.char_indices() {
        let boundary = match c {
            '{' => {
                depth += 1;
                false
            }
            '}' => {
                depth = depth.saturating_sub(1);
                depth == 0
            }
            '\n' => depth == 0,
            _ => false,
        };
        if boundary {
            let end = idx + c.len_utf8();
            push_line(&mut lines, &data[last..end]);
            last = end;
        }
    }

    for rest in data[last..].split('\n') {
        push_line(&mut lines, rest);
    }
    lines
}

fn push_line(lines: &mut Vec<String>, raw: &str) {
    let line = raw.replace(['\n', '\t'], "").replace("  ", " ");
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

fn flatten_json(entry: &mut Entry, object: &Map<String, Value>, prefix: &str) {
    for (key, value) in object {
        if prefix.is_empty() {
            if key.eq_ignore_ascii_case("message") || key.eq_ignore_ascii_case("msg") {
                entry.message = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                continue;
            }
            if key.eq_ignore_ascii_case("level") {
                if let Some(level) = value.as_str() {
                    entry.level = level.to_string();
                }
                continue;
            }
        }

        let segment = env_key(key);
        if segment.is_empty() {
            continue;
        }
        let path = if prefix.is_empty() {
            segment
        } else {
            format!("{prefix}/{segment}")
        };

        match value {
            Value::Object(nested) => flatten_json(entry, nested, &path),
            Value::Array(items) => {
                let mut scalars = false;
                for item in items {
                    match item {
                        Value::Object(nested) => flatten_json(entry, nested, &path),
                        _ => scalars = true,
                    }
                }
                if scalars {
                    entry.tags_string.insert(path, value.to_string());
                }
            }
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    entry.tags_string.insert(path, s.to_string());
                }
            }
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    entry.tags_number.insert(path, n);
                }
            }
            Value::Bool(b) => {
                entry.tags_string.insert(path, b.to_string());
            }
            Value::Null => {}
        }
    }
}

fn apply_template(entry: &mut Entry, template: &Template, line: &str) {
    let captures = match template.apply(line) {
        Ok(captures) => captures,
        Err(e) => {
            debug!("Line does not match its template, keeping it unparsed: {e}");
            return;
        }
    };

    for (field, value) in captures {
        let field = env_key(&field);
        match field.as_str() {
            "" => {}
            "level" => entry.level = value,
            "message" | "msg" => entry.message = value,
            _ if is_numeric(&value) => {
                if let Ok(n) = value.parse::<f64>() {
                    entry.tags_number.insert(field, n);
                }
            }
            _ => {
                if !value.is_empty() {
                    entry.tags_string.insert(field, value);
                }
            }
        }
    }
}
