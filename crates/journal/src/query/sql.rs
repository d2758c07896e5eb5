// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::util::format_float;

/// A value bound to a `?` placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlArg {
    Str(String),
    UInt(u64),
    Int(i64),
    Float(f64),
}

impl SqlArg {
    /// Literal form of the value, quoted and escaped for strings.
    pub fn literal(&self) -> String {
        match self {
            SqlArg::Str(s) => {
                let mut quoted = String::with_capacity(s.len() + 2);
                quoted.push('\'');
                for c in s.chars() {
                    match c {
                        '\\' => quoted.push_str("\\\\"),
                        '\'' => quoted.push_str("\\'"),
                        _ => quoted.push(c),
                    }
                }
                quoted.push('\'');
                quoted
            }
            SqlArg::UInt(v) => v.to_string(),
            SqlArg::Int(v) => v.to_string(),
            SqlArg::Float(v) if v.is_nan() => "nan".to_string(),
            SqlArg::Float(v) if v.is_infinite() => {
                let inf = if *v > 0.0 { "inf" } else { "-inf" };
                inf.to_string()
            }
            SqlArg::Float(v) => format_float(*v),
        }
    }
}

/// SQL text with `?` placeholders and the arguments that fill them, in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sql {
    pub text: String,
    pub args: Vec<SqlArg>,
}

impl Sql {
    pub fn new(text: impl Into<String>) -> Sql {
        Sql {
            text: text.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(text: impl Into<String>, args: Vec<SqlArg>) -> Sql {
        Sql {
            text: text.into(),
            args,
        }
    }

    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    pub fn push_arg(&mut self, arg: SqlArg) -> &mut Self {
        self.text.push('?');
        self.args.push(arg);
        self
    }

    pub fn append(&mut self, other: Sql) -> &mut Self {
        self.text.push_str(&other.text);
        self.args.extend(other.args);
        self
    }

    /// Joins fragments with `separator`, wrapping the result in parentheses.
    pub fn join(parts: Vec<Sql>, separator: &str) -> Sql {
        let mut joined = Sql::new("(");
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                joined.push_str(separator);
            }
            joined.append(part);
        }
        joined.push_str(")");
        joined
    }

    /// Substitutes every placeholder outside quoted text with its argument literal.
    pub fn bind(&self) -> String {
        let mut bound = String::with_capacity(self.text.len() + self.args.len() * 8);
        let mut args = self.args.iter();
        let mut quote: Option<char> = None;
        let mut escaped = false;

        for c in self.text.chars() {
            match quote {
                Some(q) => {
                    bound.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == q {
                        quote = None;
                    }
                }
                None => match c {
                    '\'' | '"' | '`' => {
                        quote = Some(c);
                        bound.push(c);
                    }
                    '?' => match args.next() {
                        Some(arg) => bound.push_str(&arg.literal()),
                        None => bound.push(c),
                    },
                    _ => bound.push(c),
                },
            }
        }
        bound
    }
}
