// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Template language used to pull tags out of plain-text lines.
//!
//! A template mixes literal spans with tags:
//!
//! - `{{field}}` captures up to the character that follows the tag
//! - `{{field|include:N}}` captures N words separated by that character
//! - `{{field|trim:'x'}}`, `trim_left`, `trim_right` strip characters from the capture
//!
//! Literal spans must match the line exactly.

use crate::errors::{LineError, TemplateError};

#[derive(Clone, Debug, PartialEq)]
enum Trim {
    Both(Vec<char>),
    Left(Vec<char>),
    Right(Vec<char>),
}

impl Trim {
    fn apply<'a>(&self, value: &'a str) -> &'a str {
        let strip = |set: &[char], c: char| {
            if set.is_empty() {
                c.is_whitespace()
            } else {
                set.contains(&c)
            }
        };
        match self {
            Trim::Both(set) => value.trim_matches(|c| strip(set.as_slice(), c)),
            Trim::Left(set) => value.trim_start_matches(|c| strip(set.as_slice(), c)),
            Trim::Right(set) => value.trim_end_matches(|c| strip(set.as_slice(), c)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Tag {
    field: String,
    /// Character following the tag in the template, `None` when the tag ends it.
    delimiter: Option<char>,
    include: usize,
    trims: Vec<Trim>,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Tag(Tag),
    Literal(Vec<char>),
}

/// A compiled template, reusable across lines.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    pub fn compile(grammar: &str) -> Result<Template, TemplateError> {
        let mut lexer = Lexer {
            chars: grammar.chars().collect(),
            pos: 0,
        };
        let mut tokens = Vec::new();
        let mut literal = Vec::new();

        while let Some(c) = lexer.peek() {
            if c == '{' && lexer.peek_at(1) == Some('{') {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Tag(lexer.tag()?));
            } else {
                literal.push(c);
                lexer.pos += 1;
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Template { tokens })
    }

    /// Runs the template over `line`, returning captured `(field, value)` pairs in template order.
    pub fn apply(&self, line: &str) -> Result<Vec<(String, String)>, LineError> {
        let input: Vec<char> = line.chars().collect();
        let mut pos = 0;
        let mut captures = Vec::new();

        for token in &self.tokens {
            match token {
                Token::Literal(expected) => {
                    for &want in expected {
                        let found = input.get(pos).copied();
                        if found != Some(want) {
                            return Err(LineError::Mismatch {
                                expected: want,
                                found,
                                position: pos,
                            });
                        }
                        pos += 1;
                    }
                }
                Token::Tag(tag) => {
                    let start = pos;
                    let mut words = tag.include;
                    while let Some(&c) = input.get(pos) {
                        if Some(c) == tag.delimiter {
                            words -= 1;
                            if words == 0 {
                                break;
                            }
                        }
                        pos += 1;
                    }
                    let raw: String = input[start..pos].iter().collect();
                    let value = tag
                        .trims
                        .iter()
                        .fold(raw.as_str(), |value, trim| trim.apply(value));
                    captures.push((tag.field.clone(), value.to_string()));
                }
            }
        }

        Ok(captures)
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Reads a property value, quoted with `'` or `"`, or bare up to `|` or `}`.
    fn value(&mut self, tag_start: usize) -> Result<String, TemplateError> {
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(TemplateError::UnterminatedTag(tag_start));
                }
                let value = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(value)
            }
            _ => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c != '|' && c != '}') {
                    self.pos += 1;
                }
                let value: String = self.chars[start..self.pos].iter().collect();
                Ok(value.trim().to_string())
            }
        }
    }

    fn tag(&mut self) -> Result<Tag, TemplateError> {
        let start = self.pos;
        self.pos += 2;
        self.skip_whitespace();

        let name_pos = self.pos;
        let field = self.word();
        if field.is_empty() {
            return Err(TemplateError::InvalidTagName(name_pos));
        }
        self.skip_whitespace();

        let mut tag = Tag {
            field,
            delimiter: None,
            include: 1,
            trims: Vec::new(),
        };

        while self.peek() == Some('|') {
            self.pos += 1;
            self.skip_whitespace();
            let prop_pos = self.pos;
            let name = self.word();
            self.skip_whitespace();
            let value = if self.peek() == Some(':') {
                self.pos += 1;
                self.skip_whitespace();
                self.value(start)?
            } else {
                String::new()
            };
            self.skip_whitespace();

            match name.as_str() {
                "include" => {
                    tag.include = value
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or(TemplateError::InvalidPropertyValue { name, value })?;
                }
                "trim" => tag.trims.push(Trim::Both(value.chars().collect())),
                "trim_left" => tag.trims.push(Trim::Left(value.chars().collect())),
                "trim_right" => tag.trims.push(Trim::Right(value.chars().collect())),
                _ => {
                    return Err(TemplateError::InvalidProperty {
                        name,
                        position: prop_pos,
                    })
                }
            }
        }

        if self.peek() != Some('}') || self.peek_at(1) != Some('}') {
            return Err(TemplateError::UnterminatedTag(start));
        }
        self.pos += 2;
        tag.delimiter = self.peek();

        Ok(tag)
    }
}
