// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while compiling a parser template.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unterminated tag starting at {0}")]
    UnterminatedTag(usize),

    #[error("Invalid tag name at {0}")]
    InvalidTagName(usize),

    #[error("Invalid property {name:?} at {position}")]
    InvalidProperty { name: String, position: usize },

    #[error("Invalid value {value:?} for property {name}")]
    InvalidPropertyValue { name: String, value: String },
}

/// Raised when a line does not follow its template.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LineError {
    #[error("Expected {expected:?} at {position}, found {found:?}")]
    Mismatch {
        expected: char,
        found: Option<char>,
        position: usize,
    },
}

/// Errors raised while decoding or validating a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid query payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Query requires an EnvID")]
    MissingEnv,

    #[error("Range query requires TimeBegin or TimeEnd")]
    MissingRangeBound,

    #[error("{0} query requires a Time")]
    MissingTime(&'static str),
}

/// Errors raised by store connectors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Store returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Table does not exist")]
    UnknownTable,

    #[error("Unable to decode store rows: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Store is not connected")]
    NotConnected,
}
