// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control channel envelope: `{RequestID, Action, Args, Timeout}` in, `{RequestID, Code, Data}`
//! out.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::time::Duration;

pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Success,
    BadRequest,
    InternalServerError,
    Timeout,
    DatabaseError,
    ActionNotFound,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        match self {
            Code::Success => 0,
            Code::BadRequest => 1,
            Code::InternalServerError => 6,
            Code::Timeout => 7,
            Code::DatabaseError => 11,
            Code::ActionNotFound => 60,
        }
    }
}

impl Serialize for Code {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Request {
    #[serde(rename = "RequestID", default)]
    pub request_id: Value,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Args", default)]
    pub args: Value,
    /// Seconds.
    #[serde(rename = "Timeout", default)]
    pub timeout: Option<u64>,
}

impl Request {
    pub fn decode(payload: &[u8]) -> Result<Request, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Requested timeout clamped to the allowed window.
    pub fn timeout(&self) -> Duration {
        self.timeout
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
            .clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "RequestID")]
    pub request_id: Value,
    #[serde(rename = "Code")]
    pub code: Code,
    #[serde(rename = "Data")]
    pub data: Value,
}

impl Response {
    pub fn new(request_id: Value, code: Code, data: Value) -> Self {
        Response {
            request_id,
            code,
            data,
        }
    }

    pub fn ok(request_id: Value, data: Value) -> Self {
        Self::new(request_id, Code::Success, data)
    }

    /// Error response carrying a short description for the client.
    pub fn error(request_id: Value, code: Code, message: impl Into<String>) -> Self {
        Self::new(request_id, code, Value::String(message.into()))
    }
}
