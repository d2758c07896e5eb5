// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request/response actions served on the control channel.

use journal::entry::Entry;
use journal::query::Query;
use journal::read::Reader;
use journal::util::{env_key, now_nanos};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::api::{Code, Request, Response};

pub const GET_ACTION: &str = "Get";
pub const INSERT_ACTION: &str = "Insert";
pub const LIVE_ACTION: &str = "Live";

#[derive(Debug, Deserialize)]
struct GetArgs {
    #[serde(rename = "Querys", alias = "Queries", default)]
    queries: Vec<GetQuery>,
}

#[derive(Debug, Deserialize)]
struct GetQuery {
    #[serde(rename = "Query")]
    query: Query,
}

#[derive(Debug, Deserialize)]
struct InsertArgs {
    #[serde(rename = "Log")]
    log: Entry,
}

/// Runs a request/response action under the request's timeout. A handler that panics or
/// outlives the timeout is answered with `InternalServerError` or `Timeout`.
pub async fn dispatch(request: Request, reader: Reader) -> Response {
    let request_id = request.request_id.clone();
    let timeout = request.timeout();
    let action = request.action.clone();

    let mut task = match action.as_str() {
        GET_ACTION => tokio::spawn(async move { get(request.args, &reader).await }),
        INSERT_ACTION => tokio::spawn(async move { insert(request.args, &reader).await }),
        other => {
            debug!("Unknown action {other}");
            return Response::error(
                request_id,
                Code::ActionNotFound,
                format!("Unknown action {other}"),
            );
        }
    };

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok((code, data))) => Response::new(request_id, code, data),
        Ok(Err(e)) if e.is_panic() => {
            error!("{action} handler panicked: {:?}", e);
            Response::error(request_id, Code::InternalServerError, "Internal server error")
        }
        Ok(Err(e)) => {
            error!("{action} handler did not complete: {e}");
            Response::error(request_id, Code::InternalServerError, "Internal server error")
        }
        Err(_) => {
            task.abort();
            warn!("{action} timed out after {}s", timeout.as_secs());
            Response::error(request_id, Code::Timeout, "Request timed out")
        }
    }
}

/// Decodes, validates and clamps every query, then answers the batch through the reader.
pub async fn get(args: Value, reader: &Reader) -> (Code, Value) {
    let args: GetArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => {
            return (
                Code::BadRequest,
                Value::String(format!("Invalid Get arguments: {e}")),
            )
        }
    };

    let mut queries = Vec::with_capacity(args.queries.len());
    for GetQuery { mut query } in args.queries {
        if let Err(e) = query.validate() {
            return (Code::BadRequest, Value::String(e.to_string()));
        }
        query.clamp_limits(reader.max_entries_limit());
        queries.push(query);
    }

    let result = reader.get(&queries).await;
    match serde_json::to_value(&result) {
        Ok(data) => (Code::Success, data),
        Err(e) => {
            error!("Unable to encode Get result: {e}");
            (Code::InternalServerError, Value::Null)
        }
    }
}

/// Writes one entry straight to the store, then makes it visible in the cache and to live
/// tails.
pub async fn insert(args: Value, reader: &Reader) -> (Code, Value) {
    let InsertArgs { log: mut entry } = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => {
            return (
                Code::BadRequest,
                Value::String(format!("Invalid Insert arguments: {e}")),
            )
        }
    };
    if entry.env_id.is_empty() {
        return (
            Code::BadRequest,
            Value::String("Log requires an env_id".to_string()),
        );
    }
    entry.env_id = env_key(&entry.env_id);
    if entry.time == 0 {
        entry.time = now_nanos();
    }

    let Some(connector) = reader.pool().try_get() else {
        warn!("Insert rejected, no store connector available");
        return (
            Code::DatabaseError,
            Value::String("No store connector available".to_string()),
        );
    };
    if let Err(e) = connector.insert_one(&entry).await {
        error!("Insert into {} failed: {e}", entry.env_id);
        return (Code::InternalServerError, Value::String(e.to_string()));
    }
    drop(connector);

    reader.cache().update(&[Arc::new(entry)]);
    (Code::Success, Value::Null)
}
