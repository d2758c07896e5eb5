// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plain HTTP side channel: environment deletion, liveness and ingest counters.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use journal::cache::Cache;
use journal::ingest::IngestHandle;
use journal::store::pool::ConnectorPool;
use serde_json::json;
use std::io;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DELETE_ENV_PATH: &str = "/delete-env";
pub const STATUS_PATH: &str = "/status";
pub const METRICS_PATH: &str = "/metrics";

pub type HttpResponse = Response<Full<Bytes>>;

#[derive(Clone)]
pub struct HttpState {
    pub cache: Cache,
    pub pool: ConnectorPool,
    pub ingest: IngestHandle,
}

/// Logs `message` and wraps it in a `{"message": ...}` body. Success statuses log at debug.
fn log_and_create_http_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
}

pub async fn endpoint_handler<B>(req: Request<B>, state: HttpState) -> http::Result<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::GET | &Method::POST | &Method::DELETE, DELETE_ENV_PATH) => {
            let env_id = query_param(req.uri().query(), "envID").unwrap_or_default();
            delete_env_handler(&env_id, &state).await
        }
        (&Method::GET, STATUS_PATH) => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"ok"))),
        (&Method::GET, METRICS_PATH) => match serde_json::to_vec(&state.ingest.stats()) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body))),
            Err(e) => log_and_create_http_response(
                &format!("Unable to encode ingest counters: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        },
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    }
}

/// Drops both tables of an environment and forgets it in the cache.
///
/// 400 without an `envID`, 200 when no store connector is idle (nothing to drop right now),
/// 204 once the tables are gone.
async fn delete_env_handler(env_id: &str, state: &HttpState) -> http::Result<HttpResponse> {
    if env_id.is_empty() {
        return log_and_create_http_response(
            "Missing envID query parameter",
            StatusCode::BAD_REQUEST,
        );
    }
    state.cache.drop_env(env_id);

    let Some(connector) = state.pool.try_get() else {
        return log_and_create_http_response(
            &format!("No store connector available, {env_id} not dropped from store"),
            StatusCode::OK,
        );
    };
    match connector.drop_tables(env_id).await {
        Ok(()) => {
            info!("Dropped environment {env_id}");
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
        }
        Err(e) => log_and_create_http_response(
            &format!("Unable to drop environment {env_id}: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

pub async fn serve_http(
    listener: TcpListener,
    state: HttpState,
    token: CancellationToken,
) -> io::Result<()> {
    let service = service_fn(move |req| endpoint_handler(req, state.clone()));
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = token.cancelled() => {
                debug!("HTTP listener shutting down");
                joinset.abort_all();
                return Ok(());
            },
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("HTTP server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("HTTP connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("HTTP connection error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use journal::config::JournalConfig;
    use journal::entry::Entry;
    use journal::ingest::IngestService;
    use journal::store::memory::MemoryConnector;
    use journal::store::Connector;
    use std::sync::Arc;

    fn state(pool: ConnectorPool) -> HttpState {
        let config = JournalConfig::default();
        let cache = Cache::new(&config);
        let (_service, ingest) = IngestService::new(&config, cache.clone(), pool.clone());
        HttpState {
            cache,
            pool,
            ingest,
        }
    }

    fn request(uri: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(())
            .expect("request")
    }

    async fn body(response: HttpResponse) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn entry(env: &str) -> Arc<Entry> {
        Arc::new(Entry {
            time: 1,
            env_id: env.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("a=1&envID=prod"), "envID"),
            Some("prod".to_string())
        );
        assert_eq!(query_param(Some("envID="), "envID"), Some(String::new()));
        assert_eq!(query_param(Some("a=1"), "envID"), None);
        assert_eq!(query_param(None, "envID"), None);
    }

    #[tokio::test]
    async fn test_delete_env_requires_env_id() {
        let response = endpoint_handler(request("/delete-env"), state(ConnectorPool::empty()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body(response).await.contains("envID"));
    }

    #[tokio::test]
    async fn test_delete_env_without_connector() {
        let state = state(ConnectorPool::empty());
        state.cache.update(&[entry("prod")]);
        let response = endpoint_handler(request("/delete-env?envID=prod"), state.clone())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.cache.is_empty("prod"));
    }

    #[tokio::test]
    async fn test_delete_env_drops_tables() {
        let store = Arc::new(MemoryConnector::new());
        store
            .insert_multi(&[entry("prod"), entry("staging")])
            .await
            .expect("insert");
        let pool = ConnectorPool::new(vec![Arc::clone(&store) as Arc<dyn Connector>]);
        let state = state(pool);
        state.cache.update(&[entry("prod")]);

        let response = endpoint_handler(request("/delete-env?envID=prod"), state.clone())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.cache.is_empty("prod"));
        let envs = store.existing_envs().await.expect("envs");
        assert_eq!(envs, vec!["staging".to_string()]);
    }

    #[tokio::test]
    async fn test_status_metrics_and_not_found() {
        let state = state(ConnectorPool::empty());
        let response = endpoint_handler(request("/status"), state.clone())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok");

        let response = endpoint_handler(request("/metrics"), state.clone())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let metrics: serde_json::Value =
            serde_json::from_str(&body(response).await).expect("json");
        assert_eq!(metrics["buffered"], 0);
        assert_eq!(metrics["pool_size"], 0);

        let response = endpoint_handler(request("/nope"), state)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
