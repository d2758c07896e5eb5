// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use journal::cache::Cache;
use journal::ingest::IngestService;
use journal::read::Reader;
use journal::store::build_pool;

use journal_proxy::config::{Config, DEFAULT_LOG_LEVEL};
use journal_proxy::http::{serve_http, HttpState};
use journal_proxy::server::{serve_ws, AppState};

const LISTEN_HOST: [u8; 4] = [0, 0, 0, 0];

#[tokio::main]
pub async fn main() {
    let config = Config::new();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    let env_filter =
        format!("hyper=off,tungstenite=off,tokio_tungstenite=off,reqwest=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return;
        }
    };

    let cache = Cache::new(&config.journal);
    let pool = build_pool(&config.journal);
    if let Some(connector) = pool.try_get() {
        match connector.connect().await {
            Ok(()) => {
                let envs = cache
                    .warm_up(
                        &*connector,
                        config.journal.warm_up_rows,
                        config.journal.cache_values_limit,
                    )
                    .await;
                info!("Store connected, {envs} environments warmed up");
            }
            Err(e) => warn!("Store unreachable at startup, serving from cache: {e}"),
        }
    } else {
        warn!("No store configured, serving from cache only");
    }

    let token = CancellationToken::new();
    let (service, ingest) = IngestService::new(&config.journal, cache.clone(), pool.clone());
    let ingest_task = tokio::spawn(service.run(token.clone()));

    let ws_listener = match TcpListener::bind(SocketAddr::from((LISTEN_HOST, config.port))).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to bind websocket port {}: {e}", config.port);
            return;
        }
    };
    let http_listener =
        match TcpListener::bind(SocketAddr::from((LISTEN_HOST, config.http_port))).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Unable to bind HTTP port {}: {e}", config.http_port);
                return;
            }
        };
    info!(
        "journal-proxy listening on {} (websocket) and {} (http)",
        config.port, config.http_port
    );

    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
        shutdown.cancel();
    });

    let reader = Reader::new(&config.journal, cache.clone(), pool.clone());
    let ws_state = AppState {
        reader,
        ingest: ingest.clone(),
    };
    let http_state = HttpState {
        cache,
        pool,
        ingest,
    };

    // either server stopping takes the other one down with it
    let (ws_result, http_result) = tokio::join!(
        async {
            let result = serve_ws(ws_listener, ws_state, token.clone()).await;
            token.cancel();
            result
        },
        async {
            let result = serve_http(http_listener, http_state, token.clone()).await;
            token.cancel();
            result
        },
    );
    if let Err(e) = ws_result {
        error!("Websocket server stopped: {e}");
    }
    if let Err(e) = http_result {
        error!("HTTP server stopped: {e}");
    }

    token.cancel();
    if let Err(e) = ingest_task.await {
        error!("Ingest service terminated abnormally: {e}");
    }
    info!("journal-proxy stopped");
}
