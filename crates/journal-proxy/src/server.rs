// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Websocket listener. The handshake path picks the connection's role: `/in` streams ingest
//! messages, `/` is the request/response control channel.

use journal::ingest::IngestHandle;
use journal::read::Reader;
use std::io;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::ingest::serve_ingest;
use crate::session::serve_control;

pub const INGEST_PATH: &str = "/in";
pub const CONTROL_PATH: &str = "/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Ingest,
    Control,
}

impl Endpoint {
    fn from_path(path: &str) -> Option<Endpoint> {
        match path {
            INGEST_PATH => Some(Endpoint::Ingest),
            CONTROL_PATH | "" => Some(Endpoint::Control),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub reader: Reader,
    pub ingest: IngestHandle,
}

pub async fn serve_ws(
    listener: TcpListener,
    state: AppState,
    token: CancellationToken,
) -> io::Result<()> {
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = token.cancelled() => {
                debug!("Websocket listener shutting down");
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
                    error!("Websocket server error: {e}");
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
                    error!("Websocket connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        joinset.spawn(handle_connection(conn, state.clone(), token.child_token()));
    }
}

async fn handle_connection(conn: TcpStream, state: AppState, token: CancellationToken) {
    let mut endpoint = None;
    let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Endpoint::from_path(request.uri().path()) {
            Some(found) => {
                endpoint = Some(found);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("Unknown endpoint".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(conn, route).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Websocket handshake failed: {e}");
            return;
        }
    };

    match endpoint {
        Some(Endpoint::Ingest) => serve_ingest(ws, state.ingest, token).await,
        Some(Endpoint::Control) => serve_control(ws, state.reader, token).await,
        None => {}
    }
}
