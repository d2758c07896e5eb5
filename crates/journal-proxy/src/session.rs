// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One control connection: requests are decoded from frames and answered concurrently, live
//! pushes share the connection's outbound queue.

use futures_util::{SinkExt, StreamExt};
use journal::entry::Entry;
use journal::read::live::LiveRequest;
use journal::read::Reader;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::actions::{self, LIVE_ACTION};
use crate::api::{Code, Request, Response};

const RESPONSE_CHANNEL_CAPACITY: usize = 256;
const LIVE_CHANNEL_CAPACITY: usize = 16;

struct Session {
    reader: Reader,
    responses: mpsc::Sender<Response>,
    token: CancellationToken,
    /// Token of the running live tail, replaced by every `Live` request.
    live: Option<CancellationToken>,
}

pub async fn serve_control<S>(ws: WebSocketStream<S>, reader: Reader, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (responses, mut outbound) = mpsc::channel::<Response>(RESPONSE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(response) = outbound.recv().await {
            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(e) => {
                    error!("Unable to encode response: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Control connection closed while writing: {e}");
                break;
            }
        }
    });

    let mut session = Session {
        reader,
        responses,
        token: token.clone(),
        live: None,
    };

    loop {
        let frame = tokio::select! {
            () = token.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => session.handle(text.as_bytes()).await,
            Some(Ok(Message::Binary(bytes))) => session.handle(&bytes).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Control connection error: {e}");
                break;
            }
        }
    }

    session.stop_live();
    debug!("Control connection closed");
}

impl Session {
    async fn handle(&mut self, payload: &[u8]) {
        let request = match Request::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                self.respond(Response::error(
                    Value::Null,
                    Code::BadRequest,
                    format!("Invalid request: {e}"),
                ))
                .await;
                return;
            }
        };

        if request.action == LIVE_ACTION {
            self.live(request).await;
            return;
        }

        let reader = self.reader.clone();
        let responses = self.responses.clone();
        tokio::spawn(async move {
            let response = actions::dispatch(request, reader).await;
            if responses.send(response).await.is_err() {
                debug!("Control connection closed before the response was sent");
            }
        });
    }

    /// Replaces the running tail. `Cancel` (or no filters) only stops it and is acknowledged
    /// with an empty success.
    async fn live(&mut self, request: Request) {
        let decoded = serde_json::to_vec(&request.args)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                LiveRequest::decode(&payload, self.reader.max_entries_limit())
                    .map_err(|e| e.to_string())
            });
        let live = match decoded {
            Ok(live) => live,
            Err(e) => {
                self.respond(Response::error(request.request_id, Code::BadRequest, e))
                    .await;
                return;
            }
        };

        self.stop_live();
        if live.cancel || live.subs.is_empty() {
            self.respond(Response::ok(request.request_id, Value::Null)).await;
            return;
        }

        let token = self.token.child_token();
        self.live = Some(token.clone());
        let (sink, pushes) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        tokio::spawn(forward_pushes(
            request.request_id,
            pushes,
            self.responses.clone(),
            token.clone(),
        ));

        let reader = self.reader.clone();
        tokio::spawn(async move {
            reader.live(&live.subs, &token, sink).await;
        });
    }

    fn stop_live(&mut self) {
        if let Some(previous) = self.live.take() {
            previous.cancel();
        }
    }

    async fn respond(&self, response: Response) {
        if self.responses.send(response).await.is_err() {
            debug!("Control connection closed before the response was sent");
        }
    }
}

/// Wraps every live batch in a success response carrying the `Live` request's id.
async fn forward_pushes(
    request_id: Value,
    mut pushes: mpsc::Receiver<Vec<Arc<Entry>>>,
    responses: mpsc::Sender<Response>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            () = token.cancelled() => break,
            batch = pushes.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        let data = match serde_json::to_value(&batch) {
            Ok(data) => data,
            Err(e) => {
                error!("Unable to encode live batch: {e}");
                continue;
            }
        };
        if responses
            .send(Response::ok(request_id.clone(), data))
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal::cache::Cache;
    use journal::config::JournalConfig;
    use journal::store::pool::ConnectorPool;
    use serde_json::json;
    use std::time::Duration;

    fn entry(time: u64) -> Arc<Entry> {
        Arc::new(Entry {
            time,
            env_id: "prod".to_string(),
            element: "api".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_forward_pushes_tags_request_id() {
        let token = CancellationToken::new();
        let (sink, pushes) = mpsc::channel(4);
        let (responses, mut outbound) = mpsc::channel(4);
        let forwarder = tokio::spawn(forward_pushes(
            json!("live-1"),
            pushes,
            responses,
            token.clone(),
        ));

        sink.send(vec![entry(1), entry(2)]).await.expect("send");
        let response = outbound.recv().await.expect("response");
        assert_eq!(response.request_id, json!("live-1"));
        assert_eq!(response.code, Code::Success);
        assert_eq!(response.data.as_array().map(Vec::len), Some(2));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .expect("forwarder stops")
            .expect("forwarder task");
    }

    #[tokio::test]
    async fn test_new_live_request_replaces_previous() {
        let config = JournalConfig {
            live_push_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let cache = Cache::new(&config);
        let reader = Reader::new(&config, cache.clone(), ConnectorPool::empty());
        let (responses, mut outbound) = mpsc::channel(16);
        let mut session = Session {
            reader,
            responses,
            token: CancellationToken::new(),
            live: None,
        };

        let live = |id: &str| {
            serde_json::to_vec(&json!({
                "RequestID": id,
                "Action": "Live",
                "Args": {"Subs": [{"EnvID": "prod", "Limit": 5}]}
            }))
            .expect("encode")
        };

        session.handle(&live("first")).await;
        let backlog = outbound.recv().await.expect("first backlog");
        assert_eq!(backlog.request_id, json!("first"));
        let first = session.live.clone().expect("first tail");

        session.handle(&live("second")).await;
        assert!(first.is_cancelled());
        let backlog = outbound.recv().await.expect("second backlog");
        assert_eq!(backlog.request_id, json!("second"));

        session
            .handle(br#"{"RequestID":"stop","Action":"Live","Args":{"Cancel":true}}"#)
            .await;
        let ack = outbound.recv().await.expect("cancel ack");
        assert_eq!(ack.request_id, json!("stop"));
        assert_eq!(ack.code, Code::Success);
        assert_eq!(ack.data, Value::Null);
        assert!(session.live.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_rejected() {
        let config = JournalConfig::default();
        let reader = Reader::new(&config, Cache::new(&config), ConnectorPool::empty());
        let (responses, mut outbound) = mpsc::channel(4);
        let mut session = Session {
            reader,
            responses,
            token: CancellationToken::new(),
            live: None,
        };

        session.handle(b"not json").await;
        let response = outbound.recv().await.expect("response");
        assert_eq!(response.code, Code::BadRequest);
        assert_eq!(response.request_id, Value::Null);

        session
            .handle(br#"{"RequestID":1,"Action":"Live","Args":{"Subs":[{"EnvID":""}]}}"#)
            .await;
        let response = outbound.recv().await.expect("response");
        assert_eq!(response.code, Code::BadRequest);
    }
}
