// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use futures_util::{SinkExt, StreamExt};
use journal::cache::Cache;
use journal::config::JournalConfig;
use journal::ingest::IngestService;
use journal::read::Reader;
use journal::store::memory::MemoryConnector;
use journal::store::pool::ConnectorPool;
use journal::store::Connector;
use journal_proxy::server::{serve_ws, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct Proxy {
    addr: SocketAddr,
    store: Arc<MemoryConnector>,
    token: CancellationToken,
}

async fn start_proxy() -> Proxy {
    let config = JournalConfig {
        flush_interval: Duration::from_millis(20),
        flush_interval_step: Duration::from_millis(20),
        live_push_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let cache = Cache::new(&config);
    let store = Arc::new(MemoryConnector::new());
    let pool = ConnectorPool::new(vec![Arc::clone(&store) as Arc<dyn Connector>]);
    let token = CancellationToken::new();

    let (service, ingest) = IngestService::new(&config, cache.clone(), pool.clone());
    tokio::spawn(service.run(token.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = AppState {
        reader: Reader::new(&config, cache, pool),
        ingest,
    };
    tokio::spawn(serve_ws(listener, state, token.clone()));

    Proxy { addr, store, token }
}

async fn next_response<S>(stream: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("response in time")
            .expect("open connection")
            .expect("frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json response");
        }
    }
}

#[tokio::test]
async fn ingest_then_get_over_websockets() {
    let proxy = start_proxy().await;

    let (mut ingest, _) = tokio_tungstenite::connect_async(format!("ws://{}/in", proxy.addr))
        .await
        .expect("connect ingest");
    let message = json!({
        "EnvID": "Prod",
        "Element": "api",
        "Pod": "api-0",
        "Parser": "status={{status}}",
        "Data": "status=200\nstatus=503"
    });
    ingest
        .send(Message::Text(message.to_string()))
        .await
        .expect("send ingest");

    tokio::time::timeout(Duration::from_secs(2), async {
        while proxy.store.inserted() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entries stored");

    let (mut control, _) = tokio_tungstenite::connect_async(format!("ws://{}/", proxy.addr))
        .await
        .expect("connect control");
    let request = json!({
        "RequestID": "get-1",
        "Action": "Get",
        "Args": {"Querys": [{"Query": {
            "Type": "RANGE", "EnvID": "prod", "TimeBegin": "1", "Limit": 10, "FullLog": true
        }}]}
    });
    control
        .send(Message::Text(request.to_string()))
        .await
        .expect("send get");

    let response = next_response(&mut control).await;
    assert_eq!(response["RequestID"], "get-1");
    assert_eq!(response["Code"], 0);
    let levels: Vec<&str> = response["Data"]["Entries"]
        .as_array()
        .expect("entries")
        .iter()
        .filter_map(|entry| entry["level"].as_str())
        .collect();
    assert_eq!(levels, vec!["INFO", "ERROR"]);

    proxy.token.cancel();
}

#[tokio::test]
async fn live_pushes_follow_ingest() {
    let proxy = start_proxy().await;

    let (mut control, _) = tokio_tungstenite::connect_async(format!("ws://{}/", proxy.addr))
        .await
        .expect("connect control");
    let request = json!({
        "RequestID": "live-1",
        "Action": "Live",
        "Args": {"Subs": [{"EnvID": "prod", "Limit": 10, "Elements": ["api"]}]}
    });
    control
        .send(Message::Text(request.to_string()))
        .await
        .expect("send live");
    let backlog = next_response(&mut control).await;
    assert_eq!(backlog["RequestID"], "live-1");
    assert_eq!(backlog["Data"], json!([]));

    let (mut ingest, _) = tokio_tungstenite::connect_async(format!("ws://{}/in", proxy.addr))
        .await
        .expect("connect ingest");
    let message = json!({"EnvID": "prod", "Element": "api", "Data": "hello"});
    ingest
        .send(Message::Text(message.to_string()))
        .await
        .expect("send ingest");

    let pushed = next_response(&mut control).await;
    assert_eq!(pushed["RequestID"], "live-1");
    assert_eq!(pushed["Code"], 0);
    assert_eq!(pushed["Data"][0]["message"], "hello");

    proxy.token.cancel();
}

#[tokio::test]
async fn unknown_path_is_rejected() {
    let proxy = start_proxy().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{}/elsewhere", proxy.addr)).await;
    assert!(result.is_err());
    proxy.token.cancel();
}

#[tokio::test]
async fn unknown_action_and_bad_frames() {
    let proxy = start_proxy().await;
    let (mut control, _) = tokio_tungstenite::connect_async(format!("ws://{}/", proxy.addr))
        .await
        .expect("connect control");

    control
        .send(Message::Text(json!({"RequestID": 9, "Action": "Nope"}).to_string()))
        .await
        .expect("send");
    let response = next_response(&mut control).await;
    assert_eq!(response, json!({"RequestID": 9, "Code": 60, "Data": "Unknown action Nope"}));

    control
        .send(Message::Text("{".to_string()))
        .await
        .expect("send");
    let response = next_response(&mut control).await;
    assert_eq!(response["Code"], 1);

    proxy.token.cancel();
}
