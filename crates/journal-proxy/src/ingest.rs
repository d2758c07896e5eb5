// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use futures_util::StreamExt;
use journal::entry::Message as IngestMessage;
use journal::ingest::IngestHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Feeds every frame of an ingest connection to the pipeline. Each frame carries one encoded
/// message; frames that do not decode are skipped.
pub async fn serve_ingest<S>(
    mut ws: WebSocketStream<S>,
    handle: IngestHandle,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frames = 0u64;
    loop {
        let frame = tokio::select! {
            () = token.cancelled() => break,
            frame = ws.next() => frame,
        };
        let decoded = match frame {
            Some(Ok(Message::Text(text))) => ingest_frame(&handle, text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => ingest_frame(&handle, &bytes),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Ingest connection error: {e}");
                break;
            }
        };
        match decoded {
            Ok(_) => frames += 1,
            Err(e) => debug!("Skipping undecodable ingest frame: {e}"),
        }
    }
    debug!("Ingest connection closed after {frames} frames");
}

fn ingest_frame(handle: &IngestHandle, payload: &[u8]) -> Result<usize, serde_json::Error> {
    let message: IngestMessage = serde_json::from_slice(payload)?;
    Ok(handle.ingest(&message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal::cache::Cache;
    use journal::config::JournalConfig;
    use journal::ingest::IngestService;
    use journal::store::pool::ConnectorPool;

    #[tokio::test]
    async fn test_ingest_frame() {
        let config = JournalConfig::default();
        let cache = Cache::new(&config);
        let (_service, handle) = IngestService::new(&config, cache, ConnectorPool::empty());

        let produced = ingest_frame(
            &handle,
            br#"{"EnvID":"prod","Element":"api","Data":"first\nsecond"}"#,
        )
        .expect("decode");
        assert_eq!(produced, 2);
        assert_eq!(handle.stats().buffered, 2);

        assert!(ingest_frame(&handle, b"\x00garbage").is_err());
        assert_eq!(handle.stats().parsed_entries, 2);
    }
}
