//! WebSocket client for the telemetry feed.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::FeedError;
use crate::protocol::{ClientMessage, FeedMessage};
use crate::requests::RequestTracker;

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// Connected feed. Inbound frames other than responses are delivered on the
/// receiver returned by [`FeedClient::connect`].
pub struct FeedClient {
    outbound: mpsc::Sender<String>,
    tracker: RequestTracker,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FeedClient {
    /// Connect to the feed at `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<FeedMessage>), FeedError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(FeedError::InvalidUrl(url.to_string()));
        }
        let (socket, _) = connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();

        let tracker = RequestTracker::new();
        let (events_tx, events_rx) = mpsc::channel::<FeedMessage>(EVENT_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::warn!("Feed write failed: {}", err);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_tracker = tracker.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!("Feed read failed: {}", err);
                        break;
                    }
                };
                if !route_frame(&text, &reader_tracker, &events_tx).await {
                    break;
                }
            }
            reader_tracker.fail_all();
            tracing::info!("Feed connection closed");
        });

        Ok((
            Self {
                outbound: outbound_tx,
                tracker,
                reader,
                writer,
            },
            events_rx,
        ))
    }

    /// Correlated request/response. Rejects with [`FeedError::Timeout`]
    /// when no response arrives within `timeout_ms`.
    pub async fn request(
        &self,
        request_type: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, FeedError> {
        let pending = self.tracker.register();
        let frame = serde_json::to_string(&ClientMessage::Request {
            request_id: pending.request_id.clone(),
            request_type: request_type.to_string(),
            params,
        })?;

        if self.outbound.send(frame).await.is_err() {
            self.tracker.cancel(&pending.request_id);
            return Err(FeedError::Disconnected);
        }

        self.tracker
            .wait(pending, request_type, Duration::from_millis(timeout_ms))
            .await
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    /// Stop both socket tasks and reject outstanding requests.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.tracker.fail_all();
    }
}

/// Dispatch one inbound frame. Returns false once the event receiver is gone.
pub(crate) async fn route_frame(
    text: &str,
    tracker: &RequestTracker,
    events: &mpsc::Sender<FeedMessage>,
) -> bool {
    match FeedMessage::parse(text) {
        Ok(FeedMessage::Response {
            request_id,
            data,
            error,
        }) => {
            tracker.resolve(&request_id, data, error);
            true
        }
        Ok(message) => events.send(message).await.is_ok(),
        Err(err) => {
            tracing::debug!("Ignoring malformed feed frame: {}", err);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_frame_splits_responses_from_events() {
        let tracker = RequestTracker::new();
        let (tx, mut rx) = mpsc::channel(8);

        let pending = tracker.register();
        let response = format!(
            r#"{{"type":"response","request_id":"{}","data":[1,2]}}"#,
            pending.request_id
        );
        assert!(route_frame(&response, &tracker, &tx).await);
        assert!(route_frame(r#"{"type":"remove","hex":["A1"]}"#, &tracker, &tx).await);
        assert!(route_frame("not json", &tracker, &tx).await);

        let data = tracker
            .wait(pending, "list", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(data, serde_json::json!([1, 2]));
        assert_eq!(rx.recv().await.unwrap().kind(), "remove");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_frame_stops_when_receiver_dropped() {
        let tracker = RequestTracker::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!route_frame(r#"{"type":"new","aircraft":[]}"#, &tracker, &tx).await);
    }

    #[tokio::test]
    async fn test_connect_rejects_http_url() {
        let result = FeedClient::connect("http://localhost:1").await;
        assert!(matches!(result, Err(FeedError::InvalidUrl(_))));
    }
}
