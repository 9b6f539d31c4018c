//! Chat relay handlers: `POST /send-message` into the chat topic, and one
//! live consumer per WebSocket client pushing records out as text frames.
use crate::error::{ApiError, NOT_INITIALIZED};
use crate::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use townhall_engine::{Delivery, RecordStream};
use townhall_protocol::{ErrorBody, Offset, Record, SendMessageRequest, SendMessageResponse};

pub const STREAMING_ERROR: &str = "Streaming error";

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub async fn health() -> &'static str {
    "ok"
}

/// An empty body is treated as `{}`. Anything else must be a JSON object.
fn parse_send_request(body: &[u8]) -> Result<SendMessageRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SendMessageRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        tracing::warn!(error = %err, "rejecting malformed send-message body");
        ApiError::plain(StatusCode::BAD_REQUEST, format!("invalid message body: {err}"))
    })
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let msg = parse_send_request(&body)?.with_defaults();
    let value = serde_json::to_string(&msg)
        .map_err(|e| ApiError::plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match state.producer.send(msg.id(), &value).await {
        Ok(Delivery::Appended(meta)) => {
            tracing::info!(id = msg.id(), partition = meta.partition, offset = meta.offset, "message sent");
            Ok(Json(SendMessageResponse::ok()))
        }
        Ok(Delivery::Skipped) => {
            tracing::warn!(id = msg.id(), "send rejected, broker not initialized");
            Err(ApiError::not_initialized())
        }
        Err(err) => {
            tracing::error!(id = msg.id(), error = %err, "send failed");
            Err(ApiError::from_send_error(&err))
        }
    }
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| stream_to_client(socket, state))
}

async fn stream_to_client(mut socket: WebSocket, state: Arc<AppState>) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    tracing::info!(client_id, "websocket client connected");

    if !state.consumer.is_ready() {
        tracing::warn!(client_id, "closing client, broker not initialized");
        let _ = socket
            .send(Message::Text(ErrorBody::new(NOT_INITIALIZED).to_json().into()))
            .await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: NOT_INITIALIZED.into(),
            })))
            .await;
        return;
    }

    let records = match state.consumer.stream(Offset::End).await {
        Ok(records) => records,
        Err(err) => {
            tracing::error!(client_id, error = %err, "could not open consumer stream");
            close_with_stream_error(&mut socket).await;
            return;
        }
    };

    let exit = pump(socket, records, |record| Some(record.value)).await;
    tracing::info!(client_id, ?exit, "websocket client finished");
}

async fn close_with_stream_error<S>(sink: &mut S)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let _ = sink
        .send(Message::Text(ErrorBody::new(STREAMING_ERROR).to_json().into()))
        .await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: STREAMING_ERROR.into(),
        })))
        .await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    ClientClosed,
    StreamFailed,
    StreamEnded,
}

/// Forwards records to the socket until either side finishes. Records that
/// `frame` maps to `None` are skipped. Returning drops `records`, which
/// releases the consumer.
pub(crate) async fn pump<F>(socket: WebSocket, mut records: RecordStream, mut frame: F) -> PumpExit
where
    F: FnMut(Record) -> Option<String>,
{
    let (mut tx, mut rx) = socket.split();
    loop {
        tokio::select! {
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return PumpExit::ClientClosed,
                // Inbound frames carry nothing for us.
                Some(Ok(_)) => {}
            },
            next = records.next() => match next {
                Some(Ok(record)) => {
                    let Some(text) = frame(record) else { continue };
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        return PumpExit::ClientClosed;
                    }
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "consumer stream failed");
                    close_with_stream_error(&mut tx).await;
                    return PumpExit::StreamFailed;
                }
                None => {
                    let _ = tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "stream ended".into(),
                        })))
                        .await;
                    return PumpExit::StreamEnded;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_body_is_an_empty_message() {
        assert_eq!(parse_send_request(b"").unwrap(), SendMessageRequest::default());
        assert_eq!(parse_send_request(b" \n").unwrap(), SendMessageRequest::default());
    }

    #[test]
    fn malformed_body_is_a_400() {
        let err = parse_send_request(b"{not json").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.body.error.starts_with("invalid message body"), "{}", err.body.error);
    }
}
