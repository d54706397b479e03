use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use agentflow_core::types::ExecutionId;

use crate::protocol::StreamEvent;
use crate::stream::SubscriberRegistry;

/// Forward one execution's stream to a WebSocket until the stream ends or
/// the client goes away. The client sends nothing but control frames.
pub async fn handle_connection(
    ws: WebSocket,
    id: Result<ExecutionId, String>,
    registry: Arc<SubscriberRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut events = match id {
        Ok(id) => registry.subscribe(id),
        Err(message) => {
            let _ = send(&mut ws_tx, &StreamEvent::Error { message }).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send(&mut ws_tx, &event).await.is_err() {
                    debug!("WebSocket send failed");
                    break;
                }
                if event.is_final() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read error");
                    break;
                }
            },
        }
    }

    debug!("Connection closed");
}

async fn send<S>(ws_tx: &mut S, event: &StreamEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "Could not encode stream event");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}
