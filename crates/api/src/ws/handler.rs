use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dispatch_events::{outbound_channel, Outbound, OutboundReceiver};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::dispatch::{Dispatcher, Session};
use crate::state::AppState;

/// Close code sent when the server ends the session (policy violation).
const CLOSE_POLICY: u16 = 1008;

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is driven by a writer task (outbound
/// queue to sink) and the reader loop on the upgrade task.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.dispatcher))
}

/// Manage a single WebSocket connection after upgrade.
///
///   1. Sends `connected` with a fresh connection id.
///   2. Spawns a writer task draining the connection's outbound queue.
///   3. Feeds inbound text frames to the dispatcher.
///   4. Removes the connection from the registry and every channel on exit.
async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let (tx, rx) = outbound_channel();
    let mut session = Session::new(conn_id.clone(), tx);
    session.push(dispatcher.greet(&session));

    let (sink, mut stream) = socket.split();
    let mut send_task = tokio::spawn(write_outbound(sink, rx, conn_id.clone()));

    // Unregistered transports get one idle period to send `register`.
    let register_deadline = tokio::time::sleep(dispatcher.config().idle_timeout);
    tokio::pin!(register_deadline);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut register_deadline, if !session.is_registered() => {
                tracing::info!(conn_id = %conn_id, "No registration before timeout, closing");
                break;
            }
        };
        let Some(result) = frame else { break };

        let text = match result {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
                dispatcher.transport_pong(&session).await;
                continue;
            }
            // Pings are answered by the transport.
            Ok(Message::Ping(_)) => continue,
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        };

        let outcome = dispatcher.handle_text(&mut session, &text).await;
        for reply in outcome.replies {
            session.push(reply);
        }
        if outcome.disconnect {
            session.close_transport();
            break;
        }
    }

    // Clean up: registry entry and memberships, then let the writer flush.
    dispatcher.close(&session).await;
    drop(session);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        tracing::debug!(conn_id = %conn_id, "Writer did not drain in time");
        send_task.abort();
    }
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Forward queued frames to the socket until the queue closes or a
/// `Close` is requested.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    conn_id: String,
) {
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Message(message) => match message.to_json() {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    tracing::error!(conn_id = %conn_id, error = %e, "Failed to encode message");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Default::default()),
            Outbound::Close => {
                let frame = CloseFrame {
                    code: CLOSE_POLICY,
                    reason: "closed by server".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(conn_id = %conn_id, error = %e, "Close frame not sent");
                }
                break;
            }
        };
        if sink.send(message).await.is_err() {
            tracing::debug!(conn_id = %conn_id, "WebSocket sink closed");
            break;
        }
    }
}
