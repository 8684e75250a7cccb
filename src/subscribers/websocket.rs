use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::state::GatewayState;
use crate::subscribers::registry::{RegistrationResult, Subscriber};
use crate::subscribers::types::{ClientMessage, PayloadView, ServerMessage, SubscriberId};

/// Query parameters accepted on the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// `full` (default) or `summary`
    pub view: Option<String>,
}

/// Why the serving loop ended
enum Exit {
    ClientGone,
    Shutdown,
    Evicted,
}

/// Handle WebSocket upgrade
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> Response {
    let view = match params.view.as_deref() {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Ignoring view parameter from {}: {}", remote_addr, e);
            PayloadView::default()
        }),
        None => PayloadView::default(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, view, remote_addr))
}

/// Serve one subscriber from registration until disconnect or shutdown
async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    view: PayloadView,
    remote_addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();
    let send_timeout = state.subscriber_config.send_timeout;
    let registry = state.pipeline.registry.clone();
    let drained = state.pipeline.drained.clone();

    let (subscriber, mut inbox) =
        Subscriber::new(Some(remote_addr), view, state.subscriber_config.buffer);
    let id = inbox.id;

    if registry.register(subscriber) == RegistrationResult::AtCapacity {
        warn!("Subscriber limit reached, rejecting {}", remote_addr);
        let msg = ServerMessage::Error {
            message: "Server at capacity".to_string(),
            code: "SERVER_FULL".to_string(),
        };
        let _ = send_message(&mut sender, &msg, send_timeout).await;
        close(&mut sender, close_code::AGAIN, "server at capacity", send_timeout).await;
        return;
    }

    info!("Subscriber {} connected from {} ({:?})", id, remote_addr, view);

    let connected = ServerMessage::Connected {
        subscriber_id: id,
        view,
    };
    if let Err(e) = send_message(&mut sender, &connected, send_timeout).await {
        error!("Failed to greet subscriber {}: {}", id, e);
        registry.unregister(&id);
        return;
    }

    let exit = loop {
        tokio::select! {
            biased;

            _ = drained.cancelled() => break Exit::Shutdown,

            _ = inbox.liveness.cancelled() => break Exit::Evicted,

            frame = inbox.frames.recv() => {
                let Some(frame) = frame else { break Exit::Evicted };
                if let Err(e) = send_text(&mut sender, frame, send_timeout).await {
                    warn!("Failed to send batch to subscriber {}: {}", id, e);
                    break Exit::ClientGone;
                }
            }

            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error for subscriber {}: {}", id, e);
                        break Exit::ClientGone;
                    }
                    None => break Exit::ClientGone,
                };

                match msg {
                    Message::Text(text) => {
                        let (response, disconnect) = handle_client_message(&text, id, &state);
                        if let Some(resp) = response {
                            if let Err(e) = send_message(&mut sender, &resp, send_timeout).await {
                                warn!("Failed to respond to subscriber {}: {}", id, e);
                                break Exit::ClientGone;
                            }
                        }
                        if disconnect {
                            break Exit::ClientGone;
                        }
                    }
                    Message::Close(_) => {
                        debug!("Subscriber {} closed the connection", id);
                        break Exit::ClientGone;
                    }
                    Message::Ping(data) => {
                        if timeout(send_timeout, sender.send(Message::Pong(data))).await.is_err() {
                            break Exit::ClientGone;
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    registry.unregister(&id);

    match exit {
        Exit::Shutdown => {
            // The final batch may still be buffered
            while let Ok(frame) = inbox.frames.try_recv() {
                if send_text(&mut sender, frame, send_timeout).await.is_err() {
                    break;
                }
            }
            close(&mut sender, close_code::AWAY, "server shutting down", send_timeout).await;
        }
        Exit::Evicted => {
            let msg = ServerMessage::Evicted {
                reason: "subscriber could not keep up".to_string(),
            };
            let _ = send_message(&mut sender, &msg, send_timeout).await;
            close(&mut sender, close_code::AGAIN, "slow consumer", send_timeout).await;
        }
        Exit::ClientGone => {}
    }

    info!("Subscriber {} disconnected", id);
}

/// Handle a control message and return an optional response and whether to hang up
fn handle_client_message(
    text: &str,
    id: SubscriberId,
    state: &GatewayState,
) -> (Option<ServerMessage>, bool) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Unparseable message from subscriber {}: {}", id, e);
            return (
                Some(ServerMessage::Error {
                    message: format!("Invalid message format: {}", e),
                    code: "PARSE_ERROR".to_string(),
                }),
                false,
            );
        }
    };

    match msg {
        ClientMessage::Heartbeat => (Some(ServerMessage::Ack), false),
        ClientMessage::SetView { view } => {
            if state.pipeline.registry.set_view(&id, view) {
                debug!("Subscriber {} switched to {:?}", id, view);
                (Some(ServerMessage::Ack), false)
            } else {
                (
                    Some(ServerMessage::Error {
                        message: "Subscriber not registered".to_string(),
                        code: "NOT_REGISTERED".to_string(),
                    }),
                    false,
                )
            }
        }
        ClientMessage::Disconnect => (None, true),
    }
}

type SocketSink = SplitSink<WebSocket, Message>;

async fn send_message(
    sender: &mut SocketSink,
    msg: &ServerMessage,
    limit: Duration,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    send_text(sender, json.into(), limit).await
}

async fn send_text(sender: &mut SocketSink, text: Utf8Bytes, limit: Duration) -> Result<(), String> {
    match timeout(limit, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("send timed out after {:?}", limit)),
    }
}

async fn close(sender: &mut SocketSink, code: u16, reason: &str, limit: Duration) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = timeout(limit, sender.send(Message::Close(Some(frame)))).await;
}
