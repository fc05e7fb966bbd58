use super::state::AppState;
use crate::protocol::{ClientMessage, ServerEvent, SessionConfig, END_SENTINEL};
use crate::proxy::{FanoutSession, ProviderConnector};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({ "message": "STT Compare API is running" }))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

/// GET /ws/transcribe
/// Upgrade to the per-session duplex channel.
pub async fn transcribe_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

/// Drive one client session: config first, then fan audio out to the
/// upstream providers until the end sentinel, a stop message, or disconnect.
async fn handle_session(socket: WebSocket, state: AppState) {
    info!("client connected");
    let (mut sink, mut stream) = socket.split();

    // All provider events funnel through one channel so the client sees each
    // provider's own order, whatever the interleave between providers.
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(EVENT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Nothing happens before the config message.
    let Some(mut session_config) = await_config(&mut stream).await else {
        info!("client left before sending config");
        drop(event_tx);
        let _ = writer.await;
        return;
    };
    state.config.merge_credentials(&mut session_config);

    let mut session =
        match FanoutSession::start(&ProviderConnector, &session_config, event_tx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                warn!("session rejected: {}", e);
                let _ = event_tx.send(ServerEvent::session_error(e.to_string())).await;
                drop(event_tx);
                let _ = writer.await;
                return;
            }
        };

    // Every connect attempt may have failed; do not wait for the first
    // audio frame to notice.
    if session.live_count() == 0 {
        warn!("no upstream provider connected, ending session");
        let _ = event_tx
            .send(ServerEvent::session_error("all providers disconnected"))
            .await;
        session.shutdown().await;
        drop(event_tx);
        let _ = writer.await;
        return;
    }

    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(frame))) => {
                session.forward_frame(Bytes::from(frame));
                if session.live_count() == 0 {
                    warn!("all upstream providers failed, ending session");
                    let _ = event_tx
                        .send(ServerEvent::session_error("all providers disconnected"))
                        .await;
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                if text == END_SENTINEL
                    || matches!(
                        serde_json::from_str::<ClientMessage>(&text),
                        Ok(ClientMessage::Stop)
                    )
                {
                    debug!("client requested stop");
                    break;
                }
                warn!("unexpected text message during session");
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("client disconnected");
                break;
            }
            Some(Ok(_)) => {} // ping/pong handled by axum
            Some(Err(e)) => {
                warn!("client socket error: {}", e);
                break;
            }
        }
    }

    session.shutdown().await;
    drop(event_tx);
    let _ = writer.await;
    info!("session closed");
}

/// Wait for the initial config message, skipping anything else. Returns
/// `None` if the client leaves first.
async fn await_config(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<SessionConfig> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Config { config }) => return Some(config),
                Ok(ClientMessage::Stop) => return None,
                Err(_) if text == END_SENTINEL => return None,
                Err(e) => warn!("expected config message: {}", e),
            },
            Ok(Message::Binary(_)) => warn!("audio frame before config, dropping"),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                warn!("socket error before config: {}", e);
                return None;
            }
        }
    }
}
