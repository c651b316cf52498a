use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::error::AppError;
use crate::notify::Channel;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    /// `order:{id}`, `courier:{id}` or `restaurant:{id}`.
    pub channel: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let channel: Channel = params
        .channel
        .parse()
        .map_err(AppError::Validation)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, channel)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events_tx.subscribe());
    let channel = channel.to_string();

    info!(channel, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(result) = events.next().await {
            // A lagged receiver skips to the live edge, dropping what it
            // missed.
            let Ok(envelope) = result else {
                continue;
            };
            if envelope.channel != channel {
                continue;
            }

            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}
