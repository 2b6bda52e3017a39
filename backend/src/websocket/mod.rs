pub mod events;
pub mod manager;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use glimmr_shared::WsMessage;

pub use events::{JobEvent, Room};
pub use manager::EventGateway;

use crate::auth::{extract_bearer, Principal};
use crate::error::{ApiResult, AppError};
use crate::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /ws`. The token is checked before the upgrade; a bad or missing
/// token gets a plain 401 and never reaches the registry.
pub async fn websocket_handler(
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = extract_bearer(query.token.as_deref(), authorization);

    let principal = state.gateway.authenticate(token.as_deref())?;
    let ws = ws.map_err(|e| AppError::BadRequest(e.body_text()))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, principal)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, principal: Principal) {
    let gateway = state.gateway.clone();
    let (client_id, mut outbound) = gateway.register(principal).await;
    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Failed to serialize outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                    Ok(request) => inbound.handle_request(client_id, request).await,
                    Err(e) => {
                        inbound
                            .reject(client_id, AppError::BadRequest(format!("Malformed message: {}", e)))
                            .await
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    debug!(client_id = %client_id, "WebSocket session ended");
    gateway.disconnect(client_id).await;
}
