// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod config;
mod events;
mod session;
mod store;
mod timer;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use connect4_common::{ClientMessage, LeaderboardEntry, ServerMessage};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::load_session_settings,
    events::KafkaEventPublisher,
    session::{ClientChannel, SessionAuthority},
    store::{DynamoGameStore, GameRecorder, InMemoryGameStore},
};

#[derive(Clone)]
struct AppState {
    session: SessionAuthority,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    fn new(session: SessionAuthority) -> Self {
        Self {
            session,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "match_service=debug,tower_http=info".to_string()),
        )
        .init();

    let settings = load_session_settings();
    info!(
        join_timeout_ms = settings.join_timeout_ms,
        bot_move_delay_ms = settings.bot_move_delay_ms,
        reconnect_grace_ms = settings.reconnect_grace_ms,
        record_forfeits = settings.record_forfeits,
        "session settings loaded"
    );

    let recorder: Arc<dyn GameRecorder> = match DynamoGameStore::from_env().await {
        Some(store) => Arc::new(store),
        None => {
            info!("DynamoDB not configured; completed games are kept in memory");
            Arc::new(InMemoryGameStore::default())
        }
    };
    let session = SessionAuthority::new(
        settings,
        recorder,
        Arc::new(KafkaEventPublisher::from_env()?),
    );

    let app = build_router(AppState::new(session.clone()));

    let bind_addr = parse_bind_addr("MATCH_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "match-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    session.shutdown().await;
    info!("match-service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/leaderboard", get(leaderboard_handler))
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "match-service"}))
}

async fn leaderboard_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let entries = state
        .session
        .recorder()
        .fetch_leaderboard()
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to load leaderboard: {error}")))?;
    Ok(Json(entries))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connection_id = state.allocate_connection_id();
    let (tx, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();
    let channel = ClientChannel::new(connection_id, tx);
    debug!(connection_id, "client connected");

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if send_server_message(&mut socket, connection_id, &message).await.is_err() {
                    break;
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state.session, &channel, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(connection_id, error = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    state.session.disconnect(connection_id).await;
    debug!(connection_id, "client disconnected");
}

async fn handle_client_frame(session: &SessionAuthority, channel: &ClientChannel, raw: &str) {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(ClientMessage::Join { username }) => session.join(username, channel.clone()).await,
        Ok(ClientMessage::Move { column }) => session.play_move(channel.id(), column).await,
        Ok(ClientMessage::Reconnect { username }) => {
            session.reconnect(username, channel.clone()).await
        }
        Err(error) => {
            warn!(connection_id = channel.id(), error = %error, "ignoring malformed client frame");
        }
    }
}

async fn send_server_message(
    socket: &mut WebSocket,
    connection_id: u64,
    message: &ServerMessage,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(connection_id, error = %error, "failed to encode server message");
            return Ok(());
        }
    };
    socket
        .send(Message::Text(payload.into()))
        .await
        .map_err(|error| {
            warn!(connection_id, error = %error, "failed to push websocket message");
        })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
