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

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use connect4_common::{DRAW_MARKER, FinishReason, GameEvent, GameEventType};
use rdkafka::{
    Message,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    stats: Arc<RwLock<GameStats>>,
}

#[derive(Debug, Clone)]
struct KafkaSettings {
    bootstrap_servers: String,
    topic: String,
    consumer_group_id: String,
}

impl KafkaSettings {
    fn from_env() -> Self {
        Self {
            bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .ok()
                .unwrap_or_else(|| "kafka:9092".to_string()),
            topic: std::env::var("GAME_EVENTS_TOPIC")
                .ok()
                .unwrap_or_else(|| "game-events".to_string()),
            consumer_group_id: std::env::var("ANALYTICS_CONSUMER_GROUP_ID")
                .ok()
                .unwrap_or_else(|| "analytics-service-v1".to_string()),
        }
    }
}

/// Running totals over every lifecycle event seen on the topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct GameStats {
    games_started: u64,
    games_ended: u64,
    draws: u64,
    forfeits: u64,
    moves_played: u64,
    wins: BTreeMap<String, u64>,
    last_event_at: Option<DateTime<Utc>>,
}

impl GameStats {
    fn apply(&mut self, event: &GameEvent) {
        match event.event_type {
            GameEventType::GameStarted => self.games_started += 1,
            GameEventType::MovePlayed => self.moves_played += 1,
            GameEventType::GameEnded => {
                self.games_ended += 1;
                match event.winner.as_deref() {
                    Some(DRAW_MARKER) => self.draws += 1,
                    Some(winner) => *self.wins.entry(winner.to_string()).or_default() += 1,
                    None => {}
                }
                if event.reason == Some(FinishReason::OpponentDisconnected) {
                    self.forfeits += 1;
                }
            }
        }
        self.last_event_at = Some(
            self.last_event_at
                .map_or(event.created_at, |seen| seen.max(event.created_at)),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "analytics_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState {
        stats: Arc::new(RwLock::new(GameStats::default())),
    };

    let kafka = KafkaSettings::from_env();
    let consumer_stats = state.stats.clone();
    tokio::spawn(async move {
        if let Err(error) = run_event_consumer(kafka, consumer_stats).await {
            warn!(error = %error, "analytics consumer stopped");
        }
    });

    let app = build_router(state);
    let bind_addr = parse_bind_addr("ANALYTICS_SERVICE_BIND", "0.0.0.0:8085")?;
    info!(%bind_addr, "analytics-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for shutdown signal");
            }
        })
        .await?;
    info!("analytics-service shutting down");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats_handler))
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
    Json(serde_json::json!({"ok": true, "service": "analytics-service"}))
}

async fn stats_handler(State(state): State<AppState>) -> Json<GameStats> {
    Json(state.stats.read().await.clone())
}

async fn run_event_consumer(
    kafka: KafkaSettings,
    stats: Arc<RwLock<GameStats>>,
) -> anyhow::Result<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &kafka.bootstrap_servers)
        .set("group.id", &kafka.consumer_group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .context("failed to create analytics consumer")?;

    consumer
        .subscribe(&[&kafka.topic])
        .context("failed to subscribe analytics consumer")?;
    info!(topic = %kafka.topic, group = %kafka.consumer_group_id, "analytics-service subscribed");

    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(error) => {
                warn!(?error, "analytics kafka receive error");
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }
        };

        match message.payload().map(decode_event) {
            Some(Ok(event)) => {
                debug!(game_id = %event.game_id, event_type = ?event.event_type, "game event consumed");
                stats.write().await.apply(&event);
            }
            Some(Err(error)) => warn!(error = %error, "analytics failed to parse game event"),
            None => debug!("analytics skipped empty payload"),
        }

        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(?error, "analytics failed to commit consumed event");
        }
    }
}

fn decode_event(payload: &[u8]) -> anyhow::Result<GameEvent> {
    serde_json::from_slice(payload).context("invalid game event payload")
}
