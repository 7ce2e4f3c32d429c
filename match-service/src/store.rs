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

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use connect4_common::{CompletedGame, DRAW_MARKER, FinishReason, LeaderboardEntry};
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait GameRecorder: Send + Sync {
    async fn record_completed_game(&self, game: &CompletedGame) -> anyhow::Result<()>;
    async fn fetch_leaderboard(&self) -> anyhow::Result<Vec<LeaderboardEntry>>;
}

pub struct DynamoGameStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoGameStore {
    /// Returns `None` unless a DynamoDB endpoint or AWS region is configured.
    pub async fn from_env() -> Option<Self> {
        if std::env::var("DYNAMODB_ENDPOINT").is_err() && std::env::var("AWS_REGION").is_err() {
            return None;
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let table_name = std::env::var("COMPLETED_GAMES_TABLE")
            .ok()
            .unwrap_or_else(|| "completed_games".to_string());

        info!(table_name = %table_name, "match-service DynamoDB game store enabled");
        Some(Self {
            client: DynamoClient::new(&config),
            table_name,
        })
    }
}

#[async_trait]
impl GameRecorder for DynamoGameStore {
    async fn record_completed_game(&self, game: &CompletedGame) -> anyhow::Result<()> {
        let mut item = HashMap::new();
        item.insert("game_id".to_string(), AttributeValue::S(game.game_id.clone()));
        item.insert(
            "player_one".to_string(),
            AttributeValue::S(game.player_one.clone()),
        );
        item.insert(
            "player_two".to_string(),
            AttributeValue::S(game.player_two.clone()),
        );
        item.insert("winner".to_string(), AttributeValue::S(game.winner.clone()));
        item.insert(
            "finish_reason".to_string(),
            AttributeValue::S(finish_reason_value(game.reason).to_string()),
        );
        item.insert(
            "finished_at".to_string(),
            AttributeValue::S(game.finished_at.to_rfc3339()),
        );

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .context("failed to put item into completed games table")?;
        Ok(())
    }

    async fn fetch_leaderboard(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let mut winners = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .projection_expression("#winner")
                .expression_attribute_names("#winner", "winner")
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("failed to scan completed games table")?;

            for item in output.items() {
                if let Some(Ok(winner)) = item.get("winner").map(AttributeValue::as_s) {
                    winners.push(winner.clone());
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(tally_leaderboard(winners.iter().map(String::as_str)))
    }
}

/// Process-local recorder used when DynamoDB is not configured.
#[derive(Default)]
pub struct InMemoryGameStore {
    games: RwLock<Vec<CompletedGame>>,
}

impl InMemoryGameStore {
    #[cfg(test)]
    pub async fn completed_games(&self) -> Vec<CompletedGame> {
        self.games.read().await.clone()
    }
}

#[async_trait]
impl GameRecorder for InMemoryGameStore {
    async fn record_completed_game(&self, game: &CompletedGame) -> anyhow::Result<()> {
        self.games.write().await.push(game.clone());
        Ok(())
    }

    async fn fetch_leaderboard(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let games = self.games.read().await;
        Ok(tally_leaderboard(games.iter().map(|game| game.winner.as_str())))
    }
}

/// Wins per identity, most wins first; draws never count.
pub fn tally_leaderboard<'a>(winners: impl IntoIterator<Item = &'a str>) -> Vec<LeaderboardEntry> {
    let mut wins: HashMap<&str, u64> = HashMap::new();
    for winner in winners {
        if winner == DRAW_MARKER || winner.is_empty() {
            continue;
        }
        *wins.entry(winner).or_default() += 1;
    }

    let mut entries: Vec<LeaderboardEntry> = wins
        .into_iter()
        .map(|(username, wins)| LeaderboardEntry {
            username: username.to_string(),
            wins,
        })
        .collect();
    entries.sort_by(|a, b| b.wins.cmp(&a.wins).then_with(|| a.username.cmp(&b.username)));
    entries
}

fn finish_reason_value(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::FourInARow => "FOUR_IN_A_ROW",
        FinishReason::BoardFull => "BOARD_FULL",
        FinishReason::OpponentDisconnected => "OPPONENT_DISCONNECTED",
    }
}
