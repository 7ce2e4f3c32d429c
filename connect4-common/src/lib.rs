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

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod board;
pub mod bot;

pub use board::{Board, CENTER_COLUMN, COLS, Disc, ROWS};
pub use bot::{BOT_DISC, choose_move, choose_move_for};

pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BOT_MOVE_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_GRACE_MS: u64 = 30_000;

/// Identity carried by the synthetic opponent.
pub const BOT_IDENTITY: &str = "BOT";
/// Stored in place of a winner when the board filled up.
pub const DRAW_MARKER: &str = "DRAW";

pub type GameId = String;
pub type Username = String;

/// Inbound client intents, one JSON object per WebSocket frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Join { username: Username },
    Move { column: i64 },
    Reconnect { username: Username },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchResult {
    Draw,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    FourInARow,
    BoardFull,
    OpponentDisconnected,
}

/// Outbound notifications. `player` and `turn` are 1-based slot numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    GameStart {
        player: u8,
    },
    StateUpdate {
        board: Board,
        turn: u8,
    },
    GameOver {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner: Option<Username>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<MatchResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FinishReason>,
    },
}

impl ServerMessage {
    pub fn state(board: Board, turn_slot: usize) -> Self {
        ServerMessage::StateUpdate {
            board,
            turn: slot_number(turn_slot),
        }
    }

    pub fn won(winner: &str) -> Self {
        ServerMessage::GameOver {
            winner: Some(winner.to_string()),
            result: None,
            reason: None,
        }
    }

    pub fn drawn() -> Self {
        ServerMessage::GameOver {
            winner: None,
            result: Some(MatchResult::Draw),
            reason: None,
        }
    }

    pub fn forfeited_to(winner: &str) -> Self {
        ServerMessage::GameOver {
            winner: Some(winner.to_string()),
            result: None,
            reason: Some(FinishReason::OpponentDisconnected),
        }
    }
}

pub fn slot_number(slot: usize) -> u8 {
    if slot == 0 { 1 } else { 2 }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameOutcome {
    Winner(Username),
    Draw,
}

impl GameOutcome {
    /// Winner identity, or the draw marker.
    pub fn label(&self) -> &str {
        match self {
            GameOutcome::Winner(identity) => identity,
            GameOutcome::Draw => DRAW_MARKER,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEventType {
    GameStarted,
    MovePlayed,
    GameEnded,
}

/// Lifecycle event published to the analytics topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_type: GameEventType,
    pub game_id: GameId,
    #[serde(default)]
    pub players: Option<Vec<Username>>,
    #[serde(default)]
    pub player: Option<Username>,
    #[serde(default)]
    pub column: Option<usize>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub reason: Option<FinishReason>,
    pub created_at: DateTime<Utc>,
}

impl GameEvent {
    fn bare(event_type: GameEventType, game_id: &str) -> Self {
        Self {
            event_type,
            game_id: game_id.to_string(),
            players: None,
            player: None,
            column: None,
            winner: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn game_started(game_id: &str, players: [&str; 2]) -> Self {
        Self {
            players: Some(players.iter().map(|p| p.to_string()).collect()),
            ..Self::bare(GameEventType::GameStarted, game_id)
        }
    }

    pub fn move_played(game_id: &str, player: &str, column: usize) -> Self {
        Self {
            player: Some(player.to_string()),
            column: Some(column),
            ..Self::bare(GameEventType::MovePlayed, game_id)
        }
    }

    pub fn game_ended(game_id: &str, outcome: &GameOutcome, reason: FinishReason) -> Self {
        Self {
            winner: Some(outcome.label().to_string()),
            reason: Some(reason),
            ..Self::bare(GameEventType::GameEnded, game_id)
        }
    }
}

/// Durable record of a finished game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedGame {
    pub game_id: GameId,
    pub player_one: Username,
    pub player_two: Username,
    /// Winner identity or [`DRAW_MARKER`].
    pub winner: String,
    pub reason: FinishReason,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    #[serde(rename = "winner")]
    pub username: Username,
    pub wins: u64,
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
