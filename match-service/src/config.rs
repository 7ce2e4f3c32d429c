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

use std::time::Duration;

use anyhow::Context;
use connect4_common::{
    DEFAULT_BOT_MOVE_DELAY_MS, DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_RECONNECT_GRACE_MS,
    expand_env_vars,
};
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_PATH_VAR: &str = "MATCH_SERVICE_CONFIG_PATH";

/// Session timings, loaded from an optional YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub join_timeout_ms: u64,
    pub bot_move_delay_ms: u64,
    pub reconnect_grace_ms: u64,
    /// Persist games that end by disconnect forfeit.
    pub record_forfeits: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            bot_move_delay_ms: DEFAULT_BOT_MOVE_DELAY_MS,
            reconnect_grace_ms: DEFAULT_RECONNECT_GRACE_MS,
            record_forfeits: false,
        }
    }
}

impl SessionSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms.max(1))
    }

    pub fn bot_move_delay(&self) -> Duration {
        Duration::from_millis(self.bot_move_delay_ms.max(1))
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms.max(1))
    }
}

pub fn load_session_settings() -> SessionSettings {
    let path = std::env::var(CONFIG_PATH_VAR)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    match path {
        Some(path) => load_session_settings_from(&path),
        None => SessionSettings::default(),
    }
}

fn load_session_settings_from(path: &str) -> SessionSettings {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read session config file");
            return SessionSettings::default();
        }
    };

    if raw.trim().is_empty() {
        warn!(path = %path, "session config file is empty");
        return SessionSettings::default();
    }

    match parse_session_settings(&raw) {
        Ok(settings) => settings,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse session config yaml");
            SessionSettings::default()
        }
    }
}

fn parse_session_settings(raw: &str) -> anyhow::Result<SessionSettings> {
    let expanded = expand_env_vars(raw);
    serde_yaml::from_str(&expanded).context("invalid session settings")
}
