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

//! Authoritative matchmaking and game state.
//!
//! Every mutation of the waiting queue, the active games and the reconnect
//! registry happens while holding the session lock. Recorder and publisher
//! calls are queued as effects and dispatched after the lock is released;
//! their failures are logged and never undo a transition.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use connect4_common::{
    BOT_IDENTITY, Board, CompletedGame, Disc, FinishReason, GameEvent, GameId, GameOutcome,
    ServerMessage, Username, choose_move, slot_number,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionSettings, events::EventPublisher, store::GameRecorder, timer::ScheduledTask,
};

pub type ConnectionId = u64;

/// Outbound half of one client connection.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientChannel {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            debug!(connection_id = self.id, "dropping notification for closed connection");
        }
    }
}

#[derive(Debug)]
enum Slot {
    Human {
        identity: Username,
        /// `None` while the player is disconnected.
        channel: Option<ClientChannel>,
    },
    Bot,
}

impl Slot {
    fn human(identity: Username, channel: ClientChannel) -> Self {
        Slot::Human {
            identity,
            channel: Some(channel),
        }
    }

    fn identity(&self) -> &str {
        match self {
            Slot::Human { identity, .. } => identity,
            Slot::Bot => BOT_IDENTITY,
        }
    }

    fn connection(&self) -> Option<ConnectionId> {
        match self {
            Slot::Human {
                channel: Some(channel),
                ..
            } => Some(channel.id()),
            _ => None,
        }
    }

    fn is_bot(&self) -> bool {
        matches!(self, Slot::Bot)
    }

    fn notify(&self, message: ServerMessage) {
        if let Slot::Human {
            channel: Some(channel),
            ..
        } = self
        {
            channel.send(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GameStatus {
    Active,
    Finished,
}

#[derive(Debug)]
struct Game {
    id: GameId,
    board: Board,
    slots: [Slot; 2],
    turn: usize,
    status: GameStatus,
    bot_turn: Option<ScheduledTask>,
}

impl Game {
    fn broadcast(&self, message: &ServerMessage) {
        for slot in &self.slots {
            slot.notify(message.clone());
        }
    }
}

#[derive(Debug)]
struct QueuedPlayer {
    ticket: u64,
    identity: Username,
    channel: ClientChannel,
    join_timer: ScheduledTask,
}

#[derive(Debug)]
struct GraceTimer {
    identity: Username,
    game_id: GameId,
    task: ScheduledTask,
}

#[derive(Debug, Default)]
struct SessionState {
    waiting: VecDeque<QueuedPlayer>,
    games: HashMap<GameId, Game>,
    connections: HashMap<ConnectionId, GameId>,
    /// Pending forfeits keyed by generation, one per vacated seat.
    grace_timers: HashMap<u64, GraceTimer>,
    next_ticket: u64,
    next_generation: u64,
}

impl SessionState {
    /// Queued, or seated in an active game.
    fn is_attached(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
            || self
                .waiting
                .iter()
                .any(|entry| entry.channel.id() == connection)
    }

    fn take_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn take_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

enum Effect {
    Publish(GameEvent),
    Record(CompletedGame),
}

#[derive(Clone)]
pub struct SessionAuthority {
    state: Arc<Mutex<SessionState>>,
    settings: SessionSettings,
    recorder: Arc<dyn GameRecorder>,
    events: Arc<dyn EventPublisher>,
}

impl SessionAuthority {
    pub fn new(
        settings: SessionSettings,
        recorder: Arc<dyn GameRecorder>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            settings,
            recorder,
            events,
        }
    }

    pub fn recorder(&self) -> &Arc<dyn GameRecorder> {
        &self.recorder
    }

    pub async fn join(&self, identity: Username, channel: ClientChannel) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.is_attached(channel.id()) {
                debug!(connection_id = channel.id(), identity = %identity, "ignoring join from a connection already queued or playing");
                return;
            }

            let ticket = state.take_ticket();
            let join_timer = self.schedule_join_timeout(ticket);
            info!(identity = %identity, ticket, queued = state.waiting.len() + 1, "player queued");
            state.waiting.push_back(QueuedPlayer {
                ticket,
                identity,
                channel,
                join_timer,
            });

            while state.waiting.len() >= 2 {
                let (Some(first), Some(second)) = (state.waiting.pop_front(), state.waiting.pop_front())
                else {
                    break;
                };
                first.join_timer.cancel();
                second.join_timer.cancel();
                self.start_game(
                    state,
                    [
                        Slot::human(first.identity, first.channel),
                        Slot::human(second.identity, second.channel),
                    ],
                    &mut effects,
                );
            }
        }
        self.dispatch(effects).await;
    }

    /// Applies a move from `connection`. Moves that are out of turn, target an
    /// illegal column, or come from a connection without an active game are
    /// ignored.
    pub async fn play_move(&self, connection: ConnectionId, column: i64) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(game_id) = state.connections.get(&connection).cloned() else {
                debug!(connection_id = connection, "ignoring move from connection without a game");
                return;
            };
            let Some(game) = state.games.get(&game_id) else {
                return;
            };
            if game.status != GameStatus::Active {
                return;
            }
            if game.slots[game.turn].connection() != Some(connection) {
                debug!(game_id = %game_id, connection_id = connection, "ignoring out-of-turn move");
                return;
            }
            let Ok(column) = usize::try_from(column) else {
                debug!(game_id = %game_id, column, "ignoring move with negative column");
                return;
            };
            self.apply_move(state, &game_id, column, &mut effects);
        }
        self.dispatch(effects).await;
    }

    /// Handles a closed transport. A queued connection leaves the queue; a
    /// connection seated in an active game starts the forfeit grace period.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(position) = state
            .waiting
            .iter()
            .position(|entry| entry.channel.id() == connection)
        {
            if let Some(entry) = state.waiting.remove(position) {
                entry.join_timer.cancel();
                info!(identity = %entry.identity, "queued player left before pairing");
            }
            return;
        }

        let Some(game_id) = state.connections.remove(&connection) else {
            return;
        };
        let Some(game) = state.games.get_mut(&game_id) else {
            return;
        };
        if game.status != GameStatus::Active {
            return;
        }
        let Some(Slot::Human { identity, channel }) = game
            .slots
            .iter_mut()
            .find(|slot| slot.connection() == Some(connection))
        else {
            return;
        };
        *channel = None;
        let identity = identity.clone();

        let generation = state.take_generation();
        let task = self.schedule_grace_expiry(generation);
        info!(
            identity = %identity,
            game_id = %game_id,
            grace_ms = self.settings.reconnect_grace_ms,
            "player disconnected; forfeit timer armed"
        );
        state.grace_timers.insert(
            generation,
            GraceTimer {
                identity,
                game_id,
                task,
            },
        );
    }

    /// Rebinds a disconnected identity to a new connection. A no-op unless a
    /// forfeit timer is pending for that identity.
    pub async fn reconnect(&self, identity: Username, channel: ClientChannel) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.is_attached(channel.id()) {
            debug!(connection_id = channel.id(), identity = %identity, "ignoring reconnect from a connection already queued or playing");
            return;
        }
        // The most recent vacated seat under this identity wins.
        let Some(generation) = state
            .grace_timers
            .iter()
            .filter(|(_, grace)| grace.identity == identity)
            .map(|(generation, _)| *generation)
            .max()
        else {
            debug!(identity = %identity, "ignoring reconnect without a pending forfeit");
            return;
        };
        let Some(grace) = state.grace_timers.remove(&generation) else {
            return;
        };
        grace.task.cancel();

        let Some(game) = state.games.get_mut(&grace.game_id) else {
            return;
        };
        if game.status != GameStatus::Active {
            return;
        }
        let Some(Slot::Human {
            channel: vacant, ..
        }) = game.slots.iter_mut().find(|slot| {
            matches!(slot, Slot::Human { identity: seated, channel: None } if *seated == identity)
        })
        else {
            return;
        };
        *vacant = Some(channel.clone());
        channel.send(ServerMessage::state(game.board, game.turn));
        state.connections.insert(channel.id(), grace.game_id.clone());
        info!(identity = %identity, game_id = %grace.game_id, "player reconnected");
    }

    /// Cancels every pending timer and drops all sessions.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for entry in state.waiting.drain(..) {
            entry.join_timer.cancel();
        }
        for (_, grace) in state.grace_timers.drain() {
            grace.task.cancel();
        }
        for game in state.games.values() {
            if let Some(task) = &game.bot_turn {
                task.cancel();
            }
        }
        let active_games = state.games.len();
        state.games.clear();
        state.connections.clear();
        info!(active_games, "session authority shut down");
    }

    async fn expire_join(&self, ticket: u64) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(position) = state.waiting.iter().position(|entry| entry.ticket == ticket)
            else {
                return;
            };
            let Some(entry) = state.waiting.remove(position) else {
                return;
            };
            info!(identity = %entry.identity, "join timeout elapsed; pairing with bot");
            self.start_game(
                state,
                [Slot::human(entry.identity, entry.channel), Slot::Bot],
                &mut effects,
            );
        }
        self.dispatch(effects).await;
    }

    async fn play_bot_turn(&self, game_id: &str) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(game) = state.games.get_mut(game_id) else {
                debug!(game_id = %game_id, "bot turn skipped; game already finished");
                return;
            };
            game.bot_turn = None;
            if game.status != GameStatus::Active || !game.slots[game.turn].is_bot() {
                return;
            }
            let Some(column) = choose_move(&game.board) else {
                return;
            };
            self.apply_move(state, game_id, column, &mut effects);
        }
        self.dispatch(effects).await;
    }

    async fn expire_grace(&self, generation: u64) {
        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(GraceTimer {
                identity, game_id, ..
            }) = state.grace_timers.remove(&generation)
            else {
                return;
            };
            let Some(game) = state.games.get(&game_id) else {
                return;
            };
            if game.status != GameStatus::Active {
                return;
            }
            let Some(loser) = game.slots.iter().position(|slot| {
                matches!(slot, Slot::Human { identity: seated, channel: None } if *seated == identity)
            }) else {
                return;
            };
            let winner = game.slots[1 - loser].identity().to_string();
            info!(
                game_id = %game_id,
                identity = %identity,
                winner = %winner,
                "reconnect grace expired; game forfeited"
            );
            self.finish_game(
                state,
                &game_id,
                GameOutcome::Winner(winner),
                FinishReason::OpponentDisconnected,
                &mut effects,
            );
        }
        self.dispatch(effects).await;
    }

    fn start_game(&self, state: &mut SessionState, slots: [Slot; 2], effects: &mut Vec<Effect>) {
        let game_id = Uuid::new_v4().to_string();
        let board = Board::empty();

        for (index, slot) in slots.iter().enumerate() {
            slot.notify(ServerMessage::GameStart {
                player: slot_number(index),
            });
            slot.notify(ServerMessage::state(board, 0));
            if let Some(connection) = slot.connection() {
                state.connections.insert(connection, game_id.clone());
            }
        }

        info!(
            game_id = %game_id,
            player_one = %slots[0].identity(),
            player_two = %slots[1].identity(),
            "game started"
        );
        effects.push(Effect::Publish(GameEvent::game_started(
            &game_id,
            [slots[0].identity(), slots[1].identity()],
        )));

        let bot_turn = slots[0].is_bot().then(|| self.schedule_bot_turn(&game_id));
        state.games.insert(
            game_id.clone(),
            Game {
                id: game_id,
                board,
                slots,
                turn: 0,
                status: GameStatus::Active,
                bot_turn,
            },
        );
    }

    /// Drop, then win check, then draw check, then turn flip.
    fn apply_move(
        &self,
        state: &mut SessionState,
        game_id: &str,
        column: usize,
        effects: &mut Vec<Effect>,
    ) {
        let Some(game) = state.games.get_mut(game_id) else {
            return;
        };
        let mover = game.turn;
        let disc = Disc::for_slot(mover);
        let Some(row) = game.board.drop_disc(column, disc) else {
            debug!(game_id = %game_id, column, "ignoring move into a full or missing column");
            return;
        };

        let identity = game.slots[mover].identity().to_string();
        debug!(game_id = %game_id, identity = %identity, column, row, "move applied");
        effects.push(Effect::Publish(GameEvent::move_played(
            game_id, &identity, column,
        )));

        let verdict = if game.board.has_win(disc) {
            Some((GameOutcome::Winner(identity), FinishReason::FourInARow))
        } else if game.board.is_draw() {
            Some((GameOutcome::Draw, FinishReason::BoardFull))
        } else {
            game.turn = 1 - mover;
            game.broadcast(&ServerMessage::state(game.board, game.turn));
            if game.slots[game.turn].is_bot() {
                game.bot_turn = Some(self.schedule_bot_turn(game_id));
            }
            None
        };

        if let Some((outcome, reason)) = verdict {
            self.finish_game(state, game_id, outcome, reason, effects);
        }
    }

    fn finish_game(
        &self,
        state: &mut SessionState,
        game_id: &str,
        outcome: GameOutcome,
        reason: FinishReason,
        effects: &mut Vec<Effect>,
    ) {
        let Some(mut game) = state.games.remove(game_id) else {
            return;
        };
        game.status = GameStatus::Finished;

        let notice = match (&outcome, reason) {
            (GameOutcome::Draw, _) => ServerMessage::drawn(),
            (GameOutcome::Winner(winner), FinishReason::OpponentDisconnected) => {
                ServerMessage::forfeited_to(winner)
            }
            (GameOutcome::Winner(winner), _) => ServerMessage::won(winner),
        };
        // The disconnected side has no channel, so only a connected opponent hears a forfeit.
        game.broadcast(&notice);

        for slot in &game.slots {
            if let Some(connection) = slot.connection() {
                state.connections.remove(&connection);
            }
        }
        state.grace_timers.retain(|_, grace| {
            if grace.game_id == game.id {
                grace.task.cancel();
                return false;
            }
            true
        });

        info!(
            game_id = %game.id,
            winner = %outcome.label(),
            reason = ?reason,
            "game finished"
        );

        if reason != FinishReason::OpponentDisconnected || self.settings.record_forfeits {
            effects.push(Effect::Record(CompletedGame {
                game_id: game.id.clone(),
                player_one: game.slots[0].identity().to_string(),
                player_two: game.slots[1].identity().to_string(),
                winner: outcome.label().to_string(),
                reason,
                finished_at: Utc::now(),
            }));
        }
        effects.push(Effect::Publish(GameEvent::game_ended(&game.id, &outcome, reason)));
    }

    fn schedule_join_timeout(&self, ticket: u64) -> ScheduledTask {
        let authority = self.clone();
        ScheduledTask::after(self.settings.join_timeout(), async move {
            authority.expire_join(ticket).await;
        })
    }

    fn schedule_bot_turn(&self, game_id: &str) -> ScheduledTask {
        let authority = self.clone();
        let game_id = game_id.to_string();
        ScheduledTask::after(self.settings.bot_move_delay(), async move {
            authority.play_bot_turn(&game_id).await;
        })
    }

    fn schedule_grace_expiry(&self, generation: u64) -> ScheduledTask {
        let authority = self.clone();
        ScheduledTask::after(self.settings.reconnect_grace(), async move {
            authority.expire_grace(generation).await;
        })
    }

    async fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.events.publish(event),
                Effect::Record(game) => {
                    if let Err(error) = self.recorder.record_completed_game(&game).await {
                        warn!(game_id = %game.game_id, error = %error, "failed to record completed game");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGameStore;
    use async_trait::async_trait;
    use connect4_common::{DRAW_MARKER, GameEventType, LeaderboardEntry, MatchResult};
    use std::{sync::Mutex as StdMutex, time::Duration};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct RecordingEventPublisher {
        published: StdMutex<Vec<GameEvent>>,
    }

    impl RecordingEventPublisher {
        fn events(&self) -> Vec<GameEvent> {
            self.published.lock().unwrap().clone()
        }

        fn count(&self, event_type: GameEventType) -> usize {
            self.events()
                .iter()
                .filter(|event| event.event_type == event_type)
                .count()
        }
    }

    impl EventPublisher for RecordingEventPublisher {
        fn publish(&self, event: GameEvent) {
            self.published.lock().unwrap().push(event);
        }
    }

    struct FailingRecorder;

    #[async_trait]
    impl GameRecorder for FailingRecorder {
        async fn record_completed_game(&self, _game: &CompletedGame) -> anyhow::Result<()> {
            anyhow::bail!("table unavailable")
        }

        async fn fetch_leaderboard(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
            anyhow::bail!("table unavailable")
        }
    }

    struct Harness {
        authority: SessionAuthority,
        store: Arc<InMemoryGameStore>,
        events: Arc<RecordingEventPublisher>,
    }

    fn harness_with(settings: SessionSettings) -> Harness {
        let store = Arc::new(InMemoryGameStore::default());
        let events = Arc::new(RecordingEventPublisher::default());
        Harness {
            authority: SessionAuthority::new(settings, store.clone(), events.clone()),
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(SessionSettings::default())
    }

    fn client(id: ConnectionId) -> (ClientChannel, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientChannel::new(id, tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn game_of(authority: &SessionAuthority, connection: ConnectionId) -> Option<GameId> {
        authority.state.lock().await.connections.get(&connection).cloned()
    }

    async fn turn_of(authority: &SessionAuthority, game_id: &str) -> Option<usize> {
        authority
            .state
            .lock()
            .await
            .games
            .get(game_id)
            .map(|game| game.turn)
    }

    async fn board_of(authority: &SessionAuthority, game_id: &str) -> Option<Board> {
        authority
            .state
            .lock()
            .await
            .games
            .get(game_id)
            .map(|game| game.board)
    }

    fn state_update(board: Board, turn: u8) -> ServerMessage {
        ServerMessage::StateUpdate { board, turn }
    }

    async fn paired(harness: &Harness) -> (UnboundedReceiver<ServerMessage>, UnboundedReceiver<ServerMessage>, GameId) {
        let (alice, mut alice_rx) = client(1);
        let (bob, mut bob_rx) = client(2);
        harness.authority.join("alice".to_string(), alice).await;
        harness.authority.join("bob".to_string(), bob).await;
        let game_id = game_of(&harness.authority, 1).await.expect("alice is seated");
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        (alice_rx, bob_rx, game_id)
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_pairs_two_oldest_and_keeps_third_queued() {
        let harness = harness();
        let (alice, mut alice_rx) = client(1);
        let (bob, mut bob_rx) = client(2);
        let (carol, mut carol_rx) = client(3);
        harness.authority.join("alice".to_string(), alice).await;
        harness.authority.join("bob".to_string(), bob).await;
        harness.authority.join("carol".to_string(), carol).await;

        {
            let state = harness.authority.state.lock().await;
            assert_eq!(state.games.len(), 1);
            assert_eq!(state.waiting.len(), 1);
            assert_eq!(state.waiting[0].identity, "carol");
            assert_eq!(state.connections.get(&1), state.connections.get(&2));
            assert!(!state.connections.contains_key(&3));
        }

        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::GameStart { player: 1 },
                state_update(Board::empty(), 1)
            ]
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![
                ServerMessage::GameStart { player: 2 },
                state_update(Board::empty(), 1)
            ]
        );
        assert!(drain(&mut carol_rx).is_empty());

        let started = harness.events.events();
        assert_eq!(started.len(), 1);
        assert_eq!(
            started[0].players,
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_cancels_join_timeouts() {
        let harness = harness();
        let (_alice_rx, _bob_rx, game_id) = paired(&harness).await;

        tokio::time::sleep(Duration::from_secs(20)).await;

        let state = harness.authority.state.lock().await;
        assert_eq!(state.games.len(), 1);
        assert!(state.games.contains_key(&game_id));
        assert!(state.waiting.is_empty());
        assert_eq!(harness.events.count(GameEventType::GameStarted), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lone_player_is_paired_with_bot_after_join_timeout() {
        let harness = harness();
        let (alice, mut alice_rx) = client(1);
        harness.authority.join("alice".to_string(), alice).await;

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(game_of(&harness.authority, 1).await.is_none());
        assert_eq!(harness.authority.state.lock().await.waiting.len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let game_id = game_of(&harness.authority, 1).await.expect("bot game started");
        assert!(harness.authority.state.lock().await.waiting.is_empty());
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::GameStart { player: 1 },
                state_update(Board::empty(), 1)
            ]
        );
        assert_eq!(
            harness.events.events()[0].players,
            Some(vec!["alice".to_string(), BOT_IDENTITY.to_string()])
        );

        harness.authority.play_move(1, 0).await;
        let mut after_human = Board::empty();
        after_human.drop_disc(0, Disc::PlayerOne);
        assert_eq!(drain(&mut alice_rx), vec![state_update(after_human, 2)]);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(1));

        tokio::time::sleep(Duration::from_millis(2)).await;
        let mut after_bot = after_human;
        after_bot.drop_disc(3, Disc::PlayerTwo);
        assert_eq!(drain(&mut alice_rx), vec![state_update(after_bot, 1)]);
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(0));

        let bot_moves: Vec<_> = harness
            .events
            .events()
            .into_iter()
            .filter(|event| event.event_type == GameEventType::MovePlayed)
            .filter_map(|event| event.player.zip(event.column))
            .collect();
        assert_eq!(
            bot_moves,
            vec![("alice".to_string(), 0), (BOT_IDENTITY.to_string(), 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bot_blocks_and_wins_against_a_human() {
        let harness = harness();
        let (alice, mut alice_rx) = client(1);
        harness.authority.join("alice".to_string(), alice).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        let game_id = game_of(&harness.authority, 1).await.expect("bot game started");

        // Human stacks column 0; the bot answers in the center until it must block.
        for _ in 0..3 {
            harness.authority.play_move(1, 0).await;
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        let board = board_of(&harness.authority, &game_id).await.unwrap();
        assert_eq!(board.cell(3, 0), Some(Disc::PlayerOne));
        assert_eq!(board.cell(2, 0), Some(Disc::PlayerTwo));
        assert_eq!(board.cell(5, 3), Some(Disc::PlayerTwo));
        assert_eq!(board.cell(4, 3), Some(Disc::PlayerTwo));

        // Third center disc, then the fourth completes the column.
        harness.authority.play_move(1, 6).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            board_of(&harness.authority, &game_id)
                .await
                .and_then(|board| board.cell(3, 3)),
            Some(Disc::PlayerTwo)
        );
        harness.authority.play_move(1, 6).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(game_of(&harness.authority, 1).await.is_none());
        let over = drain(&mut alice_rx).pop();
        assert_eq!(over, Some(ServerMessage::won(BOT_IDENTITY)));
        let records = harness.store.completed_games().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner, BOT_IDENTITY);
        assert_eq!(records[0].player_two, BOT_IDENTITY);
    }

    #[tokio::test(start_paused = true)]
    async fn moves_out_of_turn_or_illegal_never_flip_the_turn() {
        let harness = harness();
        let (mut alice_rx, mut bob_rx, game_id) = paired(&harness).await;

        harness.authority.play_move(2, 3).await;
        harness.authority.play_move(1, 7).await;
        harness.authority.play_move(1, -1).await;
        harness.authority.play_move(42, 3).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(0));
        assert_eq!(
            board_of(&harness.authority, &game_id).await,
            Some(Board::empty())
        );
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());

        harness.authority.play_move(1, 3).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(1));
        harness.authority.play_move(1, 4).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(1));

        let mut expected = Board::empty();
        expected.drop_disc(3, Disc::PlayerOne);
        assert_eq!(drain(&mut alice_rx), vec![state_update(expected, 2)]);
        assert_eq!(drain(&mut bob_rx), vec![state_update(expected, 2)]);
        assert_eq!(harness.events.count(GameEventType::MovePlayed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_column_is_ignored() {
        let harness = harness();
        let (_alice_rx, _bob_rx, game_id) = paired(&harness).await;
        for turn in 0..6 {
            let connection = if turn % 2 == 0 { 1 } else { 2 };
            harness.authority.play_move(connection, 0).await;
        }
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(0));

        harness.authority.play_move(1, 0).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(0));
        assert_eq!(harness.events.count(GameEventType::MovePlayed), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn vertical_four_wins_and_records_once() {
        let harness = harness();
        let (mut alice_rx, mut bob_rx, game_id) = paired(&harness).await;

        for (connection, column) in [(1, 3), (2, 0), (1, 3), (2, 1), (1, 3), (2, 0), (1, 3)] {
            harness.authority.play_move(connection, column).await;
        }

        {
            let state = harness.authority.state.lock().await;
            assert!(!state.games.contains_key(&game_id));
            assert!(state.connections.is_empty());
        }
        assert_eq!(drain(&mut alice_rx).pop(), Some(ServerMessage::won("alice")));
        assert_eq!(drain(&mut bob_rx).pop(), Some(ServerMessage::won("alice")));

        let records = harness.store.completed_games().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].game_id, game_id);
        assert_eq!(records[0].player_one, "alice");
        assert_eq!(records[0].player_two, "bob");
        assert_eq!(records[0].winner, "alice");
        assert_eq!(records[0].reason, FinishReason::FourInARow);

        assert_eq!(harness.events.count(GameEventType::MovePlayed), 7);
        let ended = harness.events.events().pop().unwrap();
        assert_eq!(ended.event_type, GameEventType::GameEnded);
        assert_eq!(ended.winner.as_deref(), Some("alice"));

        // Further moves after the finish do nothing.
        harness.authority.play_move(2, 3).await;
        assert_eq!(harness.events.count(GameEventType::MovePlayed), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn full_board_without_a_four_is_a_draw() {
        let harness = harness();
        let (mut alice_rx, mut bob_rx, game_id) = paired(&harness).await;

        let columns = [
            2, 0, 0, 2, 2, 0, 0, 2, 2, 0, 0, 2, //
            3, 1, 1, 3, 3, 1, 1, 3, 3, 1, 1, 3, //
            6, 4, 4, 5, 5, 6, 6, 4, 4, 5, 5, 6, 6, 4, 4, 5, 5, 6,
        ];
        for (index, column) in columns.into_iter().enumerate() {
            let connection = if index % 2 == 0 { 1 } else { 2 };
            harness.authority.play_move(connection, column).await;
        }

        assert!(game_of(&harness.authority, 1).await.is_none());
        let drawn = ServerMessage::GameOver {
            winner: None,
            result: Some(MatchResult::Draw),
            reason: None,
        };
        assert_eq!(drain(&mut alice_rx).pop(), Some(drawn.clone()));
        assert_eq!(drain(&mut bob_rx).pop(), Some(drawn));

        let records = harness.store.completed_games().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].game_id, game_id);
        assert_eq!(records[0].winner, DRAW_MARKER);
        assert_eq!(records[0].reason, FinishReason::BoardFull);
        assert_eq!(harness.events.count(GameEventType::MovePlayed), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_forfeits_after_grace_period() {
        let harness = harness();
        let (mut alice_rx, mut bob_rx, game_id) = paired(&harness).await;

        harness.authority.disconnect(2).await;
        tokio::time::sleep(Duration::from_millis(29_999)).await;
        assert!(harness.authority.state.lock().await.games.contains_key(&game_id));
        assert!(drain(&mut alice_rx).is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        {
            let state = harness.authority.state.lock().await;
            assert!(!state.games.contains_key(&game_id));
            assert!(state.grace_timers.is_empty());
            assert!(state.connections.is_empty());
        }
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::forfeited_to("alice")]
        );
        assert!(drain(&mut bob_rx).is_empty());

        assert!(harness.store.completed_games().await.is_empty());
        let ended = harness.events.events().pop().unwrap();
        assert_eq!(ended.event_type, GameEventType::GameEnded);
        assert_eq!(ended.reason, Some(FinishReason::OpponentDisconnected));
        assert_eq!(ended.winner.as_deref(), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn forfeits_are_recorded_when_enabled() {
        let harness = harness_with(SessionSettings {
            record_forfeits: true,
            ..SessionSettings::default()
        });
        let (_alice_rx, _bob_rx, _game_id) = paired(&harness).await;

        harness.authority.disconnect(1).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        let records = harness.store.completed_games().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner, "bob");
        assert_eq!(records[0].reason, FinishReason::OpponentDisconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_resumes_the_game() {
        let harness = harness();
        let (mut alice_rx, _bob_rx, game_id) = paired(&harness).await;

        harness.authority.play_move(1, 3).await;
        harness.authority.disconnect(2).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let (bob_again, mut bob_again_rx) = client(9);
        harness
            .authority
            .reconnect("bob".to_string(), bob_again)
            .await;
        let mut expected = Board::empty();
        expected.drop_disc(3, Disc::PlayerOne);
        assert_eq!(drain(&mut bob_again_rx), vec![state_update(expected, 2)]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(harness.authority.state.lock().await.games.contains_key(&game_id));
        assert!(harness.authority.state.lock().await.grace_timers.is_empty());

        drain(&mut alice_rx);
        harness.authority.play_move(9, 4).await;
        assert_eq!(turn_of(&harness.authority, &game_id).await, Some(0));
        expected.drop_disc(4, Disc::PlayerTwo);
        assert_eq!(drain(&mut alice_rx), vec![state_update(expected, 1)]);
        assert_eq!(drain(&mut bob_again_rx), vec![state_update(expected, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_pending_forfeit_is_a_no_op() {
        let harness = harness();
        let (_alice_rx, _bob_rx, game_id) = paired(&harness).await;

        let (stranger, mut stranger_rx) = client(7);
        harness
            .authority
            .reconnect("carol".to_string(), stranger)
            .await;
        let (impostor, mut impostor_rx) = client(8);
        harness
            .authority
            .reconnect("alice".to_string(), impostor)
            .await;

        assert!(drain(&mut stranger_rx).is_empty());
        assert!(drain(&mut impostor_rx).is_empty());
        let state = harness.authority.state.lock().await;
        assert_eq!(state.connections.len(), 2);
        assert_eq!(state.connections.get(&1), Some(&game_id));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_grace_expired_is_a_no_op() {
        let harness = harness();
        let (_alice_rx, _bob_rx, _game_id) = paired(&harness).await;

        harness.authority.disconnect(2).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        let (late, mut late_rx) = client(9);
        harness.authority.reconnect("bob".to_string(), late).await;
        assert!(drain(&mut late_rx).is_empty());
        assert!(game_of(&harness.authority, 9).await.is_none());
    }

    async fn second_alice_game(harness: &Harness) -> (UnboundedReceiver<ServerMessage>, GameId) {
        let (alice, _alice_rx) = client(3);
        let (carol, mut carol_rx) = client(4);
        harness.authority.join("alice".to_string(), alice).await;
        harness.authority.join("carol".to_string(), carol).await;
        let game_id = game_of(&harness.authority, 3).await.expect("second alice is seated");
        drain(&mut carol_rx);
        (carol_rx, game_id)
    }

    #[tokio::test(start_paused = true)]
    async fn same_identity_dropping_from_two_games_forfeits_both() {
        let harness = harness();
        let (_alice_rx, mut bob_rx, first_game) = paired(&harness).await;
        harness.authority.disconnect(1).await;

        let (mut carol_rx, second_game) = second_alice_game(&harness).await;
        assert_ne!(first_game, second_game);
        harness.authority.disconnect(3).await;
        assert_eq!(harness.authority.state.lock().await.grace_timers.len(), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        {
            let state = harness.authority.state.lock().await;
            assert!(state.games.is_empty());
            assert!(state.grace_timers.is_empty());
            assert!(state.connections.is_empty());
        }
        assert_eq!(drain(&mut bob_rx), vec![ServerMessage::forfeited_to("bob")]);
        assert_eq!(
            drain(&mut carol_rx),
            vec![ServerMessage::forfeited_to("carol")]
        );
        assert_eq!(harness.events.count(GameEventType::GameEnded), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_latest_game_and_older_one_still_forfeits() {
        let harness = harness();
        let (_alice_rx, mut bob_rx, first_game) = paired(&harness).await;
        harness.authority.disconnect(1).await;
        let (mut carol_rx, second_game) = second_alice_game(&harness).await;
        harness.authority.disconnect(3).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (returning, mut returning_rx) = client(5);
        harness
            .authority
            .reconnect("alice".to_string(), returning)
            .await;
        assert_eq!(
            drain(&mut returning_rx),
            vec![state_update(Board::empty(), 1)]
        );
        assert_eq!(game_of(&harness.authority, 5).await, Some(second_game.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        {
            let state = harness.authority.state.lock().await;
            assert!(!state.games.contains_key(&first_game));
            assert!(state.games.contains_key(&second_game));
            assert!(state.grace_timers.is_empty());
        }
        assert_eq!(drain(&mut bob_rx), vec![ServerMessage::forfeited_to("bob")]);
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_queued_connection_leaves_the_queue() {
        let harness = harness();
        let (alice, _alice_rx) = client(1);
        harness.authority.join("alice".to_string(), alice).await;
        harness.authority.disconnect(1).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        let state = harness.authority.state.lock().await;
        assert!(state.waiting.is_empty());
        assert!(state.games.is_empty());
        assert!(harness.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_from_the_same_connection_is_ignored() {
        let harness = harness();
        let (alice, _alice_rx) = client(1);
        harness.authority.join("alice".to_string(), alice.clone()).await;
        harness.authority.join("alice".to_string(), alice).await;

        let state = harness.authority.state.lock().await;
        assert_eq!(state.waiting.len(), 1);
        assert!(state.games.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_bot_turn_after_forfeit_is_absorbed() {
        let harness = harness_with(SessionSettings {
            bot_move_delay_ms: 5_000,
            reconnect_grace_ms: 1_000,
            ..SessionSettings::default()
        });
        let (alice, _alice_rx) = client(1);
        harness.authority.join("alice".to_string(), alice).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        harness.authority.play_move(1, 2).await;
        harness.authority.disconnect(1).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let state = harness.authority.state.lock().await;
        assert!(state.games.is_empty());
        assert_eq!(harness.events.count(GameEventType::MovePlayed), 1);
        let ended = harness.events.events().pop().unwrap();
        assert_eq!(ended.winner.as_deref(), Some(BOT_IDENTITY));
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_failure_does_not_block_the_finish() {
        let events = Arc::new(RecordingEventPublisher::default());
        let authority = SessionAuthority::new(
            SessionSettings::default(),
            Arc::new(FailingRecorder),
            events.clone(),
        );
        let (alice, mut alice_rx) = client(1);
        let (bob, _bob_rx) = client(2);
        authority.join("alice".to_string(), alice).await;
        authority.join("bob".to_string(), bob).await;

        for (connection, column) in [(1, 0), (2, 6), (1, 1), (2, 6), (1, 2), (2, 6), (1, 3)] {
            authority.play_move(connection, column).await;
        }

        assert!(authority.state.lock().await.games.is_empty());
        assert_eq!(drain(&mut alice_rx).pop(), Some(ServerMessage::won("alice")));
        assert_eq!(events.count(GameEventType::GameEnded), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let harness = harness();
        let (alice, _alice_rx) = client(1);
        let (bob, _bob_rx) = client(2);
        let (carol, _carol_rx) = client(3);
        harness.authority.join("alice".to_string(), alice).await;
        harness.authority.join("bob".to_string(), bob).await;
        harness.authority.join("carol".to_string(), carol).await;
        harness.authority.disconnect(2).await;

        harness.authority.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let state = harness.authority.state.lock().await;
        assert!(state.waiting.is_empty());
        assert!(state.games.is_empty());
        assert!(state.grace_timers.is_empty());
        assert_eq!(harness.events.count(GameEventType::GameStarted), 1);
        assert_eq!(harness.events.count(GameEventType::GameEnded), 0);
    }
}
