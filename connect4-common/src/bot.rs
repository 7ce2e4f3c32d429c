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

//! One-ply heuristic opponent used when no second human shows up.
//!
//! Priority: complete our own four, block the opponent's four, take the
//! center, then the lowest open column. Ties always go to the lower column.

use crate::board::{Board, CENTER_COLUMN, COLS, Disc};

/// The bot always occupies slot 1.
pub const BOT_DISC: Disc = Disc::PlayerTwo;

pub fn choose_move(board: &Board) -> Option<usize> {
    choose_move_for(board, BOT_DISC)
}

pub fn choose_move_for(board: &Board, me: Disc) -> Option<usize> {
    winning_column(board, me)
        .or_else(|| winning_column(board, me.opponent()))
        .or_else(|| board.accepts(CENTER_COLUMN).then_some(CENTER_COLUMN))
        .or_else(|| (0..COLS).find(|&column| board.accepts(column)))
}

fn winning_column(board: &Board, disc: Disc) -> Option<usize> {
    (0..COLS).find(|&column| {
        let mut probe = *board;
        probe.drop_disc(column, disc).is_some() && probe.has_win(disc)
    })
}
