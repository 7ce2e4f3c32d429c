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

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

pub const ROWS: usize = 6;
pub const COLS: usize = 7;
pub const CENTER_COLUMN: usize = 3;

const WIN_LENGTH: isize = 4;

/// Horizontal, vertical, diagonal down-right, diagonal down-left.
const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disc {
    PlayerOne,
    PlayerTwo,
}

impl Disc {
    /// Slot 0 always plays `PlayerOne`.
    pub fn for_slot(slot: usize) -> Self {
        if slot == 0 {
            Disc::PlayerOne
        } else {
            Disc::PlayerTwo
        }
    }

    pub fn slot(self) -> usize {
        match self {
            Disc::PlayerOne => 0,
            Disc::PlayerTwo => 1,
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Disc::PlayerOne => Disc::PlayerTwo,
            Disc::PlayerTwo => Disc::PlayerOne,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Disc::PlayerOne => 1,
            Disc::PlayerTwo => 2,
        }
    }
}

/// A 6x7 grid; row 0 is the top, row 5 the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Board {
    cells: [[Option<Disc>; COLS]; ROWS],
}

impl Default for Board {
    fn default() -> Self {
        Self::empty()
    }
}

impl Board {
    pub fn empty() -> Self {
        Self {
            cells: [[None; COLS]; ROWS],
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<Disc> {
        self.cells.get(row).and_then(|cells| cells.get(col)).copied().flatten()
    }

    /// True when a disc dropped into `column` would land somewhere.
    pub fn accepts(&self, column: usize) -> bool {
        column < COLS && self.cells[0][column].is_none()
    }

    /// Drops `disc` into `column` and returns the row it landed on.
    ///
    /// Out-of-range and full columns both yield `None` and leave the board
    /// untouched; callers treat either as "try another column".
    pub fn drop_disc(&mut self, column: usize, disc: Disc) -> Option<usize> {
        if !self.accepts(column) {
            return None;
        }

        let row = (0..ROWS)
            .rev()
            .find(|&row| self.cells[row][column].is_none())?;
        self.cells[row][column] = Some(disc);
        Some(row)
    }

    /// Scans every four-cell window in every direction for a run of `disc`.
    pub fn has_win(&self, disc: Disc) -> bool {
        DIRECTIONS.iter().any(|&(dr, dc)| {
            (0..ROWS).any(|row| (0..COLS).any(|col| self.run_from(row, col, dr, dc, disc)))
        })
    }

    /// Full board. Says nothing about whether someone also won.
    pub fn is_draw(&self) -> bool {
        self.cells.iter().flatten().all(Option::is_some)
    }

    pub fn occupied(&self) -> usize {
        self.cells.iter().flatten().filter(|cell| cell.is_some()).count()
    }

    pub fn to_codes(&self) -> [[u8; COLS]; ROWS] {
        let mut codes = [[0_u8; COLS]; ROWS];
        for (row, cells) in self.cells.iter().enumerate() {
            for (col, cell) in cells.iter().enumerate() {
                codes[row][col] = cell.map(Disc::code).unwrap_or(0);
            }
        }
        codes
    }

    pub fn from_codes(codes: &[[u8; COLS]; ROWS]) -> Option<Self> {
        let mut board = Self::empty();
        for (row, values) in codes.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                board.cells[row][col] = match value {
                    0 => None,
                    1 => Some(Disc::PlayerOne),
                    2 => Some(Disc::PlayerTwo),
                    _ => return None,
                };
            }
        }
        Some(board)
    }

    fn run_from(&self, row: usize, col: usize, dr: isize, dc: isize, disc: Disc) -> bool {
        (0..WIN_LENGTH).all(|step| {
            let r = row as isize + dr * step;
            let c = col as isize + dc * step;
            r >= 0
                && c >= 0
                && (r as usize) < ROWS
                && (c as usize) < COLS
                && self.cells[r as usize][c as usize] == Some(disc)
        })
    }
}

impl Serialize for Board {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_codes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Board {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let codes = <[[u8; COLS]; ROWS]>::deserialize(deserializer)?;
        Board::from_codes(&codes).ok_or_else(|| D::Error::custom("unknown board cell value"))
    }
}
