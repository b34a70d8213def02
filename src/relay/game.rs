/// Tic-tac-toe mediation — the server owns the board.
///
/// A session exists per unordered player pair. The initiator always plays
/// `X` and moves first. Moves are validated here (turn order, mark
/// ownership, bounds, occupancy) before anything is forwarded, and win/draw
/// detection runs on the server board so a finished game cannot be moved in.
use std::fmt;

use serde::{Deserialize, Serialize};

/// A player's mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn parse(s: &str) -> Option<Mark> {
        match s {
            "X" => Some(Mark::X),
            "O" => Some(Mark::O),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mark::X => "X",
            Mark::O => "O",
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three-in-a-row lines: rows, columns and the two diagonals.
const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// Outcome of a legal move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Continue,
    Win(Mark),
    Draw,
}

/// Why a move was refused. The display text is the notice sent back to the
/// player who attempted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IllegalMove {
    #[error("It is not your turn.")]
    NotYourTurn,
    #[error("That is not your mark.")]
    WrongMark,
    #[error("Cell {0} is out of range.")]
    OutOfRange(usize),
    #[error("Cell {0} is already taken.")]
    CellTaken(usize),
}

/// Server-held state for one active game between two connections.
#[derive(Debug)]
pub struct GameSession {
    board: [Option<Mark>; 9],
    /// Username whose move is next.
    turn: String,
    x_player: String,
    o_player: String,
}

impl GameSession {
    /// New session with an empty board. The initiator is `X` and starts.
    pub fn new(initiator: &str, opponent: &str) -> Self {
        Self {
            board: [None; 9],
            turn: initiator.to_owned(),
            x_player: initiator.to_owned(),
            o_player: opponent.to_owned(),
        }
    }

    pub fn mark_of(&self, player: &str) -> Option<Mark> {
        if player == self.x_player {
            Some(Mark::X)
        } else if player == self.o_player {
            Some(Mark::O)
        } else {
            None
        }
    }

    /// Apply one move, enforcing turn order, mark ownership, bounds and
    /// occupancy, then check the board for a result.
    pub fn apply(&mut self, player: &str, index: usize, mark: Mark) -> Result<MoveOutcome, IllegalMove> {
        if player != self.turn {
            return Err(IllegalMove::NotYourTurn);
        }
        if self.mark_of(player) != Some(mark) {
            return Err(IllegalMove::WrongMark);
        }
        if index >= self.board.len() {
            return Err(IllegalMove::OutOfRange(index));
        }
        if self.board[index].is_some() {
            return Err(IllegalMove::CellTaken(index));
        }

        self.board[index] = Some(mark);
        self.turn = if player == self.x_player {
            self.o_player.clone()
        } else {
            self.x_player.clone()
        };

        if self.has_line(mark) {
            Ok(MoveOutcome::Win(mark))
        } else if self.board.iter().all(Option::is_some) {
            Ok(MoveOutcome::Draw)
        } else {
            Ok(MoveOutcome::Continue)
        }
    }

    fn has_line(&self, mark: Mark) -> bool {
        WIN_LINES
            .iter()
            .any(|line| line.iter().all(|&i| self.board[i] == Some(mark)))
    }
}

/// Normalized key for the active-game table: the pair is unordered, so the
/// sorted pair indexes the same session from either side.
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

/// JSON body of a `/tictactoe_update` notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveUpdate {
    pub index: usize,
    pub player: Mark,
}

/// Wire notice for a relayed move, e.g.
/// `/tictactoe_update {"index":4,"player":"X"}`.
pub fn move_notice(index: usize, player: Mark) -> String {
    let update = MoveUpdate { index, player };
    format!("/tictactoe_update {}", serde_json::json!(update))
}
