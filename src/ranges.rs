// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;

use serde::{Deserialize, Serialize};

/// A span of character offsets in the edited source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: usize,
    pub end: usize,
}

impl SourceRange {
    /// Creates a new range.
    pub fn new(start: usize, end: usize) -> SourceRange {
        SourceRange { start, end }
    }

    /// The canonical key used to reference count identical ranges.
    pub fn key(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }
}

impl From<(usize, usize)> for SourceRange {
    fn from((start, end): (usize, usize)) -> Self {
        SourceRange { start, end }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Returns true if both sequences hold the same ranges in the same order.
pub fn ranges_equal(a: &[SourceRange], b: &[SourceRange]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}
