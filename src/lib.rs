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
//! A live-coding engine facade for a pattern-based music runtime, plus the
//! sample bank registry, GitHub sample pack resolution, a local sample
//! directory scanner and the pending-import bridge feeding them.

pub mod banks;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod github;
pub mod ranges;
pub mod runtime;
pub mod scan;
pub mod util;

#[cfg(test)]
mod testutil;

pub use engine::{Engine, EngineError, EngineSettings, EngineState, EvaluateOptions};
