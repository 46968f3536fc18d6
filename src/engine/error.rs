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
/// Errors surfaced by engine operations. Cloneable so memoized operations can
/// hand the same failure to every waiter.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load module {module}: {message}")]
    ModuleLoad { module: String, message: String },
    #[error("no transpiler export found (tried {0})")]
    MissingTranspiler(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("{0}")]
    Evaluation(String),
    #[error("audio unavailable: {0}")]
    Audio(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to load sample bank {id}: {message}")]
    BankLoad { id: String, message: String },
    #[error("unknown sample bank {0}")]
    UnknownBank(String),
    #[error("engine has been disposed")]
    Disposed,
}
