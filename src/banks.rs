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
//! Sample bank identity, metadata and registry.
//!
//! This module provides:
//! - The tagged [`BankSource`] model (remote reference or inline key to path map)
//! - Pure derivation of ids, labels and summaries from a source
//! - Additive metadata merging
//! - The [`BankRegistry`] that keeps ids unique across registrations

mod identity;
mod registry;
mod source;

pub use identity::{
    derive_slug, merge_meta, normalize_bank_prefix, slugify, summarize_source, BankMeta,
    BankMetaPatch, Prebake,
};
pub use registry::{BankRegistry, BankStatus, RegisterOptions, SampleBankState};
pub use source::{BankSource, SamplePaths, BASE_KEY, META_KEY_PREFIX};
