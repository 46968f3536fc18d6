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
use std::{collections::HashMap, time::SystemTime};

use serde::Serialize;
use tracing::debug;

use super::identity::{
    derive_slug, merge_meta, normalize_bank_prefix, summarize_source, BankMeta, BankMetaPatch,
};
use super::source::BankSource;

/// Load status of a single bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BankStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

/// The observable state of one registered sample bank.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleBankState {
    pub id: String,
    pub label: String,
    pub status: BankStatus,
    pub source: BankSource,
    pub source_summary: String,
    pub error: Option<String>,
    pub loaded_at: Option<SystemTime>,
    pub meta: Option<BankMeta>,
}

impl SampleBankState {
    /// The namespace used when addressing this bank's sounds.
    pub fn bank_prefix(&self) -> &str {
        self.meta
            .as_ref()
            .and_then(|meta| meta.bank_prefix.as_deref())
            .unwrap_or(&self.label)
    }
}

/// Options accepted when registering or reloading a bank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterOptions {
    /// An explicit id. Skips derivation and collision avoidance.
    pub id: Option<String>,
    /// A display label; normalized into the bank prefix.
    pub label: Option<String>,
    pub meta: BankMetaPatch,
}

impl RegisterOptions {
    /// Returns true if anything besides the id is set.
    pub fn has_changes(&self) -> bool {
        self.label.is_some() || !self.meta.is_empty()
    }
}

/// Registry of sample banks keyed by derived id, in registration order.
#[derive(Default)]
pub struct BankRegistry {
    banks: HashMap<String, SampleBankState>,
    order: Vec<String>,
    /// Counter used for ids when nothing can be derived from the source.
    fallback_counter: usize,
}

impl BankRegistry {
    pub fn new() -> BankRegistry {
        BankRegistry::default()
    }

    /// Returns the bank with the given id.
    pub fn get(&self, id: &str) -> Option<&SampleBankState> {
        self.banks.get(id)
    }

    /// Returns the number of registered banks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns all banks in registration order.
    pub fn snapshot(&self) -> Vec<SampleBankState> {
        self.order
            .iter()
            .filter_map(|id| self.banks.get(id))
            .cloned()
            .collect()
    }

    /// Registers a bank, or updates the existing entry it resolves to.
    pub fn register(&mut self, source: BankSource, options: &RegisterOptions) -> SampleBankState {
        let id = self.resolve_id(&source, options);
        let existing = self.banks.get(&id);

        let meta = merge_meta(existing.and_then(|bank| bank.meta.as_ref()), &options.meta);
        let label = options
            .label
            .as_deref()
            .map(normalize_bank_prefix)
            .filter(|label| !label.is_empty())
            .or_else(|| {
                meta.as_ref()
                    .and_then(|meta| meta.bank_prefix.clone())
                    .filter(|prefix| !prefix.is_empty())
            })
            .or_else(|| existing.map(|bank| bank.label.clone()))
            .unwrap_or_else(|| {
                let normalized = normalize_bank_prefix(&id);
                if normalized.is_empty() {
                    id.clone()
                } else {
                    normalized
                }
            });

        let source_changed = existing.is_some_and(|bank| bank.source != source);
        let (status, error, loaded_at) = match existing {
            Some(bank) if !source_changed => (bank.status, bank.error.clone(), bank.loaded_at),
            _ => (BankStatus::Idle, None, None),
        };

        let bank = SampleBankState {
            source_summary: summarize_source(&source, meta.as_ref()),
            id: id.clone(),
            label,
            status,
            source,
            error,
            loaded_at,
            meta,
        };

        debug!(
            bank = id,
            label = bank.label,
            source_changed,
            "Registered sample bank."
        );

        if !self.banks.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.banks.insert(id, bank.clone());
        bank
    }

    /// Applies a closure to a bank if it exists and returns the updated state.
    pub fn update<F>(&mut self, id: &str, f: F) -> Option<SampleBankState>
    where
        F: FnOnce(&mut SampleBankState),
    {
        let bank = self.banks.get_mut(id)?;
        f(bank);
        bank.source_summary = summarize_source(&bank.source, bank.meta.as_ref());
        Some(bank.clone())
    }

    /// Removes a bank. Returns the removed state, if any.
    pub fn remove(&mut self, id: &str) -> Option<SampleBankState> {
        let removed = self.banks.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Works out the id a registration lands on. Without an explicit id, a
    /// different source at the derived id gets a numeric suffix instead of
    /// replacing it.
    fn resolve_id(&mut self, source: &BankSource, options: &RegisterOptions) -> String {
        if let Some(id) = options.id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let base = match derive_slug(source) {
            Some(slug) => slug,
            None => {
                // Reuse the slot of an identical underivable source.
                if let Some(id) = self
                    .order
                    .iter()
                    .find(|id| self.banks.get(*id).is_some_and(|bank| &bank.source == source))
                {
                    return id.clone();
                }
                self.fallback_counter += 1;
                format!("bank-{}", self.fallback_counter)
            }
        };

        let mut candidate = base.clone();
        let mut suffix = 1;
        while let Some(bank) = self.banks.get(&candidate) {
            if &bank.source == source {
                break;
            }
            suffix += 1;
            candidate = format!("{}-{}", base, suffix);
        }
        candidate
    }
}
