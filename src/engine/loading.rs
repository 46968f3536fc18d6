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
use std::{sync::atomic::Ordering, time::SystemTime};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::{Engine, EngineError};
use crate::banks::{
    BankMetaPatch, BankSource, BankStatus, RegisterOptions, SampleBankState,
};
use crate::runtime::SampleOptions;

/// A sample bank load. Clones share one outcome; concurrent requests for the
/// same bank receive the same `BankLoad` (see [`Shared::ptr_eq`]). The load
/// runs to completion even if every handle is dropped.
pub type BankLoad = Shared<BoxFuture<'static, Result<SampleBankState, EngineError>>>;

/// The load currently tracked for a bank. The token identifies the attempt so
/// a finished load never evicts a newer one.
pub(crate) struct InFlight {
    token: u64,
    source: BankSource,
    load: BankLoad,
}

impl Engine {
    /// Registers a sample bank without loading it. A load still in flight for
    /// a different source is no longer tracked; the next load starts afresh.
    pub fn register_sample_bank(
        &self,
        source: BankSource,
        options: RegisterOptions,
    ) -> SampleBankState {
        let _publish = self.inner.publish.lock();
        let (bank, banks) = {
            let mut registry = self.inner.banks.lock();
            let bank = registry.register(source, &options);
            (bank, registry.snapshot())
        };
        {
            let mut loads = self.inner.bank_loads.lock();
            if loads
                .get(&bank.id)
                .is_some_and(|in_flight| in_flight.source != bank.source)
            {
                debug!(parent: &self.inner.span, bank = %bank.id, "Source changed, detaching load in flight.");
                loads.remove(&bank.id);
            }
        }
        self.update(|state| state.sample_banks = banks);
        bank
    }

    /// Changes a bank's label or metadata without touching its source or
    /// load status.
    pub fn update_sample_bank(
        &self,
        id: &str,
        label: Option<String>,
        meta: BankMetaPatch,
    ) -> Result<SampleBankState, EngineError> {
        let source = self
            .sample_bank(id)
            .ok_or_else(|| EngineError::UnknownBank(id.to_string()))?
            .source;
        Ok(self.register_sample_bank(
            source,
            RegisterOptions {
                id: Some(id.to_string()),
                label,
                meta,
            },
        ))
    }

    /// Returns a registered bank.
    pub fn sample_bank(&self, id: &str) -> Option<SampleBankState> {
        self.inner.banks.lock().get(id).cloned()
    }

    /// Registers a bank and loads it.
    pub fn load_sample_bank(&self, source: BankSource, options: RegisterOptions) -> BankLoad {
        let bank = self.register_sample_bank(source, options);
        self.start_bank_load(&bank.id)
    }

    /// Loads a registered bank, applying any label or metadata changes first.
    /// Joins the load already in flight for the bank, if any.
    pub fn load_sample_bank_by_id(&self, id: &str, options: RegisterOptions) -> BankLoad {
        let Some(existing) = self.sample_bank(id) else {
            return future::ready(Err(EngineError::UnknownBank(id.to_string())))
                .boxed()
                .shared();
        };
        if options.has_changes() {
            self.register_sample_bank(
                existing.source,
                RegisterOptions {
                    id: Some(id.to_string()),
                    ..options
                },
            );
        }
        self.start_bank_load(id)
    }

    /// Forgets a bank. A load still in flight finishes but its outcome is
    /// discarded.
    pub fn remove_sample_bank(&self, id: &str) -> bool {
        let _publish = self.inner.publish.lock();
        let (removed, banks) = {
            let mut registry = self.inner.banks.lock();
            let removed = registry.remove(id).is_some();
            (removed, registry.snapshot())
        };
        self.inner.bank_loads.lock().remove(id);
        if removed {
            info!(parent: &self.inner.span, bank = id, "Removed sample bank.");
            self.update(|state| state.sample_banks = banks);
        }
        removed
    }

    fn start_bank_load(&self, id: &str) -> BankLoad {
        let Some(source) = self.sample_bank(id).map(|bank| bank.source) else {
            return future::ready(Err(EngineError::UnknownBank(id.to_string())))
                .boxed()
                .shared();
        };
        let mut loads = self.inner.bank_loads.lock();
        if let Some(in_flight) = loads.get(id).filter(|in_flight| in_flight.source == source) {
            debug!(parent: &self.inner.span, bank = id, "Joining sample bank load in flight.");
            return in_flight.load.clone();
        }

        let token = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
        let engine = self.clone();
        let bank_id = id.to_string();
        let task = tokio::spawn(async move { engine.perform_bank_load(&bank_id, token).await });

        let bank_id = id.to_string();
        let load = async move {
            task.await.unwrap_or_else(|e| {
                Err(EngineError::BankLoad {
                    id: bank_id,
                    message: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();
        loads.insert(
            id.to_string(),
            InFlight {
                token,
                source,
                load: load.clone(),
            },
        );
        load
    }

    async fn perform_bank_load(
        &self,
        id: &str,
        token: u64,
    ) -> Result<SampleBankState, EngineError> {
        let Some(bank) = self.set_bank(id, None, |bank| {
            bank.status = BankStatus::Loading;
            bank.error = None;
        }) else {
            self.finish_bank_load(id, token);
            return Err(EngineError::UnknownBank(id.to_string()));
        };

        info!(parent: &self.inner.span, bank = id, source = %bank.source_summary, "Loading sample bank.");
        self.adjust_loading(1);
        let result = self.fetch_bank(&bank).await;
        self.adjust_loading(-1);
        self.finish_bank_load(id, token);

        match result {
            Ok(()) => {
                info!(parent: &self.inner.span, bank = id, "Sample bank ready.");
                let loaded_at = SystemTime::now();
                let ready = |bank: &mut SampleBankState| {
                    bank.status = BankStatus::Ready;
                    bank.error = None;
                    bank.loaded_at = Some(loaded_at);
                };
                Ok(self
                    .set_bank(id, Some(&bank.source), ready)
                    .unwrap_or_else(|| {
                        let mut detached = bank.clone();
                        ready(&mut detached);
                        detached
                    }))
            }
            Err(message) => {
                warn!(parent: &self.inner.span, bank = id, err = %message, "Sample bank failed to load.");
                self.set_bank(id, Some(&bank.source), |bank| {
                    bank.status = BankStatus::Error;
                    bank.error = Some(message.clone());
                });
                Err(EngineError::BankLoad {
                    id: id.to_string(),
                    message,
                })
            }
        }
    }

    /// Hands the bank to the audio runtime. Mapping sources are also
    /// registered under the bank's prefix and aliases.
    async fn fetch_bank(&self, bank: &SampleBankState) -> Result<(), String> {
        self.ensure_audio().await.map_err(|e| e.to_string())?;

        let meta = bank.meta.clone().unwrap_or_default();
        let prefixes: Vec<&str> = std::iter::once(bank.bank_prefix())
            .chain(meta.bank_aliases.iter().map(String::as_str))
            .filter(|prefix| !prefix.is_empty())
            .collect();
        let source = bank.source.with_prefixed_keys(&prefixes);

        self.inner
            .audio
            .samples(
                &source,
                meta.base_url.as_deref(),
                SampleOptions {
                    tag: meta.tag.clone(),
                    prebake: meta.prebake.clone(),
                },
            )
            .await
            .map_err(|e| e.0)
    }

    /// Updates a bank and publishes the registry. With `expected` set, the
    /// update only applies if the bank still has that source.
    fn set_bank<F>(
        &self,
        id: &str,
        expected: Option<&BankSource>,
        f: F,
    ) -> Option<SampleBankState>
    where
        F: FnOnce(&mut SampleBankState),
    {
        let _publish = self.inner.publish.lock();
        let (bank, banks) = {
            let mut registry = self.inner.banks.lock();
            if let Some(expected) = expected {
                if registry.get(id).is_some_and(|bank| &bank.source != expected) {
                    debug!(parent: &self.inner.span, bank = id, "Bank changed while loading, discarding outcome.");
                    return None;
                }
            }
            let bank = registry.update(id, f)?;
            (bank, registry.snapshot())
        };
        self.update(|state| state.sample_banks = banks);
        Some(bank)
    }

    fn finish_bank_load(&self, id: &str, token: u64) {
        let mut loads = self.inner.bank_loads.lock();
        if loads.get(id).is_some_and(|in_flight| in_flight.token == token) {
            loads.remove(id);
        }
    }
}
