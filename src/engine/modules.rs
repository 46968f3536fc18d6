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
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{info, span, warn, Level, Span};

use super::EngineError;
use crate::runtime::{find_transpiler, Module, PatternRuntime, Transpiler, TRANSPILER_EXPORTS};

/// The loaded module set and the transpiler found among its exports.
pub struct LoadedModules {
    modules: Vec<Module>,
    transpiler: Arc<dyn Transpiler>,
}

impl LoadedModules {
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn transpiler(&self) -> Arc<dyn Transpiler> {
        self.transpiler.clone()
    }
}

type ModuleLoad = Shared<BoxFuture<'static, Result<Arc<LoadedModules>, EngineError>>>;

/// Loads the pattern runtime's modules at most once and shares the result
/// between every engine holding the cache. A failed load stays failed.
pub struct ModuleCache {
    load: Mutex<Option<ModuleLoad>>,
    holders: AtomicUsize,
    span: Span,
}

impl ModuleCache {
    pub fn new() -> Arc<ModuleCache> {
        Arc::new(ModuleCache {
            load: Mutex::new(None),
            holders: AtomicUsize::new(0),
            span: span!(Level::INFO, "modules"),
        })
    }

    /// The process wide cache.
    pub fn global() -> Arc<ModuleCache> {
        static GLOBAL: OnceLock<Arc<ModuleCache>> = OnceLock::new();
        GLOBAL.get_or_init(ModuleCache::new).clone()
    }

    /// Registers an engine as a holder of the cache.
    pub fn acquire(&self) -> usize {
        self.holders.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases a holder. Loaded modules are kept for later engines.
    pub fn release(&self) -> usize {
        let previous = self
            .holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |holders| {
                Some(holders.saturating_sub(1))
            })
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    /// Number of engines currently holding the cache.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    /// Returns true once a load has been started.
    pub fn is_started(&self) -> bool {
        self.load.lock().is_some()
    }

    /// Loads every module of the runtime, or joins the load already started.
    pub async fn load(
        &self,
        runtime: Arc<dyn PatternRuntime>,
    ) -> Result<Arc<LoadedModules>, EngineError> {
        let load = {
            let mut load = self.load.lock();
            load.get_or_insert_with(|| {
                load_modules(runtime, self.span.clone())
                    .boxed()
                    .shared()
            })
            .clone()
        };
        load.await
    }
}

async fn load_modules(
    runtime: Arc<dyn PatternRuntime>,
    span: Span,
) -> Result<Arc<LoadedModules>, EngineError> {
    let specs = runtime.modules();
    info!(parent: &span, modules = specs.len(), "Loading runtime modules.");

    let results = join_all(specs.iter().map(|spec| runtime.load_module(&spec.name))).await;
    let mut modules = Vec::with_capacity(specs.len());
    for (spec, result) in specs.iter().zip(results) {
        match result {
            Ok(module) => modules.push(module),
            Err(e) if spec.required => {
                return Err(EngineError::ModuleLoad {
                    module: spec.name.clone(),
                    message: e.0,
                })
            }
            Err(e) => warn!(
                parent: &span,
                module = %spec.name,
                err = %e,
                "Optional module failed to load, skipping."
            ),
        }
    }

    let transpiler = find_transpiler(&modules)
        .ok_or_else(|| EngineError::MissingTranspiler(TRANSPILER_EXPORTS.join(", ")))?;
    runtime
        .eval_scope(&modules)
        .await
        .map_err(|e| EngineError::Bootstrap(e.0))?;

    info!(parent: &span, loaded = modules.len(), "Runtime modules loaded.");
    Ok(Arc::new(LoadedModules {
        modules,
        transpiler,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    #[tokio::test]
    async fn test_loads_once() -> Result<(), EngineError> {
        let runtime = MockRuntime::new();
        let cache = ModuleCache::new();

        let (a, b) = tokio::join!(cache.load(runtime.clone()), cache.load(runtime.clone()));
        assert!(Arc::ptr_eq(&a?, &b?));
        assert_eq!(4, runtime.module_loads());
        assert_eq!(1, runtime.scopes());

        cache.load(runtime.clone()).await?;
        assert_eq!(4, runtime.module_loads());
        Ok(())
    }

    #[tokio::test]
    async fn test_optional_module_failure_is_skipped() -> Result<(), EngineError> {
        let runtime = MockRuntime::new();
        runtime.fail_module("tonal");
        let loaded = ModuleCache::new().load(runtime).await?;
        assert_eq!(
            vec!["core", "mini", "transpiler"],
            loaded
                .modules()
                .iter()
                .map(|module| module.name.as_str())
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_cached() {
        let runtime = MockRuntime::new();
        runtime.fail_module("mini");
        let cache = ModuleCache::new();

        let first = cache.load(runtime.clone()).await.err();
        assert!(matches!(
            first,
            Some(EngineError::ModuleLoad { ref module, .. }) if module == "mini"
        ));
        let loads = runtime.module_loads();
        assert_eq!(first, cache.load(runtime.clone()).await.err());
        assert_eq!(loads, runtime.module_loads());
    }

    #[tokio::test]
    async fn test_missing_transpiler() {
        let runtime = MockRuntime::new();
        runtime.drop_transpiler();
        let result = ModuleCache::new().load(runtime.clone()).await;
        assert!(matches!(result, Err(EngineError::MissingTranspiler(_))));
        assert_eq!(0, runtime.scopes());
    }

    #[test]
    fn test_holders() {
        let cache = ModuleCache::new();
        assert_eq!(1, cache.acquire());
        assert_eq!(2, cache.acquire());
        assert_eq!(1, cache.release());
        assert_eq!(0, cache.release());
        assert_eq!(0, cache.release());
        assert!(!cache.is_started());
    }
}
