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
//! In-process stand-ins for the external runtimes. Nothing is evaluated or
//! played; calls are recorded so behaviour can be observed.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    AnalysisFrame, AudioGraph, AudioRuntime, ContainerSize, Export, Hap, InlineVisual, Module,
    ModuleSpec, NodeId, OutputTiming, PatternRuntime, Repl, ReplConfig,
    ReplHooks, RuntimeError, SampleOptions, SchedulerUpdate, SurfaceOptions, TimeSource,
    Transpiler, VisualHost, VisualSurface,
};
use crate::banks::BankSource;
use crate::ranges::SourceRange;

/// Code containing this marker fails to evaluate.
pub const ERROR_MARKER: &str = "error(";

/// Code containing this marker requests an inline scope.
pub const SCOPE_MARKER: &str = "scope(";

struct MockTranspiler;

impl Transpiler for MockTranspiler {
    fn transpile(&self, code: &str) -> Result<String, RuntimeError> {
        Ok(code.trim().to_string())
    }
}

/// A mock pattern runtime.
pub struct MockRuntime {
    modules: Vec<ModuleSpec>,
    failing: Mutex<HashSet<String>>,
    without_transpiler: AtomicBool,
    module_loads: AtomicUsize,
    scopes: AtomicUsize,
    load_delay: Duration,
    repls: Mutex<Vec<Arc<MockRepl>>>,
}

impl MockRuntime {
    /// Creates a runtime with `core`, `mini` and `transpiler` required and
    /// `tonal` optional.
    pub fn new() -> Arc<MockRuntime> {
        MockRuntime::with_load_delay(Duration::ZERO)
    }

    /// Creates a runtime whose module loads take the given time.
    pub fn with_load_delay(load_delay: Duration) -> Arc<MockRuntime> {
        Arc::new(MockRuntime {
            modules: vec![
                ModuleSpec::required("core"),
                ModuleSpec::required("mini"),
                ModuleSpec::required("transpiler"),
                ModuleSpec::optional("tonal"),
            ],
            failing: Mutex::new(HashSet::new()),
            without_transpiler: AtomicBool::new(false),
            module_loads: AtomicUsize::new(0),
            scopes: AtomicUsize::new(0),
            load_delay,
            repls: Mutex::new(Vec::new()),
        })
    }

    /// Makes loads of the given module fail.
    pub fn fail_module(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    /// Makes the transpiler module export nothing usable.
    pub fn drop_transpiler(&self) {
        self.without_transpiler.store(true, Ordering::Relaxed);
    }

    /// Number of module loads performed.
    pub fn module_loads(&self) -> usize {
        self.module_loads.load(Ordering::Relaxed)
    }

    /// Number of evaluation scopes built.
    pub fn scopes(&self) -> usize {
        self.scopes.load(Ordering::Relaxed)
    }

    /// The most recently created REPL.
    pub fn repl(&self) -> Option<Arc<MockRepl>> {
        self.repls.lock().last().cloned()
    }

    /// Number of REPLs created.
    pub fn repl_count(&self) -> usize {
        self.repls.lock().len()
    }
}

#[async_trait]
impl PatternRuntime for MockRuntime {
    fn modules(&self) -> Vec<ModuleSpec> {
        self.modules.clone()
    }

    async fn load_module(&self, name: &str) -> Result<Module, RuntimeError> {
        self.module_loads.fetch_add(1, Ordering::Relaxed);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.failing.lock().contains(name) {
            return Err(format!("module {} failed to load", name).into());
        }

        let module = Module::new(name).with_export("version", Export::Value);
        if name == "transpiler" && !self.without_transpiler.load(Ordering::Relaxed) {
            return Ok(module.with_export("transpiler", Export::Transpiler(Arc::new(MockTranspiler))));
        }
        Ok(module)
    }

    async fn eval_scope(&self, modules: &[Module]) -> Result<(), RuntimeError> {
        debug!(modules = modules.len(), "Mock evaluation scope built.");
        self.scopes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_repl(&self, config: ReplConfig) -> Result<Arc<dyn Repl>, RuntimeError> {
        let repl = Arc::new(MockRepl {
            config,
            state: Mutex::new(SchedulerUpdate::default()),
            cps: Mutex::new(0.5),
            evaluations: Mutex::new(Vec::new()),
            code: Mutex::new(String::new()),
        });
        self.repls.lock().push(repl.clone());
        Ok(repl)
    }
}

/// Ranges of every double-quoted string in `code`, quotes excluded.
fn quoted_ranges(code: &str) -> Vec<SourceRange> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    for (offset, c) in code.char_indices() {
        if c != '"' {
            continue;
        }
        match open.take() {
            Some(start) => ranges.push(SourceRange::new(start, offset)),
            None => open = Some(offset + 1),
        }
    }
    ranges
}

/// A mock REPL. Quoted strings in evaluated code become its mini locations.
pub struct MockRepl {
    config: ReplConfig,
    state: Mutex<SchedulerUpdate>,
    cps: Mutex<f64>,
    evaluations: Mutex<Vec<String>>,
    code: Mutex<String>,
}

impl MockRepl {
    /// Code passed to evaluate, in order.
    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations.lock().clone()
    }

    /// Current tempo in cycles per second.
    pub fn cps(&self) -> f64 {
        *self.cps.lock()
    }

    /// Whether the transport is started.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Last code set with set_code.
    pub fn code(&self) -> String {
        self.code.lock().clone()
    }

    /// Reads the configured time source.
    pub fn now(&self) -> f64 {
        (self.config.time_source)()
    }

    /// Realizes an event through the host's output hook.
    pub async fn trigger(&self, hap: Hap, timing: OutputTiming) -> Result<(), RuntimeError> {
        self.config.hooks.default_output(hap, timing).await
    }

    /// Modifies and pushes the scheduler state.
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce(&mut SchedulerUpdate),
    {
        let update = {
            let mut state = self.state.lock();
            f(&mut state);
            state.clone()
        };
        self.config.hooks.on_update_state(update);
    }
}

#[async_trait]
impl Repl for MockRepl {
    async fn evaluate(&self, code: &str, autostart: bool, _hush: bool) -> Result<(), RuntimeError> {
        self.evaluations.lock().push(code.to_string());
        self.push(|state| state.pending = true);

        let transpiled = self.config.transpiler.transpile(code)?;
        if transpiled.contains(ERROR_MARKER) {
            let error = RuntimeError::from(format!("cannot evaluate: {}", transpiled));
            self.push(|state| {
                state.pending = false;
                state.eval_error = Some(error.0.clone());
            });
            self.config.hooks.on_eval_error(error.clone());
            return Err(error);
        }

        for (offset, _) in transpiled.match_indices(SCOPE_MARKER) {
            self.config.render_sinks.submit(InlineVisual {
                kind: "scope".to_string(),
                range: Some(SourceRange::new(offset, offset + SCOPE_MARKER.len())),
                options: serde_json::Value::Null,
            });
        }

        if autostart {
            self.config.hooks.before_start().await?;
        }

        self.push(|state| {
            state.pending = false;
            state.eval_error = None;
            state.mini_locations = quoted_ranges(code);
            state.started = state.started || autostart;
        });
        self.config.hooks.after_eval(code);
        Ok(())
    }

    fn start(&self) -> Result<(), RuntimeError> {
        self.push(|state| state.started = true);
        Ok(())
    }

    fn pause(&self) -> Result<(), RuntimeError> {
        self.push(|state| state.started = false);
        Ok(())
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        self.push(|state| state.started = false);
        Ok(())
    }

    fn toggle(&self) -> Result<(), RuntimeError> {
        self.push(|state| state.started = !state.started);
        Ok(())
    }

    fn set_cps(&self, cps: f64) {
        *self.cps.lock() = cps;
    }

    fn set_code(&self, code: &str) {
        *self.code.lock() = code.to_string();
    }
}

/// A recorded call to [`AudioRuntime::samples`].
#[derive(Clone, Debug, PartialEq)]
pub struct SampleCall {
    pub source: BankSource,
    pub base_url: Option<String>,
    pub options: SampleOptions,
}

/// A mock audio runtime.
pub struct MockAudio {
    unlocked: AtomicBool,
    unlock_attempts: AtomicUsize,
    fail_unlock: AtomicBool,
    synth_registrations: AtomicUsize,
    sample_calls: Mutex<Vec<SampleCall>>,
    failing_sources: Mutex<Vec<BankSource>>,
    sample_delay: Mutex<Duration>,
    outputs: Mutex<Vec<Hap>>,
    closed: AtomicBool,
    clock: Mutex<f64>,
    graph: Arc<MockGraph>,
}

impl MockAudio {
    pub fn new() -> Arc<MockAudio> {
        Arc::new(MockAudio {
            unlocked: AtomicBool::new(false),
            unlock_attempts: AtomicUsize::new(0),
            fail_unlock: AtomicBool::new(false),
            synth_registrations: AtomicUsize::new(0),
            sample_calls: Mutex::new(Vec::new()),
            failing_sources: Mutex::new(Vec::new()),
            sample_delay: Mutex::new(Duration::ZERO),
            outputs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            clock: Mutex::new(0.0),
            graph: Arc::new(MockGraph::new()),
        })
    }

    /// Makes unlocking fail until reset.
    pub fn set_fail_unlock(&self, fail: bool) {
        self.fail_unlock.store(fail, Ordering::Relaxed);
    }

    /// Makes sample loads of the given source fail.
    pub fn fail_samples_for(&self, source: BankSource) {
        self.failing_sources.lock().push(source);
    }

    /// Makes every sample load take the given time.
    pub fn set_sample_delay(&self, delay: Duration) {
        *self.sample_delay.lock() = delay;
    }

    /// Advances the audio clock.
    pub fn set_clock(&self, seconds: f64) {
        *self.clock.lock() = seconds;
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Relaxed)
    }

    pub fn unlock_attempts(&self) -> usize {
        self.unlock_attempts.load(Ordering::Relaxed)
    }

    pub fn synth_registrations(&self) -> usize {
        self.synth_registrations.load(Ordering::Relaxed)
    }

    pub fn sample_calls(&self) -> Vec<SampleCall> {
        self.sample_calls.lock().clone()
    }

    pub fn outputs(&self) -> Vec<Hap> {
        self.outputs.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn mock_graph(&self) -> Arc<MockGraph> {
        self.graph.clone()
    }
}

#[async_trait]
impl AudioRuntime for MockAudio {
    async fn init_audio_on_first_click(&self) -> Result<(), RuntimeError> {
        self.unlock_attempts.fetch_add(1, Ordering::Relaxed);
        if self.fail_unlock.load(Ordering::Relaxed) {
            return Err("audio context is not allowed to start".into());
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), RuntimeError> {
        self.unlocked.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn register_synth_sounds(&self) -> Result<(), RuntimeError> {
        self.synth_registrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn samples(
        &self,
        source: &BankSource,
        base_url: Option<&str>,
        options: SampleOptions,
    ) -> Result<(), RuntimeError> {
        self.sample_calls.lock().push(SampleCall {
            source: source.clone(),
            base_url: base_url.map(str::to_string),
            options: options.clone(),
        });

        let delay = *self.sample_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(prebake) = options.prebake {
            prebake.run().await?;
        }

        if self.failing_sources.lock().contains(source) {
            return Err("failed to fetch sample map".into());
        }
        Ok(())
    }

    async fn output(&self, hap: &Hap, _timing: OutputTiming) -> Result<(), RuntimeError> {
        self.outputs.lock().push(hap.clone());
        Ok(())
    }

    fn current_time(&self) -> f64 {
        *self.clock.lock()
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        info!("Mock audio context closed.");
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn graph(&self) -> Option<Arc<dyn AudioGraph>> {
        Some(self.graph.clone())
    }
}

/// A mock audio graph recording connections.
pub struct MockGraph {
    next_node: AtomicU64,
    connections: Mutex<Vec<(NodeId, NodeId)>>,
    sink: Mutex<Option<NodeId>>,
    analysers: Mutex<HashMap<NodeId, usize>>,
}

/// Node id of the mock destination.
pub const MOCK_DESTINATION: NodeId = 0;

impl MockGraph {
    fn new() -> MockGraph {
        MockGraph {
            next_node: AtomicU64::new(MOCK_DESTINATION + 1),
            connections: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            analysers: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> Vec<(NodeId, NodeId)> {
        self.connections.lock().clone()
    }

    pub fn output_sink(&self) -> Option<NodeId> {
        *self.sink.lock()
    }

    pub fn analyser_count(&self) -> usize {
        self.analysers.lock().len()
    }
}

impl AudioGraph for MockGraph {
    fn destination(&self) -> NodeId {
        MOCK_DESTINATION
    }

    fn create_analyser(&self, fft_size: usize) -> Result<NodeId, RuntimeError> {
        let node = self.next_node.fetch_add(1, Ordering::Relaxed);
        self.analysers.lock().insert(node, fft_size);
        Ok(node)
    }

    fn create_splitter(&self) -> Result<NodeId, RuntimeError> {
        Ok(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<(), RuntimeError> {
        self.connections.lock().push((from, to));
        Ok(())
    }

    fn set_output_sink(&self, sink: NodeId) -> Result<(), RuntimeError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn analyser_data(&self, analyser: NodeId) -> Vec<f32> {
        let bins = self.analysers.lock().get(&analyser).copied().unwrap_or_default() / 2;
        vec![0.25; bins]
    }
}

/// A mock visual host whose size can be changed from tests.
pub struct MockVisualHost {
    size: watch::Sender<ContainerSize>,
    surfaces: Mutex<Vec<Arc<MockSurface>>>,
}

impl MockVisualHost {
    pub fn new(size: ContainerSize) -> Arc<MockVisualHost> {
        let (tx, _) = watch::channel(size);
        Arc::new(MockVisualHost {
            size: tx,
            surfaces: Mutex::new(Vec::new()),
        })
    }

    /// Simulates the container being resized.
    pub fn resize(&self, size: ContainerSize) {
        self.size.send_replace(size);
    }

    pub fn surfaces(&self) -> Vec<Arc<MockSurface>> {
        self.surfaces.lock().clone()
    }
}

impl VisualHost for MockVisualHost {
    fn size(&self) -> watch::Receiver<ContainerSize> {
        self.size.subscribe()
    }

    fn create_surface(
        &self,
        options: SurfaceOptions,
        time_source: TimeSource,
    ) -> Result<Arc<dyn VisualSurface>, RuntimeError> {
        let surface = Arc::new(MockSurface {
            options,
            time_source,
            sizes: Mutex::new(vec![(options.width, options.height)]),
            frames: Mutex::new(Vec::new()),
        });
        self.surfaces.lock().push(surface.clone());
        Ok(surface)
    }
}

/// A mock visual surface recording sizes and frames.
pub struct MockSurface {
    pub options: SurfaceOptions,
    time_source: TimeSource,
    sizes: Mutex<Vec<(u32, u32)>>,
    frames: Mutex<Vec<AnalysisFrame>>,
}

impl MockSurface {
    pub fn sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }

    pub fn frames(&self) -> Vec<AnalysisFrame> {
        self.frames.lock().clone()
    }

    pub fn now(&self) -> f64 {
        (self.time_source)()
    }
}

impl VisualSurface for MockSurface {
    fn resize(&self, width: u32, height: u32) {
        self.sizes.lock().push((width, height));
    }

    fn feed(&self, frame: &AnalysisFrame) {
        self.frames.lock().push(frame.clone());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quoted_ranges() {
        assert_eq!(
            vec![SourceRange::new(3, 8), SourceRange::new(14, 17)],
            quoted_ranges(r#"s("bd sd").n("0 1")"#)
        );
        assert!(quoted_ranges("no strings").is_empty());
        // An unterminated quote yields nothing.
        assert!(quoted_ranges("s(\"bd").is_empty());
    }
}
