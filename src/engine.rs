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
//! The engine facade: a single object the UI drives to evaluate pattern code,
//! control the transport, load sample banks and observe playback.
//!
//! The external runtimes are injected behind the traits in [`crate::runtime`].
//! State is published as immutable [`EngineState`] snapshots, in order, to
//! every subscriber.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::banks::{BankRegistry, BankSource};
use crate::ranges::{ranges_equal, SourceRange};
use crate::runtime::{
    AudioRuntime, Hap, InlineVisual, OutputTiming, PatternRuntime, RenderSinkProvider, Repl,
    ReplConfig, ReplHooks, RuntimeError, SampleOptions, SchedulerUpdate, TimeSource,
};
use crate::util::clamp_bpm;

mod error;
mod highlight;
mod loading;
mod modules;
mod state;
mod visual;


pub use error::EngineError;
pub use loading::BankLoad;
pub use modules::{LoadedModules, ModuleCache};
pub use state::EngineState;

use highlight::{hold_time, ActiveRanges};
use loading::InFlight;
use visual::{OutputTap, VisualAttachment};

/// The slowest supported tempo.
pub const MIN_BPM: f64 = 40.0;
/// The fastest supported tempo.
pub const MAX_BPM: f64 = 240.0;

/// Engine construction parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub default_bpm: f64,
    /// Sample collection registered the first time audio is needed.
    pub bootstrap_samples: Option<BankSource>,
    /// Added to an event's duration before its highlight is released.
    pub highlight_padding: Duration,
    /// FFT size of the output analyser.
    pub fft_size: usize,
    /// How often analyser frames are pushed to an attached visual surface.
    pub frame_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            default_bpm: 120.0,
            bootstrap_samples: Some(BankSource::Remote(
                "github:tidalcycles/dirt-samples".to_string(),
            )),
            highlight_padding: Duration::from_millis(10),
            fft_size: 2048,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Options for [`Engine::evaluate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Start the transport after a successful evaluation.
    pub autostart: bool,
    /// Silence the previous pattern before the new one plays.
    pub hush: bool,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        EvaluateOptions {
            autostart: true,
            hush: true,
        }
    }
}

type Memo = Shared<BoxFuture<'static, Result<(), EngineError>>>;
type Listener = Arc<dyn Fn(&Arc<EngineState>) + Send + Sync>;

/// A state subscription. Dropping it does not unsubscribe.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    inner: Weak<EngineInner>,
}

impl Subscription {
    /// Stops delivery to the listener.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

struct EngineInner {
    runtime: Arc<dyn PatternRuntime>,
    audio: Arc<dyn AudioRuntime>,
    modules: Arc<ModuleCache>,
    settings: EngineSettings,

    state: Mutex<Arc<EngineState>>,
    /// Serializes state changes with their notifications. Reentrant so a
    /// listener may call back into the engine.
    publish: ReentrantMutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    /// Snapshots waiting for delivery. Only the outermost publish drains it,
    /// so a listener calling back into the engine can't overtake older
    /// snapshots still being delivered.
    undelivered: Mutex<VecDeque<Arc<EngineState>>>,
    delivering: AtomicBool,
    next_listener: AtomicU64,

    repl: RwLock<Option<Arc<dyn Repl>>>,
    init: Mutex<Option<Memo>>,
    audio_unlock: Mutex<Option<Memo>>,
    default_samples: Mutex<Option<Memo>>,

    banks: Mutex<BankRegistry>,
    bank_loads: Mutex<HashMap<String, InFlight>>,
    next_load: AtomicU64,
    loading: Mutex<usize>,

    highlights: Mutex<ActiveRanges>,
    inline_visuals: Mutex<Vec<InlineVisual>>,
    tap: Mutex<Option<OutputTap>>,
    visual: Mutex<Option<VisualAttachment>>,

    disposed: AtomicBool,
    span: Span,
}

/// The live-coding engine. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine sharing the process wide module cache.
    pub fn new(
        runtime: Arc<dyn PatternRuntime>,
        audio: Arc<dyn AudioRuntime>,
        settings: EngineSettings,
    ) -> Engine {
        Engine::with_module_cache(runtime, audio, ModuleCache::global(), settings)
    }

    /// Creates an engine with its own module cache.
    pub fn with_module_cache(
        runtime: Arc<dyn PatternRuntime>,
        audio: Arc<dyn AudioRuntime>,
        modules: Arc<ModuleCache>,
        settings: EngineSettings,
    ) -> Engine {
        let bpm = clamp_bpm(settings.default_bpm).unwrap_or(120.0);
        let holders = modules.acquire();
        let span = span!(Level::INFO, "engine");
        debug!(parent: &span, bpm, module_cache_holders = holders, "Engine created.");

        Engine {
            inner: Arc::new(EngineInner {
                runtime,
                audio,
                modules,
                settings,
                state: Mutex::new(Arc::new(EngineState::new(bpm))),
                publish: ReentrantMutex::new(()),
                listeners: Mutex::new(Vec::new()),
                undelivered: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
                next_listener: AtomicU64::new(0),
                repl: RwLock::new(None),
                init: Mutex::new(None),
                audio_unlock: Mutex::new(None),
                default_samples: Mutex::new(None),
                banks: Mutex::new(BankRegistry::new()),
                bank_loads: Mutex::new(HashMap::new()),
                next_load: AtomicU64::new(0),
                loading: Mutex::new(0),
                highlights: Mutex::new(ActiveRanges::default()),
                inline_visuals: Mutex::new(Vec::new()),
                tap: Mutex::new(None),
                visual: Mutex::new(None),
                disposed: AtomicBool::new(false),
                span,
            }),
        }
    }

    fn upgrade(inner: &Weak<EngineInner>) -> Option<Engine> {
        inner.upgrade().map(|inner| Engine { inner })
    }

    fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    /// The current state snapshot.
    pub fn get_state(&self) -> Arc<EngineState> {
        self.inner.state.lock().clone()
    }

    /// Registers a listener. It receives the current snapshot immediately and
    /// every later snapshot in publication order.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<EngineState>) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);

        let _publish = self.inner.publish.lock();
        self.inner.listeners.lock().push((id, listener.clone()));
        listener(&self.get_state());

        Subscription {
            id,
            inner: self.downgrade(),
        }
    }

    /// Returns a watch channel following the state, and the subscription
    /// feeding it.
    pub fn watch(&self) -> (watch::Receiver<Arc<EngineState>>, Subscription) {
        let (tx, rx) = watch::channel(self.get_state());
        let subscription = self.subscribe(move |state| {
            tx.send_replace(state.clone());
        });
        (rx, subscription)
    }

    /// Applies a change to a copy of the state. Listeners are notified only if
    /// the copy differs from the current snapshot.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut EngineState),
    {
        let _publish = self.inner.publish.lock();
        {
            let mut current = self.inner.state.lock();
            let mut draft = EngineState::clone(&current);
            f(&mut draft);
            if draft == **current {
                return;
            }
            let next = Arc::new(draft);
            *current = next.clone();
            self.inner.undelivered.lock().push_back(next);
        }
        self.deliver();
    }

    /// Delivers queued snapshots to every listener, oldest first. A nested
    /// call made from inside a listener only queues.
    fn deliver(&self) {
        if self.inner.delivering.swap(true, Ordering::AcqRel) {
            return;
        }
        let _delivering = DeliveryGuard(&*self.inner);

        loop {
            let Some(next) = self.inner.undelivered.lock().pop_front() else {
                break;
            };
            let listeners: Vec<Listener> = self
                .inner
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            for listener in listeners {
                listener(&next);
            }
        }
    }

    fn set_error(&self, error: &EngineError) {
        let message = match error {
            EngineError::Evaluation(message) => message.clone(),
            other => other.to_string(),
        };
        self.update(|state| state.error = Some(message));
    }

    fn repl(&self) -> Option<Arc<dyn Repl>> {
        self.inner.repl.read().clone()
    }

    /// The clock handed to the scheduler and visual surface: the audio
    /// context's time once audio is unlocked, zero before.
    fn time_source(&self) -> TimeSource {
        let inner = self.downgrade();
        Arc::new(move || {
            inner
                .upgrade()
                .filter(|inner| inner.state.lock().audio_unlocked)
                .map(|inner| inner.audio.current_time())
                .unwrap_or(0.0)
        })
    }

    /// Memoizes `op` in `slot`. With `retry_on_error` a failed run is
    /// forgotten so a later call can try again.
    async fn memoized<F>(
        &self,
        slot: fn(&EngineInner) -> &Mutex<Option<Memo>>,
        retry_on_error: bool,
        op: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(Engine) -> BoxFuture<'static, Result<(), EngineError>> + Send + 'static,
    {
        let memo = {
            let mut memo = slot(&self.inner).lock();
            memo.get_or_insert_with(|| {
                let inner = self.downgrade();
                async move {
                    let engine = Engine::upgrade(&inner).ok_or(EngineError::Disposed)?;
                    op(engine).await
                }
                .boxed()
                .shared()
            })
            .clone()
        };

        let result = memo.clone().await;
        if result.is_err() && retry_on_error {
            let mut current = slot(&self.inner).lock();
            if current.as_ref().is_some_and(|current| current.ptr_eq(&memo)) {
                *current = None;
            }
        }
        result
    }

    /// Loads the runtime modules and creates the REPL. Runs once; every caller
    /// waits for the same attempt.
    pub async fn init(&self) -> Result<(), EngineError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(EngineError::Disposed);
        }
        self.memoized(|inner| &inner.init, false, |engine| {
            async move { engine.bootstrap().await }.boxed()
        })
        .await
    }

    async fn bootstrap(&self) -> Result<(), EngineError> {
        info!(parent: &self.inner.span, "Bootstrapping engine.");
        let result = self.create_repl().await;
        match &result {
            Ok(()) => info!(parent: &self.inner.span, "Engine ready."),
            Err(e) => {
                error!(parent: &self.inner.span, err = %e, "Engine bootstrap failed.");
                self.set_error(e);
            }
        }
        result
    }

    async fn create_repl(&self) -> Result<(), EngineError> {
        let modules = self
            .inner
            .modules
            .load(self.inner.runtime.clone())
            .await?;

        let hooks = Arc::new(EngineHooks {
            inner: self.downgrade(),
        });
        let repl = self
            .inner
            .runtime
            .create_repl(ReplConfig {
                transpiler: modules.transpiler(),
                hooks: hooks.clone(),
                render_sinks: hooks,
                time_source: self.time_source(),
            })
            .map_err(|e| EngineError::Bootstrap(e.0))?;

        repl.set_cps(self.get_state().cps());
        *self.inner.repl.write() = Some(repl);
        self.update(|state| state.is_ready = true);
        Ok(())
    }

    /// Evaluates pattern code. Empty code stops playback instead.
    pub async fn evaluate(&self, code: &str, options: EvaluateOptions) -> Result<(), EngineError> {
        self.init().await?;
        if code.trim().is_empty() {
            debug!(parent: &self.inner.span, "Empty code, stopping.");
            return self.stop();
        }
        let repl = self.repl().ok_or(EngineError::Disposed)?;

        self.inner.inline_visuals.lock().clear();
        self.update(|state| {
            state.error = None;
            state.is_evaluating = true;
        });

        repl.set_code(code);
        let result = repl
            .evaluate(code, options.autostart, options.hush)
            .await
            .map_err(|e| EngineError::Evaluation(e.0));
        self.update(|state| state.is_evaluating = false);

        if let Err(e) = &result {
            warn!(parent: &self.inner.span, err = %e, "Evaluation failed.");
            self.set_error(e);
        }
        result
    }

    /// Starts the transport, unlocking audio and loading the default samples
    /// first.
    pub async fn start(&self) -> Result<(), EngineError> {
        let result = async {
            self.init().await?;
            self.ensure_audio().await?;
            self.ensure_default_samples().await?;
            let repl = self.repl().ok_or(EngineError::Disposed)?;
            repl.start().map_err(|e| EngineError::Transport(e.0))
        }
        .await;

        if let Err(e) = &result {
            warn!(parent: &self.inner.span, err = %e, "Failed to start playback.");
            self.set_error(e);
        }
        result
    }

    fn transport<F>(&self, name: &'static str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&dyn Repl) -> Result<(), RuntimeError>,
    {
        let Some(repl) = self.repl() else {
            return Ok(());
        };
        f(repl.as_ref()).map_err(|e| {
            let e = EngineError::Transport(e.0);
            warn!(parent: &self.inner.span, op = name, err = %e, "Transport operation failed.");
            self.set_error(&e);
            e
        })
    }

    /// Pauses the transport. Does nothing before init.
    pub fn pause(&self) -> Result<(), EngineError> {
        self.transport("pause", |repl| repl.pause())
    }

    /// Stops the transport and drops every highlight.
    pub fn stop(&self) -> Result<(), EngineError> {
        let result = self.transport("stop", |repl| repl.stop());
        self.clear_highlights();
        result
    }

    /// Toggles the transport. Does nothing before init.
    pub fn toggle(&self) -> Result<(), EngineError> {
        self.transport("toggle", |repl| repl.toggle())
    }

    /// Sets the tempo, clamped to the supported range. Non-finite values are
    /// ignored. Returns the tempo in effect.
    pub fn set_tempo(&self, bpm: f64) -> f64 {
        let Some(bpm) = clamp_bpm(bpm) else {
            warn!(parent: &self.inner.span, bpm, "Ignoring invalid tempo.");
            return self.get_state().bpm;
        };
        if let Some(repl) = self.repl() {
            repl.set_cps(bpm / 60.0);
        }
        self.update(|state| state.bpm = bpm);
        bpm
    }

    /// Unlocks and resumes the audio context. Shared by concurrent callers; a
    /// failure may be retried from a later user gesture.
    pub async fn ensure_audio(&self) -> Result<(), EngineError> {
        if self.get_state().audio_unlocked {
            return Ok(());
        }
        self.memoized(|inner| &inner.audio_unlock, true, |engine| {
            async move { engine.unlock_audio().await }.boxed()
        })
        .await
    }

    async fn unlock_audio(&self) -> Result<(), EngineError> {
        let audio = &self.inner.audio;
        let result = async {
            audio.init_audio_on_first_click().await?;
            audio.resume().await
        }
        .await
        .map_err(|e| EngineError::Audio(e.0));

        match &result {
            Ok(()) => {
                info!(parent: &self.inner.span, "Audio unlocked.");
                self.update(|state| state.audio_unlocked = true);
            }
            Err(e) => {
                warn!(parent: &self.inner.span, err = %e, "Unable to unlock audio.");
                self.set_error(e);
            }
        }
        result
    }

    /// Registers the synth sounds and the bootstrap sample collection.
    pub async fn ensure_default_samples(&self) -> Result<(), EngineError> {
        if self.get_state().samples_loaded {
            return Ok(());
        }
        self.memoized(|inner| &inner.default_samples, true, |engine| {
            async move { engine.load_default_samples().await }.boxed()
        })
        .await
    }

    async fn load_default_samples(&self) -> Result<(), EngineError> {
        self.adjust_loading(1);
        let result = async {
            self.ensure_audio().await?;
            let audio = &self.inner.audio;
            audio
                .register_synth_sounds()
                .await
                .map_err(|e| EngineError::Audio(e.0))?;
            if let Some(source) = &self.inner.settings.bootstrap_samples {
                audio
                    .samples(source, None, SampleOptions::default())
                    .await
                    .map_err(|e| EngineError::Audio(e.0))?;
            }
            Ok(())
        }
        .await;
        self.adjust_loading(-1);

        match &result {
            Ok(()) => {
                info!(parent: &self.inner.span, "Default samples loaded.");
                self.update(|state| state.samples_loaded = true);
            }
            Err(e) => {
                warn!(parent: &self.inner.span, err = %e, "Failed to load default samples.");
                self.set_error(e);
            }
        }
        result
    }

    /// Moves the shared count of in-flight sample loads.
    fn adjust_loading(&self, delta: isize) {
        let _publish = self.inner.publish.lock();
        let loading = {
            let mut count = self.inner.loading.lock();
            *count = count.saturating_add_signed(delta);
            *count > 0
        };
        self.update(|state| state.is_loading_samples = loading);
    }

    /// Marks an event's ranges active for its duration.
    fn highlight(&self, ranges: Vec<SourceRange>, duration_secs: f64) {
        if ranges.is_empty() {
            return;
        }

        let generation = {
            let _publish = self.inner.publish.lock();
            let (generation, active) = {
                let mut highlights = self.inner.highlights.lock();
                let generation = highlights.acquire(&ranges);
                (generation, highlights.active())
            };
            self.publish_active(active);
            generation
        };

        let hold = hold_time(duration_secs, self.inner.settings.highlight_padding);
        let inner = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            if let Some(engine) = Engine::upgrade(&inner) {
                engine.release_highlight(&ranges, generation);
            }
        });
    }

    fn release_highlight(&self, ranges: &[SourceRange], generation: u64) {
        let _publish = self.inner.publish.lock();
        let active = {
            let mut highlights = self.inner.highlights.lock();
            if !highlights.release(ranges, generation) {
                return;
            }
            highlights.active()
        };
        self.publish_active(active);
    }

    fn clear_highlights(&self) {
        let _publish = self.inner.publish.lock();
        self.inner.highlights.lock().clear();
        self.publish_active(Vec::new());
    }

    fn publish_active(&self, active: Vec<SourceRange>) {
        self.update(|state| {
            if !ranges_equal(&state.active_locations, &active) {
                state.active_locations = active;
            }
        });
    }

    /// Visualizations the last evaluation asked to draw inline.
    pub fn inline_visuals(&self) -> Vec<InlineVisual> {
        self.inner.inline_visuals.lock().clone()
    }

    fn apply_scheduler_update(&self, update: SchedulerUpdate) {
        let error = update.eval_error.or(update.scheduler_error);
        self.update(|state| {
            state.is_playing = update.started;
            state.is_evaluating = update.pending;
            state.error = error;
            if !ranges_equal(&state.mini_locations, &update.mini_locations) {
                state.mini_locations = update.mini_locations;
            }
            state.widgets = update.widgets;
        });
    }

    async fn realize(&self, hap: Hap, timing: OutputTiming) -> Result<(), RuntimeError> {
        self.ensure_audio()
            .await
            .map_err(|e| RuntimeError(e.to_string()))?;
        self.ensure_default_samples()
            .await
            .map_err(|e| RuntimeError(e.to_string()))?;
        self.highlight(hap.locations.clone(), timing.duration);
        self.inner.audio.output(&hap, timing).await
    }

    /// Stops playback, detaches listeners and visuals and closes the audio
    /// context. Outstanding bank loads are neither awaited nor aborted.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: &self.inner.span, "Disposing engine.");

        if let Some(repl) = self.repl() {
            if let Err(e) = repl.stop() {
                debug!(parent: &self.inner.span, err = %e, "Ignoring stop failure during dispose.");
            }
        }
        self.detach_visual();
        self.inner.listeners.lock().clear();
        self.clear_highlights();
        self.inner.bank_loads.lock().clear();
        self.inner.modules.release();

        if self.get_state().audio_unlocked {
            if let Err(e) = self.inner.audio.close().await {
                debug!(parent: &self.inner.span, err = %e, "Ignoring audio close failure.");
            }
        }
    }

    /// Returns true once dispose has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

/// Ends a delivery pass, even if a listener panicked. Undelivered snapshots
/// are dropped with it; the next publish carries the current state.
struct DeliveryGuard<'a>(&'a EngineInner);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.undelivered.lock().clear();
        self.0.delivering.store(false, Ordering::Release);
    }
}

/// Callbacks handed to the REPL. Holds the engine weakly so the REPL doesn't
/// keep it alive.
struct EngineHooks {
    inner: Weak<EngineInner>,
}

impl EngineHooks {
    fn engine(&self) -> Result<Engine, RuntimeError> {
        Engine::upgrade(&self.inner).ok_or_else(|| RuntimeError(EngineError::Disposed.to_string()))
    }
}

#[async_trait]
impl ReplHooks for EngineHooks {
    async fn default_output(&self, hap: Hap, timing: OutputTiming) -> Result<(), RuntimeError> {
        self.engine()?.realize(hap, timing).await
    }

    async fn before_start(&self) -> Result<(), RuntimeError> {
        let engine = self.engine()?;
        engine
            .ensure_audio()
            .await
            .map_err(|e| RuntimeError(e.to_string()))?;
        engine
            .ensure_default_samples()
            .await
            .map_err(|e| RuntimeError(e.to_string()))
    }

    fn on_update_state(&self, update: SchedulerUpdate) {
        if let Ok(engine) = self.engine() {
            engine.apply_scheduler_update(update);
        }
    }

    fn on_eval_error(&self, error: RuntimeError) {
        if let Ok(engine) = self.engine() {
            engine.update(|state| state.error = Some(error.0));
        }
    }

    fn after_eval(&self, code: &str) {
        if let Ok(engine) = self.engine() {
            debug!(parent: &engine.inner.span, chars = code.len(), "Evaluated.");
            engine.update(|state| state.last_evaluated_at = Some(SystemTime::now()));
        }
    }
}

impl RenderSinkProvider for EngineHooks {
    fn submit(&self, visual: InlineVisual) {
        if let Some(inner) = self.inner.upgrade() {
            inner.inline_visuals.lock().push(visual);
        }
    }
}
