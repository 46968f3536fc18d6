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
//! Call and callback contracts of the external runtimes the engine drives:
//! the pattern runtime (module loading, evaluation scope, REPL), the audio
//! runtime (context unlock, sample collections, event output, audio graph)
//! and the visual host used by the oscilloscope surface.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::banks::{BankSource, Prebake};
use crate::ranges::SourceRange;

pub mod mock;

/// An error reported by an external runtime. Only the message is meaningful.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RuntimeError(pub String);

impl From<&str> for RuntimeError {
    fn from(value: &str) -> Self {
        RuntimeError(value.to_string())
    }
}

impl From<String> for RuntimeError {
    fn from(value: String) -> Self {
        RuntimeError(value)
    }
}

/// A module the pattern runtime needs loaded before evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    /// Bootstrap fails if a required module can't be loaded.
    pub required: bool,
}

impl ModuleSpec {
    pub fn required(name: &str) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            required: false,
        }
    }
}

/// Turns user code into something the REPL can evaluate.
pub trait Transpiler: Send + Sync {
    fn transpile(&self, code: &str) -> Result<String, RuntimeError>;
}

/// A named export of a loaded module.
#[derive(Clone)]
pub enum Export {
    /// Anything the engine doesn't need to look into.
    Value,
    Transpiler(Arc<dyn Transpiler>),
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Value => f.write_str("Value"),
            Export::Transpiler(_) => f.write_str("Transpiler(..)"),
        }
    }
}

/// A loaded module namespace.
#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub exports: BTreeMap<String, Export>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module {
            name: name.to_string(),
            exports: BTreeMap::new(),
        }
    }

    /// Adds an export and returns the module.
    pub fn with_export(mut self, name: &str, export: Export) -> Module {
        self.exports.insert(name.to_string(), export);
        self
    }
}

/// Export names probed, in order, for a usable transpiler.
pub const TRANSPILER_EXPORTS: [&str; 3] = ["transpiler", "default", "transpile"];

/// Finds the first usable transpiler among the modules' expected export names.
pub fn find_transpiler(modules: &[Module]) -> Option<Arc<dyn Transpiler>> {
    modules.iter().find_map(|module| {
        TRANSPILER_EXPORTS
            .iter()
            .find_map(|name| match module.exports.get(*name) {
                Some(Export::Transpiler(transpiler)) => Some(transpiler.clone()),
                _ => None,
            })
    })
}

/// One realized event handed to the output hook.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hap {
    pub value: serde_json::Value,
    /// Source spans the event originates from.
    pub locations: Vec<SourceRange>,
}

/// Timing information accompanying a realized event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputTiming {
    /// Seconds until the event must sound.
    pub deadline: f64,
    /// Event duration in seconds.
    pub duration: f64,
    /// Cycles per second at the time of scheduling.
    pub cps: f64,
    /// Scheduled start on the runtime clock.
    pub scheduled_time: f64,
}

/// An inline control declared by the evaluated code, e.g. a slider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: usize,
    pub to: usize,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: Option<f64>,
}

/// Scheduler state pushed on every tick or evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchedulerUpdate {
    /// The full set of highlightable spans of the current pattern.
    pub mini_locations: Vec<SourceRange>,
    /// Transport started.
    pub started: bool,
    /// Evaluation in progress.
    pub pending: bool,
    pub eval_error: Option<String>,
    pub scheduler_error: Option<String>,
    pub widgets: Vec<Widget>,
}

/// A visualization requested by pattern code to be drawn inline in the editor.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InlineVisual {
    /// e.g. "scope", "punchcard".
    pub kind: String,
    pub range: Option<SourceRange>,
    pub options: serde_json::Value,
}

/// Capability given to the evaluation scope so visualization operators can
/// render without reaching into host globals.
pub trait RenderSinkProvider: Send + Sync {
    fn submit(&self, visual: InlineVisual);
}

/// Reads the clock the scheduler should use.
pub type TimeSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Host callbacks the REPL invokes.
#[async_trait]
pub trait ReplHooks: Send + Sync {
    /// Realizes one event as sound and highlighting.
    async fn default_output(&self, hap: Hap, timing: OutputTiming) -> Result<(), RuntimeError>;
    /// Called before the transport starts.
    async fn before_start(&self) -> Result<(), RuntimeError>;
    fn on_update_state(&self, update: SchedulerUpdate);
    fn on_eval_error(&self, error: RuntimeError);
    fn after_eval(&self, code: &str);
}

/// Everything a REPL is constructed with.
pub struct ReplConfig {
    pub transpiler: Arc<dyn Transpiler>,
    pub hooks: Arc<dyn ReplHooks>,
    pub render_sinks: Arc<dyn RenderSinkProvider>,
    pub time_source: TimeSource,
}

/// The evaluate-and-schedule object of the pattern runtime.
#[async_trait]
pub trait Repl: Send + Sync {
    async fn evaluate(&self, code: &str, autostart: bool, hush: bool) -> Result<(), RuntimeError>;
    fn start(&self) -> Result<(), RuntimeError>;
    fn pause(&self) -> Result<(), RuntimeError>;
    fn stop(&self) -> Result<(), RuntimeError>;
    fn toggle(&self) -> Result<(), RuntimeError>;
    /// Sets the tempo in cycles per second.
    fn set_cps(&self, cps: f64);
    fn set_code(&self, code: &str);
}

/// The pattern evaluation and scheduling runtime.
#[async_trait]
pub trait PatternRuntime: Send + Sync {
    /// Modules to load before the evaluation scope can be built.
    fn modules(&self) -> Vec<ModuleSpec>;
    async fn load_module(&self, name: &str) -> Result<Module, RuntimeError>;
    /// Merges the modules' exports into one evaluation scope.
    async fn eval_scope(&self, modules: &[Module]) -> Result<(), RuntimeError>;
    fn create_repl(&self, config: ReplConfig) -> Result<Arc<dyn Repl>, RuntimeError>;
}

/// Extra options passed along with a sample collection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleOptions {
    pub tag: Option<String>,
    pub prebake: Option<Prebake>,
}

/// Identifier of a node in the audio graph.
pub type NodeId = u64;

/// Minimal audio-graph surface used to tap the output for analysis.
pub trait AudioGraph: Send + Sync {
    /// The real output.
    fn destination(&self) -> NodeId;
    fn create_analyser(&self, fft_size: usize) -> Result<NodeId, RuntimeError>;
    /// A pass-through node that can feed several outputs.
    fn create_splitter(&self) -> Result<NodeId, RuntimeError>;
    fn connect(&self, from: NodeId, to: NodeId) -> Result<(), RuntimeError>;
    /// Makes synthesis primitives connect to `sink` instead of the destination.
    fn set_output_sink(&self, sink: NodeId) -> Result<(), RuntimeError>;
    fn analyser_data(&self, analyser: NodeId) -> Vec<f32>;
}

/// The audio output runtime.
#[async_trait]
pub trait AudioRuntime: Send + Sync {
    /// Arms the context unlock. Must be reached from a user gesture.
    async fn init_audio_on_first_click(&self) -> Result<(), RuntimeError>;
    /// Resumes the audio context.
    async fn resume(&self) -> Result<(), RuntimeError>;
    async fn register_synth_sounds(&self) -> Result<(), RuntimeError>;
    /// Registers a named sample collection for playback.
    async fn samples(
        &self,
        source: &BankSource,
        base_url: Option<&str>,
        options: SampleOptions,
    ) -> Result<(), RuntimeError>;
    /// Plays one event.
    async fn output(&self, hap: &Hap, timing: OutputTiming) -> Result<(), RuntimeError>;
    /// The audio context clock in seconds.
    fn current_time(&self) -> f64;
    async fn close(&self) -> Result<(), RuntimeError>;
    /// The audio graph, if the runtime exposes one.
    fn graph(&self) -> Option<Arc<dyn AudioGraph>> {
        None
    }
}

/// CSS size and pixel ratio of the element hosting the visual surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContainerSize {
    pub width: f64,
    pub height: f64,
    pub device_pixel_ratio: f64,
}

impl ContainerSize {
    /// Device pixel dimensions, never smaller than 1x1.
    pub fn pixel_size(&self) -> (u32, u32) {
        let ratio = if self.device_pixel_ratio.is_finite() && self.device_pixel_ratio > 0.0 {
            self.device_pixel_ratio
        } else {
            1.0
        };
        let scale = |css: f64| (css.max(0.0) * ratio).round().max(1.0) as u32;
        (scale(self.width), scale(self.height))
    }
}

/// Options the visual surface is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceOptions {
    pub width: u32,
    pub height: u32,
    /// Whether the surface opens its own audio input.
    pub detect_audio: bool,
}

/// A frame of analyser data pushed to the surface.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisFrame {
    pub time: f64,
    pub samples: Vec<f32>,
}

/// The shader based visual surface.
pub trait VisualSurface: Send + Sync {
    fn resize(&self, width: u32, height: u32);
    fn feed(&self, frame: &AnalysisFrame);
}

/// The element a visual surface is mounted in.
pub trait VisualHost: Send + Sync {
    /// Current size, updated whenever the container is resized.
    fn size(&self) -> watch::Receiver<ContainerSize>;
    fn create_surface(
        &self,
        options: SurfaceOptions,
        time_source: TimeSource,
    ) -> Result<Arc<dyn VisualSurface>, RuntimeError>;
}

#[cfg(test)]
mod test {
    use super::*;

    struct Identity;

    impl Transpiler for Identity {
        fn transpile(&self, code: &str) -> Result<String, RuntimeError> {
            Ok(code.to_string())
        }
    }

    #[test]
    fn test_find_transpiler_shapes() {
        let plain = Module::new("core").with_export("sequence", Export::Value);
        assert!(find_transpiler(&[plain.clone()]).is_none());

        let wrong_shape = Module::new("transpiler").with_export("transpiler", Export::Value);
        assert!(find_transpiler(&[plain.clone(), wrong_shape]).is_none());

        let default_export =
            Module::new("transpiler").with_export("default", Export::Transpiler(Arc::new(Identity)));
        let found = find_transpiler(&[plain, default_export]).expect("transpiler");
        assert_eq!(Ok("s(\"bd\")".to_string()), found.transpile("s(\"bd\")"));
    }

    #[test]
    fn test_pixel_size() {
        let size = ContainerSize {
            width: 300.0,
            height: 150.5,
            device_pixel_ratio: 2.0,
        };
        assert_eq!((600, 301), size.pixel_size());

        let collapsed = ContainerSize {
            width: 0.0,
            height: -3.0,
            device_pixel_ratio: f64::NAN,
        };
        assert_eq!((1, 1), collapsed.pixel_size());
    }
}
