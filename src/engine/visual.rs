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
use std::{
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Engine, EngineError};
use crate::runtime::{AnalysisFrame, AudioGraph, NodeId, SurfaceOptions, VisualHost, VisualSurface};

/// Nodes routing the audio output through an analyser.
#[derive(Clone)]
pub(crate) struct OutputTap {
    graph: Arc<dyn AudioGraph>,
    pub splitter: NodeId,
    pub analyser: NodeId,
}

/// A mounted visual surface and the tasks feeding it.
pub(crate) struct VisualAttachment {
    surface: Arc<dyn VisualSurface>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for VisualAttachment {
    fn drop(&mut self) {
        self.tasks.iter().for_each(JoinHandle::abort);
    }
}

type TapRegistry = Mutex<Vec<(Weak<dyn AudioGraph>, OutputTap)>>;

/// Taps already installed, per audio graph. A graph is tapped at most once
/// per process no matter how many engines share it.
fn installed_taps() -> &'static TapRegistry {
    static TAPS: OnceLock<TapRegistry> = OnceLock::new();
    TAPS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns the graph's tap, installing it first if needed. The splitter feeds
/// both the real destination and the analyser, and becomes the graph's output
/// sink.
fn install_tap(graph: Arc<dyn AudioGraph>, fft_size: usize) -> Result<OutputTap, EngineError> {
    let mut taps = installed_taps().lock();
    taps.retain(|(graph, _)| graph.strong_count() > 0);
    if let Some((_, tap)) = taps.iter().find(|(installed, _)| {
        installed
            .upgrade()
            .is_some_and(|installed| Arc::ptr_eq(&installed, &graph))
    }) {
        return Ok(tap.clone());
    }

    let audio_error = |e: crate::runtime::RuntimeError| EngineError::Audio(e.0);
    let splitter = graph.create_splitter().map_err(audio_error)?;
    let analyser = graph.create_analyser(fft_size).map_err(audio_error)?;
    graph
        .connect(splitter, graph.destination())
        .map_err(audio_error)?;
    graph.connect(splitter, analyser).map_err(audio_error)?;
    graph.set_output_sink(splitter).map_err(audio_error)?;
    info!(splitter, analyser, fft_size, "Installed output analyser.");

    let tap = OutputTap {
        graph: graph.clone(),
        splitter,
        analyser,
    };
    taps.push((Arc::downgrade(&graph), tap.clone()));
    Ok(tap)
}

impl Engine {
    /// Routes the audio output through an analyser, once. Returns None if the
    /// audio runtime exposes no graph.
    pub fn ensure_output_tap(&self) -> Result<Option<(NodeId, NodeId)>, EngineError> {
        let mut tap = self.inner.tap.lock();
        if tap.is_none() {
            let Some(graph) = self.inner.audio.graph() else {
                return Ok(None);
            };
            *tap = Some(install_tap(graph, self.inner.settings.fft_size)?);
        }
        Ok(tap.as_ref().map(|tap| (tap.splitter, tap.analyser)))
    }

    /// Reads one frame from the output analyser.
    pub fn analysis_frame(&self) -> Option<AnalysisFrame> {
        let tap = self.inner.tap.lock().clone()?;
        Some(AnalysisFrame {
            time: (self.time_source())(),
            samples: tap.graph.analyser_data(tap.analyser),
        })
    }

    /// Mounts the visual surface in `host`. The surface follows the host's
    /// size and is fed analyser frames until detached. Attaching again returns
    /// the mounted surface.
    pub fn attach_visual(
        &self,
        host: Arc<dyn VisualHost>,
    ) -> Result<Arc<dyn VisualSurface>, EngineError> {
        let mut visual = self.inner.visual.lock();
        if let Some(attached) = visual.as_ref() {
            return Ok(attached.surface.clone());
        }

        let mut sizes = host.size();
        let (width, height) = sizes.borrow_and_update().pixel_size();
        let surface = host
            .create_surface(
                SurfaceOptions {
                    width,
                    height,
                    detect_audio: false,
                },
                self.time_source(),
            )
            .map_err(|e| EngineError::Audio(e.0))?;
        self.ensure_output_tap()?;

        let resize = tokio::spawn({
            let surface = surface.clone();
            async move {
                while sizes.changed().await.is_ok() {
                    let (width, height) = sizes.borrow_and_update().pixel_size();
                    debug!(width, height, "Resizing visual surface.");
                    surface.resize(width, height);
                }
            }
        });

        let feed = tokio::spawn({
            let surface = surface.clone();
            let engine = self.downgrade();
            let period = self.inner.settings.frame_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            async move {
                loop {
                    ticker.tick().await;
                    let Some(engine) = Engine::upgrade(&engine) else {
                        break;
                    };
                    if let Some(frame) = engine.analysis_frame() {
                        surface.feed(&frame);
                    }
                }
            }
        });

        info!(parent: &self.inner.span, width, height, "Visual surface attached.");
        *visual = Some(VisualAttachment {
            surface: surface.clone(),
            tasks: vec![resize, feed],
        });
        Ok(surface)
    }

    /// Unmounts the visual surface. The output tap stays installed.
    pub fn detach_visual(&self) -> bool {
        let detached = self.inner.visual.lock().take().is_some();
        if detached {
            info!(parent: &self.inner.span, "Visual surface detached.");
        }
        detached
    }
}
