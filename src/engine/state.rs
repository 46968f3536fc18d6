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
use std::time::SystemTime;

use serde::Serialize;

use crate::banks::SampleBankState;
use crate::ranges::SourceRange;
use crate::runtime::Widget;

/// The observable state of the engine. Every published snapshot is a new,
/// immutable value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// The runtime modules are loaded and the REPL exists.
    pub is_ready: bool,
    pub is_playing: bool,
    pub is_evaluating: bool,
    pub bpm: f64,
    pub audio_unlocked: bool,
    /// The bootstrap samples and synth sounds are registered.
    pub samples_loaded: bool,
    /// At least one sample load is in flight.
    pub is_loading_samples: bool,
    /// Every highlightable span of the current pattern.
    pub mini_locations: Vec<SourceRange>,
    /// Spans of the events sounding right now.
    pub active_locations: Vec<SourceRange>,
    pub sample_banks: Vec<SampleBankState>,
    pub error: Option<String>,
    pub last_evaluated_at: Option<SystemTime>,
    pub widgets: Vec<Widget>,
}

impl EngineState {
    /// The state of a freshly constructed engine.
    pub fn new(bpm: f64) -> EngineState {
        EngineState {
            is_ready: false,
            is_playing: false,
            is_evaluating: false,
            bpm,
            audio_unlocked: false,
            samples_loaded: false,
            is_loading_samples: false,
            mini_locations: Vec::new(),
            active_locations: Vec::new(),
            sample_banks: Vec::new(),
            error: None,
            last_evaluated_at: None,
            widgets: Vec::new(),
        }
    }

    /// The tempo in cycles per second, assuming one cycle per beat.
    pub fn cps(&self) -> f64 {
        self.bpm / 60.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let state = EngineState::new(120.0);
        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(serde_json::json!(false), json["isReady"]);
        assert_eq!(serde_json::json!(120.0), json["bpm"]);
        assert_eq!(serde_json::json!([]), json["activeLocations"]);
        assert_eq!(2.0, state.cps());
    }
}
