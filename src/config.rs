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
//! Layered configuration: an optional YAML file overridden by `LOOPDECK__*`
//! environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use duration_string::DurationString;
use serde::Deserialize;

use crate::banks::BankSource;
use crate::engine::EngineSettings;
use crate::util::clamp_bpm;

mod error;

pub use error::ConfigError;

const ENV_PREFIX: &str = "LOOPDECK";
const DEFAULT_BPM: f64 = 120.0;
const DEFAULT_BOOTSTRAP_SAMPLES: &str = "github:tidalcycles/dirt-samples";
const DEFAULT_HIGHLIGHT_PADDING: Duration = Duration::from_millis(10);
const DEFAULT_FFT_SIZE: usize = 2048;
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Top level settings.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    /// Initial tempo in beats per minute.
    default_bpm: f64,

    /// Sample pack loaded before the first sound plays. Empty disables it.
    bootstrap_samples: Option<String>,

    /// How long a highlight outlives its event, e.g. "10ms".
    highlight_padding: Option<String>,

    /// Where the pending sample import is stored.
    storage_dir: Option<PathBuf>,

    github: GithubSettings,
    samples: ScanSettings,
    visual: VisualSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_bpm: DEFAULT_BPM,
            bootstrap_samples: Some(DEFAULT_BOOTSTRAP_SAMPLES.to_string()),
            highlight_padding: None,
            storage_dir: None,
            github: GithubSettings::default(),
            samples: ScanSettings::default(),
            visual: VisualSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from the given file (if any) and the environment.
    pub fn load(file: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    /// Returns the initial tempo, clamped into range.
    pub fn default_bpm(&self) -> f64 {
        clamp_bpm(self.default_bpm).unwrap_or(DEFAULT_BPM)
    }

    /// Returns the bootstrap sample pack, if enabled.
    pub fn bootstrap_samples(&self) -> Option<&str> {
        self.bootstrap_samples
            .as_deref()
            .map(str::trim)
            .filter(|source| !source.is_empty())
    }

    /// Returns the highlight padding (default: 10ms).
    pub fn highlight_padding(&self) -> Result<Duration, ConfigError> {
        parse_duration("highlight_padding", self.highlight_padding.as_deref())
            .map(|padding| padding.unwrap_or(DEFAULT_HIGHLIGHT_PADDING))
    }

    /// Returns the storage directory, defaulting to the platform data dir.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("loopdeck")
        })
    }

    pub fn github(&self) -> &GithubSettings {
        &self.github
    }

    pub fn samples(&self) -> &ScanSettings {
        &self.samples
    }

    pub fn visual(&self) -> &VisualSettings {
        &self.visual
    }

    /// Builds the engine settings.
    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            default_bpm: self.default_bpm(),
            bootstrap_samples: self
                .bootstrap_samples()
                .map(|source| BankSource::Remote(source.to_string())),
            highlight_padding: self.highlight_padding()?,
            fft_size: self.visual.fft_size(),
            frame_interval: self.visual.frame_interval()?,
        })
    }
}

/// GitHub API settings.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GithubSettings {
    api_base: String,
    raw_base: String,
    token: Option<String>,
    user_agent: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        GithubSettings {
            api_base: "https://api.github.com".to_string(),
            raw_base: "https://raw.githubusercontent.com".to_string(),
            token: None,
            user_agent: format!("loopdeck/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl GithubSettings {
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn raw_base(&self) -> &str {
        &self.raw_base
    }

    /// Returns the API token, if one is configured and non-empty.
    pub fn token(&self) -> Option<String> {
        self.token.clone().filter(|token| !token.is_empty())
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Settings for the samples directory scan.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ScanSettings {
    base_url: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            base_url: "/samples/".to_string(),
        }
    }
}

impl ScanSettings {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Settings for the visual tap.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct VisualSettings {
    fft_size: Option<usize>,
    frame_interval: Option<String>,
}

impl VisualSettings {
    /// Returns the analyser FFT size, rounded up to a power of two (default: 2048).
    pub fn fft_size(&self) -> usize {
        self.fft_size
            .unwrap_or(DEFAULT_FFT_SIZE)
            .clamp(32, 32768)
            .next_power_of_two()
    }

    /// Returns how often analysis frames are pushed (default: 16ms).
    pub fn frame_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("visual.frame_interval", self.frame_interval.as_deref())
            .map(|interval| interval.unwrap_or(DEFAULT_FRAME_INTERVAL))
    }
}

fn parse_duration(field: &'static str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            DurationString::from_string(value.to_string())
                .map(Duration::from)
                .map_err(|e| ConfigError::InvalidDuration {
                    field,
                    value: value.to_string(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_defaults() -> Result<(), Box<dyn Error>> {
        let settings = Settings::load(None)?;
        assert_eq!(120.0, settings.default_bpm());
        assert_eq!(Some(DEFAULT_BOOTSTRAP_SAMPLES), settings.bootstrap_samples());
        assert_eq!(Duration::from_millis(10), settings.highlight_padding()?);
        assert_eq!("https://api.github.com", settings.github().api_base());
        assert_eq!("/samples/", settings.samples().base_url());
        assert_eq!(2048, settings.visual().fft_size());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_yaml_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("loopdeck.yaml");
        fs::write(
            &path,
            r#"
default_bpm: 500
bootstrap_samples: ""
highlight_padding: 25ms
storage_dir: /tmp/loopdeck-test
github:
  token: abc
visual:
  fft_size: 1000
  frame_interval: 33ms
"#,
        )?;

        let settings = Settings::load(Some(&path))?;
        assert_eq!(240.0, settings.default_bpm());
        assert_eq!(None, settings.bootstrap_samples());
        assert_eq!(Duration::from_millis(25), settings.highlight_padding()?);
        assert_eq!(PathBuf::from("/tmp/loopdeck-test"), settings.storage_dir());
        assert_eq!(Some("abc".to_string()), settings.github().token());
        assert_eq!(
            "https://raw.githubusercontent.com",
            settings.github().raw_base()
        );

        let engine = settings.engine_settings()?;
        assert_eq!(1024, engine.fft_size);
        assert_eq!(Duration::from_millis(33), engine.frame_interval);
        assert!(engine.bootstrap_samples.is_none());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_invalid_duration() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("loopdeck.yaml");
        fs::write(&path, "highlight_padding: soon\n")?;

        let settings = Settings::load(Some(&path))?;
        assert!(matches!(
            settings.highlight_padding(),
            Err(ConfigError::InvalidDuration { field: "highlight_padding", .. })
        ));
        Ok(())
    }
}
