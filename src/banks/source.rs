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
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key prefix marking metadata entries in a sample map (e.g. `_base`).
pub const META_KEY_PREFIX: char = '_';

/// The key holding the base URL inside a sample map.
pub const BASE_KEY: &str = "_base";

/// The files for a single sound within a sample map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SamplePaths {
    One(String),
    Many(Vec<String>),
    /// Pitched sounds keyed by note name.
    Keyed(BTreeMap<String, SamplePaths>),
}

impl SamplePaths {
    /// Counts the files referenced by this entry.
    pub fn file_count(&self) -> usize {
        match self {
            SamplePaths::One(_) => 1,
            SamplePaths::Many(paths) => paths.len(),
            SamplePaths::Keyed(keyed) => keyed.values().map(SamplePaths::file_count).sum(),
        }
    }
}

/// Where a sample bank comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BankSource {
    /// A URL-like reference, e.g. `github:owner/repo` or a JSON map URL.
    Remote(String),
    /// An inline key to path mapping.
    Mapping(BTreeMap<String, SamplePaths>),
}

impl BankSource {
    /// Returns the sound names (non-metadata keys) of a mapping source.
    pub fn sound_names(&self) -> Vec<&str> {
        match self {
            BankSource::Remote(_) => Vec::new(),
            BankSource::Mapping(map) => map
                .keys()
                .filter(|key| !key.starts_with(META_KEY_PREFIX))
                .map(String::as_str)
                .collect(),
        }
    }

    /// Returns the `_base` entry of a mapping source, if it has one.
    pub fn embedded_base(&self) -> Option<&str> {
        match self {
            BankSource::Mapping(map) => match map.get(BASE_KEY) {
                Some(SamplePaths::One(base)) => Some(base.as_str()),
                _ => None,
            },
            BankSource::Remote(_) => None,
        }
    }

    /// Returns a copy of this source where every unprefixed sound is also
    /// reachable as `<prefix>_<name>` for each of the given prefixes. Existing
    /// keys are never overwritten. Remote sources are returned unchanged.
    pub fn with_prefixed_keys(&self, prefixes: &[&str]) -> BankSource {
        let BankSource::Mapping(map) = self else {
            return self.clone();
        };

        let mut augmented = map.clone();
        for prefix in prefixes.iter().filter(|prefix| !prefix.is_empty()) {
            let marker = format!("{}_", prefix);
            for (key, paths) in map {
                if key.starts_with(META_KEY_PREFIX) || key.starts_with(&marker) {
                    continue;
                }
                augmented
                    .entry(format!("{}{}", marker, key))
                    .or_insert_with(|| paths.clone());
            }
        }
        BankSource::Mapping(augmented)
    }
}

impl From<&str> for BankSource {
    fn from(value: &str) -> Self {
        BankSource::Remote(value.to_string())
    }
}

impl From<BTreeMap<String, SamplePaths>> for BankSource {
    fn from(value: BTreeMap<String, SamplePaths>) -> Self {
        BankSource::Mapping(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping(entries: &[(&str, SamplePaths)]) -> BankSource {
        BankSource::Mapping(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_deserialize_shapes() {
        let source: BankSource = serde_json::from_str(
            r#"{"_base": "/samples/", "bd": ["bd/1.wav", "bd/2.wav"], "sd": "sd.wav", "piano": {"c4": "c4.wav"}}"#,
        )
        .expect("valid map");
        assert_eq!(vec!["bd", "piano", "sd"], source.sound_names());
        assert_eq!(Some("/samples/"), source.embedded_base());

        let remote: BankSource = serde_json::from_str(r#""github:a/b""#).expect("valid string");
        assert_eq!(BankSource::Remote("github:a/b".into()), remote);
    }

    #[test]
    fn test_with_prefixed_keys() {
        let source = mapping(&[
            ("_base", SamplePaths::One("/x/".into())),
            ("bd", SamplePaths::One("bd.wav".into())),
            ("Kit_sd", SamplePaths::One("sd.wav".into())),
            ("Kit_hh", SamplePaths::One("custom.wav".into())),
            ("hh", SamplePaths::One("hh.wav".into())),
        ]);

        let BankSource::Mapping(augmented) = source.with_prefixed_keys(&["Kit"]) else {
            panic!("expected mapping");
        };
        assert_eq!(Some(&SamplePaths::One("bd.wav".into())), augmented.get("Kit_bd"));
        // Existing prefixed entries survive untouched.
        assert_eq!(Some(&SamplePaths::One("custom.wav".into())), augmented.get("Kit_hh"));
        // Metadata and already-prefixed keys are not re-prefixed.
        assert!(!augmented.contains_key("Kit__base"));
        assert!(!augmented.contains_key("Kit_Kit_sd"));
        assert_eq!(6, augmented.len());
    }

    #[test]
    fn test_file_count() {
        let mut keyed = BTreeMap::new();
        keyed.insert("c4".to_string(), SamplePaths::Many(vec!["a".into(), "b".into()]));
        keyed.insert("e4".to_string(), SamplePaths::One("c".into()));
        assert_eq!(3, SamplePaths::Keyed(keyed).file_count());
    }
}
