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
//! Pure helpers deriving identifiers, labels and summaries for sample banks.

use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;
use serde::Serialize;

use super::source::BankSource;

/// Async hook run by the sample runtime before a bank's files are fetched.
pub type PrebakeFn = dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync;

/// A shared prebake callback. Two callbacks are equal only if they are the
/// same allocation.
#[derive(Clone)]
pub struct Prebake(Arc<PrebakeFn>);

impl Prebake {
    pub fn new<F>(f: F) -> Prebake
    where
        F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        Prebake(Arc::new(f))
    }

    /// Runs the callback.
    pub fn run(&self) -> BoxFuture<'static, Result<(), String>> {
        (self.0)()
    }
}

impl PartialEq for Prebake {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Prebake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Prebake(..)")
    }
}

/// Loading metadata attached to a bank.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip)]
    pub prebake: Option<Prebake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_prefix: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bank_aliases: Vec<String>,
}

/// A partial metadata update. Only fields set to `Some` are applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BankMetaPatch {
    pub base_url: Option<String>,
    pub tag: Option<String>,
    pub prebake: Option<Prebake>,
    pub bank_prefix: Option<String>,
    pub bank_aliases: Option<Vec<String>>,
}

impl BankMetaPatch {
    /// Returns true if the patch would not change anything.
    pub fn is_empty(&self) -> bool {
        self.base_url.is_none()
            && self.tag.is_none()
            && self.prebake.is_none()
            && self.bank_prefix.is_none()
            && self.bank_aliases.is_none()
    }
}

/// Applies a patch on top of existing metadata. Aliases are unioned in order
/// of first appearance.
pub fn merge_meta(existing: Option<&BankMeta>, patch: &BankMetaPatch) -> Option<BankMeta> {
    if existing.is_none() && patch.is_empty() {
        return None;
    }

    let mut merged = existing.cloned().unwrap_or_default();
    if let Some(base_url) = &patch.base_url {
        merged.base_url = Some(base_url.clone());
    }
    if let Some(tag) = &patch.tag {
        merged.tag = Some(tag.clone());
    }
    if let Some(prebake) = &patch.prebake {
        merged.prebake = Some(prebake.clone());
    }
    if let Some(bank_prefix) = &patch.bank_prefix {
        merged.bank_prefix = Some(bank_prefix.clone());
    }
    if let Some(aliases) = &patch.bank_aliases {
        for alias in aliases {
            if !alias.is_empty() && !merged.bank_aliases.contains(alias) {
                merged.bank_aliases.push(alias.clone());
            }
        }
    }
    Some(merged)
}

/// Lowercases and collapses everything that isn't alphanumeric into single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Derives the slug a source would be registered under, if one can be found.
///
/// Remote sources use their last path segment (without query, fragment or a
/// `.json` extension). Mappings use their first non-metadata key.
pub fn derive_slug(source: &BankSource) -> Option<String> {
    let candidate = match source {
        BankSource::Remote(url) => {
            let trimmed = url.split(['?', '#']).next().unwrap_or_default();
            let segment = trimmed
                .split(['/', ':'])
                .filter(|segment| !segment.is_empty())
                .last()?;
            segment.strip_suffix(".json").unwrap_or(segment).to_string()
        }
        BankSource::Mapping(_) => source.sound_names().first()?.to_string(),
    };

    let slug = slugify(&candidate);
    (!slug.is_empty()).then_some(slug)
}

/// Normalizes a label into a bank prefix: alphanumeric words, each capitalized.
pub fn normalize_bank_prefix(input: &str) -> String {
    input
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Renders a short human readable description of where a bank comes from.
pub fn summarize_source(source: &BankSource, meta: Option<&BankMeta>) -> String {
    let mut summary = match source {
        BankSource::Remote(url) => url.clone(),
        BankSource::Mapping(map) => {
            let names = source.sound_names();
            let files: usize = map
                .iter()
                .filter(|(key, _)| !key.starts_with(super::source::META_KEY_PREFIX))
                .map(|(_, paths)| paths.file_count())
                .sum();
            let base = meta
                .and_then(|meta| meta.base_url.as_deref())
                .or_else(|| source.embedded_base());
            let sounds = match names.len() {
                1 => "1 sound".to_string(),
                n => format!("{} sounds", n),
            };
            let files = match files {
                1 => "1 file".to_string(),
                n => format!("{} files", n),
            };
            match base {
                Some(base) => format!("{}, {} from {}", sounds, files, base),
                None => format!("{}, {} (inline)", sounds, files),
            }
        }
    };

    if let Some(tag) = meta.and_then(|meta| meta.tag.as_deref()) {
        summary.push_str(&format!(" [{}]", tag));
    }
    summary
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::banks::source::SamplePaths;

    #[test]
    fn test_derive_slug_remote() {
        let slug = |s: &str| derive_slug(&BankSource::Remote(s.to_string()));
        assert_eq!(Some("b".to_string()), slug("a/b"));
        assert_eq!(Some("dirt-samples".to_string()), slug("github:tidalcycles/dirt-samples"));
        assert_eq!(
            Some("strudel".to_string()),
            slug("https://example.com/packs/strudel.json?x=1#frag")
        );
        assert_eq!(Some("my-kit".to_string()), slug("https://example.com/My Kit/"));
        assert_eq!(None, slug(""));
        assert_eq!(None, slug("///"));
    }

    #[test]
    fn test_derive_slug_mapping() {
        let mut map = BTreeMap::new();
        map.insert("_base".to_string(), SamplePaths::One("/s/".into()));
        assert_eq!(None, derive_slug(&BankSource::Mapping(map.clone())));

        map.insert("Kick_Drum".to_string(), SamplePaths::One("k.wav".into()));
        map.insert("snare".to_string(), SamplePaths::One("s.wav".into()));
        assert_eq!(
            Some("kick-drum".to_string()),
            derive_slug(&BankSource::Mapping(map))
        );
    }

    #[test]
    fn test_normalize_bank_prefix() {
        assert_eq!("DirtSamples", normalize_bank_prefix("dirt-samples"));
        assert_eq!("RolandTR909", normalize_bank_prefix("RolandTR909"));
        assert_eq!("MyKit2", normalize_bank_prefix("  my kit_2 "));
        assert_eq!("", normalize_bank_prefix("--"));
    }

    #[test]
    fn test_merge_meta_keeps_untouched_fields() {
        let existing = BankMeta {
            tag: Some("y".into()),
            bank_prefix: Some("Z".into()),
            ..Default::default()
        };
        let merged = merge_meta(
            Some(&existing),
            &BankMetaPatch {
                base_url: Some("x".into()),
                ..Default::default()
            },
        )
        .expect("merged meta");

        assert_eq!(Some("x"), merged.base_url.as_deref());
        assert_eq!(Some("y"), merged.tag.as_deref());
        assert_eq!(Some("Z"), merged.bank_prefix.as_deref());
    }

    #[test]
    fn test_merge_meta_unions_aliases() {
        let existing = BankMeta {
            bank_aliases: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let merged = merge_meta(
            Some(&existing),
            &BankMetaPatch {
                bank_aliases: Some(vec!["b".into(), "c".into(), "a".into()]),
                ..Default::default()
            },
        )
        .expect("merged meta");
        assert_eq!(vec!["a", "b", "c"], merged.bank_aliases);

        assert_eq!(None, merge_meta(None, &BankMetaPatch::default()));
    }

    #[test]
    fn test_prebake_identity() {
        let prebake = Prebake::new(|| Box::pin(async { Ok(()) }));
        let other = Prebake::new(|| Box::pin(async { Ok(()) }));
        assert_eq!(prebake, prebake.clone());
        assert_ne!(prebake, other);
    }

    #[test]
    fn test_summarize_source() {
        let remote = BankSource::Remote("github:a/b".into());
        let meta = BankMeta {
            tag: Some("drums".into()),
            ..Default::default()
        };
        assert_eq!("github:a/b", summarize_source(&remote, None));
        assert_eq!("github:a/b [drums]", summarize_source(&remote, Some(&meta)));

        let mapping: BankSource = serde_json::from_str(
            r#"{"_base": "/samples/", "bd": ["1.wav", "2.wav"], "sd": "s.wav"}"#,
        )
        .expect("valid map");
        assert_eq!(
            "2 sounds, 3 files from /samples/",
            summarize_source(&mapping, None)
        );

        let inline: BankSource = serde_json::from_str(r#"{"bd": "1.wav"}"#).expect("valid map");
        assert_eq!("1 sound, 1 file (inline)", summarize_source(&inline, None));
    }
}
