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
//! Builds a bootstrap sample map from a local samples directory.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::banks::BASE_KEY;
use crate::util::{filename_display, relative_slash_path};

/// File extensions treated as audio.
pub const AUDIO_EXTENSIONS: [&str; 8] = ["wav", "mp3", "ogg", "flac", "aif", "aiff", "m4a", "opus"];

/// The key explaining an empty map.
pub const NOTE_KEY: &str = "_note";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("error writing sample map: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns true if the path has an audio file extension.
pub fn is_audio_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|audio| audio.eq_ignore_ascii_case(ext))
        })
}

/// Groups slash separated relative paths by their first directory. Files at
/// the top level become a sound named after their file stem. Each group is sorted.
pub fn group_by_category<I>(paths: I) -> BTreeMap<String, Vec<String>>
where
    I: IntoIterator<Item = String>,
{
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in paths {
        let category = match path.split_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => Path::new(&path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or(&path)
                .to_string(),
        };
        if category.is_empty() || category.starts_with(crate::banks::META_KEY_PREFIX) {
            continue;
        }
        groups.entry(category).or_default().push(path);
    }
    groups.values_mut().for_each(|files| files.sort());
    groups
}

/// Recursively collects audio files below `dir`, relative to `root`. Symbolic
/// links to directories are not followed.
fn collect_audio_files(root: &Path, dir: &Path, files: &mut Vec<String>) -> Result<(), ScanError> {
    let entries = fs::read_dir(dir).map_err(|source| ScanError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ScanError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if filename_display(&path).starts_with('.') {
            continue;
        }

        let file_type = entry.file_type().map_err(|source| ScanError::Io {
            path: path.clone(),
            source,
        })?;
        if file_type.is_dir() {
            collect_audio_files(root, &path, files)?;
        } else if let Some(relative) = relative_slash_path(root, &path) {
            if is_audio_path(&relative) {
                files.push(relative);
            } else {
                debug!(path = relative, "Skipping non-audio file.");
            }
        }
    }
    Ok(())
}

/// Scans `root` and returns the JSON sample map. A missing directory or one
/// without audio files yields a placeholder map carrying a `_note`.
pub fn scan_samples_dir(root: &Path, base_url: &str) -> Result<Value, ScanError> {
    let mut files = Vec::new();
    match fs::metadata(root) {
        Ok(_) => collect_audio_files(root, root, &mut files)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(root = ?root, "Samples directory does not exist.");
        }
        Err(source) => {
            return Err(ScanError::Io {
                path: root.to_path_buf(),
                source,
            })
        }
    }

    let mut map = Map::new();
    map.insert(BASE_KEY.to_string(), Value::String(base_url.to_string()));

    if files.is_empty() {
        map.insert(
            NOTE_KEY.to_string(),
            Value::String(format!(
                "No audio files found in {}. Add files in sub-directories (one per sound) and run the scan again.",
                root.display()
            )),
        );
        return Ok(Value::Object(map));
    }

    let total = files.len();
    let groups = group_by_category(files);
    info!(
        root = ?root,
        files = total,
        sounds = groups.len(),
        "Scanned samples directory."
    );
    for (category, files) in groups {
        map.insert(
            category,
            Value::Array(files.into_iter().map(Value::String).collect()),
        );
    }
    Ok(Value::Object(map))
}

/// Scans `root` and writes the map to `out`, or returns it as a string when no
/// output path is given.
pub fn write_sample_map(root: &Path, base_url: &str, out: Option<&Path>) -> Result<String, ScanError> {
    let rendered = serde_json::to_string_pretty(&scan_samples_dir(root, base_url)?)?;
    if let Some(out) = out {
        if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ScanError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(out, format!("{}\n", rendered)).map_err(|source| ScanError::Io {
            path: out.to_path_buf(),
            source,
        })?;
    }
    Ok(rendered)
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use super::*;

    fn touch(root: &Path, relative: &str) -> Result<(), Box<dyn Error>> {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"")?;
        Ok(())
    }

    #[test]
    fn test_is_audio_path() {
        assert!(is_audio_path("a/b.wav"));
        assert!(is_audio_path("B.FLAC"));
        assert!(!is_audio_path("readme.md"));
        assert!(!is_audio_path("wav"));
    }

    #[test]
    fn test_scan_groups_by_top_level_dir() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "bd/02.wav")?;
        touch(dir.path(), "bd/01.wav")?;
        touch(dir.path(), "bd/soft/03.wav")?;
        touch(dir.path(), "sd/a.mp3")?;
        touch(dir.path(), "sd/notes.txt")?;
        touch(dir.path(), "cowbell.ogg")?;
        touch(dir.path(), ".hidden/x.wav")?;

        let map = scan_samples_dir(dir.path(), "/samples/")?;
        assert_eq!("/samples/", map["_base"]);
        assert_eq!(
            serde_json::json!(["bd/01.wav", "bd/02.wav", "bd/soft/03.wav"]),
            map["bd"]
        );
        assert_eq!(serde_json::json!(["sd/a.mp3"]), map["sd"]);
        assert_eq!(serde_json::json!(["cowbell.ogg"]), map["cowbell"]);
        assert!(map.get("_note").is_none());
        assert!(map.get(".hidden").is_none());
        Ok(())
    }

    #[test]
    fn test_scan_placeholder() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "readme.txt")?;

        let empty = scan_samples_dir(dir.path(), "/samples/")?;
        assert!(empty["_note"].is_string());
        assert_eq!(2, empty.as_object().map(|m| m.len()).unwrap_or_default());

        let missing = scan_samples_dir(&dir.path().join("missing"), "/samples/")?;
        assert!(missing["_note"].is_string());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_ignores_directory_links() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "bd/kick.wav")?;
        std::os::unix::fs::symlink(dir.path(), dir.path().join("bd/loop"))?;

        let map = scan_samples_dir(dir.path(), "/samples/")?;
        assert_eq!(serde_json::json!(["bd/kick.wav"]), map["bd"]);
        Ok(())
    }

    #[test]
    fn test_write_sample_map() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "samples/hh/1.wav")?;
        let out = dir.path().join("public/samples.json");

        write_sample_map(&dir.path().join("samples"), "/samples/", Some(&out))?;
        let written: Value = serde_json::from_str(&fs::read_to_string(out)?)?;
        assert_eq!(serde_json::json!(["hh/1.wav"]), written["hh"]);
        Ok(())
    }
}
