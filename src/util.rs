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
use std::path::{Component, Path};

/// Extracts a displayable file name from a path, returning a fallback if the name is unreadable.
pub fn filename_display(path: &Path) -> &str {
    path.file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unreadable file name")
}

/// Returns `path` relative to `root` with forward slashes, or None if it isn't
/// below `root` or isn't valid UTF-8.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<&str>>>()?;
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Clamps a tempo into the supported range. Non-finite input yields None.
pub fn clamp_bpm(bpm: f64) -> Option<f64> {
    bpm.is_finite()
        .then(|| bpm.clamp(crate::engine::MIN_BPM, crate::engine::MAX_BPM))
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_relative_slash_path() {
        let root = PathBuf::from("/a/samples");
        assert_eq!(
            Some("bd/1.wav".to_string()),
            relative_slash_path(&root, &root.join("bd").join("1.wav"))
        );
        assert_eq!(None, relative_slash_path(&root, Path::new("/elsewhere/x.wav")));
        assert_eq!(None, relative_slash_path(&root, &root));
    }

    #[test]
    fn test_clamp_bpm() {
        assert_eq!(Some(40.0), clamp_bpm(-5.0));
        assert_eq!(Some(240.0), clamp_bpm(1000.0));
        assert_eq!(Some(133.5), clamp_bpm(133.5));
        assert_eq!(None, clamp_bpm(f64::NAN));
        assert_eq!(None, clamp_bpm(f64::INFINITY));
    }
}
