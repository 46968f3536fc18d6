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
use std::fmt;

use super::ResolveError;

const SHORTHAND_PREFIX: &str = "github:";
const EXPECTED_FORMAT: &str =
    "expected github:owner/repo[@ref][/path], https://github.com/owner/repo[/tree/<ref>/<path>] or owner/repo";

/// A parsed, possibly unresolved, GitHub location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GithubReference {
    pub owner: String,
    pub repo: String,
    /// Branch, tag or commit. `None` means the default branch.
    pub git_ref: Option<String>,
    /// Path inside the repository, without leading or trailing slashes.
    pub path: String,
}

impl fmt::Display for GithubReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "github:{}/{}", self.owner, self.repo)?;
        if let Some(git_ref) = &self.git_ref {
            write!(f, "@{}", git_ref)?;
        }
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

fn invalid(input: &str, reason: &str) -> ResolveError {
    ResolveError::InvalidReference {
        input: input.to_string(),
        reason: format!("{}; {}", reason, EXPECTED_FORMAT),
    }
}

fn non_empty(segment: Option<&str>) -> Option<&str> {
    segment.filter(|segment| !segment.is_empty())
}

fn join_path<'a>(segments: impl Iterator<Item = &'a str>) -> String {
    segments
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parses any of the supported reference forms.
pub fn parse_reference(input: &str) -> Result<GithubReference, ResolveError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "reference is empty"));
    }

    if let Some(rest) = trimmed.strip_prefix(SHORTHAND_PREFIX) {
        return parse_shorthand(input, rest);
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return parse_url(input, trimmed);
    }
    parse_shorthand(input, trimmed)
}

/// Parses `owner/repo[@ref][/path...]`.
fn parse_shorthand(input: &str, rest: &str) -> Result<GithubReference, ResolveError> {
    let mut segments = rest.trim_matches('/').split('/');
    let owner = non_empty(segments.next()).ok_or_else(|| invalid(input, "missing owner"))?;
    let repo_and_ref = non_empty(segments.next()).ok_or_else(|| invalid(input, "missing repo"))?;

    let (repo, git_ref) = match repo_and_ref.split_once('@') {
        Some((repo, git_ref)) => (repo, non_empty(Some(git_ref)).map(str::to_string)),
        None => (repo_and_ref, None),
    };
    if repo.is_empty() {
        return Err(invalid(input, "missing repo"));
    }

    Ok(GithubReference {
        owner: owner.to_string(),
        repo: repo.trim_end_matches(".git").to_string(),
        git_ref,
        path: join_path(segments),
    })
}

/// Parses `https://github.com/owner/repo[/tree|blob/<ref>/<path>]`.
fn parse_url(input: &str, url: &str) -> Result<GithubReference, ResolveError> {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let (host, path) = without_query
        .split_once('/')
        .unwrap_or((without_query, ""));
    let host = host.to_ascii_lowercase();
    if host != "github.com" && host != "www.github.com" {
        return Err(invalid(input, &format!("unsupported host {}", host)));
    }

    let mut segments = path.trim_matches('/').split('/');
    let owner = non_empty(segments.next()).ok_or_else(|| invalid(input, "missing owner"))?;
    let repo = non_empty(segments.next()).ok_or_else(|| invalid(input, "missing repo"))?;

    let (git_ref, path) = match segments.next() {
        Some("tree") | Some("blob") => {
            let git_ref = non_empty(segments.next())
                .ok_or_else(|| invalid(input, "missing ref after tree/blob"))?;
            (Some(git_ref.to_string()), join_path(segments))
        }
        Some(other) if !other.is_empty() => {
            return Err(invalid(input, &format!("unsupported URL section {}", other)))
        }
        _ => (None, String::new()),
    };

    Ok(GithubReference {
        owner: owner.to_string(),
        repo: repo.trim_end_matches(".git").to_string(),
        git_ref,
        path,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn reference(owner: &str, repo: &str, git_ref: Option<&str>, path: &str) -> GithubReference {
        GithubReference {
            owner: owner.into(),
            repo: repo.into(),
            git_ref: git_ref.map(str::to_string),
            path: path.into(),
        }
    }

    #[test]
    fn test_shorthand() {
        assert_eq!(
            reference("tidalcycles", "dirt-samples", None, ""),
            parse_reference("github:tidalcycles/dirt-samples").unwrap()
        );
        assert_eq!(
            reference("a", "b", Some("v1.2"), "drums/kicks"),
            parse_reference("github:a/b@v1.2/drums/kicks/").unwrap()
        );
        assert_eq!(
            reference("a", "b", None, "x"),
            parse_reference("  a/b/x ").unwrap()
        );
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            reference("a", "b", None, ""),
            parse_reference("https://github.com/a/b.git").unwrap()
        );
        assert_eq!(
            reference("a", "b", Some("main"), "samples/bd"),
            parse_reference("https://github.com/a/b/tree/main/samples/bd").unwrap()
        );
        assert_eq!(
            reference("a", "b", Some("dev"), "strudel.json"),
            parse_reference("https://www.github.com/a/b/blob/dev/strudel.json?raw=1").unwrap()
        );
    }

    #[test]
    fn test_malformed() {
        for input in [
            "",
            "   ",
            "github:",
            "github:owner",
            "owner/",
            "github:owner/@main",
            "https://gitlab.com/a/b",
            "https://github.com/a",
            "https://github.com/a/b/tree",
            "https://github.com/a/b/issues/1",
        ] {
            match parse_reference(input) {
                Err(ResolveError::InvalidReference { reason, .. }) => {
                    assert!(reason.contains("expected github:owner/repo"), "{}", reason)
                }
                other => panic!("expected invalid reference for {:?}, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            "github:a/b@main/x/y",
            reference("a", "b", Some("main"), "x/y").to_string()
        );
    }
}
