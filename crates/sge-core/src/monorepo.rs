//! Monorepo model: root discovery, workspace declarations, path resolution.
//!
//! The monorepo root is the closest ancestor directory holding a `WORKSPACE`
//! file. That file declares sub-repositories via `local_repository(...)`
//! entries and may chain further declaration files with `#load` lines.
//! All paths handed around the system are forward-slash strings relative to
//! the root; `@name//...` routes through a sub-repo alias and `//...` is
//! root-absolute.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Marker and workspace-declaration file at the monorepo root.
pub const WORKSPACE_FILE: &str = "WORKSPACE";

#[derive(Debug, Error)]
pub enum MonorepoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no {WORKSPACE_FILE} file found above {}", .0.display())]
    RootNotFound(PathBuf),
    #[error("unknown sub-repo: @{0}")]
    UnknownSubRepo(String),
    #[error("path {} is outside the monorepo root {}", .0.display(), .1.display())]
    OutsideRoot(PathBuf, PathBuf),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("workspace include cycle at {0}")]
    IncludeCycle(String),
}

pub type Result<T> = std::result::Result<T, MonorepoError>;

/// A sub-repository alias declared in the workspace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRepo {
    /// Alias used in `@name//...` references.
    pub name: String,
    /// Root-relative path of the sub-repo. May be empty, in which case the
    /// alias canonicalizes away.
    pub path: String,
}

/// The monorepo: a root directory plus the sub-repo alias table.
///
/// Read-only after construction; shared freely behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Monorepo {
    root: PathBuf,
    sub_repos: Vec<SubRepo>,
}

fn local_repository_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"local_repository\s*\(\s*name\s*=\s*"([^"]*)"\s*,\s*path\s*=\s*"([^"]*)"\s*\)"#)
            .unwrap()
    })
}

fn load_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^#load\s+"?([^"\s]+)"?"#).unwrap())
}

impl Monorepo {
    /// Locate the monorepo by climbing from `start` for the workspace file.
    pub fn find(start: &Path) -> Result<Self> {
        let mut dir = if start.is_dir() {
            start.to_path_buf()
        } else {
            start.parent().unwrap_or(start).to_path_buf()
        };
        loop {
            if dir.join(WORKSPACE_FILE).is_file() {
                return Self::open(&dir);
            }
            if !dir.pop() {
                return Err(MonorepoError::RootNotFound(start.to_path_buf()));
            }
        }
    }

    /// Open a monorepo whose root is already known, parsing the workspace
    /// declaration chain.
    pub fn open(root: &Path) -> Result<Self> {
        let mut sub_repos = Vec::new();
        let mut seen = HashSet::new();
        Self::scrape(root, WORKSPACE_FILE, &mut sub_repos, &mut seen)?;
        Ok(Self {
            root: root.to_path_buf(),
            sub_repos,
        })
    }

    /// Construct a monorepo with an explicit alias table. Test seam.
    pub fn with_sub_repos(root: &Path, sub_repos: Vec<SubRepo>) -> Self {
        Self {
            root: root.to_path_buf(),
            sub_repos,
        }
    }

    fn scrape(
        root: &Path,
        rel_file: &str,
        out: &mut Vec<SubRepo>,
        seen: &mut HashSet<String>,
    ) -> Result<()> {
        if !seen.insert(rel_file.to_string()) {
            return Err(MonorepoError::IncludeCycle(rel_file.to_string()));
        }
        let content = std::fs::read_to_string(root.join(rel_file))?;
        for line in content.lines() {
            if let Some(caps) = load_re().captures(line.trim()) {
                Self::scrape(root, &caps[1], out, seen)?;
                continue;
            }
            if let Some(caps) = local_repository_re().captures(line) {
                out.push(SubRepo {
                    name: caps[1].to_string(),
                    path: normalize(&caps[2])?,
                });
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sub_repos(&self) -> &[SubRepo] {
        &self.sub_repos
    }

    /// Root-relative path of a sub-repo alias.
    pub fn sub_repo_path(&self, name: &str) -> Result<&str> {
        self.sub_repos
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.path.as_str())
            .ok_or_else(|| MonorepoError::UnknownSubRepo(name.to_string()))
    }

    /// Longest-prefix sub-repo owning a root-relative path, if any.
    pub fn sub_repo_for(&self, path: &str) -> Option<&SubRepo> {
        self.sub_repos
            .iter()
            .filter(|s| {
                !s.path.is_empty()
                    && (path == s.path || path.starts_with(&format!("{}/", s.path)))
            })
            .max_by_key(|s| s.path.len())
    }

    /// Build a root-relative path from a reference string.
    ///
    /// `@name//x` routes through the alias table (unknown alias is an
    /// error), `//x` is root-absolute, anything else is relative to
    /// `rel_to` (an absolute directory under the root).
    pub fn new_path(&self, rel_to: &Path, s: &str) -> Result<String> {
        if let Some(rest) = s.strip_prefix("@") {
            let (name, tail) = rest
                .split_once("//")
                .ok_or_else(|| MonorepoError::InvalidPath(s.to_string()))?;
            let base = self.sub_repo_path(name)?;
            return if base.is_empty() {
                normalize(tail)
            } else {
                normalize(&format!("{base}/{tail}"))
            };
        }
        if let Some(rest) = s.strip_prefix("//") {
            return normalize(rest);
        }
        let dir = self.rel_path(rel_to)?;
        if dir.is_empty() {
            normalize(s)
        } else {
            normalize(&format!("{dir}/{s}"))
        }
    }

    /// Map an absolute filesystem path to its root-relative form.
    pub fn rel_path(&self, abs: &Path) -> Result<String> {
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| MonorepoError::OutsideRoot(abs.to_path_buf(), self.root.clone()))?;
        normalize(&rel.to_string_lossy())
    }

    /// Absolute filesystem path for a root-relative path.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

/// Normalize a path fragment to forward slashes, collapsing `.` segments.
/// `..` segments are rejected: monorepo paths never escape their base.
pub fn normalize(s: &str) -> Result<String> {
    let s = s.replace('\\', "/");
    let mut parts = Vec::new();
    for part in s.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(MonorepoError::InvalidPath(s.clone())),
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_workspace(dir: &Path, content: &str) {
        std::fs::write(dir.join(WORKSPACE_FILE), content).unwrap();
    }

    #[test]
    fn find_climbs_to_marker() {
        let dir = TempDir::new().unwrap();
        write_workspace(dir.path(), "");
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let mr = Monorepo::find(&nested).unwrap();
        assert_eq!(mr.root(), dir.path());
    }

    #[test]
    fn find_fails_without_marker() {
        let dir = TempDir::new().unwrap();
        let err = Monorepo::find(dir.path()).unwrap_err();
        assert!(matches!(err, MonorepoError::RootNotFound(_)));
    }

    #[test]
    fn parses_local_repositories() {
        let dir = TempDir::new().unwrap();
        write_workspace(
            dir.path(),
            r#"
local_repository(name = "game", path = "game")
local_repository(name = "top", path = "")
"#,
        );
        let mr = Monorepo::open(dir.path()).unwrap();
        assert_eq!(mr.sub_repo_path("game").unwrap(), "game");
        assert_eq!(mr.sub_repo_path("top").unwrap(), "");
        assert!(mr.sub_repo_path("nope").is_err());
    }

    #[test]
    fn follows_load_includes() {
        let dir = TempDir::new().unwrap();
        write_workspace(dir.path(), "#load \"extra.ws\"\n");
        std::fs::write(
            dir.path().join("extra.ws"),
            "local_repository(name = \"x\", path = \"sub/x\")\n",
        )
        .unwrap();
        let mr = Monorepo::open(dir.path()).unwrap();
        assert_eq!(mr.sub_repo_path("x").unwrap(), "sub/x");
    }

    #[test]
    fn include_cycle_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_workspace(dir.path(), &format!("#load \"{WORKSPACE_FILE}\"\n"));
        assert!(matches!(
            Monorepo::open(dir.path()),
            Err(MonorepoError::IncludeCycle(_))
        ));
    }

    #[test]
    fn new_path_resolves_sub_repo() {
        let dir = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(
            dir.path(),
            vec![SubRepo {
                name: "game".into(),
                path: "game".into(),
            }],
        );
        assert_eq!(mr.new_path(dir.path(), "@game//maps").unwrap(), "game/maps");
        assert_eq!(mr.new_path(dir.path(), "//tools/x").unwrap(), "tools/x");
        assert!(mr.new_path(dir.path(), "@nope//x").is_err());
    }

    #[test]
    fn new_path_relative_to_dir() {
        let dir = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(dir.path(), vec![]);
        let sub = dir.path().join("a/b");
        assert_eq!(mr.new_path(&sub, "c.txt").unwrap(), "a/b/c.txt");
    }

    #[test]
    fn sub_repo_for_picks_longest_prefix() {
        let dir = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(
            dir.path(),
            vec![
                SubRepo {
                    name: "a".into(),
                    path: "a".into(),
                },
                SubRepo {
                    name: "ab".into(),
                    path: "a/b".into(),
                },
            ],
        );
        assert_eq!(mr.sub_repo_for("a/b/c.txt").unwrap().name, "ab");
        assert_eq!(mr.sub_repo_for("a/x.txt").unwrap().name, "a");
        assert!(mr.sub_repo_for("z/x.txt").is_none());
    }

    #[test]
    fn rel_path_rejects_outside_root() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(dir.path(), vec![]);
        assert!(mr.rel_path(other.path()).is_err());
    }

    #[test]
    fn normalize_rejects_parent_segments() {
        assert!(normalize("a/../b").is_err());
        assert_eq!(normalize("a//./b/").unwrap(), "a/b");
        assert_eq!(normalize("a\\b").unwrap(), "a/b");
    }
}
