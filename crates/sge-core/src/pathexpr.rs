//! Path expressions: the matcher every component uses to decide which
//! files are in scope.
//!
//! An expression is a normalized root-relative path whose final segment is
//! either a glob pattern or begins with the recursive-suffix sentinel
//! `...`. `d/...` matches everything under `d/`; `d/....txt` matches any
//! file under `d/` whose basename ends in `.txt`. Glob segments (`*`, `?`,
//! `[...]`) match within one segment; `**` spans directory segments.
//!
//! Expression sets are ordered include/exclude lists with last-hit
//! semantics; the hit index is part of the contract so callers can trace
//! which entry decided a path.

use crate::monorepo::{normalize, Monorepo, MonorepoError};
use globset::{GlobBuilder, GlobMatcher};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PathExprError {
    #[error("invalid pattern {0:?}: {1}")]
    BadPattern(String, String),
    #[error(transparent)]
    Monorepo(#[from] MonorepoError),
    #[error("io error walking {0}: {1}")]
    Walk(String, String),
}

pub type Result<T> = std::result::Result<T, PathExprError>;

#[derive(Debug, Clone)]
enum ExprKind {
    /// `base/...` — the whole subtree.
    Recursive,
    /// `base/....<suffix>` — files in the subtree whose basename ends in
    /// the suffix.
    RecursiveSuffix(String),
    /// Final segment is a glob; the matcher covers the full expression.
    Glob(GlobMatcher),
}

/// A single compiled path expression.
#[derive(Debug, Clone)]
pub struct PathExpression {
    raw: String,
    /// Longest wildcard-free directory prefix; the walk anchor.
    base: String,
    kind: ExprKind,
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

impl PathExpression {
    /// Compile a root-relative expression. Fails fast on malformed glob
    /// syntax (unbalanced brackets, bad classes).
    pub fn compile(expr: &str) -> Result<Self> {
        let raw = normalize(expr)?;
        if raw.is_empty() {
            return Err(PathExprError::BadPattern(
                expr.to_string(),
                "empty expression".to_string(),
            ));
        }
        let (stem, last) = match raw.rsplit_once('/') {
            Some((s, l)) => (s.to_string(), l.to_string()),
            None => (String::new(), raw.clone()),
        };

        if let Some(suffix) = last.strip_prefix("...") {
            let kind = if suffix.is_empty() {
                ExprKind::Recursive
            } else {
                ExprKind::RecursiveSuffix(suffix.to_string())
            };
            if has_glob_meta(&stem) {
                return Err(PathExprError::BadPattern(
                    expr.to_string(),
                    "glob segments before a ... sentinel are not supported".to_string(),
                ));
            }
            return Ok(Self {
                raw,
                base: stem,
                kind,
            });
        }

        // Glob form. The base is every leading segment free of metacharacters.
        let mut base_segments = Vec::new();
        for seg in raw.split('/') {
            if has_glob_meta(seg) {
                break;
            }
            base_segments.push(seg);
        }
        // The final segment is never part of the base, even when literal.
        let segment_count = raw.split('/').count();
        base_segments.truncate(segment_count.saturating_sub(1));
        let base = base_segments.join("/");

        let matcher = GlobBuilder::new(&raw)
            .literal_separator(true)
            .build()
            .map_err(|e| PathExprError::BadPattern(expr.to_string(), e.to_string()))?
            .compile_matcher();
        Ok(Self {
            raw,
            base,
            kind: ExprKind::Glob(matcher),
        })
    }

    /// Compile an expression reference through the monorepo model:
    /// `@repo//` and `//` prefixes resolve exactly as paths do, and an
    /// unknown alias is a construction error.
    pub fn new(mr: &Monorepo, rel_to: &Path, expr: &str) -> Result<Self> {
        let resolved = mr.new_path(rel_to, expr)?;
        Self::compile(&resolved)
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The wildcard-free directory the expression is anchored at.
    pub fn base(&self) -> &str {
        &self.base
    }

    fn under_base(&self, path: &str) -> bool {
        if self.base.is_empty() {
            return true;
        }
        path.strip_prefix(&self.base)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Whether a root-relative path matches.
    pub fn matches(&self, path: &str) -> bool {
        match &self.kind {
            ExprKind::Recursive => self.under_base(path),
            ExprKind::RecursiveSuffix(suffix) => {
                if !self.under_base(path) {
                    return false;
                }
                let basename = path.rsplit('/').next().unwrap_or(path);
                basename.ends_with(suffix.as_str())
            }
            ExprKind::Glob(matcher) => {
                if !self.under_base(path) {
                    return false;
                }
                matcher.is_match(path)
            }
        }
    }

    /// Enumerate matching files on disk, walking from the expression's
    /// base under the monorepo root. Paths come back root-relative and
    /// sorted. A missing base yields the empty set.
    pub fn expand_files(&self, root: &Path) -> Result<Vec<String>> {
        let anchor = if self.base.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.base)
        };
        if !anchor.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&anchor) {
            let entry = entry
                .map_err(|e| PathExprError::Walk(self.base.clone(), e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| PathExprError::Walk(self.base.clone(), e.to_string()))?;
            let rel = normalize(&rel.to_string_lossy())?;
            if self.matches(&rel) {
                out.push(rel);
            }
        }
        out.sort();
        Ok(out)
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One include or exclude entry of an expression set.
#[derive(Debug, Clone)]
pub struct ExpressionEntry {
    pub include: bool,
    pub expr: PathExpression,
}

/// An ordered include/exclude expression list with last-hit semantics.
#[derive(Debug, Clone, Default)]
pub struct ExpressionSet {
    entries: Vec<ExpressionEntry>,
}

impl ExpressionSet {
    /// Compile a set from raw specs; a leading `-` marks an exclude.
    pub fn compile(specs: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let (include, body) = match spec.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, spec.as_str()),
            };
            entries.push(ExpressionEntry {
                include,
                expr: PathExpression::compile(body)?,
            });
        }
        Ok(Self { entries })
    }

    /// Compile through the monorepo model, resolving each entry relative
    /// to `rel_to`.
    pub fn new(mr: &Monorepo, rel_to: &Path, specs: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let (include, body) = match spec.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, spec.as_str()),
            };
            entries.push(ExpressionEntry {
                include,
                expr: PathExpression::new(mr, rel_to, body)?,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ExpressionEntry] {
        &self.entries
    }

    /// Match with provenance: the polarity of the last hitting entry plus
    /// its index. No hit at all is a no-match.
    pub fn matches(&self, path: &str) -> (bool, Option<usize>) {
        let mut hit = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.expr.matches(path) {
                hit = Some((entry.include, i));
            }
        }
        match hit {
            Some((include, i)) => (include, Some(i)),
            None => (false, None),
        }
    }
}

/// A `"src dst"` replacement pair: paths matching the source expression
/// are rebased into the destination subtree; non-matching paths drop.
#[derive(Debug, Clone)]
pub struct ReplacementExpression {
    src: PathExpression,
    dst_base: String,
}

impl ReplacementExpression {
    /// Parse a space-separated `src dst` pair, e.g. `"foo/... bar/..."`.
    pub fn compile(pair: &str) -> Result<Self> {
        let mut parts = pair.split_whitespace();
        let (src, dst) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(d), None) => (s, d),
            _ => {
                return Err(PathExprError::BadPattern(
                    pair.to_string(),
                    "expected exactly two expressions".to_string(),
                ))
            }
        };
        let src = PathExpression::compile(src)?;
        let dst = PathExpression::compile(dst)?;
        Ok(Self {
            dst_base: dst.base().to_string(),
            src,
        })
    }

    /// Map a root-relative path through the replacement, or None when the
    /// source expression does not accept it.
    pub fn map(&self, path: &str) -> Option<String> {
        if !self.src.matches(path) {
            return None;
        }
        let rest = if self.src.base().is_empty() {
            path
        } else {
            path.strip_prefix(self.src.base())?.trim_start_matches('/')
        };
        if self.dst_base.is_empty() {
            Some(rest.to_string())
        } else {
            Some(format!("{}/{rest}", self.dst_base))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn recursive_matches_subtree() {
        let e = PathExpression::compile("d/...").unwrap();
        assert!(e.matches("d/x.txt"));
        assert!(e.matches("d/a/b/y.bin"));
        assert!(!e.matches("dd/x.txt"));
        assert!(!e.matches("other/x.txt"));
    }

    #[test]
    fn recursive_suffix_checks_basename() {
        let e = PathExpression::compile("d/....txt").unwrap();
        assert!(e.matches("d/x.txt"));
        assert!(e.matches("d/a/deep/y.txt"));
        assert!(!e.matches("d/x.wav"));
        assert!(!e.matches("e/x.txt"));
    }

    #[test]
    fn glob_matches_one_segment() {
        let e = PathExpression::compile("a/b/*.txt").unwrap();
        assert!(e.matches("a/b/x.txt"));
        assert!(!e.matches("a/b/c/x.txt"));
        assert!(!e.matches("a/x.txt"));
    }

    #[test]
    fn double_star_spans_directories() {
        let e = PathExpression::compile("a/**/*.txt").unwrap();
        assert!(e.matches("a/b/x.txt"));
        assert!(e.matches("a/b/c/x.txt"));
        assert!(!e.matches("b/x.txt"));
    }

    #[test]
    fn question_and_class_globs() {
        let e = PathExpression::compile("a/file?.rs").unwrap();
        assert!(e.matches("a/file1.rs"));
        assert!(!e.matches("a/file10.rs"));
        let e = PathExpression::compile("a/[xy].rs").unwrap();
        assert!(e.matches("a/x.rs"));
        assert!(!e.matches("a/z.rs"));
    }

    #[test]
    fn unbalanced_bracket_fails_at_construction() {
        assert!(PathExpression::compile("a/[bad").is_err());
    }

    #[test]
    fn expression_set_last_hit_wins() {
        let set = ExpressionSet::compile(&[
            "d/...".to_string(),
            "-d/gen/...".to_string(),
            "d/gen/keep.txt".to_string(),
        ])
        .unwrap();
        assert_eq!(set.matches("d/x.txt"), (true, Some(0)));
        assert_eq!(set.matches("d/gen/x.txt"), (false, Some(1)));
        assert_eq!(set.matches("d/gen/keep.txt"), (true, Some(2)));
        assert_eq!(set.matches("elsewhere/x.txt"), (false, None));
    }

    #[test]
    fn exclude_only_set_never_includes() {
        let set = ExpressionSet::compile(&["-d/...".to_string()]).unwrap();
        assert_eq!(set.matches("d/x.txt"), (false, Some(0)));
        assert_eq!(set.matches("e/x.txt"), (false, None));
    }

    #[test]
    fn replacement_maps_into_destination() {
        let r = ReplacementExpression::compile("foo/... bar/...").unwrap();
        assert_eq!(r.map("foo/foo1.txt").as_deref(), Some("bar/foo1.txt"));
        assert_eq!(r.map("foo/sub/foo2.txt").as_deref(), Some("bar/sub/foo2.txt"));
        assert_eq!(r.map("baz/foo1.txt"), None);
    }

    #[test]
    fn replacement_with_suffix_drops_non_matching() {
        let r = ReplacementExpression::compile("foo/....txt bar/...").unwrap();
        assert_eq!(r.map("foo/foo.txt").as_deref(), Some("bar/foo.txt"));
        assert_eq!(r.map("foo/foo.wav"), None);
    }

    #[test]
    fn expand_files_walks_from_base() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/a.txt"), "").unwrap();
        std::fs::write(dir.path().join("d/sub/b.txt"), "").unwrap();
        std::fs::write(dir.path().join("d/sub/c.wav"), "").unwrap();
        std::fs::write(dir.path().join("top.txt"), "").unwrap();

        let e = PathExpression::compile("d/....txt").unwrap();
        let files = e.expand_files(dir.path()).unwrap();
        assert_eq!(files, vec!["d/a.txt".to_string(), "d/sub/b.txt".to_string()]);
    }

    #[test]
    fn expand_files_missing_base_is_empty() {
        let dir = TempDir::new().unwrap();
        let e = PathExpression::compile("nope/...").unwrap();
        assert!(e.expand_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn unknown_alias_fails_at_construction() {
        let dir = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(dir.path(), vec![]);
        assert!(PathExpression::new(&mr, dir.path(), "@nope//x/...").is_err());
    }
}
