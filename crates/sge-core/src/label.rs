//! Labels: repo-qualified `(package, target)` pairs identifying units.
//!
//! String forms accepted: `pkg:target`, bare `pkg` (target defaults to the
//! last package segment or a caller-supplied shorthand), root-absolute
//! `//pkg`, and sub-repo-qualified `@name//pkg`. Labels canonicalize on
//! parse: relative packages are rebased to the root and re-attributed to
//! the owning sub-repo, and an alias mapping to the empty path is dropped.

use crate::monorepo::{normalize, Monorepo, MonorepoError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("invalid label {0:?}: {1}")]
    Invalid(String, String),
    #[error(transparent)]
    Monorepo(#[from] MonorepoError),
}

pub type Result<T> = std::result::Result<T, LabelError>;

/// A canonical unit label: `[@repo]//package:target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Sub-repo alias, absent for the top-level repo.
    pub repo: Option<String>,
    /// Forward-slash package path relative to the repo.
    pub package: String,
    pub target: String,
}

impl Label {
    /// Parse a label reference relative to `rel_to` (an absolute directory).
    ///
    /// `shorthand` overrides the default target name when the `:target`
    /// part is omitted.
    pub fn parse(
        mr: &Monorepo,
        rel_to: &Path,
        s: &str,
        shorthand: Option<&str>,
    ) -> Result<Self> {
        if s.is_empty() {
            return Err(LabelError::Invalid(s.into(), "empty label".into()));
        }
        let (pkg_part, target) = match s.rsplit_once(':') {
            Some((_, t)) if t.is_empty() => {
                return Err(LabelError::Invalid(s.into(), "empty target".into()))
            }
            Some((p, t)) => (p.to_string(), Some(t.to_string())),
            None => (s.to_string(), None),
        };

        // Rebase the package onto the monorepo root, then re-attribute to
        // the owning sub-repo so equivalent spellings compare equal.
        let root_pkg = mr.new_path(rel_to, &pkg_part)?;
        let (repo, package) = match mr.sub_repo_for(&root_pkg) {
            Some(sub) => {
                let stripped = root_pkg
                    .strip_prefix(&sub.path)
                    .map(|p| p.trim_start_matches('/'))
                    .unwrap_or("");
                (Some(sub.name.clone()), stripped.to_string())
            }
            None => (None, root_pkg),
        };

        let target = match target {
            Some(t) => t,
            None => {
                let default = package
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                match (default, shorthand) {
                    (Some(d), _) => d,
                    (None, Some(sh)) => sh.to_string(),
                    (None, None) => {
                        return Err(LabelError::Invalid(
                            s.into(),
                            "no target and no package segment to default from".into(),
                        ))
                    }
                }
            }
        };

        Ok(Self {
            repo,
            package,
            target,
        })
    }

    /// Root-relative directory of the label's package.
    pub fn package_dir(&self, mr: &Monorepo) -> Result<String> {
        match &self.repo {
            Some(name) => {
                let base = mr.sub_repo_path(name)?;
                if base.is_empty() {
                    Ok(normalize(&self.package)?)
                } else if self.package.is_empty() {
                    Ok(base.to_string())
                } else {
                    Ok(normalize(&format!("{base}/{}", self.package))?)
                }
            }
            None => Ok(self.package.clone()),
        }
    }

    /// Stable output stem for the label: `pkg/target`, used for
    /// deterministic artifact paths (`a/b/c` for `//a/b:c`).
    pub fn stable_stem(&self) -> String {
        if self.package.is_empty() {
            self.target.clone()
        } else {
            format!("{}/{}", self.package, self.target)
        }
    }

    /// KV-store-safe form: slashes replaced by colons.
    pub fn key_form(&self) -> String {
        self.to_string().replace('/', ":")
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(repo) = &self.repo {
            write!(f, "@{repo}")?;
        }
        write!(f, "//{}:{}", self.package, self.target)
    }
}

/// A target expression: a single label or a `...` subtree form expanded by
/// the build engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetExpression {
    Label(Label),
    /// Root-relative directory whose declared test units are all in scope.
    Subtree(String),
}

impl TargetExpression {
    pub fn parse(mr: &Monorepo, rel_to: &Path, s: &str) -> Result<Self> {
        if let Some(stem) = s.strip_suffix("...") {
            let stem = stem.trim_end_matches('/');
            let dir = if stem.is_empty() {
                mr.rel_path(rel_to)?
            } else {
                mr.new_path(rel_to, stem)?
            };
            return Ok(Self::Subtree(dir));
        }
        Ok(Self::Label(Label::parse(mr, rel_to, s, None)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monorepo::SubRepo;
    use tempfile::TempDir;

    fn test_monorepo() -> (TempDir, Monorepo) {
        let dir = TempDir::new().unwrap();
        let mr = Monorepo::with_sub_repos(
            dir.path(),
            vec![
                SubRepo {
                    name: "game".into(),
                    path: "game".into(),
                },
                SubRepo {
                    name: "top".into(),
                    path: String::new(),
                },
            ],
        );
        (dir, mr)
    }

    #[test]
    fn parses_absolute_label() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "//tools/fmt:fmt", None).unwrap();
        assert_eq!(l.to_string(), "//tools/fmt:fmt");
    }

    #[test]
    fn target_defaults_to_last_package_segment() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "//tools/fmt", None).unwrap();
        assert_eq!(l.target, "fmt");
    }

    #[test]
    fn shorthand_used_when_no_segment() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "//", Some("all")).unwrap();
        assert_eq!(l.target, "all");
        assert_eq!(l.to_string(), "//:all");
    }

    #[test]
    fn relative_label_rebased_to_root() {
        let (dir, mr) = test_monorepo();
        let sub = dir.path().join("libs/net");
        let l = Label::parse(&mr, &sub, "codec:codec_test", None).unwrap();
        assert_eq!(l.to_string(), "//libs/net/codec:codec_test");
    }

    #[test]
    fn sub_repo_label_canonicalizes() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "@game//maps:gen", None).unwrap();
        assert_eq!(l.repo.as_deref(), Some("game"));
        assert_eq!(l.to_string(), "@game//maps:gen");
        assert_eq!(l.package_dir(&mr).unwrap(), "game/maps");
    }

    #[test]
    fn empty_alias_is_dropped() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "@top//tools/fmt", None).unwrap();
        assert_eq!(l.repo, None);
        assert_eq!(l.to_string(), "//tools/fmt:fmt");
    }

    #[test]
    fn relative_label_inside_sub_repo_gains_alias() {
        let (dir, mr) = test_monorepo();
        let inside = dir.path().join("game/maps");
        let l = Label::parse(&mr, &inside, "gen", None).unwrap();
        assert_eq!(l.repo.as_deref(), Some("game"));
        assert_eq!(l.package, "maps/gen");
    }

    #[test]
    fn empty_target_rejected() {
        let (dir, mr) = test_monorepo();
        assert!(Label::parse(&mr, dir.path(), "//tools:", None).is_err());
    }

    #[test]
    fn stable_stem_joins_package_and_target() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "//a/b:c", None).unwrap();
        assert_eq!(l.stable_stem(), "a/b/c");
    }

    #[test]
    fn key_form_replaces_slashes() {
        let (dir, mr) = test_monorepo();
        let l = Label::parse(&mr, dir.path(), "//a/b:c", None).unwrap();
        assert_eq!(l.key_form(), "::a:b:c");
    }

    #[test]
    fn target_expression_subtree() {
        let (dir, mr) = test_monorepo();
        let e = TargetExpression::parse(&mr, dir.path(), "//libs/...").unwrap();
        assert_eq!(e, TargetExpression::Subtree("libs".into()));
        let e = TargetExpression::parse(&mr, dir.path(), "...").unwrap();
        assert_eq!(e, TargetExpression::Subtree(String::new()));
    }

    #[test]
    fn target_expression_label() {
        let (dir, mr) = test_monorepo();
        let e = TargetExpression::parse(&mr, dir.path(), "//a:b").unwrap();
        assert!(matches!(e, TargetExpression::Label(_)));
    }
}
