//! Unit registry: cached per-directory catalogs plus the repo-wide walk.

use crate::label::Label;
use crate::monorepo::Monorepo;
use crate::units::{Unit, UnitCatalog, UnitError, UNIT_FILE, UNIT_FILE_EXT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error reading {}: {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("{}: {source}", file.display())]
    Catalog {
        file: PathBuf,
        source: UnitError,
    },
    #[error("no unit declaration in {0}")]
    NoCatalog(String),
    #[error("unknown unit {0}")]
    UnknownUnit(String),
    #[error(transparent)]
    Label(#[from] crate::label::LabelError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Directories never descended into during the repo-wide walk.
const SKIP_DIRS: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules"];

fn declaration_file(dir: &Path) -> Option<PathBuf> {
    for name in [UNIT_FILE, UNIT_FILE_EXT] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Caches parsed unit catalogs per directory. Lookup is by root-relative
/// directory and unit name; a repo-wide walk enumerates every declaring
/// directory for the post-submit controller and auto-publisher.
#[derive(Debug)]
pub struct UnitRegistry {
    mr: Arc<Monorepo>,
    cache: Mutex<HashMap<String, Option<Arc<UnitCatalog>>>>,
}

impl UnitRegistry {
    pub fn new(mr: Arc<Monorepo>) -> Self {
        Self {
            mr,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn monorepo(&self) -> &Arc<Monorepo> {
        &self.mr
    }

    /// The catalog declared by a root-relative directory, if any.
    /// Parsed once; later lookups are cache hits (including negative ones).
    pub fn catalog(&self, dir: &str) -> Result<Option<Arc<UnitCatalog>>> {
        if let Some(cached) = self.cache.lock().unwrap().get(dir) {
            return Ok(cached.clone());
        }
        let parsed = match declaration_file(&self.mr.resolve(dir)) {
            Some(file) => {
                let content = std::fs::read_to_string(&file)
                    .map_err(|e| RegistryError::Io(file.clone(), e))?;
                let catalog = UnitCatalog::parse(dir, &content)
                    .map_err(|source| RegistryError::Catalog { file, source })?;
                Some(Arc::new(catalog))
            }
            None => None,
        };
        self.cache
            .lock()
            .unwrap()
            .insert(dir.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Resolve a label to its declared unit.
    pub fn unit(&self, label: &Label) -> Result<Unit> {
        let dir = label.package_dir(&self.mr)?;
        let catalog = self
            .catalog(&dir)?
            .ok_or_else(|| RegistryError::NoCatalog(dir.clone()))?;
        catalog
            .get(&label.target)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownUnit(label.to_string()))
    }

    /// Enumerate every root-relative directory holding a declaration file,
    /// starting from `from` (empty = whole repo). Sorted for determinism.
    pub fn walk(&self, from: &str) -> Result<Vec<String>> {
        let start = self.mr.resolve(from);
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let walker = WalkDir::new(&start).into_iter().filter_entry(|e| {
            e.file_name()
                .to_str()
                .map_or(true, |n| !SKIP_DIRS.contains(&n))
        });
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if declaration_file(entry.path()).is_some() {
                if let Ok(rel) = self.mr.rel_path(entry.path()) {
                    dirs.push(rel);
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_with(files: &[(&str, &str)]) -> (TempDir, UnitRegistry) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let mr = Arc::new(Monorepo::with_sub_repos(dir.path(), vec![]));
        (dir, UnitRegistry::new(mr))
    }

    #[test]
    fn lookup_by_label() {
        let (dir, reg) = registry_with(&[(
            "tools/fmt/BUILDUNIT",
            "build_unit { name: \"fmt\" bin: \"//tools/fmt/cmd\" }",
        )]);
        let mr = Arc::clone(reg.monorepo());
        let label = Label::parse(&mr, dir.path(), "//tools/fmt:fmt", None).unwrap();
        let unit = reg.unit(&label).unwrap();
        assert_eq!(unit.name(), "fmt");
        assert_eq!(unit.kind(), "build_unit");
    }

    #[test]
    fn missing_catalog_and_unknown_unit() {
        let (dir, reg) = registry_with(&[(
            "tools/fmt/BUILDUNIT",
            "build_unit { name: \"fmt\" bin: \"//tools/fmt/cmd\" }",
        )]);
        let mr = Arc::clone(reg.monorepo());
        let missing = Label::parse(&mr, dir.path(), "//nowhere:x", None).unwrap();
        assert!(matches!(reg.unit(&missing), Err(RegistryError::NoCatalog(_))));
        let unknown = Label::parse(&mr, dir.path(), "//tools/fmt:nope", None).unwrap();
        assert!(matches!(
            reg.unit(&unknown),
            Err(RegistryError::UnknownUnit(_))
        ));
    }

    #[test]
    fn catalog_is_cached() {
        let (dir, reg) = registry_with(&[(
            "a/BUILDUNIT",
            "build_unit { name: \"x\" bin: \"//a/x\" }",
        )]);
        let first = reg.catalog("a").unwrap().unwrap();
        // Mutate on disk; the cache must keep serving the parsed copy.
        std::fs::write(dir.path().join("a/BUILDUNIT"), "").unwrap();
        let second = reg.catalog("a").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn walk_finds_declaring_directories() {
        let (_dir, reg) = registry_with(&[
            ("a/BUILDUNIT", "build_unit { name: \"x\" bin: \"//a/x\" }"),
            (
                "a/b/BUILDUNIT.textpb",
                "build_unit { name: \"y\" bin: \"//a/b/y\" }",
            ),
            ("c/README.md", "no units here"),
            (
                ".git/BUILDUNIT",
                "build_unit { name: \"z\" bin: \"//z\" }",
            ),
        ]);
        assert_eq!(reg.walk("").unwrap(), vec!["a".to_string(), "a/b".to_string()]);
        assert_eq!(reg.walk("a/b").unwrap(), vec!["a/b".to_string()]);
        assert!(reg.walk("missing").unwrap().is_empty());
    }
}
