//! Policy-file locator: find every policy that could apply to a set of
//! changed paths.
//!
//! One worker fans out per changed path and climbs its directory chain to
//! the monorepo root. Workers share a visited set so each directory's
//! filesystem probe runs at most once, no matter how many changed files
//! live under it.

use sge_core::policy::PolicyError;
use sge_core::{Monorepo, PresubmitPolicy};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("locator worker panicked")]
    Join,
}

pub type Result<T> = std::result::Result<T, LocatorError>;

/// Directory chain from a root-relative file up to the root, inclusive.
fn dir_chain(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut dir = match path.rsplit_once('/') {
        Some((d, _)) => d.to_string(),
        None => String::new(),
    };
    loop {
        dirs.push(dir.clone());
        if dir.is_empty() {
            break;
        }
        dir = match dir.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
    }
    dirs
}

/// Locate every policy file applicable to the changed paths. Results come
/// back sorted by directory for deterministic downstream ordering.
pub async fn locate_policies(
    mr: &Arc<Monorepo>,
    paths: &[String],
) -> Result<Vec<PresubmitPolicy>> {
    let visited: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let found: Arc<Mutex<Vec<PresubmitPolicy>>> = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for path in paths {
        let mr = Arc::clone(mr);
        let visited = Arc::clone(&visited);
        let found = Arc::clone(&found);
        let path = path.clone();
        workers.push(tokio::spawn(async move {
            for dir in dir_chain(&path) {
                // At-most-once probe per directory across all workers.
                if !visited.lock().unwrap().insert(dir.clone()) {
                    continue;
                }
                if let Some(policy) = PresubmitPolicy::load(&mr, &dir)? {
                    found.lock().unwrap().push(policy);
                }
            }
            Ok::<(), PolicyError>(())
        }));
    }
    for worker in workers {
        worker.await.map_err(|_| LocatorError::Join)??;
    }

    let mut policies = std::mem::take(&mut *found.lock().unwrap());
    policies.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok(policies)
}

/// How many directories the last locate probed. Test-visible counter
/// support lives in the visited set itself; this helper recomputes the
/// unique directory count for a path set.
pub fn unique_dirs(paths: &[String]) -> usize {
    let mut dirs = HashSet::new();
    for path in paths {
        for dir in dir_chain(path) {
            dirs.insert(dir);
        }
    }
    dirs.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(files: &[(&str, &str)]) -> (TempDir, Arc<Monorepo>) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let mr = Arc::new(Monorepo::with_sub_repos(dir.path(), vec![]));
        (dir, mr)
    }

    #[test]
    fn dir_chain_climbs_to_root() {
        assert_eq!(dir_chain("a/b/c.txt"), vec!["a/b", "a", ""]);
        assert_eq!(dir_chain("top.txt"), vec![""]);
    }

    #[tokio::test]
    async fn finds_policies_along_all_chains() {
        let (_dir, mr) = repo(&[
            ("PRESUBMIT", "presubmit { check: \"root_check\" }"),
            ("a/PRESUBMIT", "presubmit { check: \"a_check\" }"),
            ("a/b/keep.rs", ""),
            ("c/PRESUBMIT.textpb", "presubmit { check: \"c_check\" }"),
        ]);
        let policies = locate_policies(
            &mr,
            &["a/b/keep.rs".to_string(), "c/file.rs".to_string()],
        )
        .await
        .unwrap();
        let dirs: Vec<&str> = policies.iter().map(|p| p.dir.as_str()).collect();
        assert_eq!(dirs, vec!["", "a", "c"]);
    }

    #[tokio::test]
    async fn shared_directories_probe_once() {
        let (_dir, mr) = repo(&[("a/PRESUBMIT", "presubmit { check: \"x\" }")]);
        // Both files share a/ and the root; the policy must appear once.
        let policies = locate_policies(
            &mr,
            &["a/one.rs".to_string(), "a/two.rs".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(unique_dirs(&["a/one.rs".into(), "a/two.rs".into()]), 2);
    }

    #[tokio::test]
    async fn no_policies_is_empty() {
        let (_dir, mr) = repo(&[("a/file.rs", "")]);
        let policies = locate_policies(&mr, &["a/file.rs".to_string()]).await.unwrap();
        assert!(policies.is_empty());
    }

    #[tokio::test]
    async fn malformed_policy_fails_the_locate() {
        let (_dir, mr) = repo(&[("a/PRESUBMIT", "presubmit { check: \"x\" ")]);
        assert!(locate_policies(&mr, &["a/file.rs".to_string()])
            .await
            .is_err());
    }
}
