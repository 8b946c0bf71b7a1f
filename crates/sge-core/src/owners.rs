//! Owner coverage: a read-only predicate over OWNERS files.
//!
//! Ownership is inherited: every OWNERS file from a changed file's
//! directory up to the monorepo root applies. A file is covered when any
//! reviewer identity appears in that collected set.

use crate::monorepo::Monorepo;
use std::collections::HashSet;

pub const OWNERS_FILE: &str = "OWNERS";

/// Collect every owner identity that applies to a root-relative file,
/// climbing from its directory to the root inclusive. Blank lines and
/// `#` comments are skipped; unreadable files are treated as absent.
pub fn owners_for(mr: &Monorepo, rel_file: &str) -> HashSet<String> {
    let mut owners = HashSet::new();
    let mut dir = match rel_file.rsplit_once('/') {
        Some((d, _)) => d.to_string(),
        None => String::new(),
    };
    loop {
        let candidate = mr.resolve(&dir).join(OWNERS_FILE);
        if let Ok(content) = std::fs::read_to_string(&candidate) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                owners.insert(line.to_string());
            }
        }
        if dir.is_empty() {
            break;
        }
        dir = match dir.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
    }
    owners
}

/// Whether a single file is covered by any of the given reviewers.
pub fn is_covered(mr: &Monorepo, reviewers: &[String], rel_file: &str) -> bool {
    let owners = owners_for(mr, rel_file);
    reviewers.iter().any(|r| owners.contains(r))
}

/// Conjunction over files: every changed file must be covered.
/// An empty file list is covered.
pub fn has_coverage(mr: &Monorepo, reviewers: &[String], rel_files: &[String]) -> bool {
    rel_files.iter().all(|f| is_covered(mr, reviewers, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Monorepo) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(OWNERS_FILE), "root@x\n").unwrap();
        std::fs::create_dir_all(dir.path().join("foo")).unwrap();
        std::fs::write(dir.path().join("foo").join(OWNERS_FILE), "foo@x\n").unwrap();
        let mr = Monorepo::with_sub_repos(dir.path(), vec![]);
        (dir, mr)
    }

    #[test]
    fn empty_file_list_is_covered() {
        let (_dir, mr) = setup();
        assert!(has_coverage(&mr, &["anyone@x".to_string()], &[]));
    }

    #[test]
    fn root_owner_covers_nested_file() {
        let (_dir, mr) = setup();
        assert!(has_coverage(
            &mr,
            &["root@x".to_string()],
            &["foo/f.txt".to_string()]
        ));
    }

    #[test]
    fn direct_owner_covers_nested_file() {
        let (_dir, mr) = setup();
        assert!(has_coverage(
            &mr,
            &["foo@x".to_string()],
            &["foo/f.txt".to_string()]
        ));
    }

    #[test]
    fn stranger_does_not_cover() {
        let (_dir, mr) = setup();
        assert!(!has_coverage(
            &mr,
            &["someone@x".to_string()],
            &["foo/f.txt".to_string()]
        ));
    }

    #[test]
    fn nested_owner_does_not_cover_sibling() {
        let (_dir, mr) = setup();
        assert!(!has_coverage(
            &mr,
            &["foo@x".to_string()],
            &["bar/f.txt".to_string()]
        ));
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(OWNERS_FILE), "# team\n\nalice@x\n").unwrap();
        let mr = Monorepo::with_sub_repos(dir.path(), vec![]);
        let owners = owners_for(&mr, "f.txt");
        assert_eq!(owners.len(), 1);
        assert!(owners.contains("alice@x"));
    }
}
