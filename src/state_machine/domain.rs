// Domain types owned by the state machine: projects, repositories,
// branches, commits, files. Project -> Repository is acyclic; Repository
// -> Branch -> Commit forms a tree with no back-pointers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner_id: String,
    pub repository_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub default_branch: String,
    /// Ordered by insertion so the default branch is always first.
    pub branches: BTreeMap<String, Branch>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Repository {
    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn branch_mut(&mut self, name: &str) -> Option<&mut Branch> {
        self.branches.get_mut(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commits: Vec<Commit>,
    pub head: String,
}

impl Branch {
    pub fn new_empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commits: Vec::new(),
            head: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub parent: String,
    pub timestamp: i64,
    pub files: BTreeMap<String, FileSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub content: String,
    pub hash: String,
}

/// Deterministic, non-cryptographic content hash. Commit and file hashes
/// must derive only from their logical inputs (message/author/timestamp,
/// or path/content) — never from wall-clock reads inside `apply`.
pub fn derive_hash(parts: &[&str]) -> String {
    let joined = parts.join("\u{1f}");
    format!("{:08x}", crc32c::crc32c(joined.as_bytes()))
}

pub fn commit_hash(message: &str, author: &str, timestamp: i64) -> String {
    derive_hash(&[message, author, &timestamp.to_string()])
}

pub fn file_hash(path: &str, content: &str) -> String {
    derive_hash(&[path, content])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hash_is_deterministic_in_its_inputs() {
        let a = commit_hash("msg", "author", 100);
        let b = commit_hash("msg", "author", 100);
        assert_eq!(a, b);
    }

    #[test]
    fn commit_hash_changes_with_timestamp() {
        let a = commit_hash("msg", "author", 100);
        let b = commit_hash("msg", "author", 101);
        assert_ne!(a, b);
    }
}
