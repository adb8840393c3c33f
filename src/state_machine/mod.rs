// State Machine — deterministic interpreter of committed log commands.
// `apply` is invoked exactly once per committed entry, in strictly
// increasing index order, and must be deterministic in its inputs: every
// timestamp it touches comes from `LogEntry.timestamp`, never from a
// wall-clock read.

pub mod domain;
pub mod snapshot;

use crate::types::{Command, FileChange, LogEntry, LogIndex};
use domain::{commit_hash, file_hash, Branch, Commit, FileSnapshot, Project, Repository};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of applying a single command. A failing command is recorded as
/// its own error result, but `lastApplied` still advances, since every
/// replica would fail identically on the same deterministic input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Applied(serde_json::Value),
    Rejected(String),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied(_))
    }
}

/// Observability summary returned by `get_state`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSummary {
    pub project_count: usize,
    pub repository_count: usize,
    pub last_applied_index: LogIndex,
}

pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> CommandOutcome;
    fn get_state(&self) -> StateSummary;
    fn create_snapshot(&self) -> crate::error::Result<Vec<u8>>;
    fn restore_from_snapshot(&self, blob: &[u8]) -> crate::error::Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateMachineState {
    projects: BTreeMap<String, Project>,
    repositories: BTreeMap<String, Repository>,
    last_applied_index: LogIndex,
}

/// The concrete, in-process state machine. A single `RwLock` guards all
/// domain state: one writer via `apply`, many concurrent readers via
/// `get_state`/status queries.
pub struct GitStateMachine {
    state: RwLock<StateMachineState>,
}

impl Default for GitStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl GitStateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StateMachineState::default()),
        }
    }

    fn repo_id_for(project_id: &str) -> String {
        format!("repo-{}", project_id)
    }

    fn apply_inner(
        state: &mut StateMachineState,
        command: &Command,
        timestamp: i64,
    ) -> Result<serde_json::Value, String> {
        match command {
            Command::CreateProject {
                id,
                name,
                description,
                owner_id,
            } => {
                if state.projects.contains_key(id) {
                    return Err(format!("project {} already exists", id));
                }
                let repository_id = Self::repo_id_for(id);
                let mut branches = BTreeMap::new();
                branches.insert("main".to_string(), Branch::new_empty("main"));
                let repository = Repository {
                    id: repository_id.clone(),
                    default_branch: "main".to_string(),
                    branches,
                    created_at: timestamp,
                    updated_at: timestamp,
                };
                let project = Project {
                    id: id.clone(),
                    name: name.clone(),
                    description: description.clone(),
                    owner_id: owner_id.clone(),
                    repository_id: repository_id.clone(),
                    created_at: timestamp,
                    updated_at: timestamp,
                };
                state.repositories.insert(repository_id.clone(), repository);
                state.projects.insert(id.clone(), project.clone());
                Ok(serde_json::json!({
                    "project": { "id": project.id, "name": project.name },
                    "repository": { "id": repository_id, "defaultBranch": "main" },
                }))
            }
            Command::UpdateProject {
                id,
                name,
                description,
            } => {
                let project = state
                    .projects
                    .get_mut(id)
                    .ok_or_else(|| format!("project {} not found", id))?;
                if let Some(name) = name {
                    project.name = name.clone();
                }
                if let Some(description) = description {
                    project.description = description.clone();
                }
                project.updated_at = timestamp;
                Ok(serde_json::json!({ "project": { "id": project.id } }))
            }
            Command::DeleteProject { id } => {
                let project = state
                    .projects
                    .remove(id)
                    .ok_or_else(|| format!("project {} not found", id))?;
                state.repositories.remove(&project.repository_id);
                Ok(serde_json::json!({ "deleted": id }))
            }
            Command::GitCommit {
                repository_id,
                branch_name,
                message,
                author,
                files,
            } => {
                let repo = state
                    .repositories
                    .get_mut(repository_id)
                    .ok_or_else(|| format!("repository {} not found", repository_id))?;
                let updated_at_repo = repo.updated_at;
                let _ = updated_at_repo;
                let branch = repo
                    .branch_mut(branch_name)
                    .ok_or_else(|| format!("branch {} not found", branch_name))?;
                let commit = build_commit(branch.head.clone(), message, author, timestamp, files);
                branch.head = commit.hash.clone();
                let hash = commit.hash.clone();
                branch.commits.push(commit);
                repo.updated_at = timestamp;
                Ok(serde_json::json!({ "commit": { "hash": hash, "branch": branch_name } }))
            }
            Command::GitCreateBranch {
                repository_id,
                branch_name,
                from_branch,
            } => {
                let repo = state
                    .repositories
                    .get_mut(repository_id)
                    .ok_or_else(|| format!("repository {} not found", repository_id))?;
                if repo.branches.contains_key(branch_name) {
                    return Err(format!("branch {} already exists", branch_name));
                }
                let source_name = from_branch
                    .clone()
                    .unwrap_or_else(|| repo.default_branch.clone());
                let source = repo
                    .branches
                    .get(&source_name)
                    .ok_or_else(|| format!("source branch {} not found", source_name))?;
                let new_branch = Branch {
                    name: branch_name.clone(),
                    commits: source.commits.clone(),
                    head: source.head.clone(),
                };
                repo.branches.insert(branch_name.clone(), new_branch);
                repo.updated_at = timestamp;
                Ok(serde_json::json!({ "branch": branch_name, "from": source_name }))
            }
            Command::GitMerge {
                repository_id,
                source_branch,
                target_branch,
                message,
                author,
            } => {
                let repo = state
                    .repositories
                    .get_mut(repository_id)
                    .ok_or_else(|| format!("repository {} not found", repository_id))?;
                if !repo.branches.contains_key(source_branch) {
                    return Err(format!("source branch {} not found", source_branch));
                }
                let target = repo
                    .branches
                    .get_mut(target_branch)
                    .ok_or_else(|| format!("target branch {} not found", target_branch))?;
                let parent = target.head.clone();
                let hash = commit_hash(message, author, timestamp);
                let commit = Commit {
                    hash: hash.clone(),
                    message: message.clone(),
                    author: author.clone(),
                    parent,
                    timestamp,
                    files: BTreeMap::new(),
                };
                target.head = hash.clone();
                target.commits.push(commit);
                repo.updated_at = timestamp;
                Ok(serde_json::json!({ "merge": { "hash": hash, "into": target_branch } }))
            }
            Command::CreateFile {
                repository_id,
                branch_name,
                path,
                content,
                author,
            } => Self::apply_inner(
                state,
                &desugar_file_write(
                    repository_id,
                    branch_name,
                    path,
                    Some(content.clone()),
                    author,
                    "Create",
                ),
                timestamp,
            ),
            Command::UpdateFile {
                repository_id,
                branch_name,
                path,
                content,
                author,
            } => Self::apply_inner(
                state,
                &desugar_file_write(
                    repository_id,
                    branch_name,
                    path,
                    Some(content.clone()),
                    author,
                    "Update",
                ),
                timestamp,
            ),
            Command::DeleteFile {
                repository_id,
                branch_name,
                path,
                author,
            } => Self::apply_inner(
                state,
                &desugar_file_write(repository_id, branch_name, path, None, author, "Delete"),
                timestamp,
            ),
        }
    }
}

fn desugar_file_write(
    repository_id: &str,
    branch_name: &Option<String>,
    path: &str,
    content: Option<String>,
    author: &str,
    verb: &str,
) -> Command {
    Command::GitCommit {
        repository_id: repository_id.to_string(),
        branch_name: branch_name
            .clone()
            .unwrap_or_else(|| Command::DEFAULT_BRANCH.to_string()),
        message: format!("{} {}", verb, path),
        author: author.to_string(),
        files: vec![FileChange {
            path: path.to_string(),
            content,
        }],
    }
}

fn build_commit(
    parent: String,
    message: &str,
    author: &str,
    timestamp: i64,
    files: &[FileChange],
) -> Commit {
    let hash = commit_hash(message, author, timestamp);
    let mut file_map = BTreeMap::new();
    for change in files {
        if let Some(content) = &change.content {
            let hash = file_hash(&change.path, content);
            file_map.insert(
                change.path.clone(),
                FileSnapshot {
                    path: change.path.clone(),
                    content: content.clone(),
                    hash,
                },
            );
        }
    }
    Commit {
        hash,
        message: message.to_string(),
        author: author.to_string(),
        parent,
        timestamp,
        files: file_map,
    }
}

impl StateMachine for GitStateMachine {
    fn apply(&self, entry: &LogEntry) -> CommandOutcome {
        let mut state = self.state.write();
        if entry.index <= state.last_applied_index {
            // Idempotent replay of an already-applied entry: a no-op.
            return CommandOutcome::Applied(serde_json::json!({ "noop": true }));
        }
        let result = Self::apply_inner(&mut state, &entry.command, entry.timestamp);
        state.last_applied_index = entry.index;
        match result {
            Ok(value) => CommandOutcome::Applied(value),
            Err(reason) => CommandOutcome::Rejected(reason),
        }
    }

    fn get_state(&self) -> StateSummary {
        let state = self.state.read();
        StateSummary {
            project_count: state.projects.len(),
            repository_count: state.repositories.len(),
            last_applied_index: state.last_applied_index,
        }
    }

    fn create_snapshot(&self) -> crate::error::Result<Vec<u8>> {
        let state = self.state.read();
        snapshot::encode(&state.projects, &state.repositories, state.last_applied_index)
    }

    fn restore_from_snapshot(&self, blob: &[u8]) -> crate::error::Result<()> {
        let (projects, repositories, last_applied_index) = snapshot::decode(blob)?;
        let mut state = self.state.write();
        state.projects = projects;
        state.repositories = repositories;
        state.last_applied_index = last_applied_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Command;

    fn entry(index: LogIndex, command: Command, timestamp: i64) -> LogEntry {
        LogEntry::new(index, 1, command, timestamp)
    }

    #[test]
    fn create_project_creates_repo_with_main_branch() {
        let sm = GitStateMachine::new();
        let outcome = sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        assert!(outcome.is_applied());
        let summary = sm.get_state();
        assert_eq!(summary.project_count, 1);
        assert_eq!(summary.repository_count, 1);
        assert_eq!(summary.last_applied_index, 1);
    }

    #[test]
    fn create_project_twice_is_rejected_but_advances_last_applied() {
        let sm = GitStateMachine::new();
        let cmd = || Command::CreateProject {
            id: "p1".into(),
            name: "P".into(),
            description: "".into(),
            owner_id: "u1".into(),
        };
        sm.apply(&entry(1, cmd(), 100));
        let second = sm.apply(&entry(2, cmd(), 101));
        assert!(matches!(second, CommandOutcome::Rejected(_)));
        assert_eq!(sm.get_state().last_applied_index, 2);
    }

    #[test]
    fn git_commit_chains_parent_to_prior_head() {
        let sm = GitStateMachine::new();
        sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        sm.apply(&entry(
            2,
            Command::GitCommit {
                repository_id: "repo-p1".into(),
                branch_name: "main".into(),
                message: "first".into(),
                author: "alice".into(),
                files: vec![FileChange {
                    path: "README.md".into(),
                    content: Some("hi".into()),
                }],
            },
            101,
        ));
        let second = sm.apply(&entry(
            3,
            Command::GitCommit {
                repository_id: "repo-p1".into(),
                branch_name: "main".into(),
                message: "second".into(),
                author: "alice".into(),
                files: vec![],
            },
            102,
        ));
        assert!(second.is_applied());
    }

    #[test]
    fn git_commit_fails_on_missing_branch() {
        let sm = GitStateMachine::new();
        sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        let outcome = sm.apply(&entry(
            2,
            Command::GitCommit {
                repository_id: "repo-p1".into(),
                branch_name: "does-not-exist".into(),
                message: "x".into(),
                author: "a".into(),
                files: vec![],
            },
            101,
        ));
        assert!(matches!(outcome, CommandOutcome::Rejected(_)));
    }

    #[test]
    fn create_branch_copies_source_commits() {
        let sm = GitStateMachine::new();
        sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        sm.apply(&entry(
            2,
            Command::GitCommit {
                repository_id: "repo-p1".into(),
                branch_name: "main".into(),
                message: "first".into(),
                author: "a".into(),
                files: vec![],
            },
            101,
        ));
        let outcome = sm.apply(&entry(
            3,
            Command::GitCreateBranch {
                repository_id: "repo-p1".into(),
                branch_name: "feature".into(),
                from_branch: None,
            },
            102,
        ));
        assert!(outcome.is_applied());
    }

    #[test]
    fn snapshot_round_trips_to_identical_summary() {
        let sm = GitStateMachine::new();
        sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        let before = sm.get_state();
        let blob = sm.create_snapshot().unwrap();

        let restored = GitStateMachine::new();
        restored.restore_from_snapshot(&blob).unwrap();
        let after = restored.get_state();
        assert_eq!(before.project_count, after.project_count);
        assert_eq!(before.repository_count, after.repository_count);
        assert_eq!(before.last_applied_index, after.last_applied_index);
    }

    #[test]
    fn apply_is_noop_for_already_applied_index() {
        let sm = GitStateMachine::new();
        sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        // Re-delivery of the same index must not mutate state further.
        let replay = sm.apply(&entry(
            1,
            Command::CreateProject {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            100,
        ));
        assert!(replay.is_applied());
        assert_eq!(sm.get_state().project_count, 1);
    }
}
