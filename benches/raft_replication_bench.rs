// Raft log append / state-machine apply micro-benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forge_raft::state_machine::{GitStateMachine, StateMachine};
use forge_raft::storage::{MemoryStore, PersistentStore};
use forge_raft::types::{Command, FileChange, LogEntry};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn bench_log_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("memory_store_append", |b| {
        let store = MemoryStore::new();
        let mut index = 0u64;
        b.iter(|| {
            index += 1;
            let entry = LogEntry::new(
                index,
                1,
                Command::DeleteProject {
                    id: format!("p{}", index),
                },
                0,
            );
            rt.block_on(store.save_log_entry(entry)).unwrap();
            black_box(index);
        });
    });
}

fn bench_truncate_from_tail(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("memory_store_truncate_tail", |b| {
        b.iter_batched(
            || {
                let store = MemoryStore::new();
                rt.block_on(async {
                    for i in 1..=1000u64 {
                        store
                            .save_log_entry(LogEntry::new(
                                i,
                                1,
                                Command::DeleteProject { id: "x".into() },
                                0,
                            ))
                            .await
                            .unwrap();
                    }
                });
                store
            },
            |store| {
                rt.block_on(store.truncate_log_from(500)).unwrap();
                black_box(&store);
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_state_machine_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine_apply");

    group.bench_function("create_project", |b| {
        let sm = GitStateMachine::new();
        let mut index = 0u64;
        b.iter(|| {
            index += 1;
            let entry = LogEntry::new(
                index,
                1,
                Command::CreateProject {
                    id: format!("p{}", index),
                    name: "P".into(),
                    description: "".into(),
                    owner_id: "u1".into(),
                },
                index as i64,
            );
            black_box(sm.apply(&entry));
        });
    });

    group.bench_with_input(
        BenchmarkId::new("git_commit", "single_file"),
        &(),
        |b, _| {
            let sm = GitStateMachine::new();
            sm.apply(&LogEntry::new(
                1,
                1,
                Command::CreateProject {
                    id: "p1".into(),
                    name: "P".into(),
                    description: "".into(),
                    owner_id: "u1".into(),
                },
                1,
            ));
            let mut index = 1u64;
            b.iter(|| {
                index += 1;
                let entry = LogEntry::new(
                    index,
                    1,
                    Command::GitCommit {
                        repository_id: "repo-p1".into(),
                        branch_name: "main".into(),
                        message: format!("commit {}", index),
                        author: "alice".into(),
                        files: vec![FileChange {
                            path: "README.md".into(),
                            content: Some("hello world".into()),
                        }],
                    },
                    index as i64,
                );
                black_box(sm.apply(&entry));
            });
        },
    );

    group.finish();
}

fn bench_snapshot_round_trip(c: &mut Criterion) {
    let sm = Arc::new(GitStateMachine::new());
    for i in 0..200u64 {
        sm.apply(&LogEntry::new(
            i + 1,
            1,
            Command::CreateProject {
                id: format!("p{}", i),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
            },
            i as i64,
        ));
    }

    c.bench_function("snapshot_create_and_restore", |b| {
        b.iter(|| {
            let blob = sm.create_snapshot().unwrap();
            let restored = GitStateMachine::new();
            restored.restore_from_snapshot(&blob).unwrap();
            black_box(restored.get_state());
        });
    });
}

criterion_group!(
    benches,
    bench_log_append,
    bench_truncate_from_tail,
    bench_state_machine_apply,
    bench_snapshot_round_trip
);
criterion_main!(benches);
