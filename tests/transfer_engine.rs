// tests/transfer_engine.rs

//! End-to-end engine scenarios against in-memory agent/platform stubs

mod common;

use std::path::Path;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use depot_transfer::config::ServerDetails;
use depot_transfer::progress::SilentProgress;
use depot_transfer::transfer::api::{FileOutcome, FileRef, FileStatus};
use depot_transfer::transfer::state::TransferStateManager;
use depot_transfer::{TransferEngine, TransferOptions};

use common::{
    done_response, file_item, folder_item, items, outcome_lines, statuses_of, StubAgent,
    StubPlatform,
};

const REPO: &str = "generic-local";

fn target_details() -> ServerDetails {
    ServerDetails {
        id: "target".into(),
        url: "https://target.example.com".into(),
        access_token: Some("target-token".into()),
        ..Default::default()
    }
}

fn options(dir: &Path, threads: usize) -> TransferOptions {
    TransferOptions {
        threads,
        transfer_dir: dir.to_path_buf(),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn engine(
    agent: &StubAgent,
    source: &StubPlatform,
    target: &StubPlatform,
    options: TransferOptions,
) -> TransferEngine {
    TransferEngine::new(
        Box::new(agent.clone()),
        Box::new(source.clone()),
        Box::new(target.clone()),
        &target_details(),
        options,
    )
    .with_progress(Box::new(SilentProgress))
}

/// S1: clean run, one repository, two files in the root
#[test]
fn test_clean_run_transfers_root_files() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![
            file_item(REPO, ".", "a.bin"),
            file_item(REPO, ".", "b.bin"),
        ])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    // Node detection ran on the clean start and froze the node set.
    assert_eq!(agent.state.pings.load(std::sync::atomic::Ordering::SeqCst), 50);
    let state = TransferStateManager::new(dir.path());
    assert_eq!(state.node_ids().unwrap(), vec!["node-1".to_owned()]);

    // One chunk with both files went out and was polled to completion.
    let chunks = agent.submitted_chunks();
    assert_eq!(chunks.len(), 1);
    let names: Vec<_> = chunks[0]
        .upload_candidates
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["a.bin", "b.bin"]);
    assert_eq!(chunks[0].target_auth.target_url, "https://target.example.com");
    assert_eq!(
        chunks[0].target_auth.target_token.as_deref(),
        Some("target-token")
    );

    // The property baseline was recorded before the traversal.
    assert_eq!(
        *agent.state.store_properties_calls.lock().unwrap(),
        vec![REPO.to_owned()]
    );

    // Migration completed and a diff window chained onto it.
    assert!(state.is_repo_migrated(REPO).unwrap());
    state
        .with_state(|s| {
            let repo = &s.repositories[0];
            assert_eq!(repo.name, REPO);
            assert!(repo.migration.started.is_some());
            assert!(repo.migration.ended.is_some());
            assert_eq!(repo.diffs.len(), 1);
            assert_eq!(
                repo.diffs[0].handled_range.started,
                repo.migration.ended
            );
            assert!(repo.diffs[0].completed);
            Ok(())
        })
        .unwrap();

    // The outcome log carries one Success line per file.
    let outcomes = outcome_lines(&dir.path().join(REPO).join("outcomes.jsonl"));
    assert_eq!(
        statuses_of(&outcomes),
        vec![FileStatus::Success, FileStatus::Success]
    );
}

/// S2: an empty directory is shipped as an empty-folder candidate so the
/// target mirrors the tree
#[test]
fn test_empty_folder_candidate() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        if query.contains(r#""$match":"d""#) {
            return items(vec![]);
        }
        items(vec![folder_item(REPO, ".", "d")])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let candidates: Vec<FileRef> = agent
        .submitted_chunks()
        .into_iter()
        .flat_map(|c| c.upload_candidates)
        .collect();
    assert_eq!(candidates, vec![FileRef::new(REPO, "", "d")]);
    let state = TransferStateManager::new(dir.path());
    assert!(state.is_repo_migrated(REPO).unwrap());
}

/// S3: a repository whose migration already completed is skipped without
/// a single folder listing, and the next diff window chains onto the
/// stored migration end (also covers the idempotent-skip property)
#[test]
fn test_resumption_skips_migration() {
    let dir = tempdir().unwrap();
    let migration_start = Utc.with_ymd_and_hms(2023, 4, 1, 11, 0, 0).unwrap();
    let migration_end = Utc::now() - chrono::Duration::minutes(20);

    let state = TransferStateManager::new(dir.path());
    state
        .with_state(|s| {
            s.repositories.push(depot_transfer::transfer::state::RepositoryState {
                name: REPO.to_owned(),
                migration: depot_transfer::transfer::state::PhaseStamps {
                    started: Some(migration_start),
                    ended: Some(migration_end),
                },
                diffs: Vec::new(),
            });
            Ok(())
        })
        .unwrap();

    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]);
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    // No clean start: no node detection. No migration: no folder AQL and
    // no chunk submissions.
    assert_eq!(agent.state.pings.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(
        source.state.folder_queries.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert!(agent.submitted_chunks().is_empty());

    // A ~20 minute range slices into two windows.
    assert_eq!(
        source.state.window_queries.load(std::sync::atomic::Ordering::SeqCst),
        2
    );

    state
        .with_state(|s| {
            let repo = &s.repositories[0];
            assert_eq!(repo.diffs.len(), 1);
            assert_eq!(repo.diffs[0].handled_range.started, Some(migration_end));
            assert!(repo.diffs[0].completed);
            Ok(())
        })
        .unwrap();
}

/// S5: admission pressure - ten chunks through two admission slots, each
/// taking three polling ticks to complete
#[test]
fn test_admission_pressure_bounds_in_flight_chunks() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new().with_polls_to_done(3);
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(
            (0..160)
                .map(|i| file_item(REPO, ".", &format!("f-{i:03}.bin")))
                .collect(),
        )
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let chunks = agent.submitted_chunks();
    assert_eq!(chunks.len(), 10);
    // The chunk-size bound holds for every submission.
    assert!(chunks.iter().all(|c| c.upload_candidates.len() <= 16));
    // In-flight chunks never exceeded the thread budget.
    assert!(agent.state.max_open.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    // Every token was polled to termination.
    assert_eq!(
        agent.state.completed.load(std::sync::atomic::Ordering::SeqCst),
        10
    );
    assert!(agent.state.tokens.lock().unwrap().is_empty());

    let outcomes = outcome_lines(&dir.path().join(REPO).join("outcomes.jsonl"));
    assert_eq!(outcomes.len(), 160);
}

/// S6: per-file failures are logged, never fatal, and state still
/// advances
#[test]
fn test_partial_file_failures_are_not_fatal() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new().with_outcomes(|file| {
        let status = match file.name.as_str() {
            "bad.bin" => FileStatus::Fail,
            "big.bin" => FileStatus::SkippedLargeProps,
            _ => FileStatus::Success,
        };
        FileOutcome {
            file: file.clone(),
            status,
            reason: match status {
                FileStatus::Success => None,
                _ => Some("reported by agent".into()),
            },
        }
    });
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![
            file_item(REPO, ".", "good.bin"),
            file_item(REPO, ".", "bad.bin"),
            file_item(REPO, ".", "big.bin"),
        ])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let repo_dir = dir.path().join(REPO);
    // Three migration outcomes, plus the files-diff phase of this same
    // run re-driving the recorded failure once (which fails again).
    let outcomes = outcome_lines(&repo_dir.join("outcomes.jsonl"));
    assert_eq!(outcomes.len(), 4);

    let skipped = outcome_lines(&repo_dir.join("skipped.jsonl"));
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].file.name, "big.bin");

    // The re-driven failure waits for the next run's files-diff.
    let failures = outcome_lines(&repo_dir.join("failures.jsonl"));
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].file.name, "bad.bin");

    let state = TransferStateManager::new(dir.path());
    assert!(state.is_repo_migrated(REPO).unwrap());
}

/// Synchronously completed chunks (HTTP 200, no token) still produce
/// Success outcomes and complete the migration
#[test]
fn test_synchronous_chunk_completion() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new().synchronous();
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![file_item(REPO, ".", "a.bin")])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    assert_eq!(agent.state.issued.load(std::sync::atomic::Ordering::SeqCst), 0);
    let outcomes = outcome_lines(&dir.path().join(REPO).join("outcomes.jsonl"));
    assert_eq!(statuses_of(&outcomes), vec![FileStatus::Success]);
    assert!(TransferStateManager::new(dir.path())
        .is_repo_migrated(REPO)
        .unwrap());
}

/// Nested folders are traversed and files chunked per folder
#[test]
fn test_nested_folder_traversal() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        if query.contains(r#""$match":"a/b""#) {
            return items(vec![file_item(REPO, "a/b", "deep.bin")]);
        }
        if query.contains(r#""$match":"a""#) {
            return items(vec![
                folder_item(REPO, ".", "b"),
                file_item(REPO, "a", "mid.bin"),
            ]);
        }
        items(vec![
            folder_item(REPO, ".", "a"),
            file_item(REPO, ".", "root.bin"),
        ])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let mut all: Vec<String> = agent
        .submitted_chunks()
        .into_iter()
        .flat_map(|c| c.upload_candidates)
        .map(|f| format!("{}/{}", f.path, f.name))
        .collect();
    all.sort();
    assert_eq!(all, vec!["./root.bin", "a/b/deep.bin", "a/mid.bin"]);
    assert!(TransferStateManager::new(dir.path())
        .is_repo_migrated(REPO)
        .unwrap());
}

/// A repository missing on the target is skipped with a warning; the run
/// continues and succeeds
#[test]
fn test_missing_target_repository_is_skipped() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&["present", "absent"]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        if query.contains(r#""repo":"absent""#) {
            panic!("the absent repository must not be traversed");
        }
        items(vec![file_item("present", ".", "a.bin")])
    });
    let target = StubPlatform::new(&["present"]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let state = TransferStateManager::new(dir.path());
    assert!(state.is_repo_migrated("present").unwrap());
    assert!(!state.is_repo_migrated("absent").unwrap());
}

/// Include/exclude patterns narrow the repository selection
#[test]
fn test_repository_filters() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&["libs-release", "libs-snapshot", "docker-local"]);
    let target = StubPlatform::new(&["libs-release", "libs-snapshot", "docker-local"]);

    let mut opts = options(dir.path(), 2);
    opts.include_repos = vec!["libs-*".to_owned()];
    opts.exclude_repos = vec!["*-snapshot".to_owned()];

    engine(&agent, &source, &target, opts).run().unwrap();

    let state = TransferStateManager::new(dir.path());
    assert!(state.is_repo_migrated("libs-release").unwrap());
    assert!(!state.is_repo_migrated("libs-snapshot").unwrap());
    assert!(!state.is_repo_migrated("docker-local").unwrap());
}

/// Failures recorded by one run are re-driven by the next files-diff
/// phase and then forgotten
#[test]
fn test_failure_redrive_on_next_run() {
    let dir = tempdir().unwrap();

    // First run: one file fails.
    let agent = StubAgent::new().with_outcomes(|file| FileOutcome {
        file: file.clone(),
        status: FileStatus::Fail,
        reason: Some("target unavailable".into()),
    });
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![file_item(REPO, ".", "flaky.bin")])
    });
    let target = StubPlatform::new(&[REPO]);
    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();
    assert_eq!(
        outcome_lines(&dir.path().join(REPO).join("failures.jsonl")).len(),
        1
    );

    // Second run: migration skips, the files-diff re-drives the failure
    // and the agent succeeds this time.
    let agent2 = StubAgent::new();
    let source2 = StubPlatform::new(&[REPO]);
    engine(&agent2, &source2, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let redriven: Vec<FileRef> = agent2
        .submitted_chunks()
        .into_iter()
        .flat_map(|c| c.upload_candidates)
        .collect();
    assert_eq!(redriven, vec![FileRef::new(REPO, ".", "flaky.bin")]);
    // Consumed for good.
    assert!(!dir.path().join(REPO).join("failures.jsonl").exists());
    assert!(!dir.path().join(REPO).join("failures-redrive.jsonl").exists());
}

/// The properties-diff cursor follows continuation cookies to the end
#[test]
fn test_properties_diff_cursor() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new().with_props_script(vec![
        done_response(Some("cursor-1"), 40),
        done_response(None, 2),
    ]);
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![])
    });
    let target = StubPlatform::new(&[REPO]);

    engine(&agent, &source, &target, options(dir.path(), 2))
        .run()
        .unwrap();

    let requests = agent.state.props_requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].cookie, None);
    assert_eq!(requests[1].cookie.as_deref(), Some("cursor-1"));
    assert_eq!(requests[0].repo_key, REPO);

    let state = TransferStateManager::new(dir.path());
    state
        .with_state(|s| {
            assert!(s.repositories[0].diffs[0].completed);
            assert!(s.repositories[0].diffs[0].properties_diff.ended.is_some());
            Ok(())
        })
        .unwrap();
}

/// Dry run over an already-migrated repository: the next diff range is
/// planned and searched, nothing is submitted, no window is opened
#[test]
fn test_dry_run_plans_diff_windows_without_writes() {
    let dir = tempdir().unwrap();
    let migration_end = Utc::now() - chrono::Duration::minutes(20);

    let state = TransferStateManager::new(dir.path());
    state
        .with_state(|s| {
            s.repositories.push(depot_transfer::transfer::state::RepositoryState {
                name: REPO.to_owned(),
                migration: depot_transfer::transfer::state::PhaseStamps {
                    started: Some(migration_end - chrono::Duration::hours(1)),
                    ended: Some(migration_end),
                },
                diffs: Vec::new(),
            });
            Ok(())
        })
        .unwrap();

    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]);
    let target = StubPlatform::new(&[REPO]);
    let mut opts = options(dir.path(), 2);
    opts.dry_run = true;

    engine(&agent, &source, &target, opts).run().unwrap();

    // The ~20 minute range was sliced and searched, but no chunk went out
    // and no diff window was recorded.
    assert_eq!(
        source.state.window_queries.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert!(agent.submitted_chunks().is_empty());
    state
        .view(|s| {
            assert!(s.repositories[0].diffs.is_empty());
            Ok(())
        })
        .unwrap();
}

/// Dry run: traversal happens, nothing is submitted, no state is written
#[test]
fn test_dry_run_has_no_side_effects() {
    let dir = tempdir().unwrap();
    let agent = StubAgent::new();
    let source = StubPlatform::new(&[REPO]).with_aql(|query| {
        if query.contains(r#""modified""#) {
            return items(vec![]);
        }
        items(vec![file_item(REPO, ".", "a.bin")])
    });
    let target = StubPlatform::new(&[REPO]);

    let mut opts = options(dir.path(), 2);
    opts.dry_run = true;
    engine(&agent, &source, &target, opts).run().unwrap();

    assert!(agent.submitted_chunks().is_empty());
    assert_eq!(agent.state.pings.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(
        agent.state.store_properties_calls.lock().unwrap().is_empty()
    );
    // Traversal ran, so the plan was actually computed.
    assert_eq!(
        source.state.folder_queries.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // No state file, no outcome logs.
    let state = TransferStateManager::new(dir.path());
    assert!(state.clean_start().unwrap());
    assert!(!dir.path().join(REPO).exists());
}
