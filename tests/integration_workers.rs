//! Integration tests for multi-process runs.
//!
//! Worker processes are the `run-chain` binary built for this test run.

mod common;

use altimetry_chain::core::pipeline::{ChainResult, FileState, Orchestrator};
use altimetry_chain::error::{ChainError, WorkerError};
use altimetry_chain::events::{ChainEvent, Event, EventChannel, WorkerEvent};
use assert_fs::prelude::*;
use common::{cryotempo_config, parse_config, with_chain_settings, write_grids, Pass, CRYOTEMPO_STAGES};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

const WORKER_PROGRAM: &str = env!("CARGO_BIN_EXE_run-chain");

fn shared_config(dir: &Path) -> String {
    let stages = format!(r#""fault_injector", {CRYOTEMPO_STAGES}"#);
    let extra = format!(
        "[logging]\ndir = '{}'\n\n[shared_memory]\ndir = '{}'\n",
        dir.join("logs").display(),
        dir.join("shm").display()
    );
    with_chain_settings(
        &cryotempo_config(dir, &stages, &extra),
        "use_multi_processing = true\nmax_processes = 2\nuse_shared_memory = true",
    )
}

fn namespaces_left(shm: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(shm) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("altimetry-chain-"))
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn crashed_worker_loses_only_its_unreported_files() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let files: Vec<PathBuf> = (0..10)
        .map(|i| {
            let pass = if i == 3 { Pass::sin().inject("crash") } else { Pass::sin() };
            pass.write(dir.path(), &format!("pass_{i:02}.json"))
        })
        .collect();
    let config = parse_config(&shared_config(dir.path()));

    let (sender, receiver) = EventChannel::new();
    let result = Orchestrator::builder(config)
        .worker_program(WORKER_PROGRAM)
        .build()
        .unwrap()
        .run_with_events(files, &sender)
        .unwrap();
    drop(sender);

    assert_eq!(result.files_processed, 8);
    assert_eq!(result.errors, 2);
    assert_eq!(result.files_lost, 2);
    assert!(!result.success());
    let lost: Vec<usize> = result
        .reports_by_index()
        .into_iter()
        .filter(|r| matches!(r.state, FileState::Lost { .. }))
        .map(|r| r.index)
        .collect();
    assert_eq!(lost, vec![3, 4]);

    let exits: Vec<(usize, usize)> = receiver
        .iter()
        .filter_map(|event| match event {
            Event::Worker(WorkerEvent::Exited { worker_id, lost }) => Some((worker_id, lost)),
            _ => None,
        })
        .collect();
    assert_eq!(exits.len(), 2);
    assert!(exits.contains(&(0, 2)));
    assert!(exits.contains(&(1, 0)));

    assert!(namespaces_left(&dir.path().join("shm")).is_empty());
    dir.child("logs/workers.log").assert(predicate::path::is_file());
    dir.child("logs/worker-0.log").assert(predicate::path::missing());
    dir.child("logs/worker-1.log").assert(predicate::path::missing());
}

#[test]
fn stop_on_error_halts_every_worker() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let files: Vec<PathBuf> = (0..40)
        .map(|i| {
            let pass = if i == 2 { Pass::sin().inject("fail") } else { Pass::sin() };
            pass.write(dir.path(), &format!("pass_{i:02}.json"))
        })
        .collect();
    let mut config = parse_config(&shared_config(dir.path()));
    config.chain.stop_on_error = true;

    let (sender, receiver) = EventChannel::new();
    let result = Orchestrator::builder(config)
        .worker_program(WORKER_PROGRAM)
        .build()
        .unwrap()
        .run_with_events(files, &sender)
        .unwrap();
    drop(sender);

    assert!(result.stopped_on_error);
    assert!(!result.success());
    assert_eq!(result.errors, 1);
    assert_eq!(result.files_lost, 0);
    assert!(result.files_done() < result.files_total);
    let worker_0: Vec<usize> = result
        .reports_by_index()
        .into_iter()
        .map(|r| r.index)
        .filter(|i| *i < 20)
        .collect();
    assert_eq!(worker_0, vec![0, 1, 2]);
    assert!(receiver
        .iter()
        .any(|e| matches!(e, Event::Chain(ChainEvent::StopRequested { index: 2 }))));
    assert!(namespaces_left(&dir.path().join("shm")).is_empty());
}

#[test]
fn spawn_failure_kills_started_workers_and_frees_shared_memory() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let files: Vec<PathBuf> = (0..4)
        .map(|i| Pass::sin().write(dir.path(), &format!("pass_{i}.json")))
        .collect();
    // The second worker's log file cannot be created over a directory
    dir.child("logs/worker-1.log").create_dir_all().unwrap();
    let config = parse_config(&shared_config(dir.path()));

    let result = Orchestrator::builder(config)
        .worker_program(WORKER_PROGRAM)
        .build()
        .unwrap()
        .run(files);

    match result {
        Err(ChainError::Worker(error @ WorkerError::Aborted { .. })) => {
            assert_eq!(error.started_pids().len(), 1);
        }
        other => panic!("expected an aborted pool, got {other:?}"),
    }
    assert!(namespaces_left(&dir.path().join("shm")).is_empty());
}

#[test]
fn worker_results_match_sequential_run() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let files: Vec<PathBuf> = (0..6)
        .map(|i| {
            let pass = match i {
                1 => Pass::sin().mode("SAR"),
                4 => Pass::sin().inject("fail"),
                _ => Pass::sin(),
            };
            pass.write(dir.path(), &format!("pass_{i}.json"))
        })
        .collect();

    let parallel = Orchestrator::builder(parse_config(&shared_config(dir.path())))
        .worker_program(WORKER_PROGRAM)
        .build()
        .unwrap()
        .run(files.clone())
        .unwrap();

    let mut sequential_config = parse_config(&shared_config(dir.path()));
    sequential_config.chain.use_multi_processing = false;
    let sequential = Orchestrator::builder(sequential_config)
        .build()
        .unwrap()
        .run(files)
        .unwrap();

    assert_eq!(parallel.summary().files_processed, sequential.summary().files_processed);
    assert_eq!(parallel.files_skipped, 1);
    assert_eq!(parallel.errors, 1);
    let states = |r: &ChainResult| -> Vec<&'static str> {
        r.reports_by_index().iter().map(|r| r.state.label()).collect()
    };
    assert_eq!(states(&parallel), states(&sequential));
    assert_eq!(parallel.stage_timings[0].calls, 6);
}

#[test]
fn cli_reports_json_summary_and_failure_exit() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let l1b = dir.child("l1b");
    l1b.create_dir_all().unwrap();
    for i in 0..4 {
        let pass = if i == 2 { Pass::sin().inject("fail") } else { Pass::sin() };
        pass.write(l1b.path(), &format!("pass_{i}.json"));
    }
    let config = dir.child("chain.toml");
    config.write_str(&shared_config(dir.path())).unwrap();

    let output = Command::new(WORKER_PROGRAM)
        .arg("run")
        .arg(config.path())
        .arg("--dir")
        .arg(l1b.path())
        .args(["-m", "--max-processes", "2", "--output", "json", "--quiet"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(predicate::str::contains("\"error_count\": 1").eval(&stdout));
    assert!(predicate::str::contains("\"files_processed\": 3").eval(&stdout));
    assert!(predicate::str::contains("\"success\": false").eval(&stdout));
    dir.child("logs/workers.log").assert(predicate::path::exists());
}

#[test]
fn cli_replays_worker_logs_without_log_dir() {
    let dir = assert_fs::TempDir::new().unwrap();
    write_grids(dir.path());
    let l1b = dir.child("l1b");
    l1b.create_dir_all().unwrap();
    for i in 0..4 {
        Pass::sin().write(l1b.path(), &format!("pass_{i}.json"));
    }
    let config = dir.child("chain.toml");
    config
        .write_str(&cryotempo_config(dir.path(), CRYOTEMPO_STAGES, ""))
        .unwrap();

    let output = Command::new(WORKER_PROGRAM)
        .arg("run")
        .arg(config.path())
        .arg("--dir")
        .arg(l1b.path())
        .args(["-m", "--max-processes", "2", "--output", "json"])
        .env("RUST_LOG", "info")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(predicate::str::contains("worker{id=0}").eval(&stderr));
    assert!(predicate::str::contains("worker{id=1}").eval(&stderr));
    dir.child("logs").assert(predicate::path::missing());
}

#[test]
fn cli_lists_builtin_stages() {
    let output = Command::new(WORKER_PROGRAM)
        .args(["stages", "--output", "json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for stage in ["identify_file", "surface_type", "fault_injector"] {
        assert!(stdout.contains(stage), "missing {stage}");
    }
}
