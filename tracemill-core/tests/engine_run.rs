//! End-to-end runs of the scan engine over a filesystem corpus.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracemill_core::run::ScanEngine;
use tracemill_core::source::FsTranscriptSource;
use tracemill_model::{RunStatus, Worklist, WorklistEntry};

#[path = "support/mod.rs"]
mod support;

use support::{ScriptedScanner, read_table, spec_for, test_config, write_corpus};

const TRANSCRIPTS: [&str; 5] = ["t-01", "t-02", "t-03", "t-04", "t-05"];

#[tokio::test]
async fn two_scanners_over_five_transcripts_with_one_failure() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &TRANSCRIPTS);

    let clean = ScriptedScanner::new("clean");
    let flaky = ScriptedScanner::failing_on("flaky", &["t-03"]);
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![clean.clone(), flaky.clone()],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );

    let spec = spec_for(&corpus, &output, &["clean", "flaky"]);
    let summary = engine.run(&spec, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(summary.total_errors(), 1);
    let total_scans: usize = summary.scanners.values().map(|c| c.scans).sum();
    assert_eq!(total_scans, 10);
    assert_eq!(summary.scanners["clean"].results, 5);
    assert_eq!(summary.scanners["clean"].errors, 0);
    assert_eq!(summary.scanners["flaky"].results, 4);
    assert_eq!(summary.scanners["flaky"].errors, 1);

    // The failing scanner still has a durable row per transcript; the failed
    // one carries the error payload.
    let rows = read_table(&output, "flaky");
    assert_eq!(rows.len(), 5);
    let failed: Vec<_> = rows.iter().filter(|r| r.is_error()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].transcript_id, "t-03");
    assert!(
        failed[0]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("scripted failure")
    );

    // Staging is gone after a clean finish.
    assert!(!output.join("staging").exists());
    assert!(output.join("summary.json").exists());
    assert!(output.join("manifest.json").exists());

    // The registry entry settles on the final unit total, not running.
    let registry =
        tracemill_core::registry::ActiveScanRegistry::open(scratch.path().join("registry"))
            .unwrap();
    let scans = registry.list().unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].total_scans, 10);
    assert!(!scans[0].running);
}

#[tokio::test]
async fn resume_after_everything_recorded_still_finalizes() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &["t-01", "t-02"]);

    // Simulate a run killed after recording every unit but before finalizing:
    // all rows sit in staging, no summary was ever written.
    {
        let recorder = tracemill_core::recorder::RecorderBuffer::open(&output)
            .await
            .unwrap();
        for id in ["t-01", "t-02"] {
            recorder
                .record(
                    "clean",
                    id,
                    vec![tracemill_model::ResultRecord::value("clean", id, "length", 1u64)],
                )
                .await
                .unwrap();
        }
    }
    assert!(output.join("staging").exists());
    assert!(!output.join("summary.json").exists());

    let scanner = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![scanner.clone()],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );
    let spec = spec_for(&corpus, &output, &["clean"]);
    let summary = engine.resume(&spec, CancellationToken::new()).await.unwrap();

    assert_eq!(scanner.invocations(), 0, "nothing is re-scanned");
    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(summary.scanners["clean"].scans, 2);
    assert!(output.join("summary.json").exists());
    assert!(!output.join("staging").exists(), "staging must be flushed away");
    assert_eq!(read_table(&output, "clean").len(), 2);
}

#[tokio::test]
async fn empty_corpus_creates_no_output() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    std::fs::create_dir_all(&corpus).unwrap();

    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![ScriptedScanner::new("clean")],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );
    let spec = spec_for(&corpus, &output, &["clean"]);
    let summary = engine.run(&spec, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Complete);
    assert!(summary.scanners.is_empty());
    assert!(!output.exists(), "empty run must not create the output dir");
}

#[tokio::test]
async fn rerun_skips_recorded_keys() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &TRANSCRIPTS);

    let source = Arc::new(FsTranscriptSource::new(&corpus));
    let spec = spec_for(&corpus, &output, &["clean"]);

    let first_pass = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![first_pass.clone()],
        source.clone(),
    );
    engine.run(&spec, CancellationToken::new()).await.unwrap();
    assert_eq!(first_pass.invocations(), 5);

    // A second pass over the same output plans nothing.
    let second_pass = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![second_pass.clone()],
        source.clone(),
    );
    let summary = engine.resume(&spec, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(second_pass.invocations(), 0);
}

#[tokio::test]
async fn partial_run_resumes_exactly_the_remainder() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    let ids: Vec<String> = (1..=10).map(|i| format!("t-{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    write_corpus(&corpus, &id_refs);

    let source = Arc::new(FsTranscriptSource::new(&corpus));
    let spec = spec_for(&corpus, &output, &["clean"]);

    // Simulate a run killed after six transcripts by recording them directly.
    {
        let recorder = tracemill_core::recorder::RecorderBuffer::open(&output)
            .await
            .unwrap();
        for id in &ids[..6] {
            recorder
                .record(
                    "clean",
                    id,
                    vec![tracemill_model::ResultRecord::value("clean", id, "length", 1u64)],
                )
                .await
                .unwrap();
        }
        recorder.flush().await.unwrap();
    }

    let scanner = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(test_config(scratch.path()), vec![scanner.clone()], source);
    let summary = engine.run(&spec, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(scanner.invocations(), 4, "only the remainder is re-scanned");
    assert_eq!(summary.scanners["clean"].scans, 10);
    assert_eq!(read_table(&output, "clean").len(), 10);
}

#[tokio::test]
async fn dry_run_counts_without_scanning() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &TRANSCRIPTS);

    let scanner = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![scanner.clone()],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );
    let spec = spec_for(&corpus, &output, &["clean", "other"]);

    let counts = engine.dry_run(&spec).await.unwrap();
    assert_eq!(counts["clean"], 5);
    assert_eq!(counts["other"], 5);
    assert_eq!(scanner.invocations(), 0);
    assert!(!output.exists());
}

#[tokio::test]
async fn worklist_run_targets_named_keys_only() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &TRANSCRIPTS);

    let scanner = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![scanner.clone()],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );
    let spec = spec_for(&corpus, &output, &["clean"]);

    let worklist = Worklist {
        entries: vec![WorklistEntry {
            scanner: "clean".to_string(),
            transcripts: vec!["t-02".to_string(), "t-04".to_string()],
        }],
    };
    let summary = engine
        .run_loaded_worklist(&spec, &worklist, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(scanner.invocations(), 2);
    let rows = read_table(&output, "clean");
    let mut ids: Vec<&str> = rows.iter().map(|r| r.transcript_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["t-02", "t-04"]);
}

#[tokio::test]
async fn completing_a_location_flushes_staging_and_marks_complete() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");

    // A location abandoned with rows still in staging.
    {
        let recorder = tracemill_core::recorder::RecorderBuffer::open(&output)
            .await
            .unwrap();
        recorder
            .record(
                "clean",
                "t-01",
                vec![tracemill_model::ResultRecord::value("clean", "t-01", "length", 1u64)],
            )
            .await
            .unwrap();
    }
    assert!(output.join("staging").exists());

    let summary = tracemill_core::run::complete(&output).await.unwrap();
    assert_eq!(summary.status, RunStatus::Complete);
    assert_eq!(summary.scanners["clean"].scans, 1);
    assert!(!output.join("staging").exists());
    assert_eq!(read_table(&output, "clean").len(), 1);

    let reread = tracemill_core::run::run_status(&output).await.unwrap().unwrap();
    assert_eq!(reread.status, RunStatus::Complete);
}

#[tokio::test]
async fn malformed_worklist_is_fatal_before_scanning() {
    let scratch = tempfile::tempdir().unwrap();
    let corpus = scratch.path().join("corpus");
    let output = scratch.path().join("out");
    write_corpus(&corpus, &TRANSCRIPTS);

    let path = scratch.path().join("bad.json");
    std::fs::write(&path, "{ not json at all").unwrap();

    let scanner = ScriptedScanner::new("clean");
    let engine = ScanEngine::new(
        test_config(scratch.path()),
        vec![scanner.clone()],
        Arc::new(FsTranscriptSource::new(&corpus)),
    );
    let spec = spec_for(&corpus, &output, &["clean"]);

    let err = engine
        .run_worklist(&spec, &path, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tracemill_core::error::EngineError::Worklist { .. }
    ));
    assert_eq!(scanner.invocations(), 0);
    assert!(!output.join("tables").exists());
}
