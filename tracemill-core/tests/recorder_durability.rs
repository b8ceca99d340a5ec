//! Durability and idempotency behavior of the result recorder.

use std::collections::HashSet;

use tracemill_core::recorder::RecorderBuffer;
use tracemill_model::ResultRecord;

#[path = "support/mod.rs"]
mod support;

use support::read_table;

fn row(scanner: &str, transcript: &str) -> ResultRecord {
    ResultRecord::value(scanner, transcript, "length", 7u64)
}

#[tokio::test]
async fn recording_a_key_twice_keeps_the_first() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");
    let recorder = RecorderBuffer::open(&output).await.unwrap();

    recorder
        .record("s", "t-01", vec![row("s", "t-01")])
        .await
        .unwrap();
    recorder
        .record(
            "s",
            "t-01",
            vec![ResultRecord::value("s", "t-01", "length", 99u64)],
        )
        .await
        .unwrap();
    recorder.flush().await.unwrap();

    let rows = read_table(&output, "s");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[0].value.as_u64(), Some(7));
}

#[tokio::test]
async fn recorded_key_is_visible_immediately() {
    let scratch = tempfile::tempdir().unwrap();
    let recorder = RecorderBuffer::open(scratch.path().join("out")).await.unwrap();

    assert!(!recorder.is_recorded("t-01", "s").await);
    recorder
        .record("s", "t-01", vec![row("s", "t-01")])
        .await
        .unwrap();
    assert!(
        recorder.is_recorded("t-01", "s").await,
        "no read-after-write lag allowed"
    );
    assert!(!recorder.is_recorded("t-01", "other").await);
}

#[tokio::test]
async fn unflushed_staging_survives_reopen() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");

    {
        let recorder = RecorderBuffer::open(&output).await.unwrap();
        recorder
            .record("s", "t-01", vec![row("s", "t-01")])
            .await
            .unwrap();
        recorder
            .record("s", "t-02", vec![row("s", "t-02")])
            .await
            .unwrap();
        // Dropped without flushing: rows exist only in staging.
    }

    let reopened = RecorderBuffer::open(&output).await.unwrap();
    assert!(reopened.is_recorded("t-01", "s").await);
    assert!(reopened.is_recorded("t-02", "s").await);
    assert_eq!(reopened.buffered_len(), 2);

    reopened.flush().await.unwrap();
    assert_eq!(reopened.buffered_len(), 0);
    assert_eq!(read_table(&output, "s").len(), 2);
    assert!(!output.join("staging").join("s.jsonl").exists());
}

#[tokio::test]
async fn truncated_staging_line_does_not_block_reopen() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");

    {
        let recorder = RecorderBuffer::open(&output).await.unwrap();
        recorder
            .record("s", "t-01", vec![row("s", "t-01")])
            .await
            .unwrap();
        // Dropped without flushing.
    }

    // A process killed mid-append leaves a half-written trailing line.
    let shard = output.join("staging").join("s.jsonl");
    let mut content = std::fs::read_to_string(&shard).unwrap();
    content.push_str("{\"scanner\":\"s\",\"transcript_id\":\"t-0");
    std::fs::write(&shard, content).unwrap();

    let reopened = RecorderBuffer::open(&output).await.unwrap();
    assert!(reopened.is_recorded("t-01", "s").await);
    assert!(
        !reopened.is_recorded("t-02", "s").await,
        "the half-written key must stay scannable"
    );
    assert_eq!(reopened.buffered_len(), 1);
}

#[tokio::test]
async fn corrupt_durable_row_fails_open() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");

    {
        let recorder = RecorderBuffer::open(&output).await.unwrap();
        recorder
            .record("s", "t-01", vec![row("s", "t-01")])
            .await
            .unwrap();
        recorder.flush().await.unwrap();
    }

    // Durable tables are written whole; a bad row there is real corruption.
    let table = output.join("tables").join("s.jsonl");
    let mut content = std::fs::read_to_string(&table).unwrap();
    content.push_str("not json\n");
    std::fs::write(&table, content).unwrap();

    let err = RecorderBuffer::open(&output).await.unwrap_err();
    assert!(matches!(
        err,
        tracemill_core::error::EngineError::StoreUnreachable { .. }
    ));
}

#[tokio::test]
async fn flush_appends_to_prior_durable_rows() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");
    let recorder = RecorderBuffer::open(&output).await.unwrap();

    recorder
        .record("s", "t-01", vec![row("s", "t-01")])
        .await
        .unwrap();
    recorder.flush().await.unwrap();
    recorder
        .record("s", "t-02", vec![row("s", "t-02")])
        .await
        .unwrap();
    recorder.flush().await.unwrap();

    let rows = read_table(&output, "s");
    let ids: Vec<&str> = rows.iter().map(|r| r.transcript_id.as_str()).collect();
    assert_eq!(ids, vec!["t-01", "t-02"]);
}

#[tokio::test]
async fn seed_carries_only_synced_keys() {
    let scratch = tempfile::tempdir().unwrap();
    let prior = scratch.path().join("prior");
    let fresh = scratch.path().join("fresh");

    {
        let recorder = RecorderBuffer::open(&prior).await.unwrap();
        for id in ["t-01", "t-02", "t-03"] {
            recorder.record("s", id, vec![row("s", id)]).await.unwrap();
        }
        recorder.cleanup().await.unwrap();
    }

    let synced: HashSet<(String, String)> = [
        ("s".to_string(), "t-01".to_string()),
        ("s".to_string(), "t-03".to_string()),
    ]
    .into_iter()
    .collect();

    let recorder = RecorderBuffer::open(&fresh).await.unwrap();
    recorder.seed_from(&prior, &synced).await.unwrap();

    assert!(recorder.is_recorded("t-01", "s").await);
    assert!(!recorder.is_recorded("t-02", "s").await);
    assert!(recorder.is_recorded("t-03", "s").await);
    assert_eq!(recorder.buffered_len(), 2);
}

#[tokio::test]
async fn seed_is_skipped_when_staging_exists() {
    let scratch = tempfile::tempdir().unwrap();
    let prior = scratch.path().join("prior");
    let fresh = scratch.path().join("fresh");

    {
        let recorder = RecorderBuffer::open(&prior).await.unwrap();
        recorder
            .record("s", "t-01", vec![row("s", "t-01")])
            .await
            .unwrap();
        recorder.cleanup().await.unwrap();
    }

    let recorder = RecorderBuffer::open(&fresh).await.unwrap();
    // Local staging already has its own state; seeding must not disturb it.
    recorder
        .record("s", "t-09", vec![row("s", "t-09")])
        .await
        .unwrap();

    let synced: HashSet<(String, String)> =
        [("s".to_string(), "t-01".to_string())].into_iter().collect();
    recorder.seed_from(&prior, &synced).await.unwrap();

    assert!(!recorder.is_recorded("t-01", "s").await);
    assert!(recorder.is_recorded("t-09", "s").await);
}

#[tokio::test]
async fn empty_result_set_is_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let recorder = RecorderBuffer::open(scratch.path().join("out")).await.unwrap();
    let err = recorder.record("s", "t-01", Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        tracemill_core::error::EngineError::Record { .. }
    ));
}

#[tokio::test]
async fn scanner_names_with_odd_characters_round_trip_through_disk() {
    let scratch = tempfile::tempdir().unwrap();
    let output = scratch.path().join("out");
    let name = "risky/path_scanner v2";

    {
        let recorder = RecorderBuffer::open(&output).await.unwrap();
        recorder
            .record(name, "t-01", vec![row(name, "t-01")])
            .await
            .unwrap();
        recorder.flush().await.unwrap();
    }

    let reopened = RecorderBuffer::open(&output).await.unwrap();
    assert!(reopened.is_recorded("t-01", name).await);
    let counts = reopened.scanner_counts().await;
    assert!(counts.contains_key(name));
}
