//! End-to-end tests for batch runs
//!
//! Album discovery, session bookkeeping and the pause and stop controls.

mod common;

use album_converter::config::pause_file_path;
use album_converter::ledger::{ProcessingStage, ProgressLedger, RecordUpdate, SessionStatus};
use album_converter::pipeline::AlbumOutcome;
use common::{AlbumFixture, TestHarness};
use std::fs;
use tokio_util::sync::CancellationToken;

fn album(name: &str) -> AlbumFixture {
    AlbumFixture::new(name).track("01.dsf").track("02.dsf")
}

fn session_status(harness: &TestHarness) -> SessionStatus {
    harness
        .ledger
        .get_session(&harness.session.id)
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_batch_processes_every_album() {
    let harness = TestHarness::new();
    harness.add_album(album("Artist/First"));
    harness.add_album(album("Artist/Second"));
    harness.add_album(AlbumFixture::new("Lossless").track("01.flac"));
    harness.add_album(AlbumFixture::new("Scans").file("front.jpg", b"jpeg"));

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.completed(), 2);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.failed(), 0);
    assert!(!report.paused);
    assert_eq!(
        report.outcome_for(&harness.album_path("Lossless")),
        Some(&AlbumOutcome::SkippedNoConvertible)
    );
    assert!(harness.output_path("Artist/First/01.flac").is_file());
    assert!(harness.output_path("Artist/Second/02.flac").is_file());
    assert_eq!(session_status(&harness), SessionStatus::Completed);

    let stats = harness.ledger.session_stats(&harness.session.id).unwrap();
    assert_eq!(stats.albums_in(ProcessingStage::Completed), 2);
}

#[tokio::test]
async fn test_batch_skips_pipeline_directories_in_place() {
    let harness = TestHarness::in_place();
    harness.add_album(album("Album"));
    // Leftovers a crashed promotion or restore would leave next to the album
    AlbumFixture::new("Album.partial")
        .track("01.dsf")
        .write(&harness.input_dir);
    AlbumFixture::new("Album.restore")
        .track("01.dsf")
        .write(&harness.input_dir);

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcome_for(&harness.album_path("Album")).is_some());
}

#[tokio::test]
async fn test_single_album_mode() {
    let harness = TestHarness::new();
    harness.add_album(album("Album"));
    let session = harness
        .ledger
        .create_session(
            &harness.album_path("Album"),
            &harness.output_dir,
            &harness.archive_dir,
        )
        .unwrap();

    let report = harness
        .runner()
        .run(&session, true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed(), 1);
    assert!(harness.output_path("Album/01.flac").is_file());
}

#[tokio::test]
async fn test_pause_file_stops_batch() {
    let harness = TestHarness::new();
    harness.add_album(album("First"));
    harness.add_album(album("Second"));
    let pause_file = pause_file_path(&harness.working_dir);
    fs::write(&pause_file, b"").unwrap();

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.paused);
    assert!(report.outcomes.is_empty());
    assert!(!pause_file.exists());
    assert_eq!(session_status(&harness), SessionStatus::Paused);

    // The next run picks the session up again
    let runner = harness.runner();
    let session = runner
        .open_session(
            &harness.input_dir,
            &harness.output_dir,
            &harness.archive_dir,
            true,
        )
        .unwrap();
    assert_eq!(session.id, harness.session.id);
    let report = runner
        .run(&session, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.completed(), 2);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_album() {
    let harness = TestHarness::new();
    harness.add_album(album("First"));
    let token = CancellationToken::new();
    token.cancel();

    let report = harness
        .runner()
        .run(&harness.session, false, &token)
        .await
        .unwrap();

    assert!(report.paused);
    assert!(report.outcomes.is_empty());
    assert!(harness.transcoder.calls().is_empty());
    assert_eq!(session_status(&harness), SessionStatus::Paused);
}

#[tokio::test]
async fn test_stop_batch_on_failure() {
    let mut harness = TestHarness::new();
    harness.settings.stop_batch_on_failure = true;
    harness.add_album(album("First"));
    harness.add_album(album("Second"));
    harness.transcoder.fail("01.dsf", 3);

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.stopped_on_failure);
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcome_for(&harness.album_path("First")).unwrap().is_failure());
    assert!(harness.record("Second").is_none());
    assert_eq!(session_status(&harness), SessionStatus::Paused);
}

#[tokio::test]
async fn test_failures_do_not_stop_batch_by_default() {
    let harness = TestHarness::new();
    harness.add_album(album("First"));
    harness.add_album(album("Second"));
    harness.transcoder.fail("01.dsf", 3);

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.completed(), 1);
    assert!(!report.stopped_on_failure);
    assert_eq!(session_status(&harness), SessionStatus::Completed);

    let stats = harness.ledger.session_stats(&harness.session.id).unwrap();
    assert_eq!(stats.failed_albums(), 1);
}

#[tokio::test]
async fn test_resume_ignores_session_over_other_roots() {
    let harness = TestHarness::new();
    let runner = harness.runner();
    let elsewhere = harness.working_dir.join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();

    let session = runner
        .open_session(&elsewhere, &harness.output_dir, &harness.archive_dir, true)
        .unwrap();

    assert_ne!(session.id, harness.session.id);
    assert_eq!(session.input_dir, elsewhere);
}

#[tokio::test]
async fn test_dry_run_batch_plans_every_album() {
    let mut harness = TestHarness::new();
    harness.settings.dry_run = true;
    harness.add_album(album("First"));
    harness.add_album(album("Second"));
    harness.add_album(AlbumFixture::new("Lossless").track("01.flac"));

    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.planned(), 2);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.completed(), 0);
    assert!(harness.transcoder.calls().is_empty());
    assert!(harness.record("First").is_none());
    assert!(harness.archives().is_empty());
    assert!(!harness.output_path("First").exists());
}

#[tokio::test]
async fn test_dry_run_leaves_displaced_original_alone() {
    let mut harness = TestHarness::in_place();
    let album_path = harness.add_album(album("Album"));
    let blocker = harness.input_dir.join("Album.partial");
    fs::write(&blocker, b"blocker").unwrap();
    assert!(harness.process("Album").await.is_failure());
    fs::remove_file(&blocker).unwrap();
    harness
        .ledger
        .upsert(
            &RecordUpdate::new(&harness.session.id, &album_path, "Album")
                .with_source_displaced(true),
        )
        .unwrap();
    fs::remove_file(album_path.join("02.dsf")).unwrap();

    harness.settings.dry_run = true;
    let report = harness
        .runner()
        .run(&harness.session, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.recovered, 0);
    assert!(!album_path.join("02.dsf").exists());
    assert!(harness.record("Album").unwrap().source_displaced);
}
