mod common;

use common::*;
use dstg_windowing::{
    create_shards, run_pipeline, DetectionLog, DetectionSet, PipelineStage, TrackingInput,
    WindowingError,
};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn expect_stall(err: WindowingError, stage: PipelineStage, frame: usize) {
    match err {
        WindowingError::Stall {
            stage: got_stage,
            frame_index,
            ref reason,
        } => {
            assert_eq!(got_stage, stage, "reason: {}", reason);
            assert_eq!(frame_index, frame, "reason: {}", reason);
        }
        other => panic!("expected a stall, got {}", other),
    }
}

#[test]
fn test_tracking_failure_names_stage_and_frame() {
    init_logger();
    let tmp = tempdir().unwrap();
    let err = run_pipeline(
        "broken",
        synthetic_source(100),
        lucas_kanade(),
        live(FailingTracker { fail_at: 37 }),
        tmp.path(),
        &test_config(20, 10),
    )
    .unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("CUDA out of memory"));
    expect_stall(err, PipelineStage::Tracking, 37);
}

#[test]
fn test_flow_failure_names_stage_and_frame() {
    let tmp = tempdir().unwrap();
    let err = run_pipeline(
        "broken",
        synthetic_source(40),
        Box::new(FailingFlow { fail_at: 5 }),
        live(ScriptedTracker::new()),
        tmp.path(),
        &test_config(10, 5),
    )
    .unwrap_err();
    expect_stall(err, PipelineStage::OpticalFlow, 5);
}

#[test]
fn test_failure_after_last_window_is_still_reported() {
    let tmp = tempdir().unwrap();
    // windows end at 10 and 20; frame 22 is only read by the producers
    let err = run_pipeline(
        "tail",
        synthetic_source(24),
        lucas_kanade(),
        live(FailingTracker { fail_at: 22 }),
        tmp.path(),
        &test_config(10, 10),
    )
    .unwrap_err();
    expect_stall(err, PipelineStage::Tracking, 22);
}

#[test]
fn test_watchdog_reports_hung_tracker() {
    let tmp = tempdir().unwrap();
    let mut config = test_config(6, 3);
    config.stall_timeout_ms = Some(100);

    let started = Instant::now();
    let err = run_pipeline(
        "hung",
        synthetic_source(30),
        lucas_kanade(),
        live(HangingTracker {
            hang_at: 4,
            hang_for: Duration::from_secs(6),
        }),
        tmp.path(),
        &config,
    )
    .unwrap_err();

    expect_stall(err, PipelineStage::Tracking, 4);
    // the stuck model call is left behind instead of awaited
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
}

#[test]
fn test_watchdog_covers_frames_after_last_window() {
    let tmp = tempdir().unwrap();
    let mut config = test_config(10, 10);
    config.stall_timeout_ms = Some(100);

    let started = Instant::now();
    let err = run_pipeline(
        "tail_hang",
        synthetic_source(24),
        lucas_kanade(),
        live(HangingTracker {
            hang_at: 22,
            hang_for: Duration::from_secs(6),
        }),
        tmp.path(),
        &config,
    )
    .unwrap_err();

    expect_stall(err, PipelineStage::Tracking, 22);
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
}

#[test]
fn test_repeated_id_in_log_fails_tracking_at_that_frame() {
    let tmp = tempdir().unwrap();
    let log = DetectionLog::from_sets((0..8).map(|i| {
        let mut people = scripted_detections(i);
        if i == 1 {
            people.push(person(5, 3.0, 3.0));
            people.push(person(5, 9.0, 1.0));
        }
        DetectionSet::new(i, people)
    }));

    let err = run_pipeline(
        "dup",
        synthetic_source(8),
        lucas_kanade(),
        TrackingInput::Replay(log),
        tmp.path(),
        &test_config(4, 2),
    )
    .unwrap_err();

    assert!(err.to_string().contains("individual 5"), "{}", err);
    expect_stall(err, PipelineStage::Tracking, 1);
}

#[test]
fn test_missing_log_and_model_is_config_error() {
    let root = tempdir().unwrap();
    let frames_dir = root.path().join("empty_clip");
    std::fs::create_dir_all(&frames_dir).unwrap();

    let err = create_shards(&frames_dir, &test_config(4, 2), lucas_kanade(), None).unwrap_err();
    assert!(matches!(err, WindowingError::Config(_)));
}

#[test]
fn test_invalid_stride_rejected_before_start() {
    let tmp = tempdir().unwrap();
    let err = run_pipeline(
        "bad",
        synthetic_source(10),
        lucas_kanade(),
        live(ScriptedTracker::new()),
        tmp.path(),
        &test_config(4, 5),
    )
    .unwrap_err();
    assert!(matches!(err, WindowingError::Config(_)));
    assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
}
