//! End-to-end pipeline tests driven by synthetic frames.
//!
//! Frames are generated in memory with a colored blob standing in for the
//! pen marker, and time is advanced explicitly so sessions complete
//! deterministically without a camera or a wall-clock wait.

use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use steadyscript::capture::CapturedFrame;
use steadyscript::config::AppConfig;
use steadyscript::errors::ControlError;
use steadyscript::pipeline::Pipeline;
use steadyscript_types::{
    ClientCommand, ExerciseMode, HsvRange, SessionState,
};

const W: u32 = 160;
const H: u32 = 120;

fn small_config() -> AppConfig {
    AppConfig {
        frame_width: W,
        frame_height: H,
        follow_target_radius: 40.0,
        ..AppConfig::default()
    }
}

/// A frame with an 11x11 marker blob centred on `marker`.
fn frame_with_marker(marker: Option<(i32, i32)>, color: Rgb<u8>, at: Instant) -> CapturedFrame {
    let mut image = RgbImage::from_pixel(W, H, Rgb([20, 20, 20]));
    if let Some((cx, cy)) = marker {
        for dy in -5..=5 {
            for dx in -5..=5 {
                let (x, y) = (cx + dx, cy + dy);
                if x >= 0 && y >= 0 && (x as u32) < W && (y as u32) < H {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
    CapturedFrame {
        image,
        captured_at: at,
    }
}

fn blue() -> Rgb<u8> {
    Rgb([0, 0, 255])
}

fn calibrate(pipeline: &mut Pipeline, now: Instant) {
    pipeline
        .apply_command(&ClientCommand::CalibrationClick { x: 80, y: 60 }, now)
        .unwrap();
    pipeline
        .apply_command(&ClientCommand::CalibrationClick { x: 100, y: 60 }, now)
        .unwrap();
}

#[test]
fn steady_hold_session_end_to_end() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    // One frame so the controller has seen the marker, then calibrate.
    let out = pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();
    assert!(out.metrics.marker_detected);
    assert_eq!(out.metrics.position.map(|p| (p.x, p.y)), Some((80, 60)));
    // Annotated output is a JPEG.
    assert_eq!(&out.jpeg[..2], &[0xFF, 0xD8]);

    calibrate(&mut pipeline, t0);
    pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap();

    // 50 sampled ticks with the marker dead still, then jump past the
    // 10 s deadline.
    let dt = Duration::from_millis(33);
    for i in 1..=50u32 {
        let now = t0 + dt * i;
        let out = pipeline
            .tick(&frame_with_marker(Some((80, 60)), blue(), now), now)
            .unwrap();
        assert_eq!(out.metrics.session_state, SessionState::Running);
        assert!(out.metrics.time_remaining > 0.0);
        assert!(out.completed.is_none());
    }
    let end = t0 + Duration::from_millis(10_500);
    let out = pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), end), end)
        .unwrap();

    let record = out
        .completed
        .clone()
        .expect("session must complete after its deadline");
    assert_eq!(record.session_type, ExerciseMode::Hold);
    assert_eq!(record.frames_total, 50);
    assert_eq!(record.frames_marker_found, 50);
    assert!(record.p95_jitter.unwrap() < 1.0);
    assert_eq!(record.inside_circle_pct.unwrap(), 100.0);
    assert!(record.tremor_score >= 95.0);
    assert_eq!(out.metrics.session_state, SessionState::Complete);
    assert_eq!(out.metrics.time_remaining, 0.0);
}

#[test]
fn hold_start_without_calibration_is_rejected() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();

    let err = pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap_err();
    assert_eq!(err, ControlError::NotCalibrated);

    // State unchanged.
    let out = pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();
    assert_eq!(out.metrics.session_state, SessionState::Idle);
}

#[test]
fn start_without_marker_is_rejected() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    calibrate(&mut pipeline, t0);
    pipeline
        .tick(&frame_with_marker(None, blue(), t0), t0)
        .unwrap();

    let err = pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap_err();
    assert_eq!(err, ControlError::MarkerNotDetected);
}

#[test]
fn hsv_swap_enables_hue_wrapped_detection() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    // With a blue range active, a deep-red blob goes undetected.
    pipeline
        .apply_command(
            &ClientCommand::HsvUpdate(HsvRange::new([100, 50, 50], [130, 255, 255])),
            t0,
        )
        .unwrap();
    let red_frame = frame_with_marker(Some((40, 40)), Rgb([255, 0, 40]), t0);
    let out = pipeline.tick(&red_frame, t0).unwrap();
    assert!(!out.metrics.marker_detected);

    // A hue-wrapped range picks up the same blob (hue ~175 sits in the
    // lower slice of [170, 10]).
    pipeline
        .apply_command(
            &ClientCommand::HsvUpdate(HsvRange::new([170, 100, 100], [10, 255, 255])),
            t0,
        )
        .unwrap();
    let out = pipeline.tick(&red_frame, t0).unwrap();
    assert!(out.metrics.marker_detected);
}

#[test]
fn follow_session_end_to_end() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    pipeline
        .apply_command(
            &ClientCommand::ModeSwitch {
                mode: ExerciseMode::Follow,
            },
            t0,
        )
        .unwrap();
    pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();
    pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap();

    // 20 s at 60 BPM, sampled at 10 Hz to keep the test quick. The marker
    // sits at the path centre the whole time: zero lateral wobble.
    let dt = Duration::from_millis(100);
    let mut record = None;
    for i in 1..=210u32 {
        let now = t0 + dt * i;
        let out = pipeline
            .tick(&frame_with_marker(Some((80, 60)), blue(), now), now)
            .unwrap();
        if out.metrics.session_state == SessionState::Running {
            assert!(out.metrics.time_remaining > 0.0);
            assert!(out.metrics.bpm.is_some());
            assert!(out.metrics.beat_count.is_some());
            assert!(out.metrics.feedback_status.is_some());
        }
        if let Some(r) = out.completed {
            record = Some(r);
            break;
        }
    }

    let record = record.expect("FOLLOW session must complete");
    assert_eq!(record.session_type, ExerciseMode::Follow);
    let beats = record.beats_total.unwrap();
    assert!(
        (19..=21).contains(&beats),
        "expected 19..=21 beats at 60 BPM over 20 s, got {beats}"
    );
    assert!(record.p95_lateral_jitter.unwrap() < 1.0);
    assert!(record.tremor_score >= 95.0);
    assert!(record.circle_center.is_none());
    assert!(record.avg_jitter.is_none());
}

#[test]
fn marker_loss_mid_session_is_tolerated() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();
    calibrate(&mut pipeline, t0);
    pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap();

    let dt = Duration::from_millis(33);
    for i in 1..=20u32 {
        let now = t0 + dt * i;
        // The marker vanishes for every third frame.
        let marker = if i % 3 == 0 { None } else { Some((80, 60)) };
        let out = pipeline
            .tick(&frame_with_marker(marker, blue(), now), now)
            .unwrap();
        assert_eq!(out.metrics.marker_detected, marker.is_some());
    }

    let end = t0 + Duration::from_millis(10_500);
    let out = pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), end), end)
        .unwrap();
    let record = out.completed.expect("session completes");
    assert_eq!(record.frames_total, 20);
    assert!(record.frames_marker_found < record.frames_total);
    assert!(record.frames_marker_found >= 13);
}

#[test]
fn led_state_changes_only_on_transition() {
    let mut pipeline = Pipeline::new(small_config()).unwrap();
    let t0 = Instant::now();

    pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0), t0)
        .unwrap();
    calibrate(&mut pipeline, t0);
    pipeline
        .apply_command(&ClientCommand::SessionStart, t0)
        .unwrap();

    let dt = Duration::from_millis(33);

    // Inside the circle: one transition to on, then silence.
    let out = pipeline
        .tick(&frame_with_marker(Some((80, 60)), blue(), t0 + dt), t0 + dt)
        .unwrap();
    assert_eq!(out.led, Some(true));
    let out = pipeline
        .tick(
            &frame_with_marker(Some((80, 60)), blue(), t0 + dt * 2),
            t0 + dt * 2,
        )
        .unwrap();
    assert_eq!(out.led, None);

    // Far outside the 20 px circle: one transition to off.
    let out = pipeline
        .tick(
            &frame_with_marker(Some((20, 100)), blue(), t0 + dt * 3),
            t0 + dt * 3,
        )
        .unwrap();
    assert_eq!(out.led, Some(false));
}
