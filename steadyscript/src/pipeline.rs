//! The frame-processing pipeline: capture -> detect -> smooth -> score ->
//! encode, ticking at the camera rate on its own OS thread.
//!
//! The pipeline thread is the single owner of the live session, the
//! detector range and the calibration. Control commands from clients are
//! drained from a channel at the top of each tick, so no frame is ever
//! observed in a half-applied state. Results fan out over broadcast
//! channels to however many clients are connected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use marker_detector::MarkerDetector;
use stability_metrics::StabilityTracker;
use steadyscript_types::{
    ClientCommand, MetricsSnapshot, ServerMessage, SessionRecord,
};

use crate::capture::{CapturedFrame, FrameReceiver};
use crate::config::AppConfig;
use crate::errors::ControlError;
use crate::overlay::{Hud, OverlayRenderer};
use crate::session::{CommandOutcome, SessionController};

/// Per-client frame queue depth; a lagging client loses the oldest frame.
pub const FRAME_CHANNEL_DEPTH: usize = 2;
/// Metrics and event messages are small and never intentionally dropped.
pub const EVENT_CHANNEL_DEPTH: usize = 64;

/// A frame considered stale for the connection-status dot.
const FRAME_FRESHNESS: Duration = Duration::from_millis(500);

/// A control command plus the reply path of the issuing client, when the
/// command arrived over the duplex channel.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ClientCommand,
    pub reply: Option<mpsc::UnboundedSender<ServerMessage>>,
}

/// Output of one pipeline tick.
pub struct TickOutput {
    pub jpeg: Vec<u8>,
    pub metrics: MetricsSnapshot,
    pub completed: Option<SessionRecord>,
    /// LED state to write, present only when it changed.
    pub led: Option<bool>,
}

pub struct Pipeline {
    cfg: AppConfig,
    detector: MarkerDetector,
    tracker: StabilityTracker,
    controller: SessionController,
    overlay: OverlayRenderer,
    last_led: Option<bool>,
}

impl Pipeline {
    pub fn new(cfg: AppConfig) -> eyre::Result<Self> {
        let detector = MarkerDetector::new(cfg.default_hsv);
        let tracker = StabilityTracker::new(cfg.stability_window_size);
        let controller = SessionController::new(cfg.clone());
        let overlay = OverlayRenderer::new()?;
        Ok(Self {
            cfg,
            detector,
            tracker,
            controller,
            overlay,
            last_led: None,
        })
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Apply one control command between frames.
    pub fn apply_command(
        &mut self,
        command: &ClientCommand,
        now: Instant,
    ) -> Result<CommandOutcome, ControlError> {
        if let ClientCommand::HsvUpdate(range) = command {
            // Range swap is applied here, atomically between frames. The
            // bounds were validated at the transport layer.
            self.detector.set_hsv(*range);
            info!("hsv range now {:?}..{:?}", range.lower, range.upper);
            return Ok(CommandOutcome::default());
        }
        self.controller
            .apply_command(command, self.detector.hsv_range(), now)
    }

    /// Process one frame.
    pub fn tick(&mut self, frame: &CapturedFrame, now: Instant) -> eyre::Result<TickOutput> {
        let obs = self.detector.detect(&frame.image);
        match obs.position {
            Some((x, y)) => {
                self.tracker.update(x as f64, y as f64);
            }
            None => self.tracker.update_missing(),
        }

        let effects = self.controller.on_frame(obs.position, &self.tracker, now);
        let metrics = self.controller.snapshot(&self.tracker, obs.position, now);

        let inside = match (obs.position, self.controller.calibration()) {
            (Some((x, y)), Some(cal)) => cal.contains(x, y),
            _ => false,
        };
        let hud = Hud {
            mode: metrics.mode,
            state: metrics.session_state,
            camera_live: now.saturating_duration_since(frame.captured_at) < FRAME_FRESHNESS,
            marker: obs.position,
            calibration: self.controller.calibration(),
            inside,
            elapsed: metrics.elapsed,
            remaining: metrics.time_remaining,
            bpm: self.controller.bpm(),
            beats: self.controller.beats(),
            target: self.controller.target_position(now),
            final_score: self.controller.final_overlay_score(now),
        };
        let jpeg = self.overlay.render_jpeg(&frame.image, &hud)?;

        let led = if self.last_led != Some(effects.led) {
            self.last_led = Some(effects.led);
            Some(effects.led)
        } else {
            None
        };

        Ok(TickOutput {
            jpeg,
            metrics,
            completed: effects.completed,
            led,
        })
    }
}

/// Channel bundle handed to [pipeline_loop].
pub struct PipelineChannels {
    pub frame_rx: FrameReceiver,
    pub command_rx: crossbeam_channel::Receiver<ControlRequest>,
    pub frame_tx: broadcast::Sender<Arc<Vec<u8>>>,
    pub event_tx: broadcast::Sender<ServerMessage>,
    pub metrics_tx: watch::Sender<Option<MetricsSnapshot>>,
    pub persist_tx: crossbeam_channel::Sender<SessionRecord>,
    pub led_tx: mpsc::Sender<bool>,
}

/// Pipeline thread body: tick at the configured frame rate until the
/// command channel closes.
pub fn pipeline_loop(mut pipeline: Pipeline, mut ch: PipelineChannels) {
    let tick_interval = Duration::from_secs_f64(1.0 / pipeline.cfg.frame_rate as f64);
    let mut next_tick = Instant::now();
    let mut current_frame: Option<Arc<CapturedFrame>> = None;

    info!(
        "pipeline running at {} Hz",
        pipeline.cfg.frame_rate
    );

    loop {
        // Commands are applied between frames only.
        loop {
            match ch.command_rx.try_recv() {
                Ok(req) => {
                    let now = Instant::now();
                    match pipeline.apply_command(&req.command, now) {
                        Ok(outcome) => {
                            if let Some(record) = outcome.completed {
                                if ch.persist_tx.send(record).is_err() {
                                    error!("persistence channel closed");
                                }
                            }
                        }
                        Err(e) => {
                            debug!("rejected command {:?}: {e}", req.command);
                            match &req.reply {
                                Some(tx) => {
                                    let _ = tx.send(ServerMessage::Error(e.to_string()));
                                }
                                None => warn!("invalid control: {e}"),
                            }
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("command channel closed; pipeline stopping");
                    return;
                }
            }
        }

        // Latest frame wins; on a transient gap the previous one is reused.
        if let Some(frame) = ch.frame_rx.borrow_and_update().as_ref() {
            current_frame = Some(frame.clone());
        }

        if let Some(frame) = current_frame.clone() {
            match pipeline.tick(&frame, Instant::now()) {
                Ok(out) => {
                    // Send errors just mean nobody is listening right now.
                    let _ = ch.frame_tx.send(Arc::new(out.jpeg));
                    let _ = ch.metrics_tx.send(Some(out.metrics.clone()));
                    let _ = ch.event_tx.send(ServerMessage::Metrics(out.metrics));
                    if let Some(led) = out.led {
                        let _ = ch.led_tx.try_send(led);
                    }
                    // Invariant: the record is handed off only after the
                    // final metrics were published, so `session_complete`
                    // always trails them on the event channel.
                    if let Some(record) = out.completed {
                        if ch.persist_tx.send(record).is_err() {
                            error!("persistence channel closed; dropping session record");
                        }
                    }
                }
                Err(e) => warn!("pipeline tick failed: {e}"),
            }
        }

        next_tick += tick_interval;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            // Fell behind; do not spiral.
            next_tick = now;
        }
    }
}
