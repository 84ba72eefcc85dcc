//! Pipeline orchestrator: capture → detect → record → publish.
//!
//! The loop is strictly sequential on its own thread. The stream server and
//! the clip worker run independently; the frame hub is the only state shared
//! with them.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use ml_core::{Detection, Detector, TorchDetector, tch::Device};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureSource, Frame, NetCamera};

use crate::sentry::{
    annotate,
    artifacts::{ClipJob, spawn_clip_worker},
    config::SentryConfig,
    data::{DetectionSummary, FrameHub, FramePacket},
    recorder::{AviSinkFactory, EpisodeRecorder, RecordingPolicy},
    server::spawn_stream_server,
    storage::{BlobStore, S3Config, S3Store},
    telemetry,
    transcode::FfmpegTranscoder,
};

/// Pause after a failed read before polling the source again.
const READ_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Wraps a capture source with consecutive-failure accounting and the
/// reconnect-at-threshold policy.
pub(crate) struct CaptureSupervisor<S: CaptureSource> {
    source: S,
    threshold: u32,
    failures: u32,
    reconnects: u64,
}

impl<S: CaptureSource> CaptureSupervisor<S> {
    pub(crate) fn new(source: S, threshold: u32) -> Self {
        Self {
            source,
            threshold,
            failures: 0,
            reconnects: 0,
        }
    }

    pub(crate) fn open(&mut self) {
        self.source.open();
    }

    pub(crate) fn close(&mut self) {
        self.source.close();
    }

    pub(crate) fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Read one frame. A success clears the failure count; reaching the
    /// threshold triggers exactly one full reconnect and resets the count.
    pub(crate) fn next_frame(&mut self) -> Option<Frame> {
        match self.source.read() {
            Some(frame) => {
                self.failures = 0;
                Some(frame)
            }
            None => {
                self.failures += 1;
                metrics::counter!("sentry_capture_failures_total").increment(1);
                warn!("frame read failed ({} consecutive)", self.failures);
                if self.failures >= self.threshold {
                    warn!("too many consecutive capture failures, reconnecting");
                    self.source.open();
                    self.failures = 0;
                    self.reconnects += 1;
                    metrics::counter!("sentry_capture_reconnects_total").increment(1);
                }
                None
            }
        }
    }
}

/// Run the sentry pipeline until interrupted.
pub fn run(config: SentryConfig) -> Result<()> {
    telemetry::init();

    static CTRL_HANDLER: Once = Once::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    if config.cooldown_seconds <= config.record_seconds {
        warn!(
            "cooldown ({}s) does not exceed recording duration ({}s); \
             new episodes may start immediately after one ends",
            config.cooldown_seconds, config.record_seconds
        );
    }

    let hub = FrameHub::new();
    let server = spawn_stream_server(hub.clone(), &config.bind_addr)?;

    let store: Arc<dyn BlobStore> = Arc::new(
        S3Config::from_env()
            .and_then(S3Store::new)
            .context("storage configuration failed")?,
    );

    let (clip_tx, clip_rx) = crossbeam_channel::bounded::<ClipJob>(4);
    let clip_worker = spawn_clip_worker(
        clip_rx,
        store.clone(),
        Box::new(FfmpegTranscoder::default()),
        config.key_prefix.clone(),
    );

    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = TorchDetector::new(
        &config.model_path,
        device,
        (config.width as i64, config.height as i64),
    )
    .with_context(|| format!("failed to load detector {}", config.model_path.display()))?;
    info!("detector loaded on {:?}", detector.device());

    let recorder = EpisodeRecorder::new(
        RecordingPolicy {
            fps: config.fps,
            record_seconds: config.record_seconds,
            cooldown_seconds: config.cooldown_seconds,
            confidence: config.confidence,
            person_class: config.person_class,
        },
        config.scratch_dir.clone(),
        config.key_prefix.clone(),
        config.jpeg_quality,
        store,
        Box::new(AviSinkFactory),
        clip_tx,
    );

    let camera = NetCamera::new(
        &config.camera_uri,
        (config.width, config.height),
        Duration::from_secs(config.retry_interval_secs),
    );
    let mut supervisor = CaptureSupervisor::new(camera, config.reconnect_after);

    supervisor.open();
    info!(
        "live preview available at http://{}/stream.mjpg",
        config.bind_addr
    );

    let result = run_loop(
        &mut supervisor,
        &detector,
        recorder,
        &hub,
        &config,
        &shutdown,
    );

    info!("stopping sentry pipeline");
    supervisor.close();
    // Recorder dropped inside run_loop closes the clip channel; the worker
    // drains outstanding jobs and exits.
    let _ = clip_worker.join();
    server.stop();

    result
}

fn run_loop<S: CaptureSource>(
    supervisor: &mut CaptureSupervisor<S>,
    detector: &dyn Detector,
    mut recorder: EpisodeRecorder,
    hub: &FrameHub,
    config: &SentryConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut frame_number: u64 = 0;
    let mut smoothed_fps: f32 = 0.0;
    let mut last_instant = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let Some(mut frame) = supervisor.next_frame() else {
            thread::sleep(READ_RETRY_PAUSE);
            continue;
        };

        frame_number = frame_number.wrapping_add(1);

        let now = Instant::now();
        let elapsed = now.duration_since(last_instant).as_secs_f32();
        last_instant = now;
        if elapsed > 0.0 {
            let instant = 1.0 / elapsed;
            smoothed_fps = if smoothed_fps == 0.0 {
                instant
            } else {
                0.9 * smoothed_fps + 0.1 * instant
            };
            metrics::histogram!("sentry_capture_frame_interval_seconds")
                .record(elapsed as f64);
        }
        metrics::gauge!("sentry_pipeline_fps").set(smoothed_fps as f64);

        let detections = match detector.detect_bgr(&frame.data, frame.width, frame.height) {
            Ok(detections) => detections,
            Err(err) => {
                error!("detection failed on frame #{frame_number}: {err}");
                metrics::counter!("sentry_detection_failures_total").increment(1);
                continue;
            }
        };

        if config.verbose && !detections.is_empty() {
            debug!("frame #{frame_number}: {} detection(s)", detections.len());
        }

        let summaries = summarize(
            &detections,
            config.person_class,
            config.confidence,
            frame.width,
            frame.height,
        );
        annotate::draw_detections(&mut frame, &summaries);
        annotate::draw_status_line(&mut frame, frame_number, smoothed_fps);

        recorder.handle_frame(&frame, &detections, Utc::now());

        let jpeg = match annotate::encode_jpeg(&frame, config.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                error!("JPEG encode failed on frame #{frame_number}: {err:#}");
                continue;
            }
        };

        hub.publish(FramePacket {
            jpeg,
            detections: summaries,
            timestamp_ms: frame.timestamp_ms,
            frame_number,
            fps: smoothed_fps,
        });

        if frame_number % 30 == 0 {
            debug!(
                "capture heartbeat: frame #{frame_number}, {:.1} fps, {} reconnect(s)",
                smoothed_fps,
                supervisor.reconnects()
            );
        }
    }

    Ok(())
}

/// Keep qualifying detections only, with boxes clamped to frame bounds.
fn summarize(
    detections: &[Detection],
    person_class: i64,
    confidence: f32,
    width: i32,
    height: i32,
) -> Vec<DetectionSummary> {
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    detections
        .iter()
        .filter(|d| d.class_id == person_class && d.score > confidence)
        .map(|d| DetectionSummary {
            class: "PERSON".to_string(),
            score: d.score,
            bbox: [
                d.bbox_xyxy[0].clamp(0.0, max_x),
                d.bbox_xyxy[1].clamp(0.0, max_y),
                d.bbox_xyxy[2].clamp(0.0, max_x),
                d.bbox_xyxy[3].clamp(0.0, max_y),
            ],
        })
        .collect()
}
