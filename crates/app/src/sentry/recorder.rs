//! Episode state machine: decides when a recording starts, how long it runs,
//! and when its artifacts are handed to the upload path.
//!
//! All recording state lives privately in [`EpisodeRecorder`] and is mutated
//! only through [`EpisodeRecorder::handle_frame`] on the pipeline thread.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{Sender, TrySendError};
use ml_core::Detection;
use opencv::{
    core,
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait},
};
use tracing::{debug, error, info};
use video_ingest::Frame;

use crate::sentry::{annotate, artifacts::ClipJob, storage::BlobStore};

/// Recording policy knobs, fixed for the process lifetime.
#[derive(Clone, Debug)]
pub(crate) struct RecordingPolicy {
    pub(crate) fps: u32,
    pub(crate) record_seconds: u32,
    pub(crate) cooldown_seconds: u32,
    pub(crate) confidence: f32,
    pub(crate) person_class: i64,
}

impl RecordingPolicy {
    fn target_frames(&self) -> u32 {
        self.fps * self.record_seconds
    }
}

/// Append-only clip sink for one episode.
pub(crate) trait VideoSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens a sink for a new episode's clip file.
pub(crate) trait SinkFactory: Send {
    fn open(&self, path: &Path, size: (i32, i32), fps: f64) -> Result<Box<dyn VideoSink>>;
}

/// One in-flight recording episode.
struct Episode {
    id: String,
    target_frames: u32,
    frames_written: u32,
    clip_path: PathBuf,
    sink: Box<dyn VideoSink>,
}

/// Outcome of feeding one frame to the recorder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecordingAction {
    /// Nothing to do: idle, non-qualifying detections, or cooldown.
    None,
    /// A new episode began on this frame.
    Started { episode_id: String, people: usize },
    /// The active episode consumed this frame.
    Appended { frames_written: u32 },
    /// The active episode reached its target frame count and was handed off.
    Finished {
        episode_id: String,
        frames_written: u32,
    },
    /// A qualifying detection occurred but the sink could not be opened;
    /// no episode started and no cooldown was armed.
    Aborted,
}

pub(crate) struct EpisodeRecorder {
    policy: RecordingPolicy,
    scratch_dir: PathBuf,
    key_prefix: String,
    jpeg_quality: i32,
    store: Arc<dyn BlobStore>,
    sinks: Box<dyn SinkFactory>,
    clip_tx: Sender<ClipJob>,
    last_detect_time: Option<DateTime<Utc>>,
    active: Option<Episode>,
}

impl EpisodeRecorder {
    pub(crate) fn new(
        policy: RecordingPolicy,
        scratch_dir: PathBuf,
        key_prefix: String,
        jpeg_quality: i32,
        store: Arc<dyn BlobStore>,
        sinks: Box<dyn SinkFactory>,
        clip_tx: Sender<ClipJob>,
    ) -> Self {
        Self {
            policy,
            scratch_dir,
            key_prefix,
            jpeg_quality,
            store,
            sinks,
            clip_tx,
            last_detect_time: None,
            active: None,
        }
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Cooldown counts from the moment the previous episode started, not from
    /// when it ended.
    pub(crate) fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_detect_time.is_some_and(|t| {
            now.signed_duration_since(t) < Duration::seconds(self.policy.cooldown_seconds as i64)
        })
    }

    /// Advance the state machine by one frame. The frame is expected to carry
    /// any overlays already; it is appended verbatim while recording.
    pub(crate) fn handle_frame(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        now: DateTime<Utc>,
    ) -> RecordingAction {
        if let Some(mut episode) = self.active.take() {
            if let Err(err) = episode.sink.append(frame) {
                error!(
                    "failed to append frame to {}: {err:#}",
                    episode.clip_path.display()
                );
            }
            // A failing sink still counts the frame so the episode terminates
            // instead of recording forever.
            episode.frames_written += 1;

            if episode.frames_written >= episode.target_frames {
                return self.finish_episode(episode);
            }

            let frames_written = episode.frames_written;
            self.active = Some(episode);
            return RecordingAction::Appended { frames_written };
        }

        let people = self.qualifying(detections);
        if people == 0 {
            return RecordingAction::None;
        }
        if self.in_cooldown(now) {
            debug!("cooldown active, ignoring {people} qualifying detection(s)");
            return RecordingAction::None;
        }

        self.start_episode(frame, people, now)
    }

    fn qualifying(&self, detections: &[Detection]) -> usize {
        detections
            .iter()
            .filter(|d| d.class_id == self.policy.person_class && d.score > self.policy.confidence)
            .count()
    }

    fn start_episode(&mut self, frame: &Frame, people: usize, now: DateTime<Utc>) -> RecordingAction {
        let id = format!("evt_{}", now.format("%Y%m%d_%H%M%S"));
        let clip_path = self.scratch_dir.join(format!("{id}.avi"));

        // The sink opens before any other side effect: a failed open must
        // leave the recorder exactly as it was, cooldown included.
        let sink = match self.sinks.open(
            &clip_path,
            (frame.width, frame.height),
            self.policy.fps as f64,
        ) {
            Ok(sink) => sink,
            Err(err) => {
                error!("could not open video sink for {id}: {err:#}");
                metrics::counter!("sentry_episode_sink_failures_total").increment(1);
                return RecordingAction::Aborted;
            }
        };

        info!("detected {people} person(s), starting episode {id}");
        self.last_detect_time = Some(now);
        metrics::counter!("sentry_episodes_started_total").increment(1);

        match self.upload_snapshot(frame, &id) {
            Ok(url) => info!("snapshot uploaded for {id}: {url}"),
            Err(err) => {
                error!("snapshot upload failed for {id}: {err:#}");
                metrics::counter!("sentry_snapshot_upload_failures_total").increment(1);
            }
        }

        self.active = Some(Episode {
            id: id.clone(),
            target_frames: self.policy.target_frames(),
            frames_written: 0,
            clip_path,
            sink,
        });

        RecordingAction::Started {
            episode_id: id,
            people,
        }
    }

    fn finish_episode(&mut self, episode: Episode) -> RecordingAction {
        let Episode {
            id,
            frames_written,
            clip_path,
            sink,
            ..
        } = episode;

        info!("recording complete for {id} ({frames_written} frames)");
        if let Err(err) = sink.finish() {
            error!("failed to close video sink for {id}: {err:#}");
        }
        metrics::counter!("sentry_episodes_completed_total").increment(1);

        let job = ClipJob {
            episode_id: id.clone(),
            raw_path: clip_path,
        };
        // Never block the pipeline on the clip queue: a wedged worker costs
        // us the clip, not the stream.
        match self.clip_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                error!("clip queue full, abandoning clip for {id}");
                let _ = fs::remove_file(&job.raw_path);
            }
            Err(TrySendError::Disconnected(job)) => {
                error!("clip worker unavailable, abandoning clip for {id}");
                let _ = fs::remove_file(&job.raw_path);
            }
        }

        RecordingAction::Finished {
            episode_id: id,
            frames_written,
        }
    }

    /// Writes the snapshot to scratch, uploads it, and removes the scratch
    /// file regardless of outcome.
    fn upload_snapshot(&self, frame: &Frame, episode_id: &str) -> Result<String> {
        let path = self.scratch_dir.join(format!("{episode_id}.jpg"));
        let key = format!("{}/images/{episode_id}.jpg", self.key_prefix);

        let result = annotate::encode_jpeg(frame, self.jpeg_quality)
            .and_then(|jpeg| {
                fs::write(&path, jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))
            })
            .and_then(|()| self.store.put_file(&path, &key, "image/jpeg"));

        if path.exists() {
            let _ = fs::remove_file(&path);
        }

        result
    }
}

/// XVID/AVI sink over OpenCV's `VideoWriter`.
pub(crate) struct AviSinkFactory;

impl SinkFactory for AviSinkFactory {
    fn open(&self, path: &Path, size: (i32, i32), fps: f64) -> Result<Box<dyn VideoSink>> {
        let fourcc = VideoWriter::fourcc('X', 'V', 'I', 'D')?;
        let path_str = path.to_str().context("clip path is not valid UTF-8")?;
        let writer = VideoWriter::new(
            path_str,
            fourcc,
            fps,
            core::Size {
                width: size.0,
                height: size.1,
            },
            true,
        )?;
        if !writer.is_opened()? {
            bail!("video writer failed to open {}", path.display());
        }
        Ok(Box::new(AviSink { writer, size }))
    }
}

struct AviSink {
    writer: VideoWriter,
    size: (i32, i32),
}

impl VideoSink for AviSink {
    fn append(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width, frame.height) != self.size {
            bail!(
                "frame size {}x{} does not match clip size {}x{}",
                frame.width,
                frame.height,
                self.size.0,
                self.size.1
            );
        }
        let flat = Mat::from_slice(&frame.data)?;
        let shaped = flat.reshape(3, frame.height)?;
        self.writer.write(&shaped)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.release()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use crossbeam_channel::{Receiver, unbounded};
    use video_ingest::FrameFormat;

    use super::*;

    #[derive(Default)]
    struct MemStore {
        puts: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl BlobStore for MemStore {
        fn put_file(&self, _path: &Path, key: &str, _content_type: &str) -> Result<String> {
            if self.fail.load(Ordering::Relaxed) {
                bail!("store unavailable");
            }
            self.puts.lock().unwrap().push(key.to_string());
            Ok(format!("mem://{key}"))
        }
    }

    #[derive(Default)]
    struct SinkProbe {
        opened: AtomicUsize,
        appended: AtomicUsize,
        finished: AtomicUsize,
        fail_open: AtomicBool,
    }

    struct ProbeFactory(Arc<SinkProbe>);

    impl SinkFactory for ProbeFactory {
        fn open(&self, _path: &Path, _size: (i32, i32), _fps: f64) -> Result<Box<dyn VideoSink>> {
            if self.0.fail_open.load(Ordering::Relaxed) {
                bail!("sink open refused");
            }
            self.0.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(ProbeSink(self.0.clone())))
        }
    }

    struct ProbeSink(Arc<SinkProbe>);

    impl VideoSink for ProbeSink {
        fn append(&mut self, _frame: &Frame) -> Result<()> {
            self.0.appended.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            self.0.finished.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Fixture {
        recorder: EpisodeRecorder,
        store: Arc<MemStore>,
        probe: Arc<SinkProbe>,
        clip_rx: Receiver<ClipJob>,
        _scratch: tempfile::TempDir,
    }

    fn fixture(cooldown_seconds: u32) -> Fixture {
        let store = Arc::new(MemStore::default());
        let probe = Arc::new(SinkProbe::default());
        let (clip_tx, clip_rx) = unbounded();
        let scratch = tempfile::tempdir().unwrap();
        let recorder = EpisodeRecorder::new(
            RecordingPolicy {
                fps: 10,
                record_seconds: 5,
                cooldown_seconds,
                confidence: 0.5,
                person_class: 0,
            },
            scratch.path().to_path_buf(),
            "events".to_string(),
            85,
            store.clone(),
            Box::new(ProbeFactory(probe.clone())),
            clip_tx,
        );
        Fixture {
            recorder,
            store,
            probe,
            clip_rx,
            _scratch: scratch,
        }
    }

    fn frame() -> Frame {
        Frame {
            data: vec![0u8; 16 * 16 * 3],
            width: 16,
            height: 16,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    fn person(score: f32) -> Detection {
        Detection {
            bbox_xyxy: [1.0, 1.0, 10.0, 10.0],
            score,
            class_id: 0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn qualifying_detection_starts_an_episode() {
        let mut fx = fixture(30);
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        assert!(matches!(action, RecordingAction::Started { people: 1, .. }));
        assert!(fx.recorder.is_recording());
        let puts = fx.store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].starts_with("events/images/evt_"));
    }

    #[test]
    fn low_confidence_or_other_classes_do_not_qualify() {
        let mut fx = fixture(30);
        let dog = Detection {
            bbox_xyxy: [0.0, 0.0, 5.0, 5.0],
            score: 0.99,
            class_id: 16,
        };
        let action = fx
            .recorder
            .handle_frame(&frame(), &[person(0.5), dog], at(0));
        assert_eq!(action, RecordingAction::None);
        assert!(!fx.recorder.is_recording());
    }

    #[test]
    fn only_one_episode_records_at_a_time() {
        let mut fx = fixture(30);
        fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        // A fresh qualifying detection while recording appends, never starts.
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(1));
        assert_eq!(action, RecordingAction::Appended { frames_written: 1 });
        assert_eq!(fx.probe.opened.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn episode_writes_exactly_fps_times_record_seconds_frames() {
        let mut fx = fixture(30);
        fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));

        let mut finished = None;
        for n in 1..=50 {
            let action = fx.recorder.handle_frame(&frame(), &[], at(n / 10));
            match action {
                RecordingAction::Appended { frames_written } => {
                    assert_eq!(frames_written, n as u32)
                }
                RecordingAction::Finished { frames_written, .. } => {
                    finished = Some(frames_written);
                }
                other => panic!("unexpected action {other:?}"),
            }
        }

        assert_eq!(finished, Some(50));
        assert_eq!(fx.probe.appended.load(Ordering::Relaxed), 50);
        assert_eq!(fx.probe.finished.load(Ordering::Relaxed), 1);
        assert!(!fx.recorder.is_recording());

        let job = fx.clip_rx.try_recv().unwrap();
        assert!(job.raw_path.extension().is_some_and(|e| e == "avi"));
        assert!(fx.clip_rx.try_recv().is_err(), "exactly one clip job");
    }

    #[test]
    fn cooldown_from_start_blocks_new_episodes() {
        let mut fx = fixture(30);
        fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        for n in 1..=50 {
            fx.recorder.handle_frame(&frame(), &[], at(n / 10));
        }
        assert!(!fx.recorder.is_recording());

        // 6s after the episode started: still inside the 30s window.
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(6));
        assert_eq!(action, RecordingAction::None);

        // Window elapsed: a new episode may begin.
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(30));
        assert!(matches!(action, RecordingAction::Started { .. }));
        assert_eq!(fx.probe.opened.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn short_cooldown_never_suppresses_after_episode_end() {
        // cooldown <= record_seconds: by the time an episode ends, the window
        // measured from its start has already elapsed.
        let mut fx = fixture(2);
        fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        for n in 1..=50 {
            fx.recorder.handle_frame(&frame(), &[], at(n / 10));
        }
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(5));
        assert!(matches!(action, RecordingAction::Started { .. }));
    }

    #[test]
    fn sink_open_failure_aborts_without_arming_cooldown() {
        let mut fx = fixture(30);
        fx.probe.fail_open.store(true, Ordering::Relaxed);

        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        assert_eq!(action, RecordingAction::Aborted);
        assert!(!fx.recorder.is_recording());
        assert!(!fx.recorder.in_cooldown(at(0)));
        assert!(fx.store.puts.lock().unwrap().is_empty(), "no snapshot upload");

        // The very next qualifying detection gets a fresh attempt.
        fx.probe.fail_open.store(false, Ordering::Relaxed);
        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(1));
        assert!(matches!(action, RecordingAction::Started { .. }));
    }

    #[test]
    fn snapshot_upload_failure_does_not_stop_the_episode() {
        let mut fx = fixture(30);
        fx.store.fail.store(true, Ordering::Relaxed);

        let action = fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        assert!(matches!(action, RecordingAction::Started { .. }));
        assert!(fx.recorder.is_recording());
    }

    #[test]
    fn snapshot_scratch_file_is_cleaned_up() {
        let mut fx = fixture(30);
        fx.recorder.handle_frame(&frame(), &[person(0.9)], at(0));
        let leftovers: Vec<_> = fs::read_dir(fx._scratch.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
