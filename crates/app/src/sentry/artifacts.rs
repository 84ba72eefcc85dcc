//! Clip finishing worker: transcodes a finished episode's raw clip and
//! uploads it, keeping failures away from the pipeline thread.

use std::{fs, path::PathBuf, sync::Arc, thread, time::Instant};

use crossbeam_channel::Receiver;
use tracing::{error, info};

use crate::sentry::{storage::BlobStore, telemetry, transcode::Transcoder};

/// Finished episode clip awaiting transcode + upload. Each episode produces
/// at most one job.
pub(crate) struct ClipJob {
    pub(crate) episode_id: String,
    pub(crate) raw_path: PathBuf,
}

/// Spawn the worker thread that drains clip jobs until the channel closes.
pub(crate) fn spawn_clip_worker(
    clip_rx: Receiver<ClipJob>,
    store: Arc<dyn BlobStore>,
    transcoder: Box<dyn Transcoder>,
    key_prefix: String,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("sentry-artifacts", move || {
        for job in clip_rx {
            process_clip(&job, store.as_ref(), transcoder.as_ref(), &key_prefix);
        }
    })
    .expect("failed to spawn artifact worker")
}

/// Transcode and upload one clip. Failures are logged and the clip is
/// abandoned; scratch files are removed on every outcome so disk usage stays
/// bounded to the in-flight episode.
fn process_clip(
    job: &ClipJob,
    store: &dyn BlobStore,
    transcoder: &dyn Transcoder,
    key_prefix: &str,
) {
    let started = Instant::now();

    match transcoder.transcode(&job.raw_path) {
        Ok(clip_path) => {
            metrics::histogram!("sentry_transcode_seconds")
                .record(started.elapsed().as_secs_f64());

            let key = format!("{key_prefix}/videos/{}.mp4", job.episode_id);
            match store.put_file(&clip_path, &key, "video/mp4") {
                Ok(url) => {
                    info!("clip uploaded for {}: {url}", job.episode_id);
                    metrics::counter!("sentry_clip_uploads_total").increment(1);
                }
                Err(err) => {
                    error!("clip upload failed for {}: {err:#}", job.episode_id);
                    metrics::counter!("sentry_clip_upload_failures_total").increment(1);
                }
            }

            remove_scratch(&clip_path);
        }
        Err(err) => {
            error!("transcode failed for {}: {err:#}", job.episode_id);
            metrics::counter!("sentry_transcode_failures_total").increment(1);
        }
    }

    remove_scratch(&job.raw_path);
}

fn remove_scratch(path: &std::path::Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            error!("failed to remove scratch file {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use anyhow::{Result, bail};
    use crossbeam_channel::unbounded;

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

    /// Copies the raw file to the mp4 path, or fails when told to.
    struct CopyTranscoder {
        fail: AtomicBool,
    }

    impl Transcoder for CopyTranscoder {
        fn transcode(&self, input: &Path) -> Result<PathBuf> {
            if self.fail.load(Ordering::Relaxed) {
                bail!("encoder exploded");
            }
            let output = input.with_extension("mp4");
            fs::copy(input, &output)?;
            Ok(output)
        }
    }

    fn raw_clip(dir: &Path) -> PathBuf {
        let path = dir.join("evt_20260101_120000.avi");
        fs::write(&path, b"raw clip bytes").unwrap();
        path
    }

    #[test]
    fn successful_clip_uploads_and_cleans_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let raw = raw_clip(scratch.path());
        let store = MemStore::default();
        let transcoder = CopyTranscoder {
            fail: AtomicBool::new(false),
        };
        let job = ClipJob {
            episode_id: "evt_20260101_120000".to_string(),
            raw_path: raw.clone(),
        };

        process_clip(&job, &store, &transcoder, "events");

        let puts = store.puts.lock().unwrap();
        assert_eq!(puts.as_slice(), ["events/videos/evt_20260101_120000.mp4"]);
        assert!(!raw.exists());
        assert!(!raw.with_extension("mp4").exists());
    }

    #[test]
    fn transcode_failure_abandons_clip_and_cleans_raw() {
        let scratch = tempfile::tempdir().unwrap();
        let raw = raw_clip(scratch.path());
        let store = MemStore::default();
        let transcoder = CopyTranscoder {
            fail: AtomicBool::new(true),
        };
        let job = ClipJob {
            episode_id: "evt_20260101_120000".to_string(),
            raw_path: raw.clone(),
        };

        process_clip(&job, &store, &transcoder, "events");

        assert!(store.puts.lock().unwrap().is_empty());
        assert!(!raw.exists());
    }

    #[test]
    fn upload_failure_still_cleans_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let raw = raw_clip(scratch.path());
        let store = MemStore::default();
        store.fail.store(true, Ordering::Relaxed);
        let transcoder = CopyTranscoder {
            fail: AtomicBool::new(false),
        };
        let job = ClipJob {
            episode_id: "evt_20260101_120000".to_string(),
            raw_path: raw.clone(),
        };

        process_clip(&job, &store, &transcoder, "events");

        assert!(!raw.exists());
        assert!(!raw.with_extension("mp4").exists());
    }

    #[test]
    fn worker_drains_jobs_until_channel_closes() {
        let scratch = tempfile::tempdir().unwrap();
        let raw = raw_clip(scratch.path());
        let store: Arc<MemStore> = Arc::new(MemStore::default());
        let (tx, rx) = unbounded();

        let handle = spawn_clip_worker(
            rx,
            store.clone() as Arc<dyn BlobStore>,
            Box::new(CopyTranscoder {
                fail: AtomicBool::new(false),
            }),
            "events".to_string(),
        );

        tx.send(ClipJob {
            episode_id: "evt_20260101_120000".to_string(),
            raw_path: raw,
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();

        assert_eq!(store.puts.lock().unwrap().len(), 1);
    }
}
