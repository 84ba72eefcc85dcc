use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Clone)]
/// Fully processed frame as served to stream clients.
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

#[derive(Clone, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) score: f32,
    pub(crate) bbox: [f32; 4],
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) detections: &'a [DetectionSummary],
}

/// Single-slot most-recent-frame buffer shared between the pipeline thread
/// and stream clients. Writers replace the slot; readers copy it out. The
/// lock is held only for the copy, never across I/O.
#[derive(Clone, Default)]
pub(crate) struct FrameHub {
    slot: Arc<Mutex<Option<FramePacket>>>,
}

impl FrameHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with the newest frame.
    pub(crate) fn publish(&self, packet: FramePacket) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(packet);
        }
    }

    /// Copy out the most recently published frame, if any.
    pub(crate) fn snapshot(&self) -> Option<FramePacket> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn packet(frame_number: u64, fill: u8, len: usize) -> FramePacket {
        FramePacket {
            jpeg: vec![fill; len],
            detections: Vec::new(),
            timestamp_ms: frame_number as i64,
            frame_number,
            fps: 10.0,
        }
    }

    #[test]
    fn snapshot_is_empty_before_first_publish() {
        let hub = FrameHub::new();
        assert!(hub.snapshot().is_none());
    }

    #[test]
    fn snapshot_returns_latest_publish() {
        let hub = FrameHub::new();
        hub.publish(packet(1, 0x11, 16));
        hub.publish(packet(2, 0x22, 16));
        let snap = hub.snapshot().unwrap();
        assert_eq!(snap.frame_number, 2);
        assert!(snap.jpeg.iter().all(|b| *b == 0x22));
    }

    #[test]
    fn detections_response_serializes_for_the_api() {
        let packet = FramePacket {
            jpeg: Vec::new(),
            detections: vec![DetectionSummary {
                class: "PERSON".to_string(),
                score: 0.87,
                bbox: [10.0, 20.0, 30.0, 40.0],
            }],
            timestamp_ms: 1_700_000_000_000,
            frame_number: 42,
            fps: 9.8,
        };
        let json = serde_json::to_string(&DetectionsResponse {
            timestamp_ms: packet.timestamp_ms,
            frame_number: packet.frame_number,
            fps: packet.fps,
            detections: &packet.detections,
        })
        .unwrap();
        assert!(json.contains("\"frame_number\":42"));
        assert!(json.contains("\"class\":\"PERSON\""));
    }

    #[test]
    fn concurrent_readers_never_observe_torn_frames() {
        let hub = FrameHub::new();
        hub.publish(packet(0, 0, 4096));

        let writer = {
            let hub = hub.clone();
            thread::spawn(move || {
                for n in 1..=2_000u64 {
                    hub.publish(packet(n, (n % 251) as u8, 4096));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let hub = hub.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = hub.snapshot().unwrap();
                        let first = snap.jpeg[0];
                        assert!(
                            snap.jpeg.iter().all(|b| *b == first),
                            "torn frame observed at #{}",
                            snap.frame_number
                        );
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
