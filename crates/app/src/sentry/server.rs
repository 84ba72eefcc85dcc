//! Actix Web server exposing the live MJPEG stream and detection APIs.
//!
//! The server runs on a dedicated thread so the pipeline hot path never
//! touches the Actix runtime. Every stream client pulls its own sequence from
//! the frame hub; a disconnecting client tears down only its own stream.

use std::time::Duration;

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::error;

use crate::sentry::{
    data::{DetectionsResponse, FrameHub},
    telemetry,
};

/// Poll interval for the stream generator; doubles as the idle backoff
/// before the first frame arrives.
const STREAM_TICK: Duration = Duration::from_millis(33);

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    hub: FrameHub,
}

#[derive(Default)]
/// Handle for the stream server thread.
pub(crate) struct StreamServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StreamServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the stream server thread and return a handle that can stop it.
pub(crate) fn spawn_stream_server(hub: FrameHub, bind_addr: &str) -> Result<StreamServer> {
    let bind_addr = bind_addr.to_string();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("sentry-stream-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState { hub: hub.clone() }))
                        .route("/stream.mjpg", web::get().to(stream_handler))
                        .route("/frame.jpg", web::get().to(frame_handler))
                        .route("/detections", web::get().to(detections_handler))
                        .route("/healthz", web::get().to(healthz_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(bind_addr.as_str())?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn stream server thread")?;
    Ok(StreamServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Frame a JPEG as one part of the multipart stream.
fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 48);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Pull the next unseen frame for this client's cursor, if one is available.
fn next_chunk(hub: &FrameHub, last_seq: &mut Option<u64>) -> Option<Bytes> {
    let packet = hub.snapshot()?;
    if *last_seq == Some(packet.frame_number) {
        return None;
    }
    *last_seq = Some(packet.frame_number);
    Some(multipart_chunk(&packet.jpeg))
}

/// Stream the MJPEG feed over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let hub = state.hub.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_TICK);
        let mut last_seq: Option<u64> = None;
        loop {
            interval.tick().await;
            if let Some(chunk) = next_chunk(&hub, &mut last_seq) {
                yield Ok::<Bytes, actix_web::Error>(chunk);
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Return the latest frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.hub.snapshot() {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Return the most recent detection snapshot as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.hub.snapshot() {
        Some(packet) => HttpResponse::Ok()
            .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
            .json(DetectionsResponse {
                timestamp_ms: packet.timestamp_ms,
                frame_number: packet.frame_number,
                fps: packet.fps,
                detections: &packet.detections,
            }),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn healthz_handler() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

/// Render Prometheus metrics.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

#[cfg(test)]
mod tests {
    use crate::sentry::data::FramePacket;

    use super::*;

    fn packet(frame_number: u64, jpeg: &[u8]) -> FramePacket {
        FramePacket {
            jpeg: jpeg.to_vec(),
            detections: Vec::new(),
            timestamp_ms: frame_number as i64,
            frame_number,
            fps: 10.0,
        }
    }

    #[test]
    fn chunks_carry_boundary_and_content_type() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = chunk.to_vec();
        assert!(text.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with(b"\xFF\xD8\xFF\xD9\r\n"));
    }

    #[test]
    fn cursor_emits_each_frame_once() {
        let hub = FrameHub::new();
        let mut last_seq = None;

        assert!(next_chunk(&hub, &mut last_seq).is_none(), "empty hub is idle");

        hub.publish(packet(1, b"one"));
        assert!(next_chunk(&hub, &mut last_seq).is_some());
        assert!(
            next_chunk(&hub, &mut last_seq).is_none(),
            "unchanged frame is not re-sent"
        );

        hub.publish(packet(2, b"two"));
        assert!(next_chunk(&hub, &mut last_seq).is_some());
    }

    #[test]
    fn client_cursors_are_independent() {
        let hub = FrameHub::new();
        let mut client_a = None;
        let mut client_b = None;

        hub.publish(packet(1, b"one"));
        assert!(next_chunk(&hub, &mut client_a).is_some());

        // A second client joining late still receives the current frame,
        // and neither cursor disturbs the other.
        assert!(next_chunk(&hub, &mut client_b).is_some());
        assert!(next_chunk(&hub, &mut client_a).is_none());

        hub.publish(packet(2, b"two"));
        assert!(next_chunk(&hub, &mut client_b).is_some());
        assert!(next_chunk(&hub, &mut client_a).is_some());
    }
}
