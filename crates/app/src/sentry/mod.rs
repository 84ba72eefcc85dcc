//! Detection-triggered recording pipeline: captures a camera stream, watches
//! for people, records bounded episodes with snapshot/clip uploads, and
//! republishes the live feed over HTTP.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Orchestrates the capture → detect → record → publish loop.
//! - `recorder`: Episode state machine and video sink handling.
//! - `artifacts`: Clip transcode/upload worker.
//! - `storage`: Blob store boundary for artifact uploads.
//! - `transcode`: FFmpeg clip conversion boundary.
//! - `annotate`: Detection overlays and JPEG encoding.
//! - `server`: Actix Web live stream endpoints.
//! - `data`: Shared frame hub and packet types.

pub use config::SentryConfig;
pub use pipeline::run;

mod annotate;
mod artifacts;
mod config;
mod data;
mod pipeline;
mod recorder;
mod server;
mod storage;
mod telemetry;
mod transcode;
