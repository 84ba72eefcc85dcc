//! Object detection boundary: detection types plus the TorchScript-backed
//! production detector.

pub mod detector;

pub use detector::{DetectError, Detection, Detector, TorchDetector};

pub use tch;
