use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct SentryConfig {
    /// Camera stream URL or local device identifier.
    pub camera_uri: String,
    /// TorchScript model path used by the detector.
    pub model_path: PathBuf,
    /// Capture width in pixels.
    pub width: i32,
    /// Capture height in pixels.
    pub height: i32,
    /// Nominal capture rate, also the clip frame rate.
    pub fps: u32,
    /// Clip length per episode in seconds.
    pub record_seconds: u32,
    /// Cooldown window, measured from episode start.
    pub cooldown_seconds: u32,
    /// Confidence threshold for a qualifying detection.
    pub confidence: f32,
    /// Detector class id treated as a person.
    pub person_class: i64,
    /// Consecutive read failures before a full reconnect.
    pub reconnect_after: u32,
    /// Delay between connection attempts.
    pub retry_interval_secs: u64,
    /// JPEG quality used for the stream and snapshots.
    pub jpeg_quality: i32,
    /// Listen address for the preview server.
    pub bind_addr: String,
    /// Scratch directory for in-flight episode artifacts.
    pub scratch_dir: PathBuf,
    /// Key prefix for uploaded artifacts.
    pub key_prefix: String,
    /// Force CPU inference.
    pub use_cpu: bool,
    /// Emit verbose logging (per-frame detections).
    pub verbose: bool,
}

const USAGE: &str = "Usage: sentrycam [--source <uri>] [--model <path>] \
[--width <px>] [--height <px>] [--fps <n>] [--record-seconds <n>] \
[--cooldown-seconds <n>] [--confidence <0-1>] [--person-class <id>] \
[--reconnect-after <n>] [--retry-interval <secs>] [--jpeg-quality <1-100>] \
[--bind <addr:port>] [--scratch-dir <path>] [--key-prefix <prefix>] \
[--cpu] [--verbose]\n\nPositional form is also supported: \
sentrycam <camera-uri> <model-path> [...flags...]";

impl SentryConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            bail!(USAGE);
        }

        let mut camera_uri: Option<String> = None;
        let mut model_path: Option<PathBuf> = None;
        let mut width: Option<i32> = None;
        let mut height: Option<i32> = None;
        let mut fps: Option<u32> = None;
        let mut record_seconds: Option<u32> = None;
        let mut cooldown_seconds: Option<u32> = None;
        let mut confidence: Option<f32> = None;
        let mut person_class: Option<i64> = None;
        let mut reconnect_after: Option<u32> = None;
        let mut retry_interval_secs: Option<u64> = None;
        let mut jpeg_quality: Option<i32> = None;
        let mut bind_addr: Option<String> = None;
        let mut scratch_dir: Option<PathBuf> = None;
        let mut key_prefix: Option<String> = None;
        let mut use_cpu = false;
        let mut verbose = false;
        let mut positional: Vec<String> = Vec::new();

        let mut idx = 1;
        while idx < args.len() {
            match args[idx].as_str() {
                "--source" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--source requires a value"))?
                        .clone();
                    camera_uri = Some(value);
                    idx += 1;
                }
                "--model" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--model requires a value"))?
                        .clone();
                    model_path = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--width" => {
                    idx += 1;
                    width = Some(parse_positive(args.get(idx), "--width")?);
                    idx += 1;
                }
                "--height" => {
                    idx += 1;
                    height = Some(parse_positive(args.get(idx), "--height")?);
                    idx += 1;
                }
                "--fps" => {
                    idx += 1;
                    let value = parse_positive(args.get(idx), "--fps")?;
                    fps = Some(value as u32);
                    idx += 1;
                }
                "--record-seconds" => {
                    idx += 1;
                    let value = parse_positive(args.get(idx), "--record-seconds")?;
                    record_seconds = Some(value as u32);
                    idx += 1;
                }
                "--cooldown-seconds" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--cooldown-seconds requires a value"))?
                        .parse::<u32>()
                        .with_context(|| "--cooldown-seconds must be an integer".to_string())?;
                    cooldown_seconds = Some(value);
                    idx += 1;
                }
                "--confidence" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--confidence requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--confidence must be a number".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--confidence must be between 0 and 1");
                    }
                    confidence = Some(value);
                    idx += 1;
                }
                "--person-class" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--person-class requires a value"))?
                        .parse::<i64>()
                        .with_context(|| "--person-class must be an integer".to_string())?;
                    person_class = Some(value);
                    idx += 1;
                }
                "--reconnect-after" => {
                    idx += 1;
                    let value = parse_positive(args.get(idx), "--reconnect-after")?;
                    reconnect_after = Some(value as u32);
                    idx += 1;
                }
                "--retry-interval" => {
                    idx += 1;
                    let value = parse_positive(args.get(idx), "--retry-interval")?;
                    retry_interval_secs = Some(value as u64);
                    idx += 1;
                }
                "--jpeg-quality" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--jpeg-quality requires a value"))?
                        .parse::<i32>()
                        .with_context(|| {
                            "--jpeg-quality must be an integer between 1 and 100".to_string()
                        })?;
                    if !(1..=100).contains(&value) {
                        bail!("--jpeg-quality must be an integer between 1 and 100");
                    }
                    jpeg_quality = Some(value);
                    idx += 1;
                }
                "--bind" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--bind requires a value"))?
                        .clone();
                    bind_addr = Some(value);
                    idx += 1;
                }
                "--scratch-dir" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--scratch-dir requires a value"))?
                        .clone();
                    scratch_dir = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--key-prefix" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--key-prefix requires a value"))?
                        .clone();
                    key_prefix = Some(value);
                    idx += 1;
                }
                "--cpu" => {
                    use_cpu = true;
                    idx += 1;
                }
                "--verbose" => {
                    verbose = true;
                    idx += 1;
                }
                arg if arg.starts_with('-') => {
                    bail!("Unrecognised flag: {arg}");
                }
                other => {
                    positional.push(other.to_string());
                    idx += 1;
                }
            }
        }

        let mut positional = positional.into_iter();
        if camera_uri.is_none() {
            camera_uri = positional.next();
        }
        if model_path.is_none() {
            if let Some(path) = positional.next() {
                model_path = Some(PathBuf::from(path));
            }
        }

        let camera_uri = camera_uri.ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <camera-uri>.")
        })?;
        let model_path = model_path.ok_or_else(|| {
            anyhow!("Missing model path. Provide --model <path> or positional <model-path>.")
        })?;

        Ok(Self {
            camera_uri,
            model_path,
            width: width.unwrap_or(416),
            height: height.unwrap_or(320),
            fps: fps.unwrap_or(10),
            record_seconds: record_seconds.unwrap_or(5),
            cooldown_seconds: cooldown_seconds.unwrap_or(30),
            confidence: confidence.unwrap_or(0.5),
            person_class: person_class.unwrap_or(0),
            reconnect_after: reconnect_after.unwrap_or(30),
            retry_interval_secs: retry_interval_secs.unwrap_or(3),
            jpeg_quality: jpeg_quality.unwrap_or(85),
            bind_addr: bind_addr.unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            scratch_dir: scratch_dir.unwrap_or_else(std::env::temp_dir),
            key_prefix: key_prefix.unwrap_or_else(|| "events".to_string()),
            use_cpu,
            verbose,
        })
    }
}

fn parse_positive(value: Option<&String>, flag: &str) -> Result<i32> {
    let value = value
        .ok_or_else(|| anyhow!("{flag} requires a value"))?
        .parse::<i32>()
        .with_context(|| format!("{flag} must be a positive integer"))?;
    if value <= 0 {
        bail!("{flag} must be a positive integer");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        std::iter::once("sentrycam")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn positional_source_and_model() {
        let config =
            SentryConfig::from_args(&args(&["http://10.0.0.7/stream", "yolo.pt"])).unwrap();
        assert_eq!(config.camera_uri, "http://10.0.0.7/stream");
        assert_eq!(config.model_path, PathBuf::from("yolo.pt"));
        assert_eq!(config.width, 416);
        assert_eq!(config.height, 320);
        assert_eq!(config.fps, 10);
        assert_eq!(config.record_seconds, 5);
        assert_eq!(config.cooldown_seconds, 30);
    }

    #[test]
    fn flags_override_defaults() {
        let config = SentryConfig::from_args(&args(&[
            "--source",
            "rtsp://cam/live",
            "--model",
            "model.pt",
            "--fps",
            "15",
            "--record-seconds",
            "8",
            "--cooldown-seconds",
            "60",
            "--confidence",
            "0.7",
            "--cpu",
        ]))
        .unwrap();
        assert_eq!(config.fps, 15);
        assert_eq!(config.record_seconds, 8);
        assert_eq!(config.cooldown_seconds, 60);
        assert!((config.confidence - 0.7).abs() < f32::EPSILON);
        assert!(config.use_cpu);
    }

    #[test]
    fn missing_source_is_an_error() {
        assert!(SentryConfig::from_args(&args(&["--model", "model.pt"])).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(
            SentryConfig::from_args(&args(&["cam", "m.pt", "--jpeg-quality", "0"])).is_err()
        );
        assert!(
            SentryConfig::from_args(&args(&["cam", "m.pt", "--confidence", "1.5"])).is_err()
        );
        assert!(SentryConfig::from_args(&args(&["cam", "m.pt", "--fps", "0"])).is_err());
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(SentryConfig::from_args(&args(&["cam", "m.pt", "--what"])).is_err());
    }
}
