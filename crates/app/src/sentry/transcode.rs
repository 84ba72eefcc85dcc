//! FFmpeg-backed clip conversion boundary.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Converts a raw clip into a web-playable container, returning the output
/// path. Invoked off the pipeline thread; a failure abandons the clip.
pub(crate) trait Transcoder: Send {
    fn transcode(&self, input: &Path) -> Result<PathBuf>;
}

/// Synchronous ffmpeg invocation producing an H.264 MP4 without audio.
pub(crate) struct FfmpegTranscoder {
    preset: String,
    crf: u8,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            crf: 28,
        }
    }
}

impl FfmpegTranscoder {
    fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-an".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, input: &Path) -> Result<PathBuf> {
        let output = input.with_extension("mp4");
        let args = self.build_args(input, &output);
        debug!("running ffmpeg {}", args.join(" "));

        let status = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .context("failed to launch ffmpeg")?;

        if !status.success() {
            bail!("ffmpeg exited with {status} for {}", input.display());
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_encode_h264_without_audio() {
        let transcoder = FfmpegTranscoder::default();
        let args = transcoder.build_args(Path::new("/tmp/evt.avi"), Path::new("/tmp/evt.mp4"));
        assert!(args.contains(&"-c:v".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"veryfast".to_string()));
        assert!(args.contains(&"28".to_string()));
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/evt.mp4");
    }

    #[test]
    fn output_lands_next_to_input() {
        let transcoder = FfmpegTranscoder::default();
        let args = transcoder.build_args(Path::new("/scratch/evt_1.avi"), Path::new("/scratch/evt_1.mp4"));
        let input_pos = args.iter().position(|a| a == "/scratch/evt_1.avi").unwrap();
        assert_eq!(args[input_pos - 1], "-i");
    }
}
