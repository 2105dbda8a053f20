use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use enc_bus::frame::{FrameGeometry, PixelFormat};
use enc_bus::process::EncoderCommand;

use crate::host::VideoInfo;

fn default_channel_key() -> String {
    "frame-relay".to_string()
}

fn default_relay_interval() -> u32 {
    8
}

fn default_slot_wait_ms() -> u64 {
    500
}

fn default_join_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// One encode job, constructed once and shared by reference for the whole
/// run. Command-line construction for the encoder is the caller's business;
/// the job carries the finished program and arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct EncodeJob {
    pub encoder: EncoderSpec,
    /// The encoder's output file; only used here to derive the default
    /// timecode file name and for log lines.
    pub output: PathBuf,
    #[serde(default = "default_channel_key")]
    pub channel_key: String,
    #[serde(default)]
    pub field_shift: bool,
    #[serde(default)]
    pub high_depth: bool,
    #[serde(default)]
    pub full_chroma: bool,
    /// Write a timecode file here even outside field-shift mode.
    #[serde(default)]
    pub timecode_path: Option<PathBuf>,
    #[serde(default)]
    pub delay_comp_frames: u32,
    /// Verdict of the frame-count heuristic selecting the field-shift
    /// delay-compensation multiplier; computed by the delay-cut layer.
    #[serde(default)]
    pub near_24fps: bool,
    /// Serve progress and the audio rendezvous every this many frames.
    #[serde(default = "default_relay_interval")]
    pub relay_interval: u32,
    #[serde(default = "default_slot_wait_ms")]
    pub slot_wait_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl EncodeJob {
    /// Host-side input format: high-depth and full-chroma targets are fed
    /// from packed Yc48, everything else from Yuy2.
    pub fn source_format(&self) -> PixelFormat {
        if self.high_depth || self.full_chroma {
            PixelFormat::Yc48
        } else {
            PixelFormat::Yuy2
        }
    }

    pub fn target_format(&self) -> PixelFormat {
        if self.full_chroma {
            PixelFormat::Yuv444P16
        } else if self.high_depth {
            PixelFormat::P010
        } else {
            PixelFormat::Nv12
        }
    }

    pub fn geometry(&self, info: &VideoInfo) -> FrameGeometry {
        FrameGeometry {
            width: info.width,
            height: info.height,
            source: self.source_format(),
            target: self.target_format(),
            interlaced: info.interlaced,
        }
    }

    pub fn encoder_command(&self) -> EncoderCommand {
        EncoderCommand {
            program: self.encoder.program.clone(),
            args: self.encoder.args.clone(),
            work_dir: self.encoder.work_dir.clone(),
        }
    }

    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms.max(1))
    }

    pub fn resolved_timecode_path(&self) -> PathBuf {
        match &self.timecode_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.output.clone().into_os_string();
                name.push(".timecode.txt");
                PathBuf::from(name)
            }
        }
    }
}
