use std::fs::File;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use enc_bus::frame::PixelFormat;
use frame_relay::host::{FrameFlags, HostSource, VideoInfo};
use frame_relay::{EncodeJob, RunStatus, run_pipeline};

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

/// Stand-in frame source for driving a real encoder without a host
/// application attached: a moving gradient at 640x360, 24fps.
struct SyntheticHost {
    frame_count: usize,
    scratch: Vec<u8>,
}

impl SyntheticHost {
    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 360;

    fn new(frame_count: usize) -> Self {
        Self { frame_count, scratch: Vec::new() }
    }
}

impl HostSource for SyntheticHost {
    fn video_info(&self) -> VideoInfo {
        VideoInfo {
            width: Self::WIDTH,
            height: Self::HEIGHT,
            fps_num: 24,
            fps_den: 1,
            frame_count: self.frame_count,
            interlaced: false,
            audio: None,
        }
    }

    fn fetch_frame(&mut self, index: usize, format: PixelFormat) -> Option<&[u8]> {
        let (w, h) = (Self::WIDTH as usize, Self::HEIGHT as usize);
        match format {
            PixelFormat::Yuy2 => {
                self.scratch.resize(w * h * 2, 0);
                for y in 0..h {
                    let row = &mut self.scratch[y * w * 2..][..w * 2];
                    for x in 0..w {
                        row[x * 2] = (x + y + index * 4) as u8;
                        row[x * 2 + 1] = 128;
                    }
                }
            }
            PixelFormat::Yc48 => {
                self.scratch.resize(w * h * 6, 0);
                for y in 0..h {
                    let row = &mut self.scratch[y * w * 6..][..w * 6];
                    for x in 0..w {
                        let luma = (((x + y + index * 4) % 256) * 16) as i16;
                        row[x * 6..x * 6 + 2].copy_from_slice(&luma.to_le_bytes());
                        row[x * 6 + 2..x * 6 + 4].copy_from_slice(&0i16.to_le_bytes());
                        row[x * 6 + 4..x * 6 + 6].copy_from_slice(&0i16.to_le_bytes());
                    }
                }
            }
            _ => return None,
        }
        Some(&self.scratch)
    }

    fn frame_flags(&self, _index: usize) -> FrameFlags {
        FrameFlags::default()
    }

    fn abort_requested(&self) -> bool {
        false
    }

    fn report_progress(&self, current: usize, total: usize) {
        log::info!("frame {current} / {total}");
    }
}

async fn run() -> anyhow::Result<i32> {
    let mut args = std::env::args().skip(1);
    let Some(job_path) = args.next() else {
        eprintln!("usage: frame-relay <job.json> [frame-count]");
        return Ok(2);
    };
    let frame_count: usize = match args.next() {
        Some(n) => n.parse().context("frame count must be a number")?,
        None => 240,
    };

    let job: EncodeJob = serde_json::from_reader(
        File::open(&job_path).with_context(|| format!("opening {job_path}"))?,
    )
    .with_context(|| format!("parsing {job_path}"))?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let mut host = SyntheticHost::new(frame_count);
    match run_pipeline(&job, &mut host, None, None, cancel).await {
        Ok(report) => {
            log::info!(
                "{} frames published, {} dropped, encoder exit {:?}",
                report.frames_published,
                report.drop_count,
                report.encoder_exit
            );
            Ok(match report.status {
                RunStatus::Completed => 0,
                RunStatus::Aborted => 3,
            })
        }
        Err(e) => {
            log::error!("run failed: {e}");
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let code = run().await.unwrap_or_else(|e| {
        eprintln!("error: {e:#}");
        1
    });
    std::process::exit(code)
}
