use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{EncodeJob, EncoderSpec};
use crate::host::{AdjustedFrame, AudioInfo, FrameFlags, HostSource, VideoInfo};
use enc_bus::frame::PixelFormat;

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;
/// Payload bytes of one nv12 frame at 16x16 as forwarded by the feed.
const FRAME_BYTES: usize = (WIDTH * HEIGHT * 3 / 2) as usize;

fn tmp(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("frame-relay-drv-{}-{}", name, std::process::id()))
}

fn cat_job(out: &Path) -> EncodeJob {
    EncodeJob {
        encoder: EncoderSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), format!("cat > '{}'", out.display())],
            work_dir: None,
        },
        output: out.to_path_buf(),
        channel_key: "test".to_string(),
        field_shift: false,
        high_depth: false,
        full_chroma: false,
        timecode_path: None,
        delay_comp_frames: 0,
        near_24fps: false,
        relay_interval: 8,
        slot_wait_ms: 100,
        join_timeout_ms: 10_000,
    }
}

struct TestHost {
    frame_count: usize,
    copy_frames: Vec<usize>,
    scratch: Vec<u8>,
    fetches: usize,
    abort_after_fetches: Option<usize>,
    abort: Arc<AtomicBool>,
    previews: Arc<AtomicUsize>,
    audio: Option<Vec<u8>>,
    audio_window: Vec<u8>,
}

impl TestHost {
    fn new(frame_count: usize) -> Self {
        Self {
            frame_count,
            copy_frames: Vec::new(),
            scratch: Vec::new(),
            fetches: 0,
            abort_after_fetches: None,
            abort: Arc::new(AtomicBool::new(false)),
            previews: Arc::new(AtomicUsize::new(0)),
            audio: None,
            audio_window: Vec::new(),
        }
    }

    fn with_audio(mut self, samples: usize) -> Self {
        self.audio = Some((0..samples * 2).map(|i| (i % 251) as u8).collect());
        self
    }
}

impl HostSource for TestHost {
    fn video_info(&self) -> VideoInfo {
        VideoInfo {
            width: WIDTH,
            height: HEIGHT,
            fps_num: 24,
            fps_den: 1,
            frame_count: self.frame_count,
            interlaced: false,
            audio: self.audio.as_ref().map(|data| AudioInfo {
                sample_bytes: 2,
                total_samples: (data.len() / 2) as u64,
            }),
        }
    }

    fn fetch_frame(&mut self, index: usize, format: PixelFormat) -> Option<&[u8]> {
        assert_eq!(format, PixelFormat::Yuy2);
        self.fetches += 1;
        self.scratch = vec![index as u8; (WIDTH * HEIGHT * 2) as usize];
        Some(&self.scratch)
    }

    fn frame_flags(&self, index: usize) -> FrameFlags {
        FrameFlags { copy_frame: self.copy_frames.contains(&index) }
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
            || self
                .abort_after_fetches
                .is_some_and(|n| self.fetches >= n)
    }

    fn update_preview(&mut self) {
        self.previews.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch_audio(&mut self, start: u64, count: usize) -> Option<(&[u8], usize)> {
        let data = self.audio.as_ref()?;
        let total = data.len() / 2;
        let start = (start as usize).min(total);
        let got = count.min(total - start);
        self.audio_window = data[start * 2..(start + got) * 2].to_vec();
        Some((&self.audio_window, got))
    }
}

struct ScriptEngine {
    script: Vec<(bool, i32)>,
    scratch: Vec<u8>,
}

impl crate::host::FieldShiftEngine for ScriptEngine {
    fn adjusted_frame(&mut self, index: usize) -> Option<AdjustedFrame<'_>> {
        let (dropped, jitter) = *self.script.get(index)?;
        self.scratch = vec![index as u8; (WIDTH * HEIGHT * 2) as usize];
        Some(AdjustedFrame { data: &self.scratch, dropped, jitter })
    }
}

#[tokio::test]
async fn frames_reach_the_encoder_byte_for_byte() -> anyhow::Result<()> {
    let out = tmp("plain");
    let job = cat_job(&out);
    let mut host = TestHost::new(10);
    let previews = host.previews.clone();

    let report = run_pipeline(&job, &mut host, None, None, CancellationToken::new()).await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.frames_published, 10);
    assert_eq!(report.drop_count, 0);
    assert_eq!(report.encoder_exit, Some(0));
    assert_eq!(report.timecode_lines, None);
    assert_eq!(previews.load(Ordering::SeqCst), 10);

    let written = std::fs::read(&out)?;
    assert_eq!(written.len(), 10 * FRAME_BYTES);
    std::fs::remove_file(&out).ok();
    Ok(())
}

#[tokio::test]
async fn copy_flagged_frame_republishes_previous_pixels() -> anyhow::Result<()> {
    let out = tmp("copy");
    let job = cat_job(&out);
    let mut host = TestHost::new(3);
    host.copy_frames = vec![1];

    let report = run_pipeline(&job, &mut host, None, None, CancellationToken::new()).await?;
    assert_eq!(report.frames_published, 3);
    // The host is still asked for the frame even when conversion is skipped.
    assert_eq!(host.fetches, 3);

    let written = std::fs::read(&out)?;
    assert_eq!(written.len(), 3 * FRAME_BYTES);
    let (first, rest) = written.split_at(FRAME_BYTES);
    let (second, third) = rest.split_at(FRAME_BYTES);
    assert_eq!(first, second, "copy frame must repeat the previous payload");
    assert!(third.iter().all(|&b| b == 2));
    std::fs::remove_file(&out).ok();
    Ok(())
}

#[tokio::test]
async fn field_shift_drops_and_writes_timecode() -> anyhow::Result<()> {
    let out = tmp("afs");
    let tc = tmp("afs-tc");
    let mut job = cat_job(&out);
    job.field_shift = true;
    job.timecode_path = Some(tc.clone());
    let mut host = TestHost::new(5);
    let mut engine = ScriptEngine {
        script: vec![(false, 0), (false, 1), (true, 0), (false, -1), (false, 0)],
        scratch: Vec::new(),
    };

    let report = run_pipeline(
        &job,
        &mut host,
        Some(&mut engine),
        None,
        CancellationToken::new(),
    )
    .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.frames_published, 4);
    assert_eq!(report.drop_count, 1);
    assert_eq!(report.timecode_lines, Some(4));

    let written = std::fs::read(&out)?;
    assert_eq!(written.len(), 4 * FRAME_BYTES);

    let timecode = std::fs::read_to_string(&tc)?;
    let lines: Vec<&str> = timecode.split("\r\n").filter(|l| !l.is_empty()).collect();
    assert_eq!(
        lines,
        vec![
            "# timecode format v2",
            "0.000000",
            "52.083333",
            "114.583333",
            "166.666667",
        ]
    );
    std::fs::remove_file(&out).ok();
    std::fs::remove_file(&tc).ok();
    Ok(())
}

#[tokio::test]
async fn host_abort_stops_early_but_cleans_up() -> anyhow::Result<()> {
    let out = tmp("abort");
    let job = cat_job(&out);
    let mut host = TestHost::new(100);
    host.abort_after_fetches = Some(3);

    let report = run_pipeline(&job, &mut host, None, None, CancellationToken::new()).await?;
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.frames_published, 3);
    // Cleanup still ran: the encoder was joined and flushed what it received.
    assert_eq!(report.encoder_exit, Some(0));
    let written = std::fs::read(&out)?;
    assert_eq!(written.len(), 3 * FRAME_BYTES);
    std::fs::remove_file(&out).ok();
    Ok(())
}

#[tokio::test]
async fn dead_encoder_is_a_distinct_failure() -> anyhow::Result<()> {
    let out = tmp("dead");
    let mut job = cat_job(&out);
    job.encoder.args = vec!["-c".to_string(), "exit 3".to_string()];
    let mut host = TestHost::new(50);

    let result = run_pipeline(&job, &mut host, None, None, CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(RunError::Process(enc_bus::process::ProcessError::DiedUnexpectedly { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn audio_rides_along_and_drains_at_shutdown() -> anyhow::Result<()> {
    let out = tmp("audio");
    let job = cat_job(&out);
    let mut host = TestHost::new(20).with_audio(1000);
    let expected = host.audio.clone().unwrap();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let worker: AudioWorker = Box::new(move |mut feed| {
        tokio::spawn(async move {
            let mut start = 0u64;
            loop {
                let Some(chunk) = feed.request(start, 256).await else { break };
                if chunk.samples == 0 {
                    break;
                }
                sink.lock().unwrap().extend_from_slice(&chunk.data);
                start += chunk.samples as u64;
                if chunk.aborted {
                    break;
                }
            }
            Ok(())
        })
    });

    let report =
        run_pipeline(&job, &mut host, None, Some(worker), CancellationToken::new()).await?;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*collected.lock().unwrap(), expected);
    std::fs::remove_file(&out).ok();
    Ok(())
}

#[tokio::test]
async fn field_shift_rejects_interlaced_targets() {
    let out = tmp("badcfg");
    let mut job = cat_job(&out);
    job.field_shift = true;

    struct InterlacedHost(TestHost);
    impl HostSource for InterlacedHost {
        fn video_info(&self) -> VideoInfo {
            VideoInfo { interlaced: true, ..self.0.video_info() }
        }
        fn fetch_frame(&mut self, index: usize, format: PixelFormat) -> Option<&[u8]> {
            self.0.fetch_frame(index, format)
        }
        fn frame_flags(&self, index: usize) -> FrameFlags {
            self.0.frame_flags(index)
        }
        fn abort_requested(&self) -> bool {
            self.0.abort_requested()
        }
    }

    let mut host = InterlacedHost(TestHost::new(5));
    let result = run_pipeline(&job, &mut host, None, None, CancellationToken::new()).await;
    assert!(matches!(result, Err(RunError::FieldShiftInterlaced)));
}
