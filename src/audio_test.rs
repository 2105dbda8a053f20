use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::*;
use crate::host::{FrameFlags, HostSource, VideoInfo};
use enc_bus::frame::PixelFormat;

const SAMPLE_BYTES: usize = 2;

struct AudioHost {
    samples: Vec<u8>,
    window: Vec<u8>,
    abort: Arc<AtomicBool>,
}

impl AudioHost {
    fn new(total_samples: usize) -> Self {
        let samples = (0..total_samples * SAMPLE_BYTES)
            .map(|i| (i % 251) as u8)
            .collect();
        Self {
            samples,
            window: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    fn total_samples(&self) -> u64 {
        (self.samples.len() / SAMPLE_BYTES) as u64
    }
}

impl HostSource for AudioHost {
    fn video_info(&self) -> VideoInfo {
        VideoInfo {
            width: 16,
            height: 16,
            fps_num: 30,
            fps_den: 1,
            frame_count: 0,
            interlaced: false,
            audio: Some(crate::host::AudioInfo {
                sample_bytes: SAMPLE_BYTES,
                total_samples: self.total_samples(),
            }),
        }
    }

    fn fetch_frame(&mut self, _index: usize, _format: PixelFormat) -> Option<&[u8]> {
        None
    }

    fn frame_flags(&self, _index: usize) -> FrameFlags {
        FrameFlags::default()
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn fetch_audio(&mut self, start: u64, count: usize) -> Option<(&[u8], usize)> {
        let total = self.total_samples();
        let start = start.min(total) as usize;
        let got = count.min(total as usize - start);
        // Host-style transient buffer, only valid until the next call.
        self.window =
            self.samples[start * SAMPLE_BYTES..(start + got) * SAMPLE_BYTES].to_vec();
        Some((&self.window, got))
    }
}

#[tokio::test]
async fn buffer_grows_and_chunks_stay_intact() -> anyhow::Result<()> {
    let mut host = AudioHost::new(4096);
    let (mut relay, mut feed) = relay_pair(SAMPLE_BYTES);

    let worker = tokio::spawn(async move {
        let mut received = Vec::new();
        let mut start = 0u64;
        for count in [100usize, 1000, 500] {
            let chunk = feed.request(start, count).await.expect("relay alive");
            assert_eq!(chunk.samples, count);
            received.extend_from_slice(&chunk.data);
            start += chunk.samples as u64;
        }
        received
    });

    let mut capacities = Vec::new();
    for _ in 0..3 {
        let outcome = relay.service(&mut host, Duration::from_secs(1)).await?;
        assert_eq!(outcome, ServiceOutcome::Served);
        capacities.push(relay.capacity());
    }

    // Growth only: 200 -> 2000, then the larger buffer is retained.
    assert_eq!(capacities, vec![200, 2000, 2000]);

    let received = worker.await?;
    assert_eq!(received.len(), 1600 * SAMPLE_BYTES);
    assert_eq!(received, host.samples[..1600 * SAMPLE_BYTES].to_vec());
    Ok(())
}

#[tokio::test]
async fn idle_when_no_request_is_pending() -> anyhow::Result<()> {
    let mut host = AudioHost::new(64);
    let (mut relay, _feed) = relay_pair(SAMPLE_BYTES);
    let outcome = relay.service(&mut host, Duration::from_millis(20)).await?;
    assert_eq!(outcome, ServiceOutcome::Idle);
    Ok(())
}

#[tokio::test]
async fn abort_is_latched_and_propagated() -> anyhow::Result<()> {
    let mut host = AudioHost::new(512);
    let abort = host.abort.clone();
    let (mut relay, mut feed) = relay_pair(SAMPLE_BYTES);

    let worker = tokio::spawn(async move {
        let first = feed.request(0, 16).await.expect("relay alive");
        let second = feed.request(16, 16).await.expect("relay alive");
        (first.aborted, second.aborted)
    });

    relay.service(&mut host, Duration::from_secs(1)).await?;
    abort.store(true, Ordering::SeqCst);
    relay.service(&mut host, Duration::from_secs(1)).await?;

    let (first, second) = worker.await?;
    assert!(!first);
    assert!(second);
    assert!(relay.aborted());
    Ok(())
}

#[tokio::test]
async fn drain_runs_until_the_worker_is_done() -> anyhow::Result<()> {
    let mut host = AudioHost::new(1024);
    let total = host.total_samples();
    let (mut relay, mut feed) = relay_pair(SAMPLE_BYTES);

    let worker = tokio::spawn(async move {
        let mut start = 0u64;
        let mut bytes = 0usize;
        while start < total {
            let Some(chunk) = feed.request(start, 300).await else { break };
            if chunk.samples == 0 {
                break;
            }
            bytes += chunk.data.len();
            start += chunk.samples as u64;
        }
        bytes
    });

    relay.drain(&mut host).await?;
    assert!(relay.is_done());
    assert_eq!(worker.await?, 1024 * SAMPLE_BYTES);
    Ok(())
}
