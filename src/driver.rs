use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt as _;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use enc_bus::channel::{self, ChannelParams, FrameConsumer, FrameProducer, FrameSlot, SlotWait};
use enc_bus::convert::Converter;
use enc_bus::frame::FrameGeometry;
use enc_bus::process::{EncoderProcess, ProcessError, PumpMode};
use enc_bus::simd::SimdMask;

use crate::audio::{AudioFeed, AudioRelay, relay_pair};
use crate::config::EncodeJob;
use crate::error::RunError;
use crate::host::{FieldShiftEngine, HostSource, VideoInfo};
use crate::selector::{Decision, EngineSample, FrameSelector};
use crate::timecode::{TimecodeError, TimecodeSpec, write_timecode};

/// Bounded wait for the audio rendezvous inside the frame loop.
const RELAY_WAIT: Duration = Duration::from_millis(50);
/// Diagnostics poll while blocked on the slot during shutdown.
const SHUTDOWN_PUMP: Duration = Duration::from_millis(10);
/// End-of-stream publish gives up after this many slot-wait ticks.
const FINISH_TICKS: u32 = 100;

/// Spawns the caller's audio pipeline around the relay's worker-side handle.
pub type AudioWorker = Box<dyn FnOnce(AudioFeed) -> JoinHandle<anyhow::Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Host- or user-initiated; not a failure.
    Aborted,
}

#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub frames_published: u64,
    pub drop_count: u64,
    pub encoder_exit: Option<i32>,
    pub timecode_lines: Option<u64>,
}

struct AudioTask {
    relay: AudioRelay,
    handle: JoinHandle<anyhow::Result<()>>,
}

#[derive(Default)]
struct LoopStats {
    aborted: bool,
    frames_published: u64,
    frames_fetched: u64,
    fetch_total: Duration,
}

/// Runs the whole pipeline for one job: frame loop, audio rendezvous,
/// timecode, subprocess supervision. Cleanup runs on every exit path — the
/// encoder process is never orphaned, even on abort.
pub async fn run_pipeline(
    job: &EncodeJob,
    host: &mut dyn HostSource,
    mut engine: Option<&mut dyn FieldShiftEngine>,
    audio_worker: Option<AudioWorker>,
    cancel: CancellationToken,
) -> Result<RunReport, RunError> {
    let info = host.video_info();
    if job.field_shift && info.interlaced {
        return Err(RunError::FieldShiftInterlaced);
    }
    if job.field_shift && engine.is_none() {
        return Err(RunError::FieldShiftEngineMissing);
    }

    let geometry = job.geometry(&info);
    let mut selector = FrameSelector::new(info.frame_count, job.field_shift);
    let (mut producer, consumer) = channel::create(ChannelParams {
        key: job.channel_key.clone(),
        geometry,
        fps_num: info.fps_num,
        fps_den: info.fps_den,
        // Unknown under field-shift: the drop pattern decides the length.
        total_frames: if job.field_shift { 0 } else { info.frame_count as u64 },
    })?;

    let mut encoder = EncoderProcess::spawn(&job.encoder_command()).await?;

    let mut audio = audio_worker.map(|spawn_worker| {
        let sample_bytes = info.audio.map(|a| a.sample_bytes).unwrap_or(1);
        let (relay, feed) = relay_pair(sample_bytes);
        AudioTask { relay, handle: spawn_worker(feed) }
    });
    let mut converter: Option<Converter> = None;

    let mut feed = None;
    let video_result = match encoder.take_stdin() {
        Some(stdin) => {
            feed = Some(spawn_frame_feed(
                consumer,
                stdin,
                encoder.abort_token(),
                geometry,
            ));
            drive_frames(
                job,
                &info,
                &geometry,
                host,
                &mut engine,
                &mut selector,
                &mut producer,
                &mut encoder,
                &mut converter,
                audio.as_mut(),
                &cancel,
            )
            .await
        }
        None => Err(ProcessError::MissingPipe("stdin").into()),
    };

    // ---- epilogue: runs to completion regardless of how the loop ended ----
    let aborted = matches!(&video_result, Ok(stats) if stats.aborted);
    let video_failed = video_result.is_err();
    if aborted || video_failed {
        producer.request_abort();
    }

    // Wake the consumer with end-of-stream instead of letting it time out; on
    // abort this same path runs immediately, skipping the remaining frames.
    if !finish_stream(&mut producer, &mut encoder, job.slot_wait()).await {
        log::debug!("end-of-stream publish did not land, cancelling the feed");
        encoder.request_abort();
    }

    if let Some(feed) = feed {
        match tokio::time::timeout(job.join_timeout(), feed).await {
            Ok(Ok(Ok(bytes))) => log::debug!("frame feed wrote {bytes} bytes"),
            Ok(Ok(Err(e))) => log::warn!("frame feed write failed: {e}"),
            Ok(Err(e)) => log::warn!("frame feed task failed: {e}"),
            Err(_) => log::warn!("frame feed did not settle in time"),
        }
    }

    // The audio side finishes even when video bailed out early, but a failed
    // or aborted video path tells it to abort rather than run to completion.
    let mut audio_result: Result<(), RunError> = Ok(());
    if let Some(task) = audio.take() {
        let AudioTask { mut relay, handle } = task;
        if aborted || video_failed {
            relay.propagate_abort();
        }
        log::info!("waiting for the audio worker to finish");
        if let Err(e) = relay.drain(host).await {
            audio_result = Err(e.into());
        }
        if let Err(e) = join_audio_worker(handle, host).await {
            if audio_result.is_ok() {
                audio_result = Err(e);
            }
        }
    }

    let mut timecode_lines = None;
    if !video_failed && !aborted && (job.field_shift || job.timecode_path.is_some()) {
        let path = job.resolved_timecode_path();
        let spec = TimecodeSpec {
            record: selector.record(),
            frame_count: info.frame_count,
            fps_num: info.fps_num,
            fps_den: info.fps_den,
            field_shift: job.field_shift,
            delay_comp_frames: job.delay_comp_frames,
            near_24fps: job.near_24fps,
        };
        match write_timecode(&path, &spec) {
            Ok(lines) => {
                log::info!("timecode written: {} ({lines} lines)", path.display());
                timecode_lines = Some(lines);
            }
            Err(e @ TimecodeError::Create { .. }) => {
                log::warn!("{e}; continuing without a timecode file");
            }
            Err(e) => log::error!("{e}"),
        }
    }

    let join_result = encoder.join(job.join_timeout(), &cancel).await;
    let encoder_exit = match &join_result {
        Ok(status) => status.code(),
        Err(_) => encoder.exit_code(),
    };

    if job.field_shift {
        log::info!("drop {} / {} frames", selector.drop_count(), info.frame_count);
    }

    let stats = video_result?;
    join_result?;
    audio_result?;

    if stats.frames_fetched > 0 {
        log::info!(
            "frame fetch avg {:.3} ms",
            stats.fetch_total.as_secs_f64() * 1000.0 / stats.frames_fetched as f64
        );
    }
    if let Some(code) = encoder_exit {
        if code != 0 {
            log::warn!("encoder exited with code {code}");
        }
    }

    Ok(RunReport {
        status: if stats.aborted { RunStatus::Aborted } else { RunStatus::Completed },
        frames_published: stats.frames_published,
        drop_count: selector.drop_count(),
        encoder_exit,
        timecode_lines,
    })
}

#[allow(clippy::too_many_arguments)]
async fn drive_frames(
    job: &EncodeJob,
    info: &VideoInfo,
    geometry: &FrameGeometry,
    host: &mut dyn HostSource,
    engine: &mut Option<&mut dyn FieldShiftEngine>,
    selector: &mut FrameSelector,
    producer: &mut FrameProducer,
    encoder: &mut EncoderProcess,
    converter: &mut Option<Converter>,
    mut audio: Option<&mut AudioTask>,
    cancel: &CancellationToken,
) -> Result<LoopStats, RunError> {
    let total = info.frame_count;
    let relay_every = job.relay_interval.max(1) as usize;
    let slot_wait = job.slot_wait();
    let mut stats = LoopStats::default();

    for index in 0..total {
        if cancel.is_cancelled() || host.abort_requested() {
            log::info!("abort requested, stopping after {index} frames");
            stats.aborted = true;
            return Ok(stats);
        }

        let diag = encoder.pump_diagnostics(PumpMode::NonBlocking).await;
        if diag.stream_closed {
            encoder.is_alive();
            return Err(encoder.died_unexpectedly().into());
        }

        if index % relay_every == 0 {
            host.report_progress(index, total);
            if let Some(task) = audio.as_deref_mut() {
                task.relay.service(host, RELAY_WAIT).await?;
            }
        }

        let copy_flagged = index > 0 && host.frame_flags(index).copy_frame;

        if job.field_shift {
            let Some(engine) = engine.as_deref_mut() else {
                return Err(RunError::FieldShiftEngineMissing);
            };
            let started = Instant::now();
            let adjusted = engine
                .adjusted_frame(index)
                .ok_or(RunError::HostFrameFetch(index))?;
            stats.fetch_total += started.elapsed();
            stats.frames_fetched += 1;

            let sample = EngineSample { dropped: adjusted.dropped, jitter: adjusted.jitter };
            match selector.decide(index, copy_flagged, sample) {
                Decision::Drop => {}
                Decision::Emit { reconvert, jitter } => {
                    let Some(mut slot) =
                        acquire_slot(producer, encoder, host, cancel, slot_wait).await?
                    else {
                        stats.aborted = true;
                        return Ok(stats);
                    };
                    if reconvert {
                        let conv = selected_converter(converter, geometry)?;
                        conv.convert(adjusted.data, &mut slot.data);
                    }
                    slot.timestamp = index as i64 * 4 + jitter as i64;
                    slot.duration = 0;
                    if producer.publish(slot).await.is_err() {
                        encoder.is_alive();
                        return Err(encoder.died_unexpectedly().into());
                    }
                    stats.frames_published += 1;
                }
            }
        } else {
            // Nothing drops outside field-shift mode; a copy flag only skips
            // the reconversion.
            match selector.decide(index, copy_flagged, EngineSample::PASS) {
                Decision::Drop => {}
                Decision::Emit { reconvert, .. } => {
                    let Some(mut slot) =
                        acquire_slot(producer, encoder, host, cancel, slot_wait).await?
                    else {
                        stats.aborted = true;
                        return Ok(stats);
                    };
                    let started = Instant::now();
                    let data = host
                        .fetch_frame(index, geometry.source)
                        .ok_or(RunError::HostFrameFetch(index))?;
                    stats.fetch_total += started.elapsed();
                    stats.frames_fetched += 1;
                    if reconvert {
                        let conv = selected_converter(converter, geometry)?;
                        conv.convert(data, &mut slot.data);
                    }
                    slot.timestamp = index as i64 * 4;
                    slot.duration = 0;
                    if producer.publish(slot).await.is_err() {
                        encoder.is_alive();
                        return Err(encoder.died_unexpectedly().into());
                    }
                    stats.frames_published += 1;
                }
            }
        }

        // The preview repaint may invalidate the buffer the last fetch
        // returned, so it only runs once the frame has left for the channel.
        host.update_preview();
    }

    Ok(stats)
}

/// Lazily selects the conversion routine on the first emitted frame.
fn selected_converter<'a>(
    converter: &'a mut Option<Converter>,
    geometry: &FrameGeometry,
) -> Result<&'a mut Converter, RunError> {
    if converter.is_none() {
        let selected = Converter::select(geometry, SimdMask::available())?;
        log::info!(
            "convert {} -> {} [{}{}]",
            geometry.source.name(),
            geometry.target.name(),
            selected.tier(),
            if selected.is_staged() { ", staged" } else { "" }
        );
        *converter = Some(selected);
    }
    Ok(converter.as_mut().expect("selected above"))
}

/// Bounded wait for slot ownership, re-checking abort and consumer liveness
/// on every timeout tick. `Ok(None)` reports an observed abort.
async fn acquire_slot(
    producer: &mut FrameProducer,
    encoder: &mut EncoderProcess,
    host: &dyn HostSource,
    cancel: &CancellationToken,
    tick: Duration,
) -> Result<Option<FrameSlot>, RunError> {
    loop {
        match producer.wait_slot_empty(tick).await {
            Ok(SlotWait::Ready(slot)) => return Ok(Some(slot)),
            Ok(SlotWait::TimedOut) => {
                if cancel.is_cancelled() || host.abort_requested() {
                    return Ok(None);
                }
                let diag = encoder.pump_diagnostics(PumpMode::NonBlocking).await;
                if diag.stream_closed || !encoder.is_alive() {
                    return Err(encoder.died_unexpectedly().into());
                }
            }
            Err(_) => {
                encoder.is_alive();
                return Err(encoder.died_unexpectedly().into());
            }
        }
    }
}

/// Reclaims the slot and publishes it once more with the sequence-ending flag
/// so the consumer observes end-of-stream instead of timing out.
async fn finish_stream(
    producer: &mut FrameProducer,
    encoder: &mut EncoderProcess,
    tick: Duration,
) -> bool {
    for _ in 0..FINISH_TICKS {
        match producer.wait_slot_empty(tick).await {
            Ok(SlotWait::Ready(slot)) => return producer.finish(slot).await.is_ok(),
            Ok(SlotWait::TimedOut) => {
                encoder.pump_diagnostics(PumpMode::BlockFor(SHUTDOWN_PUMP)).await;
                if !encoder.is_alive() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    false
}

/// Consumer half of the channel: forwards each leased slot's payload rows
/// into the encoder's stdin, then recycles the lease. Exits on end-of-stream
/// or when the feed token is cancelled, dropping stdin either way — which is
/// the cooperative stop signal a stdin-driven encoder observes.
fn spawn_frame_feed(
    mut consumer: FrameConsumer,
    mut stdin: ChildStdin,
    cancel: CancellationToken,
    geometry: FrameGeometry,
) -> JoinHandle<std::io::Result<u64>> {
    tokio::spawn(async move {
        let layout = geometry.layout();
        let mut written = 0u64;
        loop {
            let skip_writes = consumer.abort_requested();
            let lease = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                lease = consumer.recv() => match lease {
                    Some(lease) => lease,
                    None => break,
                },
            };
            if skip_writes {
                continue;
            }
            for plane in &layout.planes {
                if cancel.is_cancelled() {
                    break;
                }
                for row in 0..plane.rows {
                    let at = plane.offset + row * layout.pitch;
                    stdin.write_all(&lease.data()[at..at + plane.row_bytes]).await?;
                    written += plane.row_bytes as u64;
                }
            }
            drop(lease);
        }
        stdin.flush().await?;
        drop(stdin);
        log::debug!("frame feed finished, {written} bytes");
        Ok(written)
    })
}

/// Collects the audio worker's exit, polling the host abort flag while it
/// winds down.
async fn join_audio_worker(
    mut handle: JoinHandle<anyhow::Result<()>>,
    host: &mut dyn HostSource,
) -> Result<(), RunError> {
    loop {
        match tokio::time::timeout(Duration::from_millis(100), &mut handle).await {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(e))) => return Err(RunError::AudioWorker(format!("{e:#}"))),
            Ok(Err(e)) => return Err(RunError::AudioWorker(format!("worker panicked: {e}"))),
            Err(_) => {
                if host.abort_requested() {
                    log::debug!("host abort observed while waiting for the audio worker");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "driver_test.rs"]
mod driver_test;
