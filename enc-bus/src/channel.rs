use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::frame::{FrameGeometry, GeometryError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid frame geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("frame channel {0}: internal slot handoff could not be primed")]
    Setup(String),
    #[error("frame channel {0}: consumer side is gone")]
    ConsumerGone(String),
}

/// The contract published once at channel setup. Owned by the producer after
/// creation; the consumer only reads it, except the abort flag which is
/// producer-write / consumer-read (the reverse direction is never used).
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub key: String,
    pub geometry: FrameGeometry,
    pub fps_num: u32,
    pub fps_den: u32,
    /// 0 when the output length is unknown (variable-rate runs).
    pub total_frames: u64,
}

/// The one reusable frame buffer. Exactly one frame's worth of data lives in
/// it at any time; ownership alternates strictly between the two halves of the
/// channel. The pixel data is deliberately left untouched on recycle so a
/// copy-flagged frame can republish the previous contents.
#[derive(Debug)]
pub struct FrameSlot {
    pub data: BytesMut,
    /// Quarter-frame ticks (frame index x 4, plus jitter under field-shift).
    pub timestamp: i64,
    pub duration: i64,
    end_of_stream: bool,
}

impl FrameSlot {
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }
}

struct Shared {
    params: ChannelParams,
    abort: AtomicBool,
}

pub struct FrameProducer {
    shared: Arc<Shared>,
    empty_rx: mpsc::Receiver<FrameSlot>,
    filled_tx: mpsc::Sender<FrameSlot>,
}

pub struct FrameConsumer {
    shared: Arc<Shared>,
    filled_rx: mpsc::Receiver<FrameSlot>,
    empty_tx: mpsc::Sender<FrameSlot>,
}

/// Outcome of a bounded producer-side wait. A timeout is not an error: the
/// caller re-checks consumer liveness and the host abort condition, then waits
/// again, so a crashed consumer can never hang the producer.
pub enum SlotWait {
    Ready(FrameSlot),
    TimedOut,
}

/// Creates the single-slot handoff. The slot starts on the empty side
/// ("empty" initially signalled, "filled" not).
pub fn create(params: ChannelParams) -> Result<(FrameProducer, FrameConsumer), ChannelError> {
    params.geometry.validate()?;
    let frame_bytes = params.geometry.layout().frame_bytes;

    let (empty_tx, empty_rx) = mpsc::channel(1);
    let (filled_tx, filled_rx) = mpsc::channel(1);
    let slot = FrameSlot {
        data: BytesMut::zeroed(frame_bytes),
        timestamp: 0,
        duration: 0,
        end_of_stream: false,
    };
    if empty_tx.try_send(slot).is_err() {
        return Err(ChannelError::Setup(params.key.clone()));
    }
    log::debug!(
        "frame channel {}: created, slot {} bytes, {} expected frames",
        params.key,
        frame_bytes,
        params.total_frames
    );

    let shared = Arc::new(Shared { params, abort: AtomicBool::new(false) });
    Ok((
        FrameProducer {
            shared: shared.clone(),
            empty_rx,
            filled_tx,
        },
        FrameConsumer { shared, filled_rx, empty_tx },
    ))
}

impl FrameProducer {
    pub fn params(&self) -> &ChannelParams {
        &self.shared.params
    }

    /// One-way abort signal to the consumer; the producer still publishes an
    /// end-of-stream slot afterwards so the consumer wakes up to observe it.
    pub fn request_abort(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
    }

    /// Bounded wait for slot ownership. `TimedOut` obliges the caller to poll
    /// consumer liveness and abort state before retrying.
    pub async fn wait_slot_empty(&mut self, timeout: Duration) -> Result<SlotWait, ChannelError> {
        match tokio::time::timeout(timeout, self.empty_rx.recv()).await {
            Ok(Some(slot)) => Ok(SlotWait::Ready(slot)),
            Ok(None) => Err(ChannelError::ConsumerGone(self.shared.params.key.clone())),
            Err(_) => Ok(SlotWait::TimedOut),
        }
    }

    /// Hands the filled slot to the consumer.
    pub async fn publish(&self, slot: FrameSlot) -> Result<(), ChannelError> {
        self.filled_tx
            .send(slot)
            .await
            .map_err(|_| ChannelError::ConsumerGone(self.shared.params.key.clone()))
    }

    /// Publishes the slot one final time with the sequence-ending flag set, so
    /// the consumer observes end-of-stream instead of timing out. Used by both
    /// normal teardown and the abort path.
    pub async fn finish(&self, mut slot: FrameSlot) -> Result<(), ChannelError> {
        slot.end_of_stream = true;
        self.publish(slot).await
    }
}

impl FrameConsumer {
    pub fn params(&self) -> &ChannelParams {
        &self.shared.params
    }

    pub fn abort_requested(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst)
    }

    /// Waits for the filled slot. Returns `None` once the producer publishes
    /// end-of-stream or drops its half.
    pub async fn recv(&mut self) -> Option<SlotLease<'_>> {
        let slot = self.filled_rx.recv().await?;
        if slot.end_of_stream {
            log::debug!("frame channel {}: end of stream", self.shared.params.key);
            return None;
        }
        Some(SlotLease { slot: Some(slot), empty_tx: &self.empty_tx })
    }
}

/// Consumer-side ownership of the slot between the "filled" and "empty"
/// signals. Dropping the lease recycles the slot back to the producer.
pub struct SlotLease<'a> {
    slot: Option<FrameSlot>,
    empty_tx: &'a mpsc::Sender<FrameSlot>,
}

impl SlotLease<'_> {
    pub fn data(&self) -> &[u8] {
        let slot = self.slot.as_ref().expect("slot present until drop");
        &slot.data
    }

    pub fn timestamp(&self) -> i64 {
        self.slot.as_ref().expect("slot present until drop").timestamp
    }

    pub fn duration(&self) -> i64 {
        self.slot.as_ref().expect("slot present until drop").duration
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Cannot fail: capacity 1 and this is the only slot in flight.
            let _ = self.empty_tx.try_send(slot);
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
