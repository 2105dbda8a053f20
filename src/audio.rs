use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::host::HostSource;

const DRAIN_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AudioRelayError {
    #[error("failed to grow the audio relay buffer to {0} bytes")]
    Allocation(usize),
    #[error("host returned no audio samples at {0}")]
    HostFetch(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SampleRequest {
    pub start: u64,
    pub count: usize,
}

/// An owned copy of one host audio buffer, safe to hold after the host call
/// returns. `aborted` carries the latched host abort state to the worker.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub samples: usize,
    pub aborted: bool,
}

/// Worker-side handle. `request` parks the worker at the rendezvous until the
/// frame loop services it, which is exactly the window in which shared state
/// is touched — host access stays serialized on the driver thread.
pub struct AudioFeed {
    request_tx: mpsc::Sender<SampleRequest>,
    chunk_rx: mpsc::Receiver<AudioChunk>,
}

impl AudioFeed {
    /// Returns `None` once the relay is torn down.
    pub async fn request(&mut self, start: u64, count: usize) -> Option<AudioChunk> {
        self.request_tx.send(SampleRequest { start, count }).await.ok()?;
        self.chunk_rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Served,
    /// No request was pending within the bounded wait.
    Idle,
    /// The worker dropped its handle; nothing left to relay.
    WorkerDone,
}

/// Driver-side half: answers worker requests from the frame loop, copying
/// host buffers into a retained scratch buffer that only ever grows.
pub struct AudioRelay {
    request_rx: mpsc::Receiver<SampleRequest>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    scratch: Vec<u8>,
    sample_bytes: usize,
    aborted: bool,
    done: bool,
}

pub fn relay_pair(sample_bytes: usize) -> (AudioRelay, AudioFeed) {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (chunk_tx, chunk_rx) = mpsc::channel(1);
    (
        AudioRelay {
            request_rx,
            chunk_tx,
            scratch: Vec::new(),
            sample_bytes: sample_bytes.max(1),
            aborted: false,
            done: false,
        },
        AudioFeed { request_tx, chunk_rx },
    )
}

impl AudioRelay {
    /// Current retained-buffer capacity in bytes; never shrinks mid-run.
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Instructs the worker to stop instead of running to completion; the
    /// flag rides out with the next chunk.
    pub fn propagate_abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Bounded rendezvous: serves one pending worker request, if any.
    pub async fn service(
        &mut self,
        host: &mut dyn HostSource,
        wait: Duration,
    ) -> Result<ServiceOutcome, AudioRelayError> {
        if self.done {
            return Ok(ServiceOutcome::WorkerDone);
        }
        match tokio::time::timeout(wait, self.request_rx.recv()).await {
            Err(_) => Ok(ServiceOutcome::Idle),
            Ok(None) => {
                self.done = true;
                Ok(ServiceOutcome::WorkerDone)
            }
            Ok(Some(request)) => {
                self.serve(host, request).await?;
                Ok(ServiceOutcome::Served)
            }
        }
    }

    async fn serve(
        &mut self,
        host: &mut dyn HostSource,
        request: SampleRequest,
    ) -> Result<(), AudioRelayError> {
        let required = request
            .count
            .checked_mul(self.sample_bytes)
            .ok_or(AudioRelayError::Allocation(usize::MAX))?;
        if self.scratch.len() < required {
            self.scratch
                .try_reserve(required - self.scratch.len())
                .map_err(|_| AudioRelayError::Allocation(required))?;
            self.scratch.resize(required, 0);
            log::debug!("audio relay buffer grown to {} bytes", self.scratch.len());
        }

        let samples = {
            let (buffer, got) = host
                .fetch_audio(request.start, request.count)
                .ok_or(AudioRelayError::HostFetch(request.start))?;
            // The host buffer dies with the next host call; copy first.
            let got = got.min(request.count);
            let bytes = (got * self.sample_bytes).min(buffer.len());
            self.scratch[..bytes].copy_from_slice(&buffer[..bytes]);
            got
        };
        self.aborted |= host.abort_requested();

        let chunk = AudioChunk {
            data: Bytes::copy_from_slice(&self.scratch[..samples * self.sample_bytes]),
            samples,
            aborted: self.aborted,
        };
        if self.chunk_tx.send(chunk).await.is_err() {
            self.done = true;
        }
        Ok(())
    }

    /// Runs the rendezvous until the worker reports no more pending work.
    /// No termination bound — audio work is finite — but the host abort flag
    /// is polled on every tick and propagated.
    pub async fn drain(&mut self, host: &mut dyn HostSource) -> Result<(), AudioRelayError> {
        while !self.done {
            self.aborted |= host.abort_requested();
            if self.service(host, DRAIN_TICK).await? == ServiceOutcome::WorkerDone {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "audio_test.rs"]
mod audio_test;
