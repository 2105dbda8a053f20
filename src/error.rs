use thiserror::Error;

use enc_bus::channel::ChannelError;
use enc_bus::convert::ConvertError;
use enc_bus::process::ProcessError;

use crate::audio::AudioRelayError;

/// Failures that terminate a run. A host- or user-initiated abort is not an
/// error; it surfaces as [`crate::driver::RunStatus::Aborted`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("field-shift cannot be combined with an interlaced target")]
    FieldShiftInterlaced,
    #[error("field-shift is enabled but no field-shift engine was supplied")]
    FieldShiftEngineMissing,
    #[error("channel setup failed: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Conversion(#[from] ConvertError),
    #[error("host returned no frame at index {0}")]
    HostFrameFetch(usize),
    #[error("audio relay failed: {0}")]
    AudioRelay(#[from] AudioRelayError),
    #[error("audio worker failed: {0}")]
    AudioWorker(String),
}
