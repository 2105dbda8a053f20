use enc_bus::frame::PixelFormat;

/// Stream description negotiated with the host before the run starts.
#[derive(Debug, Clone, Copy)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub frame_count: usize,
    pub interlaced: bool,
    pub audio: Option<AudioInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioInfo {
    pub sample_bytes: usize,
    pub total_samples: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags {
    /// The host declares this frame visually identical to its predecessor.
    pub copy_frame: bool,
}

/// One frame as re-timed by the field-shift engine.
pub struct AdjustedFrame<'a> {
    pub data: &'a [u8],
    pub dropped: bool,
    /// Signed sub-frame offset in quarter-frame ticks.
    pub jitter: i32,
}

/// The media-editing application the pipeline pulls frames from. The host is
/// not reentrant; everything here is called from the driver thread only.
pub trait HostSource: Send {
    fn video_info(&self) -> VideoInfo;

    /// Fetches one decoded frame, tightly packed in `format`. The returned
    /// buffer is only valid until the next call into the host, which the
    /// `&mut self` borrow enforces.
    fn fetch_frame(&mut self, index: usize, format: PixelFormat) -> Option<&[u8]>;

    fn frame_flags(&self, index: usize) -> FrameFlags;

    fn abort_requested(&self) -> bool;

    fn report_progress(&self, _current: usize, _total: usize) {}

    /// May repaint into the buffer the last fetch returned; only called after
    /// the frame has left for the channel.
    fn update_preview(&mut self) {}

    /// Fetches raw audio samples. The returned buffer is only valid until the
    /// next call into the host; the second element is the sample count
    /// actually delivered.
    fn fetch_audio(&mut self, _start: u64, _count: usize) -> Option<(&[u8], usize)> {
        None
    }
}

/// The adaptive field-shift engine; an opaque collaborator whose drop and
/// jitter decisions are consumed as-is.
pub trait FieldShiftEngine: Send {
    /// Pixel data is only valid until the next call into the engine.
    fn adjusted_frame(&mut self, index: usize) -> Option<AdjustedFrame<'_>>;
}
