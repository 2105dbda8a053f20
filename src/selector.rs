/// Per-frame timing entry: a signed quarter-frame offset for emitted frames,
/// or the dropped sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterEntry {
    Offset(i32),
    Dropped,
}

/// Timing record of one run, indexed by output frame. Append-only while the
/// main loop runs, read-only afterwards. Holds one slack entry past the frame
/// count for delay compensation.
#[derive(Debug)]
pub struct JitterRecord {
    entries: Vec<JitterEntry>,
}

impl JitterRecord {
    fn new(frame_count: usize) -> Self {
        Self { entries: vec![JitterEntry::Offset(0); frame_count + 1] }
    }

    pub fn entries(&self) -> &[JitterEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> JitterEntry {
        self.entries[index]
    }

    pub fn dropped_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| matches!(e, JitterEntry::Dropped))
            .count() as u64
    }

    fn set(&mut self, index: usize, entry: JitterEntry) {
        self.entries[index] = entry;
    }
}

/// The field-shift engine's verdict for one frame. Outside field-shift mode
/// the engine is not consulted and `PASS` stands in.
#[derive(Debug, Clone, Copy)]
pub struct EngineSample {
    pub dropped: bool,
    pub jitter: i32,
}

impl EngineSample {
    pub const PASS: EngineSample = EngineSample { dropped: false, jitter: 0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Emit {
        /// `false` for a copy-flagged frame: the slot still holds the
        /// previous pixels, so conversion is skipped and only the timestamp
        /// bookkeeping is republished.
        reconvert: bool,
        jitter: i32,
    },
    Drop,
}

/// Decides, per host frame index, whether to drop, republish or emit, and
/// keeps the jitter record and drop counter.
pub struct FrameSelector {
    field_shift: bool,
    record: JitterRecord,
    drops: u64,
}

impl FrameSelector {
    pub fn new(frame_count: usize, field_shift: bool) -> Self {
        Self {
            field_shift,
            record: JitterRecord::new(frame_count),
            drops: 0,
        }
    }

    /// A frame is dropped when the engine says so, or when it is copy-flagged
    /// while field-shift is active: frame timing is re-derived from the
    /// jitter record anyway, so re-encoding a visual duplicate buys nothing.
    /// Copy-flagged frames outside field-shift mode are kept (republished) —
    /// the policy is deliberately not generalized.
    pub fn decide(&mut self, index: usize, copy_flagged: bool, sample: EngineSample) -> Decision {
        if sample.dropped || (self.field_shift && copy_flagged) {
            self.record.set(index, JitterEntry::Dropped);
            self.drops += 1;
            Decision::Drop
        } else {
            self.record.set(index, JitterEntry::Offset(sample.jitter));
            Decision::Emit { reconvert: !copy_flagged, jitter: sample.jitter }
        }
    }

    pub fn field_shift(&self) -> bool {
        self.field_shift
    }

    pub fn drop_count(&self) -> u64 {
        self.drops
    }

    pub fn record(&self) -> &JitterRecord {
        &self.record
    }
}
