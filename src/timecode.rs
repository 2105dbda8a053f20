use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::selector::{JitterEntry, JitterRecord};

/// File-create failure is recoverable for the run (warn and continue without
/// a timecode file); failures after creation fail this call only.
#[derive(Debug, Error)]
pub enum TimecodeError {
    #[error("could not create timecode file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed writing timecode file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct TimecodeSpec<'a> {
    pub record: &'a JitterRecord,
    pub frame_count: usize,
    pub fps_num: u32,
    pub fps_den: u32,
    pub field_shift: bool,
    /// Extra leading frames that re-align audio shifted earlier in the
    /// pipeline; emitted at the nominal rate before the real frames.
    pub delay_comp_frames: u32,
    /// Verdict of the external frame-count heuristic: is the overall sequence
    /// closer to 24 fps than to 30? Selects the delay-compensation multiplier
    /// under field-shift.
    pub near_24fps: bool,
}

/// Writes a `timecode format v2` file: one `%.6f` millisecond value per
/// emitted frame, CRLF line endings. Returns the number of timestamp lines.
pub fn write_timecode(path: &Path, spec: &TimecodeSpec<'_>) -> Result<u64, TimecodeError> {
    let file = File::create(path).map_err(|source| TimecodeError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    let write_failed = |source| TimecodeError::Write { path: path.to_path_buf(), source };

    let mut fps = spec.fps_num as f64 / spec.fps_den as f64;
    if spec.field_shift {
        // Quarter-frame precision for sub-frame jitter offsets.
        fps *= 4.0;
    }
    let tick_ms = 1000.0 / fps;
    let mut lines = 0u64;

    out.write_all(b"# timecode format v2\r\n").map_err(write_failed)?;
    if spec.field_shift {
        // A 24fps-like sequence advances 5 quarter-frame ticks per frame, a
        // 30fps-like one 4.
        let comp_multiplier = 4 + spec.near_24fps as i64;
        for i in 0..spec.delay_comp_frames as i64 {
            write!(out, "{:.6}\r\n", (i * comp_multiplier) as f64 * tick_ms).map_err(write_failed)?;
            lines += 1;
        }
        let comp_offset = spec.delay_comp_frames as i64 * comp_multiplier;
        for i in 0..spec.frame_count {
            match spec.record.get(i) {
                JitterEntry::Dropped => {}
                JitterEntry::Offset(jitter) => {
                    let ticks = i as i64 * 4 + jitter as i64 + comp_offset;
                    write!(out, "{:.6}\r\n", ticks as f64 * tick_ms).map_err(write_failed)?;
                    lines += 1;
                }
            }
        }
    } else {
        for i in 0..(spec.frame_count + spec.delay_comp_frames as usize) {
            write!(out, "{:.6}\r\n", i as f64 * tick_ms).map_err(write_failed)?;
            lines += 1;
        }
    }
    out.flush().map_err(write_failed)?;
    Ok(lines)
}

#[cfg(test)]
#[path = "timecode_test.rs"]
mod timecode_test;
