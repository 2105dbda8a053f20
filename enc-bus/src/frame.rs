use thiserror::Error;

/// Row strides in the shared frame slot are padded to this many bytes so the
/// block conversion routines may spill past the true row edge without
/// touching a neighbouring row.
pub const PITCH_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 8-bit 4:2:2, two bytes per pixel (host-side input).
    Yuy2,
    /// Packed 4:4:4, three signed 16-bit fixed-point components per pixel
    /// (host-side input for high-depth and full-chroma targets).
    Yc48,
    /// Planar 8-bit 4:2:0, interleaved chroma (encoder-side).
    Nv12,
    /// Planar 10-bit-in-16 4:2:0, interleaved chroma, MSB-aligned (encoder-side).
    P010,
    /// Planar 16-bit 4:4:4 (encoder-side).
    Yuv444P16,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Yuy2 => "yuy2",
            PixelFormat::Yc48 => "yc48",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::P010 => "p010",
            PixelFormat::Yuv444P16 => "yuv444p16",
        }
    }

    /// Bytes per pixel for the packed host-side formats.
    pub fn packed_bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Yuy2 => Some(2),
            PixelFormat::Yc48 => Some(6),
            _ => None,
        }
    }

    /// Bytes per luma sample for the planar encoder-side formats.
    pub fn luma_sample_bytes(self) -> Option<usize> {
        match self {
            PixelFormat::Nv12 => Some(1),
            PixelFormat::P010 | PixelFormat::Yuv444P16 => Some(2),
            _ => None,
        }
    }

    pub fn is_high_depth(self) -> bool {
        matches!(self, PixelFormat::P010 | PixelFormat::Yuv444P16)
    }

    fn is_chroma_subsampled(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::P010)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("frame size {width}x{height} is not valid")]
    ZeroSize { width: u32, height: u32 },
    #[error("width {0} must be even for {1}")]
    OddWidth(u32, &'static str),
    #[error("height {0} must be even for a 4:2:0 target")]
    OddHeight(u32),
    #[error("height {0} must be a multiple of 4 for an interlaced 4:2:0 target")]
    InterlacedHeight(u32),
    #[error("{0} is not a host-side source format")]
    BadSource(&'static str),
    #[error("{0} is not an encoder-side target format")]
    BadTarget(&'static str),
}

/// Negotiated once at channel setup and immutable afterwards; a later frame
/// violating it is a protocol error, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub source: PixelFormat,
    pub target: PixelFormat,
    pub interlaced: bool,
}

/// One plane of the target frame inside the slot buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    pub offset: usize,
    pub rows: usize,
    /// Tight payload bytes per row; the slot stores rows at `PlaneLayout::pitch`.
    pub row_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub pitch: usize,
    pub planes: Vec<PlaneDesc>,
    pub frame_bytes: usize,
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

impl FrameGeometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.width == 0 || self.height == 0 {
            return Err(GeometryError::ZeroSize {
                width: self.width,
                height: self.height,
            });
        }
        if self.source.packed_bytes_per_pixel().is_none() {
            return Err(GeometryError::BadSource(self.source.name()));
        }
        if self.target.luma_sample_bytes().is_none() {
            return Err(GeometryError::BadTarget(self.target.name()));
        }
        if self.source == PixelFormat::Yuy2 && self.width % 2 != 0 {
            return Err(GeometryError::OddWidth(self.width, self.source.name()));
        }
        if self.target.is_chroma_subsampled() {
            if self.width % 2 != 0 {
                return Err(GeometryError::OddWidth(self.width, self.target.name()));
            }
            if self.height % 2 != 0 {
                return Err(GeometryError::OddHeight(self.height));
            }
            if self.interlaced && self.height % 4 != 0 {
                return Err(GeometryError::InterlacedHeight(self.height));
            }
        }
        Ok(())
    }

    /// Tight row stride of the packed host-side frame.
    pub fn source_pitch(&self) -> usize {
        self.width as usize
            * self
                .source
                .packed_bytes_per_pixel()
                .unwrap_or_default()
    }

    /// Padded row stride used inside the frame slot.
    pub fn target_pitch(&self) -> usize {
        let row = self.width as usize * self.target.luma_sample_bytes().unwrap_or_default();
        align_up(row, PITCH_ALIGN)
    }

    pub fn layout(&self) -> PlaneLayout {
        let w = self.width as usize;
        let h = self.height as usize;
        let pitch = self.target_pitch();
        let planes = match self.target {
            PixelFormat::Nv12 => vec![
                PlaneDesc { offset: 0, rows: h, row_bytes: w },
                PlaneDesc { offset: pitch * h, rows: h / 2, row_bytes: w },
            ],
            PixelFormat::P010 => vec![
                PlaneDesc { offset: 0, rows: h, row_bytes: w * 2 },
                PlaneDesc { offset: pitch * h, rows: h / 2, row_bytes: w * 2 },
            ],
            PixelFormat::Yuv444P16 => vec![
                PlaneDesc { offset: 0, rows: h, row_bytes: w * 2 },
                PlaneDesc { offset: pitch * h, rows: h, row_bytes: w * 2 },
                PlaneDesc { offset: pitch * h * 2, rows: h, row_bytes: w * 2 },
            ],
            _ => Vec::new(),
        };
        let frame_bytes = planes
            .last()
            .map(|p| p.offset + p.rows * pitch)
            .unwrap_or_default();
        PlaneLayout { pitch, planes, frame_bytes }
    }

    /// Payload bytes of one frame with the padding stripped, i.e. what the
    /// consumer actually forwards per frame.
    pub fn tight_frame_bytes(&self) -> usize {
        self.layout()
            .planes
            .iter()
            .map(|p| p.rows * p.row_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom(w: u32, h: u32, target: PixelFormat, interlaced: bool) -> FrameGeometry {
        let source = if target == PixelFormat::Nv12 {
            PixelFormat::Yuy2
        } else {
            PixelFormat::Yc48
        };
        FrameGeometry { width: w, height: h, source, target, interlaced }
    }

    #[test]
    fn nv12_layout() {
        let g = geom(1920, 1080, PixelFormat::Nv12, false);
        g.validate().unwrap();
        let l = g.layout();
        assert_eq!(l.pitch, 1920);
        assert_eq!(l.planes.len(), 2);
        assert_eq!(l.planes[1].offset, 1920 * 1080);
        assert_eq!(l.planes[1].rows, 540);
        assert_eq!(l.frame_bytes, 1920 * 1080 * 3 / 2);
        assert_eq!(g.tight_frame_bytes(), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn odd_width_gets_padded_pitch() {
        let g = geom(1000, 500, PixelFormat::P010, false);
        g.validate().unwrap();
        let l = g.layout();
        assert_eq!(l.pitch, 2048); // 2000 rounded up to 64
        assert_eq!(l.planes[0].row_bytes, 2000);
        assert_eq!(g.tight_frame_bytes(), 2000 * 500 * 3 / 2);
    }

    #[test]
    fn yuv444p16_has_three_full_planes() {
        let g = geom(64, 32, PixelFormat::Yuv444P16, false);
        g.validate().unwrap();
        let l = g.layout();
        assert_eq!(l.planes.len(), 3);
        assert_eq!(l.planes[2].offset, l.pitch * 64);
        assert_eq!(l.planes[2].rows, 32);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(geom(0, 16, PixelFormat::Nv12, false).validate().is_err());
        assert!(matches!(
            geom(16, 15, PixelFormat::Nv12, false).validate(),
            Err(GeometryError::OddHeight(15))
        ));
        assert!(matches!(
            geom(16, 18, PixelFormat::Nv12, true).validate(),
            Err(GeometryError::InterlacedHeight(18))
        ));
        // Progressive 4:4:4 has no vertical constraint.
        geom(16, 17, PixelFormat::Yuv444P16, true).validate().unwrap();
        // Source/target roles cannot be swapped.
        let g = FrameGeometry {
            width: 16,
            height: 16,
            source: PixelFormat::Nv12,
            target: PixelFormat::Nv12,
            interlaced: false,
        };
        assert!(matches!(g.validate(), Err(GeometryError::BadSource(_))));
    }
}
