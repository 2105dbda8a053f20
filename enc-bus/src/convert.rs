use thiserror::Error;

use crate::frame::{FrameGeometry, PixelFormat, PlaneLayout};
use crate::simd::SimdMask;

/// Staging rows are padded to this many pixels, comfortably past the widest
/// block, so a block routine can spill past the true frame edge in-bounds.
const STAGING_ALIGN: usize = 128;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no conversion routine for {src} -> {dst} (interlaced: {interlaced})")]
    NoRoutine {
        src: &'static str,
        dst: &'static str,
        interlaced: bool,
    },
}

type ConvertFn = fn(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
);

struct Routine {
    src: PixelFormat,
    dst: PixelFormat,
    /// `None` matches either scan mode (no vertical chroma subsampling).
    interlaced: Option<bool>,
    /// Pixels consumed per inner step, with no remainder handling.
    block: usize,
    /// Tier the routine is gated on; `empty()` marks the scalar fallback.
    simd: SimdMask,
    tier: &'static str,
    func: ConvertFn,
}

impl Routine {
    fn matches(&self, src: PixelFormat, dst: PixelFormat, interlaced: bool) -> bool {
        self.src == src && self.dst == dst && self.interlaced.unwrap_or(interlaced) == interlaced
    }
}

/// Grouped per (source, target, scan) family, widest block first, scalar last.
static ROUTINES: &[Routine] = &[
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(false),
        block: 32,
        simd: SimdMask::AVX2,
        tier: "avx2",
        func: yuy2_to_nv12_progressive::<32>,
    },
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(false),
        block: 16,
        simd: SimdMask::SSE2,
        tier: "sse2",
        func: yuy2_to_nv12_progressive::<16>,
    },
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(false),
        block: 2,
        simd: SimdMask::empty(),
        tier: "scalar",
        func: yuy2_to_nv12_progressive::<2>,
    },
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(true),
        block: 32,
        simd: SimdMask::AVX2,
        tier: "avx2",
        func: yuy2_to_nv12_interlaced::<32>,
    },
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(true),
        block: 16,
        simd: SimdMask::SSE2,
        tier: "sse2",
        func: yuy2_to_nv12_interlaced::<16>,
    },
    Routine {
        src: PixelFormat::Yuy2,
        dst: PixelFormat::Nv12,
        interlaced: Some(true),
        block: 2,
        simd: SimdMask::empty(),
        tier: "scalar",
        func: yuy2_to_nv12_interlaced::<2>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(false),
        block: 16,
        simd: SimdMask::AVX2,
        tier: "avx2",
        func: yc48_to_p010_progressive::<16>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(false),
        block: 8,
        simd: SimdMask::SSE2,
        tier: "sse2",
        func: yc48_to_p010_progressive::<8>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(false),
        block: 1,
        simd: SimdMask::empty(),
        tier: "scalar",
        func: yc48_to_p010_progressive::<1>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(true),
        block: 16,
        simd: SimdMask::AVX2,
        tier: "avx2",
        func: yc48_to_p010_interlaced::<16>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(true),
        block: 8,
        simd: SimdMask::SSE2,
        tier: "sse2",
        func: yc48_to_p010_interlaced::<8>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::P010,
        interlaced: Some(true),
        block: 1,
        simd: SimdMask::empty(),
        tier: "scalar",
        func: yc48_to_p010_interlaced::<1>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::Yuv444P16,
        interlaced: None,
        block: 16,
        simd: SimdMask::AVX2,
        tier: "avx2",
        func: yc48_to_yuv444p16::<16>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::Yuv444P16,
        interlaced: None,
        block: 8,
        simd: SimdMask::SSE2,
        tier: "sse2",
        func: yc48_to_yuv444p16::<8>,
    },
    Routine {
        src: PixelFormat::Yc48,
        dst: PixelFormat::Yuv444P16,
        interlaced: None,
        block: 1,
        simd: SimdMask::empty(),
        tier: "scalar",
        func: yc48_to_yuv444p16::<1>,
    },
];

struct Staging {
    buf: Vec<u8>,
    pitch: usize,
}

/// A selected conversion routine bound to one frame geometry, reused for every
/// frame of the run.
pub struct Converter {
    routine: &'static Routine,
    geometry: FrameGeometry,
    layout: PlaneLayout,
    run_width: usize,
    staging: Option<Staging>,
}

impl Converter {
    /// Picks the widest SIMD routine whose block divides the frame width, then
    /// a narrower one, then the widest available routine over a row-padded
    /// staging copy; plain scalar only when no SIMD tier is present.
    pub fn select(geometry: &FrameGeometry, mask: SimdMask) -> Result<Converter, ConvertError> {
        let width = geometry.width as usize;
        let family: Vec<&'static Routine> = ROUTINES
            .iter()
            .filter(|r| r.matches(geometry.source, geometry.target, geometry.interlaced))
            .collect();
        if family.is_empty() {
            return Err(ConvertError::NoRoutine {
                src: geometry.source.name(),
                dst: geometry.target.name(),
                interlaced: geometry.interlaced,
            });
        }

        let simd_ok = |r: &Routine| !r.simd.is_empty() && mask.contains(r.simd);
        let routine = family
            .iter()
            .copied()
            .find(|r| simd_ok(r) && width % r.block == 0)
            .or_else(|| family.iter().copied().find(|r| simd_ok(r)))
            .or_else(|| family.iter().copied().find(|r| r.simd.is_empty()))
            .ok_or(ConvertError::NoRoutine {
                src: geometry.source.name(),
                dst: geometry.target.name(),
                interlaced: geometry.interlaced,
            })?;

        let run_width = width.next_multiple_of(routine.block);
        let staging = if run_width != width {
            let bpp = geometry.source.packed_bytes_per_pixel().unwrap_or_default();
            let pitch = width.next_multiple_of(STAGING_ALIGN) * bpp;
            Some(Staging {
                buf: vec![0u8; pitch * geometry.height as usize],
                pitch,
            })
        } else {
            None
        };

        Ok(Converter {
            routine,
            geometry: *geometry,
            layout: geometry.layout(),
            run_width,
            staging,
        })
    }

    pub fn tier(&self) -> &'static str {
        self.routine.tier
    }

    pub fn block(&self) -> usize {
        self.routine.block
    }

    pub fn is_staged(&self) -> bool {
        self.staging.is_some()
    }

    /// Converts one packed host frame into the slot buffer. `src` holds
    /// tightly packed rows; `dst` must be at least `layout().frame_bytes`.
    pub fn convert(&mut self, src: &[u8], dst: &mut [u8]) {
        let height = self.geometry.height as usize;
        let tight = self.geometry.source_pitch();
        match &mut self.staging {
            None => (self.routine.func)(src, tight, dst, &self.layout, self.run_width, height),
            Some(staging) => {
                for row in 0..height {
                    staging.buf[row * staging.pitch..][..tight]
                        .copy_from_slice(&src[row * tight..][..tight]);
                }
                (self.routine.func)(
                    &staging.buf,
                    staging.pitch,
                    dst,
                    &self.layout,
                    self.run_width,
                    height,
                )
            }
        }
    }
}

// --- value mapping ---------------------------------------------------------
// Yc48 components are 12-bit fixed point: luma nominally 0..4096, chroma
// signed -2048..2048. Both expand linearly to 16-bit; P010 keeps the top ten
// bits MSB-aligned.

const P010_MASK: u16 = 0xffc0;

#[inline]
fn yc48_luma16(v: i32) -> u16 {
    (v * 16).clamp(0, 65535) as u16
}

#[inline]
fn yc48_chroma16(v: i32) -> u16 {
    (v * 16 + 32768).clamp(0, 65535) as u16
}

#[inline]
fn load_i16(row: &[u8], component: usize) -> i32 {
    i16::from_le_bytes([row[component * 2], row[component * 2 + 1]]) as i32
}

#[inline]
fn store_u16(row: &mut [u8], index: usize, v: u16) {
    row[index * 2..index * 2 + 2].copy_from_slice(&v.to_le_bytes());
}

// --- yuy2 -> nv12 ----------------------------------------------------------

fn copy_luma_yuy2<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    y_offset: usize,
    pitch: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let s = &src[row * src_pitch..][..width * 2];
        let d = &mut dst[y_offset + row * pitch..][..width];
        for (dch, sch) in d.chunks_exact_mut(B).zip(s.chunks_exact(B * 2)) {
            for i in 0..B {
                dch[i] = sch[i * 2];
            }
        }
    }
}

fn yuy2_to_nv12_progressive<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
) {
    debug_assert!(width % B == 0);
    let pitch = layout.pitch;
    let uv_offset = layout.planes[1].offset;
    copy_luma_yuy2::<B>(src, src_pitch, dst, layout.planes[0].offset, pitch, width, height);
    for cy in 0..height / 2 {
        let top = &src[(cy * 2) * src_pitch..][..width * 2];
        let bottom = &src[(cy * 2 + 1) * src_pitch..][..width * 2];
        let d = &mut dst[uv_offset + cy * pitch..][..width];
        for pair in 0..width / 2 {
            let u = (top[pair * 4 + 1] as u16 + bottom[pair * 4 + 1] as u16 + 1) >> 1;
            let v = (top[pair * 4 + 3] as u16 + bottom[pair * 4 + 3] as u16 + 1) >> 1;
            d[pair * 2] = u as u8;
            d[pair * 2 + 1] = v as u8;
        }
    }
}

fn yuy2_to_nv12_interlaced<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
) {
    debug_assert!(width % B == 0);
    let pitch = layout.pitch;
    let uv_offset = layout.planes[1].offset;
    copy_luma_yuy2::<B>(src, src_pitch, dst, layout.planes[0].offset, pitch, width, height);
    // Chroma is subsampled within each field: lines 0/2 of every quad feed the
    // top-field row (3:1), lines 1/3 the bottom-field row (1:3).
    for quad in 0..height / 4 {
        let row = |i: usize| &src[(quad * 4 + i) * src_pitch..][..width * 2];
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        {
            let d = &mut dst[uv_offset + (quad * 2) * pitch..][..width];
            for pair in 0..width / 2 {
                let u = (3 * r0[pair * 4 + 1] as u16 + r2[pair * 4 + 1] as u16 + 2) >> 2;
                let v = (3 * r0[pair * 4 + 3] as u16 + r2[pair * 4 + 3] as u16 + 2) >> 2;
                d[pair * 2] = u as u8;
                d[pair * 2 + 1] = v as u8;
            }
        }
        {
            let d = &mut dst[uv_offset + (quad * 2 + 1) * pitch..][..width];
            for pair in 0..width / 2 {
                let u = (r1[pair * 4 + 1] as u16 + 3 * r3[pair * 4 + 1] as u16 + 2) >> 2;
                let v = (r1[pair * 4 + 3] as u16 + 3 * r3[pair * 4 + 3] as u16 + 2) >> 2;
                d[pair * 2] = u as u8;
                d[pair * 2 + 1] = v as u8;
            }
        }
    }
}

// --- yc48 -> p010 ----------------------------------------------------------

fn copy_luma_yc48_p010<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    y_offset: usize,
    pitch: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let s = &src[row * src_pitch..][..width * 6];
        let d = &mut dst[y_offset + row * pitch..][..width * 2];
        for (x_block, sch) in s.chunks_exact(B * 6).enumerate() {
            for i in 0..B {
                let y = yc48_luma16(load_i16(sch, i * 3)) & P010_MASK;
                store_u16(d, x_block * B + i, y);
            }
        }
    }
}

#[inline]
fn yc48_chroma_pair(row: &[u8], pair: usize) -> (i32, i32) {
    let cb = load_i16(row, pair * 6 + 1) + load_i16(row, pair * 6 + 4);
    let cr = load_i16(row, pair * 6 + 2) + load_i16(row, pair * 6 + 5);
    ((cb + 1) >> 1, (cr + 1) >> 1)
}

fn yc48_to_p010_progressive<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
) {
    debug_assert!(width % B == 0);
    let pitch = layout.pitch;
    let uv_offset = layout.planes[1].offset;
    copy_luma_yc48_p010::<B>(src, src_pitch, dst, layout.planes[0].offset, pitch, width, height);
    for cy in 0..height / 2 {
        let top = &src[(cy * 2) * src_pitch..][..width * 6];
        let bottom = &src[(cy * 2 + 1) * src_pitch..][..width * 6];
        let d = &mut dst[uv_offset + cy * pitch..][..width * 2];
        for pair in 0..width / 2 {
            let (cb_t, cr_t) = yc48_chroma_pair(top, pair);
            let (cb_b, cr_b) = yc48_chroma_pair(bottom, pair);
            let cb = yc48_chroma16((cb_t + cb_b + 1) >> 1) & P010_MASK;
            let cr = yc48_chroma16((cr_t + cr_b + 1) >> 1) & P010_MASK;
            store_u16(d, pair * 2, cb);
            store_u16(d, pair * 2 + 1, cr);
        }
    }
}

fn yc48_to_p010_interlaced<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
) {
    debug_assert!(width % B == 0);
    let pitch = layout.pitch;
    let uv_offset = layout.planes[1].offset;
    copy_luma_yc48_p010::<B>(src, src_pitch, dst, layout.planes[0].offset, pitch, width, height);
    for quad in 0..height / 4 {
        let row = |i: usize| &src[(quad * 4 + i) * src_pitch..][..width * 6];
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        {
            let d = &mut dst[uv_offset + (quad * 2) * pitch..][..width * 2];
            for pair in 0..width / 2 {
                let (cb0, cr0) = yc48_chroma_pair(r0, pair);
                let (cb2, cr2) = yc48_chroma_pair(r2, pair);
                let cb = yc48_chroma16((3 * cb0 + cb2 + 2) >> 2) & P010_MASK;
                let cr = yc48_chroma16((3 * cr0 + cr2 + 2) >> 2) & P010_MASK;
                store_u16(d, pair * 2, cb);
                store_u16(d, pair * 2 + 1, cr);
            }
        }
        {
            let d = &mut dst[uv_offset + (quad * 2 + 1) * pitch..][..width * 2];
            for pair in 0..width / 2 {
                let (cb1, cr1) = yc48_chroma_pair(r1, pair);
                let (cb3, cr3) = yc48_chroma_pair(r3, pair);
                let cb = yc48_chroma16((cb1 + 3 * cb3 + 2) >> 2) & P010_MASK;
                let cr = yc48_chroma16((cr1 + 3 * cr3 + 2) >> 2) & P010_MASK;
                store_u16(d, pair * 2, cb);
                store_u16(d, pair * 2 + 1, cr);
            }
        }
    }
}

// --- yc48 -> yuv444p16 -----------------------------------------------------

fn yc48_to_yuv444p16<const B: usize>(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    layout: &PlaneLayout,
    width: usize,
    height: usize,
) {
    debug_assert!(width % B == 0);
    let pitch = layout.pitch;
    let (y_off, cb_off, cr_off) = (
        layout.planes[0].offset,
        layout.planes[1].offset,
        layout.planes[2].offset,
    );
    for row in 0..height {
        let s = &src[row * src_pitch..][..width * 6];
        for (x_block, sch) in s.chunks_exact(B * 6).enumerate() {
            for i in 0..B {
                let x = x_block * B + i;
                let y = yc48_luma16(load_i16(sch, i * 3));
                let cb = yc48_chroma16(load_i16(sch, i * 3 + 1));
                let cr = yc48_chroma16(load_i16(sch, i * 3 + 2));
                store_u16(&mut dst[y_off + row * pitch..][..width * 2], x, y);
                store_u16(&mut dst[cb_off + row * pitch..][..width * 2], x, cb);
                store_u16(&mut dst[cr_off + row * pitch..][..width * 2], x, cr);
            }
        }
    }
}

#[cfg(test)]
#[path = "convert_test.rs"]
mod convert_test;
