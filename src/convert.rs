//! YUV 4:2:0 to NV21 conversion.
//!
//! The output is the luma plane row-major, followed by one `(V, U)` pair per
//! 2x2 block over the subsampled grid. Output bytes depend only on sample
//! values, never on how the source planes are strided.

use thiserror::Error;

use crate::frame::{Frame, Plane};
use crate::types::{PixelFormat, Resolution};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("cannot convert {0:?} frames")]
    UnsupportedFormat(PixelFormat),
    #[error("expected 3 planes, frame has {0}")]
    MissingPlanes(usize),
    #[error("{plane} plane holds {actual} bytes, layout needs {needed}")]
    PlaneTooSmall {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },
}

/// Length of an NV21 buffer for `resolution`.
pub const fn nv21_len(resolution: Resolution) -> usize {
    let luma = resolution.pixel_count();
    luma + luma / 2
}

/// Convert a YUV 4:2:0 [`Frame`] to NV21.
pub fn frame_to_nv21<F: Frame + ?Sized>(frame: &F) -> Result<Vec<u8>, ConversionError> {
    let format = frame.pixel_format();
    if format != PixelFormat::Yuv420 {
        return Err(ConversionError::UnsupportedFormat(format));
    }
    let planes = frame.planes();
    match planes.as_slice() {
        [y, u, v] => yuv420_to_nv21(y, u, v, frame.resolution()),
        other => Err(ConversionError::MissingPlanes(other.len())),
    }
}

/// Convert three YUV 4:2:0 planes to NV21.
///
/// The buffer is always `width * height * 3 / 2` bytes. With odd dimensions
/// the chroma grid is floored and the unused tail stays zero.
pub fn yuv420_to_nv21(
    y: &Plane<'_>,
    u: &Plane<'_>,
    v: &Plane<'_>,
    resolution: Resolution,
) -> Result<Vec<u8>, ConversionError> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let chroma_width = width / 2;
    let chroma_height = height / 2;

    check_len("luma", y, width, height)?;
    check_len("U", u, chroma_width, chroma_height)?;
    check_len("V", v, chroma_width, chroma_height)?;

    let len = nv21_len(resolution);
    let mut out = Vec::with_capacity(len);
    copy_luma(y, width, height, &mut out);
    interleave_chroma(u, v, chroma_width, chroma_height, &mut out);
    out.resize(len, 0);
    Ok(out)
}

fn check_len(
    plane: &'static str,
    p: &Plane<'_>,
    columns: usize,
    rows: usize,
) -> Result<(), ConversionError> {
    let needed = p.required_len(columns, rows);
    if p.data.len() < needed {
        return Err(ConversionError::PlaneTooSmall {
            plane,
            needed,
            actual: p.data.len(),
        });
    }
    Ok(())
}

fn copy_luma(y: &Plane<'_>, width: usize, height: usize, out: &mut Vec<u8>) {
    if y.pixel_stride == 1 && y.row_stride == width {
        out.extend_from_slice(&y.data[..width * height]);
        return;
    }

    if y.pixel_stride == 1 {
        // Padded rows: copy each row's visible prefix.
        for row in 0..height {
            let start = row * y.row_stride;
            out.extend_from_slice(&y.data[start..start + width]);
        }
        return;
    }

    for row in 0..height {
        let start = row * y.row_stride;
        out.extend((0..width).map(|col| y.data[start + col * y.pixel_stride]));
    }
}

fn interleave_chroma(
    u: &Plane<'_>,
    v: &Plane<'_>,
    chroma_width: usize,
    chroma_height: usize,
    out: &mut Vec<u8>,
) {
    for row in 0..chroma_height {
        let u_row = row * u.row_stride;
        let v_row = row * v.row_stride;
        for col in 0..chroma_width {
            out.push(v.data[v_row + col * v.pixel_stride]);
            out.push(u.data[u_row + col * u.pixel_stride]);
        }
    }
}
