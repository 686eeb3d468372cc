use core::time::Duration;

use arrayvec::ArrayVec;
use thiserror::Error;

use crate::types::{PixelFormat, Resolution};

/// Maximum number of planes a frame exposes (Y, U, V).
pub const MAX_PLANES: usize = 3;

/// A read-only view over one plane of image data.
///
/// `row_stride` is the byte distance between the starts of two rows and
/// `pixel_stride` the byte distance between two samples in a row. Both may
/// exceed the logical sample size when the producer pads or interleaves.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [u8], row_stride: usize, pixel_stride: usize) -> Self {
        Plane {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// Bytes needed to address `columns` x `rows` samples with this layout.
    ///
    /// Saturates instead of overflowing, so an absurd stride simply yields a
    /// length no buffer can satisfy.
    pub fn required_len(&self, columns: usize, rows: usize) -> usize {
        if columns == 0 || rows == 0 {
            return 0;
        }
        (rows - 1)
            .saturating_mul(self.row_stride)
            .saturating_add((columns - 1).saturating_mul(self.pixel_stride))
            .saturating_add(1)
    }
}

/// A frame exclusively held by its consumer until dropped.
///
/// Plane views borrow from the frame, so they cannot outlive the release of
/// the underlying buffer.
pub trait Frame {
    fn pixel_format(&self) -> PixelFormat;
    fn resolution(&self) -> Resolution;
    fn planes(&self) -> ArrayVec<Plane<'_>, MAX_PLANES>;
    fn timestamp(&self) -> Duration;
}

impl<F: Frame + ?Sized> Frame for Box<F> {
    fn pixel_format(&self) -> PixelFormat {
        (**self).pixel_format()
    }

    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn planes(&self) -> ArrayVec<Plane<'_>, MAX_PLANES> {
        (**self).planes()
    }

    fn timestamp(&self) -> Duration {
        (**self).timestamp()
    }
}

/// Where one plane lives inside a [`YuvFrame`]'s backing buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Index of the backing buffer.
    pub buffer: usize,
    /// Byte offset of the first sample.
    pub offset: usize,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl PlaneLayout {
    pub const fn new(buffer: usize, offset: usize, row_stride: usize, pixel_stride: usize) -> Self {
        PlaneLayout {
            buffer,
            offset,
            row_stride,
            pixel_stride,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("plane {plane} refers to missing buffer {buffer}")]
    MissingBuffer { plane: usize, buffer: usize },
    #[error("plane {plane} starts at {offset}, past the end of buffer {buffer} ({len} bytes)")]
    OffsetOutOfBounds {
        plane: usize,
        buffer: usize,
        offset: usize,
        len: usize,
    },
}

/// An owned YUV 4:2:0 frame.
///
/// Planes are views into up to three backing buffers, so both fully planar
/// and semi-planar (interleaved chroma) producers can be represented without
/// copying.
#[derive(Debug, Clone)]
pub struct YuvFrame {
    resolution: Resolution,
    timestamp: Duration,
    buffers: ArrayVec<Vec<u8>, MAX_PLANES>,
    layout: [PlaneLayout; MAX_PLANES],
}

impl YuvFrame {
    /// Build a frame from backing buffers and a Y, U, V plane layout.
    pub fn new(
        resolution: Resolution,
        buffers: impl IntoIterator<Item = Vec<u8>>,
        layout: [PlaneLayout; MAX_PLANES],
    ) -> Result<Self, LayoutError> {
        let buffers: ArrayVec<Vec<u8>, MAX_PLANES> = buffers.into_iter().take(MAX_PLANES).collect();
        for (plane, l) in layout.iter().enumerate() {
            let buffer = buffers.get(l.buffer).ok_or(LayoutError::MissingBuffer {
                plane,
                buffer: l.buffer,
            })?;
            if l.offset > buffer.len() {
                return Err(LayoutError::OffsetOutOfBounds {
                    plane,
                    buffer: l.buffer,
                    offset: l.offset,
                    len: buffer.len(),
                });
            }
        }
        Ok(YuvFrame {
            resolution,
            timestamp: Duration::ZERO,
            buffers,
            layout,
        })
    }

    /// Three tightly packed planes.
    pub fn planar(resolution: Resolution, y: Vec<u8>, u: Vec<u8>, v: Vec<u8>) -> Self {
        let width = resolution.width as usize;
        let chroma_width = width / 2;
        YuvFrame {
            resolution,
            timestamp: Duration::ZERO,
            buffers: ArrayVec::from([y, u, v]),
            layout: [
                PlaneLayout::new(0, 0, width, 1),
                PlaneLayout::new(1, 0, chroma_width, 1),
                PlaneLayout::new(2, 0, chroma_width, 1),
            ],
        }
    }

    /// A luma buffer plus one buffer of interleaved V/U pairs, the layout
    /// most mobile camera stacks hand out for flexible YUV 4:2:0.
    pub fn semi_planar_vu(
        resolution: Resolution,
        y: Vec<u8>,
        y_row_stride: usize,
        vu: Vec<u8>,
        vu_row_stride: usize,
    ) -> Self {
        let u_offset = usize::from(!vu.is_empty());
        YuvFrame {
            resolution,
            timestamp: Duration::ZERO,
            buffers: [y, vu].into_iter().collect(),
            layout: [
                PlaneLayout::new(0, 0, y_row_stride, 1),
                PlaneLayout::new(1, u_offset, vu_row_stride, 2),
                PlaneLayout::new(1, 0, vu_row_stride, 2),
            ],
        }
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn layout(&self) -> &[PlaneLayout; MAX_PLANES] {
        &self.layout
    }
}

impl Frame for YuvFrame {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn planes(&self) -> ArrayVec<Plane<'_>, MAX_PLANES> {
        self.layout
            .iter()
            .map(|l| Plane {
                data: &self.buffers[l.buffer][l.offset..],
                row_stride: l.row_stride,
                pixel_stride: l.pixel_stride,
            })
            .collect()
    }

    fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_len_accounts_for_strides() {
        let data = [0u8; 64];
        let plane = Plane::new(&data, 8, 2);
        // Last sample of a 3x2 grid sits at 1*8 + 2*2.
        assert_eq!(plane.required_len(3, 2), 13);
        assert_eq!(plane.required_len(0, 2), 0);
        assert_eq!(plane.required_len(3, 0), 0);
    }

    #[test]
    fn required_len_saturates() {
        let plane = Plane::new(&[], usize::MAX, usize::MAX);
        assert_eq!(plane.required_len(4, 4), usize::MAX);
    }

    #[test]
    fn semi_planar_views_share_one_buffer() {
        let frame = YuvFrame::semi_planar_vu(
            Resolution::new(4, 2),
            vec![0; 8],
            4,
            vec![10, 30, 20, 40],
            4,
        );
        let planes = frame.planes();
        assert_eq!(planes.len(), 3);
        // U view starts one byte into the interleaved buffer.
        assert_eq!(planes[1].data, &[30, 20, 40]);
        assert_eq!(planes[2].data, &[10, 30, 20, 40]);
        assert_eq!(planes[1].pixel_stride, 2);
    }

    #[test]
    fn new_rejects_missing_buffer() {
        let layout = [
            PlaneLayout::new(0, 0, 2, 1),
            PlaneLayout::new(1, 0, 1, 1),
            PlaneLayout::new(2, 0, 1, 1),
        ];
        let err = YuvFrame::new(Resolution::new(2, 2), [vec![0; 4], vec![0; 1]], layout).unwrap_err();
        assert_eq!(err, LayoutError::MissingBuffer { plane: 2, buffer: 2 });
    }

    #[test]
    fn new_rejects_offset_past_end() {
        let layout = [
            PlaneLayout::new(0, 0, 2, 1),
            PlaneLayout::new(0, 9, 1, 1),
            PlaneLayout::new(0, 4, 1, 1),
        ];
        let err = YuvFrame::new(Resolution::new(2, 2), [vec![0; 6]], layout).unwrap_err();
        assert!(matches!(err, LayoutError::OffsetOutOfBounds { plane: 1, .. }));
    }
}
