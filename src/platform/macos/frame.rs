use std::time::Duration;

use arrayvec::ArrayVec;
use objc2_core_foundation::CFRetained;
use objc2_core_media::CMTime;
use objc2_core_video::{
    CVPixelBuffer, CVPixelBufferGetBaseAddressOfPlane, CVPixelBufferGetBytesPerRowOfPlane,
    CVPixelBufferGetHeight, CVPixelBufferGetHeightOfPlane, CVPixelBufferGetPixelFormatType,
    CVPixelBufferGetPlaneCount, CVPixelBufferGetWidth, CVPixelBufferLockBaseAddress,
    CVPixelBufferLockFlags, CVPixelBufferUnlockBaseAddress,
};

use crate::frame::{Frame, MAX_PLANES, Plane};
use crate::types::{PixelFormat, Resolution};

// kCVPixelFormatType values
#[allow(clippy::mistyped_literal_suffixes)]
pub(crate) const FOURCC_420_VIDEO_RANGE: u32 = 0x34_32_30_76; // '420v'
#[allow(clippy::mistyped_literal_suffixes)]
pub(crate) const FOURCC_420_FULL_RANGE: u32 = 0x34_32_30_66; // '420f'

pub(crate) fn is_biplanar_420(fourcc: u32) -> bool {
    matches!(fourcc, FOURCC_420_VIDEO_RANGE | FOURCC_420_FULL_RANGE)
}

pub(crate) fn cm_time_to_duration(time: CMTime) -> Duration {
    if time.timescale > 0 && time.value >= 0 {
        Duration::from_secs_f64(time.value as f64 / time.timescale as f64)
    } else {
        Duration::ZERO
    }
}

struct RawPlane {
    base: *const u8,
    len: usize,
    row_stride: usize,
}

/// A bi-planar 4:2:0 frame backed by a retained `CVPixelBuffer`.
///
/// The buffer stays locked for reading until the frame is dropped, which
/// hands it back to the capture pipeline. Chroma is exposed as two views
/// into the interleaved CbCr plane.
pub struct MacosFrame {
    pixel_buffer: CFRetained<CVPixelBuffer>,
    planes: ArrayVec<RawPlane, 2>,
    resolution: Resolution,
    timestamp: Duration,
}

// SAFETY: CVPixelBuffer is reference counted and safe to retain/release from
// any thread. The plane pointers stay valid while the base address is locked,
// and the lock is only released in `Drop`.
unsafe impl Send for MacosFrame {}

impl MacosFrame {
    /// Lock `pixel_buffer` and wrap it. Returns `None` for buffers that are
    /// not bi-planar 4:2:0 or cannot be locked.
    pub(crate) fn lock(pixel_buffer: CFRetained<CVPixelBuffer>, timestamp: Duration) -> Option<Self> {
        let fourcc = CVPixelBufferGetPixelFormatType(&pixel_buffer);
        if !is_biplanar_420(fourcc) || CVPixelBufferGetPlaneCount(&pixel_buffer) != 2 {
            return None;
        }
        let status =
            unsafe { CVPixelBufferLockBaseAddress(&pixel_buffer, CVPixelBufferLockFlags::ReadOnly) };
        if status != 0 {
            return None;
        }

        let planes: ArrayVec<RawPlane, 2> = (0..2)
            .filter_map(|i| {
                let base = CVPixelBufferGetBaseAddressOfPlane(&pixel_buffer, i);
                if base.is_null() {
                    return None;
                }
                let row_stride = CVPixelBufferGetBytesPerRowOfPlane(&pixel_buffer, i);
                let rows = CVPixelBufferGetHeightOfPlane(&pixel_buffer, i);
                Some(RawPlane {
                    base: base as *const u8,
                    len: row_stride * rows,
                    row_stride,
                })
            })
            .collect();
        let resolution = Resolution::new(
            CVPixelBufferGetWidth(&pixel_buffer) as u32,
            CVPixelBufferGetHeight(&pixel_buffer) as u32,
        );

        let frame = MacosFrame {
            pixel_buffer,
            planes,
            resolution,
            timestamp,
        };
        // Unlocked again by `Drop` if a plane is missing.
        (frame.planes.len() == 2).then_some(frame)
    }

    fn plane_bytes(&self, index: usize) -> &[u8] {
        match self.planes.get(index) {
            // SAFETY: the buffer is locked for reading for as long as `self`.
            Some(p) => unsafe { std::slice::from_raw_parts(p.base, p.len) },
            None => &[],
        }
    }
}

impl Frame for MacosFrame {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn planes(&self) -> ArrayVec<Plane<'_>, MAX_PLANES> {
        let luma_stride = self.planes.first().map_or(0, |p| p.row_stride);
        let chroma_stride = self.planes.get(1).map_or(0, |p| p.row_stride);
        let cbcr = self.plane_bytes(1);
        let mut planes = ArrayVec::new();
        planes.push(Plane::new(self.plane_bytes(0), luma_stride, 1));
        planes.push(Plane::new(cbcr, chroma_stride, 2));
        planes.push(Plane::new(cbcr.get(1..).unwrap_or_default(), chroma_stride, 2));
        planes
    }

    fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

impl Drop for MacosFrame {
    fn drop(&mut self) {
        unsafe {
            CVPixelBufferUnlockBaseAddress(&self.pixel_buffer, CVPixelBufferLockFlags::ReadOnly);
        }
    }
}
