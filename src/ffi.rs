//! Adapter for a frame processor implemented behind a C ABI.
//!
//! The native side exposes two functions:
//!
//! ```c
//! typedef struct { uint8_t *data; size_t len; } NativeBuffer;
//! int process(const uint8_t *nv21, size_t len, int width, int height, NativeBuffer *out);
//! void release(NativeBuffer *buffer);
//! ```
//!
//! `process` returns zero on success and fills `out`; the buffer is copied
//! and handed back through `release`. A null or empty buffer means the
//! routine had nothing to report for that frame.

use std::ffi::c_int;

use crate::processor::{FrameProcessor, ProcessingError};
use crate::types::Resolution;

/// Output buffer owned by the native side.
#[repr(C)]
#[derive(Debug)]
pub struct NativeBuffer {
    pub data: *mut u8,
    pub len: usize,
}

impl NativeBuffer {
    const fn empty() -> Self {
        NativeBuffer {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }
}

pub type ProcessFn = unsafe extern "C" fn(
    data: *const u8,
    len: usize,
    width: c_int,
    height: c_int,
    out: *mut NativeBuffer,
) -> c_int;

pub type ReleaseFn = unsafe extern "C" fn(buffer: *mut NativeBuffer);

/// A [`FrameProcessor`] backed by native entry points.
#[derive(Debug, Clone, Copy)]
pub struct NativeProcessor {
    process: ProcessFn,
    release: ReleaseFn,
}

impl NativeProcessor {
    /// # Safety
    ///
    /// `process` must only read `len` bytes from `data`, must be callable
    /// from any thread, and must leave `out` either untouched or pointing at
    /// `len` readable bytes that stay valid until `release` is called on it.
    pub unsafe fn new(process: ProcessFn, release: ReleaseFn) -> Self {
        NativeProcessor { process, release }
    }
}

impl FrameProcessor for NativeProcessor {
    fn process_frame(
        &self,
        nv21: &[u8],
        resolution: Resolution,
    ) -> Result<Vec<u8>, ProcessingError> {
        let width = c_int::try_from(resolution.width)
            .map_err(|_| ProcessingError::InvalidInput("width out of range"))?;
        let height = c_int::try_from(resolution.height)
            .map_err(|_| ProcessingError::InvalidInput("height out of range"))?;
        if width <= 0 || height <= 0 {
            return Err(ProcessingError::InvalidInput("non-positive dimensions"));
        }
        if nv21.is_empty() {
            return Err(ProcessingError::InvalidInput("empty frame"));
        }

        let mut out = NativeBuffer::empty();
        // SAFETY: the input slice outlives the call and the contract on
        // `new` bounds what the callee does with it.
        let status = unsafe { (self.process)(nv21.as_ptr(), nv21.len(), width, height, &mut out) };

        let result = if status != 0 {
            Err(ProcessingError::NativeStatus(status))
        } else if out.data.is_null() || out.len == 0 {
            Err(ProcessingError::NoOutput)
        } else {
            // SAFETY: on success the callee promised `len` readable bytes.
            Ok(unsafe { std::slice::from_raw_parts(out.data, out.len) }.to_vec())
        };

        if !out.data.is_null() {
            // SAFETY: buffer came from `process` and is released exactly once.
            unsafe { (self.release)(&mut out) };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    /// Emits one RGBA pixel per luma sample, grey level = luma.
    unsafe extern "C" fn luma_to_rgba(
        data: *const u8,
        len: usize,
        width: c_int,
        height: c_int,
        out: *mut NativeBuffer,
    ) -> c_int {
        let pixels = (width * height) as usize;
        if len < pixels {
            return -1;
        }
        let input = unsafe { std::slice::from_raw_parts(data, len) };
        let rgba: Box<[u8]> = input[..pixels]
            .iter()
            .flat_map(|&l| [l, l, l, 255])
            .collect();
        let len = rgba.len();
        let data = Box::into_raw(rgba) as *mut u8;
        unsafe { *out = NativeBuffer { data, len } };
        0
    }

    unsafe extern "C" fn free_boxed(buffer: *mut NativeBuffer) {
        let buffer = unsafe { &mut *buffer };
        let slice = std::ptr::slice_from_raw_parts_mut(buffer.data, buffer.len);
        drop(unsafe { Box::from_raw(slice) });
        buffer.data = std::ptr::null_mut();
        RELEASED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn always_fails(
        _: *const u8,
        _: usize,
        _: c_int,
        _: c_int,
        _: *mut NativeBuffer,
    ) -> c_int {
        -7
    }

    unsafe extern "C" fn produces_nothing(
        _: *const u8,
        _: usize,
        _: c_int,
        _: c_int,
        _: *mut NativeBuffer,
    ) -> c_int {
        0
    }

    #[test]
    fn successful_call_copies_and_releases_output() {
        let before = RELEASED.load(Ordering::SeqCst);
        let processor = unsafe { NativeProcessor::new(luma_to_rgba, free_boxed) };
        let out = processor
            .process_frame(&[9, 8, 7, 6, 0, 0], Resolution::new(2, 2))
            .unwrap();
        assert_eq!(&out[..8], &[9, 9, 9, 255, 8, 8, 8, 255]);
        assert_eq!(out.len(), 16);
        assert!(RELEASED.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn non_zero_status_is_an_error() {
        let processor = unsafe { NativeProcessor::new(always_fails, free_boxed) };
        assert_eq!(
            processor.process_frame(&[0; 6], Resolution::new(2, 2)),
            Err(ProcessingError::NativeStatus(-7))
        );
    }

    #[test]
    fn missing_output_is_reported() {
        let processor = unsafe { NativeProcessor::new(produces_nothing, free_boxed) };
        assert_eq!(
            processor.process_frame(&[0; 6], Resolution::new(2, 2)),
            Err(ProcessingError::NoOutput)
        );
    }

    #[test]
    fn invalid_input_never_crosses_the_boundary() {
        let processor = unsafe { NativeProcessor::new(always_fails, free_boxed) };
        assert!(matches!(
            processor.process_frame(&[0; 6], Resolution::new(0, 2)),
            Err(ProcessingError::InvalidInput(_))
        ));
        assert!(matches!(
            processor.process_frame(&[], Resolution::new(2, 2)),
            Err(ProcessingError::InvalidInput(_))
        ));
        assert!(matches!(
            processor.process_frame(&[0; 6], Resolution::new(u32::MAX, 2)),
            Err(ProcessingError::InvalidInput(_))
        ));
    }
}
