//! HIP stream wrapper

use std::ptr;

use super::error::{HipError, HipResult};
use super::ffi;

// SAFETY: the stream handle is an opaque runtime object; HIP allows it to be
// used from any host thread
unsafe impl Send for HipStream {}
unsafe impl Sync for HipStream {}

/// Owned HIP stream, destroyed on drop
///
/// Not `Clone`: two owners would destroy the same stream twice.
#[derive(Debug)]
pub struct HipStream {
    stream: *mut std::ffi::c_void,
}

impl HipStream {
    pub fn new() -> HipResult<Self> {
        let mut stream: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipStreamCreate(&mut stream) };

        if result != ffi::HIP_SUCCESS {
            return Err(HipError::StreamError(format!(
                "hipStreamCreate failed: {}",
                ffi::error_string(result)
            )));
        }
        if stream.is_null() {
            return Err(HipError::StreamError(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }

        tracing::debug!("HipStream::new: created stream {:?}", stream);
        Ok(HipStream { stream })
    }

    /// Block until all work queued on the stream has finished
    pub fn synchronize(&self) -> HipResult<()> {
        let result = unsafe { ffi::hipStreamSynchronize(self.stream) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::StreamError(format!(
                "hipStreamSynchronize failed: {}",
                ffi::error_string(result)
            )));
        }
        Ok(())
    }

    /// Raw stream pointer for FFI calls
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.stream
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if !self.stream.is_null() {
            unsafe {
                ffi::hipStreamDestroy(self.stream);
            }
        }
    }
}
