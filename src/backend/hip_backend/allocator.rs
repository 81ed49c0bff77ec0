//! HIP device raw allocator

use std::ptr::NonNull;

use super::error::HipError;
use super::ffi;
use super::stream::HipStream;
use crate::backend::{MemoryKind, RawAllocator};
use crate::error::DistResult;

/// Device reservations through `hipMalloc`/`hipFree`
///
/// Zeroing is queued with `hipMemsetAsync` on the allocator's own stream and
/// then synchronized, so a cleared segment reads as zeros from every stream
/// and host thread once `fill_zero` returns.
#[derive(Debug)]
pub struct HipAllocator {
    stream: HipStream,
    device: i32,
}

impl HipAllocator {
    /// `hipMalloc` returns at least 256-byte aligned pointers
    pub const ALIGNMENT: usize = 256;

    /// Allocator for device 0
    pub fn new() -> DistResult<Self> {
        Self::for_device(0)
    }

    pub fn for_device(device: i32) -> DistResult<Self> {
        if !Self::gpu_available() {
            return Err(HipError::DeviceNotFound.into());
        }

        let result = unsafe { ffi::hipSetDevice(device) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::InitializationFailed(format!(
                "hipSetDevice({}) failed: {}",
                device,
                ffi::error_string(result)
            ))
            .into());
        }

        Ok(Self {
            stream: HipStream::new()?,
            device,
        })
    }

    /// Check whether the runtime sees at least one device
    pub fn gpu_available() -> bool {
        let mut count: i32 = 0;
        let init = unsafe { ffi::hipInit(0) };
        if init != ffi::HIP_SUCCESS {
            return false;
        }
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        result == ffi::HIP_SUCCESS && count > 0
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    /// Stream used for zeroing; callers may queue dependent work on it
    pub fn stream(&self) -> &HipStream {
        &self.stream
    }

    /// Free and total device memory in bytes
    pub fn memory_info(&self) -> DistResult<(usize, usize)> {
        let mut free = 0usize;
        let mut total = 0usize;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::InitializationFailed(format!(
                "hipMemGetInfo failed: {}",
                ffi::error_string(result)
            ))
            .into());
        }
        Ok((free, total))
    }
}

impl RawAllocator for HipAllocator {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Device
    }

    fn base_alignment(&self) -> usize {
        Self::ALIGNMENT
    }

    fn raw_alloc(&mut self, bytes: usize) -> DistResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(crate::invalid_argument!("raw allocation of zero bytes"));
        }

        let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut ptr, bytes) };
        if result != ffi::HIP_SUCCESS {
            tracing::error!(
                "HipAllocator: hipMalloc failed with code {} for {} bytes",
                result,
                bytes
            );
            return Err(HipError::MemoryAllocationFailed {
                requested: bytes,
                reason: ffi::error_string(result),
            }
            .into());
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| HipError::MemoryAllocationFailed {
            requested: bytes,
            reason: "hipMalloc returned null pointer".to_string(),
        })?;

        if bytes > 1024 * 1024 * 1024 {
            tracing::debug!("HipAllocator: large reservation of {} MB", bytes / (1024 * 1024));
        }
        tracing::trace!("HipAllocator: reserved {} bytes at {:?}", bytes, ptr);
        Ok(ptr)
    }

    unsafe fn raw_free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        let result = ffi::hipFree(ptr.as_ptr() as *mut std::ffi::c_void);
        if result != ffi::HIP_SUCCESS {
            tracing::warn!(
                "HipAllocator: hipFree of {} bytes at {:?} failed: {}",
                bytes,
                ptr,
                ffi::error_string(result)
            );
        }
    }

    unsafe fn fill_zero(&mut self, ptr: NonNull<u8>, bytes: usize) -> DistResult<()> {
        let result = ffi::hipMemsetAsync(
            ptr.as_ptr() as *mut std::ffi::c_void,
            0,
            bytes,
            self.stream.as_ptr(),
        );
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::MemsetFailed(format!(
                "hipMemsetAsync of {} bytes failed: {}",
                bytes,
                ffi::error_string(result)
            ))
            .into());
        }
        self.stream.synchronize()?;
        Ok(())
    }

    unsafe fn copy_from_host(&mut self, dst: NonNull<u8>, src: &[u8]) -> DistResult<()> {
        let result = ffi::hipMemcpy(
            dst.as_ptr() as *mut std::ffi::c_void,
            src.as_ptr() as *const std::ffi::c_void,
            src.len(),
            ffi::HIP_MEMCPY_HOST_TO_DEVICE,
        );
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::MemoryCopyFailed(format!(
                "hipMemcpy H2D of {} bytes failed: {}",
                src.len(),
                ffi::error_string(result)
            ))
            .into());
        }
        Ok(())
    }

    unsafe fn copy_to_host(&mut self, src: NonNull<u8>, dst: &mut [u8]) -> DistResult<()> {
        let result = ffi::hipMemcpy(
            dst.as_mut_ptr() as *mut std::ffi::c_void,
            src.as_ptr() as *const std::ffi::c_void,
            dst.len(),
            ffi::HIP_MEMCPY_DEVICE_TO_HOST,
        );
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::MemoryCopyFailed(format!(
                "hipMemcpy D2H of {} bytes failed: {}",
                dst.len(),
                ffi::error_string(result)
            ))
            .into());
        }
        Ok(())
    }
}
