//! HIP FFI bindings
//!
//! Only the runtime entry points needed for pooled device memory: device
//! discovery, malloc/free, memset, copies and stream ordering.

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
    pub fn hipMemsetAsync(dst: *mut c_void, value: i32, count: usize, stream: *mut c_void) -> i32;
    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
}

/// HIP memory copy kinds
pub const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// hipErrorOutOfMemory
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// Human readable name for a HIP status code
pub fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static NUL-terminated string or null
    let ptr = unsafe { hipGetErrorString(code) };
    if ptr.is_null() {
        return format!("hip error {}", code);
    }
    unsafe { std::ffi::CStr::from_ptr(ptr as *const std::ffi::c_char) }
        .to_string_lossy()
        .into_owned()
}
