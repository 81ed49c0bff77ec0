//! ROCm/HIP device memory backend
//!
//! Compiled only with the `rocm` feature.

mod allocator;
mod error;
mod ffi;
mod stream;

pub use allocator::HipAllocator;
pub use error::{HipError, HipResult};
pub use stream::HipStream;
