//! Device abstraction: backend seam, context, dispatch machinery.

pub mod backend;
pub mod context;
pub mod host;
pub mod kernel;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::error::Result;
use crate::gpu::backend::ComputeBackend;

/// Opens the CUDA device if the feature is enabled and a device responds,
/// falling back to the host reference backend otherwise.
pub fn open_default_backend() -> Result<Box<dyn ComputeBackend>> {
    #[cfg(feature = "cuda")]
    {
        match cuda::CudaBackend::new() {
            Ok(b) => return Ok(Box::new(b)),
            Err(e) => tracing::warn!(error = %e, "CUDA unavailable, using host backend"),
        }
    }
    Ok(Box::new(host::HostBackend::new()))
}
