//! The compute-platform capability seam.
//!
//! The pipeline consumes the platform as a single capability: "compile and
//! execute a kernel program against bound arguments". Everything above this
//! trait (allocation table, dispatch validation, completion ordering) is
//! host-side orchestration and backend-agnostic.
//!
//! Scalar kernel arguments travel in two packed trailing buffers (`shape`
//! ints and `params` floats) so that every kernel signature is buffers-only
//! and launches stay uniform across backends.

use crate::error::Result;

/// Backend-internal buffer identifier. Never handed to pipeline code
/// directly; the context maps its own stable handles onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendBuf(pub(crate) usize);

/// Backend-internal identifier of one compiled entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKernel(pub(crate) usize);

/// Device-reported limits, cached at backend construction and used to
/// front-load dispatch validation.
#[derive(Debug, Clone)]
pub struct DeviceLimits {
    /// Human-readable device name for logs and error messages.
    pub name: String,
    /// Maximum work-items per work-group (product over all dimensions).
    pub max_work_group_size: usize,
    /// Per-dimension work-group size limits.
    pub max_work_item_sizes: [usize; 3],
    /// Local (shared) memory budget per work-group, in bytes.
    pub local_mem_bytes: usize,
    /// Upper bound on total global work-items in a single dispatch.
    pub max_global_work_items: usize,
}

/// Per-kernel limits reported after compilation.
#[derive(Debug, Clone, Copy)]
pub struct KernelLimits {
    /// Maximum work-group size this specific kernel supports (may be lower
    /// than the device limit due to register pressure).
    pub max_work_group_size: usize,
    /// Private memory consumed per work-item, in bytes.
    pub private_mem_bytes: usize,
}

/// One enqueued unit of device work, fully resolved to backend identifiers.
pub struct LaunchRequest<'a> {
    pub kernel: BackendKernel,
    pub global: [usize; 3],
    pub local: [usize; 3],
    pub local_mem_bytes: usize,
    /// Positional buffer arguments, in the kernel's declared order.
    pub bufs: &'a [BackendBuf],
    /// Packed integer scalars (the kernel's trailing `shape` argument).
    pub shape: &'a [i32],
    /// Packed float scalars (the kernel's trailing `params` argument).
    pub params: &'a [f32],
}

/// Compile-and-execute capability provided by a compute platform.
///
/// One backend instance corresponds to one device plus one in-order command
/// queue; enqueued work executes in submission order. Used from a single
/// thread by design — no interior locking.
pub trait ComputeBackend {
    /// Backend name for logs ("cuda", "host").
    fn name(&self) -> &'static str;

    /// Device limits, cached at construction.
    fn limits(&self) -> &DeviceLimits;

    /// Reserve `byte_size` bytes of device memory.
    fn alloc(&mut self, byte_size: usize) -> Result<BackendBuf>;

    /// Release one allocation. The context guarantees each id is freed at
    /// most once.
    fn free(&mut self, buf: BackendBuf) -> Result<()>;

    /// Blocking host-to-device copy into `[byte_offset, byte_offset + len)`.
    /// The caller has already range-checked against the recorded size.
    fn write(&mut self, buf: BackendBuf, byte_offset: usize, data: &[u8]) -> Result<()>;

    /// Blocking device-to-host copy; synchronizes outstanding work first.
    fn read(&mut self, buf: BackendBuf, byte_offset: usize, out: &mut [u8]) -> Result<()>;

    /// Compile `source` with `options` and resolve `entry`. Fails fatally
    /// with the platform's build log on compile error.
    fn compile(&mut self, source: &str, options: &str, entry: &str) -> Result<BackendKernel>;

    /// Limits of one compiled kernel.
    fn kernel_limits(&self, kernel: BackendKernel) -> KernelLimits;

    /// Enqueue one kernel execution. Non-blocking on devices with a real
    /// queue; the in-order queue provides the ordering the completion-token
    /// chain promises.
    fn launch(&mut self, req: &LaunchRequest<'_>) -> Result<()>;

    /// Barrier: returns once all previously enqueued work is visible.
    fn synchronize(&mut self) -> Result<()>;
}
