//! Device context: allocation table, kernel table, completion bookkeeping.
//!
//! The context is the single owner of everything device-side. Pipeline code
//! holds opaque `BufferHandle`/`KernelHandle` indices into the context's
//! tables, never backend identifiers. Handles are stable for the context's
//! lifetime: release tombstones a slot instead of compacting, so an old
//! handle can never silently alias a newer allocation.
//!
//! One context, one thread, one in-order device queue. No locking anywhere
//! because concurrent host access is unsupported.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::cnn::kernels::KERNEL_ROSTER;
use crate::error::{Result, SrcnnError};
use crate::gpu::backend::{BackendBuf, BackendKernel, ComputeBackend, DeviceLimits, KernelLimits};
use crate::gpu::kernel::CompletionToken;

/// Allocation-table capacity. Hitting it is a wiring bug, not load.
pub const MAX_ALLOCATIONS: usize = 256;
/// Kernel-table capacity.
pub const MAX_KERNELS: usize = 32;

/// Stable index into the context's allocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle(usize);

/// Stable index into the context's kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle(usize);

/// Declared device-side access pattern for an allocation. Advisory: recorded
/// for diagnostics and forwarded to backends that can exploit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlags {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

struct AllocEntry {
    backend: BackendBuf,
    byte_size: usize,
    flags: MemFlags,
    live: bool,
}

struct KernelEntry {
    backend: BackendKernel,
    entry: &'static str,
    limits: KernelLimits,
}

/// Timing record for one dispatch, collected in profiling mode.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub entry: &'static str,
    pub token: CompletionToken,
    pub elapsed_us: u128,
}

pub struct ComputeContext {
    backend: Box<dyn ComputeBackend>,
    allocations: Vec<AllocEntry>,
    live_allocations: usize,
    kernels: Vec<KernelEntry>,
    next_token: u64,
    profiling: bool,
    profile: Vec<DispatchRecord>,
}

impl ComputeContext {
    pub fn new(backend: Box<dyn ComputeBackend>) -> Self {
        debug!(backend = backend.name(), device = %backend.limits().name, "compute context up");
        ComputeContext {
            backend,
            allocations: Vec::new(),
            live_allocations: 0,
            kernels: Vec::new(),
            next_token: 0,
            profiling: false,
            profile: Vec::new(),
        }
    }

    /// Profiling mode: every dispatch is bracketed by full barriers and its
    /// wall time recorded. Serializes the queue; measurement only.
    pub fn with_profiling(backend: Box<dyn ComputeBackend>) -> Self {
        let mut ctx = Self::new(backend);
        ctx.profiling = true;
        ctx
    }

    pub fn device_limits(&self) -> &DeviceLimits {
        self.backend.limits()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn profile(&self) -> &[DispatchRecord] {
        &self.profile
    }

    pub fn live_allocations(&self) -> usize {
        self.live_allocations
    }

    fn entry(&self, h: BufferHandle) -> Result<&AllocEntry> {
        let e = self
            .allocations
            .get(h.0)
            .ok_or_else(|| SrcnnError::SizeMismatch(format!("buffer handle {} out of range", h.0)))?;
        if !e.live {
            return Err(SrcnnError::SizeMismatch(format!(
                "buffer handle {} already released",
                h.0
            )));
        }
        Ok(e)
    }

    /// Reserves `byte_size` bytes of device memory.
    pub fn allocate(&mut self, flags: MemFlags, byte_size: usize) -> Result<BufferHandle> {
        if byte_size == 0 {
            return Err(SrcnnError::SizeMismatch(
                "zero-byte allocation requested".to_string(),
            ));
        }
        if self.live_allocations >= MAX_ALLOCATIONS {
            return Err(SrcnnError::ResourceLimit(format!(
                "allocation table full ({MAX_ALLOCATIONS} live allocations)"
            )));
        }
        let backend = self.backend.alloc(byte_size)?;
        self.allocations.push(AllocEntry {
            backend,
            byte_size,
            flags,
            live: true,
        });
        self.live_allocations += 1;
        let h = BufferHandle(self.allocations.len() - 1);
        trace!(handle = h.0, byte_size, ?flags, "allocated device buffer");
        Ok(h)
    }

    /// Releases one allocation. Idempotent: releasing an already-released
    /// handle is a no-op.
    pub fn release(&mut self, h: BufferHandle) -> Result<()> {
        let e = self
            .allocations
            .get_mut(h.0)
            .ok_or_else(|| SrcnnError::SizeMismatch(format!("buffer handle {} out of range", h.0)))?;
        if !e.live {
            return Ok(());
        }
        e.live = false;
        let backend = e.backend;
        self.backend.free(backend)?;
        self.live_allocations -= 1;
        trace!(handle = h.0, "released device buffer");
        Ok(())
    }

    /// Recorded byte size of a live allocation.
    pub fn buffer_size(&self, h: BufferHandle) -> Result<usize> {
        Ok(self.entry(h)?.byte_size)
    }

    pub fn write_bytes(&mut self, h: BufferHandle, byte_offset: usize, data: &[u8]) -> Result<()> {
        let e = self.entry(h)?;
        if byte_offset + data.len() > e.byte_size {
            return Err(SrcnnError::SizeMismatch(format!(
                "write of {} bytes at offset {} exceeds allocation of {} bytes",
                data.len(),
                byte_offset,
                e.byte_size
            )));
        }
        let backend = e.backend;
        self.backend.write(backend, byte_offset, data)
    }

    pub fn read_bytes(&mut self, h: BufferHandle, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let e = self.entry(h)?;
        if byte_offset + out.len() > e.byte_size {
            return Err(SrcnnError::SizeMismatch(format!(
                "read of {} bytes at offset {} exceeds allocation of {} bytes",
                out.len(),
                byte_offset,
                e.byte_size
            )));
        }
        let backend = e.backend;
        self.backend.read(backend, byte_offset, out)
    }

    pub fn write_f32(&mut self, h: BufferHandle, data: &[f32]) -> Result<()> {
        self.write_bytes(h, 0, bytemuck::cast_slice(data))
    }

    pub fn read_f32(&mut self, h: BufferHandle, out: &mut [f32]) -> Result<()> {
        self.read_bytes(h, 0, bytemuck::cast_slice_mut(out))
    }

    /// Reads the fixed-point reduction accumulator: raw 64 bits reinterpreted
    /// as two's-complement.
    pub fn read_i64(&mut self, h: BufferHandle) -> Result<i64> {
        let mut raw = [0u8; 8];
        self.read_bytes(h, 0, &mut raw)?;
        Ok(i64::from_le_bytes(raw))
    }

    /// Overwrites the whole allocation with zeroes via a host-built vector;
    /// no device-native fill is assumed of the backend.
    pub fn zero_fill(&mut self, h: BufferHandle) -> Result<()> {
        let size = self.entry(h)?.byte_size;
        let zeroes = vec![0u8; size];
        self.write_bytes(h, 0, &zeroes)
    }

    /// Compiles and registers the roster program that provides `entry`.
    pub fn create_kernel(&mut self, entry: &'static str) -> Result<KernelHandle> {
        if self.kernels.len() >= MAX_KERNELS {
            return Err(SrcnnError::ResourceLimit(format!(
                "kernel table full ({MAX_KERNELS} kernels)"
            )));
        }
        let (_, source) = KERNEL_ROSTER
            .iter()
            .find(|(name, _)| *name == entry)
            .ok_or_else(|| SrcnnError::Device(format!("no program provides entry '{entry}'")))?;
        let backend = self.backend.compile(source, "", entry)?;
        let limits = self.backend.kernel_limits(backend);
        self.kernels.push(KernelEntry {
            backend,
            entry,
            limits,
        });
        let h = KernelHandle(self.kernels.len() - 1);
        debug!(entry, handle = h.0, "created kernel");
        Ok(h)
    }

    pub fn kernel_limits(&self, h: KernelHandle) -> Result<KernelLimits> {
        Ok(self.kernel_entry(h)?.limits)
    }

    fn kernel_entry(&self, h: KernelHandle) -> Result<&KernelEntry> {
        self.kernels
            .get(h.0)
            .ok_or_else(|| SrcnnError::Device(format!("kernel handle {} out of range", h.0)))
    }

    /// Barrier: returns once everything previously enqueued is visible.
    pub fn block(&mut self) -> Result<()> {
        self.backend.synchronize()
    }

    /// Enqueues one validated dispatch and issues its completion token.
    /// Called by the dispatch builder; the builder has already validated
    /// work sizes against device and kernel limits.
    pub(crate) fn enqueue(
        &mut self,
        kernel: KernelHandle,
        global: [usize; 3],
        local: [usize; 3],
        local_mem_bytes: usize,
        bufs: &[BufferHandle],
        shape: &[i32],
        params: &[f32],
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        // The queue is in-order, so every issued token is already complete
        // or ahead of us; predecessors only need to predate this dispatch.
        for t in wait {
            if t.sequence() >= self.next_token {
                return Err(SrcnnError::DispatchValidation(format!(
                    "wait token {} was never issued",
                    t.sequence()
                )));
            }
        }

        let mut backend_bufs = Vec::with_capacity(bufs.len());
        for &b in bufs {
            backend_bufs.push(self.entry(b)?.backend);
        }
        let ke = self.kernel_entry(kernel)?;
        let entry = ke.entry;
        let req = crate::gpu::backend::LaunchRequest {
            kernel: ke.backend,
            global,
            local,
            local_mem_bytes,
            bufs: &backend_bufs,
            shape,
            params,
        };

        let started = if self.profiling {
            self.backend.synchronize()?;
            Some(Instant::now())
        } else {
            None
        };
        self.backend.launch(&req)?;
        let token = CompletionToken::new(self.next_token);
        self.next_token += 1;
        if let Some(start) = started {
            self.backend.synchronize()?;
            let rec = DispatchRecord {
                entry,
                token,
                elapsed_us: start.elapsed().as_micros(),
            };
            debug!(entry, elapsed_us = rec.elapsed_us, "dispatch timed");
            self.profile.push(rec);
        }
        trace!(entry, token = token.sequence(), ?global, ?local, "dispatched");
        Ok(token)
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        for i in 0..self.allocations.len() {
            if self.allocations[i].live {
                self.allocations[i].live = false;
                let backend = self.allocations[i].backend;
                if let Err(e) = self.backend.free(backend) {
                    warn!(handle = i, error = %e, "leaked device buffer at teardown");
                }
            }
        }
        let _ = self.backend.synchronize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostBackend;

    fn ctx() -> ComputeContext {
        ComputeContext::new(Box::new(HostBackend::new()))
    }

    #[test]
    fn allocate_and_roundtrip() {
        let mut c = ctx();
        let h = c.allocate(MemFlags::ReadWrite, 16).unwrap();
        c.write_f32(h, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut out = [0.0f32; 4];
        c.read_f32(h, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn zero_byte_allocation_rejected() {
        let mut c = ctx();
        assert!(matches!(
            c.allocate(MemFlags::ReadWrite, 0),
            Err(SrcnnError::SizeMismatch(_))
        ));
    }

    #[test]
    fn allocation_table_capacity_is_enforced() {
        let mut c = ctx();
        let mut handles = Vec::new();
        for _ in 0..MAX_ALLOCATIONS {
            handles.push(c.allocate(MemFlags::ReadWrite, 4).unwrap());
        }
        assert!(matches!(
            c.allocate(MemFlags::ReadWrite, 4),
            Err(SrcnnError::ResourceLimit(_))
        ));
        // Releasing one slot makes room again.
        c.release(handles[0]).unwrap();
        assert!(c.allocate(MemFlags::ReadWrite, 4).is_ok());
    }

    #[test]
    fn release_is_idempotent_and_handles_stay_stable() {
        let mut c = ctx();
        let a = c.allocate(MemFlags::ReadWrite, 8).unwrap();
        let b = c.allocate(MemFlags::ReadWrite, 8).unwrap();
        c.write_f32(b, &[7.0, 8.0]).unwrap();
        c.release(a).unwrap();
        c.release(a).unwrap();
        // b's handle is unaffected by a's release.
        let mut out = [0.0f32; 2];
        c.read_f32(b, &mut out).unwrap();
        assert_eq!(out, [7.0, 8.0]);
        // but using a released handle is an error.
        assert!(c.write_f32(a, &[0.0]).is_err());
    }

    #[test]
    fn out_of_range_transfer_is_a_size_mismatch() {
        let mut c = ctx();
        let h = c.allocate(MemFlags::ReadWrite, 8).unwrap();
        assert!(matches!(
            c.write_bytes(h, 4, &[0u8; 8]),
            Err(SrcnnError::SizeMismatch(_))
        ));
        let mut out = [0u8; 12];
        assert!(matches!(
            c.read_bytes(h, 0, &mut out),
            Err(SrcnnError::SizeMismatch(_))
        ));
    }

    #[test]
    fn zero_fill_clears_previous_contents() {
        let mut c = ctx();
        let h = c.allocate(MemFlags::ReadWrite, 12).unwrap();
        c.write_f32(h, &[1.0, 2.0, 3.0]).unwrap();
        c.zero_fill(h).unwrap();
        let mut out = [9.0f32; 3];
        c.read_f32(h, &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn profiling_mode_times_every_dispatch() {
        use crate::cnn::kernels;

        let mut c = ComputeContext::with_profiling(Box::new(HostBackend::new()));
        let k = c.create_kernel(kernels::ENTRY_MEAN_SUBTRACT).unwrap();
        let h = c.allocate(MemFlags::ReadWrite, 16).unwrap();
        c.write_f32(h, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let t = c
            .enqueue(k, [4, 1, 1], [1, 1, 1], 0, &[h], &[4], &[1.0], &[])
            .unwrap();

        // The dispatch still runs; the record carries its entry and token.
        let mut out = [0.0f32; 4];
        c.read_f32(h, &mut out).unwrap();
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        let records = c.profile();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry, kernels::ENTRY_MEAN_SUBTRACT);
        assert_eq!(records[0].token, t);

        // Default construction records nothing.
        let mut quiet = ctx();
        let k = quiet.create_kernel(kernels::ENTRY_MEAN_SUBTRACT).unwrap();
        let h = quiet.allocate(MemFlags::ReadWrite, 16).unwrap();
        quiet.write_f32(h, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        quiet
            .enqueue(k, [4, 1, 1], [1, 1, 1], 0, &[h], &[4], &[1.0], &[])
            .unwrap();
        assert!(quiet.profile().is_empty());
    }

    #[test]
    fn unknown_entry_point_fails_kernel_creation() {
        let mut c = ctx();
        assert!(matches!(
            c.create_kernel("no_such_kernel"),
            Err(SrcnnError::Device(_))
        ));
    }
}
