//! Dispatch building and validation.
//!
//! Every dispatch re-supplies its full argument list: a [`Dispatch`] builder
//! accumulates positional bindings and is consumed exactly once by
//! [`Dispatch::execute`], so stale bindings cannot leak between invocations.
//! Work sizes are structurally validated before enqueue because GPU-side
//! dispatch failures are cryptic and late.

use crate::error::{Result, SrcnnError};
use crate::gpu::context::{BufferHandle, ComputeContext, KernelHandle};

/// Opaque marker for one asynchronous dispatch's completion.
///
/// Tokens are issued in enqueue order on a single in-order queue, so token
/// order is completion order; a dispatch waiting on token `t` is correct as
/// long as it is enqueued after `t` was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionToken(u64);

impl CompletionToken {
    pub(crate) fn new(seq: u64) -> Self {
        CompletionToken(seq)
    }

    pub(crate) fn sequence(self) -> u64 {
        self.0
    }
}

/// One dispatch under construction. Arguments are appended in the kernel's
/// declared positional order; integer and float scalars go to the packed
/// trailing `shape`/`params` buffers.
pub struct Dispatch<'a> {
    ctx: &'a mut ComputeContext,
    kernel: KernelHandle,
    bufs: Vec<BufferHandle>,
    shape: Vec<i32>,
    params: Vec<f32>,
    local_mem_bytes: usize,
}

impl<'a> Dispatch<'a> {
    pub fn new(ctx: &'a mut ComputeContext, kernel: KernelHandle) -> Self {
        Dispatch {
            ctx,
            kernel,
            bufs: Vec::new(),
            shape: Vec::new(),
            params: Vec::new(),
            local_mem_bytes: 0,
        }
    }

    pub fn arg_buf(mut self, h: BufferHandle) -> Self {
        self.bufs.push(h);
        self
    }

    pub fn arg_i32(mut self, v: i32) -> Self {
        self.shape.push(v);
        self
    }

    pub fn arg_f32(mut self, v: f32) -> Self {
        self.params.push(v);
        self
    }

    /// Declares work-group scratch memory the kernel needs at runtime.
    pub fn local_scratch(mut self, bytes: usize) -> Self {
        self.local_mem_bytes += bytes;
        self
    }

    /// Validates work sizes and enqueues. Consumes the builder; the next
    /// dispatch starts from an empty argument list.
    ///
    /// `wait` lists predecessor tokens this dispatch depends on. The queue
    /// is in-order, so the list is checked for sanity rather than used to
    /// reorder anything.
    pub fn execute(
        self,
        dims: usize,
        global: &[usize],
        local: &[usize],
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        if !(1..=3).contains(&dims) {
            return Err(SrcnnError::DispatchValidation(format!(
                "dispatch dimensionality {dims} outside 1..=3"
            )));
        }
        if global.len() < dims || local.len() < dims {
            return Err(SrcnnError::DispatchValidation(format!(
                "{dims}-dimensional dispatch given {} global / {} local sizes",
                global.len(),
                local.len()
            )));
        }

        let device = self.ctx.device_limits().clone();
        let kernel_limits = self.ctx.kernel_limits(self.kernel)?;

        let mut g = [1usize; 3];
        let mut l = [1usize; 3];
        let mut total_global = 1usize;
        let mut total_local = 1usize;
        for d in 0..dims {
            if global[d] == 0 || local[d] == 0 {
                return Err(SrcnnError::DispatchValidation(format!(
                    "dimension {d} has zero extent (global {}, local {})",
                    global[d], local[d]
                )));
            }
            if global[d] % local[d] != 0 {
                return Err(SrcnnError::DispatchValidation(format!(
                    "local size {} does not divide global size {} in dimension {d}",
                    local[d], global[d]
                )));
            }
            if local[d] > device.max_work_item_sizes[d] {
                return Err(SrcnnError::DispatchValidation(format!(
                    "local size {} exceeds device limit {} in dimension {d}",
                    local[d], device.max_work_item_sizes[d]
                )));
            }
            g[d] = global[d];
            l[d] = local[d];
            total_global = total_global.saturating_mul(global[d]);
            total_local *= local[d];
        }

        let group_cap = device
            .max_work_group_size
            .min(kernel_limits.max_work_group_size);
        if total_local > group_cap {
            return Err(SrcnnError::DispatchValidation(format!(
                "work-group of {total_local} items exceeds limit {group_cap}"
            )));
        }
        if total_global > device.max_global_work_items {
            return Err(SrcnnError::DispatchValidation(format!(
                "{total_global} global work-items exceed device range {}",
                device.max_global_work_items
            )));
        }
        if self.local_mem_bytes > device.local_mem_bytes {
            return Err(SrcnnError::DispatchValidation(format!(
                "{} bytes of local scratch exceed device budget {}",
                self.local_mem_bytes, device.local_mem_bytes
            )));
        }

        self.ctx.enqueue(
            self.kernel,
            g,
            l,
            self.local_mem_bytes,
            &self.bufs,
            &self.shape,
            &self.params,
            wait,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnn::kernels;
    use crate::gpu::context::MemFlags;
    use crate::gpu::host::HostBackend;

    fn ctx_with_kernel() -> (ComputeContext, KernelHandle) {
        let mut ctx = ComputeContext::new(Box::new(HostBackend::new()));
        let k = ctx.create_kernel(kernels::ENTRY_MEAN_SUBTRACT).unwrap();
        (ctx, k)
    }

    #[test]
    fn dispatch_runs_and_tokens_are_monotone() {
        let (mut ctx, k) = ctx_with_kernel();
        let buf = ctx.allocate(MemFlags::ReadWrite, 16).unwrap();
        ctx.write_f32(buf, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let t1 = Dispatch::new(&mut ctx, k)
            .arg_buf(buf)
            .arg_i32(4)
            .arg_f32(1.0)
            .execute(1, &[4], &[4], &[])
            .unwrap();
        let t2 = Dispatch::new(&mut ctx, k)
            .arg_buf(buf)
            .arg_i32(4)
            .arg_f32(0.5)
            .execute(1, &[4], &[4], &[t1])
            .unwrap();
        assert!(t2 > t1);

        let mut out = [0.0f32; 4];
        ctx.read_f32(buf, &mut out).unwrap();
        assert_eq!(out, [-0.5, 0.5, 1.5, 2.5]);
    }

    #[test]
    fn dimensionality_outside_range_is_rejected() {
        let (mut ctx, k) = ctx_with_kernel();
        for dims in [0usize, 4] {
            let r = Dispatch::new(&mut ctx, k).execute(dims, &[4, 4, 4, 4], &[1, 1, 1, 1], &[]);
            assert!(matches!(r, Err(SrcnnError::DispatchValidation(_))));
        }
    }

    #[test]
    fn non_dividing_local_size_is_rejected() {
        let (mut ctx, k) = ctx_with_kernel();
        let r = Dispatch::new(&mut ctx, k).execute(1, &[10], &[4], &[]);
        assert!(matches!(r, Err(SrcnnError::DispatchValidation(_))));
    }

    #[test]
    fn work_group_beyond_device_limit_is_rejected() {
        let (mut ctx, k) = ctx_with_kernel();
        let cap = ctx.device_limits().max_work_group_size;
        let size = (cap * 2).next_power_of_two();
        let r = Dispatch::new(&mut ctx, k).execute(2, &[size, size], &[size, size], &[]);
        assert!(matches!(r, Err(SrcnnError::DispatchValidation(_))));
    }

    #[test]
    fn excess_local_scratch_is_rejected() {
        let (mut ctx, k) = ctx_with_kernel();
        let budget = ctx.device_limits().local_mem_bytes;
        let r = Dispatch::new(&mut ctx, k)
            .local_scratch(budget + 1)
            .execute(1, &[4], &[4], &[]);
        assert!(matches!(r, Err(SrcnnError::DispatchValidation(_))));
    }

    #[test]
    fn unissued_wait_token_is_rejected() {
        let (mut ctx, k) = ctx_with_kernel();
        let buf = ctx.allocate(MemFlags::ReadWrite, 16).unwrap();
        let bogus = CompletionToken::new(99);
        let r = Dispatch::new(&mut ctx, k)
            .arg_buf(buf)
            .arg_i32(4)
            .arg_f32(0.0)
            .execute(1, &[4], &[4], &[bogus]);
        assert!(matches!(r, Err(SrcnnError::DispatchValidation(_))));
    }
}
