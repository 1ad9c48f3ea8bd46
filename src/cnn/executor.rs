//! Work-size derivation and the single-layer executor.

use crate::cnn::kernels;
use crate::cnn::layer::LayerData;
use crate::error::{Result, SrcnnError};
use crate::gpu::backend::{DeviceLimits, KernelLimits};
use crate::gpu::context::{BufferHandle, ComputeContext, KernelHandle, MemFlags};
use crate::gpu::kernel::{CompletionToken, Dispatch};

/// Derives `(global, local)` work sizes for a dispatch over `extents`.
///
/// Globals are the extents rounded up to powers of two, which makes even
/// divisibility trivial at the cost of some guarded-out work-items. Locals
/// start at 1 and are doubled round-robin across dimensions while each stays
/// within its device per-dimension limit, stays at most the rounded global,
/// and the group product stays within the lesser of the device and kernel
/// work-group caps. The result is the largest power-of-two tile that evenly
/// divides the padded global size.
pub fn derive_work_sizes(
    device: &DeviceLimits,
    kernel: KernelLimits,
    extents: &[usize],
) -> ([usize; 3], [usize; 3]) {
    let dims = extents.len().min(3);
    let mut global = [1usize; 3];
    let mut local = [1usize; 3];
    for d in 0..dims {
        global[d] = extents[d].max(1).next_power_of_two();
    }

    let group_cap = device.max_work_group_size.min(kernel.max_work_group_size);
    let mut grew = true;
    while grew {
        grew = false;
        for d in 0..dims {
            let doubled = local[d] * 2;
            let product: usize = local.iter().product::<usize>() * 2;
            if doubled <= global[d] && doubled <= device.max_work_item_sizes[d] && product <= group_cap
            {
                local[d] = doubled;
                grew = true;
            }
        }
    }
    (global, local)
}

/// Binds one layer's parameters and an input buffer to the forward kernel,
/// allocating fresh parameter and output buffers for the call. Buffers are
/// not reused across calls; pooling is the pipeline's job, this path serves
/// one-shot inference.
pub struct LayerExecutor;

/// One executed layer: its output and the buffers the executor allocated
/// for the call, so the caller can release them once the token completes.
pub struct LayerRun {
    pub output: BufferHandle,
    pub weights: BufferHandle,
    pub bias: BufferHandle,
    pub out_w: usize,
    pub out_h: usize,
    pub token: CompletionToken,
}

impl LayerExecutor {
    pub fn execute(
        ctx: &mut ComputeContext,
        kernel: KernelHandle,
        layer: &LayerData,
        input: BufferHandle,
        input_w: usize,
        input_h: usize,
        wait: &[CompletionToken],
    ) -> Result<LayerRun> {
        layer.validate()?;
        let needed = input_w * input_h * layer.n_prev_filter_cnt() * 4;
        if ctx.buffer_size(input)? < needed {
            return Err(SrcnnError::SizeMismatch(format!(
                "input buffer holds {} bytes, layer needs {} for {}x{}x{}",
                ctx.buffer_size(input)?,
                needed,
                input_w,
                input_h,
                layer.n_prev_filter_cnt()
            )));
        }
        let (out_w, out_h) = layer.output_dims(input_w, input_h)?;

        let weights = ctx.allocate(MemFlags::ReadOnly, layer.weight_size() * 4)?;
        ctx.write_f32(weights, &layer.weights[..layer.weight_size()])?;
        let bias = ctx.allocate(MemFlags::ReadOnly, layer.bias_size() * 4)?;
        ctx.write_f32(bias, &layer.bias[..layer.bias_size()])?;
        let output = ctx.allocate(
            MemFlags::ReadWrite,
            out_w * out_h * layer.n_filter_cnt() * 4,
        )?;

        let limits = ctx.kernel_limits(kernel)?;
        let (global, local) = derive_work_sizes(ctx.device_limits(), limits, &[out_w, out_h]);
        let token = Dispatch::new(ctx, kernel)
            .arg_buf(input)
            .arg_buf(output)
            .arg_buf(weights)
            .arg_buf(bias)
            .arg_i32(layer.n_prev_filter_cnt() as i32)
            .arg_i32(layer.f_spatial_size() as i32)
            .arg_i32(input_w as i32)
            .arg_i32(input_h as i32)
            .arg_i32(layer.n_filter_cnt() as i32)
            .execute(2, &global, &local, wait)?;
        Ok(LayerRun {
            output,
            weights,
            bias,
            out_w,
            out_h,
            token,
        })
    }
}

/// Creates the forward kernel the executor dispatches.
pub fn create_forward_kernel(ctx: &mut ComputeContext) -> Result<KernelHandle> {
    ctx.create_kernel(kernels::ENTRY_CONV_FORWARD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::host::HostBackend;

    fn limits() -> (DeviceLimits, KernelLimits) {
        (
            DeviceLimits {
                name: "test".to_string(),
                max_work_group_size: 256,
                max_work_item_sizes: [256, 256, 64],
                local_mem_bytes: 48 * 1024,
                max_global_work_items: 1 << 31,
            },
            KernelLimits {
                max_work_group_size: 256,
                private_mem_bytes: 0,
            },
        )
    }

    #[test]
    fn globals_are_rounded_to_powers_of_two() {
        let (d, k) = limits();
        let (global, local) = derive_work_sizes(&d, k, &[100, 33]);
        assert_eq!(global[..2], [128, 64]);
        for i in 0..2 {
            assert_eq!(global[i] % local[i], 0);
        }
    }

    #[test]
    fn local_product_respects_the_group_cap() {
        let (d, mut k) = limits();
        k.max_work_group_size = 64;
        let (_, local) = derive_work_sizes(&d, k, &[1024, 1024]);
        assert!(local.iter().product::<usize>() <= 64);
        // round-robin growth keeps the tile square-ish
        assert_eq!(local[..2], [8, 8]);
    }

    #[test]
    fn local_never_exceeds_global() {
        let (d, k) = limits();
        let (global, local) = derive_work_sizes(&d, k, &[2, 512]);
        assert_eq!(global[0], 2);
        assert!(local[0] <= 2);
        assert_eq!(global[1] % local[1], 0);
    }

    #[test]
    fn executor_runs_a_single_filter_identity_convolution() {
        let mut ctx = ComputeContext::new(Box::new(HostBackend::new()));
        let kernel = create_forward_kernel(&mut ctx).unwrap();

        // 3x3 filter with 1 at the center reproduces the input interior.
        let mut layer = LayerData::new(1, 1, 3);
        layer.weights[4] = 1.0;

        let input: Vec<f32> = (0..25).map(|v| v as f32).collect();
        let input_buf = ctx.allocate(MemFlags::ReadOnly, 25 * 4).unwrap();
        ctx.write_f32(input_buf, &input).unwrap();

        let run = LayerExecutor::execute(&mut ctx, kernel, &layer, input_buf, 5, 5, &[]).unwrap();
        ctx.block().unwrap();
        assert_eq!((run.out_w, run.out_h), (3, 3));

        let mut out = vec![0.0f32; 9];
        ctx.read_f32(run.output, &mut out).unwrap();
        let expected = [6.0, 7.0, 8.0, 11.0, 12.0, 13.0, 16.0, 17.0, 18.0];
        assert_eq!(out, expected);
    }

    #[test]
    fn undersized_input_buffer_is_rejected() {
        let mut ctx = ComputeContext::new(Box::new(HostBackend::new()));
        let kernel = create_forward_kernel(&mut ctx).unwrap();
        let layer = LayerData::new(1, 1, 3);
        let input_buf = ctx.allocate(MemFlags::ReadOnly, 10 * 4).unwrap();
        let r = LayerExecutor::execute(&mut ctx, kernel, &layer, input_buf, 5, 5, &[]);
        assert!(matches!(r, Err(SrcnnError::SizeMismatch(_))));
    }
}
