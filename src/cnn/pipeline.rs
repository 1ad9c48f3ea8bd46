//! Network-level orchestration: luma extraction, forward pass, error
//! metrics, backpropagation, momentum update.
//!
//! One pipeline owns one compute context. All dispatches chain through
//! completion tokens on the context's in-order queue; a `block()` barrier is
//! interposed between stages that reuse similarly-purposed buffers rather
//! than trusting implicit driver ordering.

use tracing::{debug, trace};

use crate::cnn::kernels::{self, FIXED_POINT_SCALE};
use crate::cnn::layer::LayerData;
use crate::error::{Result, SrcnnError};
use crate::gpu::context::{BufferHandle, ComputeContext, KernelHandle, MemFlags};
use crate::gpu::kernel::{CompletionToken, Dispatch};

/// Device allocations for one layer: parameters, activations, and the
/// optimizer state that persists across training steps.
pub struct LayerGpuPool {
    pub weights: BufferHandle,
    pub bias: BufferHandle,
    pub output: BufferHandle,
    pub delta: BufferHandle,
    pub grad_weights: BufferHandle,
    pub grad_bias: BufferHandle,
    pub prev_delta_weights: BufferHandle,
    pub prev_delta_bias: BufferHandle,
}

/// Spatial extents of one layer's input and output feature maps.
#[derive(Debug, Clone, Copy)]
pub struct LayerShape {
    pub in_w: usize,
    pub in_h: usize,
    pub out_w: usize,
    pub out_h: usize,
}

/// Chains the valid-convolution formula through all three layers.
pub fn layer_shapes(
    layers: &[LayerData; 3],
    input_w: usize,
    input_h: usize,
) -> Result<[LayerShape; 3]> {
    let mut shapes = [LayerShape {
        in_w: 0,
        in_h: 0,
        out_w: 0,
        out_h: 0,
    }; 3];
    let (mut w, mut h) = (input_w, input_h);
    for (i, layer) in layers.iter().enumerate() {
        let (out_w, out_h) = layer.output_dims(w, h)?;
        shapes[i] = LayerShape {
            in_w: w,
            in_h: h,
            out_w,
            out_h,
        };
        w = out_w;
        h = out_h;
    }
    Ok(shapes)
}

/// L2 regularization term folded into the last-layer delta:
/// `lambda * (sum(w1^2) + sum(w2^2) + sum(w3^2))`, accumulated in f64.
pub fn weight_decay_term(w1: &[f32], w2: &[f32], w3: &[f32], lambda: f32) -> f64 {
    let sq = |ws: &[f32]| ws.iter().map(|w| *w as f64 * *w as f64).sum::<f64>();
    lambda as f64 * (sq(w1) + sq(w2) + sq(w3))
}

#[derive(Default)]
struct KernelCache {
    forward: Option<KernelHandle>,
    last_delta: Option<KernelHandle>,
    propagate: Option<KernelHandle>,
    weight_grad: Option<KernelHandle>,
    bias_grad: Option<KernelHandle>,
    momentum: Option<KernelHandle>,
    luma: Option<KernelHandle>,
    mean_subtract: Option<KernelHandle>,
    reduce_sum: Option<KernelHandle>,
    squared_error: Option<KernelHandle>,
}

pub struct DataPipeline {
    ctx: ComputeContext,
    kernels: KernelCache,
    momentum: f32,
    weight_decay: f32,
    learning_rate: [f32; 3],
}

impl DataPipeline {
    pub fn new(
        ctx: ComputeContext,
        momentum: f32,
        weight_decay: f32,
        learning_rate: [f32; 3],
    ) -> Self {
        DataPipeline {
            ctx,
            kernels: KernelCache::default(),
            momentum,
            weight_decay,
            learning_rate,
        }
    }

    pub fn context(&mut self) -> &mut ComputeContext {
        &mut self.ctx
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    /// The cached forward kernel, for the one-shot executor path.
    pub fn forward_kernel(&mut self) -> Result<KernelHandle> {
        self.kernel(kernels::ENTRY_CONV_FORWARD)
    }

    /// Kernels are created on first use, one table slot per entry point.
    fn kernel(&mut self, entry: &'static str) -> Result<KernelHandle> {
        let slot = match entry {
            kernels::ENTRY_CONV_FORWARD => &mut self.kernels.forward,
            kernels::ENTRY_LAST_LAYER_DELTA => &mut self.kernels.last_delta,
            kernels::ENTRY_PROPAGATE_DELTA => &mut self.kernels.propagate,
            kernels::ENTRY_WEIGHT_GRADIENT => &mut self.kernels.weight_grad,
            kernels::ENTRY_BIAS_GRADIENT => &mut self.kernels.bias_grad,
            kernels::ENTRY_MOMENTUM_UPDATE => &mut self.kernels.momentum,
            kernels::ENTRY_LUMA_EXTRACT => &mut self.kernels.luma,
            kernels::ENTRY_MEAN_SUBTRACT => &mut self.kernels.mean_subtract,
            kernels::ENTRY_REDUCE_SUM => &mut self.kernels.reduce_sum,
            kernels::ENTRY_SQUARED_ERROR_SUM => &mut self.kernels.squared_error,
            other => {
                return Err(SrcnnError::Device(format!(
                    "pipeline has no kernel slot for entry '{other}'"
                )))
            }
        };
        if let Some(k) = *slot {
            return Ok(k);
        }
        let k = self.ctx.create_kernel(entry)?;
        *slot = Some(k);
        Ok(k)
    }

    fn sizes_1d(&mut self, kernel: KernelHandle, n: usize) -> Result<([usize; 3], [usize; 3])> {
        let limits = self.ctx.kernel_limits(kernel)?;
        Ok(crate::cnn::executor::derive_work_sizes(
            self.ctx.device_limits(),
            limits,
            &[n],
        ))
    }

    fn sizes_2d(
        &mut self,
        kernel: KernelHandle,
        w: usize,
        h: usize,
    ) -> Result<([usize; 3], [usize; 3])> {
        let limits = self.ctx.kernel_limits(kernel)?;
        Ok(crate::cnn::executor::derive_work_sizes(
            self.ctx.device_limits(),
            limits,
            &[w, h],
        ))
    }

    /// Uploads a 4-channel 8-bit image and reduces it to single-channel
    /// float luma, optionally normalized to [0, 1]. Returns the luma buffer;
    /// the staging buffer is released before returning.
    pub fn extract_luma(
        &mut self,
        rgba: &[u8],
        n_pixels: usize,
        normalize: bool,
    ) -> Result<BufferHandle> {
        if rgba.len() < n_pixels * 4 {
            return Err(SrcnnError::SizeMismatch(format!(
                "{} image bytes for {} rgba pixels",
                rgba.len(),
                n_pixels
            )));
        }
        let staged: Vec<f32> = rgba[..n_pixels * 4].iter().map(|&c| c as f32).collect();
        let staging = self.ctx.allocate(MemFlags::ReadOnly, n_pixels * 4 * 4)?;
        self.ctx.write_f32(staging, &staged)?;
        let luma = self.ctx.allocate(MemFlags::ReadWrite, n_pixels * 4)?;

        let kernel = self.kernel(kernels::ENTRY_LUMA_EXTRACT)?;
        let (global, local) = self.sizes_1d(kernel, n_pixels)?;
        Dispatch::new(&mut self.ctx, kernel)
            .arg_buf(staging)
            .arg_buf(luma)
            .arg_i32(n_pixels as i32)
            .arg_i32(normalize as i32)
            .execute(1, &global, &local, &[])?;
        self.ctx.block()?;
        self.ctx.release(staging)?;
        Ok(luma)
    }

    /// Fixed-point sum of the first `n` floats of a buffer.
    pub fn sum(&mut self, buf: BufferHandle, n: usize, wait: &[CompletionToken]) -> Result<f64> {
        let kernel = self.kernel(kernels::ENTRY_REDUCE_SUM)?;
        let accum = self.ctx.allocate(MemFlags::ReadWrite, 8)?;
        self.ctx.zero_fill(accum)?;
        let (global, local) = self.sizes_1d(kernel, n)?;
        Dispatch::new(&mut self.ctx, kernel)
            .arg_buf(buf)
            .arg_buf(accum)
            .arg_i32(n as i32)
            .execute(1, &global, &local, wait)?;
        self.ctx.block()?;
        let raw = self.ctx.read_i64(accum)?;
        self.ctx.release(accum)?;
        Ok(raw as f64 / FIXED_POINT_SCALE)
    }

    /// Subtracts the buffer's own mean in place. Returns the mean and the
    /// subtraction's token.
    pub fn subtract_mean(
        &mut self,
        buf: BufferHandle,
        n: usize,
        wait: &[CompletionToken],
    ) -> Result<(f32, CompletionToken)> {
        let mean = (self.sum(buf, n, wait)? / n as f64) as f32;
        let kernel = self.kernel(kernels::ENTRY_MEAN_SUBTRACT)?;
        let (global, local) = self.sizes_1d(kernel, n)?;
        let token = Dispatch::new(&mut self.ctx, kernel)
            .arg_buf(buf)
            .arg_i32(n as i32)
            .arg_f32(mean)
            .execute(1, &global, &local, &[])?;
        debug!(mean, n, "subtracted input mean");
        Ok((mean, token))
    }

    /// Runs the 3-layer forward pass. Layers are data-dependent, so each
    /// stage's wait-list is exactly the prior stage's token; full
    /// serialization is intentional. Returns the last layer's token.
    ///
    /// Pool weights and bias buffers must hold the layers' current
    /// parameters; outputs land in each pool's `output` buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        layers: &[LayerData; 3],
        pools: &[LayerGpuPool; 3],
        input: BufferHandle,
        input_w: usize,
        input_h: usize,
        subtract_mean: bool,
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        for layer in layers {
            layer.validate()?;
        }
        let shapes = layer_shapes(layers, input_w, input_h)?;
        let needed = input_w * input_h * layers[0].n_prev_filter_cnt() * 4;
        if self.ctx.buffer_size(input)? < needed {
            return Err(SrcnnError::SizeMismatch(format!(
                "input buffer holds {} bytes, forward pass needs {}",
                self.ctx.buffer_size(input)?,
                needed
            )));
        }

        let mut chain: Vec<CompletionToken> = wait.to_vec();
        if subtract_mean {
            let (_, token) = self.subtract_mean(input, input_w * input_h, &chain)?;
            chain = vec![token];
        }

        let kernel = self.kernel(kernels::ENTRY_CONV_FORWARD)?;
        let mut last = None;
        for i in 0..3 {
            let shape = shapes[i];
            let layer = &layers[i];
            let layer_input = if i == 0 { input } else { pools[i - 1].output };
            let (global, local) = self.sizes_2d(kernel, shape.out_w, shape.out_h)?;
            let token = Dispatch::new(&mut self.ctx, kernel)
                .arg_buf(layer_input)
                .arg_buf(pools[i].output)
                .arg_buf(pools[i].weights)
                .arg_buf(pools[i].bias)
                .arg_i32(layer.n_prev_filter_cnt() as i32)
                .arg_i32(layer.f_spatial_size() as i32)
                .arg_i32(shape.in_w as i32)
                .arg_i32(shape.in_h as i32)
                .arg_i32(layer.n_filter_cnt() as i32)
                .execute(2, &global, &local, &chain)?;
            trace!(layer = i, out_w = shape.out_w, out_h = shape.out_h, "forward stage");
            self.ctx.block()?;
            chain = vec![token];
            last = Some(token);
        }
        Ok(last.unwrap_or_else(|| unreachable!("three stages always dispatch")))
    }

    /// Sum of squared differences between a padded ground truth and an
    /// unpadded result, aligned by half the total padding on each side.
    ///
    /// The extent difference must equal `total_padding` in both dimensions;
    /// a mismatch is rejected here rather than left for the kernel to read
    /// out of bounds.
    #[allow(clippy::too_many_arguments)]
    pub fn squared_error(
        &mut self,
        truth: BufferHandle,
        truth_w: usize,
        truth_h: usize,
        result: BufferHandle,
        result_w: usize,
        result_h: usize,
        total_padding: usize,
        wait: &[CompletionToken],
    ) -> Result<f64> {
        if truth_w != result_w + total_padding || truth_h != result_h + total_padding {
            return Err(SrcnnError::SizeMismatch(format!(
                "ground truth {truth_w}x{truth_h} vs result {result_w}x{result_h} \
                 does not match total padding {total_padding}"
            )));
        }
        let kernel = self.kernel(kernels::ENTRY_SQUARED_ERROR_SUM)?;
        let accum = self.ctx.allocate(MemFlags::ReadWrite, 8)?;
        self.ctx.zero_fill(accum)?;
        let (global, local) = self.sizes_2d(kernel, result_w, result_h)?;
        Dispatch::new(&mut self.ctx, kernel)
            .arg_buf(truth)
            .arg_buf(result)
            .arg_buf(accum)
            .arg_i32(result_w as i32)
            .arg_i32(result_h as i32)
            .arg_i32(truth_w as i32)
            .arg_i32((total_padding / 2) as i32)
            .execute(2, &global, &local, wait)?;
        self.ctx.block()?;
        let raw = self.ctx.read_i64(accum)?;
        self.ctx.release(accum)?;
        Ok(raw as f64 / FIXED_POINT_SCALE)
    }

    /// Mean squared error over the result extent.
    #[allow(clippy::too_many_arguments)]
    pub fn mean_squared_error(
        &mut self,
        truth: BufferHandle,
        truth_w: usize,
        truth_h: usize,
        result: BufferHandle,
        result_w: usize,
        result_h: usize,
        total_padding: usize,
        wait: &[CompletionToken],
    ) -> Result<f64> {
        let sum = self.squared_error(
            truth,
            truth_w,
            truth_h,
            result,
            result_w,
            result_h,
            total_padding,
            wait,
        )?;
        Ok(sum / (result_w * result_h) as f64)
    }

    /// Training-step stage 1: last-layer delta from output, aligned ground
    /// truth, and the additive weight-decay term.
    #[allow(clippy::too_many_arguments)]
    pub fn last_layer_delta(
        &mut self,
        pool: &LayerGpuPool,
        out_w: usize,
        out_h: usize,
        truth: BufferHandle,
        truth_w: usize,
        total_padding: usize,
        decay_term: f32,
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let kernel = self.kernel(kernels::ENTRY_LAST_LAYER_DELTA)?;
        let (global, local) = self.sizes_2d(kernel, out_w, out_h)?;
        Dispatch::new(&mut self.ctx, kernel)
            .arg_buf(pool.output)
            .arg_buf(truth)
            .arg_buf(pool.delta)
            .arg_i32(out_w as i32)
            .arg_i32(out_h as i32)
            .arg_i32(truth_w as i32)
            .arg_i32((total_padding / 2) as i32)
            .arg_f32(decay_term)
            .execute(2, &global, &local, wait)
    }

    /// Training-step stage 2: backward delta propagation, strictly
    /// last-to-first. Each layer's delta needs the next layer's freshly
    /// produced delta, so the order is load-bearing.
    pub fn propagate_deltas(
        &mut self,
        layers: &[LayerData; 3],
        pools: &[LayerGpuPool; 3],
        shapes: &[LayerShape; 3],
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let kernel = self.kernel(kernels::ENTRY_PROPAGATE_DELTA)?;
        let mut chain: Vec<CompletionToken> = wait.to_vec();
        let mut last = None;
        for i in (0..2).rev() {
            let next = i + 1;
            let (cur_w, cur_h) = (shapes[i].out_w, shapes[i].out_h);
            let (global, local) = self.sizes_2d(kernel, cur_w, cur_h)?;
            let token = Dispatch::new(&mut self.ctx, kernel)
                .arg_buf(pools[next].delta)
                .arg_buf(pools[next].weights)
                .arg_buf(pools[i].output)
                .arg_buf(pools[i].delta)
                .arg_i32(layers[i].n_filter_cnt() as i32)
                .arg_i32(layers[next].n_filter_cnt() as i32)
                .arg_i32(layers[next].f_spatial_size() as i32)
                .arg_i32(cur_w as i32)
                .arg_i32(cur_h as i32)
                .execute(2, &global, &local, &chain)?;
            self.ctx.block()?;
            chain = vec![token];
            last = Some(token);
        }
        Ok(last.unwrap_or_else(|| unreachable!("two propagation stages always dispatch")))
    }

    /// Training-step stage 3: weight and bias gradients per layer from that
    /// layer's input and delta.
    pub fn compute_gradients(
        &mut self,
        layers: &[LayerData; 3],
        pools: &[LayerGpuPool; 3],
        input: BufferHandle,
        shapes: &[LayerShape; 3],
        wait: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let weight_kernel = self.kernel(kernels::ENTRY_WEIGHT_GRADIENT)?;
        let bias_kernel = self.kernel(kernels::ENTRY_BIAS_GRADIENT)?;
        let mut chain: Vec<CompletionToken> = wait.to_vec();
        let mut last = None;
        for i in 0..3 {
            let layer = &layers[i];
            let shape = shapes[i];
            let layer_input = if i == 0 { input } else { pools[i - 1].output };

            let (global, local) = self.sizes_1d(weight_kernel, layer.weight_size())?;
            let wt = Dispatch::new(&mut self.ctx, weight_kernel)
                .arg_buf(layer_input)
                .arg_buf(pools[i].delta)
                .arg_buf(pools[i].grad_weights)
                .arg_i32(layer.n_prev_filter_cnt() as i32)
                .arg_i32(layer.n_filter_cnt() as i32)
                .arg_i32(layer.f_spatial_size() as i32)
                .arg_i32(shape.in_w as i32)
                .arg_i32(shape.in_h as i32)
                .execute(1, &global, &local, &chain)?;

            let (global, local) = self.sizes_1d(bias_kernel, layer.bias_size())?;
            let bt = Dispatch::new(&mut self.ctx, bias_kernel)
                .arg_buf(pools[i].delta)
                .arg_buf(pools[i].grad_bias)
                .arg_i32(layer.n_filter_cnt() as i32)
                .arg_i32(shape.out_w as i32)
                .arg_i32(shape.out_h as i32)
                .execute(1, &global, &local, &[wt])?;
            chain = vec![bt];
            last = Some(bt);
        }
        self.ctx.block()?;
        Ok(last.unwrap_or_else(|| unreachable!("three gradient stages always dispatch")))
    }

    /// Training-step stage 4: momentum update of every parameter tensor.
    /// `prev_delta_*` buffers carry the optimizer state across steps; the
    /// updated parameters are read back into the layer descriptors so the
    /// host copy stays authoritative for persistence and weight decay.
    pub fn momentum_step(
        &mut self,
        layers: &mut [LayerData; 3],
        pools: &[LayerGpuPool; 3],
        wait: &[CompletionToken],
    ) -> Result<()> {
        let kernel = self.kernel(kernels::ENTRY_MOMENTUM_UPDATE)?;
        let mut chain: Vec<CompletionToken> = wait.to_vec();
        for i in 0..3 {
            for (param, prev, grad, n) in [
                (
                    pools[i].weights,
                    pools[i].prev_delta_weights,
                    pools[i].grad_weights,
                    layers[i].weight_size(),
                ),
                (
                    pools[i].bias,
                    pools[i].prev_delta_bias,
                    pools[i].grad_bias,
                    layers[i].bias_size(),
                ),
            ] {
                let (global, local) = self.sizes_1d(kernel, n)?;
                let token = Dispatch::new(&mut self.ctx, kernel)
                    .arg_buf(param)
                    .arg_buf(prev)
                    .arg_buf(grad)
                    .arg_i32(n as i32)
                    .arg_f32(self.momentum)
                    .arg_f32(self.learning_rate[i])
                    .execute(1, &global, &local, &chain)?;
                chain = vec![token];
            }
        }
        self.ctx.block()?;
        for i in 0..3 {
            let (w, b) = (layers[i].weight_size(), layers[i].bias_size());
            self.ctx.read_f32(pools[i].weights, &mut layers[i].weights[..w])?;
            self.ctx.read_f32(pools[i].bias, &mut layers[i].bias[..b])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_decay_sums_all_three_tensors() {
        let w1 = vec![1.0f32; 4];
        let w2 = vec![2.0f32; 3];
        let w3 = vec![-3.0f32; 2];
        let expected = 0.5 * (4.0 + 12.0 + 18.0);
        assert!((weight_decay_term(&w1, &w2, &w3, 0.5) - expected).abs() < 1e-9);
    }

    #[test]
    fn shapes_chain_through_the_network() {
        let layers = [
            LayerData::new(1, 4, 9),
            LayerData::new(4, 2, 1),
            LayerData::new(2, 1, 5),
        ];
        let shapes = layer_shapes(&layers, 24, 20).unwrap();
        assert_eq!((shapes[0].out_w, shapes[0].out_h), (16, 12));
        assert_eq!((shapes[1].out_w, shapes[1].out_h), (16, 12));
        assert_eq!((shapes[2].out_w, shapes[2].out_h), (12, 8));
    }

    #[test]
    fn shapes_fail_when_the_network_consumes_the_input() {
        let layers = [
            LayerData::new(1, 4, 9),
            LayerData::new(4, 2, 1),
            LayerData::new(2, 1, 5),
        ];
        assert!(layer_shapes(&layers, 10, 10).is_err());
    }
}
