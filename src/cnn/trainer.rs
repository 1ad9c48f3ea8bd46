//! Config-sized pipeline: owns the per-layer allocation pools and drives
//! whole training steps and reconstruction runs.

use tracing::{debug, info};

use crate::cnn::config::{self, Config};
use crate::cnn::executor::LayerExecutor;
use crate::cnn::layer::LayerData;
use crate::cnn::pipeline::{layer_shapes, weight_decay_term, DataPipeline, LayerGpuPool, LayerShape};
use crate::error::{Result, SrcnnError};
use crate::gpu::backend::ComputeBackend;
use crate::gpu::context::{BufferHandle, ComputeContext, MemFlags};

/// The full network, sized by a [`Config`] for one training extent.
///
/// Pool buffers (parameters, activations, gradients, optimizer state) are
/// allocated once at construction and reused every step; optimizer state
/// starts zeroed and persists across steps.
pub struct SrcnnPipeline {
    config: Config,
    layers: [LayerData; 3],
    pipeline: DataPipeline,
    pools: [LayerGpuPool; 3],
    shapes: [LayerShape; 3],
    input_w: usize,
    input_h: usize,
}

impl SrcnnPipeline {
    pub fn new(
        backend: Box<dyn ComputeBackend>,
        config: Config,
        input_w: usize,
        input_h: usize,
    ) -> Result<Self> {
        config.validate()?;
        let mut layers = config.build_layers()?;
        if let Some(path) = &config.parameters_file {
            if path.exists() {
                config::load_parameters(path, &mut layers)?;
            }
        }
        let shapes = layer_shapes(&layers, input_w, input_h)?;

        let mut ctx = ComputeContext::new(backend);
        let pools = Self::allocate_pools(&mut ctx, &layers, &shapes)?;
        let pipeline = DataPipeline::new(
            ctx,
            config.momentum,
            config.weight_decay,
            config.learning_rate,
        );

        let mut this = SrcnnPipeline {
            config,
            layers,
            pipeline,
            pools,
            shapes,
            input_w,
            input_h,
        };
        this.sync_parameters()?;
        info!(
            input_w,
            input_h,
            out_w = this.shapes[2].out_w,
            out_h = this.shapes[2].out_h,
            "pipeline sized"
        );
        Ok(this)
    }

    fn allocate_pools(
        ctx: &mut ComputeContext,
        layers: &[LayerData; 3],
        shapes: &[LayerShape; 3],
    ) -> Result<[LayerGpuPool; 3]> {
        let mut pools = Vec::with_capacity(3);
        for (layer, shape) in layers.iter().zip(shapes.iter()) {
            layer.validate()?;
            let weight_bytes = layer.weight_size() * 4;
            let bias_bytes = layer.bias_size() * 4;
            let map_bytes = shape.out_w * shape.out_h * layer.n_filter_cnt() * 4;

            let pool = LayerGpuPool {
                weights: ctx.allocate(MemFlags::ReadWrite, weight_bytes)?,
                bias: ctx.allocate(MemFlags::ReadWrite, bias_bytes)?,
                output: ctx.allocate(MemFlags::ReadWrite, map_bytes)?,
                delta: ctx.allocate(MemFlags::ReadWrite, map_bytes)?,
                grad_weights: ctx.allocate(MemFlags::ReadWrite, weight_bytes)?,
                grad_bias: ctx.allocate(MemFlags::ReadWrite, bias_bytes)?,
                prev_delta_weights: ctx.allocate(MemFlags::ReadWrite, weight_bytes)?,
                prev_delta_bias: ctx.allocate(MemFlags::ReadWrite, bias_bytes)?,
            };
            ctx.zero_fill(pool.prev_delta_weights)?;
            ctx.zero_fill(pool.prev_delta_bias)?;
            pools.push(pool);
        }
        Ok(pools
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three pools are allocated")))
    }

    /// Uploads the host-side parameters into the pool buffers.
    pub fn sync_parameters(&mut self) -> Result<()> {
        for (layer, pool) in self.layers.iter().zip(self.pools.iter()) {
            let ctx = self.pipeline.context();
            ctx.write_f32(pool.weights, &layer.weights[..layer.weight_size()])?;
            ctx.write_f32(pool.bias, &layer.bias[..layer.bias_size()])?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layers(&self) -> &[LayerData; 3] {
        &self.layers
    }

    pub fn shapes(&self) -> &[LayerShape; 3] {
        &self.shapes
    }

    /// Network output extent for the configured input extent.
    pub fn output_extent(&self) -> (usize, usize) {
        (self.shapes[2].out_w, self.shapes[2].out_h)
    }

    /// One full training step against a ground-truth image of the same
    /// extent as the input (the padding border is cropped by alignment).
    /// Returns the step's mean squared error, measured before the update.
    pub fn train_step(&mut self, input_rgba: &[u8], truth_rgba: &[u8]) -> Result<f64> {
        let n_pixels = self.input_w * self.input_h;
        let input = self.pipeline.extract_luma(input_rgba, n_pixels, true)?;
        let truth = self.pipeline.extract_luma(truth_rgba, n_pixels, true)?;
        let result = self.train_step_on(input, truth);
        // Step buffers never outlive the step, even on a failed one.
        let ctx = self.pipeline.context();
        ctx.release(input)?;
        ctx.release(truth)?;
        result
    }

    fn train_step_on(&mut self, input: BufferHandle, truth: BufferHandle) -> Result<f64> {
        let total_padding = self.config.total_padding();
        let (out_w, out_h) = self.output_extent();

        let forward = self.pipeline.forward(
            &self.layers,
            &self.pools,
            input,
            self.input_w,
            self.input_h,
            self.config.subtract_input_mean,
            &[],
        )?;

        let mse = self.pipeline.mean_squared_error(
            truth,
            self.input_w,
            self.input_h,
            self.pools[2].output,
            out_w,
            out_h,
            total_padding,
            &[forward],
        )?;

        let decay = weight_decay_term(
            &self.layers[0].weights,
            &self.layers[1].weights,
            &self.layers[2].weights,
            self.pipeline.weight_decay(),
        ) as f32;

        let delta = self.pipeline.last_layer_delta(
            &self.pools[2],
            out_w,
            out_h,
            truth,
            self.input_w,
            total_padding,
            decay,
            &[forward],
        )?;
        let propagated =
            self.pipeline
                .propagate_deltas(&self.layers, &self.pools, &self.shapes, &[delta])?;
        let grads = self.pipeline.compute_gradients(
            &self.layers,
            &self.pools,
            input,
            &self.shapes,
            &[propagated],
        )?;
        self.pipeline
            .momentum_step(&mut self.layers, &self.pools, &[grads])?;

        debug!(mse, "training step complete");
        Ok(mse)
    }

    /// Forward-only reconstruction of an arbitrary-extent image through the
    /// one-shot executor path. Returns the luma output and its extent.
    pub fn reconstruct(&mut self, rgba: &[u8], w: usize, h: usize) -> Result<(Vec<f32>, usize, usize)> {
        // The network strips total_padding pixels per axis, so the smallest
        // usable image yields a 1x1 output.
        if w.min(h) < self.config.total_padding() + 1 {
            return Err(SrcnnError::SizeMismatch(format!(
                "image {w}x{h} too small for the configured filters"
            )));
        }
        let luma = self.pipeline.extract_luma(rgba, w * h, true)?;
        let kernel = self.pipeline.forward_kernel()?;

        let mut input = luma;
        let (mut cur_w, mut cur_h) = (w, h);
        let mut out = Vec::new();
        for i in 0..3 {
            let layer = self.layers[i].clone();
            let ctx = self.pipeline.context();
            let run = LayerExecutor::execute(ctx, kernel, &layer, input, cur_w, cur_h, &[])?;
            ctx.block()?;
            ctx.release(run.weights)?;
            ctx.release(run.bias)?;
            ctx.release(input)?;
            input = run.output;
            cur_w = run.out_w;
            cur_h = run.out_h;
            if i == 2 {
                out = vec![0.0f32; cur_w * cur_h];
                ctx.read_f32(run.output, &mut out)?;
                ctx.release(run.output)?;
            }
        }
        Ok((out, cur_w, cur_h))
    }

    /// Persists the current parameters to the configured file.
    pub fn dump_parameters(&self) -> Result<()> {
        let path = self.config.parameters_file.as_ref().ok_or_else(|| {
            SrcnnError::Config("no parameters_file configured".to_string())
        })?;
        config::dump_parameters(path, &self.layers)
    }

    /// Reloads parameters from the configured file and re-uploads them.
    pub fn load_parameters(&mut self) -> Result<()> {
        let path = self
            .config
            .parameters_file
            .clone()
            .ok_or_else(|| SrcnnError::Config("no parameters_file configured".to_string()))?;
        config::load_parameters(&path, &mut self.layers)?;
        self.sync_parameters()
    }
}
