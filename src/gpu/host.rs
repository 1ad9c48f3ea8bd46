//! Reference backend executing the kernel contract on the CPU.
//!
//! Implements every entry point named in `cnn::kernels` in plain Rust over
//! host memory. This is what the test suite runs against, and what the CLI
//! falls back to when no GPU is present. The math mirrors the CUDA sources
//! loop-for-loop so the two backends agree on results.
//!
//! Buffers are stored as `Vec<u64>` words so that f32 and i64 views are
//! always well aligned; the logical byte size is tracked separately.

use tracing::debug;

use crate::cnn::kernels::{self, FIXED_POINT_SCALE};
use crate::error::{Result, SrcnnError};
use crate::gpu::backend::{
    BackendBuf, BackendKernel, ComputeBackend, DeviceLimits, KernelLimits, LaunchRequest,
};

struct HostBuf {
    words: Vec<u64>,
    byte_size: usize,
}

impl HostBuf {
    fn new(byte_size: usize) -> Self {
        HostBuf {
            words: vec![0u64; byte_size.div_ceil(8).max(1)],
            byte_size,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.byte_size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.byte_size]
    }

    fn f32s(&self) -> &[f32] {
        &bytemuck::cast_slice(&self.words)[..self.byte_size / 4]
    }

    fn f32s_mut(&mut self) -> &mut [f32] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.byte_size / 4]
    }

    fn i64_mut(&mut self) -> &mut i64 {
        bytemuck::cast_slice_mut::<u64, i64>(&mut self.words)
            .first_mut()
            .expect("accumulator buffer is at least 8 bytes")
    }
}

/// CPU implementation of [`ComputeBackend`].
pub struct HostBackend {
    limits: DeviceLimits,
    buffers: Vec<Option<HostBuf>>,
    kernels: Vec<String>,
}

impl HostBackend {
    pub fn new() -> Self {
        HostBackend {
            limits: DeviceLimits {
                name: "host reference".to_string(),
                max_work_group_size: 256,
                max_work_item_sizes: [256, 256, 64],
                local_mem_bytes: 48 * 1024,
                max_global_work_items: 1 << 31,
            },
            buffers: Vec::new(),
            kernels: Vec::new(),
        }
    }

    fn buf(&self, b: BackendBuf) -> Result<&HostBuf> {
        self.buffers
            .get(b.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SrcnnError::Device(format!("host buffer {} is not live", b.0)))
    }

    fn buf_mut(&mut self, b: BackendBuf) -> Result<&mut HostBuf> {
        self.buffers
            .get_mut(b.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SrcnnError::Device(format!("host buffer {} is not live", b.0)))
    }

    // Temporarily removes a buffer so another buffer can be read while this
    // one is written. The kernel contract never aliases an output with an
    // input.
    fn take_buf(&mut self, b: BackendBuf) -> Result<HostBuf> {
        self.buffers
            .get_mut(b.0)
            .and_then(Option::take)
            .ok_or_else(|| SrcnnError::Device(format!("host buffer {} is not live", b.0)))
    }

    fn put_buf(&mut self, b: BackendBuf, buf: HostBuf) {
        self.buffers[b.0] = Some(buf);
    }

    fn run_entry(&mut self, entry: &str, req: &LaunchRequest<'_>) -> Result<()> {
        let s = req.shape;
        let u = |i: usize| s[i] as usize;
        match entry {
            kernels::ENTRY_CONV_FORWARD => {
                let (n_prev, f, in_w, in_h, n_curr) = (u(0), u(1), u(2), u(3), u(4));
                let out_w = in_w - f + 1;
                let out_h = in_h - f + 1;
                let mut out = self.take_buf(req.bufs[1])?;
                {
                    let input = self.buf(req.bufs[0])?.f32s();
                    let weights = self.buf(req.bufs[2])?.f32s();
                    let bias = self.buf(req.bufs[3])?.f32s();
                    let output = out.f32s_mut();
                    for y in 0..out_h {
                        for x in 0..out_w {
                            for fi in 0..n_curr {
                                let mut sum = bias[fi];
                                for c in 0..n_prev {
                                    for ky in 0..f {
                                        for kx in 0..f {
                                            sum += input[c * in_w * in_h + (y + ky) * in_w + x + kx]
                                                * weights[fi * n_prev * f * f
                                                    + c * f * f
                                                    + ky * f
                                                    + kx];
                                        }
                                    }
                                }
                                output[fi * out_w * out_h + y * out_w + x] = sum.max(0.0);
                            }
                        }
                    }
                }
                self.put_buf(req.bufs[1], out);
            }
            kernels::ENTRY_LAST_LAYER_DELTA => {
                let (out_w, out_h, truth_w, offset) = (u(0), u(1), u(2), u(3));
                let decay = req.params[0];
                let mut delta = self.take_buf(req.bufs[2])?;
                {
                    let output = self.buf(req.bufs[0])?.f32s();
                    let truth = self.buf(req.bufs[1])?.f32s();
                    let d = delta.f32s_mut();
                    for y in 0..out_h {
                        for x in 0..out_w {
                            let i = y * out_w + x;
                            let out = output[i];
                            let diff = out - truth[(y + offset) * truth_w + x + offset];
                            d[i] = diff * if out > 0.0 { 1.0 } else { 0.0 } + decay;
                        }
                    }
                }
                self.put_buf(req.bufs[2], delta);
            }
            kernels::ENTRY_PROPAGATE_DELTA => {
                let (n_curr, n_next, f, cur_w, cur_h) = (u(0), u(1), u(2), u(3), u(4));
                let next_w = cur_w - f + 1;
                let next_h = cur_h - f + 1;
                let mut delta = self.take_buf(req.bufs[3])?;
                {
                    let next_delta = self.buf(req.bufs[0])?.f32s();
                    let next_weights = self.buf(req.bufs[1])?.f32s();
                    let output = self.buf(req.bufs[2])?.f32s();
                    let d = delta.f32s_mut();
                    for y in 0..cur_h {
                        for x in 0..cur_w {
                            for c in 0..n_curr {
                                let mut acc = 0.0f32;
                                for fi in 0..n_next {
                                    for ky in 0..f {
                                        if y < ky || y - ky >= next_h {
                                            continue;
                                        }
                                        let ny = y - ky;
                                        for kx in 0..f {
                                            if x < kx || x - kx >= next_w {
                                                continue;
                                            }
                                            let nx = x - kx;
                                            acc += next_delta
                                                [fi * next_w * next_h + ny * next_w + nx]
                                                * next_weights[fi * n_curr * f * f
                                                    + c * f * f
                                                    + ky * f
                                                    + kx];
                                        }
                                    }
                                }
                                let i = c * cur_w * cur_h + y * cur_w + x;
                                d[i] = acc * if output[i] > 0.0 { 1.0 } else { 0.0 };
                            }
                        }
                    }
                }
                self.put_buf(req.bufs[3], delta);
            }
            kernels::ENTRY_WEIGHT_GRADIENT => {
                let (n_prev, n_curr, f, in_w, in_h) = (u(0), u(1), u(2), u(3), u(4));
                let out_w = in_w - f + 1;
                let out_h = in_h - f + 1;
                let mut grad = self.take_buf(req.bufs[2])?;
                {
                    let input = self.buf(req.bufs[0])?.f32s();
                    let delta = self.buf(req.bufs[1])?.f32s();
                    let g = grad.f32s_mut();
                    for idx in 0..n_curr * n_prev * f * f {
                        let fi = idx / (n_prev * f * f);
                        let rem = idx % (n_prev * f * f);
                        let c = rem / (f * f);
                        let rem = rem % (f * f);
                        let ky = rem / f;
                        let kx = rem % f;
                        let mut acc = 0.0f32;
                        for y in 0..out_h {
                            for x in 0..out_w {
                                acc += delta[fi * out_w * out_h + y * out_w + x]
                                    * input[c * in_w * in_h + (y + ky) * in_w + x + kx];
                            }
                        }
                        g[idx] = acc;
                    }
                }
                self.put_buf(req.bufs[2], grad);
            }
            kernels::ENTRY_BIAS_GRADIENT => {
                let (n_curr, out_w, out_h) = (u(0), u(1), u(2));
                let mut grad = self.take_buf(req.bufs[1])?;
                {
                    let delta = self.buf(req.bufs[0])?.f32s();
                    let g = grad.f32s_mut();
                    for fi in 0..n_curr {
                        let mut acc = 0.0f32;
                        for y in 0..out_h {
                            for x in 0..out_w {
                                acc += delta[fi * out_w * out_h + y * out_w + x];
                            }
                        }
                        g[fi] = acc;
                    }
                }
                self.put_buf(req.bufs[1], grad);
            }
            kernels::ENTRY_MOMENTUM_UPDATE => {
                let n = u(0);
                let momentum = req.params[0];
                let lr = req.params[1];
                let mut param = self.take_buf(req.bufs[0])?;
                let mut prev_delta = self.take_buf(req.bufs[1])?;
                {
                    let grad = self.buf(req.bufs[2])?.f32s();
                    let p = param.f32s_mut();
                    let pd = prev_delta.f32s_mut();
                    for i in 0..n {
                        let d = momentum * pd[i] + lr * grad[i];
                        pd[i] = d;
                        p[i] -= d;
                    }
                }
                self.put_buf(req.bufs[1], prev_delta);
                self.put_buf(req.bufs[0], param);
            }
            kernels::ENTRY_LUMA_EXTRACT => {
                let n = u(0);
                let normalize = s[1] != 0;
                let mut luma = self.take_buf(req.bufs[1])?;
                {
                    let rgba = self.buf(req.bufs[0])?.f32s();
                    let l = luma.f32s_mut();
                    for i in 0..n {
                        let v = 0.299 * rgba[i * 4]
                            + 0.587 * rgba[i * 4 + 1]
                            + 0.114 * rgba[i * 4 + 2];
                        l[i] = if normalize { v / 255.0 } else { v };
                    }
                }
                self.put_buf(req.bufs[1], luma);
            }
            kernels::ENTRY_MEAN_SUBTRACT => {
                let n = u(0);
                let mean = req.params[0];
                let data = self.buf_mut(req.bufs[0])?.f32s_mut();
                for v in data.iter_mut().take(n) {
                    *v -= mean;
                }
            }
            kernels::ENTRY_REDUCE_SUM => {
                let n = u(0);
                let mut accum = self.take_buf(req.bufs[1])?;
                {
                    let input = self.buf(req.bufs[0])?.f32s();
                    let acc = accum.i64_mut();
                    for &v in input.iter().take(n) {
                        *acc = acc.wrapping_add((v as f64 * FIXED_POINT_SCALE).round() as i64);
                    }
                }
                self.put_buf(req.bufs[1], accum);
            }
            kernels::ENTRY_SQUARED_ERROR_SUM => {
                let (result_w, result_h, truth_w, offset) = (u(0), u(1), u(2), u(3));
                let mut accum = self.take_buf(req.bufs[2])?;
                {
                    let truth = self.buf(req.bufs[0])?.f32s();
                    let result = self.buf(req.bufs[1])?.f32s();
                    let acc = accum.i64_mut();
                    for y in 0..result_h {
                        for x in 0..result_w {
                            let d = truth[(y + offset) * truth_w + x + offset]
                                - result[y * result_w + x];
                            let v = (d as f64 * d as f64 * FIXED_POINT_SCALE).round() as i64;
                            *acc = acc.wrapping_add(v);
                        }
                    }
                }
                self.put_buf(req.bufs[2], accum);
            }
            other => {
                return Err(SrcnnError::Device(format!(
                    "host backend has no implementation for entry point '{other}'"
                )))
            }
        }
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn alloc(&mut self, byte_size: usize) -> Result<BackendBuf> {
        self.buffers.push(Some(HostBuf::new(byte_size)));
        Ok(BackendBuf(self.buffers.len() - 1))
    }

    fn free(&mut self, buf: BackendBuf) -> Result<()> {
        self.take_buf(buf)?;
        Ok(())
    }

    fn write(&mut self, buf: BackendBuf, byte_offset: usize, data: &[u8]) -> Result<()> {
        let b = self.buf_mut(buf)?;
        b.bytes_mut()[byte_offset..byte_offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buf: BackendBuf, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let b = self.buf(buf)?;
        out.copy_from_slice(&b.bytes()[byte_offset..byte_offset + out.len()]);
        Ok(())
    }

    fn compile(&mut self, source: &str, _options: &str, entry: &str) -> Result<BackendKernel> {
        // Emulates a build failure when the source does not declare the
        // requested entry point; real compile errors surface the same way.
        let declared = source.contains(&format!("void {entry}("));
        if !declared {
            return Err(SrcnnError::Device(format!(
                "build failed: entry point '{entry}' not found in program source"
            )));
        }
        if !kernels::KERNEL_ROSTER.iter().any(|(name, _)| *name == entry) {
            return Err(SrcnnError::Device(format!(
                "host backend cannot execute entry point '{entry}'"
            )));
        }
        debug!(entry, "host backend compiled kernel");
        self.kernels.push(entry.to_string());
        Ok(BackendKernel(self.kernels.len() - 1))
    }

    fn kernel_limits(&self, _kernel: BackendKernel) -> KernelLimits {
        KernelLimits {
            max_work_group_size: self.limits.max_work_group_size,
            private_mem_bytes: 0,
        }
    }

    fn launch(&mut self, req: &LaunchRequest<'_>) -> Result<()> {
        let entry = self
            .kernels
            .get(req.kernel.0)
            .ok_or_else(|| SrcnnError::Device(format!("host kernel {} not found", req.kernel.0)))?
            .clone();
        // Synchronous execution over the true extents carried in `shape`;
        // work-items past the logical extent would be guarded out anyway, so
        // results are identical for every valid tiling.
        self.run_entry(&entry, req)
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }
}
