//! Kernel programs by role, and the positional argument contract each one
//! exposes to the host pipeline.
//!
//! The host never inspects kernel source beyond this contract. Every entry
//! point takes its buffer arguments in declared order, followed by two packed
//! scalar buffers: `const int* shape` (integer scalars, in push order) and
//! `const float* params` (float scalars, in push order). Both are always
//! bound, even when empty.
//!
//! Reduction entries accumulate into a single two's-complement 64-bit
//! accumulator holding the sum scaled by [`FIXED_POINT_SCALE`]; integer
//! accumulation keeps the result independent of work-item scheduling.
//!
//! Layout conventions (shared with `LayerData`):
//! - feature maps are filter-major, row-major within a filter:
//!   `buf[c * w * h + y * w + x]`
//! - weights are filter-major, then input-channel, then spatial row-major:
//!   `w[fi * n_prev * f * f + c * f * f + ky * f + kx]`

/// Scale applied to float values before integer accumulation in the
/// reduction kernels. 2^32: squared differences of [0,1]-normalized pixels
/// keep ~9 significant decimal digits and a 4-megapixel image stays well
/// inside the i64 range.
pub const FIXED_POINT_SCALE: f64 = 4294967296.0;

// Entry point names. `create_kernel` resolves these against the compiled
// programs; the host backend interprets them directly.
pub const ENTRY_CONV_FORWARD: &str = "conv_forward";
pub const ENTRY_LAST_LAYER_DELTA: &str = "last_layer_delta";
pub const ENTRY_PROPAGATE_DELTA: &str = "propagate_delta";
pub const ENTRY_WEIGHT_GRADIENT: &str = "weight_gradient";
pub const ENTRY_BIAS_GRADIENT: &str = "bias_gradient";
pub const ENTRY_MOMENTUM_UPDATE: &str = "momentum_update";
pub const ENTRY_LUMA_EXTRACT: &str = "luma_extract";
pub const ENTRY_MEAN_SUBTRACT: &str = "mean_subtract";
pub const ENTRY_REDUCE_SUM: &str = "reduce_sum";
pub const ENTRY_SQUARED_ERROR_SUM: &str = "squared_error_sum";

/// All entry points the pipeline may request, with their program source.
/// The `&'static` names are also what the CUDA backend registers at module
/// load time.
pub const KERNEL_ROSTER: &[(&str, &str)] = &[
    (ENTRY_CONV_FORWARD, LAYER_FORWARD_SRC),
    (ENTRY_LAST_LAYER_DELTA, LAYER_DELTA_SRC),
    (ENTRY_PROPAGATE_DELTA, LAYER_DELTA_SRC),
    (ENTRY_WEIGHT_GRADIENT, LAYER_BACKPROP_SRC),
    (ENTRY_BIAS_GRADIENT, LAYER_BACKPROP_SRC),
    (ENTRY_MOMENTUM_UPDATE, LAYER_BACKPROP_SRC),
    (ENTRY_LUMA_EXTRACT, LUMA_EXTRACT_SRC),
    (ENTRY_MEAN_SUBTRACT, MEAN_SUBTRACT_SRC),
    (ENTRY_REDUCE_SUM, REDUCTION_SRC),
    (ENTRY_SQUARED_ERROR_SUM, REDUCTION_SRC),
];

/// Forward valid convolution with bias and ReLU.
///
/// bufs:  [input, output, weights, bias]
/// shape: [n_prev, f, in_w, in_h, n_curr]
/// 2D dispatch over the output extent; each work-item produces one output
/// pixel for every filter.
pub const LAYER_FORWARD_SRC: &str = r#"
extern "C" {

__global__ void conv_forward(const float* input, float* output,
                             const float* weights, const float* bias,
                             const int* shape, const float* params) {
    int n_prev = shape[0];
    int f      = shape[1];
    int in_w   = shape[2];
    int in_h   = shape[3];
    int n_curr = shape[4];
    int out_w = in_w - f + 1;
    int out_h = in_h - f + 1;

    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= out_w || y >= out_h) return;

    for (int fi = 0; fi < n_curr; fi++) {
        float sum = bias[fi];
        for (int c = 0; c < n_prev; c++) {
            for (int ky = 0; ky < f; ky++) {
                for (int kx = 0; kx < f; kx++) {
                    sum += input[c * in_w * in_h + (y + ky) * in_w + (x + kx)]
                         * weights[fi * n_prev * f * f + c * f * f + ky * f + kx];
                }
            }
        }
        output[fi * out_w * out_h + y * out_w + x] = sum > 0.0f ? sum : 0.0f;
    }
}

}
"#;

/// Delta kernels.
///
/// `last_layer_delta`
///   bufs:  [output, truth, delta]
///   shape: [out_w, out_h, truth_w, offset]
///   params: [decay_term]
///   delta = (output - truth_aligned) * relu'(output) + decay_term, where the
///   padded ground truth is aligned by `offset` pixels on each side.
///
/// `propagate_delta`
///   bufs:  [next_delta, next_weights, output, delta]
///   shape: [n_curr, n_next, f_next, cur_w, cur_h]
///   Layer L's delta from layer L+1's delta and weights (valid-convolution
///   transpose) gated by relu'(layer L output).
pub const LAYER_DELTA_SRC: &str = r#"
extern "C" {

__global__ void last_layer_delta(const float* output, const float* truth,
                                 float* delta,
                                 const int* shape, const float* params) {
    int out_w   = shape[0];
    int out_h   = shape[1];
    int truth_w = shape[2];
    int offset  = shape[3];
    float decay = params[0];

    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= out_w || y >= out_h) return;

    int i = y * out_w + x;
    float out = output[i];
    float diff = out - truth[(y + offset) * truth_w + (x + offset)];
    delta[i] = diff * (out > 0.0f ? 1.0f : 0.0f) + decay;
}

__global__ void propagate_delta(const float* next_delta, const float* next_weights,
                                const float* output, float* delta,
                                const int* shape, const float* params) {
    int n_curr = shape[0];
    int n_next = shape[1];
    int f      = shape[2];
    int cur_w  = shape[3];
    int cur_h  = shape[4];
    int next_w = cur_w - f + 1;
    int next_h = cur_h - f + 1;

    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= cur_w || y >= cur_h) return;

    for (int c = 0; c < n_curr; c++) {
        float acc = 0.0f;
        for (int fi = 0; fi < n_next; fi++) {
            for (int ky = 0; ky < f; ky++) {
                int ny = y - ky;
                if (ny < 0 || ny >= next_h) continue;
                for (int kx = 0; kx < f; kx++) {
                    int nx = x - kx;
                    if (nx < 0 || nx >= next_w) continue;
                    acc += next_delta[fi * next_w * next_h + ny * next_w + nx]
                         * next_weights[fi * n_curr * f * f + c * f * f + ky * f + kx];
                }
            }
        }
        int i = c * cur_w * cur_h + y * cur_w + x;
        delta[i] = acc * (output[i] > 0.0f ? 1.0f : 0.0f);
    }
}

}
"#;

/// Gradient and update kernels.
///
/// `weight_gradient`
///   bufs:  [input, delta, grad_w]
///   shape: [n_prev, n_curr, f, in_w, in_h]
///   1D dispatch over the weight count; grad_w[fi,c,ky,kx] = sum over the
///   output extent of delta[fi] * input[c] at the shifted position.
///
/// `bias_gradient`
///   bufs:  [delta, grad_b]
///   shape: [n_curr, out_w, out_h]
///
/// `momentum_update`
///   bufs:  [param, prev_delta, grad]
///   shape: [n]
///   params: [momentum, learning_rate]
///   prev_delta = momentum * prev_delta + lr * grad; param -= prev_delta.
///   The new prev_delta is the retained optimizer state for the next step.
pub const LAYER_BACKPROP_SRC: &str = r#"
extern "C" {

__global__ void weight_gradient(const float* input, const float* delta,
                                float* grad_w,
                                const int* shape, const float* params) {
    int n_prev = shape[0];
    int n_curr = shape[1];
    int f      = shape[2];
    int in_w   = shape[3];
    int in_h   = shape[4];
    int out_w = in_w - f + 1;
    int out_h = in_h - f + 1;

    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    int total = n_curr * n_prev * f * f;
    if (idx >= total) return;

    int fi = idx / (n_prev * f * f);
    int rem = idx % (n_prev * f * f);
    int c = rem / (f * f);
    rem = rem % (f * f);
    int ky = rem / f;
    int kx = rem % f;

    float acc = 0.0f;
    for (int y = 0; y < out_h; y++) {
        for (int x = 0; x < out_w; x++) {
            acc += delta[fi * out_w * out_h + y * out_w + x]
                 * input[c * in_w * in_h + (y + ky) * in_w + (x + kx)];
        }
    }
    grad_w[idx] = acc;
}

__global__ void bias_gradient(const float* delta, float* grad_b,
                              const int* shape, const float* params) {
    int n_curr = shape[0];
    int out_w  = shape[1];
    int out_h  = shape[2];

    int fi = blockIdx.x * blockDim.x + threadIdx.x;
    if (fi >= n_curr) return;

    float acc = 0.0f;
    for (int y = 0; y < out_h; y++) {
        for (int x = 0; x < out_w; x++) {
            acc += delta[fi * out_w * out_h + y * out_w + x];
        }
    }
    grad_b[fi] = acc;
}

__global__ void momentum_update(float* param, float* prev_delta,
                                const float* grad,
                                const int* shape, const float* params) {
    int n = shape[0];
    float momentum = params[0];
    float lr       = params[1];

    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;

    float pd = momentum * prev_delta[i] + lr * grad[i];
    prev_delta[i] = pd;
    param[i] -= pd;
}

}
"#;

/// Luma extraction.
///
/// bufs:  [rgba, luma]
/// shape: [n_pixels, normalize]
/// The RGBA buffer holds four floats per pixel in [0, 255] (expanded from
/// 8-bit channels on upload). With normalize != 0 the luma lands in [0, 1].
pub const LUMA_EXTRACT_SRC: &str = r#"
extern "C" {

__global__ void luma_extract(const float* rgba, float* luma,
                             const int* shape, const float* params) {
    int n = shape[0];
    int normalize = shape[1];

    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;

    float l = 0.299f * rgba[i * 4]
            + 0.587f * rgba[i * 4 + 1]
            + 0.114f * rgba[i * 4 + 2];
    luma[i] = normalize ? l / 255.0f : l;
}

}
"#;

/// In-place scalar mean subtraction.
///
/// bufs:  [data]
/// shape: [n]
/// params: [mean]
pub const MEAN_SUBTRACT_SRC: &str = r#"
extern "C" {

__global__ void mean_subtract(float* data,
                              const int* shape, const float* params) {
    int n = shape[0];
    float mean = params[0];

    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    data[i] -= mean;
}

}
"#;

/// Parallel reductions into one fixed-point i64 accumulator.
///
/// `reduce_sum`
///   bufs:  [input, accum]
///   shape: [n]
///
/// `squared_error_sum`
///   bufs:  [truth, result, accum]
///   shape: [result_w, result_h, truth_w, offset]
///
/// The accumulator is an 8-byte buffer zeroed by the caller; device atomics
/// are unsigned, so signed contributions rely on two's-complement wraparound
/// and the host reinterprets the final bits as i64.
pub const REDUCTION_SRC: &str = r#"
extern "C" {

#define FIXED_POINT_SCALE 4294967296.0

__global__ void reduce_sum(const float* input, unsigned long long* accum,
                           const int* shape, const float* params) {
    int n = shape[0];

    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;

    long long v = llrint((double)input[i] * FIXED_POINT_SCALE);
    atomicAdd(accum, (unsigned long long)v);
}

__global__ void squared_error_sum(const float* truth, const float* result,
                                  unsigned long long* accum,
                                  const int* shape, const float* params) {
    int result_w = shape[0];
    int result_h = shape[1];
    int truth_w  = shape[2];
    int offset   = shape[3];

    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= result_w || y >= result_h) return;

    float d = truth[(y + offset) * truth_w + (x + offset)]
            - result[y * result_w + x];
    long long v = llrint((double)d * (double)d * FIXED_POINT_SCALE);
    atomicAdd(accum, (unsigned long long)v);
}

}
"#;
