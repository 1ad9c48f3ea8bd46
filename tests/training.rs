//! Error metrics, optimizer behavior, and end-to-end pipeline checks.

use srcnn_gpu::cnn::config::{Config, LayerInit};
use srcnn_gpu::cnn::layer::LayerData;
use srcnn_gpu::cnn::pipeline::{weight_decay_term, DataPipeline, LayerGpuPool};
use srcnn_gpu::cnn::trainer::SrcnnPipeline;
use srcnn_gpu::error::SrcnnError;
use srcnn_gpu::gpu::context::{BufferHandle, ComputeContext, MemFlags};
use srcnn_gpu::gpu::host::HostBackend;

fn pipeline(momentum: f32, lr: [f32; 3]) -> DataPipeline {
    let ctx = ComputeContext::new(Box::new(HostBackend::new()));
    DataPipeline::new(ctx, momentum, 0.0, lr)
}

fn upload(pipeline: &mut DataPipeline, data: &[f32]) -> BufferHandle {
    let ctx = pipeline.context();
    let h = ctx.allocate(MemFlags::ReadWrite, data.len() * 4).unwrap();
    ctx.write_f32(h, data).unwrap();
    h
}

/// RGBA bytes of a constant gray image.
fn constant_image(gray: u8, w: usize, h: usize) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(w * h * 4);
    for _ in 0..w * h {
        rgba.extend_from_slice(&[gray, gray, gray, 255]);
    }
    rgba
}

#[test]
fn mse_of_a_buffer_against_its_own_crop_is_zero() {
    let mut p = pipeline(0.9, [0.0; 3]);

    // 9x9 ground truth; the 5x5 result is its center crop (padding 4).
    let truth: Vec<f32> = (0..81).map(|v| (v as f32) * 0.01).collect();
    let mut result = vec![0.0f32; 25];
    for y in 0..5 {
        for x in 0..5 {
            result[y * 5 + x] = truth[(y + 2) * 9 + (x + 2)];
        }
    }
    let truth_buf = upload(&mut p, &truth);
    let result_buf = upload(&mut p, &result);

    let mse = p
        .mean_squared_error(truth_buf, 9, 9, result_buf, 5, 5, 4, &[])
        .unwrap();
    assert_eq!(mse, 0.0);
}

#[test]
fn mse_with_equal_padding_of_zero_is_zero() {
    let mut p = pipeline(0.9, [0.0; 3]);
    let data: Vec<f32> = (0..25).map(|v| v as f32 * 0.1).collect();
    let a = upload(&mut p, &data);
    let b = upload(&mut p, &data);
    assert_eq!(p.mean_squared_error(a, 5, 5, b, 5, 5, 0, &[]).unwrap(), 0.0);
}

#[test]
fn mse_of_a_uniform_offset_is_exact() {
    let mut p = pipeline(0.9, [0.0; 3]);
    let truth: Vec<f32> = vec![1.0; 81];
    let result = vec![0.5f32; 25];
    let truth_buf = upload(&mut p, &truth);
    let result_buf = upload(&mut p, &result);
    let mse = p
        .mean_squared_error(truth_buf, 9, 9, result_buf, 5, 5, 4, &[])
        .unwrap();
    assert_eq!(mse, 0.25);
}

#[test]
fn mismatched_padding_is_rejected_before_dispatch() {
    let mut p = pipeline(0.9, [0.0; 3]);
    let truth_buf = upload(&mut p, &vec![0.0f32; 81]);
    let result_buf = upload(&mut p, &vec![0.0f32; 25]);
    let r = p.mean_squared_error(truth_buf, 9, 9, result_buf, 5, 5, 2, &[]);
    assert!(matches!(r, Err(SrcnnError::SizeMismatch(_))));
}

fn tiny_pools(p: &mut DataPipeline, layers: &[LayerData; 3]) -> [LayerGpuPool; 3] {
    let mut pools = Vec::new();
    for layer in layers {
        let ctx = p.context();
        let w = layer.weight_size() * 4;
        let b = layer.bias_size() * 4;
        let pool = LayerGpuPool {
            weights: ctx.allocate(MemFlags::ReadWrite, w).unwrap(),
            bias: ctx.allocate(MemFlags::ReadWrite, b).unwrap(),
            output: ctx.allocate(MemFlags::ReadWrite, 4).unwrap(),
            delta: ctx.allocate(MemFlags::ReadWrite, 4).unwrap(),
            grad_weights: ctx.allocate(MemFlags::ReadWrite, w).unwrap(),
            grad_bias: ctx.allocate(MemFlags::ReadWrite, b).unwrap(),
            prev_delta_weights: ctx.allocate(MemFlags::ReadWrite, w).unwrap(),
            prev_delta_bias: ctx.allocate(MemFlags::ReadWrite, b).unwrap(),
        };
        pools.push(pool);
    }
    pools.try_into().ok().unwrap()
}

#[test]
fn forward_accounts_for_input_channels_in_the_size_check() {
    let mut p = pipeline(0.9, [0.0; 3]);
    let layers = [
        LayerData::new(2, 1, 1),
        LayerData::new(1, 1, 1),
        LayerData::new(1, 1, 1),
    ];
    let pools = tiny_pools(&mut p, &layers);
    // Room for one channel only; a two-channel first layer needs double.
    let input = upload(&mut p, &[0.0f32; 9]);
    let r = p.forward(&layers, &pools, input, 3, 3, false, &[]);
    assert!(matches!(r, Err(SrcnnError::SizeMismatch(_))));
}

#[test]
fn zero_learning_rate_update_is_pure_momentum() {
    let momentum = 0.7f32;
    let mut p = pipeline(momentum, [0.0; 3]);
    let mut layers = [
        LayerData::new(1, 1, 1),
        LayerData::new(1, 1, 1),
        LayerData::new(1, 1, 1),
    ];
    let pools = tiny_pools(&mut p, &layers);

    let params = [2.0f32, -1.5, 0.25];
    let prevs = [0.5f32, 0.125, -3.0];
    for i in 0..3 {
        layers[i].weights[0] = params[i];
        let ctx = p.context();
        ctx.write_f32(pools[i].weights, &[params[i]]).unwrap();
        ctx.write_f32(pools[i].prev_delta_weights, &[prevs[i]]).unwrap();
        ctx.write_f32(pools[i].bias, &[params[i]]).unwrap();
        ctx.write_f32(pools[i].prev_delta_bias, &[prevs[i]]).unwrap();
        // gradients deliberately junk; lr = 0 must ignore them
        ctx.write_f32(pools[i].grad_weights, &[987.654]).unwrap();
        ctx.write_f32(pools[i].grad_bias, &[-42.0]).unwrap();
    }

    p.momentum_step(&mut layers, &pools, &[]).unwrap();

    for i in 0..3 {
        let expected = params[i] - momentum * prevs[i];
        assert_eq!(layers[i].weights[0], expected, "layer {i} weight");
        assert_eq!(layers[i].bias[0], expected, "layer {i} bias");
        // optimizer state advanced to the applied delta
        let mut prev = [0.0f32];
        p.context()
            .read_f32(pools[i].prev_delta_weights, &mut prev)
            .unwrap();
        assert_eq!(prev[0], momentum * prevs[i]);
    }
}

#[test]
fn weight_decay_matches_the_closed_form_for_odd_tensor_sizes() {
    let w1: Vec<f32> = (0..2555).map(|i| ((i % 13) as f32) * 0.03 - 0.18).collect();
    let w2: Vec<f32> = (0..4000).map(|i| ((i % 7) as f32) * 0.05 - 0.15).collect();
    let w3: Vec<f32> = (0..30).map(|i| i as f32 * 0.1).collect();
    let lambda = 0.001f32;

    let expected: f64 = lambda as f64
        * (w1.iter().map(|v| (*v as f64).powi(2)).sum::<f64>()
            + w2.iter().map(|v| (*v as f64).powi(2)).sum::<f64>()
            + w3.iter().map(|v| (*v as f64).powi(2)).sum::<f64>());
    let got = weight_decay_term(&w1, &w2, &w3, lambda);
    assert!((got - expected).abs() < 1e-9, "got {got}, expected {expected}");
}

/// Constant weights from zero-stddev initialization, so every filter of a
/// layer computes the same value and a constant input must stay constant
/// through the whole network.
fn constant_network_config() -> Config {
    let init = |seed, weight_mean| LayerInit {
        seed,
        weight_mean,
        weight_stddev: 0.0,
        bias_mean: 0.0,
        bias_stddev: 0.0,
    };
    Config {
        n1: 32,
        n2: 16,
        f1: 9,
        f2: 1,
        f3: 5,
        momentum: 0.9,
        weight_decay: 0.0,
        learning_rate: [1e-4, 1e-4, 1e-5],
        layer_init: [init(1, 0.01), init(2, 0.01), init(3, 0.001)],
        parameters_file: None,
        subtract_input_mean: false,
    }
}

#[test]
fn constant_input_propagates_to_a_constant_output() {
    let config = constant_network_config();
    let mut pipeline =
        SrcnnPipeline::new(Box::new(HostBackend::new()), config, 24, 24).unwrap();

    let image = constant_image(128, 24, 24);
    let (luma, out_w, out_h) = pipeline.reconstruct(&image, 24, 24).unwrap();
    assert_eq!((out_w, out_h), (12, 12));

    let first = luma[0];
    assert!(luma.iter().all(|v| *v == first), "output not constant");

    // Closed form: luma = 128/255; then per layer sum of (count * weight)
    // contributions with zero bias and ReLU on non-negative values.
    let c0 = (0.299f32 * 128.0 + 0.587 * 128.0 + 0.114 * 128.0) / 255.0;
    let c1 = c0 * 81.0 * 0.01;
    let c2 = c1 * 32.0 * 0.01;
    let c3 = c2 * 16.0 * 25.0 * 0.001;
    assert!(
        (first - c3).abs() < 1e-4,
        "constant output {first} far from closed form {c3}"
    );
}

#[test]
fn reconstruct_accepts_an_image_that_yields_a_single_pixel() {
    let config = constant_network_config();
    let mut pipeline =
        SrcnnPipeline::new(Box::new(HostBackend::new()), config, 24, 24).unwrap();

    // 9 + 1 + 5 filters strip 12 pixels per axis, so 13x13 is the smallest
    // usable image and produces a 1x1 output.
    let image = constant_image(128, 13, 13);
    let (luma, out_w, out_h) = pipeline.reconstruct(&image, 13, 13).unwrap();
    assert_eq!((out_w, out_h), (1, 1));
    assert_eq!(luma.len(), 1);

    let too_small = constant_image(128, 12, 12);
    assert!(matches!(
        pipeline.reconstruct(&too_small, 12, 12),
        Err(SrcnnError::SizeMismatch(_))
    ));
}

#[test]
fn training_steps_run_and_reduce_the_error() {
    let mut config = constant_network_config();
    config.momentum = 0.5;
    let mut pipeline =
        SrcnnPipeline::new(Box::new(HostBackend::new()), config, 24, 24).unwrap();

    let input = constant_image(128, 24, 24);
    let truth = constant_image(200, 24, 24);

    let first_mse = pipeline.train_step(&input, &truth).unwrap();
    assert!(first_mse.is_finite() && first_mse > 0.0);

    let mut last_mse = first_mse;
    for _ in 0..10 {
        last_mse = pipeline.train_step(&input, &truth).unwrap();
    }
    assert!(
        last_mse < first_mse,
        "mse did not improve: {first_mse} -> {last_mse}"
    );
}

#[test]
fn parameters_survive_a_dump_and_reload_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("params.bin");

    let mut config = constant_network_config();
    config.parameters_file = Some(path.clone());

    let input = constant_image(128, 24, 24);
    let truth = constant_image(200, 24, 24);

    let trained_weights = {
        let mut p = SrcnnPipeline::new(Box::new(HostBackend::new()), config.clone(), 24, 24).unwrap();
        for _ in 0..3 {
            p.train_step(&input, &truth).unwrap();
        }
        p.dump_parameters().unwrap();
        p.layers()[0].weights.clone()
    };

    // A fresh pipeline picks the file up at construction.
    let p = SrcnnPipeline::new(Box::new(HostBackend::new()), config, 24, 24).unwrap();
    assert_eq!(p.layers()[0].weights, trained_weights);
}
