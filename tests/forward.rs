//! Forward-pass behavior against golden values.

use srcnn_gpu::cnn::kernels;
use srcnn_gpu::gpu::context::{ComputeContext, MemFlags};
use srcnn_gpu::gpu::host::HostBackend;
use srcnn_gpu::gpu::kernel::Dispatch;

fn ctx() -> ComputeContext {
    ComputeContext::new(Box::new(HostBackend::new()))
}

/// 5x5 input of 0..25, one 3x3 box filter of ones, bias 0.5. The 3x3 sum
/// around each interior pixel of consecutive integers is nine times the
/// center value.
const GOLDEN_INPUT: [f32; 25] = [
    0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0,
    17.0, 18.0, 19.0, 20.0, 21.0, 22.0, 23.0, 24.0,
];
const GOLDEN_OUTPUT: [f32; 9] = [
    54.5, 63.5, 72.5, 99.5, 108.5, 117.5, 144.5, 153.5, 162.5,
];

fn run_forward(local: [usize; 2]) -> Vec<f32> {
    let mut ctx = ctx();
    let kernel = ctx.create_kernel(kernels::ENTRY_CONV_FORWARD).unwrap();

    let input = ctx.allocate(MemFlags::ReadOnly, 25 * 4).unwrap();
    ctx.write_f32(input, &GOLDEN_INPUT).unwrap();
    let weights = ctx.allocate(MemFlags::ReadOnly, 9 * 4).unwrap();
    ctx.write_f32(weights, &[1.0; 9]).unwrap();
    let bias = ctx.allocate(MemFlags::ReadOnly, 4).unwrap();
    ctx.write_f32(bias, &[0.5]).unwrap();
    let output = ctx.allocate(MemFlags::ReadWrite, 9 * 4).unwrap();

    // Global extent padded to the next power of two of the 3x3 output.
    Dispatch::new(&mut ctx, kernel)
        .arg_buf(input)
        .arg_buf(output)
        .arg_buf(weights)
        .arg_buf(bias)
        .arg_i32(1) // n_prev
        .arg_i32(3) // f
        .arg_i32(5) // in_w
        .arg_i32(5) // in_h
        .arg_i32(1) // n_curr
        .execute(2, &[4, 4], &local, &[])
        .unwrap();
    ctx.block().unwrap();

    let mut out = vec![0.0f32; 9];
    ctx.read_f32(output, &mut out).unwrap();
    out
}

#[test]
fn forward_reproduces_the_golden_tensor() {
    assert_eq!(run_forward([4, 4]), GOLDEN_OUTPUT);
}

#[test]
fn forward_result_is_independent_of_tiling() {
    let reference = run_forward([4, 4]);
    for local in [[1, 1], [2, 2], [4, 1], [1, 4], [2, 4]] {
        assert_eq!(run_forward(local), reference, "tiling {local:?} diverged");
    }
}

#[test]
fn negative_preactivations_are_clamped_by_relu() {
    let mut ctx = ctx();
    let kernel = ctx.create_kernel(kernels::ENTRY_CONV_FORWARD).unwrap();

    let input = ctx.allocate(MemFlags::ReadOnly, 25 * 4).unwrap();
    ctx.write_f32(input, &GOLDEN_INPUT).unwrap();
    let weights = ctx.allocate(MemFlags::ReadOnly, 9 * 4).unwrap();
    ctx.write_f32(weights, &[-1.0; 9]).unwrap();
    let bias = ctx.allocate(MemFlags::ReadOnly, 4).unwrap();
    ctx.write_f32(bias, &[0.0]).unwrap();
    let output = ctx.allocate(MemFlags::ReadWrite, 9 * 4).unwrap();

    Dispatch::new(&mut ctx, kernel)
        .arg_buf(input)
        .arg_buf(output)
        .arg_buf(weights)
        .arg_buf(bias)
        .arg_i32(1)
        .arg_i32(3)
        .arg_i32(5)
        .arg_i32(5)
        .arg_i32(1)
        .execute(2, &[4, 4], &[2, 2], &[])
        .unwrap();
    ctx.block().unwrap();

    let mut out = vec![0.0f32; 9];
    ctx.read_f32(output, &mut out).unwrap();
    assert_eq!(out, vec![0.0; 9]);
}
