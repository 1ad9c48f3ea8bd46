//! Host-side orchestration for a fixed 3-layer convolutional
//! super-resolution network on a GPU compute backend.
//!
//! The crate owns device-memory allocation, validated kernel dispatch, and
//! the full numerical pipeline: forward inference, loss computation,
//! backpropagation, and momentum parameter update. Kernel math lives in
//! the programs under [`cnn::kernels`]; the host respects their argument
//! contracts and never reimplements them.
//!
//! Backends implement [`gpu::backend::ComputeBackend`]: CUDA via runtime
//! NVRTC compilation (feature `cuda`), plus a host reference backend that
//! executes the same kernel contracts on the CPU.

pub mod cnn;
pub mod error;
pub mod gpu;
