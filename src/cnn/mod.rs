//! Network orchestration: kernel contracts, layer descriptors, and the
//! training/inference pipelines.

pub mod config;
pub mod executor;
pub mod kernels;
pub mod layer;
pub mod pipeline;
pub mod trainer;
