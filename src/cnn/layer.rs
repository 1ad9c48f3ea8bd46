//! Layer descriptor: immutable shape plus owned parameter tensors.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, SrcnnError};

/// One convolution layer's shape and parameters.
///
/// The shape triple is fixed at construction; weights and bias are mutated
/// only by an explicit update step or a parameter-file load. Layouts match
/// the kernel convention: weights filter-major, then input channel, then
/// spatial row-major.
#[derive(Debug, Clone)]
pub struct LayerData {
    n_prev_filter_cnt: usize,
    n_filter_cnt: usize,
    f_spatial_size: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LayerData {
    /// Builds a layer with zeroed parameters.
    pub fn new(n_prev_filter_cnt: usize, n_filter_cnt: usize, f_spatial_size: usize) -> Self {
        let mut layer = LayerData {
            n_prev_filter_cnt,
            n_filter_cnt,
            f_spatial_size,
            weights: Vec::new(),
            bias: Vec::new(),
        };
        layer.weights = vec![0.0; layer.weight_size()];
        layer.bias = vec![0.0; layer.bias_size()];
        layer
    }

    /// Builds a layer with normally distributed parameters from a fixed seed.
    pub fn with_random_parameters(
        n_prev_filter_cnt: usize,
        n_filter_cnt: usize,
        f_spatial_size: usize,
        seed: u64,
        weight_mean: f32,
        weight_stddev: f32,
        bias_mean: f32,
        bias_stddev: f32,
    ) -> Result<Self> {
        let mut layer = Self::new(n_prev_filter_cnt, n_filter_cnt, f_spatial_size);
        let mut rng = StdRng::seed_from_u64(seed);
        let weight_dist = Normal::new(weight_mean, weight_stddev)
            .map_err(|e| SrcnnError::Config(format!("bad weight distribution: {e}")))?;
        let bias_dist = Normal::new(bias_mean, bias_stddev)
            .map_err(|e| SrcnnError::Config(format!("bad bias distribution: {e}")))?;
        for w in layer.weights.iter_mut() {
            *w = weight_dist.sample(&mut rng);
        }
        for b in layer.bias.iter_mut() {
            *b = bias_dist.sample(&mut rng);
        }
        Ok(layer)
    }

    pub fn n_prev_filter_cnt(&self) -> usize {
        self.n_prev_filter_cnt
    }

    pub fn n_filter_cnt(&self) -> usize {
        self.n_filter_cnt
    }

    pub fn f_spatial_size(&self) -> usize {
        self.f_spatial_size
    }

    pub fn weight_size(&self) -> usize {
        self.f_spatial_size * self.f_spatial_size * self.n_prev_filter_cnt * self.n_filter_cnt
    }

    pub fn bias_size(&self) -> usize {
        self.n_filter_cnt
    }

    /// Valid-convolution output extent. The filter must fit inside the
    /// input in both dimensions.
    pub fn output_dims(&self, w: usize, h: usize) -> Result<(usize, usize)> {
        let f = self.f_spatial_size;
        if f > w || f > h {
            return Err(SrcnnError::SizeMismatch(format!(
                "filter size {f} exceeds input extent {w}x{h}"
            )));
        }
        Ok((w - f + 1, h - f + 1))
    }

    /// Checked before any execution that binds this layer's parameters.
    pub fn validate(&self) -> Result<()> {
        if self.weights.len() < self.weight_size() {
            return Err(SrcnnError::SizeMismatch(format!(
                "layer holds {} weights, needs {} for {}x{} filters of size {}",
                self.weights.len(),
                self.weight_size(),
                self.n_prev_filter_cnt,
                self.n_filter_cnt,
                self.f_spatial_size
            )));
        }
        if self.bias.len() < self.bias_size() {
            return Err(SrcnnError::SizeMismatch(format!(
                "layer holds {} bias values, needs {}",
                self.bias.len(),
                self.bias_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dims_follow_valid_convolution() {
        for f in [1usize, 3, 5, 9] {
            let layer = LayerData::new(1, 4, f);
            assert_eq!(layer.output_dims(32, 20).unwrap(), (32 - f + 1, 20 - f + 1));
        }
    }

    #[test]
    fn filter_larger_than_input_fails() {
        let layer = LayerData::new(1, 4, 9);
        assert!(layer.output_dims(8, 32).is_err());
        assert!(layer.output_dims(32, 8).is_err());
        // exactly-fitting filter produces a 1x1 output
        assert_eq!(layer.output_dims(9, 9).unwrap(), (1, 1));
    }

    #[test]
    fn validation_boundary_is_exact() {
        let mut layer = LayerData::new(3, 4, 5);
        assert_eq!(layer.weight_size(), 5 * 5 * 3 * 4);
        assert!(layer.validate().is_ok());

        layer.weights.pop();
        assert!(layer.validate().is_err());

        layer.weights.push(0.0);
        layer.bias.pop();
        assert!(layer.validate().is_err());
    }

    #[test]
    fn seeded_initialization_is_deterministic() {
        let a = LayerData::with_random_parameters(1, 8, 3, 42, 0.0, 0.1, 0.0, 0.01).unwrap();
        let b = LayerData::with_random_parameters(1, 8, 3, 42, 0.0, 0.1, 0.0, 0.01).unwrap();
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.bias, b.bias);
        let c = LayerData::with_random_parameters(1, 8, 3, 43, 0.0, 0.1, 0.0, 0.01).unwrap();
        assert_ne!(a.weights, c.weights);
    }
}
