//! # Synthetic Weights
//!
//! Deterministic stand-in weights for exercising the full pipeline without
//! downloading a checkpoint. Both sides of a comparison can build the exact
//! same network from a seed.
//!
//! - Convolution and classifier weights: He normal, `std = sqrt(2 / fan_in)`
//! - Batch-norm scale: `Uniform[0.8, 1.2]`, shift: `N(0, 0.05)`
//! - Running mean: `N(0, 0.1)`, running variance: `Uniform[0.5, 1.5]`
//!
//! Non-trivial running statistics matter: they make inference-mode and
//! training-mode batch-norm disagree, and they make batch-norm folding do
//! real work.

use super::resnet::{ResNet, ResNetConfig};
use super::weights::WeightStore;
use crate::tensor::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Small ResNet for offline runs: one block per stage, 32x32 inputs reach
/// the classifier as 1x1 feature maps.
pub fn tiny_config() -> ResNetConfig {
    ResNetConfig {
        blocks: [1, 1, 1, 1],
        base_channels: 4,
        expansion: 4,
        in_channels: 3,
        num_classes: 10,
    }
}

/// Generate a full weight set for `config`
pub fn synthetic_weights(config: &ResNetConfig, seed: u64) -> WeightStore {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut store = WeightStore::new();

    for (name, shape) in ResNet::parameter_shapes(config) {
        let len: usize = shape.iter().product();
        let data: Vec<f32> = if name.ends_with("running_var") {
            (0..len).map(|_| rng.gen_range(0.5..1.5)).collect()
        } else if name.ends_with("running_mean") {
            sample_normal(&mut rng, len, 0.1)
        } else if name.ends_with(".bias") {
            sample_normal(&mut rng, len, 0.05)
        } else if shape.len() == 1 {
            (0..len).map(|_| rng.gen_range(0.8..1.2)).collect()
        } else {
            let fan_in: usize = shape[1..].iter().product();
            let std = if name == "fc.weight" { 1.0 } else { 2.0 };
            sample_normal(&mut rng, len, (std / fan_in as f32).sqrt())
        };

        store.insert(name, Tensor { shape, data });
    }

    store
}

fn sample_normal(rng: &mut ChaCha8Rng, len: usize, std: f32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            let z: f32 = StandardNormal.sample(&mut *rng);
            z * std
        })
        .collect()
}
