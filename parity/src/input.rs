//! Random input generation
//!
//! The input image is drawn from a standard normal distribution with an
//! explicitly seeded generator, so a run can be reproduced from its seed.

use crate::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Seed used when none is configured
pub const DEFAULT_SEED: u64 = 42;

/// Shape of the generated input tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// NCHW dimensions
    pub shape: Vec<usize>,
}

impl Default for InputSpec {
    /// One 3-channel 224x224 image
    fn default() -> Self {
        Self {
            shape: vec![1, 3, 224, 224],
        }
    }
}

impl InputSpec {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Draw an input tensor with i.i.d. N(0, 1) entries
pub fn generate_input(spec: &InputSpec, seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data: Vec<f32> = (0..spec.num_elements())
        .map(|_| -> f32 { StandardNormal.sample(&mut rng) })
        .collect();

    Tensor {
        shape: spec.shape.clone(),
        data,
    }
}
