//! Image classification model
//!
//! - [`resnet`]: bottleneck ResNet architecture (ResNet-50 by default)
//! - [`weights`]: safetensors weight store and the cache/download source
//! - [`synthetic`]: seeded stand-in weights for offline runs

pub mod resnet;
pub mod synthetic;
pub mod weights;

pub use resnet::{BatchNorm2d, Bottleneck, Conv2d, Linear, ResNet, ResNetConfig};
pub use weights::{WeightStore, WeightsSource};
