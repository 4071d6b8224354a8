//! ResNet with bottleneck blocks
//!
//! Parameter names follow the torchvision/timm layout so published
//! checkpoints load without renaming:
//!
//! ```text
//! conv1.weight, bn1.{weight,bias,running_mean,running_var}
//! layer{1..4}.{i}.conv{1,2,3}.weight, layer{1..4}.{i}.bn{1,2,3}.*
//! layer{1..4}.0.downsample.0.weight, layer{1..4}.0.downsample.1.*
//! fc.weight, fc.bias
//! ```
//!
//! The stride of a downsampling block sits on its 3x3 convolution.

use crate::errors::{ParityError, Result};
use crate::graph::ExecutionMode;
use crate::ops;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::weights::WeightStore;

/// Batch-norm epsilon used by torchvision checkpoints
pub const BN_EPS: f32 = 1e-5;

/// Architecture hyperparameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Bottleneck blocks per stage
    pub blocks: [usize; 4],
    /// Width of the stem and of the first stage's inner convolutions
    pub base_channels: usize,
    /// Output width multiplier of a bottleneck
    pub expansion: usize,
    /// Image channels
    pub in_channels: usize,
    /// Classifier outputs
    pub num_classes: usize,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet50()
    }
}

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self {
            blocks: [3, 4, 6, 3],
            base_channels: 64,
            expansion: 4,
            in_channels: 3,
            num_classes: 1000,
        }
    }

    /// Width of the pooled feature vector fed to the classifier
    pub fn feature_dim(&self) -> usize {
        (self.base_channels << 3) * self.expansion
    }
}

/// 2D convolution layer
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// [out, in, kh, kw]
    pub weight: Tensor,
    pub bias: Option<Vec<f32>>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        ops::conv2d(
            input,
            &self.weight,
            self.bias.as_deref(),
            self.stride,
            self.padding,
        )
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape.first().copied().unwrap_or(0)
    }
}

/// Batch normalization over channels
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    pub fn forward(&self, input: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        match mode {
            ExecutionMode::Inference => ops::batch_norm(
                input,
                &self.weight,
                &self.bias,
                &self.running_mean,
                &self.running_var,
                self.eps,
            ),
            ExecutionMode::Training => {
                ops::batch_norm_batch_stats(input, &self.weight, &self.bias, self.eps)
            }
        }
    }
}

/// Fully connected classifier head
#[derive(Debug, Clone)]
pub struct Linear {
    /// [out, in]
    pub weight: Tensor,
    pub bias: Vec<f32>,
}

impl Linear {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        ops::linear(input, &self.weight, Some(&self.bias))
    }
}

/// 1x1 -> 3x3 -> 1x1 residual block
#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub conv3: Conv2d,
    pub bn3: BatchNorm2d,
    /// Projection shortcut, present when the block changes shape
    pub downsample: Option<(Conv2d, BatchNorm2d)>,
}

impl Bottleneck {
    pub fn forward(&self, input: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let mut out = self.bn1.forward(&self.conv1.forward(input)?, mode)?;
        ops::relu_inplace(&mut out);
        let mut out = self.bn2.forward(&self.conv2.forward(&out)?, mode)?;
        ops::relu_inplace(&mut out);
        let mut out = self.bn3.forward(&self.conv3.forward(&out)?, mode)?;

        match &self.downsample {
            Some((conv, bn)) => {
                let identity = bn.forward(&conv.forward(input)?, mode)?;
                ops::add_inplace(&mut out, &identity)?;
            }
            None => ops::add_inplace(&mut out, input)?,
        }
        ops::relu_inplace(&mut out);
        Ok(out)
    }
}

/// ResNet classifier
#[derive(Debug, Clone)]
pub struct ResNet {
    pub config: ResNetConfig,
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    /// Four stages of bottleneck blocks
    pub stages: Vec<Vec<Bottleneck>>,
    pub fc: Linear,
}

impl ResNet {
    /// Every parameter the architecture expects, with its shape
    pub fn parameter_shapes(config: &ResNetConfig) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        let base = config.base_channels;

        shapes.push(("conv1.weight".to_string(), vec![base, config.in_channels, 7, 7]));
        push_bn_shapes(&mut shapes, "bn1", base);

        let mut in_planes = base;
        for (stage, &blocks) in config.blocks.iter().enumerate() {
            let width = base << stage;
            let out_planes = width * config.expansion;
            for i in 0..blocks {
                let prefix = format!("layer{}.{}", stage + 1, i);
                shapes.push((format!("{}.conv1.weight", prefix), vec![width, in_planes, 1, 1]));
                push_bn_shapes(&mut shapes, &format!("{}.bn1", prefix), width);
                shapes.push((format!("{}.conv2.weight", prefix), vec![width, width, 3, 3]));
                push_bn_shapes(&mut shapes, &format!("{}.bn2", prefix), width);
                shapes.push((format!("{}.conv3.weight", prefix), vec![out_planes, width, 1, 1]));
                push_bn_shapes(&mut shapes, &format!("{}.bn3", prefix), out_planes);

                if i == 0 && needs_projection(stage, in_planes, out_planes) {
                    shapes.push((
                        format!("{}.downsample.0.weight", prefix),
                        vec![out_planes, in_planes, 1, 1],
                    ));
                    push_bn_shapes(&mut shapes, &format!("{}.downsample.1", prefix), out_planes);
                }
                in_planes = out_planes;
            }
        }

        shapes.push(("fc.weight".to_string(), vec![config.num_classes, in_planes]));
        shapes.push(("fc.bias".to_string(), vec![config.num_classes]));
        shapes
    }

    /// Build the network from a weight store, consuming the parameters it uses
    pub fn from_weights(config: ResNetConfig, mut store: WeightStore) -> Result<Self> {
        let base = config.base_channels;

        let conv1 = take_conv(&mut store, "conv1", [base, config.in_channels, 7, 7], 2, 3)?;
        let bn1 = take_bn(&mut store, "bn1", base)?;

        let mut stages = Vec::with_capacity(config.blocks.len());
        let mut in_planes = base;
        for (stage, &blocks) in config.blocks.iter().enumerate() {
            let width = base << stage;
            let out_planes = width * config.expansion;
            let stride = stage_stride(stage);
            let mut layer = Vec::with_capacity(blocks);

            for i in 0..blocks {
                let prefix = format!("layer{}.{}", stage + 1, i);
                let block_stride = if i == 0 { stride } else { 1 };

                let downsample = if i == 0 && needs_projection(stage, in_planes, out_planes) {
                    Some((
                        take_conv(
                            &mut store,
                            &format!("{}.downsample.0", prefix),
                            [out_planes, in_planes, 1, 1],
                            block_stride,
                            0,
                        )?,
                        take_bn(&mut store, &format!("{}.downsample.1", prefix), out_planes)?,
                    ))
                } else {
                    None
                };

                layer.push(Bottleneck {
                    conv1: take_conv(
                        &mut store,
                        &format!("{}.conv1", prefix),
                        [width, in_planes, 1, 1],
                        1,
                        0,
                    )?,
                    bn1: take_bn(&mut store, &format!("{}.bn1", prefix), width)?,
                    conv2: take_conv(
                        &mut store,
                        &format!("{}.conv2", prefix),
                        [width, width, 3, 3],
                        block_stride,
                        1,
                    )?,
                    bn2: take_bn(&mut store, &format!("{}.bn2", prefix), width)?,
                    conv3: take_conv(
                        &mut store,
                        &format!("{}.conv3", prefix),
                        [out_planes, width, 1, 1],
                        1,
                        0,
                    )?,
                    bn3: take_bn(&mut store, &format!("{}.bn3", prefix), out_planes)?,
                    downsample,
                });
                in_planes = out_planes;
            }
            stages.push(layer);
        }

        let fc = Linear {
            weight: store.take("fc.weight", &[config.num_classes, in_planes])?,
            bias: store.take("fc.bias", &[config.num_classes])?.data,
        };

        if !store.is_empty() {
            warn!(
                unused = ?store.remaining(),
                "Checkpoint contains parameters the model does not use"
            );
        }
        debug!(blocks = ?config.blocks, classes = config.num_classes, "ResNet constructed");

        Ok(Self {
            config,
            conv1,
            bn1,
            stages,
            fc,
        })
    }

    /// Reject inputs the stem cannot consume
    pub fn check_input(&self, input: &Tensor) -> Result<()> {
        let (_, c, h, w) = input.dims4()?;
        if c != self.config.in_channels {
            return Err(ParityError::Shape(format!(
                "Model expects {} input channels (NCHW), got shape {:?}",
                self.config.in_channels, input.shape
            )));
        }
        if h == 0 || w == 0 {
            return Err(ParityError::Shape(format!(
                "Input has an empty spatial extent: {:?}",
                input.shape
            )));
        }
        Ok(())
    }

    /// Logits shape for a batch of `batch` images
    pub fn output_shape(&self, batch: usize) -> Vec<usize> {
        vec![batch, self.config.num_classes]
    }

    /// Eager forward pass, module by module
    pub fn forward(&self, input: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        self.check_input(input)?;

        let mut x = self.bn1.forward(&self.conv1.forward(input)?, mode)?;
        ops::relu_inplace(&mut x);
        let mut x = ops::max_pool2d(&x, 3, 2, 1)?;

        for block in self.stages.iter().flatten() {
            x = block.forward(&x, mode)?;
        }

        let pooled = ops::global_avg_pool(&x)?;
        self.fc.forward(&pooled)
    }
}

/// First stage keeps resolution (the stem max-pool already halved it)
fn stage_stride(stage: usize) -> usize {
    if stage == 0 {
        1
    } else {
        2
    }
}

fn needs_projection(stage: usize, in_planes: usize, out_planes: usize) -> bool {
    stage_stride(stage) != 1 || in_planes != out_planes
}

fn push_bn_shapes(shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str, channels: usize) {
    for field in ["weight", "bias", "running_mean", "running_var"] {
        shapes.push((format!("{}.{}", prefix, field), vec![channels]));
    }
}

fn take_conv(
    store: &mut WeightStore,
    prefix: &str,
    shape: [usize; 4],
    stride: usize,
    padding: usize,
) -> Result<Conv2d> {
    Ok(Conv2d {
        weight: store.take(&format!("{}.weight", prefix), &shape)?,
        bias: None,
        stride,
        padding,
    })
}

fn take_bn(store: &mut WeightStore, prefix: &str, channels: usize) -> Result<BatchNorm2d> {
    let mut field = |name: &str| -> Result<Vec<f32>> {
        Ok(store.take(&format!("{}.{}", prefix, name), &[channels])?.data)
    };
    Ok(BatchNorm2d {
        weight: field("weight")?,
        bias: field("bias")?,
        running_mean: field("running_mean")?,
        running_var: field("running_var")?,
        eps: BN_EPS,
    })
}
