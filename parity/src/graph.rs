//! Compiled execution graph
//!
//! A [`Graph`] wraps a model and compiles it the first time it is executed.
//! Compilation flattens the module tree into a linear [`Plan`] of
//! instructions that runs against a single activation register plus a stack
//! of saved residuals:
//!
//! ```text
//! Conv(stem) Relu MaxPool
//! Fork Conv Relu Conv Relu Conv Conv[shortcut] Join Relu    <- bottleneck
//! ...
//! GlobalAvgPool Linear
//! ```
//!
//! In inference mode every batch-norm is folded into the convolution in
//! front of it, so the plan contains no normalization instructions at all.
//! Training mode keeps them and normalizes with batch statistics.

use crate::errors::{ParityError, Result};
use crate::model::{BatchNorm2d, Conv2d, Linear, ResNet};
use crate::ops;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info};

/// How batch-norm layers normalize
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Running statistics from the checkpoint
    #[default]
    Inference,
    /// Statistics of the current batch
    Training,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Inference => write!(f, "inference"),
            ExecutionMode::Training => write!(f, "training"),
        }
    }
}

/// Which activation an instruction reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// The running activation
    Main,
    /// The residual saved by the innermost `Fork`
    Shortcut,
}

#[derive(Debug, Clone)]
enum Instruction {
    Conv(Conv2d, Lane),
    BatchNorm(BatchNorm2d, Lane),
    Relu,
    MaxPool {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    /// Save the current activation as a residual
    Fork,
    /// Add the innermost residual back into the activation
    Join,
    GlobalAvgPool,
    Linear(Linear),
}

/// Flat program compiled from a model
#[derive(Debug, Clone)]
pub struct Plan {
    instructions: Vec<Instruction>,
    mode: ExecutionMode,
}

impl Plan {
    /// Flatten `model`, folding batch-norm into convolutions in inference mode
    pub fn compile(model: &ResNet, mode: ExecutionMode) -> Self {
        let mut plan = Self {
            instructions: Vec::new(),
            mode,
        };

        plan.conv_bn(&model.conv1, &model.bn1, Lane::Main);
        plan.instructions.push(Instruction::Relu);
        plan.instructions.push(Instruction::MaxPool {
            kernel: 3,
            stride: 2,
            padding: 1,
        });

        for block in model.stages.iter().flatten() {
            plan.instructions.push(Instruction::Fork);
            plan.conv_bn(&block.conv1, &block.bn1, Lane::Main);
            plan.instructions.push(Instruction::Relu);
            plan.conv_bn(&block.conv2, &block.bn2, Lane::Main);
            plan.instructions.push(Instruction::Relu);
            plan.conv_bn(&block.conv3, &block.bn3, Lane::Main);
            if let Some((conv, bn)) = &block.downsample {
                plan.conv_bn(conv, bn, Lane::Shortcut);
            }
            plan.instructions.push(Instruction::Join);
            plan.instructions.push(Instruction::Relu);
        }

        plan.instructions.push(Instruction::GlobalAvgPool);
        plan.instructions.push(Instruction::Linear(model.fc.clone()));
        plan
    }

    fn conv_bn(&mut self, conv: &Conv2d, bn: &BatchNorm2d, lane: Lane) {
        match self.mode {
            ExecutionMode::Inference => {
                self.instructions
                    .push(Instruction::Conv(fold_batch_norm(conv, bn), lane));
            }
            ExecutionMode::Training => {
                self.instructions.push(Instruction::Conv(conv.clone(), lane));
                self.instructions
                    .push(Instruction::BatchNorm(bn.clone(), lane));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Execute the plan on one input batch
    pub fn run(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        let mut residuals: Vec<Tensor> = Vec::new();

        for instruction in &self.instructions {
            match instruction {
                Instruction::Conv(conv, Lane::Main) => x = conv.forward(&x)?,
                Instruction::Conv(conv, Lane::Shortcut) => {
                    let saved = top(&mut residuals)?;
                    *saved = conv.forward(saved)?;
                }
                Instruction::BatchNorm(bn, Lane::Main) => x = bn.forward(&x, self.mode)?,
                Instruction::BatchNorm(bn, Lane::Shortcut) => {
                    let saved = top(&mut residuals)?;
                    *saved = bn.forward(saved, self.mode)?;
                }
                Instruction::Relu => ops::relu_inplace(&mut x),
                Instruction::MaxPool {
                    kernel,
                    stride,
                    padding,
                } => x = ops::max_pool2d(&x, *kernel, *stride, *padding)?,
                Instruction::Fork => residuals.push(x.clone()),
                Instruction::Join => {
                    let identity = residuals.pop().ok_or_else(unbalanced)?;
                    ops::add_inplace(&mut x, &identity)?;
                }
                Instruction::GlobalAvgPool => x = ops::global_avg_pool(&x)?,
                Instruction::Linear(fc) => x = fc.forward(&x)?,
            }
        }

        if !residuals.is_empty() {
            return Err(unbalanced());
        }
        Ok(x)
    }
}

fn top(residuals: &mut [Tensor]) -> Result<&mut Tensor> {
    residuals.last_mut().ok_or_else(unbalanced)
}

fn unbalanced() -> ParityError {
    ParityError::Shape("Residual fork/join instructions are unbalanced".into())
}

/// Fold `bn` into `conv`: `w' = w * s`, `b' = beta + (b - mean) * s`
/// with `s = gamma / sqrt(var + eps)` per output channel
pub fn fold_batch_norm(conv: &Conv2d, bn: &BatchNorm2d) -> Conv2d {
    let out_channels = conv.out_channels();
    let per_channel = conv.weight.len() / out_channels.max(1);

    let mut weight = conv.weight.clone();
    let mut bias = vec![0.0f32; out_channels];

    for oc in 0..out_channels {
        let scale = bn.weight[oc] / (bn.running_var[oc] + bn.eps).sqrt();
        for w in &mut weight.data[oc * per_channel..(oc + 1) * per_channel] {
            *w *= scale;
        }
        let conv_bias = conv.bias.as_ref().map_or(0.0, |b| b[oc]);
        bias[oc] = bn.bias[oc] + (conv_bias - bn.running_mean[oc]) * scale;
    }

    Conv2d {
        weight,
        bias: Some(bias),
        stride: conv.stride,
        padding: conv.padding,
    }
}

/// Lazily compiled model
///
/// The single capability is [`Graph::execute`]; the first call pays for
/// compilation and later calls reuse the plan.
#[derive(Debug)]
pub struct Graph {
    model: ResNet,
    mode: ExecutionMode,
    plan: OnceLock<Plan>,
}

impl Graph {
    pub fn new(model: ResNet, mode: ExecutionMode) -> Self {
        Self {
            model,
            mode,
            plan: OnceLock::new(),
        }
    }

    pub fn model(&self) -> &ResNet {
        &self.model
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.get().is_some()
    }

    /// Instructions in the compiled plan, if compiled yet
    pub fn instruction_count(&self) -> Option<usize> {
        self.plan.get().map(Plan::len)
    }

    /// Run `input` through the compiled plan, compiling on first use
    pub fn execute(&self, input: &Tensor) -> Result<Tensor> {
        self.model.check_input(input)?;

        let plan = self.plan.get_or_init(|| {
            let start = Instant::now();
            let plan = Plan::compile(&self.model, self.mode);
            info!(
                mode = %self.mode,
                instructions = plan.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Graph compiled"
            );
            plan
        });

        let start = Instant::now();
        let output = plan.run(input)?;
        debug!(
            shape = ?output.shape,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Graph executed"
        );
        Ok(output)
    }
}
