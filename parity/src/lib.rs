//! Output parity between a local ResNet-50 and a served copy
//!
//! The check draws one seeded random image, runs it through the model
//! in-process and through a KServe v2 inference server, and requires the two
//! logit arrays to agree element-wise within `atol + rtol * |remote|`.

pub mod check;
pub mod config;
pub mod equivalence;
pub mod errors;
pub mod graph;
pub mod input;
pub mod local;
pub mod model;
pub mod observability;
pub mod ops;
pub mod remote;
pub mod tensor;

pub use check::{run_from_config, CheckSettings, ParityCheck, ParityOutcome, RunSummary};
pub use config::ParityConfig;
pub use equivalence::{allclose, compare, is_close, EquivalenceReport, Tolerance};
pub use errors::{ParityError, Result};
pub use graph::{ExecutionMode, Graph};
pub use input::{generate_input, InputSpec};
pub use local::LocalExecutor;
pub use observability::{bootstrap_subscriber, init_file_logging, init_simple_logging};
pub use remote::InferenceClient;
pub use tensor::Tensor;
