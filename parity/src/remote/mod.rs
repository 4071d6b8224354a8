//! Remote inference over the KServe v2 HTTP protocol
//!
//! - [`protocol`]: request/response bodies and the binary data extension
//! - [`client`]: HTTP client with readiness checks and `infer`

pub mod client;
pub mod protocol;

pub use client::InferenceClient;
pub use protocol::{Datatype, InferInput, InferResult, RequestedOutput};
