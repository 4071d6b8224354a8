//! KServe v2 inference protocol with the binary tensor data extension
//!
//! A request or response body is a JSON header, optionally followed by raw
//! tensor bytes. When bytes follow, the length of the JSON part is carried in
//! the `Inference-Header-Content-Length` HTTP header and every binary tensor
//! declares its byte count in `parameters.binary_data_size`. Binary tensors
//! appear after the header in the order they are listed in it.

use crate::errors::{ParityError, Result};
use crate::tensor::{element_count, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HTTP header carrying the byte length of the JSON part of a body
pub const HEADER_CONTENT_LENGTH: &str = "Inference-Header-Content-Length";

/// Tensor element type as named on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "UINT8")]
    Uint8,
    #[serde(rename = "UINT16")]
    Uint16,
    #[serde(rename = "UINT32")]
    Uint32,
    #[serde(rename = "UINT64")]
    Uint64,
    #[serde(rename = "INT8")]
    Int8,
    #[serde(rename = "INT16")]
    Int16,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "INT64")]
    Int64,
    #[serde(rename = "FP16")]
    Fp16,
    #[serde(rename = "FP32")]
    Fp32,
    #[serde(rename = "FP64")]
    Fp64,
    #[serde(rename = "BYTES")]
    Bytes,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Bool => "BOOL",
            Datatype::Uint8 => "UINT8",
            Datatype::Uint16 => "UINT16",
            Datatype::Uint32 => "UINT32",
            Datatype::Uint64 => "UINT64",
            Datatype::Int8 => "INT8",
            Datatype::Int16 => "INT16",
            Datatype::Int32 => "INT32",
            Datatype::Int64 => "INT64",
            Datatype::Fp16 => "FP16",
            Datatype::Fp32 => "FP32",
            Datatype::Fp64 => "FP64",
            Datatype::Bytes => "BYTES",
        }
    }

    /// Bytes per element; `None` for variable-length `BYTES`
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Datatype::Bool | Datatype::Uint8 | Datatype::Int8 => Some(1),
            Datatype::Uint16 | Datatype::Int16 | Datatype::Fp16 => Some(2),
            Datatype::Uint32 | Datatype::Int32 | Datatype::Fp32 => Some(4),
            Datatype::Uint64 | Datatype::Int64 | Datatype::Fp64 => Some(8),
            Datatype::Bytes => None,
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = ParityError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| ParityError::Protocol(format!("Unknown datatype '{}'", s)))
    }
}

/// Per-tensor `parameters` object
///
/// Parameters other than the binary extension's are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data_size: Option<usize>,
}

/// Input tensor of an inference request
#[derive(Debug, Clone, PartialEq)]
pub struct InferInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub datatype: Datatype,
    data: Vec<f32>,
    binary: bool,
}

impl InferInput {
    /// FP32 input carrying a copy of `tensor`
    ///
    /// With `binary` set the values travel as raw little-endian bytes after
    /// the JSON header; otherwise they are inlined as a JSON array.
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor, binary: bool) -> Self {
        Self {
            name: name.into(),
            shape: tensor.shape.clone(),
            datatype: Datatype::Fp32,
            data: tensor.data.clone(),
            binary,
        }
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    fn header(&self) -> InputHeader {
        let (parameters, data) = if self.binary {
            (
                Some(TensorParameters {
                    binary_data_size: Some(self.byte_size()),
                    ..TensorParameters::default()
                }),
                None,
            )
        } else {
            (None, Some(self.data.clone()))
        };
        InputHeader {
            name: self.name.clone(),
            shape: self.shape.clone(),
            datatype: self.datatype,
            parameters,
            data,
        }
    }
}

/// Output a request asks the server to return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<TensorParameters>,
}

impl RequestedOutput {
    pub fn new(name: impl Into<String>, binary: bool) -> Self {
        Self {
            name: name.into(),
            parameters: Some(TensorParameters {
                binary_data: Some(binary),
                ..TensorParameters::default()
            }),
        }
    }
}

/// Input entry of the request JSON header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputHeader {
    pub name: String,
    pub shape: Vec<usize>,
    pub datatype: Datatype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<TensorParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f32>>,
}

/// Request JSON header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferRequestHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub inputs: Vec<InputHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<RequestedOutput>,
}

/// Output entry of the response JSON header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputHeader {
    pub name: String,
    pub datatype: Datatype,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<TensorParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Response JSON header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferResponseHeader {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub outputs: Vec<OutputHeader>,
}

/// Error body returned with a non-success status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request body ready to send
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub body: Vec<u8>,
    /// Length of the JSON header when binary data follows it
    pub header_len: Option<usize>,
}

/// Build a request body
pub fn encode_request(
    id: &str,
    inputs: &[InferInput],
    outputs: &[RequestedOutput],
) -> Result<EncodedRequest> {
    if inputs.is_empty() {
        return Err(ParityError::Protocol("Request has no inputs".into()));
    }

    let header = InferRequestHeader {
        id: Some(id.to_string()),
        inputs: inputs.iter().map(InferInput::header).collect(),
        outputs: outputs.to_vec(),
    };
    let mut body = serde_json::to_vec(&header)
        .map_err(|e| ParityError::Protocol(format!("Failed to encode request header: {}", e)))?;
    let json_len = body.len();

    for input in inputs.iter().filter(|i| i.binary) {
        body.reserve(input.byte_size());
        for value in &input.data {
            body.extend_from_slice(&value.to_le_bytes());
        }
    }

    let header_len = (body.len() > json_len).then_some(json_len);
    Ok(EncodedRequest { body, header_len })
}

/// Output payload, binary or inlined as JSON
#[derive(Debug, Clone, PartialEq)]
pub enum OutputData {
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

/// Decoded output tensor
#[derive(Debug, Clone, PartialEq)]
pub struct InferOutput {
    pub name: String,
    pub datatype: Datatype,
    pub shape: Vec<usize>,
    pub data: OutputData,
}

/// Decoded inference response
#[derive(Debug, Clone, PartialEq)]
pub struct InferResult {
    pub model_name: String,
    pub model_version: Option<String>,
    pub id: Option<String>,
    pub outputs: Vec<InferOutput>,
}

/// Split a response body into its JSON header and binary outputs
pub fn decode_response(body: &[u8], header_len: Option<usize>) -> Result<InferResult> {
    let (json, mut binary) = match header_len {
        Some(len) if len > body.len() => {
            return Err(ParityError::Protocol(format!(
                "Header length {} exceeds body length {}",
                len,
                body.len()
            )));
        }
        Some(len) => body.split_at(len),
        None => (body, &[][..]),
    };

    let header: InferResponseHeader = serde_json::from_slice(json)
        .map_err(|e| ParityError::Protocol(format!("Invalid response header: {}", e)))?;

    let mut outputs = Vec::with_capacity(header.outputs.len());
    for output in header.outputs {
        let binary_size = output.parameters.as_ref().and_then(|p| p.binary_data_size);
        let data = match (binary_size, output.data) {
            (Some(size), _) => {
                if size > binary.len() {
                    return Err(ParityError::Protocol(format!(
                        "Output '{}' declares {} bytes but only {} remain",
                        output.name,
                        size,
                        binary.len()
                    )));
                }
                let (chunk, rest) = binary.split_at(size);
                binary = rest;
                OutputData::Binary(chunk.to_vec())
            }
            (None, Some(value)) => OutputData::Json(value),
            (None, None) => {
                return Err(ParityError::Protocol(format!(
                    "Output '{}' carries no data",
                    output.name
                )));
            }
        };
        outputs.push(InferOutput {
            name: output.name,
            datatype: output.datatype,
            shape: output.shape,
            data,
        });
    }

    if !binary.is_empty() {
        return Err(ParityError::Protocol(format!(
            "{} trailing bytes after the last binary output",
            binary.len()
        )));
    }

    Ok(InferResult {
        model_name: header.model_name,
        model_version: header.model_version,
        id: header.id,
        outputs,
    })
}

impl InferResult {
    pub fn output(&self, name: &str) -> Option<&InferOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Decode the named FP32 output into a tensor
    pub fn as_tensor(&self, name: &str) -> Result<Tensor> {
        let output = self.output(name).ok_or_else(|| {
            ParityError::Protocol(format!("Response has no output named '{}'", name))
        })?;
        if output.datatype != Datatype::Fp32 {
            return Err(ParityError::Protocol(format!(
                "Output '{}' has datatype {}, expected FP32",
                name, output.datatype
            )));
        }

        let overflow = || {
            ParityError::Protocol(format!(
                "Output '{}' shape {:?} is too large",
                name, output.shape
            ))
        };
        let elements = element_count(&output.shape).ok_or_else(overflow)?;
        match &output.data {
            OutputData::Binary(bytes) => {
                let needed = elements.checked_mul(4).ok_or_else(overflow)?;
                if bytes.len() != needed {
                    return Err(ParityError::Protocol(format!(
                        "Output '{}' has {} bytes, shape {:?} needs {}",
                        name,
                        bytes.len(),
                        output.shape,
                        needed
                    )));
                }
                Tensor::from_le_bytes(output.shape.clone(), bytes)
            }
            OutputData::Json(value) => {
                let mut values = Vec::new();
                flatten_numbers(value, &mut values)?;
                if values.len() != elements {
                    return Err(ParityError::Protocol(format!(
                        "Output '{}' has {} values, shape {:?} needs {}",
                        name,
                        values.len(),
                        output.shape,
                        elements
                    )));
                }
                Tensor::new(output.shape.clone(), values)
            }
        }
    }
}

fn flatten_numbers(value: &serde_json::Value, out: &mut Vec<f32>) -> Result<()> {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_numbers(item, out)?;
            }
            Ok(())
        }
        serde_json::Value::Number(n) => {
            let v = n
                .as_f64()
                .ok_or_else(|| ParityError::Protocol(format!("Non-finite number {}", n)))?;
            out.push(v as f32);
            Ok(())
        }
        other => Err(ParityError::Protocol(format!(
            "Expected a number in output data, found {}",
            other
        ))),
    }
}
