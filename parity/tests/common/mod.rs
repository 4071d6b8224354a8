//! In-process KServe v2 server for integration tests
//!
//! Serves a fixed set of models on an ephemeral port. A model either echoes
//! its input, runs a ResNet, or sleeps before echoing.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parity::model::synthetic::{synthetic_weights, tiny_config};
use parity::model::{ResNet, WeightStore};
use parity::remote::protocol::{
    InferRequestHeader, InferResponseHeader, OutputHeader, TensorParameters,
    HEADER_CONTENT_LENGTH,
};
use parity::remote::Datatype;
use parity::{ExecutionMode, Graph, Tensor};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub enum MockModel {
    Echo,
    ResNet(Graph),
    Slow(Duration),
}

#[derive(Default)]
pub struct MockServer {
    models: HashMap<String, MockModel>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: &str, model: MockModel) -> Self {
        self.models.insert(name.to_string(), model);
        self
    }

    /// Bind to 127.0.0.1:0 and serve in the background
    pub async fn spawn(self) -> SocketAddr {
        let state = Arc::new(self);
        let app = Router::new()
            .route("/v2/health/live", get(|| async { StatusCode::OK }))
            .route("/v2/health/ready", get(|| async { StatusCode::OK }))
            .route("/v2/models/:model/ready", get(model_ready))
            .route("/v2/models/:model/versions/:version/ready", get(model_ready))
            .route("/v2/models/:model/infer", post(infer))
            .route("/v2/models/:model/versions/:version/infer", post(infer))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

/// Tiny ResNet weights shared by both sides of a pipeline test
pub fn tiny_weights(seed: u64) -> WeightStore {
    synthetic_weights(&tiny_config(), seed)
}

pub fn tiny_model(weights: WeightStore) -> ResNet {
    ResNet::from_weights(tiny_config(), weights).unwrap()
}

pub fn served_resnet(weights: WeightStore) -> MockModel {
    MockModel::ResNet(Graph::new(tiny_model(weights), ExecutionMode::Inference))
}

/// Address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn model_ready(
    State(state): State<Arc<MockServer>>,
    Path(params): Path<HashMap<String, String>>,
) -> StatusCode {
    match params.get("model") {
        Some(model) if state.models.contains_key(model) => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    }
}

async fn infer(
    State(state): State<Arc<MockServer>>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let name = params.get("model").cloned().unwrap_or_default();
    let Some(model) = state.models.get(&name) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Request for unknown model: '{}' is not found", name),
        );
    };

    let header_len = headers
        .get(HEADER_CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());
    let (json, binary) = match header_len {
        Some(len) => body.split_at(len),
        None => (&body[..], &[][..]),
    };

    let request: InferRequestHeader = match serde_json::from_slice(json) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let input = &request.inputs[0];
    let tensor = match input.parameters.as_ref().and_then(|p| p.binary_data_size) {
        Some(size) => Tensor::from_le_bytes(input.shape.clone(), &binary[..size]).unwrap(),
        None => Tensor::new(input.shape.clone(), input.data.clone().unwrap()).unwrap(),
    };

    let output = match model {
        MockModel::Echo => tensor,
        MockModel::ResNet(graph) => match graph.execute(&tensor) {
            Ok(output) => output,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        },
        MockModel::Slow(delay) => {
            tokio::time::sleep(*delay).await;
            tensor
        }
    };

    let requested = request.outputs.first();
    let output_name = requested
        .map(|o| o.name.clone())
        .unwrap_or_else(|| "OUTPUT_0".to_string());
    let binary_output = requested
        .and_then(|o| o.parameters.as_ref())
        .and_then(|p| p.binary_data)
        .unwrap_or(false);

    let bytes = output.to_le_bytes();
    let header = InferResponseHeader {
        model_name: name,
        model_version: Some(params.get("version").cloned().unwrap_or_else(|| "1".to_string())),
        id: request.id.clone(),
        outputs: vec![OutputHeader {
            name: output_name,
            datatype: Datatype::Fp32,
            shape: output.shape.clone(),
            parameters: binary_output.then(|| TensorParameters {
                binary_data_size: Some(bytes.len()),
                ..TensorParameters::default()
            }),
            data: (!binary_output).then(|| serde_json::json!(output.data)),
        }],
    };

    let mut response_body = serde_json::to_vec(&header).unwrap();
    if !binary_output {
        return (StatusCode::OK, response_body).into_response();
    }
    let json_len = response_body.len();
    response_body.extend_from_slice(&bytes);
    (
        StatusCode::OK,
        [(HEADER_CONTENT_LENGTH, json_len.to_string())],
        response_body,
    )
        .into_response()
}
