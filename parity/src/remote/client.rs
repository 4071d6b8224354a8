use super::protocol::{
    decode_response, encode_request, ErrorResponse, InferInput, InferResult, RequestedOutput,
    HEADER_CONTENT_LENGTH,
};
use crate::errors::{ParityError, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// HTTP client for a KServe v2 inference server
///
/// Construction does not contact the server; the first request does.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl InferenceClient {
    /// Create a client for `url` (`host:port` or a full `http(s)://` URL)
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let trimmed = url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ParityError::Config("Server URL is empty".into()));
        }
        let base_url = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| {
                    ParityError::Connection(format!("Failed to build HTTP client: {}", e))
                })?,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `GET /v2/health/live`
    pub async fn is_server_live(&self) -> Result<bool> {
        self.health_check("/v2/health/live").await
    }

    /// `GET /v2/health/ready`
    pub async fn is_server_ready(&self) -> Result<bool> {
        self.health_check("/v2/health/ready").await
    }

    /// `GET /v2/models/{model}[/versions/{version}]/ready`
    pub async fn is_model_ready(&self, model: &str, version: Option<&str>) -> Result<bool> {
        self.health_check(&format!("{}/ready", model_path(model, version))).await
    }

    async fn health_check(&self, path: &str) -> Result<bool> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        let ready = response.status().is_success();
        debug!(url = %url, status = %response.status(), ready, "Health check answered");
        Ok(ready)
    }

    /// Run one inference request and decode the response
    pub async fn infer(
        &self,
        model: &str,
        version: Option<&str>,
        inputs: &[InferInput],
        outputs: &[RequestedOutput],
    ) -> Result<InferResult> {
        let id = Uuid::new_v4().to_string();
        let encoded = encode_request(&id, inputs, outputs)?;
        let url = format!("{}{}/infer", self.base_url, model_path(model, version));

        info!(
            url = %url,
            request_id = %id,
            body_bytes = encoded.body.len(),
            "Sending inference request"
        );
        let start = Instant::now();

        let mut request = self.client.post(&url);
        request = match encoded.header_len {
            Some(len) => request
                .header(HEADER_CONTENT_LENGTH, len)
                .header(CONTENT_TYPE, "application/octet-stream"),
            None => request.header(CONTENT_TYPE, "application/json"),
        };

        let response = request
            .body(encoded.body)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            warn!(model = %model, status = status.as_u16(), error = %message, "Inference rejected");
            return Err(ParityError::Invocation {
                model: model.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let header_len = response
            .headers()
            .get(HEADER_CONTENT_LENGTH)
            .map(|value| {
                value
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .ok_or_else(|| {
                        ParityError::Protocol(format!(
                            "Invalid {} header: {:?}",
                            HEADER_CONTENT_LENGTH, value
                        ))
                    })
            })
            .transpose()?;

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        let result = decode_response(&body, header_len)?;

        if let Some(echoed) = &result.id {
            if echoed != &id {
                return Err(ParityError::Protocol(format!(
                    "Response id '{}' does not match request id '{}'",
                    echoed, id
                )));
            }
        }

        info!(
            model = %model,
            request_id = %id,
            outputs = result.outputs.len(),
            body_bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Inference response received"
        );
        Ok(result)
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> ParityError {
        if e.is_timeout() {
            ParityError::Connection(format!(
                "Request to {} timed out after {:?}",
                url, self.timeout
            ))
        } else {
            ParityError::Connection(format!("Request to {} failed: {}", url, e))
        }
    }
}

fn model_path(model: &str, version: Option<&str>) -> String {
    match version {
        Some(v) if !v.is_empty() => format!("/v2/models/{}/versions/{}", model, v),
        _ => format!("/v2/models/{}", model),
    }
}

/// Server message from an error body, falling back to the raw text
async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => body.error,
        Err(_) if !text.trim().is_empty() => text.trim().to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    }
}
