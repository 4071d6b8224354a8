//! Pretrained weight loading
//!
//! Weights are stored as safetensors. A [`WeightsSource`] names a weight set
//! and knows where to find it: an explicit file, the local cache, or a
//! download URL. A [`WeightStore`] is the parsed name -> tensor map the
//! model is built from.

use crate::errors::{ParityError, Result};
use crate::tensor::Tensor;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Download progress is logged every time this many bytes arrive
const PROGRESS_STEP_BYTES: usize = 16 * 1024 * 1024;

/// Parsed model parameters keyed by parameter name
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: HashMap<String, Tensor>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a safetensors buffer
    ///
    /// Floating-point tensors (F32, F16, BF16) are widened to `f32`. Integer
    /// tensors such as `num_batches_tracked` carry no inference state and
    /// are skipped.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let parsed = SafeTensors::deserialize(bytes).map_err(|e| {
            ParityError::ModelLoad(format!("SafeTensors parse error: {}", e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in parsed.tensors() {
            let raw = view.data();
            let data: Vec<f32> = match view.dtype() {
                Dtype::F32 => raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                Dtype::F16 => raw
                    .chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                Dtype::BF16 => raw
                    .chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
                other => {
                    debug!(tensor = %name, dtype = ?other, "Skipping non-float tensor");
                    continue;
                }
            };
            let tensor = Tensor::new(view.shape().to_vec(), data)
                .map_err(|e| ParityError::ModelLoad(format!("Tensor '{}': {}", name, e)))?;
            tensors.insert(name, tensor);
        }

        Ok(Self { tensors })
    }

    /// Read and parse a safetensors file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            ParityError::ModelLoad(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let store = Self::from_safetensors(&bytes)?;
        info!(
            path = %path.display(),
            tensors = store.len(),
            bytes = bytes.len(),
            "Loaded weights"
        );
        Ok(store)
    }

    /// Serialize as an F32 safetensors buffer
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, t)| (name.clone(), t.shape.clone(), t.to_le_bytes()))
            .collect();

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                safetensors::tensor::TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| ParityError::Serialization(format!("Tensor '{}': {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::tensor::serialize(views, &None)
            .map_err(|e| ParityError::Serialization(format!("SafeTensors write error: {}", e)))
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Remove a parameter, checking it has the shape the architecture expects
    pub fn take(&mut self, name: &str, expected_shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ParityError::ModelLoad(format!("Missing parameter '{}'", name)))?;
        if tensor.shape != expected_shape {
            return Err(ParityError::ModelLoad(format!(
                "Parameter '{}' has shape {:?}, expected {:?}",
                name, tensor.shape, expected_shape
            )));
        }
        Ok(tensor)
    }

    /// Names that no `take` has consumed yet
    pub fn remaining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Where a named weight set comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsSource {
    /// Weight set name, also the cache file stem
    pub name: String,
    /// Download URL used on cache miss
    pub url: String,
    /// Explicit file; skips cache and download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Cache directory (default: `<user cache dir>/parity`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Expected SHA-256 of the file, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Default for WeightsSource {
    fn default() -> Self {
        Self {
            name: "resnet50".to_string(),
            url: "https://huggingface.co/timm/resnet50.tv_in1k/resolve/main/model.safetensors"
                .to_string(),
            path: None,
            cache_dir: None,
            sha256: None,
        }
    }
}

impl WeightsSource {
    /// Cache directory in effect
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let base = dirs::cache_dir()
            .ok_or_else(|| ParityError::Config("Cannot determine cache directory".into()))?;
        Ok(base.join("parity"))
    }

    /// File the weight set is cached under
    pub fn cache_path(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join(format!("{}.safetensors", self.name)))
    }

    /// Find the weight file, downloading it on cache miss
    pub async fn resolve(&self, client: &reqwest::Client) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Err(ParityError::ModelLoad(format!(
                    "Weights file {} does not exist",
                    path.display()
                )));
            }
            self.verify_file(path)?;
            return Ok(path.clone());
        }

        let cached = self.cache_path()?;
        if cached.exists() {
            match self.verify_file(&cached) {
                Ok(()) => {
                    info!(name = %self.name, path = %cached.display(), "Using cached weights");
                    return Ok(cached);
                }
                Err(e) => {
                    warn!(
                        path = %cached.display(),
                        error = %e,
                        "Cached weights rejected, downloading again"
                    );
                }
            }
        }

        let bytes = self.download(client).await?;
        self.verify_bytes(&bytes)?;
        write_atomic(&cached, &bytes)?;
        info!(name = %self.name, path = %cached.display(), "Weights cached");
        Ok(cached)
    }

    async fn download(&self, client: &reqwest::Client) -> Result<Vec<u8>> {
        info!(name = %self.name, url = %self.url, "Downloading pretrained weights");
        let start = Instant::now();

        let mut response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ParityError::ModelLoad(format!("Weights download failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ParityError::ModelLoad(format!(
                "HTTP {} fetching weights from {}",
                status, self.url
            )));
        }

        let total = response.content_length();
        let mut bytes = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut next_report = PROGRESS_STEP_BYTES;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ParityError::ModelLoad(format!("Weights download interrupted: {}", e)))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() >= next_report {
                info!(received = bytes.len(), total = ?total, "Download progress");
                next_report += PROGRESS_STEP_BYTES;
            }
        }

        info!(
            bytes = bytes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Download complete"
        );
        Ok(bytes)
    }

    fn verify_file(&self, path: &Path) -> Result<()> {
        if self.sha256.is_none() {
            return Ok(());
        }
        let bytes = std::fs::read(path)?;
        self.verify_bytes(&bytes)
    }

    fn verify_bytes(&self, bytes: &[u8]) -> Result<()> {
        let Some(expected) = &self.sha256 else {
            return Ok(());
        };
        let actual = hex::encode(Sha256::digest(bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ParityError::ModelLoad(format!(
                "Checksum mismatch for '{}': expected {}, got {}",
                self.name, expected, actual
            )));
        }
        debug!(name = %self.name, sha256 = %actual, "Checksum verified");
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("safetensors.tmp");
    std::fs::write(&temp_path, bytes)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_store() -> WeightStore {
        let mut store = WeightStore::new();
        let weight = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        store.insert("fc.weight", weight);
        store.insert("fc.bias", Tensor::new(vec![2], vec![0.5, -0.5]).unwrap());
        store
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let store = sample_store();
        let bytes = store.to_safetensors().unwrap();
        let loaded = WeightStore::from_safetensors(&bytes).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("fc.weight"), store.get("fc.weight"));
        assert_eq!(loaded.get("fc.bias"), store.get("fc.bias"));
    }

    #[test]
    fn test_f16_tensors_are_widened() {
        let halves: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let view = safetensors::tensor::TensorView::new(Dtype::F16, vec![2], &halves).unwrap();
        let bytes = safetensors::tensor::serialize(vec![("w".to_string(), view)], &None).unwrap();

        let store = WeightStore::from_safetensors(&bytes).unwrap();
        assert_eq!(store.get("w").unwrap().data(), &[1.5, -2.0]);
    }

    #[test]
    fn test_integer_tensors_are_skipped() {
        let counter = 7i64.to_le_bytes();
        let view = safetensors::tensor::TensorView::new(Dtype::I64, vec![], &counter).unwrap();
        let bytes = safetensors::tensor::serialize(
            vec![("bn1.num_batches_tracked".to_string(), view)],
            &None,
        )
        .unwrap();

        let store = WeightStore::from_safetensors(&bytes).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_buffer_is_model_load_error() {
        let err = WeightStore::from_safetensors(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ParityError::ModelLoad(_)));
    }

    #[test]
    fn test_take_checks_shape() {
        let mut store = sample_store();
        let err = store.take("fc.weight", &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("fc.weight"));

        let mut store = sample_store();
        assert!(store.take("fc.weight", &[2, 3]).is_ok());
        assert_eq!(store.remaining(), vec!["fc.bias"]);
        assert!(matches!(
            store.take("fc.weight", &[2, 3]),
            Err(ParityError::ModelLoad(_))
        ));
    }

    /// Serve `bytes` at `/model.safetensors`; other paths are 404
    async fn serve_weights(bytes: Vec<u8>) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/model.safetensors",
            get(move || {
                let counter = counter.clone();
                let bytes = bytes.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    bytes
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn remote_source(addr: SocketAddr, path: &str, cache_dir: &Path) -> WeightsSource {
        WeightsSource {
            name: "tiny".to_string(),
            url: format!("http://{}{}", addr, path),
            cache_dir: Some(cache_dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_downloads_and_caches() {
        let temp_dir = TempDir::new().unwrap();
        let bytes = sample_store().to_safetensors().unwrap();
        let (addr, hits) = serve_weights(bytes.clone()).await;
        let source = WeightsSource {
            sha256: Some(hex::encode(Sha256::digest(&bytes))),
            ..remote_source(addr, "/model.safetensors", temp_dir.path())
        };
        let client = reqwest::Client::new();

        let resolved = source.resolve(&client).await.unwrap();
        assert_eq!(resolved, temp_dir.path().join("tiny.safetensors"));
        assert_eq!(std::fs::read(&resolved).unwrap(), bytes);
        assert!(!resolved.with_extension("safetensors.tmp").exists());
        assert_eq!(WeightStore::load(&resolved).unwrap().len(), 2);

        // Second resolve is served from the cache
        assert_eq!(source.resolve(&client).await.unwrap(), resolved);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_replaces_corrupt_cache() {
        let temp_dir = TempDir::new().unwrap();
        let bytes = sample_store().to_safetensors().unwrap();
        let (addr, hits) = serve_weights(bytes.clone()).await;
        let source = WeightsSource {
            sha256: Some(hex::encode(Sha256::digest(&bytes))),
            ..remote_source(addr, "/model.safetensors", temp_dir.path())
        };
        std::fs::write(source.cache_path().unwrap(), b"truncated").unwrap();

        let resolved = source.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), bytes);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_is_not_cached() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, hits) = serve_weights(sample_store().to_safetensors().unwrap()).await;
        let source = WeightsSource {
            sha256: Some("00".repeat(32)),
            ..remote_source(addr, "/model.safetensors", temp_dir.path())
        };

        let err = source.resolve(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, ParityError::ModelLoad(_)));
        assert!(err.to_string().contains("Checksum mismatch"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!source.cache_path().unwrap().exists());
    }

    #[tokio::test]
    async fn test_download_http_error_is_model_load() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, hits) = serve_weights(sample_store().to_safetensors().unwrap()).await;
        let source = remote_source(addr, "/missing.safetensors", temp_dir.path());

        let err = source.resolve(&reqwest::Client::new()).await.unwrap_err();
        match err {
            ParityError::ModelLoad(message) => assert!(message.contains("404")),
            other => panic!("expected model load error, got {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!source.cache_path().unwrap().exists());
    }

    #[tokio::test]
    async fn test_resolve_prefers_explicit_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("weights.safetensors");
        std::fs::write(&path, sample_store().to_safetensors().unwrap()).unwrap();

        let source = WeightsSource {
            path: Some(path.clone()),
            url: "http://127.0.0.1:9/unreachable".to_string(),
            ..Default::default()
        };
        let resolved = source.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(resolved, path);
    }

    #[tokio::test]
    async fn test_resolve_uses_cache_without_network() {
        let temp_dir = TempDir::new().unwrap();
        let bytes = sample_store().to_safetensors().unwrap();
        let source = WeightsSource {
            cache_dir: Some(temp_dir.path().to_path_buf()),
            url: "http://127.0.0.1:9/unreachable".to_string(),
            sha256: Some(hex::encode(Sha256::digest(&bytes))),
            ..Default::default()
        };
        std::fs::write(source.cache_path().unwrap(), &bytes).unwrap();

        let resolved = source.resolve(&reqwest::Client::new()).await.unwrap();
        assert!(resolved.ends_with("resnet50.safetensors"));
    }

    #[tokio::test]
    async fn test_resolve_rejects_checksum_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("weights.safetensors");
        std::fs::write(&path, sample_store().to_safetensors().unwrap()).unwrap();

        let source = WeightsSource {
            path: Some(path),
            sha256: Some("00".repeat(32)),
            ..Default::default()
        };
        let err = source.resolve(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, ParityError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_resolve_missing_file() {
        let source = WeightsSource {
            path: Some(PathBuf::from("/nonexistent/resnet50.safetensors")),
            ..Default::default()
        };
        let err = source.resolve(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, ParityError::ModelLoad(_)));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("w.safetensors");
        write_atomic(&path, b"abc").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert!(!path.with_extension("safetensors.tmp").exists());
    }
}
