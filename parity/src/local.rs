//! Local execution of the reference model

use crate::errors::{ParityError, Result};
use crate::graph::{ExecutionMode, Graph};
use crate::model::{ResNet, ResNetConfig, WeightStore, WeightsSource};
use crate::tensor::Tensor;
use std::time::Instant;
use tracing::{info, warn};

/// Runs the model in-process through a lazily compiled graph
#[derive(Debug)]
pub struct LocalExecutor {
    graph: Graph,
}

impl LocalExecutor {
    pub fn new(model: ResNet, mode: ExecutionMode) -> Self {
        if mode == ExecutionMode::Training {
            warn!(
                "Local model runs in training mode; batch-norm uses batch statistics \
                 and outputs are expected to diverge from a served model"
            );
        }
        Self {
            graph: Graph::new(model, mode),
        }
    }

    /// Fetch (or reuse cached) pretrained weights and build the model
    pub async fn load(
        source: &WeightsSource,
        config: ResNetConfig,
        mode: ExecutionMode,
        client: &reqwest::Client,
    ) -> Result<Self> {
        let start = Instant::now();
        let path = source.resolve(client).await.map_err(into_model_load)?;
        let store = WeightStore::load(&path)?;
        let tensors = store.len();
        let model = ResNet::from_weights(config, store)?;

        info!(
            name = %source.name,
            path = %path.display(),
            tensors,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pretrained model loaded"
        );
        Ok(Self::new(model, mode))
    }

    pub fn mode(&self) -> ExecutionMode {
        self.graph.mode()
    }

    pub fn model(&self) -> &ResNet {
        self.graph.model()
    }

    /// Run one NCHW batch and return the logits
    pub fn execute(&self, input: &Tensor) -> Result<Tensor> {
        self.graph.execute(input)
    }
}

fn into_model_load(e: ParityError) -> ParityError {
    match e {
        ParityError::ModelLoad(_) => e,
        other => ParityError::ModelLoad(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{generate_input, InputSpec};
    use crate::model::synthetic::{synthetic_weights, tiny_config};
    use tempfile::TempDir;

    fn tiny_executor() -> LocalExecutor {
        let config = tiny_config();
        let model = ResNet::from_weights(config.clone(), synthetic_weights(&config, 7)).unwrap();
        LocalExecutor::new(model, ExecutionMode::Inference)
    }

    #[test]
    fn test_execute_shape() {
        let executor = tiny_executor();
        let input = generate_input(&InputSpec::new(vec![2, 3, 32, 32]), 1);
        let output = executor.execute(&input).unwrap();
        assert_eq!(output.shape, vec![2, 10]);
    }

    #[test]
    fn test_execute_rejects_grayscale() {
        let executor = tiny_executor();
        let err = executor.execute(&Tensor::zeros(vec![1, 1, 32, 32])).unwrap_err();
        assert!(matches!(err, ParityError::Shape(_)));
    }

    #[tokio::test]
    async fn test_load_from_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.safetensors");
        let config = tiny_config();
        std::fs::write(&path, synthetic_weights(&config, 7).to_safetensors().unwrap()).unwrap();

        let source = WeightsSource {
            name: "tiny".to_string(),
            path: Some(path),
            ..WeightsSource::default()
        };
        let client = reqwest::Client::new();
        let loaded = LocalExecutor::load(&source, config, ExecutionMode::Inference, &client)
            .await
            .unwrap();

        let input = generate_input(&InputSpec::new(vec![1, 3, 32, 32]), 3);
        assert_eq!(
            loaded.execute(&input).unwrap(),
            tiny_executor().execute(&input).unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_model_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, b"not a checkpoint").unwrap();

        let source = WeightsSource {
            path: Some(path),
            ..WeightsSource::default()
        };
        let err = LocalExecutor::load(
            &source,
            tiny_config(),
            ExecutionMode::Inference,
            &reqwest::Client::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParityError::ModelLoad(_)));
    }
}
