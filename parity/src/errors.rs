use thiserror::Error;

/// Errors that can occur while running a parity check.
#[derive(Error, Debug)]
pub enum ParityError {
    /// IO error occurred (weight cache, config and report files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error (TOML, JSON)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pretrained weights could not be fetched, verified or mapped onto the model
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Inference server could not be reached (refused, DNS, timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Inference server answered the request with an error
    #[error("Inference on model '{model}' failed (HTTP {status}): {message}")]
    Invocation {
        model: String,
        status: u16,
        message: String,
    },

    /// Request could not be encoded or response could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tensor shapes do not line up
    #[error("Shape error: {0}")]
    Shape(String),

    /// Local and remote outputs differ beyond tolerance
    #[error("Outputs diverge: {0}")]
    Divergence(String),
}

/// Result type alias for parity operations.
pub type Result<T> = std::result::Result<T, ParityError>;

impl From<toml::de::Error> for ParityError {
    fn from(e: toml::de::Error) -> Self {
        ParityError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ParityError {
    fn from(e: serde_json::Error) -> Self {
        ParityError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParityError::Config("rtol must be finite".to_string());
        assert_eq!(err.to_string(), "Configuration error: rtol must be finite");
    }

    #[test]
    fn test_invocation_display() {
        let err = ParityError::Invocation {
            model: "resnet50".to_string(),
            status: 400,
            message: "unexpected shape for input 'INPUT_0'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("resnet50"));
        assert!(msg.contains("HTTP 400"));
        assert!(msg.contains("INPUT_0"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ParityError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ParityError = json_err.into();
        assert!(matches!(err, ParityError::Serialization(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
