use thiserror::Error;

/// Main error type for the Temper quantization pipeline
#[derive(Error, Debug, Clone)]
pub enum TemperError {
    /// Invalid quantization or calibration settings
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The model topology does not match what layer discovery expects
    #[error("Model structure error in {component}: {message}")]
    ModelStructureError {
        component: String,
        message: String,
    },

    /// Hessian decomposition or other numeric failure for one layer
    #[error("Numeric error in layer '{layer}': {message}")]
    NumericError {
        layer: String,
        message: String,
    },

    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Calibration dataset errors
    #[error("Dataset error: {0}")]
    DatasetError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl TemperError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        TemperError::ShapeError(message)
    }

    /// Create a model-structure error naming the offending component
    pub fn model_structure(component: &str, message: &str) -> Self {
        TemperError::ModelStructureError {
            component: component.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a numeric error for a named layer
    pub fn numeric(layer: &str, message: &str) -> Self {
        TemperError::NumericError {
            layer: layer.to_string(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TemperError::ConfigurationError(message.into())
    }
}

impl From<std::io::Error> for TemperError {
    fn from(err: std::io::Error) -> Self {
        TemperError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TemperError {
    fn from(err: serde_json::Error) -> Self {
        TemperError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for TemperError {
    fn from(err: bincode::Error) -> Self {
        TemperError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for TemperError {
    fn from(err: ndarray::ShapeError) -> Self {
        TemperError::ShapeError(err.to_string())
    }
}

/// Result type for Temper operations
pub type TemperResult<T> = Result<T, TemperError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub block: Option<usize>,
    pub layer: Option<String>,
    pub tensor_shapes: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            block: None,
            layer: None,
            tensor_shapes: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: usize) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_layer(mut self, layer: &str) -> Self {
        self.layer = Some(layer.to_string());
        self
    }

    pub fn with_shape(mut self, shape: &str) -> Self {
        self.tensor_shapes.push(shape.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("Operation: {}", self.operation);

        if let Some(block) = self.block {
            message.push_str(&format!("\nBlock: {}", block));
        }

        if let Some(ref layer) = self.layer {
            message.push_str(&format!("\nLayer: {}", layer));
        }

        if !self.tensor_shapes.is_empty() {
            message.push_str(&format!("\nTensor shapes: {}", self.tensor_shapes.join(", ")));
        }

        if !self.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                message.push_str(&format!("\n  - {}", suggestion));
            }
        }

        message
    }
}

/// Helper trait for adding context to errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> TemperResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for TemperResult<T> {
    fn with_context<F>(self, f: F) -> TemperResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f();
            match e {
                TemperError::ShapeError(msg) => {
                    TemperError::ShapeError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                TemperError::ModelStructureError { component, message } => {
                    TemperError::ModelStructureError {
                        component,
                        message: format!("{}\nContext: {}", message, context.to_error_message()),
                    }
                }
                TemperError::NumericError { layer, message } => TemperError::NumericError {
                    layer,
                    message: format!("{}\nContext: {}", message, context.to_error_message()),
                },
                TemperError::InvalidInput(msg) => {
                    TemperError::InvalidInput(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                _ => e,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalid,
    ModelStructure,
    NumericFailure,
    ShapeMismatch,
    DatasetUnavailable,
    InvalidOperation,
    SerializationFailed,
    IoFailure,
}

impl TemperError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TemperError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            TemperError::ModelStructureError { .. } => ErrorCode::ModelStructure,
            TemperError::NumericError { .. } => ErrorCode::NumericFailure,
            TemperError::ShapeError(_) => ErrorCode::ShapeMismatch,
            TemperError::DatasetError(_) => ErrorCode::DatasetUnavailable,
            TemperError::InvalidInput(_) => ErrorCode::InvalidOperation,
            TemperError::InvalidState(_) => ErrorCode::InvalidOperation,
            TemperError::SerializationError(_) => ErrorCode::SerializationFailed,
            TemperError::IoError(_) => ErrorCode::IoFailure,
        }
    }

    /// Check if this is a recoverable error.
    ///
    /// Configuration, structure and numeric failures abort the whole run and are
    /// never retried (no automatic re-damping of a failed Hessian).
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::IoFailure)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TemperError::ConfigurationError(msg) => {
                format!("Configuration Error: {}\n\nCheck the quantization settings (bit-width, group size, sample count) and the calibration dataset.", msg)
            }
            TemperError::ModelStructureError { component, message } => {
                format!("Model Structure Error in '{}': {}\n\nLayer discovery could not map this model onto an embedding followed by quantizable blocks.", component, message)
            }
            TemperError::NumericError { layer, message } => {
                format!("Numeric Error in '{}': {}\n\nThe Hessian was not positive definite after damping. Increase `percdamp` or provide more calibration samples.", layer, message)
            }
            TemperError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nThe dimensions of the tensors involved don't match for this operation.", msg)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error() {
        let error = TemperError::shape_error("[32, 256]", "[32, 128]", Some("Check the layer's input features"));
        assert!(error.to_string().contains("Expected [32, 256], got [32, 128]"));
        assert!(error.to_string().contains("Check the layer's input features"));
    }

    #[test]
    fn test_error_context() {
        let context = ErrorContext::new("add_batch")
            .with_block(3)
            .with_layer("block.att.query")
            .with_shape("[128, 32]")
            .with_suggestion("Inputs must be flattened to (rows, in_features)");

        let message = context.to_error_message();
        assert!(message.contains("Operation: add_batch"));
        assert!(message.contains("Block: 3"));
        assert!(message.contains("Layer: block.att.query"));
        assert!(message.contains("Tensor shapes: [128, 32]"));
        assert!(message.contains("flattened"));
    }

    #[test]
    fn test_with_context_tags_numeric_error() {
        let result: TemperResult<()> = Err(TemperError::numeric("block.ffn.dense", "not positive definite"));
        let err = result
            .with_context(|| ErrorContext::new("fasterquant").with_block(1))
            .unwrap_err();
        match err {
            TemperError::NumericError { layer, message } => {
                assert_eq!(layer, "block.ffn.dense");
                assert!(message.contains("Block: 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_codes() {
        let numeric = TemperError::numeric("l", "m");
        assert_eq!(numeric.code(), ErrorCode::NumericFailure);
        assert!(!numeric.is_recoverable());

        let structure = TemperError::model_structure("model", "no embedding");
        assert_eq!(structure.code(), ErrorCode::ModelStructure);
        assert!(!structure.is_recoverable());

        let config = TemperError::config("wbits must be in 2..=8");
        assert_eq!(config.code(), ErrorCode::ConfigInvalid);
        assert!(!config.is_recoverable());
    }

    #[test]
    fn test_user_message() {
        let error = TemperError::numeric("block.dense", "Cholesky failed at pivot 3");
        let message = error.user_message();
        assert!(message.contains("block.dense"));
        assert!(message.contains("percdamp"));
    }
}
