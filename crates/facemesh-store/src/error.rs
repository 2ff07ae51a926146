use facemesh_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed input: wrong vector length, non-finite values, missing consent.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity already enrolled: {0} (request an update to modify it)")]
    Duplicate(String),
    /// Persisted artifacts failed structural validation on load.
    #[error("corrupt store: {0}")]
    CorruptStore(String),
    #[error("io error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptStore(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}
