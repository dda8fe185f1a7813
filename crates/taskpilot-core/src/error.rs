use thiserror::Error;

/// Top-level error type shared by every TaskPilot crate.
///
/// Subsystem crates define their own error types and wrap this one so that
/// the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskPilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<toml::de::Error> for TaskPilotError {
    fn from(err: toml::de::Error) -> Self {
        TaskPilotError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TaskPilotError {
    fn from(err: toml::ser::Error) -> Self {
        TaskPilotError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TaskPilotError {
    fn from(err: serde_json::Error) -> Self {
        TaskPilotError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for TaskPilot operations.
pub type Result<T> = std::result::Result<T, TaskPilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaskPilotError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = TaskPilotError::NotFound("task 42".to_string());
        assert_eq!(err.to_string(), "Not found: task 42");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TaskPilotError = io_err.into();
        assert!(matches!(err, TaskPilotError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: TaskPilotError = parse_err.into();
        assert!(matches!(err, TaskPilotError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: TaskPilotError = parse_err.into();
        assert!(matches!(err, TaskPilotError::Config(_)));
    }

    #[test]
    fn test_result_alias() {
        fn ok() -> Result<u32> {
            Ok(7)
        }
        fn fails() -> Result<u32> {
            Err(TaskPilotError::Storage("disk full".into()))
        }
        assert_eq!(ok().unwrap(), 7);
        assert!(fails().is_err());
    }
}
