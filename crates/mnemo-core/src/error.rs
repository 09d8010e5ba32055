use thiserror::Error;

/// Top-level error type for the Mnemo memory engine.
///
/// Structural variants (`NotFound`, `Dimension`) signal caller mistakes and
/// are always propagated. Disk-tier I/O problems are normally absorbed by the
/// cache and only surface here from explicit file operations such as
/// snapshot export or configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MnemoError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Incompatible snapshot format: found version {found}, supported {supported}")]
    IncompatibleFormat { found: u32, supported: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("Embedding error: {0}")]
    Embedding(String),
}

impl MnemoError {
    /// Shorthand for a missing node.
    pub fn node_not_found(id: impl std::fmt::Display) -> Self {
        MnemoError::NotFound {
            kind: "Node",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing edge.
    pub fn edge_not_found(id: impl std::fmt::Display) -> Self {
        MnemoError::NotFound {
            kind: "Edge",
            id: id.to_string(),
        }
    }

    /// Map a poisoned lock into a [`MnemoError::Lock`].
    pub fn lock<E: std::fmt::Display>(err: E) -> Self {
        MnemoError::Lock(err.to_string())
    }

    /// True for errors that indicate a programming mistake by the caller.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            MnemoError::NotFound { .. } | MnemoError::Dimension { .. }
        )
    }
}

impl From<toml::de::Error> for MnemoError {
    fn from(err: toml::de::Error) -> Self {
        MnemoError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MnemoError {
    fn from(err: toml::ser::Error) -> Self {
        MnemoError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MnemoError {
    fn from(err: serde_json::Error) -> Self {
        MnemoError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Mnemo operations.
pub type Result<T> = std::result::Result<T, MnemoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MnemoError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_not_found_display() {
        let err = MnemoError::node_not_found("abc");
        assert_eq!(err.to_string(), "Node not found: abc");
        let err = MnemoError::edge_not_found("xyz");
        assert_eq!(err.to_string(), "Edge not found: xyz");
    }

    #[test]
    fn test_dimension_display() {
        let err = MnemoError::Dimension {
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 4, got 3");
    }

    #[test]
    fn test_incompatible_format_display() {
        let err = MnemoError::IncompatibleFormat {
            found: 9,
            supported: 1,
        };
        assert!(err.to_string().contains("found version 9"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MnemoError = io_err.into();
        assert!(matches!(err, MnemoError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let mnemo_err: MnemoError = err.unwrap_err().into();
        assert!(matches!(mnemo_err, MnemoError::Serialization(_)));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let mnemo_err: MnemoError = err.unwrap_err().into();
        assert!(matches!(mnemo_err, MnemoError::Config(_)));
    }

    #[test]
    fn test_is_structural() {
        assert!(MnemoError::node_not_found("a").is_structural());
        assert!(MnemoError::Dimension {
            expected: 1,
            actual: 2
        }
        .is_structural());
        assert!(!MnemoError::Lock("poisoned".into()).is_structural());
    }
}
