use thiserror::Error;

/// Errors that can occur in the gateway configuration subsystem
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed YAML, unknown key, or wrong type in a config file
    #[error("Schema error: {0}")]
    Schema(String),

    /// Unknown alias, duplicate host ID, empty include glob, and similar
    /// dangling references between config entities
    #[error("Reference error: {0}")]
    Reference(String),

    /// Invalid pattern literal (malformed regexp)
    #[error("Pattern error: {0}")]
    Pattern(String),

    /// Cross-field validation failure (timeout relationships, empty
    /// post-default values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem I/O error while reading config files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error outside of schema-level parsing
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Config(s)
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        GatewayError::Config(s.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Schema(err.to_string())
    }
}
