//! Error types for Conductor.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the core crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => {
                Some("Check your config file at ~/.config/conductor/config.toml")
            }
            Error::Validation(_) => Some("Fix the reported fields and try again"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_has_suggestion() {
        let err = Error::Config("bad toml".to_string());
        assert!(err.to_string().contains("bad toml"));
        assert!(format_error_with_suggestion(&err).contains("Suggestion"));
    }

    #[test]
    fn test_io_error_has_no_suggestion() {
        let err = Error::from(std::io::Error::other("disk"));
        assert!(err.recovery_suggestion().is_none());
        assert_eq!(format_error_with_suggestion(&err), "IO error: disk");
    }
}
