//! Conversion error taxonomy and its HTTP mapping.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;

use crate::cache::CacheError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// Malformed or missing request fields.
    #[error("{0}")]
    BadInput(String),

    /// Missing or ambiguous character data, or an unusable entry script.
    #[error("{0}")]
    Configuration(String),

    /// The engine produced no usable output, or a pipeline step failed.
    #[error("{message}")]
    Processing {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("engine did not finish within {0:?} and was killed")]
    Timeout(Duration),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

impl ConversionError {
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            source: None,
        }
    }

    pub fn processing_caused_by(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Temporary files that could not be removed.
#[derive(Debug, thiserror::Error)]
#[error("failed to remove {} temporary file(s): {}", .failures.len(), describe(.failures))]
pub struct CleanupError {
    pub failures: Vec<(PathBuf, std::io::Error)>,
}

fn describe(failures: &[(PathBuf, std::io::Error)]) -> String {
    failures
        .iter()
        .map(|(path, e)| format!("{}: {e}", path.display()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Render an error and every `source()` beneath it, one per line.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str("\nCaused by: ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bad_input_is_a_client_error() {
        assert_eq!(
            ConversionError::BadInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConversionError::Configuration("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ConversionError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn chain_includes_every_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConversionError::processing_caused_by(
            "copy failed",
            ConversionError::io("writing raw/clip1.wav", io),
        );
        assert_eq!(
            error_chain(&err),
            "copy failed\nCaused by: writing raw/clip1.wav\nCaused by: denied"
        );
    }

    #[test]
    fn cleanup_error_lists_paths() {
        let err = CleanupError {
            failures: vec![(
                PathBuf::from("/a/raw/x.wav"),
                std::io::Error::new(std::io::ErrorKind::Other, "busy"),
            )],
        };
        assert_eq!(
            err.to_string(),
            "failed to remove 1 temporary file(s): /a/raw/x.wav: busy"
        );
    }
}
