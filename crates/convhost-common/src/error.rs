//! Error types shared across convhost crates

use std::path::PathBuf;
use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while loading requests and configuration
#[derive(Debug, Error)]
pub enum CommonError {
    /// The request failed validation; each entry is one problem
    #[error("Errors in request:\n{}", format_problems(.0))]
    InvalidRequest(Vec<String>),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed configuration: {0}")]
    Config(#[from] toml::de::Error),
}

fn format_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!(" - {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_lists_every_problem() {
        let err = CommonError::InvalidRequest(vec![
            "Missing 'vm_name' key in request".to_string(),
            "Missing 'vm_uuid' key in request".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Errors in request:\n - Missing 'vm_name' key in request\n - Missing 'vm_uuid' key in request"
        );
    }
}
