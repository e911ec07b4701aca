//! Error types for Symbridge

use thiserror::Error;

use crate::models::symbol::Candidate;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No language server configured for extension '.{extension}'")]
    NotConfigured { extension: String },

    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailure { command: String, message: String },

    #[error("{server} started but initialize did not complete: {message}")]
    HandshakeFailure { server: String, message: String },

    #[error("{server} language server disconnected")]
    ServerDisconnected { server: String },

    #[error("{server} did not answer '{method}' within {timeout_secs}s")]
    Timeout {
        server: String,
        method: String,
        timeout_secs: u64,
    },

    #[error("Symbol '{name}' not found in {file}")]
    SymbolNotFound { name: String, file: String },

    #[error("Symbol '{name}' is ambiguous: {} candidates. Retry with an exact position.", candidates.len())]
    AmbiguousSymbol {
        name: String,
        candidates: Vec<Candidate>,
    },

    #[error("{file} changed since the edit was computed; apply halted for this file")]
    ConcurrentModification { file: String },

    #[error("Malformed wire data from {server}: {message}")]
    Framing { server: String, message: String },

    #[error("Server error [{code}]: {message}")]
    ServerError { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Resolution-level outcomes are expected and frequent; they are returned
    /// to the caller but never logged as errors.
    pub fn is_resolution_outcome(&self) -> bool {
        matches!(
            self,
            Self::SymbolNotFound { .. } | Self::AmbiguousSymbol { .. }
        )
    }

    /// True when the owning instance's stream can no longer be trusted and
    /// the instance is eligible for a lazy restart on next use.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ServerDisconnected { .. } | Self::Framing { .. }
        )
    }

    /// A slow server is not a crashed server: timeouts do not change the
    /// instance's health state.
    pub fn affects_instance_health(&self) -> bool {
        self.is_disconnect()
    }

    pub fn method_not_found(&self) -> bool {
        matches!(self, Self::ServerError { code, .. }
            if *code == crate::infra::lsp::protocol::error_codes::METHOD_NOT_FOUND)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Extension '.{extension}' is configured more than once")]
    DuplicateExtension { extension: String },

    #[error("Server entry for {extensions:?} has an empty command")]
    EmptyCommand { extensions: Vec<String> },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lsp::{Position, Range};
    use crate::models::symbol::Location;

    fn candidate(line: u32) -> Candidate {
        Candidate {
            name: "foo".into(),
            query_position: Position::new(line, 4),
            location: Location {
                file: "/tmp/a.py".into(),
                range: Range::point(Position::new(line, 4)),
            },
            kind: None,
        }
    }

    #[test]
    fn resolution_outcomes_are_not_failures() {
        let err = BridgeError::SymbolNotFound {
            name: "foo".into(),
            file: "a.py".into(),
        };
        assert!(err.is_resolution_outcome());
        assert!(!err.is_disconnect());

        let err = BridgeError::AmbiguousSymbol {
            name: "foo".into(),
            candidates: vec![candidate(1), candidate(9)],
        };
        assert!(err.is_resolution_outcome());
        assert!(err.to_string().contains("2 candidates"));
    }

    #[test]
    fn framing_is_equivalent_to_disconnect() {
        let err = BridgeError::Framing {
            server: "pyright".into(),
            message: "missing Content-Length".into(),
        };
        assert!(err.is_disconnect());
        assert!(err.affects_instance_health());
    }

    #[test]
    fn timeout_leaves_instance_health_alone() {
        let err = BridgeError::Timeout {
            server: "pyright".into(),
            method: "textDocument/definition".into(),
            timeout_secs: 30,
        };
        assert!(!err.affects_instance_health());
        assert!(!err.is_resolution_outcome());
    }

    #[test]
    fn spawn_failure_names_the_command() {
        let err = BridgeError::SpawnFailure {
            command: "pyright-langserver --stdio".into(),
            message: "No such file or directory".into(),
        };
        assert!(err.to_string().contains("pyright-langserver"));
    }
}
