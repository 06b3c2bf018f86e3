use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy shared by the pipeline components.
///
/// Components that the orchestrator has to branch on (remote client, text
/// extractor, content store, preview renderer) return this type directly.
/// Plumbing below them keeps using `anyhow` and gets folded into
/// `StoreWriteFailure` at the seam.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed diagram: {0}")]
    MalformedDiagram(String),
    #[error("store write failed: {0}")]
    StoreWriteFailure(String),
    #[error("preview render failed: {0}")]
    RenderFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RemoteUnavailable,
    NotFound,
    MalformedDiagram,
    StoreWriteFailure,
    RenderFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteUnavailable => "remote_unavailable",
            Self::NotFound => "not_found",
            Self::MalformedDiagram => "malformed_diagram",
            Self::StoreWriteFailure => "store_write_failure",
            Self::RenderFailed => "render_failed",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RemoteUnavailable(_) => FailureKind::RemoteUnavailable,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::MalformedDiagram(_) => FailureKind::MalformedDiagram,
            Self::StoreWriteFailure(_) => FailureKind::StoreWriteFailure,
            Self::RenderFailed(_) => FailureKind::RenderFailed,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }

    /// Wraps any store-level error, keeping the full context chain in the message.
    pub fn store_write(error: anyhow::Error) -> Self {
        Self::StoreWriteFailure(format!("{error:#}"))
    }
}
