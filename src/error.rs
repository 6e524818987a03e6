use thiserror::Error;

use crate::operation::OperationKind;
use crate::result_store::StoreError;
use crate::runner::SpawnError;

/// Failures surfaced to callers of the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The operation could not be launched
    #[error("could not start {kind}: {source}")]
    StartFailed {
        kind: OperationKind,
        #[source]
        source: StartFailure,
    },

    /// None of the configured connection counting tools runs on this host
    #[error("could not start {kind}: no connection counting tool is available (tried: {})", .tried.join(", "))]
    ToolUnavailable {
        kind: OperationKind,
        tried: Vec<String>,
    },

    /// The result file is absent or not usable yet
    #[error("the {kind} test is not finished yet")]
    NotReady { kind: OperationKind },

    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Why a start request was rejected
#[derive(Error, Debug)]
pub enum StartFailure {
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    ResultFile(#[from] StoreError),
}

impl OrchestratorError {
    /// Whether the caller should simply poll again later
    pub fn is_not_ready(&self) -> bool {
        matches!(self, OrchestratorError::NotReady { .. })
    }

    /// HTTP-equivalent status for transport layers
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::NotReady { .. } => 404,
            _ => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
