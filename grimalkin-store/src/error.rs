//! Store error taxonomy

use grimalkin_core::{MalformedUuid, ValidationError};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::service::AnswerStage;

/// Every failure a store or service operation can surface.
///
/// Nothing in this crate retries; callers decide whether to reissue.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },

    #[error(transparent)]
    MalformedUuid(#[from] MalformedUuid),

    #[error("storage unavailable at {target}: {source}")]
    Unavailable {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("fan-out of {question_id} to {followers} follower feed(s) failed: {source}")]
    PartialFanout {
        question_id: Uuid,
        followers: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("deadline exceeded while {context}")]
    DeadlineExceeded { context: String },

    #[error("cancelled while {context}")]
    Cancelled { context: String },

    #[error("schema provisioning failed for {table_group}: {source}")]
    SchemaProvisioning {
        table_group: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    #[error("answer aborted (completed: {completed}): {source}")]
    AnswerAborted {
        completed: AnswerStage,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn storage(context: impl Into<String>, source: BackendError) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Wrap a failure of the answer workflow, naming the last stage that
    /// completed before it.
    pub fn aborted(completed: AnswerStage) -> impl FnOnce(StoreError) -> StoreError {
        move |source| Self::AnswerAborted {
            completed,
            source: Box::new(source),
        }
    }

    /// The innermost store error, looking through workflow wrappers.
    pub fn root(&self) -> &StoreError {
        match self {
            Self::PartialFanout { source, .. }
            | Self::SchemaProvisioning { source, .. }
            | Self::AnswerAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        Self::storage("storage request failed", err)
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
