// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for the crate

use cds_request_queue::error::{RequestFailure, RequestQueueError};

use crate::queue::ContextId;

/// An error returned by the [`UpdateQueue`](crate::queue::UpdateQueue).
#[derive(Debug, thiserror::Error)]
pub enum UpdateQueueError {
    /// The transaction's deadline passed before it tried to prepare.
    #[error("transaction timed out")]
    Timeout,
    /// No commit slot became available before the transaction's deadline.
    #[error("update queue full")]
    ResourceUnavailable,
    /// The queue shut down while the transaction waited for a commit slot.
    #[error("interrupted waiting for the update queue")]
    Interrupted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown transaction context: {0}")]
    UnknownContext(ContextId),
    #[error("transaction context already finished: {0}")]
    AlreadyFinished(ContextId),
    /// The request transport failed or has shut down.
    #[error(transparent)]
    Transport(#[from] RequestQueueError),
}

/// The data server found a node's view of the cache inconsistent with its
/// own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache consistency failure: {message}")]
pub struct CacheConsistencyError {
    message: String,
}

impl CacheConsistencyError {
    /// The [`RequestFailure`] kind that carries this error over the wire.
    pub const KIND: &'static str = "cache_consistency";

    pub fn new(message: impl Into<String>) -> Self {
        CacheConsistencyError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Recovers the error from a failure reported by the server, if that is
    /// what the failure carries.
    pub fn from_failure(failure: &RequestFailure) -> Option<Self> {
        (failure.kind() == Self::KIND)
            .then(|| CacheConsistencyError::new(failure.message().unwrap_or_default()))
    }
}

impl From<CacheConsistencyError> for RequestFailure {
    fn from(error: CacheConsistencyError) -> Self {
        RequestFailure::new(CacheConsistencyError::KIND, Some(error.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_failure() {
        let error = CacheConsistencyError::new("object 3 already exists");
        let failure = RequestFailure::from(error.clone());
        assert_eq!(failure.kind(), "cache_consistency");
        assert_eq!(CacheConsistencyError::from_failure(&failure), Some(error));

        let other = RequestFailure::new("io", None);
        assert_eq!(CacheConsistencyError::from_failure(&other), None);
    }
}
