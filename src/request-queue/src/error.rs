// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for the crate

use std::io;

/// The failure produced when a server could not perform a request.
///
/// This is what travels back to the client in a `false` response: the kind of
/// failure and an optional message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {}", .message.as_deref().unwrap_or("(no message)"))]
pub struct RequestFailure {
    kind: String,
    message: Option<String>,
}

impl RequestFailure {
    pub fn new(kind: impl Into<String>, message: Option<String>) -> Self {
        RequestFailure {
            kind: kind.into(),
            message,
        }
    }

    /// The kind of failure, e.g. `cache_consistency`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// An error produced by a request queue component.
#[derive(Debug, thiserror::Error)]
pub enum RequestQueueError {
    /// The component has begun to shut down.
    #[error("the request queue is shutting down")]
    ShuttingDown,
    /// A caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The connection failed. These errors are retried.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    /// The peer did not follow the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The server failed to perform a request.
    #[error("request failed: {0}")]
    Request(#[from] RequestFailure),
}

impl RequestQueueError {
    /// Whether the error is a transient connection failure that should be
    /// retried by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestQueueError::Io(_))
    }
}
