// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A request queue that carries requests from one node to a server, where each
//! request is performed exactly once and in the order it was added.
//!
//! The [`client::RequestQueueClient`] numbers each request, writes it to the
//! server and keeps it until the server acknowledges it. If the connection
//! fails, the client reconnects and resends every unacknowledged request with
//! its original number. The [`server::RequestQueueServer`] for the node
//! remembers the number of the last request it performed, across connections,
//! and only performs requests that come after it.
//!
//! The network protocol:
//!
//! ```text
//! Establish connection
//!   client:  (i64) node_id
//!   server:  (bool) true
//! Request
//!   client:  (u16) request_number, request body
//!   server:  (bool) true                                  -- success
//!            (bool) false, (string) kind, (string) message -- failure
//! ```
//!
//! Request numbers wrap from [`MAX_REQUEST`] back to `0`. No more than
//! [`MAX_OUTSTANDING`] requests may be unacknowledged at any time, which is
//! what lets the server tell a retransmission from a new request after the
//! numbers wrap.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{RequestFailure, RequestQueueError};

pub mod client;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod retry;
pub mod server;

/// The largest request number. Numbers wrap around to `0` after it.
pub const MAX_REQUEST: u16 = 32767;

/// The maximum number of requests that may have been sent without being
/// acknowledged.
pub const MAX_OUTSTANDING: usize = 10_000;

/// A bidirectional byte stream that requests travel over.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Socket for T {}

/// A request that can be sent through a request queue.
pub trait Request: Debug + Send + 'static {
    /// Encodes the request body, not including its request number.
    fn write_request(&self, buf: &mut BytesMut);

    /// Called once, after the server has acknowledged performing the request.
    fn completed(self);
}

/// Reads and performs requests on the server side of a request queue.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// The type of request handled.
    type Request: Debug + Send + 'static;

    /// Decodes a request body, the inverse of [`Request::write_request`].
    async fn read_request(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Self::Request, RequestQueueError>;

    /// Performs a request, returning a failure if it could not be performed.
    async fn perform_request(&self, request: Self::Request) -> Result<(), RequestFailure>;
}

/// Receives notice that a request queue component has failed permanently.
///
/// Never called when a component is shut down explicitly.
pub trait FailureReporter: Send + Sync + 'static {
    fn report_failure(&self, error: RequestQueueError);
}

impl<F> FailureReporter for F
where
    F: Fn(RequestQueueError) + Send + Sync + 'static,
{
    fn report_failure(&self, error: RequestQueueError) {
        self(error)
    }
}
