// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The server side of a request queue.
//!
//! There is one [`RequestQueueServer`] per client node. It serves at most one
//! connection at a time and keeps the number of the last request it performed
//! across connections, so that requests resent after a reconnection are
//! acknowledged without being performed again.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{RequestFailure, RequestQueueError};
use crate::protocol;
use crate::{MAX_OUTSTANDING, MAX_REQUEST, RequestHandler, Socket};

/// Returns whether request number `x` comes before request number `y`,
/// taking wraparound into account.
///
/// Numbers less than [`MAX_OUTSTANDING`] ahead of `x` are later, and numbers
/// no more than [`MAX_OUTSTANDING`] behind it are earlier or equal. Anything
/// in between would mean more requests are outstanding than the client allows,
/// and produces an error.
pub fn earlier(x: u16, y: u16) -> Result<bool, RequestQueueError> {
    if x > MAX_REQUEST || y > MAX_REQUEST {
        return Err(RequestQueueError::InvalidArgument(format!(
            "request numbers must be between 0 and {MAX_REQUEST}: {x}, {y}"
        )));
    }
    let range = usize::from(MAX_REQUEST) + 1;
    let ahead = (usize::from(y) + range - usize::from(x)) % range;
    if ahead == 0 {
        Ok(false)
    } else if ahead < MAX_OUTSTANDING {
        Ok(true)
    } else if ahead >= range - MAX_OUTSTANDING {
        Ok(false)
    } else {
        Err(RequestQueueError::Protocol(format!(
            "too many requests outstanding: last request {x}, next request {y}"
        )))
    }
}

/// Serves the connection for a single node.
///
/// Implemented by [`RequestQueueServer`] for every handler type, so that a
/// listener can dispatch connections without knowing the request type.
#[async_trait]
pub trait NodeServer: Send + Sync + 'static {
    fn node_id(&self) -> i64;

    /// Serves a new connection from the node, whose node ID has already been
    /// read, after disconnecting any existing connection.
    async fn handle_connection(&self, socket: Box<dyn Socket>);
}

/// The state that survives reconnections.
#[derive(Debug)]
struct RequestState {
    last_request_number: u16,
    /// The failure produced by the first request that failed, reported to
    /// every request that follows it.
    failure: Option<RequestFailure>,
}

impl RequestState {
    /// Performs the request unless it was performed already or an earlier
    /// request failed, and returns the response to send.
    async fn perform<H: RequestHandler>(
        &mut self,
        node_id: i64,
        request_number: u16,
        request: H::Request,
        handler: &H,
    ) -> Result<Result<(), RequestFailure>, RequestQueueError> {
        let is_new = earlier(self.last_request_number, request_number)?;
        if is_new && self.failure.is_none() {
            trace!(node_id, request_number, ?request, "request queue: performing request");
            if let Err(failure) = handler.perform_request(request).await {
                warn!(node_id, request_number, %failure, "request queue: request failed");
                self.failure = Some(failure);
            }
        } else if !is_new {
            trace!(node_id, request_number, "request queue: skipping duplicate request");
        }
        if is_new {
            self.last_request_number = request_number;
        }
        Ok(match &self.failure {
            None => Ok(()),
            Some(failure) => Err(failure.clone()),
        })
    }
}

/// The server side of the request queue for one node.
#[derive(Debug)]
pub struct RequestQueueServer<H> {
    node_id: i64,
    handler: Arc<H>,
    state: Arc<Mutex<RequestState>>,
    /// The task serving the current connection, if any.
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl<H: RequestHandler> RequestQueueServer<H> {
    pub fn new(node_id: i64, handler: H) -> Result<Self, RequestQueueError> {
        if node_id < 0 {
            return Err(RequestQueueError::InvalidArgument(format!(
                "the node ID must not be negative: {node_id}"
            )));
        }
        Ok(RequestQueueServer {
            node_id,
            handler: Arc::new(handler),
            state: Arc::new(Mutex::new(RequestState {
                last_request_number: MAX_REQUEST,
                failure: None,
            })),
            connection: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serves a new connection, disconnecting the existing one first.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn handle_connection<S: Socket>(&self, socket: S) {
        let mut connection = self.connection.lock().await;
        if let Some(task) = connection.take() {
            stop(task).await;
        }
        let node_id = self.node_id;
        let handler = Arc::clone(&self.handler);
        let state = Arc::clone(&self.state);
        debug!(node_id, "request queue: accepted connection");
        *connection = Some(tokio::spawn(async move {
            let Err(error) = serve_connection(node_id, socket, handler, state).await;
            if error.is_retryable() {
                debug!(node_id, %error, "request queue: connection closed");
            } else {
                warn!(node_id, %error, "request queue: connection failed");
            }
        }));
    }

    /// Disconnects the current connection, if any.
    pub async fn disconnect(&self) {
        if let Some(task) = self.connection.lock().await.take() {
            debug!(node_id = self.node_id, "request queue: disconnecting");
            stop(task).await;
        }
    }
}

impl<H> Drop for RequestQueueServer<H> {
    fn drop(&mut self) {
        if let Some(task) = self.connection.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl<H: RequestHandler> NodeServer for RequestQueueServer<H> {
    fn node_id(&self) -> i64 {
        self.node_id
    }

    async fn handle_connection(&self, socket: Box<dyn Socket>) {
        RequestQueueServer::handle_connection(self, socket).await
    }
}

/// Aborts a connection task and waits for it to finish, which closes its
/// socket.
async fn stop(task: JoinHandle<()>) {
    task.abort();
    let _ = task.await;
}

/// Serve a single connection until it fails or is aborted.
///
/// Requests are performed on a separate task that holds the request state
/// lock, so aborting the connection never interrupts a request that has
/// started, and the next connection waits for it to be recorded.
async fn serve_connection<S, H>(
    node_id: i64,
    socket: S,
    handler: Arc<H>,
    state: Arc<Mutex<RequestState>>,
) -> Result<Infallible, RequestQueueError>
where
    S: Socket,
    H: RequestHandler,
{
    let (mut reader, writer) = tokio::io::split(socket);
    let mut writer = BufWriter::new(writer);

    let mut buf = BytesMut::new();
    protocol::put_bool(&mut buf, true);
    protocol::write_frame(&mut writer, &buf).await?;

    loop {
        let request_number = reader.read_u16().await?;
        if request_number > MAX_REQUEST {
            return Err(RequestQueueError::Protocol(format!(
                "invalid request number: {request_number}"
            )));
        }
        let request = handler.read_request(&mut reader).await?;

        let handler = Arc::clone(&handler);
        let state = Arc::clone(&state);
        let response = tokio::spawn(async move {
            let mut state = state.lock().await;
            state
                .perform(node_id, request_number, request, &*handler)
                .await
        })
        .await
        .map_err(|e| RequestQueueError::Protocol(format!("request task failed: {e}")))??;

        buf.clear();
        protocol::put_response(&mut buf, &response);
        protocol::write_frame(&mut writer, &buf).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};

    use super::*;

    /// Requests carry a single `u32`. Performing request `fail_at` fails.
    #[derive(Debug, Default)]
    struct CountingHandler {
        performed: AtomicUsize,
        fail_at: Option<u32>,
    }

    #[async_trait]
    impl RequestHandler for CountingHandler {
        type Request = u32;

        async fn read_request(
            &self,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<u32, RequestQueueError> {
            Ok(reader.read_u32().await?)
        }

        async fn perform_request(&self, request: u32) -> Result<(), RequestFailure> {
            self.performed.fetch_add(1, Ordering::SeqCst);
            if Some(request) == self.fail_at {
                return Err(RequestFailure::new(
                    "test",
                    Some(format!("request {request}")),
                ));
            }
            Ok(())
        }
    }

    /// Connects a new client stream to the server and consumes the handshake.
    async fn connect(server: &RequestQueueServer<CountingHandler>) -> DuplexStream {
        let (mut client, socket) = tokio::io::duplex(1024);
        server.handle_connection(socket).await;
        assert!(protocol::read_bool(&mut client).await.unwrap());
        client
    }

    async fn send(client: &mut DuplexStream, request_number: u16, value: u32) {
        client.write_u16(request_number).await.unwrap();
        client.write_u32(value).await.unwrap();
        client.flush().await.unwrap();
    }

    async fn response(client: &mut DuplexStream) -> Result<(), RequestFailure> {
        protocol::read_response(client).await.unwrap()
    }

    #[test]
    fn earlier_bounds() {
        assert!(matches!(
            earlier(32768, 0),
            Err(RequestQueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            earlier(0, 32768),
            Err(RequestQueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn earlier_wraparound() {
        assert!(!earlier(0, 0).unwrap());
        assert!(earlier(0, 1).unwrap());
        assert!(earlier(0, 9999).unwrap());
        assert!(earlier(0, 10000).is_err());
        assert!(earlier(0, 22767).is_err());
        assert!(!earlier(0, 22768).unwrap());
        assert!(!earlier(0, 32767).unwrap());

        assert!(!earlier(32767, 32767).unwrap());
        assert!(earlier(32767, 0).unwrap());
        assert!(earlier(32767, 9998).unwrap());
        assert!(earlier(32767, 9999).is_err());
        assert!(earlier(32767, 22766).is_err());
        assert!(!earlier(32767, 22767).unwrap());
        assert!(!earlier(32767, 32766).unwrap());

        assert!(earlier(16000, 16001).unwrap());
        assert!(!earlier(16001, 16000).unwrap());
    }

    #[test]
    fn negative_node_id() {
        assert!(RequestQueueServer::new(-1, CountingHandler::default()).is_err());
    }

    #[tokio::test]
    async fn ignore_duplicates() {
        let server = RequestQueueServer::new(1, CountingHandler::default()).unwrap();
        let mut client = connect(&server).await;
        for request_number in [0, 0, 1, 1, 2] {
            send(&mut client, request_number, 7).await;
            assert_eq!(response(&mut client).await, Ok(()));
        }
        assert_eq!(server.handler().performed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ignore_duplicates_across_connections() {
        let server = RequestQueueServer::new(1, CountingHandler::default()).unwrap();
        let mut client = connect(&server).await;
        for request_number in [0, 1, 2] {
            send(&mut client, request_number, 7).await;
            assert_eq!(response(&mut client).await, Ok(()));
        }
        drop(client);

        let mut client = connect(&server).await;
        for request_number in [1, 2, 3, 4] {
            send(&mut client, request_number, 7).await;
            assert_eq!(response(&mut client).await, Ok(()));
        }
        assert_eq!(server.handler().performed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn sticky_failure() {
        let handler = CountingHandler {
            fail_at: Some(5),
            ..Default::default()
        };
        let server = RequestQueueServer::new(1, handler).unwrap();
        let mut client = connect(&server).await;
        for value in 1..5 {
            send(&mut client, u16::try_from(value).unwrap(), value).await;
            assert_eq!(response(&mut client).await, Ok(()));
        }
        send(&mut client, 5, 5).await;
        let failure = response(&mut client).await.unwrap_err();
        assert_eq!(failure.kind(), "test");
        assert_eq!(failure.message(), Some("request 5"));
        for value in [6, 7] {
            send(&mut client, u16::try_from(value).unwrap(), value).await;
            assert_eq!(response(&mut client).await, Err(failure.clone()));
        }

        // The failure outlives the connection.
        let mut client = connect(&server).await;
        send(&mut client, 8, 8).await;
        assert_eq!(response(&mut client).await, Err(failure));
        assert_eq!(server.handler().performed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn too_many_outstanding() {
        let server = RequestQueueServer::new(1, CountingHandler::default()).unwrap();
        let mut client = connect(&server).await;
        send(&mut client, 0, 7).await;
        assert_eq!(response(&mut client).await, Ok(()));
        send(&mut client, 20000, 7).await;
        assert!(client.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn truncated_request_closes_connection() {
        let server = RequestQueueServer::new(1, CountingHandler::default()).unwrap();
        let mut client = connect(&server).await;
        client.write_u16(0).await.unwrap();
        client.flush().await.unwrap();
        server.disconnect().await;
        assert!(client.read_u8().await.is_err());
        assert_eq!(server.handler().performed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_connection_replaces_old() {
        let server = RequestQueueServer::new(1, CountingHandler::default()).unwrap();
        let mut first = connect(&server).await;
        let mut second = connect(&server).await;
        let closed = tokio::time::timeout(Duration::from_secs(10), first.read_u8())
            .await
            .expect("old connection should be closed");
        assert!(closed.is_err());

        send(&mut second, 0, 7).await;
        assert_eq!(response(&mut second).await, Ok(()));
    }
}
