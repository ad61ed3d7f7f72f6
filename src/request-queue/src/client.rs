// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client side of a request queue.
//!
//! A [`RequestQueueClient`] owns a single send task. The send task connects to
//! the server, writes the handshake, and then writes requests in order, first
//! any left unacknowledged by the previous connection and then new ones. Each
//! connection has its own receive task that reads the server's responses and
//! completes acknowledged requests. A failed connection is retried until
//! failures have continued for longer than the maximum retry time, at which
//! point the client shuts down and reports the failure.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::RequestQueueError;
use crate::protocol;
use crate::retry::{FailureRun, INFO_MIN_RETRIES, check_retry_settings};
use crate::{FailureReporter, MAX_OUTSTANDING, MAX_REQUEST, Request, Socket};

/// Creates connections to the server.
#[async_trait]
pub trait SocketFactory: fmt::Debug + Send + Sync + 'static {
    async fn connect(&self) -> io::Result<Box<dyn Socket>>;
}

/// Connects to the server over TCP.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    host: String,
    port: u16,
}

impl TcpSocketFactory {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpSocketFactory {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self) -> io::Result<Box<dyn Socket>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// The client side of a request queue, which sends requests to the server
/// for a single node.
#[derive(Debug)]
pub struct RequestQueueClient<R> {
    node_id: i64,
    requests: mpsc::Sender<R>,
    shutdown: Arc<watch::Sender<bool>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<R: Request> RequestQueueClient<R> {
    /// Creates a client and starts its send task.
    ///
    /// `queue_size` bounds both the requests waiting to be sent and the
    /// requests sent but not yet acknowledged. Must be called from within a
    /// Tokio runtime.
    pub fn new(
        node_id: i64,
        socket_factory: Arc<dyn SocketFactory>,
        failure_reporter: Arc<dyn FailureReporter>,
        max_retry: Duration,
        retry_wait: Duration,
        queue_size: usize,
    ) -> Result<Self, RequestQueueError> {
        if node_id < 0 {
            return Err(RequestQueueError::InvalidArgument(format!(
                "the node ID must not be negative: {node_id}"
            )));
        }
        check_retry_settings(max_retry, retry_wait)?;
        if queue_size < 1 || queue_size > MAX_OUTSTANDING {
            return Err(RequestQueueError::InvalidArgument(format!(
                "the queue size must be between 1 and {MAX_OUTSTANDING}: {queue_size}"
            )));
        }
        let (requests_tx, requests_rx) = mpsc::channel(queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let sender = Sender {
            node_id,
            socket_factory,
            failure_reporter,
            max_retry,
            retry_wait,
            requests: requests_rx,
            shutdown: Arc::clone(&shutdown_tx),
            resend: VecDeque::new(),
            sent: Arc::new(SentRequests::new()),
            outstanding: Arc::new(Semaphore::new(queue_size)),
            next_request_number: 0,
            failures: Arc::new(Mutex::new(FailureRun::new(max_retry))),
        };
        let task = tokio::spawn(sender.run(shutdown_rx));
        debug!(
            node_id,
            ?max_retry,
            ?retry_wait,
            queue_size,
            "request queue client: created"
        );
        Ok(RequestQueueClient {
            node_id,
            requests: requests_tx,
            shutdown: shutdown_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Adds a request to the queue, waiting for space if the queue is full.
    ///
    /// Fails with [`RequestQueueError::ShuttingDown`] once the client has
    /// begun to shut down, whether explicitly or after a permanent failure.
    pub async fn add_request(&self, request: R) -> Result<(), RequestQueueError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(RequestQueueError::ShuttingDown);
        }
        trace!(node_id = self.node_id, ?request, "request queue client: adding request");
        tokio::select! {
            result = self.requests.send(request) => {
                result.map_err(|_| RequestQueueError::ShuttingDown)
            }
            _ = shutdown.wait_for(|shutdown| *shutdown) => Err(RequestQueueError::ShuttingDown),
        }
    }

    /// Whether the client has begun to shut down.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Shuts down the client, closing the current connection, and waits for
    /// the send task to exit. Requests not yet acknowledged are abandoned.
    pub async fn shutdown(&self) {
        trace!(node_id = self.node_id, "request queue client: shutdown requested");
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(error) = task.await {
                warn!(node_id = self.node_id, %error, "request queue client: send task failed");
            }
        }
    }
}

impl<R> Drop for RequestQueueClient<R> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// A request together with the number it was sent with.
#[derive(Debug)]
struct SentRequest<R> {
    request_number: u16,
    request: R,
}

/// The requests written to the current connection and not yet acknowledged,
/// in the order they were written.
#[derive(Debug)]
struct SentRequests<R> {
    requests: Mutex<VecDeque<SentRequest<R>>>,
    pending: Notify,
}

impl<R> SentRequests<R> {
    fn new() -> Self {
        SentRequests {
            requests: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
        }
    }

    fn push_back(&self, sent: SentRequest<R>) {
        self.requests.lock().expect("lock poisoned").push_back(sent);
        self.pending.notify_one();
    }

    fn pop_front(&self) -> Option<SentRequest<R>> {
        self.requests.lock().expect("lock poisoned").pop_front()
    }

    fn take(&self) -> VecDeque<SentRequest<R>> {
        std::mem::take(&mut *self.requests.lock().expect("lock poisoned"))
    }

    /// Waits until at least one request is awaiting a response.
    async fn wait_pending(&self) {
        loop {
            let notified = self.pending.notified();
            if !self.requests.lock().expect("lock poisoned").is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// The state owned by the send task.
struct Sender<R> {
    node_id: i64,
    socket_factory: Arc<dyn SocketFactory>,
    failure_reporter: Arc<dyn FailureReporter>,
    max_retry: Duration,
    retry_wait: Duration,
    requests: mpsc::Receiver<R>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Requests left unacknowledged by earlier connections, to be sent again
    /// with their original numbers before any new request.
    resend: VecDeque<SentRequest<R>>,
    sent: Arc<SentRequests<R>>,
    /// Permits for requests that may be sent before earlier ones are
    /// acknowledged.
    outstanding: Arc<Semaphore>,
    next_request_number: u16,
    failures: Arc<Mutex<FailureRun>>,
}

impl<R: Request> Sender<R> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.handle_connection(&mut shutdown).await {
                Ok(()) => break,
                Err(error) => {
                    if !self.note_failure(error, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!(node_id = self.node_id, "request queue client: shut down");
    }

    /// Connects to the server and sends requests until the connection fails,
    /// the client shuts down, or the client is dropped.
    async fn handle_connection(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RequestQueueError> {
        let mut unacknowledged = self.sent.take();
        unacknowledged.append(&mut self.resend);
        self.resend = unacknowledged;

        let socket_factory = &*self.socket_factory;
        let connect = with_timeout(self.max_retry, async move {
            socket_factory.connect().await.map_err(RequestQueueError::from)
        });
        let socket = tokio::select! {
            _ = shutdown.wait_for(|shutdown| *shutdown) => return Ok(()),
            socket = connect => socket?,
        };
        debug!(
            node_id = self.node_id,
            resend = self.resend.len(),
            "request queue client: connected"
        );

        let (reader, writer) = tokio::io::split(socket);
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let receiver = Receiver {
            node_id: self.node_id,
            max_retry: self.max_retry,
            sent: Arc::clone(&self.sent),
            outstanding: Arc::clone(&self.outstanding),
            failures: Arc::clone(&self.failures),
        };
        let receive_task = tokio::spawn(async move {
            let Err(error) = receiver.receive_responses(reader).await;
            let _ = failed_tx.send(error);
        });

        let mut writer = BufWriter::new(writer);
        let result = self
            .send_requests(&mut writer, &mut failed_rx, shutdown)
            .await;

        // The receive task must be gone before the socket is closed.
        receive_task.abort();
        let _ = receive_task.await;
        result
    }

    async fn send_requests<W>(
        &mut self,
        writer: &mut W,
        failed: &mut oneshot::Receiver<RequestQueueError>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RequestQueueError>
    where
        W: AsyncWrite + Unpin,
    {
        protocol::write_node_id(writer, self.node_id).await?;
        trace!(node_id = self.node_id, "request queue client: sent handshake");
        let mut buf = BytesMut::new();
        loop {
            let sent = tokio::select! {
                biased;
                _ = shutdown.wait_for(|shutdown| *shutdown) => return Ok(()),
                error = &mut *failed => return Err(receive_error(error)),
                sent = self.next_request() => match sent {
                    Some(sent) => sent,
                    None => return Ok(()),
                },
            };
            trace!(
                node_id = self.node_id,
                request_number = sent.request_number,
                request = ?sent.request,
                "request queue client: sending request"
            );
            buf.clear();
            buf.put_u16(sent.request_number);
            sent.request.write_request(&mut buf);
            self.sent.push_back(sent);
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|shutdown| *shutdown) => return Ok(()),
                error = &mut *failed => return Err(receive_error(error)),
                result = protocol::write_frame(writer, &buf) => result?,
            }
        }
    }

    /// Returns the next request to send, or `None` if the client has been
    /// dropped.
    async fn next_request(&mut self) -> Option<SentRequest<R>> {
        if let Some(sent) = self.resend.pop_front() {
            return Some(sent);
        }
        let permit = self.outstanding.acquire().await.ok()?;
        let request = self.requests.recv().await?;
        permit.forget();
        let request_number = self.next_request_number;
        self.next_request_number = if request_number == MAX_REQUEST {
            0
        } else {
            request_number + 1
        };
        Some(SentRequest {
            request_number,
            request,
        })
    }

    /// Notes a failed connection. Returns whether to reconnect.
    async fn note_failure(
        &mut self,
        error: RequestQueueError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if *shutdown.borrow_and_update() {
            return false;
        }
        let (give_up, failures) = {
            let mut run = self.failures.lock().expect("lock poisoned");
            (run.failed(Instant::now()), run.failures())
        };
        if !error.is_retryable() || give_up {
            warn!(
                node_id = self.node_id,
                %error,
                failures,
                "request queue client: shutting down due to failure"
            );
            self.shutdown.send_replace(true);
            self.failure_reporter.report_failure(error);
            return false;
        }
        if failures >= INFO_MIN_RETRIES {
            info!(
                node_id = self.node_id,
                %error,
                failures,
                "request queue client: connection failed, retrying"
            );
        } else {
            debug!(
                node_id = self.node_id,
                %error,
                failures,
                "request queue client: connection failed, retrying"
            );
        }
        tokio::select! {
            _ = shutdown.wait_for(|shutdown| *shutdown) => false,
            _ = time::sleep(self.retry_wait) => true,
        }
    }
}

/// The state owned by the receive task of a connection.
struct Receiver<R> {
    node_id: i64,
    max_retry: Duration,
    sent: Arc<SentRequests<R>>,
    outstanding: Arc<Semaphore>,
    failures: Arc<Mutex<FailureRun>>,
}

impl<R: Request> Receiver<R> {
    /// Reads responses and completes acknowledged requests until the
    /// connection fails or the server reports a failure.
    async fn receive_responses<Rd>(&self, reader: Rd) -> Result<Infallible, RequestQueueError>
    where
        Rd: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        if !with_timeout(self.max_retry, protocol::read_bool(&mut reader)).await? {
            return Err(RequestQueueError::Protocol(
                "server refused the connection".into(),
            ));
        }
        loop {
            self.sent.wait_pending().await;
            let response =
                with_timeout(self.max_retry, protocol::read_response(&mut reader)).await?;
            let Some(sent) = self.sent.pop_front() else {
                return Err(RequestQueueError::Protocol(
                    "response without a request".into(),
                ));
            };
            if let Err(failure) = response {
                debug!(
                    node_id = self.node_id,
                    request_number = sent.request_number,
                    %failure,
                    "request queue client: request failed"
                );
                return Err(failure.into());
            }
            trace!(
                node_id = self.node_id,
                request_number = sent.request_number,
                "request queue client: request acknowledged"
            );
            self.failures.lock().expect("lock poisoned").succeeded();
            self.outstanding.add_permits(1);
            sent.request.completed();
        }
    }
}

fn receive_error(error: Result<RequestQueueError, oneshot::error::RecvError>) -> RequestQueueError {
    error.unwrap_or_else(|_| RequestQueueError::Protocol("receive task exited".into()))
}

/// Bounds the time spent waiting for the server.
async fn with_timeout<T, F>(max_retry: Duration, future: F) -> Result<T, RequestQueueError>
where
    F: Future<Output = Result<T, RequestQueueError>>,
{
    time::timeout(max_retry, future).await.map_err(|_| {
        io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for the server")
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    impl Request for Noop {
        fn write_request(&self, _: &mut BytesMut) {}
        fn completed(self) {}
    }

    fn reporter() -> Arc<dyn FailureReporter> {
        Arc::new(|_: RequestQueueError| {})
    }

    fn client(
        node_id: i64,
        max_retry: Duration,
        retry_wait: Duration,
        queue_size: usize,
    ) -> Result<RequestQueueClient<Noop>, RequestQueueError> {
        RequestQueueClient::new(
            node_id,
            Arc::new(TcpSocketFactory::new("localhost", 1)),
            reporter(),
            max_retry,
            retry_wait,
            queue_size,
        )
    }

    #[tokio::test]
    async fn invalid_arguments() {
        let ms = Duration::from_millis(1);
        assert!(matches!(
            client(-1, ms, ms, 1),
            Err(RequestQueueError::InvalidArgument(_))
        ));
        assert!(client(1, Duration::ZERO, ms, 1).is_err());
        assert!(client(1, ms, Duration::ZERO, 1).is_err());
        assert!(client(1, ms, ms, 0).is_err());
        assert!(client(1, ms, ms, MAX_OUTSTANDING + 1).is_err());

        let client = client(1, Duration::from_secs(60), ms, MAX_OUTSTANDING).unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn add_after_shutdown() {
        let ms = Duration::from_millis(1);
        let client = client(1, Duration::from_secs(60), ms, 1).unwrap();
        assert!(!client.is_shutdown());
        client.shutdown().await;
        assert!(client.is_shutdown());
        assert!(matches!(
            client.add_request(Noop).await,
            Err(RequestQueueError::ShuttingDown)
        ));
        // A second shutdown is harmless.
        client.shutdown().await;
    }

    #[tokio::test]
    async fn sent_requests_wait() {
        let sent = Arc::new(SentRequests::new());
        let waiter = {
            let sent = Arc::clone(&sent);
            tokio::spawn(async move { sent.wait_pending().await })
        };
        sent.push_back(SentRequest {
            request_number: 3,
            request: Noop,
        });
        waiter.await.unwrap();
        let taken = sent.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].request_number, 3);
        assert!(sent.pop_front().is_none());
    }
}
