// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Accepts request queue connections and hands each one to the server for
//! the node that opened it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::FailureReporter;
use crate::error::RequestQueueError;
use crate::protocol;
use crate::retry::{FailureRun, INFO_MIN_RETRIES, check_retry_settings};
use crate::server::NodeServer;

/// Finds the server for the node named in a connection handshake.
pub trait ServerDispatcher: Send + Sync + 'static {
    fn get_server(&self, node_id: i64) -> Result<Arc<dyn NodeServer>, RequestQueueError>;
}

/// Listens for connections from request queue clients.
#[derive(Debug)]
pub struct RequestQueueListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueListener {
    /// Starts accepting connections on `listener`.
    ///
    /// Failures accepting connections or reading their handshakes are retried
    /// until they have continued for longer than `max_retry`, waiting
    /// `retry_wait` after each failed accept. The listener then stops and
    /// reports the failure. Must be called from within a Tokio runtime.
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<dyn ServerDispatcher>,
        failure_reporter: Arc<dyn FailureReporter>,
        max_retry: Duration,
        retry_wait: Duration,
    ) -> Result<Self, RequestQueueError> {
        check_retry_settings(max_retry, retry_wait)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = Acceptor {
            listener,
            dispatcher,
            failure_reporter,
            retry_wait,
            failures: FailureRun::new(max_retry),
        };
        let task = tokio::spawn(acceptor.run(shutdown_rx));
        debug!(%local_addr, ?max_retry, ?retry_wait, "request queue listener: created");
        Ok(RequestQueueListener {
            local_addr,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the listening socket.
    /// Connections already handed to servers are left to them.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(error) = task.await {
                warn!(%error, "request queue listener: accept task failed");
            }
        }
    }
}

impl Drop for RequestQueueListener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Acceptor {
    listener: TcpListener,
    dispatcher: Arc<dyn ServerDispatcher>,
    failure_reporter: Arc<dyn FailureReporter>,
    retry_wait: Duration,
    failures: FailureRun,
}

impl Acceptor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // Handshakes in progress. Dropping the set aborts them.
        let mut handshakes = JoinSet::new();
        loop {
            let (error, accept_failed) = tokio::select! {
                biased;
                _ = shutdown.wait_for(|shutdown| *shutdown) => break,
                Some(result) = handshakes.join_next() => match result {
                    Ok(Ok(())) => {
                        self.failures.succeeded();
                        continue;
                    }
                    Ok(Err(error)) => (error, false),
                    Err(error) => (
                        RequestQueueError::Protocol(format!("handshake task failed: {error}")),
                        false,
                    ),
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "request queue listener: accepted connection");
                        handshakes.spawn(handshake(stream, peer, Arc::clone(&self.dispatcher)));
                        continue;
                    }
                    Err(error) => (RequestQueueError::from(error), true),
                },
            };
            let failures = self.failures.failures() + 1;
            if self.failures.failed(Instant::now()) {
                warn!(%error, failures, "request queue listener: shutting down due to failure");
                self.failure_reporter.report_failure(error);
                break;
            }
            if failures >= INFO_MIN_RETRIES {
                info!(%error, failures, "request queue listener: connection failed");
            } else {
                debug!(%error, failures, "request queue listener: connection failed");
            }
            if accept_failed {
                tokio::select! {
                    _ = shutdown.wait_for(|shutdown| *shutdown) => break,
                    _ = time::sleep(self.retry_wait) => {}
                }
            }
        }
        debug!("request queue listener: shut down");
    }
}

/// Reads the node ID that opens a connection and passes the connection to
/// that node's server.
async fn handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<dyn ServerDispatcher>,
) -> Result<(), RequestQueueError> {
    stream.set_nodelay(true)?;
    let node_id = protocol::read_node_id(&mut stream).await.map_err(|error| match error {
        RequestQueueError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            RequestQueueError::Protocol(format!("connection from {peer} closed before handshake"))
        }
        error => error,
    })?;
    let server = dispatcher.get_server(node_id)?;
    debug!(node_id, %peer, "request queue listener: dispatching connection");
    server.handle_connection(Box::new(stream)).await;
    Ok(())
}
