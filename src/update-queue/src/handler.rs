// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The data server side of the update queue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cds_request_queue::RequestHandler;
use cds_request_queue::error::{RequestFailure, RequestQueueError};
use cds_request_queue::listener::ServerDispatcher;
use cds_request_queue::server::{NodeServer, RequestQueueServer};
use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

use crate::error::CacheConsistencyError;
use crate::request::{Commit, Update, read_update};

/// The data server operations that nodes' updates perform.
pub trait UpdateQueueServer: Send + Sync + 'static {
    /// Applies the changes of a committed transaction.
    fn commit(&self, node_id: i64, commit: &Commit) -> Result<(), CacheConsistencyError>;

    fn evict_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError>;

    fn downgrade_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError>;

    fn evict_binding(&self, node_id: i64, name: Option<&str>)
    -> Result<(), CacheConsistencyError>;

    fn downgrade_binding(
        &self,
        node_id: i64,
        name: Option<&str>,
    ) -> Result<(), CacheConsistencyError>;
}

/// Performs one node's updates on the data server.
pub struct UpdateQueueRequestHandler {
    server: Arc<dyn UpdateQueueServer>,
    node_id: i64,
}

impl UpdateQueueRequestHandler {
    pub fn new(server: Arc<dyn UpdateQueueServer>, node_id: i64) -> Self {
        UpdateQueueRequestHandler { server, node_id }
    }
}

impl fmt::Debug for UpdateQueueRequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateQueueRequestHandler")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for UpdateQueueRequestHandler {
    type Request = Update;

    async fn read_request(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Update, RequestQueueError> {
        read_update(reader).await
    }

    async fn perform_request(&self, update: Update) -> Result<(), RequestFailure> {
        let server = Arc::clone(&self.server);
        let node_id = self.node_id;
        // Data server operations may block.
        tokio::task::spawn_blocking(move || update.apply(&*server, node_id))
            .await
            .map_err(|e| RequestFailure::new("internal", Some(e.to_string())))?
            .map_err(RequestFailure::from)
    }
}

/// Logs every operation before passing it on.
#[derive(Debug)]
pub struct LoggingUpdateQueueServer<S> {
    inner: S,
}

impl<S: UpdateQueueServer> LoggingUpdateQueueServer<S> {
    pub fn new(inner: S) -> Self {
        LoggingUpdateQueueServer { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn log(
        operation: &str,
        node_id: i64,
        result: Result<(), CacheConsistencyError>,
    ) -> Result<(), CacheConsistencyError> {
        if let Err(error) = &result {
            warn!(node_id, operation, %error, "update queue server: operation failed");
        }
        result
    }
}

impl<S: UpdateQueueServer> UpdateQueueServer for LoggingUpdateQueueServer<S> {
    fn commit(&self, node_id: i64, commit: &Commit) -> Result<(), CacheConsistencyError> {
        debug!(
            node_id,
            oids = commit.oids().len(),
            new_oids = commit.new_oids(),
            names = commit.names().len(),
            "update queue server: commit"
        );
        Self::log("commit", node_id, self.inner.commit(node_id, commit))
    }

    fn evict_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError> {
        debug!(node_id, oid, "update queue server: evict object");
        Self::log("evict_object", node_id, self.inner.evict_object(node_id, oid))
    }

    fn downgrade_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError> {
        debug!(node_id, oid, "update queue server: downgrade object");
        Self::log(
            "downgrade_object",
            node_id,
            self.inner.downgrade_object(node_id, oid),
        )
    }

    fn evict_binding(
        &self,
        node_id: i64,
        name: Option<&str>,
    ) -> Result<(), CacheConsistencyError> {
        debug!(node_id, ?name, "update queue server: evict binding");
        Self::log(
            "evict_binding",
            node_id,
            self.inner.evict_binding(node_id, name),
        )
    }

    fn downgrade_binding(
        &self,
        node_id: i64,
        name: Option<&str>,
    ) -> Result<(), CacheConsistencyError> {
        debug!(node_id, ?name, "update queue server: downgrade binding");
        Self::log(
            "downgrade_binding",
            node_id,
            self.inner.downgrade_binding(node_id, name),
        )
    }
}

type NodeQueueServer = RequestQueueServer<UpdateQueueRequestHandler>;

/// Routes each node's connections to that node's request queue server.
pub struct UpdateQueueDispatcher {
    server: Arc<dyn UpdateQueueServer>,
    nodes: Mutex<BTreeMap<i64, Arc<NodeQueueServer>>>,
}

impl UpdateQueueDispatcher {
    pub fn new(server: Arc<dyn UpdateQueueServer>) -> Self {
        UpdateQueueDispatcher {
            server,
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Accepts connections from a node, creating its request queue server if
    /// the node is not already registered.
    pub fn register_node(&self, node_id: i64) -> Result<Arc<NodeQueueServer>, RequestQueueError> {
        let mut nodes = self.nodes.lock().expect("lock poisoned");
        if let Some(server) = nodes.get(&node_id) {
            return Ok(Arc::clone(server));
        }
        let handler = UpdateQueueRequestHandler::new(Arc::clone(&self.server), node_id);
        let server = Arc::new(RequestQueueServer::new(node_id, handler)?);
        nodes.insert(node_id, Arc::clone(&server));
        debug!(node_id, "update queue dispatcher: registered node");
        Ok(server)
    }

    /// Stops accepting connections from a node and disconnects it.
    pub async fn unregister_node(&self, node_id: i64) -> bool {
        let server = self.nodes.lock().expect("lock poisoned").remove(&node_id);
        match server {
            Some(server) => {
                server.disconnect().await;
                debug!(node_id, "update queue dispatcher: unregistered node");
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for UpdateQueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        f.debug_struct("UpdateQueueDispatcher")
            .field("nodes", &nodes)
            .finish_non_exhaustive()
    }
}

impl ServerDispatcher for UpdateQueueDispatcher {
    fn get_server(&self, node_id: i64) -> Result<Arc<dyn NodeServer>, RequestQueueError> {
        let nodes = self.nodes.lock().expect("lock poisoned");
        match nodes.get(&node_id) {
            Some(server) => {
                trace!(node_id, "update queue dispatcher: found node");
                let server: Arc<dyn NodeServer> = Arc::<NodeQueueServer>::clone(server);
                Ok(server)
            }
            None => Err(RequestQueueError::Protocol(format!(
                "unknown node: {node_id}"
            ))),
        }
    }
}
