// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The update queue, which sends a node's updates to the data server in
//! transaction order.
//!
//! Every transaction is registered when it begins and stays pending until it
//! and every transaction that began before it have finished. A transaction's
//! commit, and any evictions or downgrades requested on its behalf while it
//! is pending, are held back until then and sent together: the commit first,
//! then the other updates in the order they were requested. The data server
//! performs updates in the order it receives them, so this keeps a later
//! transaction's changes from overtaking an earlier one's.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use cds_request_queue::FailureReporter;
use cds_request_queue::client::{RequestQueueClient, SocketFactory, TcpSocketFactory};
use cds_request_queue::protocol::MAX_LENGTH;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::config::UpdateQueueConfig;
use crate::error::UpdateQueueError;
use crate::request::{Commit, CompletionHandler, Update, UpdateQueueRequest};

/// The transport queue holds this many requests for every commit slot, to
/// leave room for evictions and downgrades.
pub const REQUEST_QUEUE_PROPORTION: usize = 2;

/// Identifies a transaction. Assigned in increasing order as transactions
/// begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Larger than any assigned context ID.
    pub const MAX: ContextId = ContextId(u64::MAX);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct PendingTxn {
    finished: bool,
    commit: Option<UpdateQueueRequest>,
    /// Evictions and downgrades requested while the transaction was pending.
    requests: Vec<UpdateQueueRequest>,
}

#[derive(Debug)]
struct PendingSubmit {
    next_context_id: u64,
    txns: BTreeMap<ContextId, PendingTxn>,
}

impl PendingSubmit {
    /// Removes the finished transactions that no unfinished transaction
    /// precedes, returning their requests in submission order.
    fn drain_finished(&mut self) -> Vec<(ContextId, UpdateQueueRequest)> {
        let mut batch = Vec::new();
        while let Some(entry) = self.txns.first_entry() {
            if !entry.get().finished {
                break;
            }
            let (context_id, txn) = entry.remove_entry();
            batch.extend(txn.commit.into_iter().map(|commit| (context_id, commit)));
            batch.extend(txn.requests.into_iter().map(|request| (context_id, request)));
        }
        batch
    }
}

/// Sends a node's committed changes, evictions and downgrades to the data
/// server.
#[derive(Debug)]
pub struct UpdateQueue {
    submitter: Arc<Submitter>,
    /// One permit per commit that may be outstanding.
    commit_available: Arc<Semaphore>,
    /// Transactions whose commits have not been acknowledged.
    pending_acknowledge: Arc<Mutex<BTreeSet<ContextId>>>,
}

/// The state shared with the tasks that submit requests to the transport.
#[derive(Debug)]
struct Submitter {
    client: RequestQueueClient<UpdateQueueRequest>,
    pending: Mutex<PendingSubmit>,
    /// Held while submitting requests to the transport, so that requests
    /// reach it in the order they were released.
    submit: Arc<tokio::sync::Mutex<()>>,
}

impl Submitter {
    /// Submits the requests of every transaction that is no longer preceded
    /// by an unfinished one.
    async fn submit_finished(&self) -> Result<(), UpdateQueueError> {
        let _submit = self.submit.lock().await;
        let batch = self
            .pending
            .lock()
            .expect("lock poisoned")
            .drain_finished();
        for (context_id, request) in batch {
            trace!(%context_id, update = ?request.update(), "update queue: submitting");
            self.client.add_request(request).await?;
        }
        Ok(())
    }

    /// Holds the request back if its transaction is pending, and submits it
    /// otherwise. The caller holds the submit lock.
    async fn hold_or_submit(
        &self,
        context_id: ContextId,
        request: UpdateQueueRequest,
    ) -> Result<(), UpdateQueueError> {
        let request = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            match pending.txns.get_mut(&context_id) {
                Some(txn) => {
                    trace!(
                        %context_id,
                        update = ?request.update(),
                        "update queue: holding request"
                    );
                    txn.requests.push(request);
                    None
                }
                None => Some(request),
            }
        };
        if let Some(request) = request {
            trace!(%context_id, update = ?request.update(), "update queue: submitting");
            self.client.add_request(request).await?;
        }
        Ok(())
    }
}

impl UpdateQueue {
    /// Creates an update queue that connects to the data server over TCP.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &UpdateQueueConfig,
        failure_reporter: Arc<dyn FailureReporter>,
    ) -> Result<Self, UpdateQueueError> {
        let factory = TcpSocketFactory::new(config.server_host.clone(), config.server_port);
        Self::with_socket_factory(config, Arc::new(factory), failure_reporter)
    }

    /// Creates an update queue that makes its connections with
    /// `socket_factory`, ignoring the configured host and port.
    pub fn with_socket_factory(
        config: &UpdateQueueConfig,
        socket_factory: Arc<dyn SocketFactory>,
        failure_reporter: Arc<dyn FailureReporter>,
    ) -> Result<Self, UpdateQueueError> {
        config.validate()?;
        let client = RequestQueueClient::new(
            config.node_id,
            socket_factory,
            failure_reporter,
            config.max_retry,
            config.retry_wait,
            REQUEST_QUEUE_PROPORTION * config.update_queue_size,
        )?;
        debug!(
            node_id = config.node_id,
            update_queue_size = config.update_queue_size,
            "update queue: created"
        );
        let submitter = Submitter {
            client,
            pending: Mutex::new(PendingSubmit {
                next_context_id: 1,
                txns: BTreeMap::new(),
            }),
            submit: Arc::new(tokio::sync::Mutex::new(())),
        };
        Ok(UpdateQueue {
            submitter: Arc::new(submitter),
            commit_available: Arc::new(Semaphore::new(config.update_queue_size)),
            pending_acknowledge: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Registers a new transaction and returns its context ID.
    pub fn begin_txn(&self) -> ContextId {
        let mut pending = self.submitter.pending.lock().expect("lock poisoned");
        let context_id = ContextId(pending.next_context_id);
        pending.next_context_id += 1;
        pending.txns.insert(context_id, PendingTxn::default());
        trace!(%context_id, "update queue: began transaction");
        context_id
    }

    /// Waits for a commit slot, giving up at `deadline`.
    ///
    /// Fails with [`UpdateQueueError::Timeout`] if the deadline has already
    /// passed, [`UpdateQueueError::ResourceUnavailable`] if no slot frees up
    /// in time, and [`UpdateQueueError::Interrupted`] if the queue shuts down.
    pub async fn prepare(&self, deadline: Instant) -> Result<(), UpdateQueueError> {
        if deadline < Instant::now() {
            return Err(UpdateQueueError::Timeout);
        }
        match time::timeout_at(deadline, self.commit_available.acquire()).await {
            Err(_) => Err(UpdateQueueError::ResourceUnavailable),
            Ok(Err(_)) => Err(UpdateQueueError::Interrupted),
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
        }
    }

    /// Commits a prepared transaction.
    ///
    /// The commit is sent once every transaction that began earlier has
    /// finished. Its acknowledgement frees the commit slot taken by
    /// [`UpdateQueue::prepare`].
    pub async fn commit(
        &self,
        context_id: ContextId,
        oids: Vec<u64>,
        oid_values: Vec<Option<Vec<u8>>>,
        new_oids: usize,
        names: Vec<String>,
        name_values: Vec<Option<u64>>,
    ) -> Result<(), UpdateQueueError> {
        let commit = Commit::new(oids, oid_values, new_oids, names, name_values)
            .map_err(UpdateQueueError::InvalidArgument)?;
        let pending_acknowledge = Arc::clone(&self.pending_acknowledge);
        let commit_available = Arc::clone(&self.commit_available);
        let completion = move || {
            trace!(%context_id, "update queue: commit acknowledged");
            pending_acknowledge
                .lock()
                .expect("lock poisoned")
                .remove(&context_id);
            commit_available.add_permits(1);
        };
        let request = UpdateQueueRequest::new(Update::Commit(commit), Some(Box::new(completion)));
        self.txn_finished(context_id, Some(request))?;
        self.submit_finished().await
    }

    /// Aborts a transaction, freeing its commit slot if it was prepared.
    pub async fn abort(
        &self,
        context_id: ContextId,
        prepared: bool,
    ) -> Result<(), UpdateQueueError> {
        self.txn_finished(context_id, None)?;
        if prepared {
            self.commit_available.add_permits(1);
        }
        self.submit_finished().await
    }

    /// Notes that the node no longer caches an object.
    pub async fn evict_object(
        &self,
        context_id: ContextId,
        oid: u64,
        completion: impl CompletionHandler,
    ) -> Result<(), UpdateQueueError> {
        self.add_request(context_id, Update::EvictObject { oid }, completion)
            .await
    }

    /// Notes that the node now caches an object for reading only.
    pub async fn downgrade_object(
        &self,
        context_id: ContextId,
        oid: u64,
        completion: impl CompletionHandler,
    ) -> Result<(), UpdateQueueError> {
        self.add_request(context_id, Update::DowngradeObject { oid }, completion)
            .await
    }

    /// Notes that the node no longer caches a name binding.
    pub async fn evict_binding(
        &self,
        context_id: ContextId,
        name: Option<String>,
        completion: impl CompletionHandler,
    ) -> Result<(), UpdateQueueError> {
        check_name(name.as_deref())?;
        self.add_request(context_id, Update::EvictBinding { name }, completion)
            .await
    }

    /// Notes that the node now caches a name binding for reading only.
    pub async fn downgrade_binding(
        &self,
        context_id: ContextId,
        name: Option<String>,
        completion: impl CompletionHandler,
    ) -> Result<(), UpdateQueueError> {
        check_name(name.as_deref())?;
        self.add_request(context_id, Update::DowngradeBinding { name }, completion)
            .await
    }

    /// The lowest context ID of a transaction that is still pending or whose
    /// commit has not been acknowledged, or [`ContextId::MAX`] if there is
    /// none.
    pub fn lowest_pending_context_id(&self) -> ContextId {
        let pending = self
            .submitter
            .pending
            .lock()
            .expect("lock poisoned")
            .txns
            .keys()
            .next()
            .copied();
        let unacknowledged = self
            .pending_acknowledge
            .lock()
            .expect("lock poisoned")
            .first()
            .copied();
        pending
            .into_iter()
            .chain(unacknowledged)
            .min()
            .unwrap_or(ContextId::MAX)
    }

    /// The number of commit slots currently free.
    pub fn available_commit_slots(&self) -> usize {
        self.commit_available.available_permits()
    }

    /// Shuts down the transport. Transactions waiting in
    /// [`UpdateQueue::prepare`] fail with [`UpdateQueueError::Interrupted`].
    pub async fn shutdown(&self) {
        let client = &self.submitter.client;
        client.shutdown().await;
        self.commit_available.close();
        debug!(node_id = client.node_id(), "update queue: shut down");
    }

    /// Marks a transaction finished, storing its commit, if any, to be sent
    /// when the transaction is drained.
    fn txn_finished(
        &self,
        context_id: ContextId,
        commit: Option<UpdateQueueRequest>,
    ) -> Result<(), UpdateQueueError> {
        let mut pending = self.submitter.pending.lock().expect("lock poisoned");
        let txn = pending
            .txns
            .get_mut(&context_id)
            .ok_or(UpdateQueueError::UnknownContext(context_id))?;
        if txn.finished {
            return Err(UpdateQueueError::AlreadyFinished(context_id));
        }
        txn.finished = true;
        if commit.is_some() {
            // Recorded before the transaction leaves the pending map, so the
            // context ID is never missing from both.
            self.pending_acknowledge
                .lock()
                .expect("lock poisoned")
                .insert(context_id);
        }
        txn.commit = commit;
        trace!(%context_id, "update queue: transaction finished");
        Ok(())
    }

    /// Submits the requests of every transaction that is no longer preceded
    /// by an unfinished one.
    ///
    /// Drained requests are held only by the submitting task, which runs to
    /// completion even if this call is dropped.
    async fn submit_finished(&self) -> Result<(), UpdateQueueError> {
        let submitter = Arc::clone(&self.submitter);
        join(tokio::spawn(async move { submitter.submit_finished().await })).await
    }

    async fn add_request(
        &self,
        context_id: ContextId,
        update: Update,
        completion: impl CompletionHandler,
    ) -> Result<(), UpdateQueueError> {
        let request = UpdateQueueRequest::new(update, Some(Box::new(completion)));
        let submit = Arc::clone(&self.submitter.submit).lock_owned().await;
        let submitter = Arc::clone(&self.submitter);
        join(tokio::spawn(async move {
            let _submit = submit;
            submitter.hold_or_submit(context_id, request).await
        }))
        .await
    }
}

/// Rejects names too long to encode.
fn check_name(name: Option<&str>) -> Result<(), UpdateQueueError> {
    match name {
        Some(name) if name.len() > MAX_LENGTH => Err(UpdateQueueError::InvalidArgument(
            format!("name too long: {} bytes", name.len()),
        )),
        _ => Ok(()),
    }
}

/// Waits for a submitting task.
async fn join(task: JoinHandle<Result<(), UpdateQueueError>>) -> Result<(), UpdateQueueError> {
    match task.await {
        Ok(result) => result,
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        // Tasks are only cancelled when the runtime shuts down.
        Err(_) => Err(UpdateQueueError::Interrupted),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use cds_request_queue::Socket;
    use cds_request_queue::error::RequestQueueError;

    use super::*;

    /// Never connects, so nothing submitted is ever acknowledged.
    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl SocketFactory for Unreachable {
        async fn connect(&self) -> io::Result<Box<dyn Socket>> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    fn queue(update_queue_size: usize) -> UpdateQueue {
        let mut config = UpdateQueueConfig::new("localhost", 1, 1);
        config.update_queue_size = update_queue_size;
        config.max_retry = Duration::from_secs(600);
        UpdateQueue::with_socket_factory(
            &config,
            Arc::new(Unreachable),
            Arc::new(|_: RequestQueueError| {}),
        )
        .unwrap()
    }

    fn drained(updates: Vec<(ContextId, UpdateQueueRequest)>) -> Vec<(u64, Update)> {
        updates
            .into_iter()
            .map(|(context_id, request)| (context_id.get(), request.update().clone()))
            .collect()
    }

    #[test]
    fn drain_in_context_order() {
        let mut pending = PendingSubmit {
            next_context_id: 4,
            txns: BTreeMap::new(),
        };
        for id in 1..=3 {
            pending.txns.insert(ContextId(id), PendingTxn::default());
        }
        let evict = |oid| UpdateQueueRequest::new(Update::EvictObject { oid }, None);
        let txn2 = pending.txns.get_mut(&ContextId(2)).unwrap();
        txn2.finished = true;
        txn2.requests.push(evict(20));
        assert!(pending.drain_finished().is_empty());

        let txn1 = pending.txns.get_mut(&ContextId(1)).unwrap();
        txn1.finished = true;
        txn1.commit = Some(UpdateQueueRequest::new(
            Update::Commit(Commit::new(vec![], vec![], 0, vec![], vec![]).unwrap()),
            None,
        ));
        txn1.requests.push(evict(10));
        let batch = drained(pending.drain_finished());
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch[0], (1, Update::Commit(_))));
        assert_eq!(batch[1], (1, Update::EvictObject { oid: 10 }));
        assert_eq!(batch[2], (2, Update::EvictObject { oid: 20 }));
        assert_eq!(
            pending.txns.keys().copied().collect::<Vec<_>>(),
            vec![ContextId(3)]
        );
    }

    #[tokio::test]
    async fn prepare_errors() {
        let queue = queue(1);
        let past = Instant::now() - Duration::from_millis(10);
        assert!(matches!(
            queue.prepare(past).await,
            Err(UpdateQueueError::Timeout)
        ));

        let soon = Instant::now() + Duration::from_millis(10);
        queue.prepare(soon).await.unwrap();
        assert_eq!(queue.available_commit_slots(), 0);
        assert!(matches!(
            queue.prepare(Instant::now() + Duration::from_millis(10)).await,
            Err(UpdateQueueError::ResourceUnavailable)
        ));

        queue.shutdown().await;
        assert!(matches!(
            queue.prepare(Instant::now() + Duration::from_secs(10)).await,
            Err(UpdateQueueError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn context_errors() {
        let queue = queue(1);
        let unknown = ContextId(7);
        assert!(matches!(
            queue.abort(unknown, false).await,
            Err(UpdateQueueError::UnknownContext(id)) if id == unknown
        ));
        let context_id = queue.begin_txn();
        queue.abort(context_id, false).await.unwrap();
        assert!(matches!(
            queue.abort(context_id, false).await,
            Err(UpdateQueueError::UnknownContext(_))
        ));
        assert!(matches!(
            queue
                .commit(queue.begin_txn(), vec![1], vec![], 0, vec![], vec![])
                .await,
            Err(UpdateQueueError::InvalidArgument(_))
        ));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn finish_twice() {
        let queue = queue(1);
        let first = queue.begin_txn();
        let second = queue.begin_txn();
        queue.abort(second, false).await.unwrap();
        assert!(matches!(
            queue.abort(second, false).await,
            Err(UpdateQueueError::AlreadyFinished(id)) if id == second
        ));
        assert_eq!(queue.lowest_pending_context_id(), first);
        queue.abort(first, false).await.unwrap();
        assert_eq!(queue.lowest_pending_context_id(), ContextId::MAX);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn lowest_pending_context_id() {
        let queue = queue(2);
        assert_eq!(queue.lowest_pending_context_id(), ContextId::MAX);
        let first = queue.begin_txn();
        let second = queue.begin_txn();
        assert_eq!(first, ContextId(1));
        assert_eq!(queue.lowest_pending_context_id(), first);

        // The commit is submitted but never acknowledged.
        queue.prepare(Instant::now() + Duration::from_secs(1)).await.unwrap();
        queue
            .commit(first, vec![1], vec![None], 0, vec![], vec![])
            .await
            .unwrap();
        assert_eq!(queue.lowest_pending_context_id(), first);
        queue.abort(second, false).await.unwrap();
        assert_eq!(queue.lowest_pending_context_id(), first);
        assert_eq!(queue.available_commit_slots(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_binding_name() {
        let queue = queue(1);
        let name = "x".repeat(MAX_LENGTH + 1);
        assert!(matches!(
            queue.evict_binding(ContextId::MAX, Some(name.clone()), || {}).await,
            Err(UpdateQueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.downgrade_binding(ContextId::MAX, Some(name), || {}).await,
            Err(UpdateQueueError::InvalidArgument(_))
        ));

        // Nothing reached the transport, which keeps working.
        let longest = "x".repeat(MAX_LENGTH);
        queue
            .evict_binding(ContextId::MAX, Some(longest), || {})
            .await
            .unwrap();
        assert!(!queue.submitter.client.is_shutdown());
        queue.shutdown().await;
    }
}
