// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory data server.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::CacheConsistencyError;
use crate::handler::UpdateQueueServer;
use crate::request::{Commit, Update};

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<u64, Vec<u8>>,
    bindings: BTreeMap<String, u64>,
    /// Every update performed, in order, with the node that sent it, if
    /// recorded.
    history: Option<Vec<(i64, Update)>>,
    /// Nodes whose updates are refused, with the reason.
    failed_nodes: BTreeMap<i64, String>,
}

/// A data server that keeps objects and name bindings in memory.
#[derive(Debug, Default)]
pub struct MemoryUpdateQueueServer {
    state: Mutex<MemoryState>,
}

impl MemoryUpdateQueueServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that also records every update it performs.
    pub fn with_history() -> Self {
        let state = MemoryState {
            history: Some(Vec::new()),
            ..Default::default()
        };
        MemoryUpdateQueueServer {
            state: Mutex::new(state),
        }
    }

    pub fn object(&self, oid: u64) -> Option<Vec<u8>> {
        self.state().objects.get(&oid).cloned()
    }

    pub fn binding(&self, name: &str) -> Option<u64> {
        self.state().bindings.get(name).copied()
    }

    /// The updates performed so far, with the nodes that sent them. Empty
    /// unless the server was created [`with_history`](Self::with_history).
    pub fn history(&self) -> Vec<(i64, Update)> {
        self.state().history.clone().unwrap_or_default()
    }

    /// Refuses all further updates from a node.
    pub fn fail_node(&self, node_id: i64, reason: impl Into<String>) {
        self.state().failed_nodes.insert(node_id, reason.into());
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock poisoned")
    }

    fn record(&self, node_id: i64, update: Update) -> Result<(), CacheConsistencyError> {
        let mut state = self.state();
        check_node(&state, node_id)?;
        if let Some(history) = &mut state.history {
            history.push((node_id, update));
        }
        Ok(())
    }
}

fn check_node(state: &MemoryState, node_id: i64) -> Result<(), CacheConsistencyError> {
    match state.failed_nodes.get(&node_id) {
        Some(reason) => Err(CacheConsistencyError::new(format!(
            "node {node_id} failed: {reason}"
        ))),
        None => Ok(()),
    }
}

impl UpdateQueueServer for MemoryUpdateQueueServer {
    fn commit(&self, node_id: i64, commit: &Commit) -> Result<(), CacheConsistencyError> {
        let mut state = self.state();
        check_node(&state, node_id)?;
        if let Some(oid) = commit.oids()[..commit.new_oids()]
            .iter()
            .find(|oid| state.objects.contains_key(*oid))
        {
            return Err(CacheConsistencyError::new(format!(
                "new object {oid} already exists"
            )));
        }
        for (oid, value) in commit.objects() {
            match value {
                Some(value) => state.objects.insert(oid, value.to_vec()),
                None => state.objects.remove(&oid),
            };
        }
        for (name, value) in commit.bindings() {
            match value {
                Some(value) => state.bindings.insert(name.to_owned(), value),
                None => state.bindings.remove(name),
            };
        }
        if let Some(history) = &mut state.history {
            history.push((node_id, Update::Commit(commit.clone())));
        }
        Ok(())
    }

    fn evict_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError> {
        self.record(node_id, Update::EvictObject { oid })
    }

    fn downgrade_object(&self, node_id: i64, oid: u64) -> Result<(), CacheConsistencyError> {
        self.record(node_id, Update::DowngradeObject { oid })
    }

    fn evict_binding(
        &self,
        node_id: i64,
        name: Option<&str>,
    ) -> Result<(), CacheConsistencyError> {
        let name = name.map(str::to_owned);
        self.record(node_id, Update::EvictBinding { name })
    }

    fn downgrade_binding(
        &self,
        node_id: i64,
        name: Option<&str>,
    ) -> Result<(), CacheConsistencyError> {
        let name = name.map(str::to_owned);
        self.record(node_id, Update::DowngradeBinding { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits() {
        let server = MemoryUpdateQueueServer::with_history();
        let commit = Commit::new(
            vec![1, 2],
            vec![Some(vec![1]), Some(vec![2])],
            2,
            vec!["a".into()],
            vec![Some(1)],
        )
        .unwrap();
        server.commit(1, &commit).unwrap();
        assert_eq!(server.object(1), Some(vec![1]));
        assert_eq!(server.binding("a"), Some(1));

        // Creating object 2 again is inconsistent, and changes nothing.
        let again = Commit::new(vec![2], vec![Some(vec![3])], 1, vec![], vec![]).unwrap();
        assert!(server.commit(1, &again).is_err());
        assert_eq!(server.object(2), Some(vec![2]));

        let remove = Commit::new(vec![2], vec![None], 0, vec!["a".into()], vec![None]).unwrap();
        server.commit(2, &remove).unwrap();
        assert_eq!(server.object(2), None);
        assert_eq!(server.binding("a"), None);
        assert_eq!(server.history().len(), 2);
    }

    #[test]
    fn failed_node() {
        let server = MemoryUpdateQueueServer::with_history();
        server.evict_object(1, 5).unwrap();
        server.fail_node(1, "test");
        assert!(server.downgrade_object(1, 5).is_err());
        server.downgrade_binding(2, Some("x")).unwrap();
        assert_eq!(
            server.history(),
            vec![
                (1, Update::EvictObject { oid: 5 }),
                (
                    2,
                    Update::DowngradeBinding {
                        name: Some("x".into())
                    }
                ),
            ]
        );
    }

    #[test]
    fn no_history_by_default() {
        let server = MemoryUpdateQueueServer::new();
        let commit = Commit::new(vec![1], vec![Some(vec![1])], 1, vec![], vec![]).unwrap();
        server.commit(1, &commit).unwrap();
        server.evict_object(1, 1).unwrap();
        assert_eq!(server.object(1), Some(vec![1]));
        assert!(server.state().history.is_none());
        assert!(server.history().is_empty());
    }
}
