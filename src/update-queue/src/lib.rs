// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Propagates a caching node's committed changes, evictions and downgrades
//! to the data server.
//!
//! On a node, the [`queue::UpdateQueue`] releases each transaction's updates
//! to a request queue once all transactions that began before it have
//! finished, and bounds the number of commits that may be outstanding. On the
//! data server, the [`handler::UpdateQueueDispatcher`] hands each node's
//! connection to a request queue server that applies the node's updates to an
//! [`handler::UpdateQueueServer`].

pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod queue;
pub mod request;
