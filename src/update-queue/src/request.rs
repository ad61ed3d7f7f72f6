// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The updates a node sends to the data server, and their encoding.
//!
//! Each update starts with a one-byte tag:
//!
//! ```text
//! 1 commit:            (u32) n, n x (i64) oid, n x (bytes) value,
//!                      (u32) new oids, (u32) m, m x (string) name,
//!                      m x (i64) name value, -1 if the binding was removed
//! 2 evict object:      (i64) oid
//! 3 downgrade object:  (i64) oid
//! 4 evict binding:     (string) name
//! 5 downgrade binding: (string) name
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};
use cds_request_queue::Request;
use cds_request_queue::error::RequestQueueError;
use cds_request_queue::protocol::{self, MAX_ENTRIES, MAX_LENGTH};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CacheConsistencyError;
use crate::handler::UpdateQueueServer;

const COMMIT: u8 = 1;
const EVICT_OBJECT: u8 = 2;
const DOWNGRADE_OBJECT: u8 = 3;
const EVICT_BINDING: u8 = 4;
const DOWNGRADE_BINDING: u8 = 5;

/// The largest object ID or binding value, which must fit in an `i64` on the
/// wire.
pub const MAX_ID: u64 = i64::MAX.unsigned_abs();

/// The changes made by a committed transaction.
///
/// The first `new_oids` of the object IDs name objects the transaction
/// created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    oids: Vec<u64>,
    oid_values: Vec<Option<Vec<u8>>>,
    new_oids: usize,
    names: Vec<String>,
    name_values: Vec<Option<u64>>,
}

impl Commit {
    /// Creates a commit.
    ///
    /// An absent object value means the object was removed, and an absent
    /// name value that the binding was removed.
    pub fn new(
        oids: Vec<u64>,
        oid_values: Vec<Option<Vec<u8>>>,
        new_oids: usize,
        names: Vec<String>,
        name_values: Vec<Option<u64>>,
    ) -> Result<Self, String> {
        let commit = Commit {
            oids,
            oid_values,
            new_oids,
            names,
            name_values,
        };
        commit.check()?;
        Ok(commit)
    }

    fn check(&self) -> Result<(), String> {
        if self.oid_values.len() != self.oids.len() {
            return Err(format!(
                "{} object values for {} object IDs",
                self.oid_values.len(),
                self.oids.len()
            ));
        }
        if self.new_oids > self.oids.len() {
            return Err(format!(
                "{} new objects out of {}",
                self.new_oids,
                self.oids.len()
            ));
        }
        if self.name_values.len() != self.names.len() {
            return Err(format!(
                "{} name values for {} names",
                self.name_values.len(),
                self.names.len()
            ));
        }
        if self.oids.len() > MAX_ENTRIES || self.names.len() > MAX_ENTRIES {
            return Err("too many entries".into());
        }
        if let Some(oid) = self.oids.iter().find(|oid| **oid > MAX_ID) {
            return Err(format!("object ID too large: {oid}"));
        }
        if let Some(value) = self.name_values.iter().flatten().find(|v| **v > MAX_ID) {
            return Err(format!("name value too large: {value}"));
        }
        if self
            .oid_values
            .iter()
            .flatten()
            .any(|value| value.len() > MAX_LENGTH)
        {
            return Err("object value too large".into());
        }
        if self.names.iter().any(|name| name.len() > MAX_LENGTH) {
            return Err("name too long".into());
        }
        Ok(())
    }

    pub fn oids(&self) -> &[u64] {
        &self.oids
    }

    pub fn oid_values(&self) -> &[Option<Vec<u8>>] {
        &self.oid_values
    }

    pub fn new_oids(&self) -> usize {
        self.new_oids
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name_values(&self) -> &[Option<u64>] {
        &self.name_values
    }

    /// Object IDs paired with their new values.
    pub fn objects(&self) -> impl Iterator<Item = (u64, Option<&[u8]>)> {
        self.oids
            .iter()
            .copied()
            .zip(self.oid_values.iter().map(|value| value.as_deref()))
    }

    /// Names paired with their new values.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, Option<u64>)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.name_values.iter().copied())
    }
}

/// An update sent from a node to the data server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Commit(Commit),
    /// The node no longer caches the object.
    EvictObject { oid: u64 },
    /// The node now caches the object for reading only.
    DowngradeObject { oid: u64 },
    /// The node no longer caches the binding. An absent name refers to the
    /// position after the last bound name.
    EvictBinding { name: Option<String> },
    /// The node now caches the binding for reading only.
    DowngradeBinding { name: Option<String> },
}

impl Update {
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Update::Commit(commit) => {
                buf.put_u8(COMMIT);
                protocol::put_len(buf, commit.oids.len());
                for oid in &commit.oids {
                    put_id(buf, *oid);
                }
                for value in &commit.oid_values {
                    protocol::put_bytes(buf, value.as_deref());
                }
                protocol::put_len(buf, commit.new_oids);
                protocol::put_len(buf, commit.names.len());
                for name in &commit.names {
                    protocol::put_string(buf, Some(name));
                }
                for value in &commit.name_values {
                    match value {
                        Some(value) => put_id(buf, *value),
                        None => buf.put_i64(-1),
                    }
                }
            }
            Update::EvictObject { oid } => {
                buf.put_u8(EVICT_OBJECT);
                put_id(buf, *oid);
            }
            Update::DowngradeObject { oid } => {
                buf.put_u8(DOWNGRADE_OBJECT);
                put_id(buf, *oid);
            }
            Update::EvictBinding { name } => {
                buf.put_u8(EVICT_BINDING);
                protocol::put_string(buf, name.as_deref());
            }
            Update::DowngradeBinding { name } => {
                buf.put_u8(DOWNGRADE_BINDING);
                protocol::put_string(buf, name.as_deref());
            }
        }
    }

    /// Applies the update to the data server on behalf of a node.
    pub fn apply(
        &self,
        server: &dyn UpdateQueueServer,
        node_id: i64,
    ) -> Result<(), CacheConsistencyError> {
        match self {
            Update::Commit(commit) => server.commit(node_id, commit),
            Update::EvictObject { oid } => server.evict_object(node_id, *oid),
            Update::DowngradeObject { oid } => server.downgrade_object(node_id, *oid),
            Update::EvictBinding { name } => server.evict_binding(node_id, name.as_deref()),
            Update::DowngradeBinding { name } => {
                server.downgrade_binding(node_id, name.as_deref())
            }
        }
    }
}

/// Reads an update written by [`Update::write`].
pub async fn read_update<R>(reader: &mut R) -> Result<Update, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let update = match reader.read_u8().await? {
        COMMIT => {
            let count = protocol::read_count(reader).await?;
            let mut oids = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                oids.push(read_id(reader).await?);
            }
            let mut oid_values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                oid_values.push(protocol::read_bytes(reader).await?);
            }
            let new_oids = protocol::read_count(reader).await?;
            let count = protocol::read_count(reader).await?;
            let mut names = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let Some(name) = protocol::read_string(reader).await? else {
                    return Err(RequestQueueError::Protocol("absent binding name".into()));
                };
                names.push(name);
            }
            let mut name_values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let value = match reader.read_i64().await? {
                    -1 => None,
                    value => Some(u64::try_from(value).map_err(|_| {
                        RequestQueueError::Protocol(format!("invalid name value: {value}"))
                    })?),
                };
                name_values.push(value);
            }
            let commit = Commit::new(oids, oid_values, new_oids, names, name_values)
                .map_err(|e| RequestQueueError::Protocol(format!("invalid commit: {e}")))?;
            Update::Commit(commit)
        }
        EVICT_OBJECT => Update::EvictObject {
            oid: read_id(reader).await?,
        },
        DOWNGRADE_OBJECT => Update::DowngradeObject {
            oid: read_id(reader).await?,
        },
        EVICT_BINDING => Update::EvictBinding {
            name: protocol::read_string(reader).await?,
        },
        DOWNGRADE_BINDING => Update::DowngradeBinding {
            name: protocol::read_string(reader).await?,
        },
        tag => {
            return Err(RequestQueueError::Protocol(format!(
                "unknown update tag: {tag}"
            )));
        }
    };
    Ok(update)
}

fn put_id(buf: &mut BytesMut, id: u64) {
    buf.put_i64(i64::try_from(id).expect("IDs are checked before encoding"));
}

async fn read_id<R>(reader: &mut R) -> Result<u64, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let id = reader.read_i64().await?;
    u64::try_from(id).map_err(|_| RequestQueueError::Protocol(format!("negative ID: {id}")))
}

/// Notified once the data server has acknowledged an update.
pub trait CompletionHandler: Send + 'static {
    fn completed(self: Box<Self>);
}

impl<F> CompletionHandler for F
where
    F: FnOnce() + Send + 'static,
{
    fn completed(self: Box<Self>) {
        (*self)()
    }
}

/// An update together with the handler to notify when it is acknowledged.
pub struct UpdateQueueRequest {
    update: Update,
    completion: Option<Box<dyn CompletionHandler>>,
}

impl UpdateQueueRequest {
    pub fn new(update: Update, completion: Option<Box<dyn CompletionHandler>>) -> Self {
        UpdateQueueRequest { update, completion }
    }

    pub fn update(&self) -> &Update {
        &self.update
    }
}

impl fmt::Debug for UpdateQueueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateQueueRequest")
            .field("update", &self.update)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl Request for UpdateQueueRequest {
    fn write_request(&self, buf: &mut BytesMut) {
        self.update.write(buf);
    }

    fn completed(self) {
        if let Some(completion) = self.completion {
            completion.completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use proptest::prelude::*;

    use super::*;

    fn arb_name() -> impl Strategy<Value = String> {
        proptest::collection::vec(any::<char>(), 0..8).prop_map(String::from_iter)
    }

    fn arb_commit() -> impl Strategy<Value = Commit> {
        let objects = proptest::collection::vec(
            (
                0..=MAX_ID,
                proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16)),
            ),
            0..8,
        );
        let bindings =
            proptest::collection::vec((arb_name(), proptest::option::of(0..=MAX_ID)), 0..8);
        (objects, bindings, any::<proptest::sample::Index>()).prop_map(
            |(objects, bindings, new_oids)| {
                let new_oids = new_oids.index(objects.len() + 1);
                let (oids, oid_values) = objects.into_iter().unzip();
                let (names, name_values) = bindings.into_iter().unzip();
                Commit::new(oids, oid_values, new_oids, names, name_values).unwrap()
            },
        )
    }

    fn arb_update() -> impl Strategy<Value = Update> {
        prop_oneof![
            arb_commit().prop_map(Update::Commit),
            (0..=MAX_ID).prop_map(|oid| Update::EvictObject { oid }),
            (0..=MAX_ID).prop_map(|oid| Update::DowngradeObject { oid }),
            proptest::option::of(arb_name()).prop_map(|name| Update::EvictBinding { name }),
            proptest::option::of(arb_name()).prop_map(|name| Update::DowngradeBinding { name }),
        ]
    }

    proptest! {
        #[test]
        fn update_roundtrip(updates in proptest::collection::vec(arb_update(), 1..4)) {
            let mut buf = BytesMut::new();
            for update in &updates {
                update.write(&mut buf);
            }
            let mut reader = &buf[..];
            for update in &updates {
                prop_assert_eq!(&block_on(read_update(&mut reader)).unwrap(), update);
            }
            prop_assert!(reader.is_empty());
        }
    }

    #[test]
    fn invalid_commits() {
        assert!(Commit::new(vec![1], vec![], 0, vec![], vec![]).is_err());
        assert!(Commit::new(vec![1], vec![None], 2, vec![], vec![]).is_err());
        assert!(Commit::new(vec![], vec![], 0, vec!["a".into()], vec![]).is_err());
        assert!(Commit::new(vec![MAX_ID + 1], vec![None], 0, vec![], vec![]).is_err());
        assert!(Commit::new(vec![], vec![], 0, vec!["a".into()], vec![Some(u64::MAX)]).is_err());
        assert!(Commit::new(vec![1], vec![Some(vec![1])], 1, vec!["a".into()], vec![None]).is_ok());
    }

    #[test]
    fn commit_layout() {
        let commit = Commit::new(
            vec![10],
            vec![Some(vec![1, 2, 3])],
            1,
            vec!["a".into()],
            vec![None],
        )
        .unwrap();
        let mut buf = BytesMut::new();
        Update::Commit(commit).write(&mut buf);
        let expected: &[u8] = &[
            1, // tag
            0, 0, 0, 1, // oid count
            0, 0, 0, 0, 0, 0, 0, 10, // oid
            0, 0, 0, 3, 1, 2, 3, // value
            0, 0, 0, 1, // new oids
            0, 0, 0, 1, // name count
            1, 0, 0, 0, 1, b'a', // name
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // removed binding
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn invalid_encodings() {
        let mut reader: &[u8] = &[9];
        assert!(matches!(
            block_on(read_update(&mut reader)),
            Err(RequestQueueError::Protocol(_))
        ));

        let mut reader: &[u8] = &[EVICT_OBJECT, 0xff, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            block_on(read_update(&mut reader)),
            Err(RequestQueueError::Protocol(_))
        ));

        let mut reader: &[u8] = &[DOWNGRADE_OBJECT, 0, 0];
        assert!(matches!(
            block_on(read_update(&mut reader)),
            Err(RequestQueueError::Io(_))
        ));

        // Five new objects out of none.
        let mut reader: &[u8] = &[COMMIT, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, 0];
        assert!(matches!(
            block_on(read_update(&mut reader)),
            Err(RequestQueueError::Protocol(_))
        ));
    }

    #[test]
    fn completion() {
        let (tx, rx) = std::sync::mpsc::channel();
        let request = UpdateQueueRequest::new(
            Update::EvictObject { oid: 4 },
            Some(Box::new(move || tx.send(()).unwrap())),
        );
        assert!(format!("{request:?}").contains("EvictObject"));
        request.completed();
        rx.try_recv().unwrap();
    }
}
