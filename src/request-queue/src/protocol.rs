// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire encoding shared by the client, the server and request types.
//!
//! Values are written into a [`BytesMut`] and read back directly from the
//! connection, so that a request body needs no length prefix of its own.
//! Integers are big-endian. A string is a presence flag followed, if present,
//! by a `u32` byte length and UTF-8 bytes. A byte array is an `i32` length,
//! where `-1` marks an absent array, followed by the bytes.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RequestFailure, RequestQueueError};

/// The largest string or byte array accepted from a peer.
pub const MAX_LENGTH: usize = 64 << 20;

/// The largest number of entries accepted for an encoded collection.
pub const MAX_ENTRIES: usize = 16 << 20;

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a collection length or string length.
///
/// Panics if `len` exceeds [`MAX_ENTRIES`] or [`MAX_LENGTH`], whichever is
/// larger; callers validate lengths before encoding.
pub fn put_len(buf: &mut BytesMut, len: usize) {
    assert!(len <= MAX_LENGTH.max(MAX_ENTRIES), "length too large: {len}");
    buf.put_u32(u32::try_from(len).expect("checked above"));
}

pub fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => put_bool(buf, false),
        Some(s) => {
            put_bool(buf, true);
            put_len(buf, s.len());
            buf.put_slice(s.as_bytes());
        }
    }
}

pub fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_i32(-1),
        Some(bytes) => {
            assert!(bytes.len() <= MAX_LENGTH, "byte array too large");
            buf.put_i32(i32::try_from(bytes.len()).expect("checked above"));
            buf.put_slice(bytes);
        }
    }
}

/// Encodes the server's reply to a request.
pub fn put_response(buf: &mut BytesMut, result: &Result<(), RequestFailure>) {
    match result {
        Ok(()) => put_bool(buf, true),
        Err(failure) => {
            put_bool(buf, false);
            put_string(buf, Some(failure.kind()));
            put_string(buf, failure.message());
        }
    }
}

pub async fn read_bool<R>(reader: &mut R) -> Result<bool, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_u8().await? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(RequestQueueError::Protocol(format!("invalid boolean: {b}"))),
    }
}

/// Reads a collection length written by [`put_len`].
pub async fn read_count<R>(reader: &mut R) -> Result<usize, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = usize::try_from(reader.read_u32().await?)
        .map_err(|_| RequestQueueError::Protocol("count does not fit in usize".into()))?;
    if count > MAX_ENTRIES {
        return Err(RequestQueueError::Protocol(format!(
            "too many entries: {count}"
        )));
    }
    Ok(count)
}

pub async fn read_string<R>(reader: &mut R) -> Result<Option<String>, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if !read_bool(reader).await? {
        return Ok(None);
    }
    let len = usize::try_from(reader.read_u32().await?)
        .map_err(|_| RequestQueueError::Protocol("length does not fit in usize".into()))?;
    if len > MAX_LENGTH {
        return Err(RequestQueueError::Protocol(format!(
            "string too long: {len}"
        )));
    }
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| RequestQueueError::Protocol(format!("invalid string: {e}")))
}

pub async fn read_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_i32().await?;
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len)
        .map_err(|_| RequestQueueError::Protocol(format!("invalid length: {len}")))?;
    if len > MAX_LENGTH {
        return Err(RequestQueueError::Protocol(format!(
            "byte array too long: {len}"
        )));
    }
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes).await?;
    Ok(Some(bytes))
}

/// Reads the server's reply to a request.
///
/// The outer result reports problems reading the reply, the inner one whether
/// the server performed the request.
pub async fn read_response<R>(
    reader: &mut R,
) -> Result<Result<(), RequestFailure>, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if read_bool(reader).await? {
        return Ok(Ok(()));
    }
    let Some(kind) = read_string(reader).await? else {
        return Err(RequestQueueError::Protocol("failure without a kind".into()));
    };
    let message = read_string(reader).await?;
    Ok(Err(RequestFailure::new(kind, message)))
}

/// Writes the node ID that opens a connection.
pub async fn write_node_id<W>(writer: &mut W, node_id: i64) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_i64(node_id).await?;
    writer.flush().await
}

/// Reads the node ID that opens a connection.
pub async fn read_node_id<R>(reader: &mut R) -> Result<i64, RequestQueueError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let node_id = reader.read_i64().await?;
    if node_id < 0 {
        return Err(RequestQueueError::Protocol(format!(
            "negative node ID: {node_id}"
        )));
    }
    Ok(node_id)
}

/// Writes an encoded frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
