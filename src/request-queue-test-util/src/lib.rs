// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connections that fail on purpose, and other helpers for testing request
//! queues.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use cds_request_queue::client::SocketFactory;
use cds_request_queue::error::RequestQueueError;
use cds_request_queue::{FailureReporter, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// A failure reporter that forwards failures to the returned receiver.
pub fn reporter() -> (
    Arc<dyn FailureReporter>,
    mpsc::UnboundedReceiver<RequestQueueError>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = move |error: RequestQueueError| {
        let _ = tx.send(error);
    };
    (Arc::new(reporter), rx)
}

/// Passes the server's handshake through, then fails the connection as soon
/// as a response arrives, so the request is performed but never acknowledged.
#[derive(Debug)]
pub struct LoseResponses {
    inner: TcpStream,
    remaining: usize,
}

impl LoseResponses {
    pub fn new(inner: TcpStream) -> Self {
        LoseResponses {
            inner,
            remaining: 1,
        }
    }
}

impl AsyncRead for LoseResponses {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // One byte at a time, so nothing past the handshake is delivered.
        let mut byte = [0; 1];
        let mut scratch = ReadBuf::new(&mut byte);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch))?;
        let filled = scratch.filled();
        if filled.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if this.remaining == 0 {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        this.remaining -= filled.len();
        buf.put_slice(filled);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for LoseResponses {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connects over TCP, losing the responses on its first connection.
#[derive(Debug)]
pub struct FlakyFactory {
    addr: SocketAddr,
    connections: AtomicUsize,
}

impl FlakyFactory {
    pub fn new(addr: SocketAddr) -> Self {
        FlakyFactory {
            addr,
            connections: AtomicUsize::new(0),
        }
    }

    /// The number of connections made so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketFactory for FlakyFactory {
    async fn connect(&self) -> io::Result<Box<dyn Socket>> {
        let inner = TcpStream::connect(self.addr).await?;
        if self.connections.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Box::new(LoseResponses::new(inner)))
        } else {
            Ok(Box::new(inner))
        }
    }
}

/// Connects over TCP once the gate is opened.
#[derive(Debug)]
pub struct GatedFactory {
    addr: SocketAddr,
    gate: watch::Sender<bool>,
}

impl GatedFactory {
    pub fn new(addr: SocketAddr) -> Self {
        GatedFactory {
            addr,
            gate: watch::Sender::new(false),
        }
    }

    /// Lets connection attempts through.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl SocketFactory for GatedFactory {
    async fn connect(&self) -> io::Result<Box<dyn Socket>> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let stream = TcpStream::connect(self.addr).await?;
        Ok(Box::new(stream))
    }
}
