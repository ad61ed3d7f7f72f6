// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Serves the update queues of a set of nodes from an in-memory data server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cds_request_queue::error::RequestQueueError;
use cds_request_queue::listener::RequestQueueListener;
use cds_update_queue::handler::{LoggingUpdateQueueServer, UpdateQueueDispatcher};
use cds_update_queue::memory::MemoryUpdateQueueServer;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(about = "Update queue server", long_about = None)]
struct Args {
    /// Listen address for the server; supports DNS names.
    #[clap(
        long,
        env = "CDS_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:44540"
    )]
    listen_addr: String,
    /// A node whose connections to accept. May be repeated.
    #[clap(long = "node-id", env = "CDS_NODE_IDS", value_delimiter = ',', required = true)]
    node_ids: Vec<i64>,
    /// How long to keep retrying failed connections, in milliseconds.
    #[clap(long, env = "CDS_MAX_RETRY_MS", default_value = "1000")]
    max_retry_ms: u64,
    /// How long to wait before accepting after a failure, in milliseconds.
    #[clap(long, env = "CDS_RETRY_WAIT_MS", default_value = "10")]
    retry_wait_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("update-queue-server: fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;

    let data = Arc::new(LoggingUpdateQueueServer::new(MemoryUpdateQueueServer::new()));
    let dispatcher = Arc::new(UpdateQueueDispatcher::new(data));
    for node_id in &args.node_ids {
        dispatcher
            .register_node(*node_id)
            .with_context(|| format!("registering node {node_id}"))?;
    }

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let reporter = move |error: RequestQueueError| {
        let _ = failure_tx.send(error);
    };
    let listener = RequestQueueListener::new(
        listener,
        dispatcher,
        Arc::new(reporter),
        Duration::from_millis(args.max_retry_ms),
        Duration::from_millis(args.retry_wait_ms),
    )?;
    info!(
        addr = %listener.local_addr(),
        nodes = ?args.node_ids,
        "update-queue-server listening"
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("update-queue-server shutting down");
            listener.shutdown().await;
            Ok(())
        }
        Some(error) = failure_rx.recv() => {
            Err(anyhow::Error::new(error).context("listener failed"))
        }
    }
}
