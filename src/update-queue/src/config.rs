// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Update queue configuration.

use std::time::Duration;

use cds_request_queue::MAX_OUTSTANDING;
use cds_request_queue::error::RequestQueueError;
use cds_request_queue::retry::check_retry_settings;

use crate::error::UpdateQueueError;
use crate::queue::REQUEST_QUEUE_PROPORTION;

/// Configures an [`UpdateQueue`](crate::queue::UpdateQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateQueueConfig {
    /// The host of the data server.
    pub server_host: String,
    /// The port of the data server's update queue listener.
    pub server_port: u16,
    /// The number of commits that may be outstanding.
    pub update_queue_size: usize,
    /// The ID of the local node.
    pub node_id: i64,
    /// How long to keep retrying a failing connection before giving up.
    pub max_retry: Duration,
    /// How long to wait before retrying a failed connection.
    pub retry_wait: Duration,
}

impl UpdateQueueConfig {
    pub const DEFAULT_UPDATE_QUEUE_SIZE: usize = 100;
    pub const DEFAULT_MAX_RETRY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(10);

    /// A configuration with default settings.
    pub fn new(server_host: impl Into<String>, server_port: u16, node_id: i64) -> Self {
        UpdateQueueConfig {
            server_host: server_host.into(),
            server_port,
            update_queue_size: Self::DEFAULT_UPDATE_QUEUE_SIZE,
            node_id,
            max_retry: Self::DEFAULT_MAX_RETRY,
            retry_wait: Self::DEFAULT_RETRY_WAIT,
        }
    }

    pub fn validate(&self) -> Result<(), UpdateQueueError> {
        if self.node_id < 0 {
            return Err(UpdateQueueError::InvalidArgument(format!(
                "the node ID must not be negative: {}",
                self.node_id
            )));
        }
        let max_size = MAX_OUTSTANDING / REQUEST_QUEUE_PROPORTION;
        if self.update_queue_size < 1 || self.update_queue_size > max_size {
            return Err(UpdateQueueError::InvalidArgument(format!(
                "the update queue size must be between 1 and {max_size}: {}",
                self.update_queue_size
            )));
        }
        check_retry_settings(self.max_retry, self.retry_wait).map_err(|error| match error {
            RequestQueueError::InvalidArgument(message) => {
                UpdateQueueError::InvalidArgument(message)
            }
            error => error.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate() {
        let config = UpdateQueueConfig::new("localhost", 44540, 1);
        assert_eq!(config.update_queue_size, 100);
        assert_eq!(config.max_retry, Duration::from_secs(1));
        assert_eq!(config.retry_wait, Duration::from_millis(10));
        config.validate().unwrap();

        let invalid = [
            UpdateQueueConfig {
                node_id: -1,
                ..config.clone()
            },
            UpdateQueueConfig {
                update_queue_size: 0,
                ..config.clone()
            },
            UpdateQueueConfig {
                update_queue_size: 5001,
                ..config.clone()
            },
            UpdateQueueConfig {
                max_retry: Duration::ZERO,
                ..config.clone()
            },
            UpdateQueueConfig {
                retry_wait: Duration::ZERO,
                ..config.clone()
            },
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(UpdateQueueError::InvalidArgument(_))),
                "{config:?}"
            );
        }

        let largest = UpdateQueueConfig {
            update_queue_size: 5000,
            ..config
        };
        largest.validate().unwrap();
    }
}
