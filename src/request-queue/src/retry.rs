// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::RequestQueueError;

/// The number of retries required before upgrading a log level from `debug`
/// to `info`.
pub const INFO_MIN_RETRIES: usize = 5;

/// A run of consecutive failures, used to decide when to stop retrying.
///
/// The run starts at the first failure after a success and is ended by the
/// next success.
#[derive(Debug)]
pub struct FailureRun {
    max_retry: Duration,
    started: Option<Instant>,
    failures: usize,
}

impl FailureRun {
    pub fn new(max_retry: Duration) -> Self {
        FailureRun {
            max_retry,
            started: None,
            failures: 0,
        }
    }

    /// Notes a success, ending the current run.
    pub fn succeeded(&mut self) {
        self.started = None;
        self.failures = 0;
    }

    /// Notes a failure at `now`. Returns whether the run has lasted longer
    /// than the maximum retry time, meaning the caller should give up.
    pub fn failed(&mut self, now: Instant) -> bool {
        let started = *self.started.get_or_insert(now);
        self.failures += 1;
        now.saturating_duration_since(started) > self.max_retry
    }

    /// The number of failures in the current run.
    pub fn failures(&self) -> usize {
        self.failures
    }
}

/// Checks the retry settings shared by the client and the listener.
pub fn check_retry_settings(
    max_retry: Duration,
    retry_wait: Duration,
) -> Result<(), RequestQueueError> {
    if max_retry < Duration::from_millis(1) {
        return Err(RequestQueueError::InvalidArgument(
            "the max retry must not be less than 1 ms".into(),
        ));
    }
    if retry_wait < Duration::from_millis(1) {
        return Err(RequestQueueError::InvalidArgument(
            "the retry wait must not be less than 1 ms".into(),
        ));
    }
    Ok(())
}
