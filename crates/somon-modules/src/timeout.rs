// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-operation and batch timeouts

use crate::error::{ModuleError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How a batch reacts to timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Wait for every operation and report all timeouts together
    #[default]
    CollectAll,
    /// Reject as soon as the first operation times out
    FailFast,
}

/// Bound `future` by `timeout`, naming the operation on expiry
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
            Err(ModuleError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Run named operations concurrently, each bounded by `timeout`.
///
/// Results come back in input order. Operation errors other than timeouts are
/// returned per operation; timeouts are handled according to `policy`.
pub async fn run_with_timeouts<T, F>(
    operations: Vec<(String, F)>,
    timeout: Duration,
    policy: TimeoutPolicy,
) -> Result<Vec<Result<T>>>
where
    F: Future<Output = Result<T>>,
{
    let total = operations.len();
    let mut pending: FuturesUnordered<_> = operations
        .into_iter()
        .enumerate()
        .map(|(index, (name, future))| async move {
            let result = with_timeout(&name, timeout, future).await;
            (index, name, result)
        })
        .collect();

    let mut results: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    let mut timed_out = Vec::new();
    while let Some((index, name, result)) = pending.next().await {
        if matches!(result, Err(ModuleError::Timeout { .. })) {
            if policy == TimeoutPolicy::FailFast {
                return Err(ModuleError::AggregateTimeout(vec![name]));
            }
            timed_out.push((index, name));
        }
        results[index] = Some(result);
    }

    if !timed_out.is_empty() {
        timed_out.sort();
        return Err(ModuleError::AggregateTimeout(
            timed_out.into_iter().map(|(_, name)| name).collect(),
        ));
    }
    Ok(results.into_iter().flatten().collect())
}
