//! Concurrent fan-out/fan-in over a set of backends.
//!
//! Every backend runs as its own task. A backend that panics is reported as a
//! failed `BackendResult` under the id captured before dispatch, so one bad
//! adapter never takes down the batch. Tasks still running when the deadline
//! fires are aborted and listed in [`FanOut::pending`].

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::backend::DynBackend;
use crate::error::ApiError;
use crate::types::{BackendResult, SearchQuery};

#[derive(Debug, Default)]
pub struct FanOut {
    /// Finished backends, in dispatch order.
    pub completed: Vec<BackendResult>,
    /// Backends still running at the deadline, in dispatch order.
    pub pending: Vec<String>,
}

impl FanOut {
    pub fn timed_out(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send), fallback: &str) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| fallback.to_string())
}

pub async fn fan_out(
    clients: Vec<DynBackend>,
    query: &SearchQuery,
    deadline: Option<Duration>,
) -> FanOut {
    let deadline_at = deadline.map(|d| Instant::now() + d);
    let mut set = JoinSet::new();
    let mut waiting: BTreeMap<usize, String> = BTreeMap::new();

    for (idx, client) in clients.into_iter().enumerate() {
        let id = client.id().to_string();
        waiting.insert(idx, id.clone());
        let q = query.clone();
        set.spawn(async move {
            let outcome = AssertUnwindSafe(client.search(&q)).catch_unwind().await;
            let result = match outcome {
                Ok(mut r) => {
                    r.source_name = id;
                    r
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref(), "backend task panicked");
                    tracing::error!(target: "engine", backend = %id, error = %msg, "backend task panicked");
                    BackendResult::failed(id.clone(), ApiError::server_error(id, msg), None)
                }
            };
            (idx, result)
        });
    }

    let mut completed: Vec<(usize, BackendResult)> = Vec::with_capacity(waiting.len());
    loop {
        let next = match deadline_at {
            Some(at) => match tokio::time::timeout_at(at, set.join_next()).await {
                Ok(n) => n,
                Err(_) => break,
            },
            None => set.join_next().await,
        };
        match next {
            None => break,
            Some(Ok((idx, result))) => {
                waiting.remove(&idx);
                completed.push((idx, result));
            }
            // Only reachable if the runtime is shutting down; the backend
            // stays in `waiting` and is reported as pending.
            Some(Err(e)) => {
                tracing::warn!(target: "engine", error = %e, "backend task did not complete");
            }
        }
    }
    set.abort_all();

    completed.sort_by_key(|(idx, _)| *idx);
    FanOut {
        completed: completed.into_iter().map(|(_, r)| r).collect(),
        pending: waiting.into_values().collect(),
    }
}
