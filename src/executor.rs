// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Parallel Executor (C6, spec §4.5).
//!
//! Fans out independent sub-tasks concurrently and joins them, preserving
//! input order so callers can correlate results by index. A panic in one
//! sub-task is isolated and surfaced as that slot's own failure; it must
//! not abort sibling tasks.

use std::future::Future;

use futures::future::join_all;

/// Runs `tasks`, one `tokio` task per future, and returns their results in
/// the same order as the input. If a sub-task panics, `on_panic` is used to
/// build that slot's result instead of propagating the panic.
pub async fn execute_parallel<T, F, Fut>(tasks: Vec<F>, on_panic: impl Fn() -> T + Send + Sync) -> Vec<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let handles: Vec<_> = tasks.into_iter().map(|task| tokio::spawn(task())).collect();
    let joined = join_all(handles).await;
    joined
        .into_iter()
        .map(|r| r.unwrap_or_else(|_panic| on_panic()))
        .collect()
}
