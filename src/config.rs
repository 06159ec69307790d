// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Configuration knobs (spec §6, expanded §10.5).

use rand::Rng;

/// Fixed set of tunables shared by all transactions begun from one
/// `TransactionClient`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bound on per-sub-task retries for lock conflicts.
    pub max_retry: u32,
    /// Flat retry delay, kept for callers that construct a `Config` without
    /// touching `retry_options`. The coordinator itself always retries
    /// through `retry_options`'s per-purpose `Backoff`s (region lookups vs.
    /// lock conflicts get different curves), so this value is not read
    /// internally.
    pub op_delay_ms: u64,
    /// Mutations/keys per shard RPC.
    pub max_batch_count: usize,
    /// Prewrite lock expiry. No heartbeat is implemented, so this is also
    /// the effective maximum duration of a transaction between `pre_commit`
    /// and `commit` before another transaction's Lock Resolver may roll it
    /// back as expired.
    pub lock_ttl_ms: u64,
    pub retry_options: RetryOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_retry: 3,
            op_delay_ms: 100,
            max_batch_count: 1024,
            lock_ttl_ms: 20_000,
            retry_options: RetryOptions::default(),
        }
    }
}

/// Backoff used for region-lookup retries vs. lock-conflict retries,
/// mirroring `RetryOptions { region_backoff, lock_backoff }` from the
/// transaction-client lineage this crate is modeled on.
#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    pub region_backoff: Backoff,
    pub lock_backoff: Backoff,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            region_backoff: Backoff::no_jitter_backoff(2, 5_000, 20),
            lock_backoff: Backoff::no_jitter_backoff(2, 500, 10),
        }
    }
}

/// Exponential backoff with a cap, optionally jittered.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    jitter: bool,
}

impl Backoff {
    pub const fn no_jitter_backoff(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Backoff {
            base_delay_ms,
            max_delay_ms,
            max_retries,
            jitter: false,
        }
    }

    pub const fn jitter_backoff(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Backoff {
            base_delay_ms,
            max_delay_ms,
            max_retries,
            jitter: true,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay for the given (0-based) retry attempt, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(32));
        let mut delay = exp.min(self.max_delay_ms);
        if self.jitter {
            let mut rng = rand::thread_rng();
            delay = rng.gen_range(0..=delay.max(1));
        }
        std::time::Duration::from_millis(delay)
    }
}
