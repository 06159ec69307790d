// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Time Oracle Client (C2, spec §4 component table; encoding in §10.6).

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << PHYSICAL_SHIFT_BITS) - 1;

/// A composite physical/logical timestamp, monotonically increasing across
/// the whole deployment. Comparisons are plain integer comparisons over the
/// composite value, never over the physical part alone.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn zero() -> Self {
        Timestamp(0)
    }

    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Timestamp((physical_ms << PHYSICAL_SHIFT_BITS) | (logical & LOGICAL_MASK))
    }

    pub fn physical(&self) -> u64 {
        self.0 >> PHYSICAL_SHIFT_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    pub fn from_inner(v: u64) -> Self {
        Timestamp(v)
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Self {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}.{})", self.physical(), self.logical())
    }
}

/// Requests monotonically increasing timestamps for `start_ts` / `commit_ts`.
/// Implemented by a real PD/time-oracle RPC client in production and by a
/// fake monotonic counter in tests.
#[async_trait]
pub trait TimeOracle: Send + Sync {
    async fn get_timestamp(&self) -> Result<Timestamp>;
}
