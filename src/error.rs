// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Error taxonomy for the transactional coordinator (spec §7).

use thiserror::Error;

use crate::transaction::TxnState;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("region not found for key")]
    RegionNotFound,

    #[error("region {0} is stale")]
    RegionStale(u64),

    #[error("lock conflict, caller should back off: {0:?}")]
    LockConflict(Box<crate::rpc::LockInfo>),

    #[error("write conflict, transaction must restart")]
    WriteConflict,

    #[error("transaction was rolled back before commit")]
    TxnRolledBack,

    #[error("operation not allowed from state {0:?}")]
    IllegalState(TxnState),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("server lost the primary lock; transaction outcome is unknown")]
    TxnNotFound,

    #[error("key error from server: {0}")]
    KeyError(String),
}
