// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Wire-level request/response semantics the coordinator depends on
//! (spec §6) and the RPC Dispatcher contract (C4, spec §4.4).
//!
//! The transport itself is an external collaborator (spec §1); this module
//! only fixes the shapes a `Dispatcher` implementation must marshal to and
//! from, and the `txn_result` tagged union every response carries.

use async_trait::async_trait;

use crate::buffer::{BufferEntry, Key, Value};
use crate::error::Result;
use crate::region::{Region, RegionEpoch, RegionId};
use crate::timestamp::Timestamp;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IsolationLevel {
    SnapshotIsolation,
    ReadCommitted,
}

/// Carried on every shard-scoped request so the server can reject stale
/// routing and the dispatcher can refuse to retry against the wrong region.
#[derive(Clone, Debug)]
pub struct Context {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub isolation_level: IsolationLevel,
}

#[derive(Clone, Debug)]
pub struct LockInfo {
    pub primary_key: Key,
    pub lock_ts: Timestamp,
    pub key: Key,
    pub lock_ttl: u64,
    pub txn_size: u64,
    pub lock_kind: LockKind,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockKind {
    Put,
    Delete,
}

/// At most one of these is carried on a response. `Ok` means the operation
/// fully succeeded server-side.
#[derive(Clone, Debug)]
pub enum TxnResult {
    Ok,
    Locked(LockInfo),
    WriteConflict,
    TxnNotFound,
}

pub struct TxnGetRequest {
    pub start_ts: Timestamp,
    pub key: Key,
    pub context: Context,
}

pub struct TxnGetResponse {
    pub value: Option<Value>,
    pub txn_result: TxnResult,
}

pub struct TxnBatchGetRequest {
    pub start_ts: Timestamp,
    pub keys: Vec<Key>,
    pub context: Context,
}

pub struct TxnBatchGetResponse {
    pub kvs: Vec<(Key, Value)>,
    pub txn_result: TxnResult,
}

pub struct TxnScanRequest {
    pub start_ts: Timestamp,
    pub start_key: Key,
    pub end_key: Key,
    pub limit: u32,
    pub context: Context,
}

pub struct TxnScanResponse {
    pub kvs: Vec<(Key, Value)>,
    /// True when the shard has no further pages for this range.
    pub has_more: bool,
    pub txn_result: TxnResult,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WireMutationKind {
    Put,
    Insert,
    Delete,
}

#[derive(Clone, Debug)]
pub struct WireMutation {
    pub key: Key,
    pub value: Option<Value>,
    pub kind: WireMutationKind,
}

impl From<&BufferEntry> for WireMutation {
    fn from(entry: &BufferEntry) -> Self {
        match &entry.mutation {
            crate::buffer::Mutation::Put(v) => WireMutation {
                key: entry.key.clone(),
                value: Some(v.clone()),
                kind: WireMutationKind::Put,
            },
            crate::buffer::Mutation::PutIfAbsent(v) => WireMutation {
                key: entry.key.clone(),
                value: Some(v.clone()),
                kind: WireMutationKind::Insert,
            },
            crate::buffer::Mutation::Delete => WireMutation {
                key: entry.key.clone(),
                value: None,
                kind: WireMutationKind::Delete,
            },
        }
    }
}

pub struct TxnPrewriteRequest {
    pub start_ts: Timestamp,
    pub mutations: Vec<WireMutation>,
    pub primary_lock: Key,
    pub lock_ttl: u64,
    pub txn_size: u64,
    pub try_one_pc: bool,
    pub context: Context,
}

pub struct TxnPrewriteResponse {
    pub txn_results: Vec<TxnResult>,
    /// Set when `try_one_pc` succeeded: the commit_ts the server chose.
    pub one_pc_commit_ts: Option<Timestamp>,
}

pub struct TxnCommitRequest {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub keys: Vec<Key>,
    pub context: Context,
}

pub struct TxnCommitResponse {
    pub txn_result: TxnResult,
}

pub struct TxnBatchRollbackRequest {
    pub start_ts: Timestamp,
    pub keys: Vec<Key>,
    pub context: Context,
}

pub struct TxnBatchRollbackResponse {
    pub txn_result: TxnResult,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CheckTxnStatusAction {
    /// The foreign transaction is committed; `commit_ts` is set.
    Committed,
    /// The foreign transaction was rolled back or its lock expired.
    RolledBack,
    /// The foreign transaction is still live and unexpired.
    StillAlive,
}

pub struct TxnCheckTxnStatusRequest {
    pub primary_key: Key,
    pub lock_ts: Timestamp,
    pub caller_start_ts: Timestamp,
    pub context: Context,
}

pub struct TxnCheckTxnStatusResponse {
    pub action: CheckTxnStatusAction,
    pub commit_ts: Option<Timestamp>,
}

/// Sends a single shard-scoped RPC to a region's leader. Implementations
/// are expected to transparently retry (bounded) on connection errors,
/// not-leader redirects, and stale-epoch responses after refreshing
/// routing; logical errors carried in the response payload (`txn_result`)
/// are not retried here and are surfaced to the caller to interpret.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn txn_get(&self, req: TxnGetRequest, region: &Region) -> Result<TxnGetResponse>;
    async fn txn_batch_get(
        &self,
        req: TxnBatchGetRequest,
        region: &Region,
    ) -> Result<TxnBatchGetResponse>;
    async fn txn_scan(&self, req: TxnScanRequest, region: &Region) -> Result<TxnScanResponse>;
    async fn txn_prewrite(
        &self,
        req: TxnPrewriteRequest,
        region: &Region,
    ) -> Result<TxnPrewriteResponse>;
    async fn txn_commit(&self, req: TxnCommitRequest, region: &Region) -> Result<TxnCommitResponse>;
    async fn txn_batch_rollback(
        &self,
        req: TxnBatchRollbackRequest,
        region: &Region,
    ) -> Result<TxnBatchRollbackResponse>;
    async fn txn_check_txn_status(
        &self,
        req: TxnCheckTxnStatusRequest,
        region: &Region,
    ) -> Result<TxnCheckTxnStatusResponse>;
}
