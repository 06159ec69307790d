// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Lock Resolver (C5, spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::region::RegionCache;
use crate::rpc::{CheckTxnStatusAction, Context, Dispatcher, IsolationLevel, LockInfo, TxnBatchRollbackRequest, TxnCheckTxnStatusRequest, TxnCommitRequest};
use crate::timestamp::Timestamp;

/// Outcome of resolving someone else's lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResolveStatus {
    /// The lock's fate was determined (rolled forward or cleaned up); the
    /// caller should retry its original operation.
    Resolved,
    /// The foreign transaction is still live and unexpired.
    StillLocked,
}

/// Resolves a lock another transaction left behind, per spec §4.3: look up
/// the primary's status, then either roll the blocking key forward
/// (committed), clean it up (rolled back / expired), or report the caller
/// should back off (still alive).
pub struct LockResolver {
    dispatcher: Arc<dyn Dispatcher>,
    region_cache: Arc<dyn RegionCache>,
    // lock_ts -> known outcome, so a primary whose fate is already settled
    // is never re-queried via CheckTxnStatus.
    resolved: RwLock<HashMap<u64, ResolvedOutcome>>,
}

#[derive(Clone, Copy)]
enum ResolvedOutcome {
    Committed(Timestamp),
    RolledBack,
}

impl LockResolver {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, region_cache: Arc<dyn RegionCache>) -> Self {
        LockResolver {
            dispatcher,
            region_cache,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, lock: &LockInfo, caller_start_ts: Timestamp) -> Result<ResolveStatus> {
        let lock_ts_key = lock.lock_ts.into_inner();
        if let Some(outcome) = self.resolved.read().get(&lock_ts_key).copied() {
            return self.apply_outcome(lock, outcome).await;
        }

        let primary_region = self
            .region_cache
            .lookup_region_by_key(&lock.primary_key)
            .await?;
        let resp = self
            .dispatcher
            .txn_check_txn_status(
                TxnCheckTxnStatusRequest {
                    primary_key: lock.primary_key.clone(),
                    lock_ts: lock.lock_ts,
                    caller_start_ts,
                    context: Context {
                        region_id: primary_region.id,
                        epoch: primary_region.epoch,
                        isolation_level: IsolationLevel::SnapshotIsolation,
                    },
                },
                &primary_region,
            )
            .await?;

        let outcome = match resp.action {
            CheckTxnStatusAction::Committed => {
                let commit_ts = resp.commit_ts.ok_or_else(|| {
                    Error::KeyError(format!(
                        "check_txn_status reported Committed for primary {:?} with no commit_ts",
                        lock.primary_key
                    ))
                })?;
                ResolvedOutcome::Committed(commit_ts)
            }
            CheckTxnStatusAction::RolledBack => ResolvedOutcome::RolledBack,
            CheckTxnStatusAction::StillAlive => {
                log::debug!(
                    "lock on primary {:?} (ts {:?}) is still alive, caller backs off",
                    lock.primary_key,
                    lock.lock_ts
                );
                return Ok(ResolveStatus::StillLocked);
            }
        };
        self.resolved.write().insert(lock_ts_key, outcome);
        self.apply_outcome(lock, outcome).await
    }

    async fn apply_outcome(&self, lock: &LockInfo, outcome: ResolvedOutcome) -> Result<ResolveStatus> {
        let region = self.region_cache.lookup_region_by_key(&lock.key).await?;
        let context = Context {
            region_id: region.id,
            epoch: region.epoch,
            isolation_level: IsolationLevel::SnapshotIsolation,
        };
        match outcome {
            ResolvedOutcome::Committed(commit_ts) => {
                log::warn!(
                    "rolling forward lock on {:?} left by txn {:?}, committed at {:?}",
                    lock.key,
                    lock.lock_ts,
                    commit_ts
                );
                self.dispatcher
                    .txn_commit(
                        TxnCommitRequest {
                            start_ts: lock.lock_ts,
                            commit_ts,
                            keys: vec![lock.key.clone()],
                            context,
                        },
                        &region,
                    )
                    .await?;
            }
            ResolvedOutcome::RolledBack => {
                log::warn!(
                    "purging stale/expired lock on {:?} left by txn {:?}",
                    lock.key,
                    lock.lock_ts
                );
                self.dispatcher
                    .txn_batch_rollback(
                        TxnBatchRollbackRequest {
                            start_ts: lock.lock_ts,
                            keys: vec![lock.key.clone()],
                            context,
                        },
                        &region,
                    )
                    .await?;
            }
        }
        Ok(ResolveStatus::Resolved)
    }
}
