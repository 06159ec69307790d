//! Fakes implementing the production traits, for integration tests covering
//! spec §8 scenarios S1-S6. No conditional compilation seams inside
//! production modules -- fakes are wired in purely through `TransactionClient::new`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use txnkv_client::error::{Error, Result};
use txnkv_client::region::{Region, RegionCache, RegionEpoch, RegionId};
use txnkv_client::rpc::{
    CheckTxnStatusAction, Dispatcher, LockInfo, LockKind, TxnBatchGetRequest, TxnBatchGetResponse,
    TxnBatchRollbackRequest, TxnBatchRollbackResponse, TxnCheckTxnStatusRequest,
    TxnCheckTxnStatusResponse, TxnCommitRequest, TxnCommitResponse, TxnGetRequest, TxnGetResponse,
    TxnPrewriteRequest, TxnPrewriteResponse, TxnResult, TxnScanRequest, TxnScanResponse,
    WireMutationKind,
};
use txnkv_client::timestamp::{TimeOracle, Timestamp};

pub struct FakeTimeOracle {
    counter: AtomicU64,
}

impl FakeTimeOracle {
    pub fn new() -> Self {
        FakeTimeOracle {
            counter: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl TimeOracle for FakeTimeOracle {
    async fn get_timestamp(&self) -> Result<Timestamp> {
        let v = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Timestamp::from_inner(v))
    }
}

/// Two fixed shards splitting the keyspace at `m`, wide enough to exercise
/// both the one-PC (same shard) and multi-shard commit paths.
pub struct FakeRegionCache {
    regions: Vec<Region>,
}

impl FakeRegionCache {
    pub fn two_shards() -> Self {
        FakeRegionCache {
            regions: vec![
                Region {
                    id: RegionId(1),
                    epoch: RegionEpoch { conf_ver: 1, version: 1 },
                    start_key: vec![],
                    end_key: b"m".to_vec(),
                    leader_endpoint: "fake://1".to_string(),
                },
                Region {
                    id: RegionId(2),
                    epoch: RegionEpoch { conf_ver: 1, version: 1 },
                    start_key: b"m".to_vec(),
                    end_key: vec![],
                    leader_endpoint: "fake://2".to_string(),
                },
            ],
        }
    }

    pub fn one_shard() -> Self {
        FakeRegionCache {
            regions: vec![Region {
                id: RegionId(1),
                epoch: RegionEpoch { conf_ver: 1, version: 1 },
                start_key: vec![],
                end_key: vec![],
                leader_endpoint: "fake://1".to_string(),
            }],
        }
    }
}

#[async_trait]
impl RegionCache for FakeRegionCache {
    async fn lookup_region_by_key(&self, key: &[u8]) -> Result<Region> {
        self.regions
            .iter()
            .find(|r| r.contains(key))
            .cloned()
            .ok_or(Error::RegionNotFound)
    }

    async fn lookup_region_between(&self, start: &[u8], end: &[u8]) -> Result<Region> {
        self.regions
            .iter()
            .find(|r| r.overlaps(start, end))
            .cloned()
            .ok_or(Error::RegionNotFound)
    }

    async fn invalidate(&self, _region_id: RegionId) {}
}

#[derive(Clone)]
struct StoredLock {
    primary_key: Vec<u8>,
    lock_ts: Timestamp,
    value: Option<Vec<u8>>,
}

#[derive(Clone, Copy)]
enum TxnOutcome {
    Committed(Timestamp),
    RolledBack,
}

#[derive(Default)]
struct ServerState {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    locks: HashMap<Vec<u8>, StoredLock>,
    txn_status: HashMap<u64, TxnOutcome>,
    prewrite_fails_with_write_conflict: std::collections::HashSet<Vec<u8>>,
    one_pc_falls_back: std::collections::HashSet<Vec<u8>>,
}

/// A minimal single-version in-memory KV server driving prewrite/commit/
/// rollback/check-txn-status the way the coordinator expects. Deliberately
/// not a full MVCC engine -- tests only exercise coordinator-side logic.
pub struct FakeServer {
    state: Mutex<ServerState>,
    commit_ts_counter: AtomicU64,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeServer {
            state: Mutex::new(ServerState::default()),
            commit_ts_counter: AtomicU64::new(1000),
        })
    }

    pub fn committed_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().unwrap().committed.get(key).cloned()
    }

    /// Seeds a pre-existing lock left by another transaction, as if that
    /// transaction prewrote `key` with `primary_key` at `lock_ts` and never
    /// told us whether it committed.
    pub fn seed_foreign_lock(&self, key: &[u8], primary_key: &[u8], lock_ts: Timestamp) {
        self.state.lock().unwrap().locks.insert(
            key.to_vec(),
            StoredLock {
                primary_key: primary_key.to_vec(),
                lock_ts,
                value: None,
            },
        );
    }

    /// Marks the foreign transaction identified by `lock_ts` as committed
    /// at `commit_ts`, and makes that value visible (simulating that its
    /// primary was already durably committed).
    pub fn seed_foreign_commit(&self, key: &[u8], value: &[u8], lock_ts: Timestamp, commit_ts: Timestamp) {
        let mut state = self.state.lock().unwrap();
        state.txn_status.insert(lock_ts.into_inner(), TxnOutcome::Committed(commit_ts));
        state
            .locks
            .get_mut(key)
            .map(|l| l.value = Some(value.to_vec()));
    }

    pub fn force_write_conflict_on(&self, key: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .prewrite_fails_with_write_conflict
            .insert(key.to_vec());
    }

    /// Forces any prewrite touching `key` to decline one-phase commit and
    /// fall back to ordinary 2PC locks, even when `try_one_pc` is set.
    pub fn force_one_pc_fallback_on(&self, key: &[u8]) {
        self.state.lock().unwrap().one_pc_falls_back.insert(key.to_vec());
    }
}

pub struct FakeDispatcher {
    server: Arc<FakeServer>,
}

impl FakeDispatcher {
    pub fn new(server: Arc<FakeServer>) -> Self {
        FakeDispatcher { server }
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn txn_get(&self, req: TxnGetRequest, _region: &Region) -> Result<TxnGetResponse> {
        let state = self.server.state.lock().unwrap();
        if let Some(lock) = state.locks.get(&req.key) {
            return Ok(TxnGetResponse {
                value: None,
                txn_result: TxnResult::Locked(LockInfo {
                    primary_key: lock.primary_key.clone(),
                    lock_ts: lock.lock_ts,
                    key: req.key.clone(),
                    lock_ttl: 20_000,
                    txn_size: 1,
                    lock_kind: LockKind::Put,
                }),
            });
        }
        Ok(TxnGetResponse {
            value: state.committed.get(&req.key).cloned(),
            txn_result: TxnResult::Ok,
        })
    }

    async fn txn_batch_get(
        &self,
        req: TxnBatchGetRequest,
        _region: &Region,
    ) -> Result<TxnBatchGetResponse> {
        let state = self.server.state.lock().unwrap();
        for key in &req.keys {
            if let Some(lock) = state.locks.get(key) {
                return Ok(TxnBatchGetResponse {
                    kvs: vec![],
                    txn_result: TxnResult::Locked(LockInfo {
                        primary_key: lock.primary_key.clone(),
                        lock_ts: lock.lock_ts,
                        key: key.clone(),
                        lock_ttl: 20_000,
                        txn_size: 1,
                        lock_kind: LockKind::Put,
                    }),
                });
            }
        }
        let kvs = req
            .keys
            .iter()
            .filter_map(|k| state.committed.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok(TxnBatchGetResponse {
            kvs,
            txn_result: TxnResult::Ok,
        })
    }

    async fn txn_scan(&self, req: TxnScanRequest, _region: &Region) -> Result<TxnScanResponse> {
        let state = self.server.state.lock().unwrap();
        let mut kvs: Vec<_> = state
            .committed
            .range(req.start_key.clone()..req.end_key.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let has_more = kvs.len() > req.limit as usize;
        kvs.truncate(req.limit as usize);
        Ok(TxnScanResponse {
            kvs,
            has_more,
            txn_result: TxnResult::Ok,
        })
    }

    async fn txn_prewrite(
        &self,
        req: TxnPrewriteRequest,
        _region: &Region,
    ) -> Result<TxnPrewriteResponse> {
        let mut state = self.server.state.lock().unwrap();
        for m in &req.mutations {
            if state.prewrite_fails_with_write_conflict.contains(&m.key) {
                return Ok(TxnPrewriteResponse {
                    txn_results: vec![TxnResult::WriteConflict],
                    one_pc_commit_ts: None,
                });
            }
            if let Some(lock) = state.locks.get(&m.key) {
                if lock.lock_ts != req.start_ts {
                    return Ok(TxnPrewriteResponse {
                        txn_results: vec![TxnResult::Locked(LockInfo {
                            primary_key: lock.primary_key.clone(),
                            lock_ts: lock.lock_ts,
                            key: m.key.clone(),
                            lock_ttl: 20_000,
                            txn_size: 1,
                            lock_kind: LockKind::Put,
                        })],
                        one_pc_commit_ts: None,
                    });
                }
            }
        }
        for m in &req.mutations {
            let value = match m.kind {
                WireMutationKind::Put | WireMutationKind::Insert => m.value.clone(),
                WireMutationKind::Delete => None,
            };
            state.locks.insert(
                m.key.clone(),
                StoredLock {
                    primary_key: req.primary_lock.clone(),
                    lock_ts: req.start_ts,
                    value,
                },
            );
        }
        let falls_back = req.mutations.iter().any(|m| state.one_pc_falls_back.contains(&m.key));
        if req.try_one_pc && !falls_back {
            let commit_ts = Timestamp::from_inner(
                self.server.commit_ts_counter.fetch_add(1, Ordering::SeqCst),
            );
            for m in &req.mutations {
                if let Some(lock) = state.locks.remove(&m.key) {
                    match lock.value {
                        Some(v) => {
                            state.committed.insert(m.key.clone(), v);
                        }
                        None => {
                            state.committed.remove(&m.key);
                        }
                    }
                }
            }
            return Ok(TxnPrewriteResponse {
                txn_results: vec![TxnResult::Ok; req.mutations.len()],
                one_pc_commit_ts: Some(commit_ts),
            });
        }
        Ok(TxnPrewriteResponse {
            txn_results: vec![TxnResult::Ok; req.mutations.len()],
            one_pc_commit_ts: None,
        })
    }

    async fn txn_commit(&self, req: TxnCommitRequest, _region: &Region) -> Result<TxnCommitResponse> {
        let mut state = self.server.state.lock().unwrap();
        for key in &req.keys {
            if let Some(lock) = state.locks.remove(key) {
                match lock.value {
                    Some(v) => {
                        state.committed.insert(key.clone(), v);
                    }
                    None => {
                        state.committed.remove(key);
                    }
                }
            }
        }
        state
            .txn_status
            .insert(req.start_ts.into_inner(), TxnOutcome::Committed(req.commit_ts));
        Ok(TxnCommitResponse {
            txn_result: TxnResult::Ok,
        })
    }

    async fn txn_batch_rollback(
        &self,
        req: TxnBatchRollbackRequest,
        _region: &Region,
    ) -> Result<TxnBatchRollbackResponse> {
        let mut state = self.server.state.lock().unwrap();
        for key in &req.keys {
            state.locks.remove(key);
        }
        state.txn_status.insert(req.start_ts.into_inner(), TxnOutcome::RolledBack);
        Ok(TxnBatchRollbackResponse {
            txn_result: TxnResult::Ok,
        })
    }

    async fn txn_check_txn_status(
        &self,
        req: TxnCheckTxnStatusRequest,
        _region: &Region,
    ) -> Result<TxnCheckTxnStatusResponse> {
        let state = self.server.state.lock().unwrap();
        match state.txn_status.get(&req.lock_ts.into_inner()) {
            Some(TxnOutcome::Committed(ts)) => Ok(TxnCheckTxnStatusResponse {
                action: CheckTxnStatusAction::Committed,
                commit_ts: Some(*ts),
            }),
            Some(TxnOutcome::RolledBack) => Ok(TxnCheckTxnStatusResponse {
                action: CheckTxnStatusAction::RolledBack,
                commit_ts: None,
            }),
            None => Ok(TxnCheckTxnStatusResponse {
                action: CheckTxnStatusAction::StillAlive,
                commit_ts: None,
            }),
        }
    }
}

fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn new_client(region_cache: FakeRegionCache) -> (txnkv_client::TransactionClient, Arc<FakeServer>) {
    init_test_logging();
    let server = FakeServer::new();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(FakeDispatcher::new(server.clone()));
    let region_cache: Arc<dyn RegionCache> = Arc::new(region_cache);
    let time_oracle: Arc<dyn TimeOracle> = Arc::new(FakeTimeOracle::new());
    let client = txnkv_client::TransactionClient::new(
        dispatcher,
        region_cache,
        time_oracle,
        txnkv_client::Config::default(),
    );
    (client, server)
}
