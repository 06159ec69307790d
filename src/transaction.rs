// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Transaction Coordinator (C8, spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{Key, Mutation, Value, WriteBuffer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::execute_parallel;
use crate::region::{Region, RegionCache};
use crate::resolve_lock::{LockResolver, ResolveStatus};
use crate::rpc::{
    Context, Dispatcher, IsolationLevel, TxnBatchGetRequest, TxnBatchRollbackRequest,
    TxnCommitRequest, TxnGetRequest, TxnPrewriteRequest, TxnResult, TxnScanRequest, WireMutation,
};
use crate::scan::ScanCursor;
use crate::timestamp::{TimeOracle, Timestamp};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxnState {
    Init,
    Active,
    PreCommitting,
    PreCommitted,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransactionKind {
    Optimistic,
    Pessimistic,
}

#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub kind: TransactionKind,
    pub retry_options: crate::config::RetryOptions,
}

impl TransactionOptions {
    pub fn new_optimistic() -> Self {
        TransactionOptions {
            isolation: IsolationLevel::SnapshotIsolation,
            kind: TransactionKind::Optimistic,
            retry_options: crate::config::RetryOptions::default(),
        }
    }

    pub fn new_pessimistic() -> Self {
        TransactionOptions {
            isolation: IsolationLevel::SnapshotIsolation,
            kind: TransactionKind::Pessimistic,
            retry_options: crate::config::RetryOptions::default(),
        }
    }

    pub fn isolation_level(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn retry_options(mut self, retry_options: crate::config::RetryOptions) -> Self {
        self.retry_options = retry_options;
        self
    }
}

/// Shared, process-wide service handles a `Transaction` borrows but does
/// not own (spec §3 "client stub"), bundled behind `Arc`s so the same stub
/// can be cloned cheaply across many concurrently live transactions.
pub(crate) struct ClientStub {
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) region_cache: Arc<dyn RegionCache>,
    pub(crate) time_oracle: Arc<dyn TimeOracle>,
    pub(crate) lock_resolver: Arc<LockResolver>,
    pub(crate) config: Config,
}

/// A single multi-key read/write transaction spanning many shards. Single-
/// owner: one logical flow of control uses a `Transaction` at a time (§5).
pub struct Transaction {
    stub: Arc<ClientStub>,
    options: TransactionOptions,
    state: TxnState,
    start_ts: Option<Timestamp>,
    commit_ts: Option<Timestamp>,
    primary_key: Option<Key>,
    is_one_pc: bool,
    buffer: WriteBuffer,
    scan_cursors: HashMap<(Key, Key), ScanCursor>,
}

impl Transaction {
    pub(crate) fn new(stub: Arc<ClientStub>, options: TransactionOptions) -> Self {
        Transaction {
            stub,
            options,
            state: TxnState::Init,
            start_ts: None,
            commit_ts: None,
            primary_key: None,
            is_one_pc: false,
            buffer: WriteBuffer::new(),
            scan_cursors: HashMap::new(),
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn start_ts(&self) -> Option<Timestamp> {
        self.start_ts
    }

    fn require_state(&self, allowed: &[TxnState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::IllegalState(self.state))
        }
    }

    fn context_for(&self, region: &Region) -> Context {
        Context {
            region_id: region.id,
            epoch: region.epoch,
            isolation_level: self.options.isolation,
        }
    }

    /// Acquires `start_ts` from the time oracle.
    pub async fn begin(&mut self) -> Result<()> {
        self.require_state(&[TxnState::Init])?;
        let ts = self.stub.time_oracle.get_timestamp().await?;
        self.start_ts = Some(ts);
        self.state = TxnState::Active;
        Ok(())
    }

    // -- reads -------------------------------------------------------

    /// Buffer-first read; falls through to a TxnGet RPC against the shard
    /// owning `key`. Resolves lock conflicts and retries with bounded
    /// backoff.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.require_state(&[TxnState::Active])?;
        if let Some(mutation) = self.buffer.get(key) {
            return Ok(match mutation {
                Mutation::Put(v) | Mutation::PutIfAbsent(v) => Some(v.clone()),
                Mutation::Delete => None,
            });
        }

        let start_ts = self.start_ts.expect("Active state implies start_ts is set");
        let max_retry = self.stub.config.max_retry;
        for attempt in 0..=max_retry {
            let region = self.stub.region_cache.lookup_region_by_key(key).await?;
            let context = self.context_for(&region);
            let resp = self
                .stub
                .dispatcher
                .txn_get(
                    TxnGetRequest {
                        start_ts,
                        key: key.to_vec(),
                        context,
                    },
                    &region,
                )
                .await?;
            match resp.txn_result {
                TxnResult::Ok => return Ok(resp.value),
                TxnResult::Locked(lock) => {
                    if attempt == max_retry {
                        return Err(Error::LockConflict(Box::new(lock)));
                    }
                    self.backoff_and_resolve(&lock, attempt).await?;
                }
                TxnResult::WriteConflict => return Err(Error::WriteConflict),
                TxnResult::TxnNotFound => return Ok(None),
            }
        }
        unreachable!("loop always returns before exceeding max_retry")
    }

    async fn backoff_and_resolve(
        &self,
        lock: &crate::rpc::LockInfo,
        attempt: u32,
    ) -> Result<()> {
        let start_ts = self.start_ts.unwrap_or_else(Timestamp::zero);
        match self.stub.lock_resolver.resolve(lock, start_ts).await? {
            ResolveStatus::Resolved => {}
            ResolveStatus::StillLocked => {
                let delay = self.options.retry_options.lock_backoff.delay_for(attempt);
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Partitions keys by shard, fans out one TxnBatchGet per shard, and
    /// merges with buffer-first resolution. Returns the first non-OK
    /// status encountered; empty-value kvs are filtered out.
    pub async fn batch_get(&mut self, keys: &[Key]) -> Result<Vec<(Key, Value)>> {
        self.require_state(&[TxnState::Active])?;
        let mut results = Vec::with_capacity(keys.len());
        let mut remote_keys = Vec::new();
        for key in keys {
            match self.buffer.get(key) {
                Some(Mutation::Put(v)) | Some(Mutation::PutIfAbsent(v)) => {
                    results.push((key.clone(), v.clone()));
                }
                Some(Mutation::Delete) => {}
                None => remote_keys.push(key.clone()),
            }
        }
        if remote_keys.is_empty() {
            results.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(results);
        }

        let mut by_region: HashMap<crate::region::RegionId, (Region, Vec<Key>)> = HashMap::new();
        for key in remote_keys {
            let region = self.stub.region_cache.lookup_region_by_key(&key).await?;
            by_region
                .entry(region.id)
                .or_insert_with(|| (region.clone(), Vec::new()))
                .1
                .push(key);
        }

        let start_ts = self.start_ts.expect("Active state implies start_ts is set");
        let isolation = self.options.isolation;
        let dispatcher = self.stub.dispatcher.clone();
        let tasks: Vec<_> = by_region
            .into_values()
            .map(|(region, keys)| {
                let dispatcher = dispatcher.clone();
                move || async move {
                    let context = Context {
                        region_id: region.id,
                        epoch: region.epoch,
                        isolation_level: isolation,
                    };
                    dispatcher
                        .txn_batch_get(
                            TxnBatchGetRequest {
                                start_ts,
                                keys,
                                context,
                            },
                            &region,
                        )
                        .await
                }
            })
            .collect();

        let responses = execute_parallel(tasks, || {
            Err(Error::Transport("sub-task panicked".to_string()))
        })
        .await;

        let mut first_error: Option<Error> = None;
        for (idx, resp) in responses.into_iter().enumerate() {
            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        log::warn!("batch_get sub-task {} also failed: {}", idx, e);
                    }
                    continue;
                }
            };
            match resp.txn_result {
                TxnResult::Ok => {}
                TxnResult::Locked(lock) => {
                    if first_error.is_none() {
                        first_error = Some(Error::LockConflict(Box::new(lock)));
                    } else {
                        log::warn!("batch_get sub-task {} was also locked: {:?}", idx, lock);
                    }
                    continue;
                }
                TxnResult::WriteConflict => {
                    if first_error.is_none() {
                        first_error = Some(Error::WriteConflict);
                    } else {
                        log::warn!("batch_get sub-task {} also hit a write conflict", idx);
                    }
                    continue;
                }
                TxnResult::TxnNotFound => {}
            }
            results.extend(resp.kvs.into_iter().filter(|(_, v)| !v.is_empty()));
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Streams a ranged scan, merging server results with buffered
    /// mutations per spec §4.6. One shard is scanned at a time; once its
    /// range is exhausted the cursor's `next_key` advances to the shard's
    /// `range.end` and the routing cache is consulted for the next shard.
    pub async fn scan(&mut self, start: &[u8], end: &[u8], limit: u32) -> Result<Vec<(Key, Value)>> {
        self.require_state(&[TxnState::Active])?;
        if start.is_empty() || end.is_empty() || start >= end {
            return Err(Error::InvalidArgument(
                "scan requires non-empty bounds with start < end".to_string(),
            ));
        }

        let cursor_key = (start.to_vec(), end.to_vec());
        let mut cursor = match self.scan_cursors.remove(&cursor_key) {
            Some(cursor) => cursor,
            None => {
                let local_mutations = self.buffer.range(start, end);
                ScanCursor::new(start.to_vec(), end.to_vec(), local_mutations)
            }
        };
        let mut out = Vec::new();
        let mut remaining = limit;
        let start_ts = self.start_ts.expect("Active state implies start_ts is set");

        while remaining > 0 && !cursor.is_exhausted() {
            if cursor.needs_server_page() {
                let region = self
                    .stub
                    .region_cache
                    .lookup_region_between(&cursor.next_key, end)
                    .await?;
                let shard_end = if region.end_key.is_empty() || region.end_key.as_slice() > end {
                    end.to_vec()
                } else {
                    region.end_key.clone()
                };

                let context = self.context_for(&region);
                let resp = self
                    .stub
                    .dispatcher
                    .txn_scan(
                        TxnScanRequest {
                            start_ts,
                            start_key: cursor.next_key.clone(),
                            end_key: shard_end.clone(),
                            limit: remaining,
                            context,
                        },
                        &region,
                    )
                    .await?;
                match resp.txn_result {
                    TxnResult::Ok => {}
                    TxnResult::Locked(lock) => return Err(Error::LockConflict(Box::new(lock))),
                    TxnResult::WriteConflict => return Err(Error::WriteConflict),
                    TxnResult::TxnNotFound => {}
                }
                cursor.load_server_page(shard_end, resp.kvs, resp.has_more);
            }

            match cursor.next(&mut remaining) {
                Some(kv) => out.push(kv),
                None => {
                    // Current shard's page (possibly empty) is drained.
                    if cursor.shard_done() {
                        let shard_end = cursor
                            .current_shard_end()
                            .cloned()
                            .expect("a server page was loaded before shard_done can be true");
                        if shard_end.as_slice() >= end {
                            break;
                        }
                        cursor.advance_to_next_shard();
                    } else {
                        // Page not yet loaded for this iteration; loop back
                        // so `needs_server_page` fires.
                        continue;
                    }
                }
            }
        }
        if !cursor.is_exhausted() {
            self.scan_cursors.insert(cursor_key, cursor);
        }
        Ok(out)
    }

    // -- local writes --------------------------------------------------

    pub fn put(&mut self, key: Key, value: Value) {
        self.buffer.put(key, value);
    }

    pub fn batch_put(&mut self, kvs: Vec<(Key, Value)>) {
        for (k, v) in kvs {
            self.buffer.put(k, v);
        }
    }

    pub fn put_if_absent(&mut self, key: Key, value: Value) {
        self.buffer.put_if_absent(key, value);
    }

    pub fn batch_put_if_absent(&mut self, kvs: Vec<(Key, Value)>) {
        for (k, v) in kvs {
            self.buffer.put_if_absent(k, v);
        }
    }

    pub fn delete(&mut self, key: Key) {
        self.buffer.delete(key);
    }

    pub fn batch_delete(&mut self, keys: Vec<Key>) {
        for k in keys {
            self.buffer.delete(k);
        }
    }

    // -- commit path ------------------------------------------------

    /// PreCommit protocol (spec §4.7).
    pub async fn pre_commit(&mut self) -> Result<()> {
        self.require_state(&[TxnState::Active])?;
        self.state = TxnState::PreCommitting;

        if self.buffer.is_empty() {
            self.state = TxnState::PreCommitted;
            return Ok(());
        }

        let start_ts = self.start_ts.expect("Active state implies start_ts is set");
        let mutations = self.buffer.mutations();

        // Determine is_one_pc: every buffered key resolves to the same region.
        let mut regions = Vec::with_capacity(mutations.len());
        for m in &mutations {
            regions.push(self.stub.region_cache.lookup_region_by_key(&m.key).await?);
        }
        let first_region_id = regions[0].id;
        self.is_one_pc = regions.iter().all(|r| r.id == first_region_id);

        let primary_key = self
            .buffer
            .primary_key()
            .cloned()
            .expect("non-empty buffer has a primary key");
        self.primary_key = Some(primary_key.clone());

        if self.is_one_pc {
            let region = regions[0].clone();
            let wire_mutations: Vec<WireMutation> = mutations.iter().map(WireMutation::from).collect();
            let context = self.context_for(&region);
            let resp = self
                .stub
                .dispatcher
                .txn_prewrite(
                    TxnPrewriteRequest {
                        start_ts,
                        mutations: wire_mutations,
                        primary_lock: primary_key.clone(),
                        lock_ttl: self.stub.config.lock_ttl_ms,
                        txn_size: self.buffer.size() as u64,
                        try_one_pc: true,
                        context,
                    },
                    &region,
                )
                .await?;
            self.handle_prewrite_results(resp.txn_results).await?;
            match resp.one_pc_commit_ts {
                Some(commit_ts) => {
                    self.commit_ts = Some(commit_ts);
                    self.state = TxnState::Committed;
                }
                None => {
                    // Server declined one-phase commit and fell back to
                    // ordinary 2PC locks; all mutations are prewritten (not
                    // committed) in `region`. Let `commit()` run the real
                    // second phase.
                    log::debug!(
                        "one-pc prewrite for txn {:?} fell back to 2PC locks",
                        start_ts
                    );
                    self.is_one_pc = false;
                    self.state = TxnState::PreCommitted;
                }
            }
            return Ok(());
        }

        // Multi-shard path: primary first, then secondaries grouped by
        // shard, chunked to at most max_batch_count per RPC, in parallel.
        let primary_index = mutations
            .iter()
            .position(|m| m.key == primary_key)
            .expect("primary key must be one of the buffered mutations");
        let primary_region = regions[primary_index].clone();
        let primary_entry = mutations[primary_index].clone();
        let context = self.context_for(&primary_region);
        let primary_resp = self
            .stub
            .dispatcher
            .txn_prewrite(
                TxnPrewriteRequest {
                    start_ts,
                    mutations: vec![WireMutation::from(&primary_entry)],
                    primary_lock: primary_key.clone(),
                    lock_ttl: self.stub.config.lock_ttl_ms,
                    txn_size: self.buffer.size() as u64,
                    try_one_pc: false,
                    context,
                },
                &primary_region,
            )
            .await?;
        self.handle_prewrite_results(primary_resp.txn_results).await?;

        let mut by_region: HashMap<crate::region::RegionId, (Region, Vec<WireMutation>)> = HashMap::new();
        for (m, region) in mutations.iter().zip(regions.iter()) {
            if m.key == primary_key {
                continue;
            }
            by_region
                .entry(region.id)
                .or_insert_with(|| (region.clone(), Vec::new()))
                .1
                .push(WireMutation::from(m));
        }

        let max_batch = self.stub.config.max_batch_count;
        let start_ts_c = start_ts;
        let lock_ttl = self.stub.config.lock_ttl_ms;
        let txn_size = self.buffer.size() as u64;
        let isolation = self.options.isolation;
        let dispatcher = self.stub.dispatcher.clone();
        let mut tasks = Vec::new();
        for (region, wire_mutations) in by_region.into_values() {
            for chunk in wire_mutations.chunks(max_batch.max(1)).map(|c| c.to_vec()) {
                let region = region.clone();
                let primary_key = primary_key.clone();
                let dispatcher = dispatcher.clone();
                tasks.push(move || async move {
                    let context = Context {
                        region_id: region.id,
                        epoch: region.epoch,
                        isolation_level: isolation,
                    };
                    dispatcher
                        .txn_prewrite(
                            TxnPrewriteRequest {
                                start_ts: start_ts_c,
                                mutations: chunk,
                                primary_lock: primary_key,
                                lock_ttl,
                                txn_size,
                                try_one_pc: false,
                                context,
                            },
                            &region,
                        )
                        .await
                });
            }
        }

        let responses = execute_parallel(tasks, || {
            Err(Error::Transport("prewrite sub-task panicked".to_string()))
        })
        .await;

        let mut first_error: Option<Error> = None;
        for (idx, resp) in responses.into_iter().enumerate() {
            let result = match resp {
                Ok(resp) => self.handle_prewrite_results(resp.txn_results).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    log::warn!("prewrite sub-task {} also failed: {}", idx, e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.state = TxnState::PreCommitted;
        Ok(())
    }

    /// Per-response handling: `LockConflict` resolves and retries this
    /// sub-task (bounded); `WriteConflict` aborts with no retry;
    /// otherwise OK.
    async fn handle_prewrite_results(&self, results: Vec<TxnResult>) -> Result<()> {
        for result in results {
            match result {
                TxnResult::Ok => {}
                TxnResult::WriteConflict => return Err(Error::WriteConflict),
                TxnResult::TxnNotFound => return Err(Error::TxnNotFound),
                TxnResult::Locked(lock) => {
                    let max_retry = self.stub.config.max_retry;
                    let mut resolved = false;
                    for attempt in 0..=max_retry {
                        match self
                            .stub
                            .lock_resolver
                            .resolve(&lock, self.start_ts.unwrap_or_else(Timestamp::zero))
                            .await?
                        {
                            ResolveStatus::Resolved => {
                                resolved = true;
                                break;
                            }
                            ResolveStatus::StillLocked => {
                                if attempt == max_retry {
                                    break;
                                }
                                let delay =
                                    self.options.retry_options.lock_backoff.delay_for(attempt);
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                    if !resolved {
                        return Err(Error::LockConflict(Box::new(lock)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit protocol (spec §4.7). Requires *PreCommitted*; idempotent on
    /// an already-*Committed* transaction.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state == TxnState::Committed {
            return Ok(());
        }
        self.require_state(&[TxnState::PreCommitted])?;
        self.state = TxnState::Committing;

        let start_ts = self.start_ts.expect("Active state implies start_ts is set");
        let commit_ts = self.stub.time_oracle.get_timestamp().await?;
        assert!(commit_ts > start_ts, "commit_ts must exceed start_ts");
        self.commit_ts = Some(commit_ts);

        let primary_key = self
            .primary_key
            .clone()
            .expect("PreCommitted implies a primary key was selected");
        let primary_region = self.stub.region_cache.lookup_region_by_key(&primary_key).await?;
        let context = self.context_for(&primary_region);
        let primary_resp = self
            .stub
            .dispatcher
            .txn_commit(
                TxnCommitRequest {
                    start_ts,
                    commit_ts,
                    keys: vec![primary_key.clone()],
                    context,
                },
                &primary_region,
            )
            .await?;

        match primary_resp.txn_result {
            TxnResult::WriteConflict => {
                self.state = TxnState::RolledBack;
                return Err(Error::TxnRolledBack);
            }
            TxnResult::TxnNotFound => {
                // The server lost our lock: fatal, per spec §9(a) -- never
                // logged-and-continued, unlike secondary-key failures below.
                return Err(Error::TxnNotFound);
            }
            TxnResult::Locked(_) | TxnResult::Ok => {}
        }

        self.state = TxnState::Committed;

        // Best-effort secondary commits: failures here are logged and
        // ignored, the txn is already durably committed by the primary
        // marker (spec §4.7 Commit protocol step 3).
        let secondary_keys: Vec<Key> = self
            .buffer
            .mutations()
            .into_iter()
            .map(|e| e.key)
            .filter(|k| k != &primary_key)
            .collect();
        if secondary_keys.is_empty() {
            return Ok(());
        }

        let mut by_region: HashMap<crate::region::RegionId, (Region, Vec<Key>)> = HashMap::new();
        for key in secondary_keys {
            let region = match self.stub.region_cache.lookup_region_by_key(&key).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("post-primary-commit: routing lookup for {:?} failed: {}", key, e);
                    continue;
                }
            };
            by_region
                .entry(region.id)
                .or_insert_with(|| (region.clone(), Vec::new()))
                .1
                .push(key);
        }

        let isolation = self.options.isolation;
        let dispatcher = self.stub.dispatcher.clone();
        let tasks: Vec<_> = by_region
            .into_values()
            .map(|(region, keys)| {
                let dispatcher = dispatcher.clone();
                move || async move {
                    let context = Context {
                        region_id: region.id,
                        epoch: region.epoch,
                        isolation_level: isolation,
                    };
                    dispatcher
                        .txn_commit(
                            TxnCommitRequest {
                                start_ts,
                                commit_ts,
                                keys,
                                context,
                            },
                            &region,
                        )
                        .await
                }
            })
            .collect();

        let responses = execute_parallel(tasks, || {
            Err(Error::Transport("secondary commit sub-task panicked".to_string()))
        })
        .await;
        for resp in responses {
            if let Err(e) = resp {
                log::warn!("post-primary-commit: secondary commit failed, will be cleaned up by a future lock resolver: {}", e);
            }
        }
        Ok(())
    }

    /// Rollback protocol (spec §4.7). Primary-key rollback must succeed;
    /// secondary-key rollbacks are best-effort.
    pub async fn rollback(&mut self) -> Result<()> {
        self.require_state(&[TxnState::PreCommitting, TxnState::PreCommitted, TxnState::RollingBack])?;
        self.state = TxnState::RollingBack;

        if self.buffer.is_empty() {
            self.state = TxnState::RolledBack;
            return Ok(());
        }
        let start_ts = self.start_ts.expect("Active state implies start_ts is set");
        let all_keys: Vec<Key> = self.buffer.mutations().into_iter().map(|e| e.key).collect();
        let primary_key = self
            .primary_key
            .clone()
            .unwrap_or_else(|| all_keys[0].clone());

        let primary_region = self.stub.region_cache.lookup_region_by_key(&primary_key).await?;
        let context = self.context_for(&primary_region);
        self.stub
            .dispatcher
            .txn_batch_rollback(
                TxnBatchRollbackRequest {
                    start_ts,
                    keys: vec![primary_key.clone()],
                    context,
                },
                &primary_region,
            )
            .await?;

        let mut by_region: HashMap<crate::region::RegionId, (Region, Vec<Key>)> = HashMap::new();
        for key in all_keys.into_iter().filter(|k| k != &primary_key) {
            let region = match self.stub.region_cache.lookup_region_by_key(&key).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("rollback: routing lookup for {:?} failed: {}", key, e);
                    continue;
                }
            };
            by_region
                .entry(region.id)
                .or_insert_with(|| (region.clone(), Vec::new()))
                .1
                .push(key);
        }

        let isolation = self.options.isolation;
        let dispatcher = self.stub.dispatcher.clone();
        let tasks: Vec<_> = by_region
            .into_values()
            .map(|(region, keys)| {
                let dispatcher = dispatcher.clone();
                move || async move {
                    let context = Context {
                        region_id: region.id,
                        epoch: region.epoch,
                        isolation_level: isolation,
                    };
                    dispatcher
                        .txn_batch_rollback(TxnBatchRollbackRequest { start_ts, keys, context }, &region)
                        .await
                }
            })
            .collect();

        let responses = execute_parallel(tasks, || {
            Err(Error::Transport("secondary rollback sub-task panicked".to_string()))
        })
        .await;
        for resp in responses {
            if let Err(e) = resp {
                log::warn!("rollback: secondary rollback failed, best-effort: {}", e);
            }
        }

        self.state = TxnState::RolledBack;
        Ok(())
    }
}
