// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Public entry point applications use to begin transactions (spec §10.1).

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::region::RegionCache;
use crate::resolve_lock::LockResolver;
use crate::rpc::Dispatcher;
use crate::timestamp::TimeOracle;
use crate::transaction::{ClientStub, Transaction, TransactionOptions};

/// Bundles the shared, process-wide service handles (routing cache, time
/// oracle, lock resolver, RPC dispatcher) and hands out `Transaction`s.
/// Constructed once per process and cloned cheaply (it's `Arc`-backed
/// internally); no global singleton is required, so tests construct one
/// from fakes implementing the same traits.
#[derive(Clone)]
pub struct TransactionClient {
    stub: Arc<ClientStub>,
}

impl TransactionClient {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        region_cache: Arc<dyn RegionCache>,
        time_oracle: Arc<dyn TimeOracle>,
        config: Config,
    ) -> Self {
        let lock_resolver = Arc::new(LockResolver::new(dispatcher.clone(), region_cache.clone()));
        TransactionClient {
            stub: Arc::new(ClientStub {
                dispatcher,
                region_cache,
                time_oracle,
                lock_resolver,
                config,
            }),
        }
    }

    /// Begins an optimistic, snapshot-isolation transaction with default
    /// options.
    pub async fn begin(&self) -> Result<Transaction> {
        self.begin_with_options(TransactionOptions::new_optimistic()).await
    }

    pub async fn begin_pessimistic(&self) -> Result<Transaction> {
        self.begin_with_options(TransactionOptions::new_pessimistic()).await
    }

    pub async fn begin_with_options(&self, options: TransactionOptions) -> Result<Transaction> {
        let mut txn = Transaction::new(self.stub.clone(), options);
        txn.begin().await?;
        Ok(txn)
    }

    /// Current oracle timestamp, useful for read-only snapshots outside a
    /// full transaction.
    pub async fn current_timestamp(&self) -> Result<crate::timestamp::Timestamp> {
        self.stub.time_oracle.get_timestamp().await
    }
}
