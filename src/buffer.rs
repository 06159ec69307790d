// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Write Buffer (C3, spec §4.1).
//!
//! A transaction's local mutations, kept as a well-ordered map so range
//! reads can be merged against server-side scans in key order (§4.6).

use std::collections::BTreeMap;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// A closed tagged union over mutation kinds; every consumer (scan merge,
/// prewrite marshaling) must match exhaustively rather than add a subtype.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Put(Value),
    PutIfAbsent(Value),
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferEntry {
    pub key: Key,
    pub mutation: Mutation,
}

#[derive(Default)]
pub struct WriteBuffer {
    entries: BTreeMap<Key, Mutation>,
    primary_key: Option<Key>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer::default()
    }

    fn remember_primary(&mut self, key: &[u8]) {
        if self.primary_key.is_none() {
            self.primary_key = Some(key.to_vec());
        }
    }

    pub fn put(&mut self, key: Key, value: Value) {
        self.remember_primary(&key);
        self.entries.insert(key, Mutation::Put(value));
    }

    /// If the key is absent, inserts as `PutIfAbsent`. If present as
    /// `Delete`, replaces with `Put`. If present as `Put`/`PutIfAbsent`, the
    /// existing value wins and this is a no-op.
    pub fn put_if_absent(&mut self, key: Key, value: Value) {
        self.remember_primary(&key);
        match self.entries.get(&key) {
            None => {
                self.entries.insert(key, Mutation::PutIfAbsent(value));
            }
            Some(Mutation::Delete) => {
                self.entries.insert(key, Mutation::Put(value));
            }
            Some(Mutation::Put(_)) | Some(Mutation::PutIfAbsent(_)) => {}
        }
    }

    pub fn delete(&mut self, key: Key) {
        self.remember_primary(&key);
        self.entries.insert(key, Mutation::Delete);
    }

    pub fn get(&self, key: &[u8]) -> Option<&Mutation> {
        self.entries.get(key)
    }

    /// Entries with `start <= key < end`, in ascending key order.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<BufferEntry> {
        self.entries
            .range::<[u8], _>(start..)
            .take_while(|(k, _)| end.is_empty() || k.as_slice() < end)
            .map(|(k, m)| BufferEntry {
                key: k.clone(),
                mutation: m.clone(),
            })
            .collect()
    }

    pub fn mutations(&self) -> Vec<BufferEntry> {
        self.entries
            .iter()
            .map(|(k, m)| BufferEntry {
                key: k.clone(),
                mutation: m.clone(),
            })
            .collect()
    }

    /// The key of the first (smallest) entry, stable for the transaction's
    /// lifetime once an entry has ever been inserted.
    pub fn primary_key(&self) -> Option<&Key> {
        self.primary_key.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}
