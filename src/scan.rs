// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Scan Merger (C7, spec §4.6) and Scan Cursor (spec §3).

use crate::buffer::{BufferEntry, Key, Mutation, Value};

/// Appends a single zero byte, the minimal big-endian increment that
/// produces the smallest key strictly greater than `key`. Used to advance
/// `next_key` past the last emitted key so a resumed scan never re-emits
/// it (spec §9(c)).
pub fn key_successor(key: &[u8]) -> Key {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// One per active `Scan` range; owned by the `Transaction`.
pub struct ScanCursor {
    pub start_key: Key,
    pub end_key: Key,
    pub next_key: Key,
    pending_server_kvs: Vec<(Key, Value)>,
    pending_offset: usize,
    local_mutations: Vec<BufferEntry>,
    local_offset: usize,
    shard_exhausted: bool,
    /// End of the shard the current page was fetched from, set alongside
    /// `load_server_page` so it survives across separate `Transaction::scan`
    /// calls on a resumed cursor (unlike a caller-local variable, which would
    /// be lost the moment the cursor outlives one call).
    current_shard_end: Option<Key>,
}

impl ScanCursor {
    pub fn new(start_key: Key, end_key: Key, local_mutations: Vec<BufferEntry>) -> Self {
        ScanCursor {
            next_key: start_key.clone(),
            start_key,
            end_key,
            pending_server_kvs: Vec::new(),
            pending_offset: 0,
            local_mutations,
            local_offset: 0,
            shard_exhausted: false,
            current_shard_end: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        !self.end_key.is_empty() && self.next_key.as_slice() >= self.end_key.as_slice()
    }

    pub fn current_shard_end(&self) -> Option<&Key> {
        self.current_shard_end.as_ref()
    }

    /// Feeds a fresh page of server-side results for the current shard,
    /// fetched up to `shard_end`. Any kv at or past `end_key` is dropped --
    /// a dispatcher should never return one, but the cursor's own half-open
    /// bound is authoritative, and treating a boundary hit as the shard's
    /// last page means `shard_done` still converges correctly even if the
    /// page also claims `has_more`.
    pub fn load_server_page(&mut self, shard_end: Key, kvs: Vec<(Key, Value)>, has_more: bool) {
        let boundary = if self.end_key.is_empty() {
            None
        } else {
            kvs.iter().position(|(k, _)| k.as_slice() >= self.end_key.as_slice())
        };
        let hit_boundary = boundary.is_some();
        self.pending_server_kvs = match boundary {
            Some(idx) => kvs.into_iter().take(idx).collect(),
            None => kvs,
        };
        self.pending_offset = 0;
        self.shard_exhausted = hit_boundary || !has_more;
        self.current_shard_end = Some(shard_end);
    }

    pub fn needs_server_page(&self) -> bool {
        self.pending_offset >= self.pending_server_kvs.len() && !self.shard_exhausted
    }

    /// True once the current shard's page is drained and the shard itself
    /// reported no further pages -- the caller should advance to the next
    /// shard via the routing cache.
    pub fn shard_done(&self) -> bool {
        self.pending_offset >= self.pending_server_kvs.len() && self.shard_exhausted
    }

    /// Resets shard-local state so the cursor can be primed against the
    /// next region after advancing `next_key` to the just-finished shard's
    /// end.
    pub fn advance_to_next_shard(&mut self) {
        self.next_key = self.current_shard_end.clone().unwrap_or_else(|| self.end_key.clone());
        self.pending_server_kvs.clear();
        self.pending_offset = 0;
        self.shard_exhausted = false;
        self.current_shard_end = None;
    }

    fn peek_local(&self) -> Option<&BufferEntry> {
        self.local_mutations.get(self.local_offset)
    }

    fn peek_server(&self) -> Option<&(Key, Value)> {
        self.pending_server_kvs.get(self.pending_offset)
    }

    /// Pulls the next `(key, value)` pair out of the merge, per the rule in
    /// spec §4.6. Returns `None` when the current server page and buffered
    /// range are both drained (caller must then check `shard_done` /
    /// `needs_server_page` / `is_exhausted`).
    pub fn next(&mut self, limit_remaining: &mut u32) -> Option<(Key, Value)> {
        loop {
            if *limit_remaining == 0 {
                return None;
            }
            if self.is_exhausted() {
                return None;
            }
            match (self.peek_local(), self.peek_server()) {
                (None, None) => return None,
                (None, Some((sk, sv))) => {
                    let out = (sk.clone(), sv.clone());
                    self.pending_offset += 1;
                    *limit_remaining -= 1;
                    self.next_key = key_successor(&out.0);
                    return Some(out);
                }
                (Some(b), None) => {
                    let out = self.emit_or_skip_buffered(b.clone());
                    self.local_offset += 1;
                    if let Some(kv) = out {
                        *limit_remaining -= 1;
                        self.next_key = key_successor(&kv.0);
                        return Some(kv);
                    }
                    // Delete: skip and loop to re-compare.
                    continue;
                }
                (Some(b), Some((sk, sv))) => {
                    if b.key.as_slice() < sk.as_slice() {
                        let entry = b.clone();
                        self.local_offset += 1;
                        if let Some(kv) = self.emit_or_skip_buffered(entry) {
                            *limit_remaining -= 1;
                            self.next_key = key_successor(&kv.0);
                            return Some(kv);
                        }
                        continue;
                    } else if b.key.as_slice() == sk.as_slice() {
                        let entry = b.clone();
                        self.local_offset += 1;
                        self.pending_offset += 1;
                        match entry.mutation {
                            Mutation::Put(v) | Mutation::PutIfAbsent(v) => {
                                let out = (entry.key, v);
                                *limit_remaining -= 1;
                                self.next_key = key_successor(&out.0);
                                return Some(out);
                            }
                            Mutation::Delete => continue,
                        }
                    } else {
                        let out = (sk.clone(), sv.clone());
                        self.pending_offset += 1;
                        *limit_remaining -= 1;
                        self.next_key = key_successor(&out.0);
                        return Some(out);
                    }
                }
            }
        }
    }

    fn emit_or_skip_buffered(&self, entry: BufferEntry) -> Option<(Key, Value)> {
        match entry.mutation {
            Mutation::Put(v) | Mutation::PutIfAbsent(v) => Some((entry.key, v)),
            Mutation::Delete => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_scan_merge_scenario() {
        let local = vec![
            BufferEntry {
                key: b"b".to_vec(),
                mutation: Mutation::Put(b"B".to_vec()),
            },
            BufferEntry {
                key: b"c".to_vec(),
                mutation: Mutation::Delete,
            },
        ];
        let mut cursor = ScanCursor::new(b"a".to_vec(), b"d".to_vec(), local);
        cursor.load_server_page(
            b"d".to_vec(),
            vec![
                (b"a".to_vec(), b"A".to_vec()),
                (b"c".to_vec(), b"C".to_vec()),
                (b"d".to_vec(), b"D".to_vec()),
            ],
            false,
        );

        let mut limit = 10u32;
        let mut out = Vec::new();
        while let Some(kv) = cursor.next(&mut limit) {
            out.push(kv);
        }
        assert_eq!(
            out,
            vec![(b"a".to_vec(), b"A".to_vec()), (b"b".to_vec(), b"B".to_vec())]
        );
    }

    #[test]
    fn limit_stops_scan_and_preserves_resume_state() {
        let mut cursor = ScanCursor::new(b"a".to_vec(), b"z".to_vec(), Vec::new());
        cursor.load_server_page(
            b"z".to_vec(),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ],
            false,
        );
        let mut limit = 2u32;
        let mut out = Vec::new();
        while let Some(kv) = cursor.next(&mut limit) {
            out.push(kv);
        }
        assert_eq!(out.len(), 2);
        assert_eq!(cursor.next_key, key_successor(b"b"));
    }

    #[test]
    fn resume_is_idempotent_no_reemission() {
        let mut cursor = ScanCursor::new(b"a".to_vec(), b"z".to_vec(), Vec::new());
        cursor.load_server_page(b"z".to_vec(), vec![(b"a".to_vec(), b"1".to_vec())], false);
        let mut limit = 1u32;
        let first = cursor.next(&mut limit);
        assert_eq!(first, Some((b"a".to_vec(), b"1".to_vec())));
        assert!(cursor.next_key.as_slice() > b"a".as_slice());
    }
}
