// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Hash-table primitives for join key indexing.
//!
//! Responsibilities:
//! - Stores the build row addresses of one partition and links them into hash bucket chains.
//! - Keeps an atomic matched bitmap over the partition's rows for outer-join bookkeeping.
//! - Reserves memory against its tracker before every allocation that grows it.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`.
//! - Functions: `pack_address`, `unpack_address`.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::error::{ExecError, ExecResult};
use crate::exec::hash_table::hash::hash_u64_with_seed;
use crate::runtime::mem_tracker::{MemReservation, MemTracker};

pub(crate) const ROW_NONE: u32 = u32::MAX;

// Re-mix row hashes before bucketing: rows of one partition share `hash % partition_count`.
const BUCKET_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

const ROW_BYTES: usize = mem::size_of::<u64>() + mem::size_of::<u32>();

/// Pack a (chunk index, row index) pair into one build address.
pub(crate) fn pack_address(chunk_idx: u32, row: u32) -> u64 {
    ((chunk_idx as u64) << 32) | row as u64
}

pub(crate) fn unpack_address(address: u64) -> (usize, usize) {
    ((address >> 32) as usize, (address & 0xffff_ffff) as usize)
}

fn bucket_count_for(expected_rows: usize) -> usize {
    expected_rows.max(1).next_power_of_two()
}

fn vec_bytes<T>(v: &Vec<T>) -> i64 {
    let bytes = v.capacity().saturating_mul(mem::size_of::<T>());
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Chained hash table over the build rows of one partition.
///
/// Every row of the partition gets a row id, including rows with a null key; only
/// rows with non-null keys are linked into a bucket chain, so null keys never match.
pub struct JoinHashTable {
    bucket_head: Vec<u32>,
    row_next: Vec<u32>,
    addresses: Vec<u64>,
    matched: Vec<AtomicU64>,
    mask: u64,
    finalized: bool,
    reservation: MemReservation,
}

impl JoinHashTable {
    /// Create a table sized for `expected_rows`. The bucket array is fixed from here on.
    pub fn try_new(expected_rows: usize, tracker: Arc<MemTracker>) -> ExecResult<Self> {
        let bucket_count = bucket_count_for(expected_rows);
        if bucket_count > u32::MAX as usize {
            return Err(ExecError::internal(format!(
                "join hash table too large: expected_rows={expected_rows}"
            )));
        }
        let mut reservation = MemReservation::new(tracker);
        let predicted = bucket_count
            .saturating_mul(mem::size_of::<u32>())
            .saturating_add(expected_rows.saturating_mul(ROW_BYTES));
        reservation.set_bytes(i64::try_from(predicted).unwrap_or(i64::MAX))?;
        let mut table = Self {
            bucket_head: vec![ROW_NONE; bucket_count],
            row_next: Vec::with_capacity(expected_rows),
            addresses: Vec::with_capacity(expected_rows),
            matched: Vec::new(),
            mask: (bucket_count - 1) as u64,
            finalized: false,
            reservation,
        };
        table.refresh_accounting()?;
        Ok(table)
    }

    pub fn num_rows(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_head.len()
    }

    pub fn tracked_bytes(&self) -> i64 {
        vec_bytes(&self.bucket_head)
            .saturating_add(vec_bytes(&self.row_next))
            .saturating_add(vec_bytes(&self.addresses))
            .saturating_add(vec_bytes(&self.matched))
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        self.reservation.tracker()
    }

    /// Move the table's reservation to another tracker without limit checks.
    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.reservation.transfer_to(tracker);
    }

    /// Make room for `additional` more rows, reserving memory before growing.
    pub fn reserve_rows(&mut self, additional: usize) -> ExecResult<()> {
        if self.finalized {
            return Err(ExecError::internal("join hash table already finalized"));
        }
        let needed = self.addresses.len().saturating_add(additional);
        if needed > ROW_NONE as usize {
            return Err(ExecError::internal("join build row count overflow"));
        }
        if needed <= self.addresses.capacity() {
            return Ok(());
        }
        let grown = needed.max(self.addresses.capacity().saturating_mul(2));
        let predicted = self.reservation.bytes().saturating_add(
            i64::try_from((grown - self.addresses.capacity()).saturating_mul(ROW_BYTES))
                .unwrap_or(i64::MAX),
        );
        self.reservation.set_bytes(predicted)?;
        self.addresses.reserve_exact(grown - self.addresses.len());
        self.row_next.reserve_exact(grown - self.row_next.len());
        self.refresh_accounting()
    }

    /// Append one build row. `hash` is `None` for rows with a null key component.
    pub fn append_row(&mut self, address: u64, hash: Option<u64>) -> ExecResult<u32> {
        if self.addresses.len() == self.addresses.capacity() {
            self.reserve_rows(1)?;
        }
        if self.finalized {
            return Err(ExecError::internal("join hash table already finalized"));
        }
        let row_id = self.addresses.len() as u32;
        self.addresses.push(address);
        match hash {
            Some(hash) => {
                let bucket = self.bucket_of(hash);
                self.row_next.push(self.bucket_head[bucket]);
                self.bucket_head[bucket] = row_id;
            }
            None => self.row_next.push(ROW_NONE),
        }
        Ok(row_id)
    }

    /// Allocate the matched bitmap and freeze the table.
    pub fn finalize(&mut self) -> ExecResult<()> {
        if self.finalized {
            return Ok(());
        }
        let words = self.addresses.len().div_ceil(64);
        let predicted = self.reservation.bytes().saturating_add(
            i64::try_from(words.saturating_mul(mem::size_of::<AtomicU64>())).unwrap_or(i64::MAX),
        );
        self.reservation.set_bytes(predicted)?;
        self.matched = (0..words).map(|_| AtomicU64::new(0)).collect();
        self.finalized = true;
        self.refresh_accounting()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash_u64_with_seed(BUCKET_SEED, hash) & self.mask) as usize
    }

    /// Head of the chain `hash` falls into, or `ROW_NONE`.
    pub fn first_row(&self, hash: u64) -> u32 {
        self.bucket_head[self.bucket_of(hash)]
    }

    pub fn next_row(&self, row_id: u32) -> u32 {
        self.row_next
            .get(row_id as usize)
            .copied()
            .unwrap_or(ROW_NONE)
    }

    pub fn address(&self, row_id: u32) -> ExecResult<u64> {
        self.addresses.get(row_id as usize).copied().ok_or_else(|| {
            ExecError::internal(format!(
                "join row id {} out of range (rows={})",
                row_id,
                self.addresses.len()
            ))
        })
    }

    pub fn mark_matched(&self, row_id: u32) {
        if let Some(word) = self.matched.get(row_id as usize / 64) {
            word.fetch_or(1u64 << (row_id % 64), Ordering::Relaxed);
        }
    }

    pub fn is_matched(&self, row_id: u32) -> bool {
        self.matched
            .get(row_id as usize / 64)
            .map(|word| word.load(Ordering::Relaxed) & (1u64 << (row_id % 64)) != 0)
            .unwrap_or(false)
    }

    /// Addresses of every row never marked matched, in row id order.
    pub fn unmatched_addresses(&self) -> Vec<u64> {
        (0..self.addresses.len() as u32)
            .filter(|&row_id| !self.is_matched(row_id))
            .map(|row_id| self.addresses[row_id as usize])
            .collect()
    }

    fn refresh_accounting(&mut self) -> ExecResult<()> {
        let bytes = self.tracked_bytes();
        if bytes != self.reservation.bytes() {
            self.reservation.set_bytes(bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_hold_rows_with_the_same_hash() {
        let tracker = MemTracker::new_root("table");
        let mut table = JoinHashTable::try_new(4, Arc::clone(&tracker)).expect("table");
        let a = table.append_row(pack_address(0, 0), Some(7)).expect("row");
        table.append_row(pack_address(0, 1), Some(9)).expect("row");
        let c = table.append_row(pack_address(1, 2), Some(7)).expect("row");
        table.finalize().expect("finalize");

        let mut chain = Vec::new();
        let mut row = table.first_row(7);
        while row != ROW_NONE {
            chain.push(row);
            row = table.next_row(row);
        }
        assert!(chain.contains(&a) && chain.contains(&c));
        // Newest rows are linked at the chain head.
        assert!(chain.iter().position(|r| *r == c) < chain.iter().position(|r| *r == a));
        assert_eq!(unpack_address(table.address(c).expect("address")), (1, 2));
    }

    #[test]
    fn null_rows_get_ids_but_no_chain() {
        let tracker = MemTracker::new_root("table");
        let mut table = JoinHashTable::try_new(1, tracker).expect("table");
        let row = table.append_row(pack_address(0, 0), None).expect("row");
        table.finalize().expect("finalize");
        assert_eq!(table.num_rows(), 1);
        assert_eq!(table.next_row(row), ROW_NONE);
        assert_eq!(table.unmatched_addresses(), vec![pack_address(0, 0)]);
    }

    #[test]
    fn matched_bits_are_sticky() {
        let tracker = MemTracker::new_root("table");
        let mut table = JoinHashTable::try_new(100, tracker).expect("table");
        for i in 0..100u32 {
            table.append_row(pack_address(0, i), Some(i as u64)).expect("row");
        }
        table.finalize().expect("finalize");
        table.mark_matched(65);
        table.mark_matched(65);
        assert!(table.is_matched(65));
        assert!(!table.is_matched(64));
        assert_eq!(table.unmatched_addresses().len(), 99);
    }

    #[test]
    fn growth_is_accounted_and_released_on_drop() {
        let root = MemTracker::new_root("task");
        let tracker = MemTracker::new_child("op", &root);
        {
            let mut table = JoinHashTable::try_new(2, Arc::clone(&tracker)).expect("table");
            for i in 0..50u32 {
                table.append_row(pack_address(0, i), Some(i as u64)).expect("row");
            }
            table.finalize().expect("finalize");
            assert_eq!(tracker.current(), table.tracked_bytes());
            assert!(tracker.current() >= (50 * ROW_BYTES) as i64);
        }
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn limit_is_checked_before_allocation() {
        let root = MemTracker::new_root_with_limit("task", 64);
        let err = JoinHashTable::try_new(1024, Arc::clone(&root)).err().expect("limit");
        assert!(err.is_mem_limit_exceeded());
        assert_eq!(root.current(), 0);
    }
}
