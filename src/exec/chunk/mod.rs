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
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::{Schema, SchemaRef};

use crate::common::error::ExecResult;
use crate::runtime::mem_tracker::MemTracker;

/// A chunk of data, consisting of multiple rows.
///
/// Wraps an Arrow RecordBatch, which guarantees every column has the chunk's row count.
/// A chunk may carry memory accounting: it is charged once to the tracker of the
/// operator that first retains it and can later move between trackers. Clones share
/// the accounting, which is released when the last clone drops.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    accounting: Option<Arc<ChunkAccounting>>,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            accounting: None,
        }
    }

    /// Build a chunk from columns, validating lengths and types against `schema`.
    pub fn try_from_columns(schema: SchemaRef, columns: Vec<ArrayRef>) -> ExecResult<Self> {
        Ok(Self::new(RecordBatch::try_new(schema, columns)?))
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, idx: usize) -> Option<&ArrayRef> {
        self.batch.columns().get(idx)
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self::new(self.batch.slice(offset, length))
    }

    pub fn logical_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }

    /// Bytes currently charged for this chunk, 0 when it is not accounted.
    pub fn charged_bytes(&self) -> i64 {
        self.accounting.as_ref().map(|a| a.bytes).unwrap_or(0)
    }

    pub fn charged_tracker(&self) -> Option<Arc<MemTracker>> {
        self.accounting.as_ref().map(|a| a.tracker())
    }

    /// Charge this chunk to `tracker`, honoring the tracker chain's limits.
    ///
    /// A chunk that is already charged is moved instead, which cannot fail.
    pub fn try_charge(&mut self, tracker: &Arc<MemTracker>) -> ExecResult<()> {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return Ok(());
        }
        let bytes = chunk_bytes_i64(&self.batch);
        if bytes <= 0 {
            return Ok(());
        }
        tracker.try_consume(bytes)?;
        self.accounting = Some(Arc::new(ChunkAccounting {
            bytes,
            tracker: Mutex::new(Arc::clone(tracker)),
        }));
        Ok(())
    }

    /// Move already-admitted accounting to `tracker`. Uncharged chunks stay uncharged.
    pub fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
        }
    }
}

impl From<RecordBatch> for Chunk {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new(RecordBatch::new_empty(Arc::new(Schema::empty())))
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single RecordBatch; buffers shared
/// across batches (e.g. slices) are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

fn chunk_bytes_i64(batch: &RecordBatch) -> i64 {
    i64::try_from(record_batch_bytes(batch)).unwrap_or(i64::MAX)
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.transfer_to(tracker, self.bytes);
        *guard = Arc::clone(tracker);
    }

    fn tracker(&self) -> Arc<MemTracker> {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        guard.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array};
    use arrow::datatypes::{DataType, Field};

    fn int_chunk(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        Chunk::try_from_columns(schema, vec![Arc::new(Int64Array::from(values))])
            .expect("chunk")
    }

    #[test]
    fn mismatched_column_lengths_are_rejected() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Int32, false),
        ]));
        let err = Chunk::try_from_columns(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![3])),
            ],
        )
        .expect_err("expected length mismatch");
        assert!(err.to_string().contains("arrow error"), "err={err}");
    }

    #[test]
    fn charge_is_shared_by_clones_and_released_by_last_drop() {
        let root = MemTracker::new_root("task");
        let op = MemTracker::new_child("op", &root);
        let mut chunk = int_chunk((0..128).collect());
        chunk.try_charge(&op).expect("charge");
        let bytes = chunk.charged_bytes();
        assert!(bytes >= 128 * 8);
        assert_eq!(op.current(), bytes);

        let clone = chunk.clone();
        drop(chunk);
        assert_eq!(op.current(), bytes);

        let other = MemTracker::new_child("other", &root);
        clone.transfer_to(&other);
        assert_eq!(op.current(), 0);
        assert_eq!(other.current(), bytes);
        assert_eq!(root.current(), bytes);

        drop(clone);
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn charge_failure_leaves_chunk_uncharged() {
        let root = MemTracker::new_root_with_limit("task", 16);
        let mut chunk = int_chunk((0..64).collect());
        let err = chunk.try_charge(&root).expect_err("expected limit");
        assert!(err.is_mem_limit_exceeded());
        assert_eq!(chunk.charged_bytes(), 0);
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn slices_do_not_inherit_accounting() {
        let root = MemTracker::new_root("task");
        let mut chunk = int_chunk(vec![1, 2, 3, 4]);
        chunk.try_charge(&root).expect("charge");
        let slice = chunk.slice(1, 2);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice.charged_bytes(), 0);
    }
}
