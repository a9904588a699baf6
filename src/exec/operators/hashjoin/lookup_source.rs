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
//! Published build side of a hash join.
//!
//! Responsibilities:
//! - Holds the per-partition hash tables and the shared build chunks after a build completes.
//! - Answers match iteration for probe rows and exposes the unmatched build-row sweep.
//! - Publishes the lookup source (or the build failure) to probe operators exactly once.
//!
//! Key exported interfaces:
//! - Types: `LookupSource`, `JoinPosition`, `LookupSourceSupplier`.

use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;

use super::join_hash_table::{JoinHashTable, ROW_NONE, unpack_address};
use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::KeyColumns;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;

/// Location of one build row inside a lookup source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinPosition {
    pub partition: u32,
    pub row: u32,
}

/// Immutable, shareable view over every partition's hash table and the build chunks.
pub struct LookupSource {
    tables: Vec<JoinHashTable>,
    build_chunks: Vec<Chunk>,
    build_keys: Vec<KeyColumns>,
    build_schema: SchemaRef,
    mem_tracker: Arc<MemTracker>,
}

impl std::fmt::Debug for LookupSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupSource")
            .field("partitions", &self.tables.len())
            .field("build_chunks", &self.build_chunks.len())
            .field("positions", &self.position_count())
            .finish()
    }
}

impl LookupSource {
    /// Assemble a lookup source, moving every retained byte onto `mem_tracker`.
    pub(crate) fn try_new(
        mut tables: Vec<JoinHashTable>,
        build_chunks: Vec<Chunk>,
        build_key_channels: &[usize],
        build_schema: SchemaRef,
        mem_tracker: Arc<MemTracker>,
    ) -> ExecResult<Self> {
        if tables.is_empty() {
            return Err(ExecError::internal("lookup source requires at least one partition"));
        }
        if tables.iter().any(|t| !t.is_finalized()) {
            return Err(ExecError::internal("lookup source built from unfinalized table"));
        }
        for table in tables.iter_mut() {
            table.set_mem_tracker(Arc::clone(&mem_tracker));
        }
        let build_keys = build_chunks
            .iter()
            .map(|chunk| {
                chunk.transfer_to(&mem_tracker);
                KeyColumns::try_new(chunk, build_key_channels)
            })
            .collect::<ExecResult<Vec<_>>>()?;
        Ok(Self {
            tables,
            build_chunks,
            build_keys,
            build_schema,
            mem_tracker,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.tables.len()
    }

    /// Partition a row hash belongs to. Build and probe use the same rule.
    pub fn partition_of(&self, hash: u64) -> usize {
        (hash % self.tables.len() as u64) as usize
    }

    /// Number of build rows across every partition, null-key rows included.
    pub fn position_count(&self) -> usize {
        self.tables.iter().map(|t| t.num_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.position_count() == 0
    }

    pub fn build_chunks(&self) -> &[Chunk] {
        &self.build_chunks
    }

    pub fn build_schema(&self) -> &SchemaRef {
        &self.build_schema
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// First build row whose key tuple equals the probe row's, if any.
    pub fn first_match(
        &self,
        probe: &KeyColumns,
        probe_row: usize,
        hash: u64,
    ) -> ExecResult<Option<JoinPosition>> {
        if probe.row_has_null(probe_row) {
            return Ok(None);
        }
        let partition = self.partition_of(hash);
        let row_id = self.tables[partition].first_row(hash);
        self.scan_chain(partition, row_id, probe, probe_row)
    }

    /// Next build row after `pos` in the same chain that equals the probe row.
    pub fn next_match(
        &self,
        pos: JoinPosition,
        probe: &KeyColumns,
        probe_row: usize,
    ) -> ExecResult<Option<JoinPosition>> {
        let partition = pos.partition as usize;
        let table = self.table(partition)?;
        self.scan_chain(partition, table.next_row(pos.row), probe, probe_row)
    }

    fn scan_chain(
        &self,
        partition: usize,
        mut row_id: u32,
        probe: &KeyColumns,
        probe_row: usize,
    ) -> ExecResult<Option<JoinPosition>> {
        let table = self.table(partition)?;
        while row_id != ROW_NONE {
            let (chunk_idx, build_row) = unpack_address(table.address(row_id)?);
            let build_keys = self.build_keys.get(chunk_idx).ok_or_else(|| {
                ExecError::internal(format!("build chunk {} out of range", chunk_idx))
            })?;
            if probe.row_equals(probe_row, build_keys, build_row) {
                return Ok(Some(JoinPosition {
                    partition: partition as u32,
                    row: row_id,
                }));
            }
            row_id = table.next_row(row_id);
        }
        Ok(None)
    }

    fn table(&self, partition: usize) -> ExecResult<&JoinHashTable> {
        self.tables.get(partition).ok_or_else(|| {
            ExecError::internal(format!(
                "join partition {} out of range (partitions={})",
                partition,
                self.tables.len()
            ))
        })
    }

    /// (chunk index, row index) of a build position.
    pub fn build_address(&self, pos: JoinPosition) -> ExecResult<(usize, usize)> {
        Ok(unpack_address(
            self.table(pos.partition as usize)?.address(pos.row)?,
        ))
    }

    pub fn mark_matched(&self, pos: JoinPosition) {
        if let Some(table) = self.tables.get(pos.partition as usize) {
            table.mark_matched(pos.row);
        }
    }

    pub fn is_matched(&self, pos: JoinPosition) -> bool {
        self.tables
            .get(pos.partition as usize)
            .map(|t| t.is_matched(pos.row))
            .unwrap_or(false)
    }

    /// Build rows never marked matched, by partition then row id.
    ///
    /// Only meaningful after every probe driver has finished.
    pub fn unmatched_build_rows(&self) -> Vec<(usize, usize)> {
        self.tables
            .iter()
            .flat_map(|t| t.unmatched_addresses())
            .map(unpack_address)
            .collect()
    }
}

enum SupplierState {
    Pending,
    Ready(Arc<LookupSource>),
    Failed(ExecError),
}

/// One-shot publication point between the hash build and the probe operators.
///
/// The dependency turns ready on publication and on failure, so waiting probe
/// drivers always wake up and observe the outcome.
pub struct LookupSourceSupplier {
    join_name: String,
    dependency: DependencyHandle,
    state: Mutex<SupplierState>,
}

impl LookupSourceSupplier {
    pub fn new(join_name: impl Into<String>, dependency: DependencyHandle) -> Arc<Self> {
        Arc::new(Self {
            join_name: join_name.into(),
            dependency,
            state: Mutex::new(SupplierState::Pending),
        })
    }

    pub fn join_name(&self) -> &str {
        &self.join_name
    }

    pub fn dependency(&self) -> &DependencyHandle {
        &self.dependency
    }

    /// `Ok(None)` while the build is running, the shared source once published.
    pub fn try_get(&self) -> ExecResult<Option<Arc<LookupSource>>> {
        let guard = self.state.lock().expect("lookup source supplier lock");
        match &*guard {
            SupplierState::Pending => Ok(None),
            SupplierState::Ready(source) => Ok(Some(Arc::clone(source))),
            SupplierState::Failed(err) => Err(ExecError::BuildFailed {
                join: self.join_name.clone(),
                cause: Box::new(err.clone()),
            }),
        }
    }

    /// Publish the lookup source. Later calls return the first published instance.
    pub fn publish(&self, source: LookupSource) -> ExecResult<Arc<LookupSource>> {
        let published = {
            let mut guard = self.state.lock().expect("lookup source supplier lock");
            match &*guard {
                SupplierState::Ready(existing) => return Ok(Arc::clone(existing)),
                SupplierState::Failed(err) => {
                    return Err(ExecError::BuildFailed {
                        join: self.join_name.clone(),
                        cause: Box::new(err.clone()),
                    });
                }
                SupplierState::Pending => {}
            }
            let source = Arc::new(source);
            *guard = SupplierState::Ready(Arc::clone(&source));
            source
        };
        debug!(
            "LookupSource published: join={} partitions={} positions={} build_chunks={} bytes={}",
            self.join_name,
            published.partition_count(),
            published.position_count(),
            published.build_chunks().len(),
            published.mem_tracker().current()
        );
        self.dependency.set_ready();
        Ok(published)
    }

    /// Record a build failure. Ignored once a source has been published.
    pub fn fail(&self, err: ExecError) {
        {
            let mut guard = self.state.lock().expect("lookup source supplier lock");
            if !matches!(&*guard, SupplierState::Pending) {
                return;
            }
            debug!("LookupSource build failed: join={} error={}", self.join_name, err);
            *guard = SupplierState::Failed(err);
        }
        self.dependency.set_ready();
    }

    pub fn is_done(&self) -> bool {
        let guard = self.state.lock().expect("lookup source supplier lock");
        !matches!(&*guard, SupplierState::Pending)
    }
}
