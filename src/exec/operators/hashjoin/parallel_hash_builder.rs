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
//! Partitioned parallel hash build.
//!
//! Responsibilities:
//! - Collects every build chunk through collect sinks, then builds one hash table per
//!   partition on its own driver, then publishes a single lookup source.
//! - Fails the lookup source supplier when any collect or build driver errors or closes
//!   before completion, so probes never observe a partial build.
//!
//! Key exported interfaces:
//! - Types: `ParallelHashBuilder`, `HashCollectSinkFactory`, `PartitionBuildFactory`.
//! - Functions: `insert_partition_rows`.

use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;

use super::join_hash_table::{JoinHashTable, pack_address};
use super::lookup_source::{LookupSource, LookupSourceSupplier};
use crate::common::config;
use crate::common::error::{ExecError, ExecResult, JoinPhase};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::KeyColumns;
use crate::exec::node::join::{HashJoinNode, JoinKeys};
use crate::exec::pipeline::dependency::{
    DependencyHandle, join_build_dep_name, join_collect_dep_name,
};
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::task_context::{DriverContext, TaskContext};

/// Insert the rows of `chunk` that hash into `partition`. Returns the number inserted.
pub(crate) fn insert_partition_rows(
    table: &mut JoinHashTable,
    chunk_idx: usize,
    chunk: &Chunk,
    keys: &JoinKeys,
    partition: usize,
    partition_count: usize,
) -> ExecResult<usize> {
    let chunk_idx = u32::try_from(chunk_idx)
        .map_err(|_| ExecError::internal("join build chunk count overflow"))?;
    let key_columns = KeyColumns::try_new_with_hash(chunk, &keys.key_channels, keys.hash_channel)?;
    let partition_count = partition_count.max(1) as u64;
    let selected = (0..chunk.len())
        .map(|row| (row, key_columns.hash_row(row)))
        .filter(|(_, hash)| (hash % partition_count) as usize == partition)
        .collect::<Vec<_>>();
    table.reserve_rows(selected.len())?;
    for &(row, hash) in &selected {
        let hash = (!key_columns.row_has_null(row)).then_some(hash);
        table.append_row(pack_address(chunk_idx, row as u32), hash)?;
    }
    Ok(selected.len())
}

struct ParallelBuildState {
    collectors_created: usize,
    collectors_finished: usize,
    collected: Vec<Chunk>,
    collected_rows: usize,
    frozen: Option<Arc<Vec<Chunk>>>,
    tables: Vec<Option<JoinHashTable>>,
    partitions_finished: usize,
}

/// Shared state of one partitioned hash build: collect, per-partition build, publish.
pub struct ParallelHashBuilder {
    node_id: i32,
    build_keys: JoinKeys,
    build_schema: SchemaRef,
    partition_count: usize,
    expected_positions: usize,
    supplier: Arc<LookupSourceSupplier>,
    collect_dep: DependencyHandle,
    mem_tracker: Arc<MemTracker>,
    state: Mutex<ParallelBuildState>,
}

impl ParallelHashBuilder {
    pub fn new(task: &Arc<TaskContext>, node: &HashJoinNode) -> Arc<Self> {
        Self::with_expected_positions(task, node, config::expected_build_positions())
    }

    /// `expected_positions` is the initial sizing hint for the whole build; each
    /// partition gets its share.
    pub fn with_expected_positions(
        task: &Arc<TaskContext>,
        node: &HashJoinNode,
        expected_positions: usize,
    ) -> Arc<Self> {
        let partition_count = node.partition_count.max(1);
        let supplier = LookupSourceSupplier::new(
            format!("join {}", node.node_id),
            task.dep_manager()
                .get_or_create(join_build_dep_name(node.node_id)),
        );
        Arc::new(Self {
            node_id: node.node_id,
            build_keys: node.build_keys.clone(),
            build_schema: Arc::clone(&node.build_schema),
            partition_count,
            expected_positions,
            supplier,
            collect_dep: task
                .dep_manager()
                .get_or_create(join_collect_dep_name(node.node_id)),
            mem_tracker: MemTracker::new_child(
                format!("LookupSource (id={})", node.node_id),
                task.mem_tracker(),
            ),
            state: Mutex::new(ParallelBuildState {
                collectors_created: 0,
                collectors_finished: 0,
                collected: Vec::new(),
                collected_rows: 0,
                frozen: None,
                tables: (0..partition_count).map(|_| None).collect(),
                partitions_finished: 0,
            }),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn supplier(&self) -> &Arc<LookupSourceSupplier> {
        &self.supplier
    }

    pub fn collect_dependency(&self) -> &DependencyHandle {
        &self.collect_dep
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn collect_sink_factory(self: &Arc<Self>) -> HashCollectSinkFactory {
        HashCollectSinkFactory {
            name: format!("HASH_JOIN_COLLECT_SINK (id={})", self.node_id),
            builder: Arc::clone(self),
        }
    }

    /// Factory for the build pipeline; instantiate it with `dop == partition_count`.
    pub fn build_operator_factory(self: &Arc<Self>) -> PartitionBuildFactory {
        PartitionBuildFactory {
            name: format!("HASH_JOIN_PARTITION_BUILD (id={})", self.node_id),
            builder: Arc::clone(self),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ParallelBuildState> {
        self.state.lock().expect("parallel hash builder lock")
    }

    fn fail(&self, err: ExecError) {
        self.supplier.fail(err.in_phase(JoinPhase::Build));
        // Wake partition builders so they observe the failure instead of waiting forever.
        self.collect_dep.set_ready();
    }

    fn register_collector(&self) {
        self.lock().collectors_created += 1;
    }

    fn finish_collector(&self, chunks: Vec<Chunk>) {
        let frozen_rows = {
            let mut st = self.lock();
            for chunk in chunks {
                chunk.transfer_to(&self.mem_tracker);
                st.collected_rows += chunk.len();
                st.collected.push(chunk);
            }
            st.collectors_finished += 1;
            if st.collectors_finished < st.collectors_created || st.frozen.is_some() {
                None
            } else {
                let collected = std::mem::take(&mut st.collected);
                st.frozen = Some(Arc::new(collected));
                Some(st.collected_rows)
            }
        };
        if let Some(rows) = frozen_rows {
            debug!(
                "HashJoin collect finished: node_id={} rows={} partitions={}",
                self.node_id, rows, self.partition_count
            );
            self.collect_dep.set_ready();
        }
    }

    fn collected(&self) -> Option<(Arc<Vec<Chunk>>, usize)> {
        let st = self.lock();
        st.frozen
            .as_ref()
            .map(|chunks| (Arc::clone(chunks), st.collected_rows))
    }

    fn partition_estimate(&self, collected_rows: usize) -> usize {
        let share = collected_rows / self.partition_count;
        let share = share.saturating_add(share / 8);
        share.max(self.expected_positions / self.partition_count)
    }

    fn finish_partition(&self, partition: usize, table: JoinHashTable) -> ExecResult<()> {
        let ready = {
            let mut st = self.lock();
            let slot = st.tables.get_mut(partition).ok_or_else(|| {
                ExecError::internal(format!("build partition {} out of range", partition))
            })?;
            if slot.is_some() {
                return Err(ExecError::internal(format!(
                    "build partition {} finished twice",
                    partition
                )));
            }
            *slot = Some(table);
            st.partitions_finished += 1;
            if st.partitions_finished < self.partition_count {
                None
            } else {
                let tables = st.tables.iter_mut().filter_map(Option::take).collect::<Vec<_>>();
                let chunks = st
                    .frozen
                    .take()
                    .map(|c| Arc::try_unwrap(c).unwrap_or_else(|shared| shared.as_ref().clone()))
                    .unwrap_or_default();
                Some((tables, chunks))
            }
        };
        let Some((tables, chunks)) = ready else {
            return Ok(());
        };
        let source = LookupSource::try_new(
            tables,
            chunks,
            &self.build_keys.key_channels,
            Arc::clone(&self.build_schema),
            Arc::clone(&self.mem_tracker),
        )?;
        self.supplier.publish(source)?;
        Ok(())
    }
}

/// Factory for the sinks that gather build chunks before partitioned building.
pub struct HashCollectSinkFactory {
    name: String,
    builder: Arc<ParallelHashBuilder>,
}

impl OperatorFactory for HashCollectSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _ctx: &DriverContext) -> Box<dyn Operator> {
        self.builder.register_collector();
        Box::new(HashCollectSinkOperator {
            name: self.name.clone(),
            builder: Arc::clone(&self.builder),
            mem_tracker: None,
            chunks: Vec::new(),
            finished: false,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct HashCollectSinkOperator {
    name: String,
    builder: Arc<ParallelHashBuilder>,
    mem_tracker: Option<Arc<MemTracker>>,
    chunks: Vec<Chunk>,
    finished: bool,
}

impl Operator for HashCollectSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    fn close(&mut self) -> ExecResult<()> {
        self.chunks.clear();
        if !self.finished {
            self.finished = true;
            self.builder.fail(ExecError::Cancelled(
                "hash build collect closed before completion".to_string(),
            ));
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashCollectSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, _state: &RuntimeState, mut chunk: Chunk) -> ExecResult<()> {
        if let Some(tracker) = self.mem_tracker.as_ref()
            && let Err(err) = chunk.try_charge(tracker)
        {
            let err = err.in_phase(JoinPhase::Build);
            self.builder.fail(err.clone());
            return Err(err);
        }
        self.chunks.push(chunk);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.builder.finish_collector(std::mem::take(&mut self.chunks));
        Ok(())
    }
}

/// Factory for the per-partition build operators. Driver `i` builds partition `i`.
pub struct PartitionBuildFactory {
    name: String,
    builder: Arc<ParallelHashBuilder>,
}

impl OperatorFactory for PartitionBuildFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, ctx: &DriverContext) -> Box<dyn Operator> {
        Box::new(PartitionBuildOperator {
            name: format!("{} partition={}", self.name, ctx.driver_sequence()),
            builder: Arc::clone(&self.builder),
            partition: ctx.driver_sequence().max(0) as usize,
            mem_tracker: None,
            chunks: None,
            table: None,
            next_chunk: 0,
            rows: 0,
            finished: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct PartitionBuildOperator {
    name: String,
    builder: Arc<ParallelHashBuilder>,
    partition: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    chunks: Option<Arc<Vec<Chunk>>>,
    table: Option<JoinHashTable>,
    next_chunk: usize,
    rows: usize,
    finished: bool,
}

impl PartitionBuildOperator {
    fn step(&mut self) -> ExecResult<()> {
        if self.builder.supplier.is_done() {
            // Another partition failed; nothing left to build.
            self.finished = true;
            self.table = None;
            return Ok(());
        }
        if self.chunks.is_none() {
            let Some((chunks, collected_rows)) = self.builder.collected() else {
                return Ok(());
            };
            let tracker = self
                .mem_tracker
                .clone()
                .unwrap_or_else(|| Arc::clone(self.builder.mem_tracker()));
            let expected = self.builder.partition_estimate(collected_rows);
            self.table = Some(JoinHashTable::try_new(expected, tracker)?);
            self.chunks = Some(chunks);
            return Ok(());
        }
        let (Some(chunks), Some(table)) = (self.chunks.as_ref(), self.table.as_mut()) else {
            return Err(ExecError::internal("partition build state missing"));
        };
        if let Some(chunk) = chunks.get(self.next_chunk) {
            self.rows += insert_partition_rows(
                table,
                self.next_chunk,
                chunk,
                &self.builder.build_keys,
                self.partition,
                self.builder.partition_count,
            )?;
            self.next_chunk += 1;
            return Ok(());
        }
        let mut table = self
            .table
            .take()
            .ok_or_else(|| ExecError::internal("partition build table missing"))?;
        table.finalize()?;
        debug!(
            "HashJoin partition built: node_id={} partition={} rows={} buckets={} bytes={}",
            self.builder.node_id,
            self.partition,
            self.rows,
            table.bucket_count(),
            table.tracked_bytes()
        );
        self.finished = true;
        self.chunks = None;
        self.builder.finish_partition(self.partition, table)
    }
}

impl Operator for PartitionBuildOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    fn prepare(&mut self) -> ExecResult<()> {
        if self.partition >= self.builder.partition_count {
            return Err(ExecError::internal(format!(
                "build driver sequence {} exceeds partition count {}",
                self.partition, self.builder.partition_count
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        self.table = None;
        self.chunks = None;
        if !self.finished {
            self.finished = true;
            self.builder.fail(ExecError::Cancelled(format!(
                "hash build partition {} closed before completion",
                self.partition
            )));
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for PartitionBuildOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> ExecResult<()> {
        Err(ExecError::internal("partition build operator does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }
        if let Err(err) = self.step() {
            let err = err.in_phase(JoinPhase::Build);
            self.finished = true;
            self.table = None;
            self.builder.fail(err.clone());
            return Err(err);
        }
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if self.chunks.is_some() {
            None
        } else {
            Some(Arc::clone(&self.builder.collect_dep))
        }
    }
}
