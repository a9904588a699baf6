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
//! Lookup join probe operator.
//!
//! Responsibilities:
//! - Waits on the lookup source dependency, then probes one input chunk at a time.
//! - Emits matches for every probe row, plus one null-extended row per unmatched probe
//!   row for probe-outer joins. Output chunks stay within the runtime chunk size.
//!
//! Key exported interfaces:
//! - Types: `LookupJoinFactory`.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use super::join_probe_utils::JoinRowsBuilder;
use super::lookup_source::{JoinPosition, LookupSource, LookupSourceSupplier};
use crate::common::error::{ExecError, ExecResult, JoinPhase};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::KeyColumns;
use crate::exec::node::join::{HashJoinNode, JoinKeys, JoinType};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::task_context::DriverContext;

/// Factory for lookup join probe operators sharing one lookup source supplier.
pub struct LookupJoinFactory {
    name: String,
    join_type: JoinType,
    probe_keys: JoinKeys,
    output_schema: SchemaRef,
    supplier: Arc<LookupSourceSupplier>,
}

impl LookupJoinFactory {
    pub fn new(node: &HashJoinNode, supplier: Arc<LookupSourceSupplier>) -> Self {
        Self {
            name: format!("LOOKUP_JOIN_PROBE (id={})", node.node_id),
            join_type: node.join_type,
            probe_keys: node.probe_keys.clone(),
            output_schema: node.output_schema(),
            supplier,
        }
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }
}

impl OperatorFactory for LookupJoinFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, ctx: &DriverContext) -> Box<dyn Operator> {
        Box::new(LookupJoinOperator {
            name: self.name.clone(),
            driver_id: ctx.driver_id(),
            join_type: self.join_type,
            probe_keys: self.probe_keys.clone(),
            output_schema: Arc::clone(&self.output_schema),
            supplier: Arc::clone(&self.supplier),
            source: None,
            mem_tracker: None,
            cursor: None,
            finishing: false,
            closed: false,
            probe_rows: 0,
            output_rows: 0,
            output_chunks: 0,
        })
    }
}

struct ProbeCursor {
    chunk: Chunk,
    keys: KeyColumns,
    row: usize,
    row_started: bool,
    row_matched: bool,
    next_pos: Option<JoinPosition>,
}

struct LookupJoinOperator {
    name: String,
    driver_id: i32,
    join_type: JoinType,
    probe_keys: JoinKeys,
    output_schema: SchemaRef,
    supplier: Arc<LookupSourceSupplier>,
    source: Option<Arc<LookupSource>>,
    mem_tracker: Option<Arc<MemTracker>>,
    cursor: Option<ProbeCursor>,
    finishing: bool,
    closed: bool,
    probe_rows: usize,
    output_rows: usize,
    output_chunks: usize,
}

impl LookupJoinOperator {
    /// Resolve the published lookup source. Build failures surface unchanged.
    fn load_source(&mut self) -> ExecResult<Option<Arc<LookupSource>>> {
        if let Some(source) = self.source.as_ref() {
            return Ok(Some(Arc::clone(source)));
        }
        let source = self.supplier.try_get()?;
        if let Some(source) = source.as_ref() {
            self.source = Some(Arc::clone(source));
        }
        Ok(source)
    }

    fn require_source(&mut self) -> ExecResult<Arc<LookupSource>> {
        self.load_source()?.ok_or_else(|| {
            ExecError::internal(format!("{}: lookup source is not ready", self.name))
                .in_phase(JoinPhase::Probe)
        })
    }

    fn probe_batch(
        &mut self,
        source: &LookupSource,
        max_rows: usize,
    ) -> ExecResult<Option<Chunk>> {
        let outer = self.join_type.is_probe_outer();
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let num_rows = cursor.keys.num_rows();
        let mut rows = JoinRowsBuilder::with_capacity(max_rows.min(num_rows.max(1)));
        while rows.len() < max_rows && cursor.row < num_rows {
            let row = cursor.row;
            let pos = if cursor.row_started {
                cursor.next_pos
            } else {
                cursor.row_started = true;
                cursor.row_matched = false;
                source.first_match(&cursor.keys, row, cursor.keys.hash_row(row))?
            };
            match pos {
                Some(pos) => {
                    rows.append_match(row, source.build_address(pos)?);
                    if outer {
                        source.mark_matched(pos);
                    }
                    cursor.row_matched = true;
                    cursor.next_pos = source.next_match(pos, &cursor.keys, row)?;
                }
                None => {
                    if outer && !cursor.row_matched {
                        rows.append_unmatched(row);
                    }
                    cursor.row += 1;
                    cursor.row_started = false;
                    cursor.next_pos = None;
                }
            }
        }
        let output = if rows.is_empty() {
            None
        } else {
            Some(rows.flush(&cursor.chunk, source, &self.output_schema)?)
        };
        if cursor.row >= num_rows {
            self.cursor = None;
        }
        if let Some(chunk) = output.as_ref() {
            self.output_rows += chunk.len();
            self.output_chunks += 1;
        }
        Ok(output)
    }
}

impl Operator for LookupJoinOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    fn close(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor = None;
        self.source = None;
        debug!(
            "LookupJoin probe closed: {} driver_id={} probe_rows={} output_rows={} output_chunks={}",
            self.name, self.driver_id, self.probe_rows, self.output_rows, self.output_chunks
        );
        Ok(())
    }

    fn cancel(&mut self) {
        self.cursor = None;
    }

    fn is_finished(&self) -> bool {
        self.finishing && self.cursor.is_none() && self.source.is_some()
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for LookupJoinOperator {
    fn need_input(&self) -> bool {
        !self.finishing && self.cursor.is_none()
    }

    fn has_output(&self) -> bool {
        self.cursor.is_some() || (self.finishing && self.source.is_none())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, mut chunk: Chunk) -> ExecResult<()> {
        self.require_source()?;
        if self.cursor.is_some() {
            return Err(
                ExecError::internal(format!("{}: pushed while probing", self.name))
                    .in_phase(JoinPhase::Probe),
            );
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(tracker) = self.mem_tracker.as_ref() {
            chunk
                .try_charge(tracker)
                .map_err(|e| e.in_phase(JoinPhase::Probe))?;
        }
        let keys = KeyColumns::try_new_with_hash(
            &chunk,
            &self.probe_keys.key_channels,
            self.probe_keys.hash_channel,
        )
        .map_err(|e| e.in_phase(JoinPhase::Probe))?;
        self.probe_rows += chunk.len();
        self.cursor = Some(ProbeCursor {
            chunk,
            keys,
            row: 0,
            row_started: false,
            row_matched: false,
            next_pos: None,
        });
        Ok(())
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        let source = self.require_source()?;
        let max_rows = state.chunk_size().max(1);
        let output = self
            .probe_batch(&source, max_rows)
            .map_err(|e| e.in_phase(JoinPhase::Probe))?;
        let Some(mut chunk) = output else {
            return Ok(None);
        };
        // Output belongs to this operator until the driver moves it downstream.
        if let Some(tracker) = self.mem_tracker.as_ref() {
            chunk
                .try_charge(tracker)
                .map_err(|e| e.in_phase(JoinPhase::Probe))?;
        }
        Ok(Some(chunk))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finishing = true;
        // Surface build failures even when the probe side produced nothing.
        self.load_source()?;
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if self.source.is_some() || self.supplier.is_done() {
            None
        } else {
            Some(Arc::clone(self.supplier.dependency()))
        }
    }
}
