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
//! Single-partition hash build sink.
//!
//! Every build driver charges its chunks and hands them to the lookup source tracker when
//! it finishes. The last one to finish builds one exactly-sized hash table over all of
//! them, one chunk per pull, and publishes the lookup source.

use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;

use super::join_hash_table::JoinHashTable;
use super::lookup_source::{LookupSource, LookupSourceSupplier};
use super::parallel_hash_builder::insert_partition_rows;
use crate::common::error::{ExecError, ExecResult, JoinPhase};
use crate::exec::chunk::Chunk;
use crate::exec::node::join::{HashJoinNode, JoinKeys};
use crate::exec::pipeline::dependency::join_build_dep_name;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::task_context::{DriverContext, TaskContext};

#[derive(Default)]
struct SinkShared {
    created: usize,
    finished: usize,
    chunks: Vec<Chunk>,
}

/// Factory for hash build sinks that gather every build chunk and build one table.
pub struct HashBuilderSinkFactory {
    name: String,
    node_id: i32,
    build_keys: JoinKeys,
    build_schema: SchemaRef,
    supplier: Arc<LookupSourceSupplier>,
    mem_tracker: Arc<MemTracker>,
    shared: Arc<Mutex<SinkShared>>,
}

impl HashBuilderSinkFactory {
    pub fn new(task: &Arc<TaskContext>, node: &HashJoinNode) -> Self {
        let supplier = LookupSourceSupplier::new(
            format!("join {}", node.node_id),
            task.dep_manager()
                .get_or_create(join_build_dep_name(node.node_id)),
        );
        Self {
            name: format!("HASH_JOIN_BUILD_SINK (id={})", node.node_id),
            node_id: node.node_id,
            build_keys: node.build_keys.clone(),
            build_schema: Arc::clone(&node.build_schema),
            supplier,
            mem_tracker: MemTracker::new_child(
                format!("LookupSource (id={})", node.node_id),
                task.mem_tracker(),
            ),
            shared: Arc::new(Mutex::new(SinkShared::default())),
        }
    }

    pub fn supplier(&self) -> &Arc<LookupSourceSupplier> {
        &self.supplier
    }
}

impl OperatorFactory for HashBuilderSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _ctx: &DriverContext) -> Box<dyn Operator> {
        self.shared.lock().expect("hash build sink lock").created += 1;
        Box::new(HashBuilderSinkOperator {
            name: self.name.clone(),
            node_id: self.node_id,
            build_keys: self.build_keys.clone(),
            build_schema: Arc::clone(&self.build_schema),
            supplier: Arc::clone(&self.supplier),
            lookup_tracker: Arc::clone(&self.mem_tracker),
            shared: Arc::clone(&self.shared),
            mem_tracker: None,
            chunks: Vec::new(),
            pending: None,
            finished: false,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct HashBuilderSinkOperator {
    name: String,
    node_id: i32,
    build_keys: JoinKeys,
    build_schema: SchemaRef,
    supplier: Arc<LookupSourceSupplier>,
    lookup_tracker: Arc<MemTracker>,
    shared: Arc<Mutex<SinkShared>>,
    mem_tracker: Option<Arc<MemTracker>>,
    chunks: Vec<Chunk>,
    pending: Option<PendingBuild>,
    finished: bool,
}

/// Table under construction by the last sink to finish.
struct PendingBuild {
    chunks: Vec<Chunk>,
    table: JoinHashTable,
    next_chunk: usize,
}

impl HashBuilderSinkOperator {
    fn fail(&self, err: ExecError) -> ExecError {
        let err = err.in_phase(JoinPhase::Build);
        self.supplier.fail(err.clone());
        err
    }

    fn start_build(&self, chunks: Vec<Chunk>) -> ExecResult<PendingBuild> {
        let rows = chunks.iter().map(Chunk::len).sum::<usize>();
        let tracker = self
            .mem_tracker
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.lookup_tracker));
        Ok(PendingBuild {
            chunks,
            table: JoinHashTable::try_new(rows, tracker)?,
            next_chunk: 0,
        })
    }

    /// Insert the next pending chunk, or finalize and publish once all are in.
    fn step(&mut self) -> ExecResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if let Some(chunk) = pending.chunks.get(pending.next_chunk) {
            insert_partition_rows(
                &mut pending.table,
                pending.next_chunk,
                chunk,
                &self.build_keys,
                0,
                1,
            )?;
            pending.next_chunk += 1;
            return Ok(());
        }
        let Some(PendingBuild {
            chunks, mut table, ..
        }) = self.pending.take()
        else {
            return Ok(());
        };
        table.finalize()?;
        let rows = table.num_rows();
        debug!(
            "HashJoin build finished: node_id={} rows={} chunks={} buckets={} bytes={}",
            self.node_id,
            rows,
            chunks.len(),
            table.bucket_count(),
            table.tracked_bytes()
        );
        let source = LookupSource::try_new(
            vec![table],
            chunks,
            &self.build_keys.key_channels,
            Arc::clone(&self.build_schema),
            Arc::clone(&self.lookup_tracker),
        )?;
        self.supplier.publish(source)?;
        self.finished = true;
        Ok(())
    }
}

impl Operator for HashBuilderSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    fn close(&mut self) -> ExecResult<()> {
        self.chunks.clear();
        self.pending = None;
        if !self.finished {
            self.finished = true;
            self.supplier.fail(
                ExecError::Cancelled("hash build sink closed before completion".to_string())
                    .in_phase(JoinPhase::Build),
            );
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

impl ProcessorOperator for HashBuilderSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished && self.pending.is_none()
    }

    /// Pending build work; the driver pulls a finishing sink until the table is published.
    fn has_output(&self) -> bool {
        self.pending.is_some()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, mut chunk: Chunk) -> ExecResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(tracker) = self.mem_tracker.as_ref()
            && let Err(err) = chunk.try_charge(tracker)
        {
            return Err(self.fail(err));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        if self.supplier.is_done() && self.pending.take().is_some() {
            self.finished = true;
            return Ok(None);
        }
        self.step().map_err(|err| self.fail(err))?;
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished || self.pending.is_some() {
            return Ok(());
        }
        // Retained chunks outlive this driver; the lookup source tracker owns them now.
        for chunk in &self.chunks {
            chunk.transfer_to(&self.lookup_tracker);
        }
        let ready = {
            let mut shared = self.shared.lock().expect("hash build sink lock");
            shared.chunks.append(&mut self.chunks);
            shared.finished += 1;
            (shared.finished == shared.created).then(|| std::mem::take(&mut shared.chunks))
        };
        let Some(chunks) = ready else {
            self.finished = true;
            return Ok(());
        };
        if self.supplier.is_done() {
            self.finished = true;
            return Ok(());
        }
        match self.start_build(chunks) {
            Ok(pending) => {
                self.pending = Some(pending);
                Ok(())
            }
            Err(err) => {
                self.finished = true;
                Err(self.fail(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;
    use crate::exec::hash_table::KeyColumns;
    use crate::exec::node::join::JoinType;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
    }

    fn chunk(values: Vec<Option<i64>>) -> Chunk {
        Chunk::try_from_columns(schema(), vec![Arc::new(Int64Array::from(values)) as ArrayRef])
            .expect("chunk")
    }

    fn node() -> HashJoinNode {
        HashJoinNode {
            node_id: 4,
            join_type: JoinType::Inner,
            probe_schema: schema(),
            build_schema: schema(),
            probe_keys: JoinKeys::new(vec![0]),
            build_keys: JoinKeys::new(vec![0]),
            partition_count: 1,
        }
    }

    #[test]
    fn last_sink_to_finish_publishes() {
        let task = TaskContext::new("sink", -1);
        let factory = HashBuilderSinkFactory::new(&task, &node());
        let pipeline = task.add_pipeline_context();
        let state = RuntimeState::new(1024);
        let mut a = factory.create(&pipeline.add_driver_context());
        let mut b = factory.create(&pipeline.add_driver_context());
        let pa = a.as_processor_mut().expect("processor");
        pa.push_chunk(&state, chunk(vec![Some(1), None, Some(2)])).expect("push");
        pa.set_finishing(&state).expect("finish");
        assert!(factory.supplier().try_get().expect("ok").is_none());

        let pb = b.as_processor_mut().expect("processor");
        pb.push_chunk(&state, chunk(vec![Some(2)])).expect("push");
        pb.set_finishing(&state).expect("finish");
        while pb.has_output() {
            pb.pull_chunk(&state).expect("build step");
        }
        assert!(b.is_finished());

        let source = factory.supplier().try_get().expect("ok").expect("published");
        assert_eq!(source.position_count(), 4);
        let probe = chunk(vec![Some(2), None]);
        let keys = KeyColumns::try_new(&probe, &[0]).expect("keys");
        let first = source
            .first_match(&keys, 0, keys.hash_row(0))
            .expect("probe")
            .expect("match");
        assert!(source.next_match(first, &keys, 0).expect("probe").is_some());
        assert!(source.first_match(&keys, 1, keys.hash_row(1)).expect("probe").is_none());
    }

    #[test]
    fn last_sink_inserts_one_chunk_per_pull() {
        let task = TaskContext::new("sink-steps", -1);
        let factory = HashBuilderSinkFactory::new(&task, &node());
        let state = RuntimeState::new(1024);
        let mut op = factory.create(&task.add_pipeline_context().add_driver_context());
        let processor = op.as_processor_mut().expect("processor");
        for k in 0..3 {
            processor.push_chunk(&state, chunk(vec![Some(k)])).expect("push");
        }
        processor.set_finishing(&state).expect("finish");
        assert!(!processor.need_input());
        // Three inserts, then finalize and publish.
        for _ in 0..3 {
            assert!(processor.has_output());
            processor.pull_chunk(&state).expect("insert");
            assert!(factory.supplier().try_get().expect("ok").is_none());
        }
        processor.pull_chunk(&state).expect("publish");
        assert!(!processor.has_output());
        assert!(op.is_finished());
        let source = factory.supplier().try_get().expect("ok").expect("published");
        assert_eq!(source.position_count(), 3);
    }

    #[test]
    fn finished_sink_hands_chunks_to_lookup_tracker() {
        let task = TaskContext::new("sink-handoff", -1);
        let factory = HashBuilderSinkFactory::new(&task, &node());
        let pipeline = task.add_pipeline_context();
        let state = RuntimeState::new(1024);
        let ctx_a = pipeline.add_driver_context();
        let ctx_b = pipeline.add_driver_context();
        let mut a = factory.create(&ctx_a);
        let mut b = factory.create(&ctx_b);
        a.set_mem_tracker(MemTracker::new_child("a", ctx_a.mem_tracker()));
        b.set_mem_tracker(MemTracker::new_child("b", ctx_b.mem_tracker()));

        let pa = a.as_processor_mut().expect("processor");
        pa.push_chunk(&state, chunk((0..100).map(Some).collect())).expect("push");
        assert!(ctx_a.mem_tracker().current() > 0);
        pa.set_finishing(&state).expect("finish");
        assert!(a.is_finished());
        a.close().expect("close");
        assert_eq!(ctx_a.mem_tracker().current(), 0);
        assert!(task.memory_reservation() > 0);

        let pb = b.as_processor_mut().expect("processor");
        pb.push_chunk(&state, chunk((100..150).map(Some).collect())).expect("push");
        pb.set_finishing(&state).expect("finish");
        while pb.has_output() {
            pb.pull_chunk(&state).expect("build step");
        }
        b.close().expect("close");
        assert_eq!(ctx_b.mem_tracker().current(), 0);

        let source = factory.supplier().try_get().expect("ok").expect("published");
        assert_eq!(source.position_count(), 150);
        drop(source);
        drop((a, b, factory));
        assert_eq!(task.memory_reservation(), 0);
    }

    #[test]
    fn memory_limit_fails_the_build() {
        let task = TaskContext::new("sink-oom", 16);
        let factory = HashBuilderSinkFactory::new(&task, &node());
        let ctx = task.add_pipeline_context().add_driver_context();
        let mut op = factory.create(&ctx);
        op.set_mem_tracker(MemTracker::new_child("op", ctx.mem_tracker()));
        let state = RuntimeState::new(1024);
        let err = op
            .as_processor_mut()
            .expect("processor")
            .push_chunk(&state, chunk((0..64).map(Some).collect()))
            .expect_err("over limit");
        assert!(err.is_mem_limit_exceeded());
        assert_eq!(err.phase(), Some(JoinPhase::Build));
        assert!(factory.supplier().try_get().is_err());
    }
}
