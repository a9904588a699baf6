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
//! Pipeline graph builder for hash join plans.
//!
//! Responsibilities:
//! - Transforms exec-node trees into source/processor/sink pipelines.
//! - Allocates the shared build state behind each join and wires the probe side to it
//!   through the lookup source supplier and its dependency.
//!
//! Key exported interfaces:
//! - Types: `HashJoinPipelineBuilder`, `PipelinePlan`.
//! - Functions: `execute_hash_join`.

use std::sync::Arc;

use super::driver::PipelineDriver;
use super::executor::DriverExecutor;
use super::operator_factory::OperatorFactory;
use super::pipeline::Pipeline;
use crate::common::error::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::node::join::JoinNode;
use crate::exec::node::values::ValuesNode;
use crate::exec::node::{ExecNode, ExecNodeKind};
use crate::exec::operators::{
    HashBuilderSinkFactory, LookupJoinFactory, LookupSourceSupplier, ParallelHashBuilder,
    ResultSinkFactory, ResultSinkHandle, ValuesSourceFactory,
};
use crate::novarocks_logging::{debug, info};
use crate::runtime::task_context::TaskContext;

/// Pipelines for one plan plus the handle its result sink writes to.
pub struct PipelinePlan {
    pub pipelines: Vec<Pipeline>,
    pub result: ResultSinkHandle,
    pub suppliers: Vec<Arc<LookupSourceSupplier>>,
}

impl PipelinePlan {
    /// Instantiate every pipeline's drivers under `task`.
    pub fn instantiate_drivers(&self, task: &Arc<TaskContext>) -> ExecResult<Vec<PipelineDriver>> {
        let mut drivers = Vec::new();
        for pipeline in &self.pipelines {
            drivers.extend(pipeline.instantiate_drivers(task)?);
        }
        Ok(drivers)
    }
}

/// Operator chain that still needs a sink.
struct OpenPipeline {
    factories: Vec<Arc<dyn OperatorFactory>>,
    dop: usize,
}

pub struct HashJoinPipelineBuilder {
    task: Arc<TaskContext>,
    dop: usize,
    next_pipeline_id: i32,
    pipelines: Vec<Pipeline>,
    suppliers: Vec<Arc<LookupSourceSupplier>>,
}

impl HashJoinPipelineBuilder {
    /// `dop` is the number of drivers for every source pipeline, probe included.
    pub fn new(task: &Arc<TaskContext>, dop: usize) -> Self {
        Self {
            task: Arc::clone(task),
            dop: dop.max(1),
            next_pipeline_id: 0,
            pipelines: Vec::new(),
            suppliers: Vec::new(),
        }
    }

    pub fn build(mut self, root: &ExecNode) -> ExecResult<PipelinePlan> {
        let open = self.build_node(root)?;
        let result = ResultSinkHandle::new();
        let sink: Arc<dyn OperatorFactory> = Arc::new(ResultSinkFactory::new(
            result.clone(),
            Some(root.node_id()),
        ));
        self.close_pipeline(open, sink);
        Ok(PipelinePlan {
            pipelines: self.pipelines,
            result,
            suppliers: self.suppliers,
        })
    }

    fn next_pipeline_id(&mut self) -> i32 {
        let id = self.next_pipeline_id;
        self.next_pipeline_id += 1;
        id
    }

    fn close_pipeline(&mut self, mut open: OpenPipeline, sink: Arc<dyn OperatorFactory>) {
        open.factories.push(sink);
        let id = self.next_pipeline_id();
        debug!(
            "Pipeline built: pipeline_id={} dop={} operators={}",
            id,
            open.dop,
            open.factories
                .iter()
                .map(|f| f.name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        self.pipelines
            .push(Pipeline::new(id, open.factories, open.dop as i32));
    }

    fn build_node(&mut self, node: &ExecNode) -> ExecResult<OpenPipeline> {
        match &node.kind {
            ExecNodeKind::Values(values) => Ok(self.build_values(values)),
            ExecNodeKind::HashJoin(join) => self.build_hash_join(join),
        }
    }

    fn build_values(&mut self, node: &ValuesNode) -> OpenPipeline {
        let factory: Arc<dyn OperatorFactory> = Arc::new(ValuesSourceFactory::new(
            node.node_id,
            node.chunks.clone(),
            self.dop,
        ));
        OpenPipeline {
            factories: vec![factory],
            dop: self.dop,
        }
    }

    fn build_hash_join(&mut self, join: &JoinNode) -> ExecResult<OpenPipeline> {
        let spec = &join.hash_join;
        spec.validate()?;

        let build = self.build_node(&join.build)?;
        let supplier = if spec.partition_count > 1 {
            let builder = ParallelHashBuilder::new(&self.task, spec);
            let collect: Arc<dyn OperatorFactory> = Arc::new(builder.collect_sink_factory());
            self.close_pipeline(build, collect);
            let partition_build: Arc<dyn OperatorFactory> =
                Arc::new(builder.build_operator_factory());
            let id = self.next_pipeline_id();
            debug!(
                "Pipeline built: pipeline_id={} dop={} operators={}",
                id,
                builder.partition_count(),
                partition_build.name()
            );
            self.pipelines.push(Pipeline::new(
                id,
                vec![partition_build],
                builder.partition_count() as i32,
            ));
            Arc::clone(builder.supplier())
        } else {
            let sink = HashBuilderSinkFactory::new(&self.task, spec);
            let supplier = Arc::clone(sink.supplier());
            self.close_pipeline(build, Arc::new(sink));
            supplier
        };
        self.suppliers.push(Arc::clone(&supplier));

        let mut probe = self.build_node(&join.probe)?;
        probe
            .factories
            .push(Arc::new(LookupJoinFactory::new(spec, supplier)));
        Ok(probe)
    }
}

/// Build and run the pipelines for `root`, returning every result chunk.
///
/// Result chunks carry no memory accounting; the task reservation is back to zero once
/// this returns and the plan's lookup sources are dropped.
pub fn execute_hash_join(
    task: &Arc<TaskContext>,
    root: &ExecNode,
    probe_dop: usize,
) -> ExecResult<Vec<Chunk>> {
    let plan = HashJoinPipelineBuilder::new(task, probe_dop).build(root)?;
    let drivers = plan.instantiate_drivers(task)?;
    info!(
        "Hash join execution started: task_id={} pipelines={} drivers={}",
        task.task_id(),
        plan.pipelines.len(),
        drivers.len()
    );
    DriverExecutor::default().run(drivers)?;
    let chunks = plan.result.take_chunks();
    info!(
        "Hash join execution finished: task_id={} rows={} peak_memory={}",
        task.task_id(),
        chunks.iter().map(Chunk::len).sum::<usize>(),
        task.peak_memory_reservation()
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;
    use crate::exec::node::join::{HashJoinNode, JoinKeys, JoinType};

    fn join_of(partition_count: usize) -> ExecNode {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let values = |id| ExecNode::values(ValuesNode::new(id, Arc::clone(&schema), Vec::new()));
        ExecNode::hash_join(JoinNode {
            probe: Box::new(values(1)),
            build: Box::new(values(2)),
            hash_join: HashJoinNode {
                node_id: 3,
                join_type: JoinType::Inner,
                probe_schema: Arc::clone(&schema),
                build_schema: Arc::clone(&schema),
                probe_keys: JoinKeys::new(vec![0]),
                build_keys: JoinKeys::new(vec![0]),
                partition_count,
            },
        })
    }

    #[test]
    fn partitioned_join_lowers_to_three_pipelines() {
        let task = TaskContext::new("builder", -1);
        let plan = HashJoinPipelineBuilder::new(&task, 2)
            .build(&join_of(4))
            .expect("plan");
        let shapes = plan
            .pipelines
            .iter()
            .map(|p| (p.op_factories().len(), p.dop()))
            .collect::<Vec<_>>();
        assert_eq!(shapes, vec![(2, 2), (1, 4), (3, 2)]);
        assert_eq!(plan.suppliers.len(), 1);
    }

    #[test]
    fn single_partition_join_has_no_partition_pipeline() {
        let task = TaskContext::new("builder", -1);
        let plan = HashJoinPipelineBuilder::new(&task, 1)
            .build(&join_of(1))
            .expect("plan");
        assert_eq!(plan.pipelines.len(), 2);
        assert!(plan.pipelines[0].op_factories()[1].is_sink());
    }

    #[test]
    fn invalid_join_is_rejected_before_lowering() {
        let task = TaskContext::new("builder", -1);
        let err = match HashJoinPipelineBuilder::new(&task, 1).build(&join_of(0)) {
            Ok(_) => panic!("zero partitions accepted"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("join specification mismatch"), "err={err}");
    }
}
