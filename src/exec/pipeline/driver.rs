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
//! Pipeline driver execution loop.
//!
//! Responsibilities:
//! - Runs one chain of processor operators with cooperative scheduling semantics.
//! - Tracks driver state transitions, blocking reasons, and time-slice quotas.
//! - Closes every operator in reverse order on every exit path.
//!
//! Key exported interfaces:
//! - Types: `DriverState`, `StepOutcome`, `PipelineDriver`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::operator::{BlockedReason, Operator, ProcessorOperator, unready_dependency};
use crate::common::error::{ExecError, ExecResult};
use crate::novarocks_logging::{debug, error, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::task_context::DriverContext;

/// Runtime state for a single pipeline driver.
///
/// **State machine (high level)**
/// ```text
///              (scheduled)                 (time slice ends)
///   Ready ───────────────────► Running ─────────────────────► Ready
///                               │  │
///                               │  ├─ blocks on deps ───────► Blocked(reason)
///                               │  │                         │
///                               │  │        (resumed)        │
///                               │  └─────────────────────────┘
///                               │
///                               ├─ completes normally ───────► Finished
///                               ├─ canceled ─────────────────► Canceled
///                               └─ fatal error ──────────────► Failed(err)
/// ```
#[derive(Clone, Debug)]
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    Finished,
    Canceled,
    Failed(ExecError),
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_)
        )
    }
}

/// Result of one scheduling step.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// At most one chunk moved between two adjacent operators, or one operator advanced.
    Progress,
    /// Nothing could move; the reason names what the chain is waiting for.
    Blocked(BlockedReason),
    Finished,
}

/// Cooperative execution driver that runs the operator chain of one pipeline instance.
pub struct PipelineDriver {
    ctx: DriverContext,
    operators: Vec<Box<dyn Operator>>,
    operator_mem_trackers: Vec<Arc<MemTracker>>,
    operator_finishing_set: Vec<bool>,
    state: DriverState,
    closed: bool,
}

fn processor_mut<'a>(op: &'a mut Box<dyn Operator>) -> ExecResult<&'a mut dyn ProcessorOperator> {
    let name = op.name().to_string();
    op.as_processor_mut().ok_or_else(|| {
        ExecError::internal(format!(
            "pipeline operator {} missing processor operator",
            name
        ))
    })
}

impl PipelineDriver {
    pub fn new(ctx: DriverContext, operators: Vec<Box<dyn Operator>>) -> Self {
        let mut operators = operators;
        let operator_mem_trackers = operators
            .iter()
            .enumerate()
            .map(|(idx, op)| {
                let label = format!("operator {}: {}", idx, op.name());
                MemTracker::new_child(label, ctx.mem_tracker())
            })
            .collect::<Vec<_>>();
        for (op, tracker) in operators.iter_mut().zip(operator_mem_trackers.iter()) {
            op.set_mem_tracker(Arc::clone(tracker));
        }
        let operator_count = operators.len();
        debug!(
            "PipelineDriver created: pipeline_id={} driver_id={} operators={:?}",
            ctx.pipeline().pipeline_id(),
            ctx.driver_id(),
            operators.iter().map(|op| op.name()).collect::<Vec<_>>()
        );
        Self {
            ctx,
            operators,
            operator_mem_trackers,
            operator_finishing_set: vec![false; operator_count],
            state: DriverState::Ready,
            closed: false,
        }
    }

    pub fn driver_id(&self) -> i32 {
        self.ctx.driver_id()
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn operator_names(&self) -> Vec<String> {
        self.operators
            .iter()
            .map(|op| op.name().to_string())
            .collect()
    }

    /// Validate every operator after creation. A failure closes the chain.
    pub fn prepare(&mut self) -> ExecResult<()> {
        for idx in 0..self.operators.len() {
            if let Err(err) = self.operators[idx].prepare() {
                self.finish_with_state(DriverState::Failed(err.clone()));
                return Err(err);
            }
        }
        Ok(())
    }

    /// A driver is finished exactly when its terminal operator is finished.
    pub fn is_finished(&self) -> bool {
        self.operators
            .last()
            .map(|op| op.is_finished())
            .unwrap_or(true)
    }

    /// Run scheduling steps until the chain blocks, finishes, fails or uses up `time_slice`.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        let start = Instant::now();
        self.state = DriverState::Running;
        loop {
            if self.ctx.runtime_state().error().is_some() {
                return self.finish_with_state(DriverState::Canceled);
            }
            match self.process_step() {
                Ok(StepOutcome::Progress) => {
                    if start.elapsed() >= time_slice {
                        self.state = DriverState::Ready;
                        return self.state.clone();
                    }
                }
                Ok(StepOutcome::Blocked(reason)) => return self.block(reason),
                Ok(StepOutcome::Finished) => {
                    return self.finish_with_state(DriverState::Finished);
                }
                Err(err) => return self.finish_with_state(DriverState::Failed(err)),
            }
        }
    }

    /// One scheduling step: propagates one finish signal or moves at most one chunk.
    pub fn process_step(&mut self) -> ExecResult<StepOutcome> {
        if self.is_finished() {
            return Ok(StepOutcome::Finished);
        }
        let state = Arc::clone(self.ctx.runtime_state());

        if self.operators.len() == 1 {
            let op = processor_mut(&mut self.operators[0])?;
            if let Some(dep) = unready_dependency(op) {
                return Ok(StepOutcome::Blocked(BlockedReason::Dependency(dep)));
            }
            // A lone operator is both source and sink: its output has nowhere to go.
            let _ = op.pull_chunk(&state)?;
            return Ok(StepOutcome::Progress);
        }

        for idx in 0..self.operators.len() - 1 {
            let downstream_idx = idx + 1;
            let (left, right) = self.operators.split_at_mut(downstream_idx);
            let upstream_op = &mut left[idx];
            let downstream_op = &mut right[0];
            if downstream_op.is_finished() {
                continue;
            }
            if upstream_op.is_finished() {
                if !self.operator_finishing_set[downstream_idx] {
                    self.operator_finishing_set[downstream_idx] = true;
                    processor_mut(downstream_op)?.set_finishing(&state)?;
                    return Ok(StepOutcome::Progress);
                }
                continue;
            }
            let upstream = processor_mut(upstream_op)?;
            if unready_dependency(upstream).is_some() {
                continue;
            }
            let downstream = processor_mut(downstream_op)?;
            if unready_dependency(downstream).is_some() || !downstream.need_input() {
                continue;
            }
            let upstream = processor_mut(upstream_op)?;
            if !upstream.has_output() {
                continue;
            }
            let pulled = upstream.pull_chunk(&state)?;
            let upstream_finished = upstream_op.is_finished();
            match pulled {
                Some(chunk) if !chunk.is_empty() => {
                    // Memory is charged to the current holder.
                    chunk.transfer_to(&self.operator_mem_trackers[downstream_idx]);
                    processor_mut(downstream_op)?.push_chunk(&state, chunk)?;
                    return Ok(StepOutcome::Progress);
                }
                _ if upstream_finished => return Ok(StepOutcome::Progress),
                _ => {}
            }
        }

        // A finishing sink may still have work of its own, such as building a hash table.
        let sink_idx = self.operators.len() - 1;
        if self.operator_finishing_set[sink_idx] && !self.operators[sink_idx].is_finished() {
            let sink = processor_mut(&mut self.operators[sink_idx])?;
            if unready_dependency(sink).is_none() && sink.has_output() {
                let _ = sink.pull_chunk(&state)?;
                return Ok(StepOutcome::Progress);
            }
        }

        for op in &self.operators {
            if op.is_finished() {
                continue;
            }
            if let Some(dep) = op.as_processor_ref().and_then(unready_dependency) {
                return Ok(StepOutcome::Blocked(BlockedReason::Dependency(dep)));
            }
        }
        Ok(StepOutcome::Blocked(BlockedReason::InputEmpty))
    }

    /// Cancel and close the chain from outside the scheduling loop.
    pub fn cancel(&mut self) -> DriverState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        self.finish_with_state(DriverState::Canceled)
    }

    fn block(&mut self, reason: BlockedReason) -> DriverState {
        if let BlockedReason::Dependency(dep) = &reason {
            debug!(
                "Driver blocked on dependency: driver_id={} dep_name={}",
                self.driver_id(),
                dep.name()
            );
        }
        self.state = DriverState::Blocked(reason);
        self.state.clone()
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        if matches!(state, DriverState::Canceled | DriverState::Failed(_)) {
            for op in self.operators.iter_mut() {
                op.cancel();
            }
        }
        match &state {
            DriverState::Finished => {
                let last_op = self
                    .operators
                    .last()
                    .map(|op| op.name())
                    .unwrap_or("unknown");
                debug!(
                    "Driver finished: driver_id={} last_op={}",
                    self.driver_id(),
                    last_op
                );
            }
            DriverState::Canceled => {
                debug!("Driver canceled: driver_id={}", self.driver_id());
            }
            DriverState::Failed(err) => {
                error!("Driver failed: driver_id={} error={}", self.driver_id(), err);
            }
            _ => {}
        }
        self.close_operators();
        self.state = state;
        self.state.clone()
    }

    fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for idx in (0..self.operators.len()).rev() {
            let op = &mut self.operators[idx];
            if let Err(err) = op.close() {
                error!("operator close failed: {}: {}", op.name(), err);
            }
            let tracker = &self.operator_mem_trackers[idx];
            if tracker.current() != 0 {
                warn!(
                    "operator still holds memory after close: {} current={}",
                    tracker.label(),
                    tracker.current()
                );
            }
        }
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.close_operators();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;
    use crate::exec::chunk::Chunk;
    use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
    use crate::runtime::runtime_state::RuntimeState;
    use crate::runtime::task_context::TaskContext;

    fn int_chunk(values: &[i32]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let array = Arc::new(Int32Array::from(values.to_vec())) as ArrayRef;
        Chunk::try_from_columns(schema, vec![array]).expect("chunk")
    }

    struct Source {
        chunks: Vec<Chunk>,
        gate: Option<DependencyHandle>,
        closed: Arc<AtomicUsize>,
    }

    impl Operator for Source {
        fn name(&self) -> &str {
            "TEST_SOURCE"
        }
        fn close(&mut self) -> ExecResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_finished(&self) -> bool {
            self.chunks.is_empty()
        }
        fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
            Some(self)
        }
        fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
            Some(self)
        }
    }

    impl ProcessorOperator for Source {
        fn need_input(&self) -> bool {
            false
        }
        fn has_output(&self) -> bool {
            !self.chunks.is_empty()
        }
        fn push_chunk(&mut self, _: &RuntimeState, _: Chunk) -> ExecResult<()> {
            Err(ExecError::internal("source does not accept input"))
        }
        fn pull_chunk(&mut self, _: &RuntimeState) -> ExecResult<Option<Chunk>> {
            if self.chunks.is_empty() {
                return Ok(None);
            }
            Ok(Some(self.chunks.remove(0)))
        }
        fn set_finishing(&mut self, _: &RuntimeState) -> ExecResult<()> {
            Ok(())
        }
        fn precondition_dependency(&self) -> Option<DependencyHandle> {
            self.gate.clone()
        }
    }

    struct Sink {
        rows: Arc<AtomicUsize>,
        fail_on_push: bool,
        /// Pulls needed after `set_finishing` before the sink is done.
        finish_steps: usize,
        finishing: bool,
        finished: bool,
        closed: Arc<AtomicUsize>,
    }

    impl Operator for Sink {
        fn name(&self) -> &str {
            "TEST_SINK"
        }
        fn close(&mut self) -> ExecResult<()> {
            self.closed.fetch_add(10, Ordering::SeqCst);
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

    impl ProcessorOperator for Sink {
        fn need_input(&self) -> bool {
            !self.finishing && !self.finished
        }
        fn has_output(&self) -> bool {
            self.finishing && !self.finished
        }
        fn push_chunk(&mut self, _: &RuntimeState, chunk: Chunk) -> ExecResult<()> {
            if self.fail_on_push {
                return Err(ExecError::internal("sink rejected chunk"));
            }
            self.rows.fetch_add(chunk.len(), Ordering::SeqCst);
            Ok(())
        }
        fn pull_chunk(&mut self, _: &RuntimeState) -> ExecResult<Option<Chunk>> {
            if self.finishing && !self.finished {
                self.finish_steps -= 1;
                self.finished = self.finish_steps == 0;
            }
            Ok(None)
        }
        fn set_finishing(&mut self, _: &RuntimeState) -> ExecResult<()> {
            self.finishing = true;
            self.finished = self.finish_steps == 0;
            Ok(())
        }
    }

    fn driver(
        chunks: Vec<Chunk>,
        gate: Option<DependencyHandle>,
        fail_on_push: bool,
    ) -> (PipelineDriver, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        driver_with_finish_steps(chunks, gate, fail_on_push, 0)
    }

    fn driver_with_finish_steps(
        chunks: Vec<Chunk>,
        gate: Option<DependencyHandle>,
        fail_on_push: bool,
        finish_steps: usize,
    ) -> (PipelineDriver, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let task = TaskContext::new("driver-test", -1);
        let ctx = task.add_pipeline_context().add_driver_context();
        let rows = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let ops: Vec<Box<dyn Operator>> = vec![
            Box::new(Source {
                chunks,
                gate,
                closed: Arc::clone(&closed),
            }),
            Box::new(Sink {
                rows: Arc::clone(&rows),
                fail_on_push,
                finish_steps,
                finishing: false,
                finished: false,
                closed: Arc::clone(&closed),
            }),
        ];
        (PipelineDriver::new(ctx, ops), rows, closed)
    }

    #[test]
    fn step_moves_at_most_one_chunk() {
        let (mut d, rows, _) = driver(vec![int_chunk(&[1, 2]), int_chunk(&[3])], None, false);
        assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
        assert_eq!(rows.load(Ordering::SeqCst), 2);
        assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
        assert_eq!(rows.load(Ordering::SeqCst), 3);
        // Source exhausted: next step tells the sink to finish.
        assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
        assert!(d.is_finished());
        assert!(matches!(d.process_step(), Ok(StepOutcome::Finished)));
    }

    #[test]
    fn finishing_sink_is_pulled_until_done() {
        let (mut d, rows, _) = driver_with_finish_steps(vec![int_chunk(&[1])], None, false, 3);
        assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
        assert_eq!(rows.load(Ordering::SeqCst), 1);
        // One step tells the sink to finish, then one step per unit of sink work.
        for _ in 0..3 {
            assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
            assert!(!d.is_finished());
        }
        assert!(matches!(d.process_step(), Ok(StepOutcome::Progress)));
        assert!(d.is_finished());
    }

    #[test]
    fn blocked_dependency_suspends_until_ready() {
        let gate = Arc::new(Dependency::new("join_build:7"));
        let (mut d, rows, _) = driver(vec![int_chunk(&[1])], Some(Arc::clone(&gate)), false);
        let state = d.process(Duration::from_secs(1));
        match state {
            DriverState::Blocked(BlockedReason::Dependency(dep)) => assert_eq!(dep.id(), gate.id()),
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(rows.load(Ordering::SeqCst), 0);
        gate.set_ready();
        assert!(matches!(
            d.process(Duration::from_secs(1)),
            DriverState::Finished
        ));
        assert_eq!(rows.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_closes_every_operator_once() {
        let (mut d, _, closed) = driver(vec![int_chunk(&[1])], None, true);
        let state = d.process(Duration::from_secs(1));
        assert!(matches!(state, DriverState::Failed(_)));
        assert_eq!(closed.load(Ordering::SeqCst), 11);
        drop(d);
        assert_eq!(closed.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn task_error_cancels_driver() {
        let (mut d, _, closed) = driver(vec![int_chunk(&[1])], None, false);
        d.context()
            .runtime_state()
            .set_error(ExecError::Cancelled("test".to_string()));
        assert!(matches!(
            d.process(Duration::from_secs(1)),
            DriverState::Canceled
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 11);
    }
}
