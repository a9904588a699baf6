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
//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines processor execution contracts and blocked-reason signaling.
//! - Used by drivers to orchestrate cooperative operator execution steps.
//!
//! Key exported interfaces:
//! - Types: `BlockedReason`, `Operator`, `ProcessorOperator`.

use std::sync::Arc;

use crate::common::error::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

/// The execution engine uses cooperative scheduling.
///
/// Operators are driven by a [`PipelineDriver`](crate::exec::pipeline::driver::PipelineDriver)
/// which repeatedly tries to move data from upstream to downstream.
/// When a driver cannot make progress without blocking, it records a [`BlockedReason`]
/// and yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// Upstream currently has no data available.
    InputEmpty,
    /// Downstream cannot accept more output at the moment.
    OutputFull,
    /// Blocked on a dependency object (e.g. build-side ready).
    Dependency(DependencyHandle),
}

/// Base operator contract. Lifecycle: created, receiving input, optionally blocked, finished.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Tracker owned by this operator inside its driver; retained memory is charged here.
    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        let _ = tracker;
    }

    fn prepare(&mut self) -> ExecResult<()> {
        Ok(())
    }

    /// Release every held resource. Called on all exit paths and must be idempotent.
    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn cancel(&mut self) {
        // Default: nothing to cancel.
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Extended operator contract for processor stages with push/pull semantics.
///
/// None of these calls may block the calling thread. An operator that cannot make
/// progress exposes a not-ready [`precondition_dependency`](Self::precondition_dependency).
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>>;

    /// No more input will arrive.
    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()>;

    /// Dependency that must be ready before the operator can make progress.
    /// This is used for build-side readiness of joins.
    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        None
    }
}

/// A dependency that is still blocking `op`, if any.
pub(crate) fn unready_dependency(op: &dyn ProcessorOperator) -> Option<DependencyHandle> {
    op.precondition_dependency().filter(|dep| !dep.is_ready())
}
