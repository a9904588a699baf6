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
//! Task / pipeline / driver execution contexts.
//!
//! Responsibilities:
//! - Owns the per-task memory tracker root (the only node carrying a hard limit).
//! - Hands out pipeline and driver contexts whose trackers roll up into the task root.
//! - Shares task-wide runtime state and the dependency registry with every driver.
//!
//! Key exported interfaces:
//! - Types: `TaskContext`, `PipelineContext`, `DriverContext`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::common::config;
use crate::common::error::ExecError;
use crate::exec::pipeline::dependency::DependencyManager;
use crate::novarocks_logging::info;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

/// Root context of one executing query fragment.
#[derive(Debug)]
pub struct TaskContext {
    task_id: String,
    mem_tracker: Arc<MemTracker>,
    runtime_state: Arc<RuntimeState>,
    dep_manager: DependencyManager,
    next_pipeline_id: AtomicI32,
    next_driver_id: AtomicI32,
}

impl TaskContext {
    /// Create a task with a hard memory limit; `mem_limit_bytes < 0` means unlimited.
    pub fn new(task_id: impl Into<String>, mem_limit_bytes: i64) -> Arc<Self> {
        Self::with_runtime_state(task_id, mem_limit_bytes, RuntimeState::default())
    }

    /// Create a task using the configured `memory.task_mem_limit_bytes`.
    pub fn with_default_limit(task_id: impl Into<String>) -> Arc<Self> {
        Self::new(task_id, config::task_mem_limit_bytes())
    }

    pub fn with_runtime_state(
        task_id: impl Into<String>,
        mem_limit_bytes: i64,
        runtime_state: RuntimeState,
    ) -> Arc<Self> {
        let task_id = task_id.into();
        let mem_tracker =
            MemTracker::new_root_with_limit(format!("task {}", task_id), mem_limit_bytes);
        Arc::new(Self {
            task_id,
            mem_tracker,
            runtime_state: Arc::new(runtime_state),
            dep_manager: DependencyManager::new(),
            next_pipeline_id: AtomicI32::new(0),
            next_driver_id: AtomicI32::new(0),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn dep_manager(&self) -> &DependencyManager {
        &self.dep_manager
    }

    pub fn memory_reservation(&self) -> i64 {
        self.mem_tracker.current()
    }

    pub fn peak_memory_reservation(&self) -> i64 {
        self.mem_tracker.peak()
    }

    /// Abort the task; every driver observes the error on its next scheduling step.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .runtime_state
            .set_error(ExecError::Cancelled(reason.clone()))
        {
            info!("Task cancelled: task_id={} reason={}", self.task_id, reason);
        }
    }

    pub fn add_pipeline_context(self: &Arc<Self>) -> Arc<PipelineContext> {
        let pipeline_id = self.next_pipeline_id.fetch_add(1, Ordering::Relaxed);
        let mem_tracker =
            MemTracker::new_child(format!("pipeline {}", pipeline_id), &self.mem_tracker);
        Arc::new(PipelineContext {
            task: Arc::clone(self),
            pipeline_id,
            mem_tracker,
            next_sequence: AtomicI32::new(0),
        })
    }

    fn next_driver_id(&self) -> i32 {
        self.next_driver_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Context shared by the drivers instantiated from one pipeline.
#[derive(Debug)]
pub struct PipelineContext {
    task: Arc<TaskContext>,
    pipeline_id: i32,
    mem_tracker: Arc<MemTracker>,
    next_sequence: AtomicI32,
}

impl PipelineContext {
    pub fn task(&self) -> &Arc<TaskContext> {
        &self.task
    }

    pub fn pipeline_id(&self) -> i32 {
        self.pipeline_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Number of driver contexts created so far.
    pub fn driver_count(&self) -> i32 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    pub fn add_driver_context(self: &Arc<Self>) -> DriverContext {
        let driver_sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let driver_id = self.task.next_driver_id();
        let mem_tracker = MemTracker::new_child(
            format!("driver {} (pipeline {})", driver_id, self.pipeline_id),
            &self.mem_tracker,
        );
        DriverContext {
            pipeline: Arc::clone(self),
            driver_id,
            driver_sequence,
            mem_tracker,
        }
    }
}

/// Driver-local context passed to operator factories.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pipeline: Arc<PipelineContext>,
    driver_id: i32,
    driver_sequence: i32,
    mem_tracker: Arc<MemTracker>,
}

impl DriverContext {
    /// Task-unique driver id.
    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    /// Index of this driver within its pipeline, starting at 0.
    pub fn driver_sequence(&self) -> i32 {
        self.driver_sequence
    }

    pub fn pipeline(&self) -> &Arc<PipelineContext> {
        &self.pipeline
    }

    pub fn task(&self) -> &Arc<TaskContext> {
        self.pipeline.task()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        self.pipeline.task().runtime_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_reservation_rolls_up_to_task() {
        let task = TaskContext::new("t1", 1024);
        let pipeline = task.add_pipeline_context();
        let d0 = pipeline.add_driver_context();
        let d1 = pipeline.add_driver_context();
        assert_eq!(d0.driver_sequence(), 0);
        assert_eq!(d1.driver_sequence(), 1);
        assert_ne!(d0.driver_id(), d1.driver_id());

        d0.mem_tracker().try_consume(100).expect("reserve");
        d1.mem_tracker().try_consume(200).expect("reserve");
        assert_eq!(pipeline.mem_tracker().current(), 300);
        assert_eq!(task.memory_reservation(), 300);

        let err = d1.mem_tracker().try_consume(1000).expect_err("over limit");
        assert!(err.is_mem_limit_exceeded());
        assert_eq!(task.memory_reservation(), 300);

        d0.mem_tracker().release(100);
        d1.mem_tracker().release(200);
        assert_eq!(task.memory_reservation(), 0);
        assert_eq!(task.peak_memory_reservation(), 300);
    }

    #[test]
    fn cancel_records_first_reason() {
        let task = TaskContext::new("t2", -1);
        task.cancel("user abort");
        task.cancel("second");
        let err = task.runtime_state().error().expect("cancelled");
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("user abort"));
    }
}
