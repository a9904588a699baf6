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
//! Pipeline structure metadata.
//!
//! Responsibilities:
//! - Represents one pipeline with ordered operator factories and a degree of parallelism.
//! - Instantiates one driver per parallel instance under a fresh pipeline context.
//!
//! Key exported interfaces:
//! - Types: `Pipeline`.

use std::sync::Arc;

use super::driver::PipelineDriver;
use super::operator_factory::OperatorFactory;
use crate::common::error::{ExecError, ExecResult};
use crate::novarocks_logging::debug;
use crate::runtime::task_context::TaskContext;

/// One pipeline definition containing ordered operator factories.
pub struct Pipeline {
    id: i32,
    op_factories: Vec<Arc<dyn OperatorFactory>>,
    dop: i32,
}

impl Pipeline {
    pub fn new(id: i32, op_factories: Vec<Arc<dyn OperatorFactory>>, dop: i32) -> Self {
        Self {
            id,
            op_factories,
            dop: dop.max(1),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn dop(&self) -> i32 {
        self.dop
    }

    pub fn op_factories(&self) -> &[Arc<dyn OperatorFactory>] {
        &self.op_factories
    }

    fn validate(&self) -> ExecResult<()> {
        if self.op_factories.is_empty() {
            return Err(ExecError::internal(format!(
                "pipeline {} has no operators",
                self.id
            )));
        }
        if self.op_factories.len() == 1 {
            return Ok(());
        }
        let mut source_idx = None;
        let mut sink_idx = None;
        for (idx, factory) in self.op_factories.iter().enumerate() {
            if factory.is_source() {
                if source_idx.is_some() {
                    return Err(ExecError::internal("pipeline has multiple source operators"));
                }
                source_idx = Some(idx);
            }
            if factory.is_sink() {
                if sink_idx.is_some() {
                    return Err(ExecError::internal("pipeline has multiple sink operators"));
                }
                sink_idx = Some(idx);
            }
        }
        let source_idx =
            source_idx.ok_or_else(|| ExecError::internal("pipeline missing source operator"))?;
        let sink_idx =
            sink_idx.ok_or_else(|| ExecError::internal("pipeline missing sink operator"))?;
        if source_idx != 0 {
            return Err(ExecError::internal("pipeline source must be the first operator"));
        }
        if sink_idx + 1 != self.op_factories.len() {
            return Err(ExecError::internal("pipeline sink must be the last operator"));
        }
        Ok(())
    }

    /// Create `dop` prepared drivers. Driver `i` sees `driver_sequence() == i`.
    pub fn instantiate_drivers(&self, task: &Arc<TaskContext>) -> ExecResult<Vec<PipelineDriver>> {
        self.validate()?;
        let pipeline_ctx = task.add_pipeline_context();
        let mut drivers = Vec::with_capacity(self.dop as usize);
        for i in 0..self.dop {
            let driver_ctx = pipeline_ctx.add_driver_context();
            let operators = self
                .op_factories
                .iter()
                .map(|factory| factory.create(&driver_ctx))
                .collect::<Vec<_>>();
            debug!(
                "Pipeline driver created: pipeline_id={} driver_id={} local_index={} dop={} operators={}",
                self.id,
                driver_ctx.driver_id(),
                i,
                self.dop,
                self.op_factories
                    .iter()
                    .map(|factory| factory.name())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            let mut driver = PipelineDriver::new(driver_ctx, operators);
            driver.prepare()?;
            drivers.push(driver);
        }
        Ok(drivers)
    }
}
