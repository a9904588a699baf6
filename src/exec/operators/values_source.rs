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
//! VALUES source operator.
//!
//! Responsibilities:
//! - Emits the literal chunks of a VALUES node, one chunk per pull.
//! - Splits chunks across drivers round-robin: driver `i` of `dop` emits chunks
//!   `i, i + dop, ...`, so every chunk is produced exactly once per pipeline.
//!
//! Key exported interfaces:
//! - Types: `ValuesSourceFactory`.

use std::sync::Arc;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::task_context::DriverContext;

/// Factory for VALUES source operators that emit literal plan chunks.
pub struct ValuesSourceFactory {
    name: String,
    chunks: Arc<Vec<Chunk>>,
    dop: usize,
}

impl ValuesSourceFactory {
    pub fn new(node_id: i32, chunks: Vec<Chunk>, dop: usize) -> Self {
        let name = if node_id >= 0 {
            format!("VALUES_SOURCE (id={node_id})")
        } else {
            "VALUES_SOURCE".to_string()
        };
        Self {
            name,
            chunks: Arc::new(chunks),
            dop: dop.max(1),
        }
    }
}

impl OperatorFactory for ValuesSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, ctx: &DriverContext) -> Box<dyn Operator> {
        let sequence = ctx.driver_sequence().max(0) as usize;
        Box::new(ValuesSourceOperator {
            name: self.name.clone(),
            chunks: Arc::clone(&self.chunks),
            next: sequence,
            dop: self.dop,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ValuesSourceOperator {
    name: String,
    chunks: Arc<Vec<Chunk>>,
    next: usize,
    dop: usize,
}

impl Operator for ValuesSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }

    fn is_finished(&self) -> bool {
        self.next >= self.chunks.len()
    }
}

impl ProcessorOperator for ValuesSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.is_finished()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> ExecResult<()> {
        Err(ExecError::internal("values source operator does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        let Some(chunk) = self.chunks.get(self.next) else {
            return Ok(None);
        };
        self.next += self.dop;
        // Literal chunks are shared by every run; hand out an unaccounted view.
        Ok(Some(Chunk::new(chunk.batch.clone())))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }
}
