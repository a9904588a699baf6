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
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::error::ExecError;
use crate::novarocks_logging::debug;

/// RuntimeState is the per-task execution context shared by every driver of the task.
///
/// It carries frequently used execution options (chunk size) and the task-wide
/// first-error slot that drivers poll to observe cancellation.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    chunk_size: usize,
    error_state: Arc<RuntimeErrorState>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<ExecError>>,
}

impl RuntimeErrorState {
    /// Record `err` unless an earlier error is already present. Returns true for the first error.
    pub fn set_error(&self, err: ExecError) -> bool {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
            true
        } else {
            false
        }
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(config::chunk_size())
    }
}

impl RuntimeState {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            error_state: Arc::new(RuntimeErrorState::default()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error_state.error()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }

    pub fn set_error(&self, err: ExecError) -> bool {
        let first = self.error_state.set_error(err.clone());
        if first {
            debug!("RuntimeState first error recorded: {}", err);
        }
        first
    }
}
