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
//! Operator factory trait definitions.
//!
//! Responsibilities:
//! - Defines factory contracts used by pipeline builder to instantiate operators per driver.
//! - Separates plan-time operator configuration from runtime operator instances.
//!
//! Key exported interfaces:
//! - Types: `OperatorFactory`.

use super::operator::Operator;
use crate::runtime::task_context::DriverContext;

/// Factory contract for constructing runtime operators from plan-time configuration.
///
/// Factories carry no per-driver state beyond shared handles such as a lookup source supplier.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create the operator instance for one driver. `ctx.driver_sequence()` is the
    /// driver's index inside its pipeline.
    fn create(&self, ctx: &DriverContext) -> Box<dyn Operator>;

    fn is_source(&self) -> bool {
        false
    }

    fn is_sink(&self) -> bool {
        false
    }
}
