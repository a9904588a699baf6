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
//! Hash-join operator module exports.
//!
//! Responsibilities:
//! - Registers the hash build (single and partitioned) and lookup join probe operators.
//! - Exposes the lookup source shared between them.

mod hash_builder_sink;
pub(crate) mod join_hash_table;
pub(crate) mod join_probe_utils;
mod lookup_join_processor;
pub mod lookup_source;
mod parallel_hash_builder;

pub use hash_builder_sink::HashBuilderSinkFactory;
pub use join_hash_table::JoinHashTable;
pub use lookup_join_processor::LookupJoinFactory;
pub use lookup_source::{JoinPosition, LookupSource, LookupSourceSupplier};
pub use parallel_hash_builder::{
    HashCollectSinkFactory, ParallelHashBuilder, PartitionBuildFactory,
};
