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
use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;

/// In-memory rows handed to the engine as already materialized chunks.
#[derive(Clone, Debug)]
pub struct ValuesNode {
    pub node_id: i32,
    pub schema: SchemaRef,
    pub chunks: Vec<Chunk>,
}

impl ValuesNode {
    pub fn new(node_id: i32, schema: SchemaRef, chunks: Vec<Chunk>) -> Self {
        Self {
            node_id,
            schema,
            chunks,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}
