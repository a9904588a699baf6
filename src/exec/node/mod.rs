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
pub mod join;
pub mod values;

use crate::exec::node::join::JoinNode;
use crate::exec::node::values::ValuesNode;

/// Plan node kinds understood by the pipeline builder.
#[derive(Clone, Debug)]
pub enum ExecNodeKind {
    Values(ValuesNode),
    HashJoin(JoinNode),
}

#[derive(Clone, Debug)]
pub struct ExecNode {
    pub kind: ExecNodeKind,
}

impl ExecNode {
    pub fn values(node: ValuesNode) -> Self {
        Self {
            kind: ExecNodeKind::Values(node),
        }
    }

    pub fn hash_join(node: JoinNode) -> Self {
        Self {
            kind: ExecNodeKind::HashJoin(node),
        }
    }

    pub fn node_id(&self) -> i32 {
        match &self.kind {
            ExecNodeKind::Values(node) => node.node_id,
            ExecNodeKind::HashJoin(node) => node.hash_join.node_id,
        }
    }

    pub fn output_schema(&self) -> arrow::datatypes::SchemaRef {
        match &self.kind {
            ExecNodeKind::Values(node) => std::sync::Arc::clone(&node.schema),
            ExecNodeKind::HashJoin(node) => node.hash_join.output_schema(),
        }
    }
}
