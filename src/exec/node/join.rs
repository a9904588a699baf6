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
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::common::config;
use crate::common::error::{ExecError, ExecResult};
use crate::exec::hash_table::is_supported_key_type;
use crate::exec::node::ExecNode;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinType {
    /// Emit only probe rows with at least one matching build row.
    Inner,
    /// Emit every probe row; unmatched ones carry null build columns.
    ProbeOuter,
}

impl JoinType {
    pub fn is_probe_outer(self) -> bool {
        matches!(self, JoinType::ProbeOuter)
    }
}

/// Key channels of one join side plus an optional precomputed `UInt64` hash channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinKeys {
    pub key_channels: Vec<usize>,
    pub hash_channel: Option<usize>,
}

impl JoinKeys {
    pub fn new(key_channels: Vec<usize>) -> Self {
        Self {
            key_channels,
            hash_channel: None,
        }
    }

    pub fn with_hash_channel(mut self, hash_channel: Option<usize>) -> Self {
        self.hash_channel = hash_channel;
        self
    }
}

/// Declarative description of one equi-join.
#[derive(Clone, Debug)]
pub struct HashJoinNode {
    pub node_id: i32,
    pub join_type: JoinType,
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
    pub probe_keys: JoinKeys,
    pub build_keys: JoinKeys,
    /// Number of independent build hash tables; 1 selects the single-driver builder.
    pub partition_count: usize,
}

impl HashJoinNode {
    /// Join with the configured default number of build partitions.
    pub fn new(
        node_id: i32,
        join_type: JoinType,
        probe: (SchemaRef, JoinKeys),
        build: (SchemaRef, JoinKeys),
    ) -> Self {
        let (probe_schema, probe_keys) = probe;
        let (build_schema, build_keys) = build;
        Self {
            node_id,
            join_type,
            probe_schema,
            build_schema,
            probe_keys,
            build_keys,
            partition_count: config::join_partition_count(),
        }
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Reject mismatched key arity, unsupported or differing key types, bad channels.
    pub fn validate(&self) -> ExecResult<()> {
        if self.partition_count == 0 {
            return Err(ExecError::join_spec(format!(
                "join {}: partition_count must be at least 1",
                self.node_id
            )));
        }
        let probe = &self.probe_keys.key_channels;
        let build = &self.build_keys.key_channels;
        if probe.is_empty() {
            return Err(ExecError::join_spec(format!(
                "join {}: at least one key channel is required",
                self.node_id
            )));
        }
        if probe.len() != build.len() {
            return Err(ExecError::join_spec(format!(
                "join {}: probe has {} key channels but build has {}",
                self.node_id,
                probe.len(),
                build.len()
            )));
        }
        for (idx, (&p, &b)) in probe.iter().zip(build.iter()).enumerate() {
            let probe_type = channel_type(&self.probe_schema, p, "probe", self.node_id)?;
            let build_type = channel_type(&self.build_schema, b, "build", self.node_id)?;
            if !is_supported_key_type(probe_type) {
                return Err(ExecError::join_spec(format!(
                    "join {}: unsupported key type {:?} at key {}",
                    self.node_id, probe_type, idx
                )));
            }
            if probe_type != build_type {
                return Err(ExecError::join_spec(format!(
                    "join {}: key {} type mismatch: probe {:?} vs build {:?}",
                    self.node_id, idx, probe_type, build_type
                )));
            }
        }
        for (keys, schema, side) in [
            (&self.probe_keys, &self.probe_schema, "probe"),
            (&self.build_keys, &self.build_schema, "build"),
        ] {
            if let Some(channel) = keys.hash_channel {
                let data_type = channel_type(schema, channel, side, self.node_id)?;
                if data_type != &DataType::UInt64 {
                    return Err(ExecError::join_spec(format!(
                        "join {}: {} hash channel {} must be UInt64, got {:?}",
                        self.node_id, side, channel, data_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Probe columns followed by build columns; build columns are nullable for outer joins.
    pub fn output_schema(&self) -> SchemaRef {
        let mut fields = self
            .probe_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        let outer = self.join_type.is_probe_outer();
        fields.extend(self.build_schema.fields().iter().map(|f| {
            let field = f.as_ref().clone();
            if outer { field.with_nullable(true) } else { field }
        }));
        Arc::new(Schema::new(fields))
    }
}

fn channel_type<'a>(
    schema: &'a SchemaRef,
    channel: usize,
    side: &str,
    node_id: i32,
) -> ExecResult<&'a DataType> {
    schema
        .fields()
        .get(channel)
        .map(|f| f.data_type())
        .ok_or_else(|| {
            ExecError::join_spec(format!(
                "join {}: {} channel {} out of range (num_columns={})",
                node_id,
                side,
                channel,
                schema.fields().len()
            ))
        })
}

/// Hash join plan node: the join description plus its two inputs.
#[derive(Clone, Debug)]
pub struct JoinNode {
    pub probe: Box<ExecNode>,
    pub build: Box<ExecNode>,
    pub hash_join: HashJoinNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(types: &[DataType]) -> SchemaRef {
        Arc::new(Schema::new(
            types
                .iter()
                .enumerate()
                .map(|(i, t)| Field::new(format!("c{i}"), t.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    fn node(probe: &[DataType], build: &[DataType]) -> HashJoinNode {
        HashJoinNode {
            node_id: 1,
            join_type: JoinType::Inner,
            probe_schema: schema(probe),
            build_schema: schema(build),
            probe_keys: JoinKeys::new(vec![0]),
            build_keys: JoinKeys::new(vec![0]),
            partition_count: 4,
        }
    }

    #[test]
    fn new_uses_configured_partition_count() {
        let n = HashJoinNode::new(
            2,
            JoinType::ProbeOuter,
            (schema(&[DataType::Int64]), JoinKeys::new(vec![0])),
            (schema(&[DataType::Int64]), JoinKeys::new(vec![0])),
        );
        assert_eq!(n.partition_count, config::join_partition_count());
        n.validate().expect("configured partition count is valid");
        assert_eq!(n.with_partition_count(1).partition_count, 1);
    }

    #[test]
    fn matching_keys_validate() {
        let n = node(&[DataType::Utf8, DataType::Int64], &[DataType::Utf8]);
        n.validate().expect("valid join");
    }

    #[test]
    fn key_type_mismatch_is_rejected() {
        let n = node(&[DataType::Int32], &[DataType::Int64]);
        let err = n.validate().expect_err("type mismatch");
        assert!(matches!(err, ExecError::JoinSpec(_)), "err={err}");
    }

    #[test]
    fn key_arity_mismatch_is_rejected() {
        let mut n = node(&[DataType::Int64, DataType::Int64], &[DataType::Int64]);
        n.probe_keys = JoinKeys::new(vec![0, 1]);
        let err = n.validate().expect_err("arity mismatch");
        assert!(err.to_string().contains("key channels"), "err={err}");
    }

    #[test]
    fn hash_channel_must_be_u64() {
        let mut n = node(&[DataType::Int64, DataType::Int64], &[DataType::Int64]);
        n.probe_keys = JoinKeys::new(vec![0]).with_hash_channel(Some(1));
        let err = n.validate().expect_err("bad hash channel");
        assert!(err.to_string().contains("must be UInt64"), "err={err}");
    }

    #[test]
    fn outer_output_schema_makes_build_nullable() {
        let probe = Arc::new(Schema::new(vec![Field::new("p", DataType::Int64, false)]));
        let build = Arc::new(Schema::new(vec![Field::new("b", DataType::Int64, false)]));
        let mut n = node(&[], &[]);
        n.probe_schema = probe;
        n.build_schema = build;
        n.join_type = JoinType::ProbeOuter;
        let out = n.output_schema();
        assert_eq!(out.fields().len(), 2);
        assert!(!out.field(0).is_nullable());
        assert!(out.field(1).is_nullable());
    }
}
