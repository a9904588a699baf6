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
//! Utility functions for lookup join output construction.
//!
//! Responsibilities:
//! - Accumulates (probe row, build address) pairs produced by the probe loop.
//! - Materializes them into one output chunk: probe columns first, then build columns,
//!   with null build columns for unmatched probe rows.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array, new_null_array};
use arrow::compute::{interleave, take};
use arrow::datatypes::SchemaRef;

use super::lookup_source::LookupSource;
use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;

/// Pending output rows of one lookup join probe batch.
#[derive(Debug, Default)]
pub(crate) struct JoinRowsBuilder {
    probe_rows: Vec<u32>,
    build_rows: Vec<Option<(usize, usize)>>,
}

impl JoinRowsBuilder {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            probe_rows: Vec::with_capacity(capacity),
            build_rows: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.probe_rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.probe_rows.is_empty()
    }

    pub(crate) fn append_match(&mut self, probe_row: usize, build: (usize, usize)) {
        self.probe_rows.push(probe_row as u32);
        self.build_rows.push(Some(build));
    }

    pub(crate) fn append_unmatched(&mut self, probe_row: usize) {
        self.probe_rows.push(probe_row as u32);
        self.build_rows.push(None);
    }

    /// Build the output chunk and reset the builder.
    pub(crate) fn flush(
        &mut self,
        probe: &Chunk,
        source: &LookupSource,
        output_schema: &SchemaRef,
    ) -> ExecResult<Chunk> {
        let probe_rows = std::mem::take(&mut self.probe_rows);
        let build_rows = std::mem::take(&mut self.build_rows);
        build_join_chunk(probe, &probe_rows, &build_rows, source, output_schema)
    }
}

/// Assemble joined rows. `build_rows[i] == None` yields nulls for every build column.
pub(crate) fn build_join_chunk(
    probe: &Chunk,
    probe_rows: &[u32],
    build_rows: &[Option<(usize, usize)>],
    source: &LookupSource,
    output_schema: &SchemaRef,
) -> ExecResult<Chunk> {
    if probe_rows.len() != build_rows.len() {
        return Err(ExecError::internal(format!(
            "join output row mismatch: probe={} build={}",
            probe_rows.len(),
            build_rows.len()
        )));
    }
    let expected_columns = probe.num_columns() + source.build_schema().fields().len();
    if output_schema.fields().len() != expected_columns {
        return Err(ExecError::internal(format!(
            "join output schema has {} columns, expected {}",
            output_schema.fields().len(),
            expected_columns
        )));
    }

    let indices = UInt32Array::from(probe_rows.to_vec());
    let mut columns = Vec::with_capacity(expected_columns);
    for column in probe.columns() {
        columns.push(take(column.as_ref(), &indices, None)?);
    }

    let build_chunks = source.build_chunks();
    let null_source = build_chunks.len();
    let build_indices = build_rows
        .iter()
        .map(|row| row.unwrap_or((null_source, 0)))
        .collect::<Vec<_>>();
    for (col_idx, field) in source.build_schema().fields().iter().enumerate() {
        let mut sources: Vec<ArrayRef> = Vec::with_capacity(build_chunks.len() + 1);
        for chunk in build_chunks {
            let column = chunk.column(col_idx).ok_or_else(|| {
                ExecError::internal(format!("build column {} missing from chunk", col_idx))
            })?;
            sources.push(Arc::clone(column));
        }
        sources.push(new_null_array(field.data_type(), 1));
        let refs = sources.iter().map(|a| a.as_ref()).collect::<Vec<&dyn Array>>();
        columns.push(interleave(&refs, &build_indices)?);
    }
    Chunk::try_from_columns(Arc::clone(output_schema), columns)
}
