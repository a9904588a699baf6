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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use novarocks_join::exec::chunk::Chunk;
use novarocks_join::exec::hash_table::hash_row;
use novarocks_join::exec::node::ExecNode;
use novarocks_join::exec::node::join::{HashJoinNode, JoinKeys, JoinNode, JoinType};
use novarocks_join::exec::node::values::ValuesNode;
use novarocks_join::exec::pipeline::driver::{DriverState, PipelineDriver};
use novarocks_join::novarocks_config;
use novarocks_join::novarocks_logging;

pub const PARTITION_COUNT: usize = 4;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks_join.toml");

        let config_content = r#"
log_level = "debug"

[runtime]
chunk_size = 1024
exec_threads = 4
driver_time_slice_ms = 10

[join]
partition_count = 4
expected_build_positions = 100

[memory]
task_mem_limit_bytes = -1
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novarocks_logging::init_with_level("debug");
    }

    /// Parse the test configuration without installing it process-wide.
    pub fn parse_config(&self) -> anyhow::Result<novarocks_config::NovaRocksConfig> {
        novarocks_config::NovaRocksConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Column types used by join tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    Bigint,
}

impl ColumnType {
    fn data_type(self) -> DataType {
        match self {
            ColumnType::Varchar => DataType::Utf8,
            ColumnType::Bigint => DataType::Int64,
        }
    }
}

/// One materialized cell. Ordering puts nulls first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cell {
    Null,
    Int(i64),
    Str(String),
}

pub fn s(v: &str) -> Cell {
    Cell::Str(v.to_string())
}

pub fn i(v: i64) -> Cell {
    Cell::Int(v)
}

/// Builds chunks for one join input, optionally with a precomputed hash column
/// appended after the data columns.
pub struct RowChunksBuilder {
    name: &'static str,
    types: Vec<ColumnType>,
    key_channels: Vec<usize>,
    with_hash: bool,
    pending: Vec<Vec<Cell>>,
    chunks: Vec<Chunk>,
}

impl RowChunksBuilder {
    pub fn new(name: &'static str, types: &[ColumnType], key_channels: &[usize]) -> Self {
        Self {
            name,
            types: types.to_vec(),
            key_channels: key_channels.to_vec(),
            with_hash: false,
            pending: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn with_hash_channel(mut self, with_hash: bool) -> Self {
        self.with_hash = with_hash;
        self
    }

    pub fn hash_channel(&self) -> Option<usize> {
        self.with_hash.then_some(self.types.len())
    }

    pub fn keys(&self) -> JoinKeys {
        JoinKeys::new(self.key_channels.clone()).with_hash_channel(self.hash_channel())
    }

    pub fn schema(&self) -> SchemaRef {
        let mut fields = self
            .types
            .iter()
            .enumerate()
            .map(|(idx, t)| Field::new(format!("{}_{}", self.name, idx), t.data_type(), true))
            .collect::<Vec<_>>();
        if self.with_hash {
            fields.push(Field::new(format!("{}_hash", self.name), DataType::UInt64, false));
        }
        Arc::new(Schema::new(fields))
    }

    pub fn row(mut self, cells: Vec<Cell>) -> Self {
        assert_eq!(cells.len(), self.types.len(), "row arity");
        self.pending.push(cells);
        self
    }

    /// Close the current chunk.
    pub fn page_break(mut self) -> Self {
        self.flush();
        self
    }

    /// Append one chunk of `len` rows where column `c` counts up from `initial[c]`.
    pub fn add_sequence_page(mut self, len: usize, initial: &[i64]) -> Self {
        assert_eq!(initial.len(), self.types.len(), "initial values arity");
        self.flush();
        for row in 0..len as i64 {
            let cells = self
                .types
                .iter()
                .zip(initial)
                .map(|(t, start)| match t {
                    ColumnType::Varchar => Cell::Str((start + row).to_string()),
                    ColumnType::Bigint => Cell::Int(start + row),
                })
                .collect();
            self.pending.push(cells);
        }
        self.flush();
        self
    }

    pub fn build(mut self) -> Vec<Chunk> {
        self.flush();
        self.chunks
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.pending);
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.types.len() + 1);
        for (idx, t) in self.types.iter().enumerate() {
            let column: ArrayRef = match t {
                ColumnType::Varchar => Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| match &r[idx] {
                            Cell::Str(v) => Some(v.clone()),
                            Cell::Null => None,
                            Cell::Int(v) => Some(v.to_string()),
                        })
                        .collect::<Vec<_>>(),
                )),
                ColumnType::Bigint => Arc::new(Int64Array::from(
                    rows.iter()
                        .map(|r| match &r[idx] {
                            Cell::Int(v) => Some(*v),
                            Cell::Null => None,
                            Cell::Str(v) => Some(v.parse().expect("bigint cell")),
                        })
                        .collect::<Vec<_>>(),
                )),
            };
            columns.push(column);
        }
        let data_schema = Arc::new(Schema::new(
            self.schema().fields()[..self.types.len()].to_vec(),
        ));
        let data = Chunk::try_from_columns(data_schema, columns.clone()).expect("data chunk");
        if self.with_hash {
            let hashes = (0..data.len())
                .map(|row| hash_row(&data, row, &self.key_channels).expect("hash"))
                .collect::<Vec<_>>();
            columns.push(Arc::new(UInt64Array::from(hashes)));
        }
        self.chunks
            .push(Chunk::try_from_columns(self.schema(), columns).expect("chunk"));
    }
}

/// Values node over the chunks of a builder.
pub fn values_node(node_id: i32, schema: SchemaRef, chunks: Vec<Chunk>) -> ExecNode {
    ExecNode::values(ValuesNode::new(node_id, schema, chunks))
}

/// Join of two value inputs with the given key layout.
pub fn join_plan(
    join_type: JoinType,
    probe: (SchemaRef, JoinKeys, Vec<Chunk>),
    build: (SchemaRef, JoinKeys, Vec<Chunk>),
    partition_count: usize,
) -> ExecNode {
    let (probe_schema, probe_keys, probe_chunks) = probe;
    let (build_schema, build_keys, build_chunks) = build;
    ExecNode::hash_join(JoinNode {
        probe: Box::new(values_node(1, Arc::clone(&probe_schema), probe_chunks)),
        build: Box::new(values_node(2, Arc::clone(&build_schema), build_chunks)),
        hash_join: HashJoinNode::new(
            3,
            join_type,
            (probe_schema, probe_keys),
            (build_schema, build_keys),
        )
        .with_partition_count(partition_count),
    })
}

fn cell_at(column: &ArrayRef, row: usize) -> Cell {
    if column.is_null(row) {
        return Cell::Null;
    }
    match column.data_type() {
        DataType::Utf8 => {
            let a = column.as_any().downcast_ref::<StringArray>().expect("utf8");
            Cell::Str(a.value(row).to_string())
        }
        DataType::Int64 => {
            let a = column.as_any().downcast_ref::<Int64Array>().expect("int64");
            Cell::Int(a.value(row))
        }
        other => panic!("unexpected output type {other:?}"),
    }
}

/// Materialize rows, dropping `skip` columns (hash channels), sorted for comparison.
pub fn sorted_rows(chunks: &[Chunk], skip: &[usize]) -> Vec<Vec<Cell>> {
    let mut rows = Vec::new();
    for chunk in chunks {
        for row in 0..chunk.len() {
            rows.push(
                chunk
                    .columns()
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !skip.contains(idx))
                    .map(|(_, col)| cell_at(col, row))
                    .collect::<Vec<_>>(),
            );
        }
    }
    rows.sort();
    rows
}

/// Run one driver on the current thread until it reaches a terminal state.
///
/// Panics if the driver blocks: callers order drivers so dependencies are already met.
pub fn run_driver(driver: &mut PipelineDriver) -> DriverState {
    for _ in 0..1_000_000 {
        match driver.process(Duration::from_millis(50)) {
            DriverState::Ready | DriverState::Running => continue,
            DriverState::Blocked(reason) => panic!("driver blocked: {reason:?}"),
            terminal => return terminal,
        }
    }
    panic!("driver did not finish");
}
