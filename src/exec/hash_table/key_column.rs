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
use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array, Float32Array,
    Float64Array, Int8Array, Int16Array, Int32Array, Int64Array, LargeStringArray, StringArray,
    UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;

use super::hash::{
    JOIN_HASH_SEED, canonical_f32_bits, canonical_f64_bits, combine_hash, hash_bytes_with_seed,
    hash_null_with_seed, hash_u64_with_seed, mix_u64,
};
use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;

fn float32_key_equal(left: f32, right: f32) -> bool {
    (left.is_nan() && right.is_nan()) || left == right
}

fn float64_key_equal(left: f64, right: f64) -> bool {
    (left.is_nan() && right.is_nan()) || left == right
}

/// Key types accepted for equi-join channels.
pub fn is_supported_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::Date32
            | DataType::Date64
    )
}

/// Typed view over one join key column.
#[derive(Clone, Debug)]
pub enum KeyColumn {
    Boolean(BooleanArray),
    Int8(Int8Array),
    Int16(Int16Array),
    Int32(Int32Array),
    Int64(Int64Array),
    UInt8(UInt8Array),
    UInt16(UInt16Array),
    UInt32(UInt32Array),
    UInt64(UInt64Array),
    Float32(Float32Array),
    Float64(Float64Array),
    Utf8(StringArray),
    LargeUtf8(LargeStringArray),
    Binary(BinaryArray),
    Date32(Date32Array),
    Date64(Date64Array),
}

macro_rules! downcast_key {
    ($array:expr, $ty:ty, $variant:ident) => {
        $array
            .as_any()
            .downcast_ref::<$ty>()
            .cloned()
            .map(KeyColumn::$variant)
    };
}

macro_rules! with_key_array {
    ($column:expr, $arr:ident => $body:expr) => {
        match $column {
            KeyColumn::Boolean($arr) => $body,
            KeyColumn::Int8($arr) => $body,
            KeyColumn::Int16($arr) => $body,
            KeyColumn::Int32($arr) => $body,
            KeyColumn::Int64($arr) => $body,
            KeyColumn::UInt8($arr) => $body,
            KeyColumn::UInt16($arr) => $body,
            KeyColumn::UInt32($arr) => $body,
            KeyColumn::UInt64($arr) => $body,
            KeyColumn::Float32($arr) => $body,
            KeyColumn::Float64($arr) => $body,
            KeyColumn::Utf8($arr) => $body,
            KeyColumn::LargeUtf8($arr) => $body,
            KeyColumn::Binary($arr) => $body,
            KeyColumn::Date32($arr) => $body,
            KeyColumn::Date64($arr) => $body,
        }
    };
}

impl KeyColumn {
    pub fn try_new(array: &ArrayRef) -> ExecResult<Self> {
        let column = match array.data_type() {
            DataType::Boolean => downcast_key!(array, BooleanArray, Boolean),
            DataType::Int8 => downcast_key!(array, Int8Array, Int8),
            DataType::Int16 => downcast_key!(array, Int16Array, Int16),
            DataType::Int32 => downcast_key!(array, Int32Array, Int32),
            DataType::Int64 => downcast_key!(array, Int64Array, Int64),
            DataType::UInt8 => downcast_key!(array, UInt8Array, UInt8),
            DataType::UInt16 => downcast_key!(array, UInt16Array, UInt16),
            DataType::UInt32 => downcast_key!(array, UInt32Array, UInt32),
            DataType::UInt64 => downcast_key!(array, UInt64Array, UInt64),
            DataType::Float32 => downcast_key!(array, Float32Array, Float32),
            DataType::Float64 => downcast_key!(array, Float64Array, Float64),
            DataType::Utf8 => downcast_key!(array, StringArray, Utf8),
            DataType::LargeUtf8 => downcast_key!(array, LargeStringArray, LargeUtf8),
            DataType::Binary => downcast_key!(array, BinaryArray, Binary),
            DataType::Date32 => downcast_key!(array, Date32Array, Date32),
            DataType::Date64 => downcast_key!(array, Date64Array, Date64),
            other => {
                return Err(ExecError::internal(format!(
                    "unsupported join key type: {other:?}"
                )));
            }
        };
        column.ok_or_else(|| {
            ExecError::internal(format!(
                "join key array does not match its data type {:?}",
                array.data_type()
            ))
        })
    }

    pub fn len(&self) -> usize {
        with_key_array!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, row: usize) -> bool {
        with_key_array!(self, arr => arr.is_null(row))
    }

    /// Hash of a non-null value. The caller must check `is_null` first.
    fn hash_value(&self, row: usize) -> u64 {
        let seed = JOIN_HASH_SEED;
        match self {
            KeyColumn::Boolean(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
            KeyColumn::Int8(arr) => hash_u64_with_seed(seed, arr.value(row) as i64 as u64),
            KeyColumn::Int16(arr) => hash_u64_with_seed(seed, arr.value(row) as i64 as u64),
            KeyColumn::Int32(arr) => hash_u64_with_seed(seed, arr.value(row) as i64 as u64),
            KeyColumn::Int64(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
            KeyColumn::UInt8(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
            KeyColumn::UInt16(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
            KeyColumn::UInt32(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
            KeyColumn::UInt64(arr) => hash_u64_with_seed(seed, arr.value(row)),
            KeyColumn::Float32(arr) => {
                hash_u64_with_seed(seed, canonical_f32_bits(arr.value(row)) as u64)
            }
            KeyColumn::Float64(arr) => hash_u64_with_seed(seed, canonical_f64_bits(arr.value(row))),
            KeyColumn::Utf8(arr) => hash_bytes_with_seed(seed, arr.value(row).as_bytes()),
            KeyColumn::LargeUtf8(arr) => hash_bytes_with_seed(seed, arr.value(row).as_bytes()),
            KeyColumn::Binary(arr) => hash_bytes_with_seed(seed, arr.value(row)),
            KeyColumn::Date32(arr) => hash_u64_with_seed(seed, arr.value(row) as i64 as u64),
            KeyColumn::Date64(arr) => hash_u64_with_seed(seed, arr.value(row) as u64),
        }
    }

    /// SQL `=` on one key component: nulls never compare equal.
    pub fn equals(&self, row: usize, other: &KeyColumn, other_row: usize) -> bool {
        if self.is_null(row) || other.is_null(other_row) {
            return false;
        }
        match (self, other) {
            (KeyColumn::Boolean(a), KeyColumn::Boolean(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Int8(a), KeyColumn::Int8(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Int16(a), KeyColumn::Int16(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Int32(a), KeyColumn::Int32(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Int64(a), KeyColumn::Int64(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::UInt8(a), KeyColumn::UInt8(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::UInt16(a), KeyColumn::UInt16(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::UInt32(a), KeyColumn::UInt32(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::UInt64(a), KeyColumn::UInt64(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Float32(a), KeyColumn::Float32(b)) => {
                float32_key_equal(a.value(row), b.value(other_row))
            }
            (KeyColumn::Float64(a), KeyColumn::Float64(b)) => {
                float64_key_equal(a.value(row), b.value(other_row))
            }
            (KeyColumn::Utf8(a), KeyColumn::Utf8(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::LargeUtf8(a), KeyColumn::LargeUtf8(b)) => {
                a.value(row) == b.value(other_row)
            }
            (KeyColumn::Binary(a), KeyColumn::Binary(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Date32(a), KeyColumn::Date32(b)) => a.value(row) == b.value(other_row),
            (KeyColumn::Date64(a), KeyColumn::Date64(b)) => a.value(row) == b.value(other_row),
            _ => false,
        }
    }
}

/// Key columns of one chunk plus its optional precomputed hash channel.
#[derive(Clone, Debug)]
pub struct KeyColumns {
    columns: Vec<KeyColumn>,
    precomputed: Option<UInt64Array>,
    num_rows: usize,
}

impl KeyColumns {
    pub fn try_new(chunk: &Chunk, key_channels: &[usize]) -> ExecResult<Self> {
        Self::try_new_with_hash(chunk, key_channels, None)
    }

    /// Like `try_new`, but `hash_row` reads `hash_channel` verbatim when it is set.
    pub fn try_new_with_hash(
        chunk: &Chunk,
        key_channels: &[usize],
        hash_channel: Option<usize>,
    ) -> ExecResult<Self> {
        if key_channels.is_empty() {
            return Err(ExecError::internal("join requires at least one key channel"));
        }
        let mut columns = Vec::with_capacity(key_channels.len());
        for &channel in key_channels {
            let array = chunk.column(channel).ok_or_else(|| {
                ExecError::internal(format!(
                    "key channel {} out of range (num_columns={})",
                    channel,
                    chunk.num_columns()
                ))
            })?;
            columns.push(KeyColumn::try_new(array)?);
        }
        let precomputed = match hash_channel {
            Some(channel) => {
                let array = chunk.column(channel).ok_or_else(|| {
                    ExecError::internal(format!(
                        "hash channel {} out of range (num_columns={})",
                        channel,
                        chunk.num_columns()
                    ))
                })?;
                let hashes = array
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .cloned()
                    .ok_or_else(|| {
                        ExecError::internal(format!(
                            "hash channel {} must be UInt64, got {:?}",
                            channel,
                            array.data_type()
                        ))
                    })?;
                Some(hashes)
            }
            None => None,
        };
        Ok(Self {
            columns,
            precomputed,
            num_rows: chunk.len(),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    pub fn row_has_null(&self, row: usize) -> bool {
        self.columns.iter().any(|c| c.is_null(row))
    }

    /// Row hash: the precomputed channel value if present, otherwise `compute_hash`.
    pub fn hash_row(&self, row: usize) -> u64 {
        match self.precomputed.as_ref() {
            Some(hashes) => hashes.value(row),
            None => self.compute_hash(row),
        }
    }

    /// Row hash computed from key values, ignoring any precomputed channel.
    pub fn compute_hash(&self, row: usize) -> u64 {
        let mut acc = JOIN_HASH_SEED;
        for column in &self.columns {
            let value_hash = if column.is_null(row) {
                hash_null_with_seed(JOIN_HASH_SEED)
            } else {
                column.hash_value(row)
            };
            acc = combine_hash(acc, value_hash);
        }
        mix_u64(acc)
    }

    /// Exact key-tuple equality; false whenever either row has a null component.
    pub fn row_equals(&self, row: usize, other: &KeyColumns, other_row: usize) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| a.equals(row, b, other_row))
    }
}

/// Hash one chunk row over `key_channels`.
pub fn hash_row(chunk: &Chunk, row: usize, key_channels: &[usize]) -> ExecResult<u64> {
    if row >= chunk.len() {
        return Err(ExecError::internal(format!(
            "row {} out of range (num_rows={})",
            row,
            chunk.len()
        )));
    }
    Ok(KeyColumns::try_new(chunk, key_channels)?.compute_hash(row))
}

/// Hash every row of a chunk over `key_channels`.
pub fn hash_rows(chunk: &Chunk, key_channels: &[usize]) -> ExecResult<Vec<u64>> {
    let keys = KeyColumns::try_new(chunk, key_channels)?;
    Ok((0..chunk.len()).map(|row| keys.compute_hash(row)).collect())
}
