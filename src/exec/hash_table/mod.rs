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
//! Join key hashing and exact key comparison.
//!
//! Responsibilities:
//! - Computes deterministic 64-bit row hashes over join key channels.
//! - Provides typed key-column views used for exact equality during probing.
//!
//! Key exported interfaces:
//! - Types: `KeyColumn`, `KeyColumns`.
//! - Functions: `hash_row`, `hash_rows`, `is_supported_key_type`.
//!
//! Null rule: a row with a null in any key column hashes to a defined value (so it
//! has a partition) but never equals any other row, including another null row.

pub mod hash;
pub mod key_column;

pub use key_column::{KeyColumn, KeyColumns, hash_row, hash_rows, is_supported_key_type};
