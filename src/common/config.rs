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
use std::time::Duration;

use crate::novarocks_config::config as novarocks_app_config;

pub(crate) fn chunk_size() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.chunk_size)
        .unwrap_or(4096)
}

pub(crate) fn exec_threads() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn driver_time_slice() -> Duration {
    let ms = novarocks_app_config()
        .ok()
        .map(|c| c.runtime.driver_time_slice_ms)
        .unwrap_or(100);
    Duration::from_millis(ms.max(1))
}

pub(crate) fn join_partition_count() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.join.partition_count)
        .unwrap_or(4)
}

pub(crate) fn expected_build_positions() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.join.expected_build_positions)
        .unwrap_or(1024)
}

pub(crate) fn task_mem_limit_bytes() -> i64 {
    novarocks_app_config()
        .ok()
        .map(|c| c.memory.task_mem_limit_bytes)
        .unwrap_or(-1)
}
