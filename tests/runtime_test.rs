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
//! Integration tests for runtime components (task contexts, memory tracking).

use std::sync::Arc;

use novarocks_join::TaskContext;
use novarocks_join::runtime::mem_tracker::{MemReservation, MemTracker};

mod common;

#[test]
fn test_task_pipeline_driver_hierarchy_accounting() {
    let task = TaskContext::new("runtime-hierarchy", 1000);
    let pipeline = task.add_pipeline_context();
    let first = pipeline.add_driver_context();
    let second = pipeline.add_driver_context();
    assert_eq!(first.driver_sequence(), 0);
    assert_eq!(second.driver_sequence(), 1);
    assert_eq!(pipeline.driver_count(), 2);

    first.mem_tracker().try_consume(300).expect("first");
    second.mem_tracker().try_consume(200).expect("second");
    assert_eq!(pipeline.mem_tracker().current(), 500);
    assert_eq!(task.memory_reservation(), 500);

    let err = second
        .mem_tracker()
        .try_consume(600)
        .expect_err("task limit");
    assert!(err.is_mem_limit_exceeded());
    assert!(err.to_string().contains("Query exceeded local memory limit of 1000"));
    // A rejected request leaves every level untouched.
    assert_eq!(second.mem_tracker().current(), 200);
    assert_eq!(task.memory_reservation(), 500);

    first.mem_tracker().release(300);
    second.mem_tracker().release(200);
    assert_eq!(task.memory_reservation(), 0);
    assert_eq!(task.peak_memory_reservation(), 500);
}

#[test]
fn test_reservation_moves_between_drivers_without_double_counting() {
    let task = TaskContext::new("runtime-transfer", -1);
    let pipeline = task.add_pipeline_context();
    let build = pipeline.add_driver_context();
    let shared = MemTracker::new_child("shared", task.mem_tracker());

    let mut reservation = MemReservation::new(Arc::clone(build.mem_tracker()));
    reservation.set_bytes(4096).expect("reserve");
    reservation.transfer_to(Arc::clone(&shared));
    assert_eq!(build.mem_tracker().current(), 0);
    assert_eq!(shared.current(), 4096);
    assert_eq!(task.peak_memory_reservation(), 4096);

    reservation.set_bytes(1024).expect("shrink");
    assert_eq!(task.memory_reservation(), 1024);
    drop(reservation);
    assert_eq!(task.memory_reservation(), 0);
}

#[test]
fn test_cancel_records_first_reason() {
    let task = TaskContext::new("runtime-cancel", -1);
    task.cancel("user abort");
    task.cancel("second reason");
    assert!(task.runtime_state().is_cancelled());
    let err = task.runtime_state().error().expect("error recorded");
    assert!(err.to_string().contains("user abort"), "err={err}");
}
