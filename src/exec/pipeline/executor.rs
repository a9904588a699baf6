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
//! Multi-threaded driver executor.
//!
//! Responsibilities:
//! - Runs a set of pipeline drivers to completion on a pool of worker threads.
//! - Parks dependency-blocked drivers and re-queues them from the dependency observer.
//! - Fails the task on the first driver failure so every other driver cancels and closes.
//!
//! Key exported interfaces:
//! - Types: `DriverExecutor`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use super::driver::{DriverState, PipelineDriver};
use super::operator::BlockedReason;
use crate::common::config;
use crate::common::error::{ExecError, ExecResult};
use crate::novarocks_logging::{debug, error};

// Parked drivers are swept for task cancellation at this interval.
const PARKED_SWEEP_INTERVAL: Duration = Duration::from_millis(20);

struct DriverTask {
    key: u64,
    driver: PipelineDriver,
}

struct SchedulerState {
    queue: VecDeque<DriverTask>,
    parked: HashMap<u64, DriverTask>,
    remaining: usize,
    error: Option<ExecError>,
}

struct ExecutorShared {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

impl ExecutorShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn requeue_parked(&self, key: u64) {
        let mut st = self.lock();
        if let Some(task) = st.parked.remove(&key) {
            st.queue.push_back(task);
            self.cv.notify_one();
        }
    }

    fn requeue_all_parked(st: &mut SchedulerState) {
        let keys = st.parked.keys().copied().collect::<Vec<_>>();
        for key in keys {
            if let Some(task) = st.parked.remove(&key) {
                st.queue.push_back(task);
            }
        }
    }

    fn requeue_cancelled_parked(st: &mut SchedulerState) {
        let keys = st
            .parked
            .iter()
            .filter(|(_, task)| task.driver.context().runtime_state().is_cancelled())
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in keys {
            if let Some(task) = st.parked.remove(&key) {
                st.queue.push_back(task);
            }
        }
    }

    fn driver_done(&self, task: DriverTask, failure: Option<ExecError>) {
        let runtime_state = Arc::clone(task.driver.context().runtime_state());
        // Closing happens on drop; keep it outside the scheduler lock.
        drop(task);
        if let Some(err) = failure.as_ref() {
            runtime_state.set_error(err.clone());
        }
        let mut st = self.lock();
        if st.error.is_none() {
            st.error = failure.or_else(|| runtime_state.error());
        }
        if runtime_state.is_cancelled() {
            Self::requeue_all_parked(&mut st);
        }
        st.remaining = st.remaining.saturating_sub(1);
        self.cv.notify_all();
    }
}

/// Runs drivers on `num_threads` workers until every driver reaches a terminal state.
#[derive(Clone, Debug)]
pub struct DriverExecutor {
    num_threads: usize,
    time_slice: Duration,
}

impl Default for DriverExecutor {
    fn default() -> Self {
        Self::new(config::exec_threads())
    }
}

impl DriverExecutor {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
            time_slice: config::driver_time_slice(),
        }
    }

    pub fn with_time_slice(mut self, time_slice: Duration) -> Self {
        self.time_slice = time_slice;
        self
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Drive every driver to completion. Returns the first failure observed, if any.
    pub fn run(&self, drivers: Vec<PipelineDriver>) -> ExecResult<()> {
        if drivers.is_empty() {
            return Ok(());
        }
        let driver_count = drivers.len();
        let queue = drivers
            .into_iter()
            .enumerate()
            .map(|(idx, driver)| DriverTask {
                key: idx as u64,
                driver,
            })
            .collect::<VecDeque<_>>();
        let shared = Arc::new(ExecutorShared {
            state: Mutex::new(SchedulerState {
                queue,
                parked: HashMap::new(),
                remaining: driver_count,
                error: None,
            }),
            cv: Condvar::new(),
        });
        let num_threads = self.num_threads.min(driver_count);
        debug!(
            "DriverExecutor run: drivers={} threads={} time_slice_ms={}",
            driver_count,
            num_threads,
            self.time_slice.as_millis()
        );

        let mut workers = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let time_slice = self.time_slice;
            let spawned = thread::Builder::new()
                .name(format!("driver-exec-{idx}"))
                .spawn(move || worker_loop(shared_cloned, time_slice));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    error!("failed to spawn driver executor thread: {}", err);
                    break;
                }
            }
        }
        if workers.is_empty() {
            return Err(ExecError::internal(
                "driver executor could not start any worker thread",
            ));
        }

        let mut join_error = None;
        for handle in workers {
            if handle.join().is_err() {
                join_error = Some(ExecError::internal("driver executor worker panicked"));
            }
        }
        let st = shared.lock();
        match st.error.clone().or(join_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn worker_loop(shared: Arc<ExecutorShared>, time_slice: Duration) {
    loop {
        let mut task = {
            let mut st = shared.lock();
            loop {
                if st.remaining == 0 {
                    return;
                }
                if let Some(task) = st.queue.pop_front() {
                    break task;
                }
                let (guard, timeout) = shared
                    .cv
                    .wait_timeout(st, PARKED_SWEEP_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner());
                st = guard;
                if timeout.timed_out() {
                    ExecutorShared::requeue_cancelled_parked(&mut st);
                }
            }
        };

        let state = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.driver.process(time_slice)
        }))
        .unwrap_or_else(|payload| {
            DriverState::Failed(ExecError::internal(format!(
                "panic in driver execution: {}",
                panic_message(payload)
            )))
        });

        match state {
            DriverState::Ready | DriverState::Running => {
                let mut st = shared.lock();
                st.queue.push_back(task);
                shared.cv.notify_one();
            }
            DriverState::Blocked(BlockedReason::Dependency(dep)) => {
                let key = task.key;
                {
                    let mut st = shared.lock();
                    st.parked.insert(key, task);
                }
                let weak: Weak<ExecutorShared> = Arc::downgrade(&shared);
                dep.add_waiter(Arc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.requeue_parked(key);
                    }
                }));
            }
            DriverState::Blocked(BlockedReason::InputEmpty | BlockedReason::OutputFull) => {
                let mut st = shared.lock();
                st.queue.push_back(task);
                drop(st);
                thread::yield_now();
            }
            DriverState::Finished | DriverState::Canceled => {
                shared.driver_done(task, None);
            }
            DriverState::Failed(err) => {
                shared.driver_done(task, Some(err));
            }
        }
    }
}
