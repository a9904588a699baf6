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
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines dependency handles, readiness flags, and dependency-manager bookkeeping.
//! - Used by the driver executor and join operators to coordinate blocking/unblocking transitions.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`, `DependencyManager`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::exec::pipeline::schedule::observer::{Observable, Observer};
use crate::novarocks_logging::debug;

static NEXT_DEP_MANAGER_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Name of the dependency signalled once every collect sink of a join build has finished.
pub fn join_collect_dep_name(node_id: i32) -> String {
    format!("join_collect:{node_id}")
}

/// Name of the dependency signalled once the lookup source of a join is published (or failed).
pub fn join_build_dep_name(node_id: i32) -> String {
    format!("join_build:{node_id}")
}

/// One-way readiness flag. Observers registered before it turns ready are woken exactly once.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let notify = self.observable.defer_notify();
            notify.arm();
            if should_log_dep(&self.name) {
                debug!(
                    "Dependency ready: dep_id={} name={} observers={}",
                    self.id,
                    self.name,
                    self.observable.num_observers()
                );
            }
        }
    }

    /// Register a wake-up callback. Runs inline when the dependency is already ready.
    pub fn add_waiter(&self, observer: Observer) {
        if self.is_ready() {
            observer();
            return;
        }
        self.observable.add_observer(observer);
        if should_log_dep(&self.name) {
            debug!(
                "Dependency add_waiter: dep_id={} name={} observers_after={}",
                self.id,
                self.name,
                self.observable.num_observers()
            );
        }
        // set_ready may have drained the observers before ours was registered.
        if self.is_ready() {
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }
}

/// Registry of named dependencies shared by every pipeline of one task.
#[derive(Clone)]
pub struct DependencyManager {
    id: usize,
    deps: Arc<Mutex<HashMap<String, DependencyHandle>>>,
}

impl fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.deps.lock().map(|g| g.len()).unwrap_or(0);
        f.debug_struct("DependencyManager")
            .field("id", &self.id)
            .field("deps", &count)
            .finish()
    }
}

impl DependencyManager {
    pub fn new() -> Self {
        Self {
            id: NEXT_DEP_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            deps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn get_or_create(&self, name: impl Into<String>) -> DependencyHandle {
        let name = name.into();
        let mut guard = self.deps.lock().expect("dependency manager lock");
        guard
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Dependency::new(name)))
            .clone()
    }

    pub fn mark_ready(&self, name: &str) {
        self.get_or_create(name).set_ready();
    }
}

fn should_log_dep(name: &str) -> bool {
    name.starts_with("join_build:") || name.starts_with("join_collect:")
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn waiter_registered_before_ready_is_woken_once() {
        let dep = Dependency::new("join_build:1");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dep.add_waiter(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        dep.set_ready();
        dep.set_ready();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiter_on_ready_dependency_runs_inline() {
        let dep = Dependency::new("join_collect:1");
        dep.set_ready();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dep.add_waiter(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_returns_the_same_handle_per_name() {
        let mgr = DependencyManager::new();
        let a = mgr.get_or_create(join_build_dep_name(3));
        let b = mgr.get_or_create("join_build:3");
        assert_eq!(a.id(), b.id());
        mgr.mark_ready("join_build:3");
        assert!(a.is_ready());
        assert!(!mgr.get_or_create(join_collect_dep_name(3)).is_ready());
    }
}
