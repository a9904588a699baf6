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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::error::{ExecError, ExecResult};

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes explicitly
/// reported by the caller. It does NOT reflect real process RSS or allocator
/// statistics. Only trackers created with a limit reject reservations; the
/// task root is normally the only limited node.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    fn with_parts(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::new_root_with_limit(label, -1)
    }

    /// Create a root tracker; `limit < 0` means unlimited.
    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self::with_parts(label.into(), limit, None))
    }

    /// Create an unlimited child tracker with the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Arc::new(Self::with_parts(
            label.into(),
            -1,
            Some(Arc::clone(parent)),
        ));
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Reserve `bytes` on this tracker and every ancestor, honoring limits.
    ///
    /// On failure every partial addition is rolled back before the error is
    /// returned, so no tracker in the chain observes the rejected bytes.
    pub fn try_consume(&self, bytes: i64) -> ExecResult<()> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            if current.has_limit() && new_value > current.limit {
                current.current.fetch_sub(bytes, Ordering::AcqRel);
                self.rollback_until(current, bytes);
                return Err(ExecError::MemLimitExceeded {
                    label: current.label.clone(),
                    limit: current.limit,
                    consumption: new_value - bytes,
                    requested: bytes,
                });
            }
            tracker = current.parent.as_deref();
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(current.current());
            tracker = current.parent.as_deref();
        }
        Ok(())
    }

    /// Undo a partial `try_consume` on every tracker strictly below `stop`.
    fn rollback_until(&self, stop: &MemTracker, bytes: i64) {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if std::ptr::eq(current, stop) {
                break;
            }
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    /// Increase consumption for this tracker and all ancestors without checking limits.
    ///
    /// Used when bytes that were already admitted move between trackers.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    /// Move `bytes` already held by `self` to `to`.
    ///
    /// Only trackers below the closest common ancestor change, so shared
    /// ancestors neither trip a limit nor record a transient peak.
    pub fn transfer_to(&self, to: &MemTracker, bytes: i64) {
        if std::ptr::eq(self, to) || bytes <= 0 {
            return;
        }
        let mut to_chain: Vec<*const MemTracker> = Vec::new();
        let mut tracker: Option<&MemTracker> = Some(to);
        while let Some(current) = tracker {
            to_chain.push(current as *const MemTracker);
            tracker = current.parent.as_deref();
        }
        let mut common: Option<*const MemTracker> = None;
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let ptr = current as *const MemTracker;
            if to_chain.contains(&ptr) {
                common = Some(ptr);
                break;
            }
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
        let mut tracker: Option<&MemTracker> = Some(to);
        while let Some(current) = tracker {
            if common == Some(current as *const MemTracker) {
                break;
            }
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Byte reservation held against one tracker, released on drop.
///
/// Mirrors "set my retained size to N": growth is limit-checked, shrinking
/// releases immediately.
#[derive(Debug)]
pub struct MemReservation {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl MemReservation {
    pub fn new(tracker: Arc<MemTracker>) -> Self {
        Self { bytes: 0, tracker }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn set_bytes(&mut self, bytes: i64) -> ExecResult<()> {
        let bytes = bytes.max(0);
        let delta = bytes - self.bytes;
        if delta > 0 {
            self.tracker.try_consume(delta)?;
        } else if delta < 0 {
            self.tracker.release(-delta);
        }
        self.bytes = bytes;
        Ok(())
    }

    /// Re-home the reservation onto another tracker without limit checks.
    pub fn transfer_to(&mut self, tracker: Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, &tracker) {
            return;
        }
        self.tracker.transfer_to(&tracker, self.bytes);
        self.tracker = tracker;
    }
}

impl Drop for MemReservation {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_consumption_rolls_up_to_root() {
        let root = MemTracker::new_root("task");
        let pipeline = MemTracker::new_child("pipeline", &root);
        let driver = MemTracker::new_child("driver", &pipeline);

        driver.try_consume(64).expect("consume");
        pipeline.try_consume(16).expect("consume");
        assert_eq!(driver.current(), 64);
        assert_eq!(pipeline.current(), 80);
        assert_eq!(root.current(), 80);

        driver.release(64);
        pipeline.release(16);
        assert_eq!(root.current(), 0);
        assert_eq!(root.peak(), 80);
        assert_eq!(root.allocated(), 80);
        assert_eq!(root.deallocated(), 80);
    }

    #[test]
    fn limit_failure_rolls_back_every_level() {
        let root = MemTracker::new_root_with_limit("task", 100);
        let driver = MemTracker::new_child("driver", &root);
        driver.try_consume(60).expect("first reservation fits");

        let err = driver.try_consume(50).expect_err("second reservation exceeds");
        match &err {
            ExecError::MemLimitExceeded {
                label,
                limit,
                consumption,
                requested,
            } => {
                assert_eq!(label, "task");
                assert_eq!(*limit, 100);
                assert_eq!(*consumption, 60);
                assert_eq!(*requested, 50);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.current(), 60);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 60);
    }

    #[test]
    fn transfer_is_net_zero_at_common_ancestor() {
        let root = MemTracker::new_root_with_limit("task", 100);
        let a = MemTracker::new_child("a", &root);
        let b = MemTracker::new_child("b", &root);
        a.try_consume(90).expect("consume");
        a.transfer_to(&b, 90);
        assert_eq!(a.current(), 0);
        assert_eq!(b.current(), 90);
        assert_eq!(root.current(), 90);
        assert_eq!(root.peak(), 90);
        assert_eq!(root.allocated(), 90);
    }

    #[test]
    fn reservation_tracks_resize_and_drop() {
        let root = MemTracker::new_root_with_limit("task", 1000);
        let op = MemTracker::new_child("op", &root);
        {
            let mut r = MemReservation::new(Arc::clone(&op));
            r.set_bytes(400).expect("grow");
            r.set_bytes(100).expect("shrink");
            assert_eq!(root.current(), 100);
            assert!(r.set_bytes(2000).is_err());
            assert_eq!(r.bytes(), 100);
            assert_eq!(root.current(), 100);
        }
        assert_eq!(root.current(), 0);
        assert_eq!(root.peak(), 400);
    }

    #[test]
    fn children_lists_live_trackers_only() {
        let root = MemTracker::new_root("task");
        let kept = MemTracker::new_child("kept", &root);
        drop(MemTracker::new_child("dropped", &root));
        let children = root.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].label(), kept.label());
    }
}
