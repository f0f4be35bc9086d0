// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FleetUp.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Devices deferred during a batch run's first pass

use crate::device::DeviceId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared set of deferred device ids, one per scheduler run
///
/// Clones share the same underlying set. Every membership change happens
/// under a single lock acquisition. A member is only marked as revisiting by
/// [`RevisitSet::begin_revisit`], between passes, so first-pass callers never
/// mistake a concurrent deferral for a revisit.
#[derive(Debug, Clone, Default)]
pub struct RevisitSet {
    inner: Arc<Mutex<BTreeMap<DeviceId, bool>>>,
}

impl RevisitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` if absent; returns true when this call added it
    pub fn insert(&self, id: &DeviceId) -> bool {
        let mut set = self.inner.lock();
        if set.contains_key(id) {
            return false;
        }
        set.insert(id.clone(), false);
        true
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// True once `id` was deferred and the revisit pass has started
    pub fn is_revisiting(&self, id: &DeviceId) -> bool {
        self.inner.lock().get(id).copied().unwrap_or(false)
    }

    /// Mark every member as revisiting and return them sorted
    pub fn begin_revisit(&self) -> Vec<DeviceId> {
        let mut set = self.inner.lock();
        set.values_mut().for_each(|revisiting| *revisiting = true);
        set.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Sorted copy of the current members
    pub fn snapshot(&self) -> Vec<DeviceId> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let set = RevisitSet::new();
        let id = DeviceId::from("fw-01");
        assert!(set.insert(&id));
        assert!(!set.insert(&id));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&id));
    }

    #[test]
    fn test_concurrent_inserts_leave_one_entry() {
        let set = RevisitSet::new();
        let id = DeviceId::from("fw-01");
        let threads = 32;

        let added: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let set = set.clone();
                    let id = id.clone();
                    scope.spawn(move || usize::from(set.insert(&id)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(added, 1);
        assert_eq!(set.snapshot(), vec![id]);
    }

    #[test]
    fn test_clones_share_and_clear() {
        let set = RevisitSet::new();
        let other = set.clone();
        other.insert(&DeviceId::from("b"));
        other.insert(&DeviceId::from("a"));
        assert_eq!(
            set.snapshot(),
            vec![DeviceId::from("a"), DeviceId::from("b")]
        );

        set.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_revisiting_only_after_pass_boundary() {
        let set = RevisitSet::new();
        let early = DeviceId::from("fw-01");
        assert!(set.insert(&early));
        assert!(!set.is_revisiting(&early));

        assert_eq!(set.begin_revisit(), vec![early.clone()]);
        assert!(set.is_revisiting(&early));

        // deferred again during the revisit pass keeps its mark
        assert!(!set.insert(&early));
        assert!(set.is_revisiting(&early));

        let late = DeviceId::from("fw-02");
        assert!(set.insert(&late));
        assert!(!set.is_revisiting(&late));
        assert!(!set.is_revisiting(&DeviceId::from("fw-03")));
    }
}
