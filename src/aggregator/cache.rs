//! Bounded in-memory cache of active `CallGroup`s, keyed by `linkedid`. Capacity defaults to
//! 10,000 per §5; once full, inserting a new key evicts the oldest-touched entry rather than
//! refusing the insert — a call that has been quiet the longest is the least likely to still be
//! receiving new CDR/CEL rows.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::model::CallGroup;

pub struct ActiveCallCache {
    capacity: usize,
    groups: DashMap<String, CallGroup>,
    order: std::sync::Mutex<VecDeque<String>>,
}

impl ActiveCallCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, groups: DashMap::new(), order: std::sync::Mutex::new(VecDeque::new()) }
    }

    /// Returns a clone of the group for `linkedid`, creating an empty one and touching its
    /// position in the eviction order if it's new.
    pub fn get_or_create(&self, linkedid: &str) -> CallGroup {
        if let Some(existing) = self.groups.get(linkedid) {
            return existing.clone();
        }
        self.touch(linkedid);
        self.groups.entry(linkedid.to_string()).or_insert_with(|| CallGroup::new(linkedid)).clone()
    }

    pub fn put(&self, group: CallGroup) {
        self.touch(&group.linkedid);
        self.groups.insert(group.linkedid.clone(), group);
        self.evict_if_over_capacity();
    }

    pub fn remove(&self, linkedid: &str) {
        self.groups.remove(linkedid);
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        order.retain(|k| k != linkedid);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    fn touch(&self, linkedid: &str) {
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        order.retain(|k| k != linkedid);
        order.push_back(linkedid.to_string());
    }

    fn evict_if_over_capacity(&self) {
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        while self.groups.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.groups.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_entry_once_over_capacity() {
        let cache = ActiveCallCache::new(2);
        cache.put(CallGroup::new("a"));
        cache.put(CallGroup::new("b"));
        cache.put(CallGroup::new("c"));
        assert_eq!(cache.len(), 2);
        assert!(!cache.groups.contains_key("a"));
        assert!(cache.groups.contains_key("c"));
    }

    #[test]
    fn re_putting_an_existing_key_refreshes_its_position() {
        let cache = ActiveCallCache::new(2);
        cache.put(CallGroup::new("a"));
        cache.put(CallGroup::new("b"));
        cache.put(CallGroup::new("a"));
        cache.put(CallGroup::new("c"));
        assert!(cache.groups.contains_key("a"));
        assert!(!cache.groups.contains_key("b"));
    }
}
