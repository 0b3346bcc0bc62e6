//! Ordered work queue drained lowest key first.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Map whose entries are consumed in ascending key order.
///
/// Once a key has been popped, nothing may be queued at or below it: stages
/// that feed each other through a `SnapQueue` can never reorder work that is
/// already done.
#[derive(Debug, Clone)]
pub struct SnapQueue<K, V> {
    entries: BTreeMap<K, V>,
    last_popped: Option<K>,
}

impl<K, V> Default for SnapQueue<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_popped: None,
        }
    }
}

impl<K: Ord + Clone + Debug, V> SnapQueue<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_key(&self, key: &K) {
        if let Some(last) = &self.last_popped {
            assert!(
                key > last,
                "key {:?} queued at or below drained key {:?}",
                key,
                last
            );
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.check_key(&key);
        self.entries.insert(key, value)
    }

    /// Returns the value for `key`, queueing a default one first if needed.
    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.check_key(&key);
        self.entries.entry(key).or_default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Lowest queued entry.
    pub fn front(&self) -> Option<(&K, &V)> {
        self.entries.first_key_value()
    }

    /// Removes and returns the lowest queued entry.
    pub fn pop_front(&mut self) -> Option<(K, V)> {
        let (key, value) = self.entries.pop_first()?;
        self.last_popped = Some(key.clone());
        Some((key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Ord + Clone + Debug, V> FromIterator<(K, V)> for SnapQueue<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            last_popped: None,
        }
    }
}

impl<K, V> IntoIterator for SnapQueue<K, V> {
    type Item = (K, V);
    type IntoIter = btree_map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_ascending_order() {
        let mut queue: SnapQueue<u64, &str> = [(7, "c"), (1, "a"), (3, "b")].into_iter().collect();
        assert_eq!(queue.front(), Some((&1, &"a")));

        let mut drained = Vec::new();
        while let Some((key, value)) = queue.pop_front() {
            drained.push((key, value));
        }
        assert_eq!(drained, vec![(1, "a"), (3, "b"), (7, "c")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_ahead_of_drained_keys() {
        let mut queue: SnapQueue<u64, Vec<u32>> = SnapQueue::new();
        queue.entry_or_default(2).push(1);
        queue.entry_or_default(2).push(2);
        assert_eq!(queue.pop_front(), Some((2, vec![1, 2])));

        queue.insert(5, vec![3]);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains_key(&5));
    }

    #[test]
    #[should_panic(expected = "queued at or below drained key")]
    fn test_rejects_key_behind_drained() {
        let mut queue: SnapQueue<u64, ()> = SnapQueue::new();
        queue.insert(4, ());
        queue.pop_front();
        queue.insert(4, ());
    }
}
