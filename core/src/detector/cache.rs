use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::pipeline::Post;

/// Bounded set of already-published item ids.
///
/// Entries are never promoted on lookup, so eviction order is insertion order:
/// once `capacity` is exceeded the oldest id goes first.
pub struct DedupCache {
    seen: LruCache<String, ()>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns false when the id was already present (its age is left untouched).
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.put(id.to_string(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.seen.cap().get()
    }

    /// Keep the items whose id has not been seen, dropping repeats inside the
    /// batch too. Does not record anything; call [`DedupCache::insert`] once an
    /// item is actually published.
    pub fn detect_new<T, F>(&self, items: Vec<T>, id_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        let mut batch = HashSet::new();
        items
            .into_iter()
            .filter(|item| {
                let id = id_of(item);
                !self.contains(id) && batch.insert(id.to_string())
            })
            .collect()
    }

    pub fn detect_new_posts(&self, posts: Vec<Post>) -> Vec<Post> {
        self.detect_new(posts, |p| p.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn post(id: &str) -> Post {
        Post {
            id: id.to_string(),
            author: "someone".into(),
            text: "hello".into(),
            url: None,
            created_at: Utc::now(),
            like_count: 0,
            reply_count: 0,
        }
    }

    #[test]
    fn evicts_oldest_first() {
        let mut cache = DedupCache::new(3);
        for id in ["a", "b", "c"] {
            assert!(cache.insert(id));
        }
        // Lookups do not refresh age.
        assert!(cache.contains("a"));
        assert!(!cache.insert("a"));

        assert!(cache.insert("d"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn seen_posts_are_filtered() {
        let mut cache = DedupCache::new(10);
        cache.insert("p1");

        let fresh = cache.detect_new_posts(vec![post("p1"), post("p2"), post("p2"), post("p3")]);
        let ids: Vec<&str> = fresh.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);
        // Detection alone records nothing.
        assert!(!cache.contains("p2"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }
}
