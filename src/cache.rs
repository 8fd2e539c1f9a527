use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;

/// A response captured for reuse. Headers are cloned on insertion so later
/// mutation of the live response cannot reach the cached copy.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// `None` means the entry never expires on its own.
    pub expires_at: Option<Instant>,
}

struct Node {
    key: String,
    resp: Arc<CachedResponse>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct LruState {
    map: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

/// Bounded in-memory LRU cache with per-entry TTL.
///
/// A hash map indexes into an arena of list nodes ordered most-recently-used
/// first. Every operation, including `get`, reorders the list, so all three
/// run under a single exclusive lock. The size bound is enforced on insertion.
pub struct ResponseCache {
    max_entries: usize,
    state: Mutex<LruState>,
}

impl ResponseCache {
    pub fn new(max_entries: i64) -> Self {
        let max_entries = if max_entries <= 0 { 1024 } else { max_entries as usize };
        Self {
            max_entries,
            state: Mutex::new(LruState {
                map: HashMap::with_capacity(max_entries),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
        }
    }

    /// Look up a live entry and mark it most-recently-used. An expired entry
    /// is evicted in place and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<CachedResponse>> {
        let mut state = self.state.lock();
        let idx = *state.map.get(key)?;

        let expired = matches!(state.nodes[idx].resp.expires_at, Some(at) if Instant::now() > at);
        if expired {
            state.remove_node(idx);
            return None;
        }

        state.unlink(idx);
        state.push_front(idx);
        Some(state.nodes[idx].resp.clone())
    }

    /// Insert or overwrite. Either way the entry ends up at the head of the
    /// LRU order; least-recently-used entries are evicted past the bound.
    pub fn set(&self, key: &str, resp: CachedResponse) {
        let resp = Arc::new(resp);
        let mut state = self.state.lock();

        if let Some(&idx) = state.map.get(key) {
            state.nodes[idx].resp = resp;
            state.unlink(idx);
            state.push_front(idx);
            return;
        }

        let idx = state.alloc(Node {
            key: key.to_string(),
            resp,
            prev: None,
            next: None,
        });
        state.map.insert(key.to_string(), idx);
        state.push_front(idx);

        while state.map.len() > self.max_entries {
            match state.tail {
                Some(tail) => state.remove_node(tail),
                None => break,
            }
        }
    }

    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(key) {
            state.remove_node(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.lock();

        let mut forward = Vec::new();
        let mut cursor = state.head;
        let mut prev = None;
        while let Some(idx) = cursor {
            let node = &state.nodes[idx];
            assert_eq!(node.prev, prev, "broken prev link at {:?}", node.key);
            assert_eq!(state.map.get(&node.key), Some(&idx), "map does not point at node");
            forward.push(idx);
            prev = Some(idx);
            cursor = node.next;
        }
        assert_eq!(state.tail, prev, "tail does not match last list node");
        assert_eq!(forward.len(), state.map.len(), "list and map disagree on size");
    }
}

impl LruState {
    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn remove_node(&mut self, idx: usize) {
        self.unlink(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.map.remove(&key);
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = self.head;
        if let Some(head) = self.head {
            self.nodes[head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_response(status: u16, body: &str, ttl: Option<Duration>) -> CachedResponse {
        CachedResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    #[test]
    fn defaults_non_positive_capacity() {
        assert_eq!(ResponseCache::new(10).max_entries, 10);
        assert_eq!(ResponseCache::new(0).max_entries, 1024);
        assert_eq!(ResponseCache::new(-5).max_entries, 1024);
    }

    #[test]
    fn set_and_get() {
        let cache = ResponseCache::new(10);

        let mut resp = make_response(200, "data1", None);
        resp.headers.insert("x-test", "1".parse().unwrap());
        cache.set("key1", resp);

        let got = cache.get("key1").expect("existing key");
        assert_eq!(got.status, StatusCode::OK);
        assert_eq!(got.body.as_ref(), b"data1");
        assert_eq!(got.headers.get("x-test").unwrap(), "1");

        assert!(cache.get("nonexistent").is_none());

        cache.set("key1", make_response(201, "data2", None));
        let got = cache.get("key1").expect("updated key");
        assert_eq!(got.status, StatusCode::CREATED);
        assert_eq!(got.body.as_ref(), b"data2");

        cache.assert_consistent();
    }

    #[test]
    fn delete_is_noop_for_missing_key() {
        let cache = ResponseCache::new(10);
        cache.set("key1", make_response(200, "data1", None));

        cache.delete("key1");
        assert!(cache.get("key1").is_none());

        cache.delete("does-not-exist");
        cache.assert_consistent();
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ResponseCache::new(3);

        cache.set("key1", make_response(200, "body1", None));
        cache.set("key2", make_response(200, "body2", None));
        cache.set("key3", make_response(200, "body3", None));

        // Touch key1 so key2 becomes the oldest.
        assert!(cache.get("key1").is_some());

        cache.set("key4", make_response(200, "body4", None));

        assert!(cache.get("key2").is_none(), "key2 should have been evicted");
        assert!(cache.get("key1").is_some());
        assert!(cache.get("key3").is_some());
        assert!(cache.get("key4").is_some());
        assert_eq!(cache.len(), 3);

        cache.assert_consistent();
    }

    #[test]
    fn overwrite_moves_entry_to_front() {
        let cache = ResponseCache::new(3);

        cache.set("key1", make_response(200, "A", None));
        cache.set("key2", make_response(200, "B", None));
        cache.set("key3", make_response(200, "C", None));

        cache.set("key1", make_response(201, "A_updated", None));
        cache.set("key4", make_response(200, "D", None));

        assert!(cache.get("key2").is_none(), "key2 should have been evicted");
        assert!(cache.get("key1").is_some());

        cache.assert_consistent();
    }

    #[test]
    fn expired_entry_is_evicted_on_get() {
        let cache = ResponseCache::new(10);

        cache.set("key_expired", make_response(200, "expired", Some(Duration::from_millis(1))));
        cache.set("key_fresh", make_response(200, "fresh", None));

        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("key_expired").is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("key_fresh").is_some());

        cache.assert_consistent();
    }

    #[test]
    fn size_never_exceeds_bound() {
        let cache = ResponseCache::new(4);
        for i in 0..32 {
            cache.set(&format!("key_{i}"), make_response(200, "x", None));
            assert!(cache.len() <= 4);
        }
        cache.assert_consistent();
    }

    #[test]
    fn concurrent_mixed_operations() {
        let cache = Arc::new(ResponseCache::new(100));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..1000 {
                    let key = format!("key_{}", (j % 10) + 1);
                    match j % 5 {
                        0 | 1 => {
                            cache.get(&key);
                        }
                        2 => cache.set(&key, make_response(200, "data", None)),
                        3 => cache.set(&key, make_response(200, "data_ttl", Some(Duration::from_secs(3600)))),
                        _ => cache.delete(&key),
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 100);
        cache.assert_consistent();
    }
}
