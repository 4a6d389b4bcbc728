use std::collections::HashMap;
use std::hash::Hash;

/// A doubly linked set of keys with O(1) push, remove and membership test.
///
/// Links are stored on a map keyed by the element itself, so there is no
/// back pointer between the list and the cached entry it refers to.
#[derive(Debug)]
pub struct UnpinnedList<K> {
    links: HashMap<K, Link<K>>,
    head: Option<K>,
    tail: Option<K>,
}

#[derive(Debug)]
struct Link<K> {
    prev: Option<K>,
    next: Option<K>,
}

impl<K> UnpinnedList<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            links: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    /// Append a key at the end of the list.
    ///
    /// Panics if the key is already on the list.
    pub fn push_tail(&mut self, key: K) {
        assert!(!self.contains(&key), "key is already on unpinned list");

        self.links.insert(
            key,
            Link {
                prev: self.tail,
                next: None,
            },
        );
        match self.tail {
            Some(tail) => self.link_mut(&tail).next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    /// Remove a key from the list, return false if it was not there.
    pub fn remove(&mut self, key: &K) -> bool {
        let link = match self.links.remove(key) {
            Some(link) => link,
            None => return false,
        };

        match link.prev {
            Some(prev) => self.link_mut(&prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(&next).prev = link.prev,
            None => self.tail = link.prev,
        }
        true
    }

    /// Return the first key of the list.
    pub fn front(&self) -> Option<K> {
        self.head
    }

    pub fn contains(&self, key: &K) -> bool {
        self.links.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Iterate over the keys from head to tail.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn link_mut(&mut self, key: &K) -> &mut Link<K> {
        self.links
            .get_mut(key)
            .expect("unpinned list links corrupted")
    }
}

pub struct Iter<'a, K> {
    list: &'a UnpinnedList<K>,
    cursor: Option<K>,
}

impl<'a, K> Iterator for Iter<'a, K>
where
    K: Copy + Eq + Hash,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let key = self.cursor?;
        self.cursor = self.list.links.get(&key).and_then(|link| link.next);
        Some(key)
    }
}
