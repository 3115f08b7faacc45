//! Arena-style table of reference-counted entries.
//!
//! Entries are created only through [`CountedMap::insert_new`] and destroyed
//! only when [`CountedMap::release`] drops their count to zero. Lookups never
//! create entries, so a miss on an unknown key can never leave a
//! default-constructed entry with a bogus count behind.

use std::collections::BTreeMap;
use thiserror::Error;

/// Error type for CountedMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CountedMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already present")]
    AlreadyPresent,

    #[error("Reference count underflow")]
    RefCountUnderflow,
}

/// Trait for values that carry their own reference count.
pub trait HasRefCount {
    /// Increments the count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the count and returns the new value.
    ///
    /// Returns `None` if the count is already zero.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// Outcome of dropping one reference.
#[derive(Debug, PartialEq)]
pub enum Release<V> {
    /// Other holders remain; carries the new count.
    Remaining(u32),
    /// Last reference dropped; the entry was removed and is handed back.
    Removed(V),
}

/// Ordered table keyed by id whose entries live exactly as long as their
/// reference count is non-zero.
#[derive(Debug, Clone)]
pub struct CountedMap<K, V> {
    inner: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for CountedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }
}

impl<K, V> CountedMap<K, V>
where
    K: Ord + Clone,
    V: HasRefCount,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Never creates entries.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Never creates entries.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts a fresh entry. The value must already hold its first reference.
    pub fn insert_new(&mut self, key: K, value: V) -> Result<&mut V, CountedMapError> {
        if value.ref_count() == 0 {
            log::warn!("CountedMap: refusing entry with zero references");
            return Err(CountedMapError::RefCountUnderflow);
        }
        match self.inner.entry(key) {
            std::collections::btree_map::Entry::Occupied(_) => Err(CountedMapError::AlreadyPresent),
            std::collections::btree_map::Entry::Vacant(slot) => Ok(slot.insert(value)),
        }
    }

    /// Takes another reference on an existing entry.
    pub fn acquire(&mut self, key: &K) -> Result<u32, CountedMapError> {
        self.inner
            .get_mut(key)
            .map(HasRefCount::increment_ref)
            .ok_or(CountedMapError::KeyNotFound)
    }

    /// Drops one reference, removing the entry when it was the last.
    pub fn release(&mut self, key: &K) -> Result<Release<V>, CountedMapError> {
        let entry = self.inner.get_mut(key).ok_or(CountedMapError::KeyNotFound)?;
        match entry.decrement_ref() {
            None => Err(CountedMapError::RefCountUnderflow),
            Some(0) => match self.inner.remove(key) {
                Some(value) => Ok(Release::Removed(value)),
                None => Err(CountedMapError::KeyNotFound),
            },
            Some(n) => Ok(Release::Remaining(n)),
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(HasRefCount::ref_count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }
}
