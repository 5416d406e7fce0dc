//! In-memory index of bookmark keys.
//!
//! Bookmarks are ordinary entries of the reserved bookmark type whose
//! payload is the key; this index maps the key back to the entry number.
//! It is rebuilt from a full scan at open and kept current by the engine
//! on commit. Keys are not unique by contract: a duplicate insert keeps
//! the latest entry number.

use std::collections::HashMap;

use bytes::Bytes;
use datastream_core::{Error, Result};

#[derive(Debug, Default)]
pub struct BookmarkIndex {
    map: HashMap<Bytes, u64>,
}

impl BookmarkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, returning the entry number it previously pointed at.
    pub fn insert(&mut self, key: Bytes, number: u64) -> Option<u64> {
        self.map.insert(key, number)
    }

    /// Entry number a key points at. Missing keys are `NotFound`.
    pub fn get(&self, key: &[u8]) -> Result<u64> {
        self.map
            .get(key)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("bookmark {:02x?}", key)))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut index = BookmarkIndex::new();
        assert!(index.is_empty());

        index.insert(Bytes::from_static(&[0x00, 0x2a]), 7);
        assert_eq!(index.get(&[0x00, 0x2a]).unwrap(), 7);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let index = BookmarkIndex::new();
        let err = index.get(b"nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_duplicate_keeps_latest() {
        let mut index = BookmarkIndex::new();
        assert_eq!(index.insert(Bytes::from_static(b"k"), 3), None);
        assert_eq!(index.insert(Bytes::from_static(b"k"), 11), Some(3));
        assert_eq!(index.get(b"k").unwrap(), 11);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_keys_compare_by_value() {
        let mut index = BookmarkIndex::new();
        index.insert(Bytes::from(vec![1, 2, 3]), 0);
        // A different allocation with the same bytes finds the entry.
        assert_eq!(index.get(&[1, 2, 3]).unwrap(), 0);
    }

    #[test]
    fn test_empty_key_is_a_valid_key() {
        let mut index = BookmarkIndex::new();
        index.insert(Bytes::new(), 5);
        assert_eq!(index.get(&[]).unwrap(), 5);
    }
}
