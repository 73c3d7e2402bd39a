//! Associative map values
//!
//! Maps keep their entries sorted by the total key order (type rank, then
//! value within a type) so iteration order is deterministic and independent
//! of insertion order. Like lists they are copy-on-write. Collection values
//! cannot be keys.

use super::{key_cmp, ErrCode, Value};
use std::cmp::Ordering;
use std::rc::Rc;

/// A sorted associative map
#[derive(Debug, Clone, Default)]
pub struct Map(Rc<Vec<(Value, Value)>>);

impl Map {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from pairs; later duplicates win
    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> Result<Self, ErrCode> {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert(k, v)?;
        }
        Ok(map)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn find(&self, key: &Value) -> Result<usize, usize> {
        self.0.binary_search_by(|(k, _)| {
            key_cmp(k, key).unwrap_or(Ordering::Less)
        })
    }

    /// Whether a key can index a map at all
    pub fn valid_key(key: &Value) -> bool {
        !matches!(
            key,
            Value::List(_) | Value::Map(_) | Value::Iter(_) | Value::Catch(_) | Value::Finally(_)
        )
    }

    /// Value for a key
    pub fn get(&self, key: &Value) -> Result<Value, ErrCode> {
        if !Self::valid_key(key) {
            return Err(ErrCode::E_TYPE);
        }
        match self.find(key) {
            Ok(i) => Ok(self.0[i].1.clone()),
            Err(_) => Err(ErrCode::E_RANGE),
        }
    }

    /// Whether the map holds a key
    pub fn contains(&self, key: &Value) -> bool {
        Self::valid_key(key) && self.find(key).is_ok()
    }

    /// Insert or replace, copying on write
    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), ErrCode> {
        if !Self::valid_key(&key) {
            return Err(ErrCode::E_TYPE);
        }
        match self.find(&key) {
            Ok(i) => Rc::make_mut(&mut self.0)[i].1 = value,
            Err(i) => Rc::make_mut(&mut self.0).insert(i, (key, value)),
        }
        Ok(())
    }

    /// Remove a key, copying on write; absent keys raise E_RANGE
    pub fn remove(&mut self, key: &Value) -> Result<Value, ErrCode> {
        if !Self::valid_key(key) {
            return Err(ErrCode::E_TYPE);
        }
        match self.find(key) {
            Ok(i) => Ok(Rc::make_mut(&mut self.0).remove(i).1),
            Err(_) => Err(ErrCode::E_RANGE),
        }
    }

    /// Entry at a position, in key order (for iteration)
    pub fn nth(&self, index: usize) -> Option<(&Value, &Value)> {
        self.0.get(index).map(|(k, v)| (k, v))
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> std::slice::Iter<'_, (Value, Value)> {
        self.0.iter()
    }

    /// Number of owners of the backing storage (for ownership tests)
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::{v_int, v_str};

    #[test]
    fn test_insert_get() {
        let mut m = Map::new();
        m.insert(v_str("b"), v_int(2)).unwrap();
        m.insert(v_str("a"), v_int(1)).unwrap();
        assert_eq!(m.get(&v_str("a")).unwrap(), v_int(1));
        assert_eq!(m.get(&v_str("b")).unwrap(), v_int(2));
        assert_eq!(m.get(&v_str("c")), Err(ErrCode::E_RANGE));
    }

    #[test]
    fn test_sorted_iteration_order() {
        let mut m = Map::new();
        m.insert(v_str("zebra"), v_int(1)).unwrap();
        m.insert(v_int(5), v_int(2)).unwrap();
        m.insert(v_str("apple"), v_int(3)).unwrap();
        let keys: Vec<_> = m.iter().map(|(k, _)| k.clone()).collect();
        // Ints rank before strings; strings sort case-insensitively.
        assert_eq!(keys, vec![v_int(5), v_str("apple"), v_str("zebra")]);
    }

    #[test]
    fn test_replace_existing() {
        let mut m = Map::new();
        m.insert(v_int(1), v_int(10)).unwrap();
        m.insert(v_int(1), v_int(20)).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&v_int(1)).unwrap(), v_int(20));
    }

    #[test]
    fn test_copy_on_write() {
        let mut m = Map::new();
        m.insert(v_int(1), v_int(10)).unwrap();
        let shared = m.clone();
        m.insert(v_int(2), v_int(20)).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_collection_keys_rejected() {
        let mut m = Map::new();
        let key = Value::List(crate::var::List::new());
        assert_eq!(m.insert(key.clone(), v_int(1)), Err(ErrCode::E_TYPE));
        assert_eq!(m.get(&key), Err(ErrCode::E_TYPE));
    }

    #[test]
    fn test_remove() {
        let mut m = Map::from_pairs(vec![(v_int(1), v_int(10)), (v_int(2), v_int(20))]).unwrap();
        assert_eq!(m.remove(&v_int(1)).unwrap(), v_int(10));
        assert_eq!(m.len(), 1);
        assert_eq!(m.remove(&v_int(1)), Err(ErrCode::E_RANGE));
    }
}
