//! Ordered list values
//!
//! Lists are persistent: cloning shares the backing vector, and structural
//! mutation copies first when the backing is shared. All public indices here
//! are 1-based and inclusive, matching the language.

use super::{ErrCode, Value};
use std::rc::Rc;

/// An ordered sequence of values
#[derive(Debug, Clone, Default)]
pub struct List(Rc<Vec<Value>>);

impl List {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list from a vector
    pub fn from_vec(items: Vec<Value>) -> Self {
        List(Rc::new(items))
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list has no elements
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Element at a 1-based index
    pub fn index(&self, index: i64) -> Result<Value, ErrCode> {
        if index < 1 || index as usize > self.0.len() {
            return Err(ErrCode::E_RANGE);
        }
        Ok(self.0[index as usize - 1].clone())
    }

    /// Replace the element at a 1-based index, copying on write
    pub fn index_set(&mut self, index: i64, value: Value) -> Result<(), ErrCode> {
        if index < 1 || index as usize > self.0.len() {
            return Err(ErrCode::E_RANGE);
        }
        Rc::make_mut(&mut self.0)[index as usize - 1] = value;
        Ok(())
    }

    /// Sublist over a 1-based inclusive range; an empty range (`to < from`)
    /// yields the empty list
    pub fn range(&self, from: i64, to: i64) -> Result<List, ErrCode> {
        if to < from {
            return Ok(List::new());
        }
        if from < 1 || to as usize > self.0.len() {
            return Err(ErrCode::E_RANGE);
        }
        Ok(List::from_vec(
            self.0[from as usize - 1..to as usize].to_vec(),
        ))
    }

    /// Splice `value` (a list) over the 1-based inclusive range, copying on
    /// write; `to == from - 1` inserts without removal
    pub fn range_set(&mut self, from: i64, to: i64, value: &List) -> Result<(), ErrCode> {
        let len = self.0.len() as i64;
        if from < 1 || from > len + 1 || to < from - 1 || to > len {
            return Err(ErrCode::E_RANGE);
        }
        let items = Rc::make_mut(&mut self.0);
        items.splice(
            from as usize - 1..to as usize,
            value.0.iter().cloned(),
        );
        Ok(())
    }

    /// Append one element, copying on write
    pub fn push(&mut self, value: Value) {
        Rc::make_mut(&mut self.0).push(value);
    }

    /// Concatenate another list onto the end, copying on write
    pub fn append(&mut self, other: &List) {
        Rc::make_mut(&mut self.0).extend(other.0.iter().cloned());
    }

    /// 1-based index of the first element equal to `value`, or 0
    pub fn index_of(&self, value: &Value) -> i64 {
        self.0
            .iter()
            .position(|v| v == value)
            .map(|i| i as i64 + 1)
            .unwrap_or(0)
    }

    /// Iterate over the elements
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Borrow the elements as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    /// Number of owners of the backing storage (for ownership tests)
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl FromIterator<Value> for List {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        List::from_vec(iter.into_iter().collect())
    }
}
