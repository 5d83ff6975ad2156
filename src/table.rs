//! The Lua table: a hybrid of a dense array part and a hash part, plus an
//! insertion-order key log so `pairs`/`next` traverse deterministically.
//!
//! Integer keys >= 1 live in the array part while they stay dense; everything
//! else goes to the hash part. Assigning `nil` removes a key.

use std::collections::HashMap;

use crate::error::{LuaError, LuaResult};
use crate::value::{HashableValue, TableHandle, Value};

/// A Lua table.
pub struct Table {
    /// Dense 1-based array part.
    array: Vec<Value>,

    /// Hash part for every other key.
    hash: HashMap<HashableValue, Value>,

    /// Insertion order of hash-part keys, maintained under removal.
    key_order: Vec<HashableValue>,

    /// Optional metatable.
    metatable: Option<TableHandle>,
}

impl Table {
    /// Create a new empty table.
    pub fn new() -> Table {
        Table {
            array: Vec::new(),
            hash: HashMap::new(),
            key_order: Vec::new(),
            metatable: None,
        }
    }

    /// Create a table with pre-reserved capacity (`NEWTABLE` size hints).
    pub fn with_capacity(narray: usize, nhash: usize) -> Table {
        Table {
            array: Vec::with_capacity(narray),
            hash: HashMap::with_capacity(nhash),
            key_order: Vec::with_capacity(nhash),
            metatable: None,
        }
    }

    /// The metatable, if any.
    pub fn metatable(&self) -> Option<TableHandle> {
        self.metatable.clone()
    }

    /// Replace the metatable.
    pub fn set_metatable(&mut self, metatable: Option<TableHandle>) {
        self.metatable = metatable;
    }

    /// If `key` is an integer >= 1, its 1-based array index.
    fn array_index(key: &Value) -> Option<usize> {
        if let Value::Number(n) = key {
            if n.fract() == 0.0 && *n >= 1.0 && *n <= usize::MAX as f64 {
                return Some(*n as usize);
            }
        }
        None
    }

    /// Raw read, bypassing metamethods. Absent keys read as nil.
    pub fn raw_get(&self, key: &Value) -> Value {
        if let Some(idx) = Self::array_index(key) {
            if idx <= self.array.len() {
                return self.array[idx - 1].clone();
            }
        }
        match HashableValue::from_value(key) {
            Ok(hashable) => self.hash.get(&hashable).cloned().unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        }
    }

    /// Raw write, bypassing metamethods. Writing nil removes the key; nil
    /// and NaN keys are rejected.
    pub fn raw_set(&mut self, key: Value, value: Value) -> LuaResult<()> {
        if let Some(idx) = Self::array_index(&key) {
            if idx <= self.array.len() {
                self.array[idx - 1] = value;
                return Ok(());
            }
            if idx == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                self.migrate_from_hash();
                return Ok(());
            }
        }
        let hashable = HashableValue::from_value(&key)?;
        if value.is_nil() {
            if self.hash.remove(&hashable).is_some() {
                self.key_order.retain(|k| *k != hashable);
            }
        } else if self.hash.insert(hashable.clone(), value).is_none() {
            self.key_order.push(hashable);
        }
        Ok(())
    }

    /// Raw write at an integer index, extending the array part as needed
    /// (`SETLIST` bulk stores).
    pub fn raw_seti(&mut self, index: usize, value: Value) -> LuaResult<()> {
        if index == 0 {
            return Err(LuaError::Runtime("table index out of range".to_string()));
        }
        if index > self.array.len() && index <= self.array.len() + 1 {
            self.array.push(value);
            return Ok(());
        }
        if index <= self.array.len() {
            self.array[index - 1] = value;
            return Ok(());
        }
        self.raw_set(Value::Number(index as f64), value)
    }

    /// After an append, pull any now-contiguous integer keys out of the hash
    /// part so the border keeps moving.
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = HashableValue::from_value(&Value::Number((self.array.len() + 1) as f64));
            let next_key = match next_key {
                Ok(k) => k,
                Err(_) => return,
            };
            match self.hash.remove(&next_key) {
                Some(value) => {
                    self.key_order.retain(|k| *k != next_key);
                    self.array.push(value);
                }
                None => return,
            }
        }
    }

    /// The `#` border: an `n` with `t[n] ~= nil` and `t[n+1] == nil`,
    /// found by binary search over the array part.
    pub fn len(&self) -> usize {
        if self.array.is_empty() {
            return 0;
        }
        if self.array.last().map_or(true, |v| !v.is_nil()) {
            return self.array.len();
        }
        let mut low = 0;
        let mut high = self.array.len();
        while low < high {
            let mid = high - (high - low) / 2;
            if self.array[mid - 1].is_nil() {
                high = mid - 1;
            } else {
                low = mid;
            }
        }
        low
    }

    /// Whether the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty() && self.array.iter().all(|v| v.is_nil())
    }

    /// Traversal step for `next`: nil starts at the front, each key yields
    /// its successor, the last key yields `None`. Array entries come first
    /// (in index order), then hash entries in insertion order. A key that is
    /// not in the table is an error.
    pub fn next(&self, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        let start = match key {
            Value::Nil => TraversalPos::ArrayFrom(1),
            _ => self.position_after(key)?,
        };
        match start {
            TraversalPos::ArrayFrom(from) => {
                for idx in from..=self.array.len() {
                    if !self.array[idx - 1].is_nil() {
                        return Ok(Some((
                            Value::Number(idx as f64),
                            self.array[idx - 1].clone(),
                        )));
                    }
                }
                Ok(self.hash_entry(0))
            }
            TraversalPos::HashFrom(from) => Ok(self.hash_entry(from)),
        }
    }

    fn hash_entry(&self, order_index: usize) -> Option<(Value, Value)> {
        let key = self.key_order.get(order_index)?;
        let value = self.hash.get(key)?;
        Some((key.to_value(), value.clone()))
    }

    /// Locate the traversal position right after `key`.
    fn position_after(&self, key: &Value) -> LuaResult<TraversalPos> {
        if let Some(idx) = Self::array_index(key) {
            if idx <= self.array.len() {
                return Ok(TraversalPos::ArrayFrom(idx + 1));
            }
        }
        let hashable = HashableValue::from_value(key)
            .map_err(|_| LuaError::Runtime("invalid key to 'next'".to_string()))?;
        match self.key_order.iter().position(|k| *k == hashable) {
            Some(pos) => Ok(TraversalPos::HashFrom(pos + 1)),
            None => Err(LuaError::Runtime("invalid key to 'next'".to_string())),
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("array_len", &self.array.len())
            .field("hash_len", &self.hash.len())
            .field("has_metatable", &self.metatable.is_some())
            .finish()
    }
}

enum TraversalPos {
    ArrayFrom(usize),
    HashFrom(usize),
}
