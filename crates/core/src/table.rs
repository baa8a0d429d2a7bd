//! Open-addressed hash table keyed by Value
//!
//! Linear probing with tombstones. A vacant slot holds (Empty, Nil); a
//! tombstone holds (Empty, true). The Empty value variant is reserved for
//! exactly this purpose and never appears as a live key.
//!
//! The table stores copyable Value records only; the collector traces
//! reachable tables by walking their live entries.

use crate::object::{GcRef, Obj, ObjString};
use crate::value::Value;

const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub key: Value,
    pub value: Value,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: Value::Empty,
            value: Value::Nil,
        }
    }

    fn is_unused(&self) -> bool {
        self.key.is_empty_sentinel()
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_empty_sentinel() && !self.value.is_nil()
    }
}

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives the load-factor check.
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    /// Number of live key/value pairs.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_unused()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[self.find_slot(key)];
        if entry.is_unused() {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Insert or update. Returns true when the key was not present before.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        self.ensure_capacity();
        let slot = self.find_slot(&key);
        let entry = &mut self.entries[slot];
        let is_new = entry.is_unused();
        // A reused tombstone was already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key, value };
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns false when absent.
    pub fn delete(&mut self, key: &Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key);
        let entry = &mut self.entries[slot];
        if entry.is_unused() {
            return false;
        }
        *entry = Entry {
            key: Value::Empty,
            value: Value::Bool(true),
        };
        true
    }

    /// Copy every live entry into `target`.
    pub fn copy_to(&self, target: &mut Table) {
        for entry in &self.entries {
            if !entry.is_unused() {
                target.set(entry.key, entry.value);
            }
        }
    }

    /// Iterate live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_unused())
            .map(|e| (e.key, e.value))
    }

    /// Interning support: find an existing string key by bytes and hash
    /// without allocating a probe object.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<GcRef<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.is_unused() {
                if entry.value.is_nil() {
                    return None;
                }
                // Tombstone: keep probing.
            } else if let Value::Obj(Obj::String(s)) = entry.key
                && s.hash == hash
                && s.chars == chars
            {
                return Some(s);
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drop every entry whose string key is unmarked. Used to prune the
    /// intern table between mark and sweep so interning never keeps a
    /// string alive.
    pub fn remove_unmarked_strings(&mut self) {
        for entry in &mut self.entries {
            if let Value::Obj(obj @ Obj::String(_)) = entry.key
                && !obj.header().marked
            {
                *entry = Entry {
                    key: Value::Empty,
                    value: Value::Bool(true),
                };
            }
        }
    }

    fn find_slot(&self, key: &Value) -> usize {
        let capacity = self.entries.len();
        let mut index = key.hash() as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            if entry.is_unused() {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key.strict_eq(key) {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn ensure_capacity(&mut self) {
        let capacity = self.entries.len();
        if (self.count + 1) * LOAD_FACTOR_DEN <= capacity * LOAD_FACTOR_NUM {
            return;
        }
        let new_capacity = if capacity < 8 { 8 } else { capacity * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Entry::vacant(); new_capacity]);
        self.count = 0;
        for entry in old {
            if !entry.is_unused() {
                let slot = self.find_slot(&entry.key);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(Value::Number(1.0), Value::Bool(true)));
        assert!(table.set(Value::Number(2.0), Value::Bool(false)));
        assert_eq!(table.get(&Value::Number(1.0)), Some(Value::Bool(true)));
        assert_eq!(table.get(&Value::Number(2.0)), Some(Value::Bool(false)));
        assert_eq!(table.get(&Value::Number(3.0)), None);
    }

    #[test]
    fn test_set_overwrites() {
        let mut table = Table::new();
        assert!(table.set(Value::Number(1.0), Value::Number(10.0)));
        assert!(!table.set(Value::Number(1.0), Value::Number(20.0)));
        assert_eq!(table.get(&Value::Number(1.0)), Some(Value::Number(20.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_tombstone_probing_intact() {
        let mut table = Table::new();
        for i in 0..32 {
            table.set(Value::Number(i as f64), Value::Number(i as f64));
        }
        assert!(table.delete(&Value::Number(7.0)));
        assert!(!table.delete(&Value::Number(7.0)));
        assert_eq!(table.get(&Value::Number(7.0)), None);
        // Everything else is still reachable through the tombstone.
        for i in 0..32 {
            if i != 7 {
                assert!(table.get(&Value::Number(i as f64)).is_some(), "lost {}", i);
            }
        }
        assert_eq!(table.len(), 31);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..500 {
            table.set(Value::Number(i as f64), Value::Number((i * 2) as f64));
        }
        assert_eq!(table.len(), 500);
        for i in 0..500 {
            assert_eq!(
                table.get(&Value::Number(i as f64)),
                Some(Value::Number((i * 2) as f64))
            );
        }
    }

    #[test]
    fn test_nil_and_bool_keys() {
        let mut table = Table::new();
        table.set(Value::Nil, Value::Number(1.0));
        table.set(Value::Bool(true), Value::Number(2.0));
        table.set(Value::Bool(false), Value::Number(3.0));
        assert_eq!(table.get(&Value::Nil), Some(Value::Number(1.0)));
        assert_eq!(table.get(&Value::Bool(true)), Some(Value::Number(2.0)));
        assert_eq!(table.get(&Value::Bool(false)), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_tombstone_reuse_does_not_grow_count() {
        let mut table = Table::new();
        table.set(Value::Number(1.0), Value::Nil);
        table.delete(&Value::Number(1.0));
        table.set(Value::Number(1.0), Value::Number(9.0));
        assert_eq!(table.get(&Value::Number(1.0)), Some(Value::Number(9.0)));
        assert_eq!(table.len(), 1);
    }
}
