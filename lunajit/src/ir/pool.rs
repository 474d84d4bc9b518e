use crate::{
    indexed::{IndexMap, define_index},
    value::Value,
};

define_index!(ConstIndex, "An index in a [`ConstantPool`]");

/// Upper bound on distinct constants in a single compile unit
pub const MAX_CONSTANTS: usize = 1 << 24;

/// Deduplicated storage for literal values used by one compile unit
///
/// Equality is bitwise on the boxed value; strings are interned by the
/// runtime before they get here, so equal strings share a representation.
#[derive(Debug, Default)]
pub struct ConstantPool(IndexMap<Value, ConstIndex>);

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `v`, appending it if it's not already present
    ///
    /// # Panics
    /// If the pool already holds [`MAX_CONSTANTS`] entries
    pub fn intern(&mut self, v: Value) -> ConstIndex {
        if let Some(i) = self.0.get_by_value(&v) {
            return i;
        }
        assert!(self.0.len() < MAX_CONSTANTS, "constant pool exhausted");
        self.0.insert(v)
    }

    pub fn get(&self, i: ConstIndex) -> Value {
        self.0[i]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dedup() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(Value::number(1.0));
        let b = pool.intern(Value::number(2.0));
        let c = pool.intern(Value::number(1.0));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(b), Value::number(2.0));
    }

    #[test]
    fn signed_zero_is_distinct() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(Value::number(0.0));
        let b = pool.intern(Value::number(-0.0));
        assert_ne!(a, b);
        assert_eq!(pool.intern(Value::NIL), pool.intern(Value::NIL));
    }
}
