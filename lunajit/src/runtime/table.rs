use crate::value::Value;
use std::collections::HashMap;

/// Associative array from values to values
///
/// Storing `nil` removes a key.  Number keys are normalized so that `0` and
/// `-0` address the same slot.
#[derive(Debug, Default)]
pub struct Table {
    map: HashMap<Value, Value>,
}

fn normalize(k: Value) -> Result<Value, &'static str> {
    match k.as_number() {
        Some(f) if f.is_nan() => Err("table index is NaN"),
        Some(f) if f == 0.0 => Ok(Value::number(0.0)),
        _ if k.is_nil() => Err("table index is nil"),
        _ => Ok(k),
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, k: Value) -> Value {
        match normalize(k) {
            Ok(k) => self.map.get(&k).copied().unwrap_or(Value::NIL),
            Err(_) => Value::NIL,
        }
    }

    pub fn set(&mut self, k: Value, v: Value) -> Result<(), &'static str> {
        let k = normalize(k)?;
        if v.is_nil() {
            self.map.remove(&k);
        } else {
            self.map.insert(k, v);
        }
        Ok(())
    }

    /// Returns a border: `n` such that `t[n]` is non-nil and `t[n + 1]` is nil
    /// (or zero if `t[1]` is nil)
    pub fn border(&self) -> usize {
        let mut n = 0;
        while !self.get(Value::number((n + 1) as f64)).is_nil() {
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_remove() {
        let mut t = Table::new();
        let k = Value::number(1.0);
        t.set(k, Value::TRUE).unwrap();
        assert_eq!(t.get(k), Value::TRUE);
        t.set(k, Value::NIL).unwrap();
        assert!(t.get(k).is_nil());
        assert!(t.is_empty());
    }

    #[test]
    fn bad_keys() {
        let mut t = Table::new();
        assert!(t.set(Value::NIL, Value::TRUE).is_err());
        assert!(t.set(Value::number(f64::NAN), Value::TRUE).is_err());
        t.set(Value::number(-0.0), Value::TRUE).unwrap();
        assert_eq!(t.get(Value::number(0.0)), Value::TRUE);
    }

    #[test]
    fn border() {
        let mut t = Table::new();
        assert_eq!(t.border(), 0);
        for i in 1..=3 {
            t.set(Value::number(i as f64), Value::TRUE).unwrap();
        }
        t.set(Value::number(5.0), Value::TRUE).unwrap();
        assert_eq!(t.border(), 3);
    }
}
