//! Newtype indexes and an interning map keyed by them
use std::collections::HashMap;

/// Interning map from items to dense, strongly-typed indexes
///
/// Items are stored in insertion order, so an index is simply a position in
/// `items`; `lookup` finds the index of an item that is already present.
#[derive(Debug)]
pub struct IndexMap<T, I> {
    items: Vec<T>,
    lookup: HashMap<T, I>,
}

impl<T, I> Default for IndexMap<T, I> {
    fn default() -> Self {
        Self {
            items: vec![],
            lookup: HashMap::new(),
        }
    }
}

impl<T, I> IndexMap<T, I>
where
    T: Eq + std::hash::Hash + Copy,
    I: Copy + From<usize>,
{
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get_by_value(&self, t: &T) -> Option<I> {
        self.lookup.get(t).copied()
    }

    /// Returns the index of `t`, appending it if it's new
    pub fn insert(&mut self, t: T) -> I {
        if let Some(i) = self.lookup.get(&t) {
            return *i;
        }
        let i = I::from(self.items.len());
        self.items.push(t);
        self.lookup.insert(t, i);
        i
    }
}

impl<T, I> std::ops::Index<I> for IndexMap<T, I>
where
    usize: From<I>,
{
    type Output = T;
    fn index(&self, i: I) -> &T {
        &self.items[usize::from(i)]
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(usize);
        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                Self(v)
            }
        }
        impl From<$name> for usize {
            fn from(v: $name) -> Self {
                v.0
            }
        }
        impl $name {
            /// Returns the raw index
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}
pub(crate) use define_index;
