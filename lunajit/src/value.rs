//! Dynamically-typed values, NaN-boxed into 64 bits
//!
//! Any bit pattern whose top 16 bits are below `0xfff9` is an IEEE-754 double.
//! The remaining patterns are tagged values with a 48-bit payload:
//!
//! | Tag      | Meaning                                  |
//! |----------|------------------------------------------|
//! | `0xfff9` | primitive: `nil` (0), `false` (1), `true` (2) |
//! | `0xfffb` | interned string                          |
//! | `0xfffc` | table                                    |
//! | `0xfffd` | compiled native function                 |
//! | `0xfffe` | builtin function                         |
//!
//! `nil` and `false` differ only in their lowest bit, so generated code can
//! test truthiness with a single shift and compare.  The hardware's default
//! NaN (`0xfff8...`) sits just below the tag range and remains a number.

/// Number of payload bits below the tag
pub(crate) const TAG_SHIFT: u32 = 48;

pub(crate) const TAG_PRIMITIVE: u64 = 0xfff9;
pub(crate) const TAG_STRING: u64 = 0xfffb;
pub(crate) const TAG_TABLE: u64 = 0xfffc;
pub(crate) const TAG_FUNCTION: u64 = 0xfffd;
pub(crate) const TAG_BUILTIN: u64 = 0xfffe;

const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;
const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// A single dynamically-typed value
///
/// Pointer-carrying values (strings, tables, functions) are only meaningful
/// while the [`State`](crate::State) that produced them is alive.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

static_assertions::const_assert_eq!(std::mem::size_of::<Value>(), 8);

/// Coarse type of a [`Value`], as reported by the `type` builtin
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
}

impl Value {
    pub const NIL: Self = Self(TAG_PRIMITIVE << TAG_SHIFT);
    pub const FALSE: Self = Self((TAG_PRIMITIVE << TAG_SHIFT) | 1);
    pub const TRUE: Self = Self((TAG_PRIMITIVE << TAG_SHIFT) | 2);

    /// Boxes a double, canonicalizing NaNs that would collide with a tag
    pub fn number(v: f64) -> Self {
        let bits = v.to_bits();
        if bits >> TAG_SHIFT >= TAG_PRIMITIVE {
            Self(CANONICAL_NAN)
        } else {
            Self(bits)
        }
    }

    pub fn bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// Reinterprets raw bits (e.g. a value returned from generated code)
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub(crate) fn tag(self) -> u64 {
        self.0 >> TAG_SHIFT
    }

    pub(crate) fn from_ptr<T>(tag: u64, ptr: *const T) -> Self {
        let addr = ptr as u64;
        debug_assert_eq!(addr & !PAYLOAD_MASK, 0, "pointer exceeds 48 bits");
        Self((tag << TAG_SHIFT) | (addr & PAYLOAD_MASK))
    }

    /// Returns the payload as a pointer, if the tag matches
    pub(crate) fn as_ptr<T>(self, tag: u64) -> Option<*mut T> {
        (self.tag() == tag).then_some((self.0 & PAYLOAD_MASK) as *mut T)
    }

    pub fn as_number(self) -> Option<f64> {
        (self.tag() < TAG_PRIMITIVE).then(|| f64::from_bits(self.0))
    }

    pub fn is_number(self) -> bool {
        self.tag() < TAG_PRIMITIVE
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Everything except `nil` and `false` is truthy
    pub fn is_truthy(self) -> bool {
        self.0 >> 1 != Self::NIL.0 >> 1
    }

    pub fn kind(self) -> Kind {
        match self.tag() {
            t if t < TAG_PRIMITIVE => Kind::Number,
            TAG_PRIMITIVE if self == Self::NIL => Kind::Nil,
            TAG_PRIMITIVE => Kind::Boolean,
            TAG_STRING => Kind::String,
            TAG_TABLE => Kind::Table,
            _ => Kind::Function,
        }
    }

    pub fn type_name(self) -> &'static str {
        self.kind().into()
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::number(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::bool(b)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Kind::Number => write!(f, "{}", f64::from_bits(self.0)),
            Kind::Nil => write!(f, "nil"),
            Kind::Boolean => write!(f, "{}", *self == Self::TRUE),
            k => write!(f, "{k:?}({:#x})", self.0 & PAYLOAD_MASK),
        }
    }
}

/// Formats a number the way `print` and `..` do
///
/// Integral values print without a fractional part.
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        "nan".to_owned()
    } else if v.is_infinite() {
        if v > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::NIL.is_truthy());
        assert!(!Value::FALSE.is_truthy());
        assert!(Value::TRUE.is_truthy());
        assert!(Value::number(0.0).is_truthy());
        assert!(Value::number(f64::NAN).is_truthy());
    }

    #[test]
    fn nan_canonicalization() {
        let weird = f64::from_bits(0xffff_0000_0000_1234);
        assert!(weird.is_nan());
        let v = Value::number(weird);
        assert_eq!(v.kind(), Kind::Number);
        assert!(v.as_number().unwrap().is_nan());

        // The x86 default NaN stays a number without rewriting
        let indefinite = f64::from_bits(0xfff8_0000_0000_0000);
        assert_eq!(Value::number(indefinite).to_bits(), indefinite.to_bits());
    }

    #[test]
    fn kinds() {
        assert_eq!(Value::NIL.kind(), Kind::Nil);
        assert_eq!(Value::TRUE.kind(), Kind::Boolean);
        assert_eq!(Value::number(-2.5).kind(), Kind::Number);
        assert_eq!(Value::NIL.type_name(), "nil");
        assert_eq!(Value::FALSE.type_name(), "boolean");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }
}
