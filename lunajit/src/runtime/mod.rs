//! Runtime state shared between the host and generated code
//!
//! A [`State`] owns every heap object (strings, tables, compiled functions,
//! builtins) for its whole lifetime; values only carry raw pointers into it.
//! Generated code receives a `*mut State` and calls back into the
//! `extern "sysv64"` helpers in [`helpers`] for anything dynamic.
use crate::{
    Error,
    ir::{ArithOp, CmpOp, UnaryOp},
    value::{
        Kind, TAG_BUILTIN, TAG_FUNCTION, TAG_STRING, TAG_TABLE, Value,
        format_number,
    },
};
use std::collections::{HashMap, HashSet};

mod builtins;
pub(crate) mod helpers;
mod table;

pub use table::Table;

/// Maximum nesting of calls through the runtime before raising an error
pub const MAX_CALL_DEPTH: usize = 200;

/// Calling convention for compiled routines: state pointer in the first
/// argument register, argument array in the second, boxed result returned
pub(crate) type NativeEntry =
    unsafe extern "sysv64" fn(*mut State, *const u64) -> u64;

/// Host function callable from scripts
pub type BuiltinFn = fn(&mut State, &[Value]) -> Result<Value, String>;

/// A compiled routine and the memory that holds it
pub(crate) struct NativeFunction {
    pub entry: NativeEntry,
    pub params: u8,
    #[cfg(feature = "jit")]
    pub _code: crate::jit::Mmap,
}

struct Builtin {
    name: &'static str,
    f: BuiltinFn,
}

struct StrObj {
    text: Box<str>,
}

/// Runtime state: heap objects, globals, and pending errors
pub struct State {
    strings: HashMap<Box<str>, *mut StrObj>,
    tables: Vec<*mut Table>,
    functions: Vec<*mut NativeFunction>,
    builtins: Vec<*mut Builtin>,

    /// Bit patterns of every heap value owned by this state
    objects: HashSet<u64>,

    globals: Table,

    /// Lines written by `print`
    output: Vec<String>,
    /// Also write `print` output to stdout
    echo: bool,

    /// First error raised since the last call from the host
    error: Option<String>,
    depth: usize,
}

static_assertions::assert_not_impl_any!(State: Send, Sync);

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Builds a new state with the standard builtins registered
    pub fn new() -> Self {
        let mut out = Self {
            strings: HashMap::new(),
            tables: vec![],
            functions: vec![],
            builtins: vec![],
            objects: HashSet::new(),
            globals: Table::new(),
            output: vec![],
            echo: false,
            error: None,
            depth: 0,
        };
        builtins::register_all(&mut out);
        out
    }

    /// Controls whether `print` also writes to stdout
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    /// Returns (and clears) every line printed so far
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn print_line(&mut self, line: String) {
        if self.echo {
            println!("{line}");
        }
        self.output.push(line);
    }

    /// Returns the unique string value for `s`
    pub fn intern(&mut self, s: &str) -> Value {
        if let Some(p) = self.strings.get(s) {
            return Value::from_ptr(TAG_STRING, *p);
        }
        let p = Box::into_raw(Box::new(StrObj { text: s.into() }));
        self.strings.insert(s.into(), p);
        let v = Value::from_ptr(TAG_STRING, p);
        self.objects.insert(v.to_bits());
        v
    }

    /// Checks that `v` is a primitive or a heap value owned by this state
    pub fn owns(&self, v: Value) -> bool {
        match v.kind() {
            Kind::Nil | Kind::Boolean | Kind::Number => true,
            _ => self.objects.contains(&v.to_bits()),
        }
    }

    /// Returns the text of a string value
    pub fn str(&self, v: Value) -> Option<&str> {
        if !self.owns(v) {
            return None;
        }
        self.str_unchecked(v)
    }

    fn str_unchecked(&self, v: Value) -> Option<&str> {
        // SAFETY: string pointers are only produced by `intern`, and stay
        // valid until the state is dropped
        v.as_ptr::<StrObj>(TAG_STRING)
            .map(|p| unsafe { &*(*p).text })
    }

    pub fn new_table(&mut self) -> Value {
        let p = Box::into_raw(Box::new(Table::new()));
        self.tables.push(p);
        let v = Value::from_ptr(TAG_TABLE, p);
        self.objects.insert(v.to_bits());
        v
    }

    /// Borrows a table value
    pub fn table(&self, v: Value) -> Option<&Table> {
        if !self.owns(v) {
            return None;
        }
        // SAFETY: validated above; tables live as long as the state
        v.as_ptr::<Table>(TAG_TABLE).map(|p| unsafe { &*p })
    }

    pub fn get_global(&self, name: &str) -> Value {
        match self.strings.get(name) {
            Some(p) => self.globals.get(Value::from_ptr(TAG_STRING, *p)),
            None => Value::NIL,
        }
    }

    pub fn set_global(&mut self, name: &str, v: Value) {
        let k = self.intern(name);
        // string keys are always valid
        let _ = self.globals.set(k, v);
    }

    /// Registers a host function as a global
    pub fn register(&mut self, name: &'static str, f: BuiltinFn) {
        let p = Box::into_raw(Box::new(Builtin { name, f }));
        self.builtins.push(p);
        let v = Value::from_ptr(TAG_BUILTIN, p);
        self.objects.insert(v.to_bits());
        self.set_global(name, v);
    }

    pub(crate) fn add_function(&mut self, f: NativeFunction) -> Value {
        let p = Box::into_raw(Box::new(f));
        self.functions.push(p);
        let v = Value::from_ptr(TAG_FUNCTION, p);
        self.objects.insert(v.to_bits());
        v
    }

    /// Converts a value to its printed form
    pub fn tostring(&self, v: Value) -> String {
        match v.kind() {
            Kind::Nil => "nil".to_owned(),
            Kind::Boolean => (v == Value::TRUE).to_string(),
            Kind::Number => format_number(v.as_number().unwrap_or(f64::NAN)),
            Kind::String => self.str(v).unwrap_or("?").to_owned(),
            Kind::Table => format!("table: {:#x}", v.to_bits() & 0xffff_ffff_ffff),
            Kind::Function => match v.as_ptr::<Builtin>(TAG_BUILTIN) {
                // SAFETY: builtin pointers live as long as the state
                Some(b) if self.owns(v) => {
                    format!("builtin: {}", unsafe { (*b).name })
                }
                _ => {
                    format!("function: {:#x}", v.to_bits() & 0xffff_ffff_ffff)
                }
            },
        }
    }

    /// Records a runtime error, keeping the first one
    pub(crate) fn raise(&mut self, msg: String) {
        if self.error.is_none() {
            log::debug!("runtime error: {msg}");
            self.error = Some(msg);
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.is_some()
    }

    fn to_number(&self, v: Value) -> Option<f64> {
        v.as_number().or_else(|| {
            self.str_unchecked(v).and_then(|s| s.trim().parse().ok())
        })
    }

    fn table_ptr(&self, t: Value, what: &str) -> Result<*mut Table, String> {
        t.as_ptr::<Table>(TAG_TABLE).ok_or_else(|| {
            format!("attempt to {what} a {} value", t.type_name())
        })
    }

    pub(crate) fn get_field(&mut self, t: Value, k: Value) -> Result<Value, String> {
        let p = self.table_ptr(t, "index")?;
        // SAFETY: tables live as long as the state
        Ok(unsafe { &*p }.get(k))
    }

    pub(crate) fn set_field(
        &mut self,
        t: Value,
        k: Value,
        v: Value,
    ) -> Result<(), String> {
        let p = self.table_ptr(t, "index")?;
        // SAFETY: tables live as long as the state
        unsafe { &mut *p }.set(k, v).map_err(str::to_owned)
    }

    pub(crate) fn get_global_value(&self, k: Value) -> Value {
        self.globals.get(k)
    }

    pub(crate) fn set_global_value(
        &mut self,
        k: Value,
        v: Value,
    ) -> Result<(), String> {
        self.globals.set(k, v).map_err(str::to_owned)
    }

    pub(crate) fn arith(
        &mut self,
        op: ArithOp,
        a: Value,
        b: Value,
    ) -> Result<Value, String> {
        if op == ArithOp::Concat {
            let text = |v: Value| {
                matches!(v.kind(), Kind::String | Kind::Number)
                    .then(|| self.tostring(v))
            };
            let (x, y) = (text(a), text(b));
            return match (x, y) {
                (Some(x), Some(y)) => Ok(self.intern(&(x + &y))),
                (None, _) => Err(concat_error(a)),
                (_, None) => Err(concat_error(b)),
            };
        }
        match (self.to_number(a), self.to_number(b)) {
            (Some(x), Some(y)) => {
                Ok(Value::number(op.eval(x, y).unwrap_or(f64::NAN)))
            }
            (None, _) => Err(arith_error(a)),
            (_, None) => Err(arith_error(b)),
        }
    }

    pub(crate) fn unary(&mut self, op: UnaryOp, a: Value) -> Result<Value, String> {
        match op {
            UnaryOp::Neg => self
                .to_number(a)
                .map(|x| Value::number(-x))
                .ok_or_else(|| arith_error(a)),
            UnaryOp::Not => Ok(Value::bool(!a.is_truthy())),
            UnaryOp::Len => {
                if let Some(s) = self.str_unchecked(a) {
                    Ok(Value::number(s.len() as f64))
                } else {
                    let p = self.table_ptr(a, "get length of")?;
                    // SAFETY: tables live as long as the state
                    Ok(Value::number(unsafe { &*p }.border() as f64))
                }
            }
        }
    }

    pub(crate) fn compare(
        &mut self,
        op: CmpOp,
        a: Value,
        b: Value,
    ) -> Result<bool, String> {
        match op {
            CmpOp::Eq => return Ok(raw_equal(a, b)),
            CmpOp::Ne => return Ok(!raw_equal(a, b)),
            _ => (),
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(op.eval(x, y));
        }
        match (self.str_unchecked(a), self.str_unchecked(b)) {
            (Some(x), Some(y)) => Ok(match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                _ => x >= y,
            }),
            _ => Err(format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            )),
        }
    }

    /// Calls a function value with the given arguments
    ///
    /// Any runtime error raised during the call (by generated code, a helper,
    /// or a builtin) is returned as [`Error::Runtime`].
    pub fn call(&mut self, f: Value, args: &[Value]) -> Result<Value, Error> {
        if let Some(v) = args.iter().chain([&f]).find(|v| !self.owns(**v)) {
            return Err(Error::Runtime(format!(
                "value {v:?} does not belong to this state"
            )));
        }
        if f.kind() != Kind::Function {
            return Err(Error::NotCallable(f.type_name()));
        }
        self.error = None;
        let out = invoke(self, f, args);
        match (out, self.error.take()) {
            (_, Some(e)) | (Err(e), None) => Err(Error::Runtime(e)),
            (Ok(v), None) => Ok(v),
        }
    }
}

fn arith_error(v: Value) -> String {
    format!("attempt to perform arithmetic on a {} value", v.type_name())
}

fn concat_error(v: Value) -> String {
    format!("attempt to concatenate a {} value", v.type_name())
}

fn raw_equal(a: Value, b: Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Calls a function through a raw state pointer
///
/// Generated code re-enters the runtime through the same pointer, so no
/// reference to the state is held across the native call.
pub(crate) fn invoke(
    state: *mut State,
    f: Value,
    args: &[Value],
) -> Result<Value, String> {
    let (entry, params) = {
        // SAFETY: callers pass a live state
        let s = unsafe { &mut *state };
        if s.depth >= MAX_CALL_DEPTH {
            return Err("stack overflow".to_owned());
        }
        if let Some(b) = f.as_ptr::<Builtin>(TAG_BUILTIN) {
            // SAFETY: builtin pointers live as long as the state
            let b = unsafe { (*b).f };
            return b(s, args);
        }
        let Some(nf) = f.as_ptr::<NativeFunction>(TAG_FUNCTION) else {
            return Err(format!("attempt to call a {} value", f.type_name()));
        };
        // SAFETY: function pointers live as long as the state
        let nf = unsafe { &*nf };
        (nf.entry, nf.params)
    };

    let mut argv: Vec<u64> = args.iter().map(|v| v.to_bits()).collect();
    if argv.len() < params as usize {
        argv.resize(params as usize, Value::NIL.to_bits());
    }

    // SAFETY: the state is live and no references into it are held
    unsafe { (*state).depth += 1 };
    let out = unsafe { entry(state, argv.as_ptr()) };
    unsafe { (*state).depth -= 1 };
    Ok(Value::from_bits(out))
}

impl Drop for State {
    fn drop(&mut self) {
        // SAFETY: every pointer was produced by `Box::into_raw` and is owned
        // exclusively by this state
        unsafe {
            for (_, p) in self.strings.drain() {
                drop(Box::from_raw(p));
            }
            for p in self.tables.drain(..) {
                drop(Box::from_raw(p));
            }
            for p in self.functions.drain(..) {
                drop(Box::from_raw(p));
            }
            for p in self.builtins.drain(..) {
                drop(Box::from_raw(p));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning() {
        let mut s = State::new();
        let a = s.intern("hello");
        let b = s.intern("hello");
        let c = s.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(s.str(a), Some("hello"));
        assert_eq!(a.kind(), Kind::String);
    }

    #[test]
    fn foreign_values_are_rejected() {
        let mut s = State::new();
        let t = s.new_table();
        let other = State::new();
        assert!(s.owns(t));
        assert!(!other.owns(t));
        assert!(other.table(t).is_none());
    }

    #[test]
    fn arithmetic_and_coercion() {
        let mut s = State::new();
        let ten = s.intern("10");
        let v = s.arith(ArithOp::Add, ten, Value::number(1.0)).unwrap();
        assert_eq!(v, Value::number(11.0));
        let t = s.new_table();
        let err = s.arith(ArithOp::Mul, t, Value::number(1.0)).unwrap_err();
        assert!(err.contains("table"), "{err}");

        let v = s.arith(ArithOp::Concat, ten, Value::number(2.0)).unwrap();
        assert_eq!(s.str(v), Some("102"));
    }

    #[test]
    fn comparisons() {
        let mut s = State::new();
        let a = s.intern("a");
        let b = s.intern("b");
        assert!(s.compare(CmpOp::Lt, a, b).unwrap());
        assert!(s.compare(CmpOp::Eq, Value::number(0.0), Value::number(-0.0)).unwrap());
        assert!(s.compare(CmpOp::Ne, Value::NIL, Value::FALSE).unwrap());
        assert!(s.compare(CmpOp::Lt, a, Value::number(1.0)).is_err());
    }

    #[test]
    fn globals() {
        let mut s = State::new();
        assert!(s.get_global("x").is_nil());
        s.set_global("x", Value::number(3.0));
        assert_eq!(s.get_global("x"), Value::number(3.0));
        assert_eq!(s.get_global("print").kind(), Kind::Function);
    }

    #[test]
    fn call_builtin() {
        let mut s = State::new();
        let print = s.get_global("print");
        let hi = s.intern("hi");
        let out = s.call(print, &[hi, Value::number(2.0)]).unwrap();
        assert!(out.is_nil());
        assert_eq!(s.take_output(), vec!["hi\t2".to_owned()]);

        let err = s.call(Value::number(1.0), &[]).unwrap_err();
        assert!(matches!(err, Error::NotCallable("number")));
    }
}
