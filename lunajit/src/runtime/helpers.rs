//! Entry points called from generated code
//!
//! Every helper takes the state pointer first and boxed values after it, and
//! returns a boxed value in `rax`.  Errors are recorded in the state and turn
//! into a `nil` result; the host sees them once the outermost call returns.
use super::{State, invoke};
use crate::{
    ir::{ArithOp, CmpOp, UnaryOp},
    value::Value,
};

/// Unwraps a helper result, recording the error (if any) in the state
fn finish(state: *mut State, r: Result<Value, String>) -> u64 {
    match r {
        Ok(v) => v.to_bits(),
        Err(e) => {
            // SAFETY: generated code always passes its live state pointer
            unsafe { &mut *state }.raise(e);
            Value::NIL.to_bits()
        }
    }
}

pub(crate) extern "sysv64" fn new_table(state: *mut State) -> u64 {
    // SAFETY: see `finish`
    unsafe { &mut *state }.new_table().to_bits()
}

pub(crate) extern "sysv64" fn get_field(
    state: *mut State,
    t: u64,
    k: u64,
) -> u64 {
    let s = unsafe { &mut *state };
    let r = s.get_field(Value::from_bits(t), Value::from_bits(k));
    finish(state, r)
}

pub(crate) extern "sysv64" fn set_field(
    state: *mut State,
    t: u64,
    k: u64,
    v: u64,
) -> u64 {
    let s = unsafe { &mut *state };
    let r = s
        .set_field(Value::from_bits(t), Value::from_bits(k), Value::from_bits(v))
        .map(|()| Value::NIL);
    finish(state, r)
}

pub(crate) extern "sysv64" fn get_global(state: *mut State, k: u64) -> u64 {
    unsafe { &*state }.get_global_value(Value::from_bits(k)).to_bits()
}

pub(crate) extern "sysv64" fn set_global(
    state: *mut State,
    k: u64,
    v: u64,
) -> u64 {
    let s = unsafe { &mut *state };
    let r = s
        .set_global_value(Value::from_bits(k), Value::from_bits(v))
        .map(|()| Value::NIL);
    finish(state, r)
}

pub(crate) extern "sysv64" fn arith(
    state: *mut State,
    a: u64,
    b: u64,
    op: u64,
) -> u64 {
    let r = match ArithOp::from_u8(op as u8) {
        Some(op) => unsafe { &mut *state }.arith(
            op,
            Value::from_bits(a),
            Value::from_bits(b),
        ),
        None => Err(format!("bad arithmetic opcode {op}")),
    };
    finish(state, r)
}

pub(crate) extern "sysv64" fn unary(state: *mut State, a: u64, op: u64) -> u64 {
    let r = match UnaryOp::from_u8(op as u8) {
        Some(op) => unsafe { &mut *state }.unary(op, Value::from_bits(a)),
        None => Err(format!("bad unary opcode {op}")),
    };
    finish(state, r)
}

/// Returns a boxed boolean
pub(crate) extern "sysv64" fn compare(
    state: *mut State,
    a: u64,
    b: u64,
    op: u64,
) -> u64 {
    let r = match CmpOp::from_u8(op as u8) {
        Some(op) => unsafe { &mut *state }
            .compare(op, Value::from_bits(a), Value::from_bits(b))
            .map(Value::bool),
        None => Err(format!("bad comparison opcode {op}")),
    };
    finish(state, r)
}

/// Generic indirect call: `f(args[0..nargs])`
///
/// Once an error is pending, further calls are skipped so that a failing
/// script unwinds quickly.
pub(crate) extern "sysv64" fn call_value(
    state: *mut State,
    f: u64,
    nargs: u64,
    args: *const u64,
) -> u64 {
    if unsafe { &*state }.has_error() {
        return Value::NIL.to_bits();
    }
    // SAFETY: generated code marshals `nargs` values at `args`
    let argv: Vec<Value> = (0..nargs as usize)
        .map(|i| Value::from_bits(unsafe { *args.add(i) }))
        .collect();
    let r = invoke(state, Value::from_bits(f), &argv);
    finish(state, r)
}
