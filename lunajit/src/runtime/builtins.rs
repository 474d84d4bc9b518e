//! Host functions registered in every new [`State`]
use super::State;
use crate::value::Value;

pub(super) fn register_all(state: &mut State) {
    state.register("print", print);
    state.register("assert", assert);
    state.register("type", type_of);
    state.register("tostring", tostring);
}

fn print(state: &mut State, args: &[Value]) -> Result<Value, String> {
    let line = args
        .iter()
        .map(|v| state.tostring(*v))
        .collect::<Vec<_>>()
        .join("\t");
    state.print_line(line);
    Ok(Value::NIL)
}

fn assert(state: &mut State, args: &[Value]) -> Result<Value, String> {
    let v = args.first().copied().unwrap_or(Value::NIL);
    if v.is_truthy() {
        Ok(v)
    } else {
        Err(match args.get(1) {
            Some(msg) => state.tostring(*msg),
            None => "assertion failed!".to_owned(),
        })
    }
}

fn type_of(state: &mut State, args: &[Value]) -> Result<Value, String> {
    let v = args.first().copied().unwrap_or(Value::NIL);
    Ok(state.intern(v.type_name()))
}

fn tostring(state: &mut State, args: &[Value]) -> Result<Value, String> {
    let s = state.tostring(args.first().copied().unwrap_or(Value::NIL));
    Ok(state.intern(&s))
}
