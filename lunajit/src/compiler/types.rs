use crate::ir::{ArithOp, ConstantPool, Opcode, Operand, Unit, UnaryOp};

/// Static knowledge about a value's runtime type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    /// No definition has been analyzed yet
    Unknown,
    /// Always a double
    Number,
    /// Anything at all
    Any,
}

impl Type {
    /// Greatest lower bound, with `Unknown` as the top element
    pub fn meet(self, other: Self) -> Self {
        match (self, other) {
            (Type::Unknown, t) | (t, Type::Unknown) => t,
            (Type::Number, Type::Number) => Type::Number,
            _ => Type::Any,
        }
    }

    pub fn is_number(self) -> bool {
        self == Type::Number
    }
}

/// Returns the type of an operand under the given assumptions
pub fn operand_type(op: Operand, pool: &ConstantPool, types: &[Type]) -> Type {
    match op {
        Operand::None => Type::Any,
        Operand::Constant(c) => {
            if pool.get(c).is_number() {
                Type::Number
            } else {
                Type::Any
            }
        }
        Operand::Value(v) => types[v.index()],
    }
}

/// Infers a type for every value
///
/// This is an optimistic fixpoint: values start out `Unknown`, so a loop
/// counter whose only external input is a number stays a number.  A value
/// with several definitions (after phi elimination) takes the meet of all of
/// them.  Anything still `Unknown` at the end is never defined.
pub fn infer(unit: &Unit) -> Vec<Type> {
    let mut types = vec![Type::Unknown; unit.value_count];
    for _ in 0..=unit.value_count {
        let mut next = vec![Type::Unknown; unit.value_count];
        for insn in unit.log.iter().filter(|i| !i.dead) {
            let Some(d) = insn.def() else {
                continue;
            };
            let ty = |o| operand_type(o, &unit.pool, &types);
            let t = match insn.op {
                Opcode::Copy => ty(insn.a),
                Opcode::Phi => ty(insn.a).meet(ty(insn.b)),
                Opcode::Arith(ArithOp::Concat) => Type::Any,
                Opcode::Arith(..) => match (ty(insn.a), ty(insn.b)) {
                    (Type::Number, Type::Number) => Type::Number,
                    (Type::Any, _) | (_, Type::Any) => Type::Any,
                    _ => Type::Unknown,
                },
                Opcode::Unary(UnaryOp::Neg) => match ty(insn.a) {
                    Type::Number => Type::Number,
                    Type::Any => Type::Any,
                    Type::Unknown => Type::Unknown,
                },
                _ => Type::Any,
            };
            next[d.index()] = next[d.index()].meet(t);
        }
        if next == types {
            break;
        }
        types = next;
    }
    types
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend, runtime::State};

    fn types_of(src: &str) -> (Unit, Vec<Type>) {
        let mut state = State::new();
        let mut unit = frontend::parse(src, &mut state).unwrap();
        super::super::phi::eliminate(&mut unit);
        let t = infer(&unit);
        (unit, t)
    }

    #[test]
    fn loop_counter_is_number() {
        let (unit, types) =
            types_of("local i = 0 while i < 10 do i = i + 1 end return i");
        let ret = unit.log.iter().find(|i| i.op == Opcode::Ret).unwrap();
        let v = ret.a.value().unwrap();
        assert_eq!(types[v.index()], Type::Number);
    }

    #[test]
    fn globals_are_any() {
        let (unit, types) = types_of("local i = x + 1 return i");
        let ret = unit.log.iter().find(|i| i.op == Opcode::Ret).unwrap();
        let v = ret.a.value().unwrap();
        assert_eq!(types[v.index()], Type::Any);
    }

    #[test]
    fn mixed_merge_is_any() {
        let (unit, types) = types_of(
            "local v = 1 if c then v = 'a' end return v",
        );
        let ret = unit.log.iter().find(|i| i.op == Opcode::Ret).unwrap();
        let v = ret.a.value().unwrap();
        assert_eq!(types[v.index()], Type::Any);
    }
}
