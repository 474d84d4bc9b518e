//! Peephole fusion, constant folding, and dead code elimination
//!
//! Both passes work in place: instructions are rewritten or tagged as dead,
//! never removed, so indices (and branch targets) stay valid.
use super::{
    liveness,
    types::{self, Type},
};
use crate::{
    ir::{
        ArithOp, CmpOp, ConstantPool, Insn, Opcode, Operand, UnaryOp, Unit,
        ValueId,
    },
    value::Value,
};

/// Per-value bookkeeping shared by the passes
struct Usage {
    /// Reads plus phi inputs, over live instructions
    uses: Vec<u32>,
    /// Live defining instructions
    defs: Vec<u32>,
    /// Values that take part in a phi, or are used as a store's table
    pinned: Vec<bool>,
}

impl Usage {
    fn new(unit: &Unit) -> Self {
        let n = unit.value_count;
        let mut out = Self {
            uses: vec![0; n],
            defs: vec![0; n],
            pinned: vec![false; n],
        };
        for insn in unit.log.iter().filter(|i| !i.dead) {
            for v in insn.reads().into_iter().chain(insn.phi_inputs()) {
                out.uses[v.index()] += 1;
            }
            if let Some(d) = insn.def() {
                out.defs[d.index()] += 1;
            }
            if insn.op == Opcode::Phi {
                for v in insn.phi_inputs().into_iter().chain(insn.def()) {
                    out.pinned[v.index()] = true;
                }
            }
            if insn.op == Opcode::SetField {
                if let Some(t) = insn.target.value() {
                    out.pinned[t.index()] = true;
                }
            }
        }
        out
    }

    /// Checks whether a value can be freely rewritten
    fn is_simple(&self, v: ValueId) -> bool {
        self.defs[v.index()] == 1 && !self.pinned[v.index()]
    }
}

/// Runs every pass once
pub fn optimize(unit: &mut Unit) {
    let fused = peephole(unit);
    let (folded, killed) = fold(unit);
    log::debug!(
        "optimizer: {fused} peephole rewrites, {folded} folds, {killed} dead"
    );
}

/// Fuses compare + branch pairs and removes redundant copies
///
/// Returns the number of rewrites performed.
pub fn peephole(unit: &mut Unit) -> usize {
    let usage = Usage::new(unit);
    let mut count = 0;
    for i in 0..unit.log.len() {
        let cur = unit.log[i];
        if cur.dead {
            continue;
        }

        if cur.op == Opcode::Copy && cur.target.value() == cur.a.value() {
            unit.log[i].dead = true;
            count += 1;
            continue;
        }
        let Some(prev) = i.checked_sub(1).map(|j| unit.log[j]) else {
            continue;
        };
        if prev.dead {
            continue;
        }

        match (prev.op, cur.op) {
            (
                Opcode::Compare(cmp),
                Opcode::JumpIfFalse | Opcode::JumpIfTrue,
            ) => {
                let t = prev.target.value();
                if t.is_none()
                    || cur.a.value() != t
                    || t.is_some_and(|t| {
                        usage.uses[t.index()] != 1 || !usage.is_simple(t)
                    })
                {
                    continue;
                }
                unit.log[i] = Insn::new(
                    Opcode::BranchCmp {
                        cmp,
                        when: cur.op == Opcode::JumpIfTrue,
                    },
                    prev.a,
                    prev.b,
                    cur.target,
                );
                unit.log[i - 1].dead = true;
                count += 1;
            }
            (op, Opcode::Copy)
                if op.defines_target()
                    && !matches!(op, Opcode::Phi | Opcode::Param(..)) =>
            {
                let Some(src) = cur.a.value() else {
                    continue;
                };
                if prev.def() != Some(src)
                    || usage.uses[src.index()] != 1
                    || !usage.is_simple(src)
                {
                    continue;
                }
                unit.log[i - 1].target = cur.target;
                unit.log[i].dead = true;
                count += 1;
            }
            _ => (),
        }
    }
    count
}

/// Evaluates an instruction whose operands are all constants
fn fold_value(insn: &Insn, pool: &ConstantPool) -> Option<Value> {
    let constant = |o: Operand| match o {
        Operand::Constant(c) => Some(pool.get(c)),
        _ => None,
    };
    match insn.op {
        Opcode::Copy => constant(insn.a),
        Opcode::Arith(op) => {
            let a = constant(insn.a)?.as_number()?;
            let b = constant(insn.b)?.as_number()?;
            op.eval(a, b).map(Value::number)
        }
        Opcode::Unary(UnaryOp::Neg) => {
            constant(insn.a)?.as_number().map(|a| Value::number(-a))
        }
        Opcode::Unary(UnaryOp::Not) => {
            constant(insn.a).map(|a| Value::bool(!a.is_truthy()))
        }
        _ => None,
    }
}

/// Checks whether an instruction can be removed when its result is unused
fn is_pure(insn: &Insn, pool: &ConstantPool, types: &[Type]) -> bool {
    let numeric = |o| types::operand_type(o, pool, types).is_number();
    match insn.op {
        Opcode::Copy
        | Opcode::NewTable
        | Opcode::GetGlobal
        | Opcode::Closure(..)
        | Opcode::Phi
        | Opcode::Unary(UnaryOp::Not)
        | Opcode::Compare(CmpOp::Eq | CmpOp::Ne) => true,
        Opcode::Arith(ArithOp::Concat) => false,
        Opcode::Arith(..) | Opcode::Compare(..) => {
            numeric(insn.a) && numeric(insn.b)
        }
        Opcode::Unary(UnaryOp::Neg) => numeric(insn.a),
        _ => false,
    }
}

/// Folds constant expressions and removes dead values
///
/// Returns the number of folded and of killed instructions.
pub fn fold(unit: &mut Unit) -> (usize, usize) {
    let usage = Usage::new(unit);
    let live = liveness::analyze(unit);

    let mut folded = 0;
    for i in 0..unit.log.len() {
        let insn = unit.log[i];
        if insn.dead {
            continue;
        }
        let Some(t) = insn.def() else {
            continue;
        };
        if !usage.is_simple(t) {
            continue;
        }
        let Some(v) = fold_value(&insn, &unit.pool) else {
            continue;
        };
        let c = unit.pool.intern(v);
        if let Some(end) = live.last_use(t) {
            for consumer in &mut unit.log[i + 1..=end] {
                consumer.rewrite_reads(t, c.into());
            }
        }
        unit.log[i].dead = true;
        folded += 1;
    }

    let killed = sweep(unit);
    (folded, killed)
}

/// Marks dead every pure instruction whose result can't reach an effect
///
/// Liveness flows backwards from roots (instructions with effects, or with no
/// result at all) through their reads.  A phi only keeps its inputs alive
/// when the phi itself is live, so values that merely circle through phis
/// die together.
///
/// Returns the number of killed instructions.
fn sweep(unit: &mut Unit) -> usize {
    let types = types::infer(unit);

    // A value may have several definitions once phis are eliminated
    let mut defs = vec![vec![]; unit.value_count];
    let mut todo = vec![];
    for (i, insn) in unit.log.iter().enumerate() {
        if insn.dead {
            continue;
        }
        match insn.def() {
            Some(t) if is_pure(insn, &unit.pool, &types) => {
                defs[t.index()].push(i)
            }
            _ => todo.push(i),
        }
    }

    let mut live = vec![false; unit.value_count];
    let mut reached = vec![false; unit.log.len()];
    while let Some(i) = todo.pop() {
        if std::mem::replace(&mut reached[i], true) {
            continue;
        }
        let insn = &unit.log[i];
        for v in insn.reads().into_iter().chain(insn.phi_inputs()) {
            if !std::mem::replace(&mut live[v.index()], true) {
                todo.extend(&defs[v.index()]);
            }
        }
    }

    let mut killed = 0;
    for (insn, reached) in unit.log.iter_mut().zip(reached) {
        if !insn.dead && !insn.op.is_marker() && !reached {
            insn.dead = true;
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend, runtime::State};

    fn live(unit: &Unit) -> Vec<Insn> {
        unit.log.iter().filter(|i| !i.dead).copied().collect()
    }

    #[test]
    fn fold_product() {
        let mut state = State::new();
        let mut unit = frontend::parse("return (2 + 3) * 4", &mut state).unwrap();
        optimize(&mut unit);
        let insns = live(&unit);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].op, Opcode::Ret);
        let Operand::Constant(c) = insns[0].a else {
            panic!("expected a constant, got {:?}", insns[0].a);
        };
        assert_eq!(unit.pool.get(c), Value::number(20.0));
    }

    #[test]
    fn fuse_compare_branch() {
        let mut state = State::new();
        let mut unit =
            frontend::parse("if x < 3 then y = 1 end", &mut state).unwrap();
        let before = unit
            .log
            .iter()
            .filter(|i| matches!(i.op, Opcode::Compare(..)))
            .count();
        assert_eq!(before, 1);
        optimize(&mut unit);
        let insns = live(&unit);
        assert!(insns.iter().all(|i| !matches!(i.op, Opcode::Compare(..))));
        assert!(insns.iter().any(|i| i.op
            == Opcode::BranchCmp {
                cmp: CmpOp::Lt,
                when: false
            }));
    }

    #[test]
    fn copy_elimination() {
        let mut state = State::new();
        let mut unit =
            frontend::parse("local t = {} return t", &mut state).unwrap();
        optimize(&mut unit);
        let insns = live(&unit);
        assert_eq!(insns.len(), 2, "{}", unit.dump());
        assert_eq!(insns[0].op, Opcode::NewTable);
        assert_eq!(insns[1].a, insns[0].target.value().unwrap().into());
    }

    #[test]
    fn phi_related_values_are_not_folded() {
        let mut state = State::new();
        let mut unit = frontend::parse(
            "local a = 1 while a ~= 10 do a = a + 1 end return a",
            &mut state,
        )
        .unwrap();
        optimize(&mut unit);
        // The loop counter must still be stored by its initial copy
        let copies = live(&unit)
            .iter()
            .filter(|i| i.op == Opcode::Copy)
            .count();
        assert_eq!(copies, 1, "{}", unit.dump());
    }

    #[test]
    fn unused_pure_values_die() {
        let mut state = State::new();
        let mut unit = frontend::parse(
            "local a = 1 local b = a + 2 local c = {} return 5",
            &mut state,
        )
        .unwrap();
        optimize(&mut unit);
        assert_eq!(live(&unit).len(), 1, "{}", unit.dump());
    }

    #[test]
    fn effects_survive() {
        let mut state = State::new();
        let mut unit =
            frontend::parse("local a = x + 1 print(2)", &mut state).unwrap();
        optimize(&mut unit);
        // `x + 1` may raise an error, so it stays
        assert!(live(&unit)
            .iter()
            .any(|i| i.op == Opcode::Arith(ArithOp::Add)));
    }

    #[test]
    fn unread_loop_variables_die() {
        let mut state = State::new();
        let mut unit = frontend::parse(
            "local x = 0 local i = 0
             while i < 2 do
                 i = i + 1
                 if i > 0 then x = tostring(i) end
             end
             return i",
            &mut state,
        )
        .unwrap();
        optimize(&mut unit);
        // Only `i` is carried around the loop; `x` is written but never read
        let phis = live(&unit)
            .iter()
            .filter(|i| i.op == Opcode::Phi)
            .count();
        assert_eq!(phis, 1, "{}", unit.dump());
        assert_eq!(unit.log[0].op, Opcode::Copy);
        assert!(unit.log[0].dead, "{}", unit.dump());
        // The call may have effects, so it stays
        assert!(live(&unit).iter().any(|i| matches!(i.op, Opcode::Call(..))));
    }
}
