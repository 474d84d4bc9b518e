use crate::ir::{Opcode, Unit, ValueId};

/// Live range of a single value
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LiveRange {
    pub id: ValueId,
    /// Earliest defining position
    pub def: usize,
    /// Latest reading position, or `None` if the value is never read
    pub last_use: Option<usize>,
}

/// Result of liveness analysis over a whole unit
#[derive(Debug, Default)]
pub struct Liveness {
    /// Definition position, indexed by value id
    pub def_pos: Vec<Option<usize>>,
    /// Last use, indexed by value id
    pub last_use: Vec<Option<usize>>,
    /// Every defined value, sorted by definition position
    pub ranges: Vec<LiveRange>,
}

impl Liveness {
    pub fn def_pos(&self, v: ValueId) -> Option<usize> {
        self.def_pos[v.index()]
    }
    pub fn last_use(&self, v: ValueId) -> Option<usize> {
        self.last_use[v.index()]
    }
}

/// Computes live ranges, extending them across loops
///
/// A value defined before a loop and read inside it must survive until the
/// loop exits, since the back edge may read it again.
///
/// Once phis are eliminated, a value may be written in several places.  A
/// value that is read at all stays live through its last write, so that a
/// late write never lands in storage already handed to another value.
pub fn analyze(unit: &Unit) -> Liveness {
    let n = unit.value_count;
    let mut def_pos = vec![None; n];
    let mut last_def = vec![None; n];
    let mut last_use = vec![None; n];

    for (i, insn) in unit.log.iter().enumerate().rev() {
        if insn.dead || insn.op.is_marker() {
            continue;
        }
        for r in insn.reads() {
            last_use[r.index()].get_or_insert(i);
        }
    }

    let mut loops = vec![];
    let mut open = vec![];
    for (i, insn) in unit.log.iter().enumerate() {
        match insn.op {
            Opcode::LoopBegin => open.push(i),
            Opcode::LoopEnd => {
                let begin = open.pop().expect("unbalanced loop markers");
                loops.push((begin, i));
            }
            _ if insn.dead => (),
            _ => {
                if let Some(d) = insn.def() {
                    def_pos[d.index()].get_or_insert(i);
                    last_def[d.index()] = Some(i);
                }
            }
        }
    }

    for (u, d) in last_use.iter_mut().zip(&last_def) {
        if let (Some(u), Some(d)) = (u.as_mut(), d) {
            *u = (*u).max(*d);
        }
    }

    // Loops are recorded in order of their end markers, so inner loops are
    // handled before the loops that contain them.
    for (begin, end) in loops {
        for (d, u) in def_pos.iter().zip(last_use.iter_mut()) {
            if let (Some(d), Some(u)) = (d, u.as_mut()) {
                if *d < begin && (begin..end).contains(u) {
                    *u = end;
                }
            }
        }
    }

    let mut ranges: Vec<LiveRange> = def_pos
        .iter()
        .enumerate()
        .filter_map(|(i, d)| {
            d.map(|def| LiveRange {
                id: ValueId::from(i),
                def,
                last_use: last_use[i],
            })
        })
        .collect();
    ranges.sort_by_key(|r| (r.def, r.id));

    Liveness {
        def_pos,
        last_use,
        ranges,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{ArithOp, Builder, JoinKind, Operand, Target},
        value::Value,
    };

    #[test]
    fn straight_line() {
        let mut b = Builder::new();
        let one = b.intern(Value::number(1.0));
        let x = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        let y = b.emit_value(Opcode::Arith(ArithOp::Add), x.into(), one.into());
        let z = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        b.emit(Opcode::Ret, y.into(), Operand::None, Target::None);
        let live = analyze(&b.finish());

        assert_eq!(live.def_pos(x), Some(0));
        assert_eq!(live.last_use(x), Some(1));
        assert_eq!(live.last_use(y), Some(3));
        assert_eq!(live.last_use(z), None);
        let order: Vec<_> = live.ranges.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![x, y, z]);
    }

    #[test]
    fn call_count_is_not_a_use() {
        let mut b = Builder::new();
        let name = b.intern(Value::NIL);
        let f = b.emit_value(Opcode::GetGlobal, name.into(), Operand::None);
        let a = b.emit_value(Opcode::Copy, name.into(), Operand::None);
        b.emit(Opcode::Arg, a.into(), Operand::None, Target::None);
        let r = b.emit_value(Opcode::Call(1), f.into(), Operand::None);
        let live = analyze(&b.finish());
        assert_eq!(live.last_use(f), Some(3));
        assert_eq!(live.last_use(a), Some(2));
        assert_eq!(live.last_use(r), None);
    }

    #[test]
    fn loop_extension() {
        let mut b = Builder::new();
        let one = b.intern(Value::number(1.0));
        let k = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        let x0 = b.emit_value(Opcode::Copy, one.into(), Operand::None);

        b.emit(Opcode::LoopBegin, Operand::None, Operand::None, Target::None);
        b.begin_join(JoinKind::Loop);
        let head = b.position();
        let exit = b.emit_jump(Opcode::JumpIfFalse, x0.into(), Operand::None);
        // `k` is read early in the body and never again
        let x1 = b.emit_value(Opcode::Arith(ArithOp::Add), x0.into(), k.into());
        b.insert_phi(x1, x0);
        let tmp = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        b.emit(Opcode::Arg, tmp.into(), Operand::None, Target::None);
        let back = b.emit_jump(Opcode::Jump, Operand::None, Operand::None);
        b.patch_jump(back, head);
        let c = b.commit_join();
        b.patch_jump(exit + c.shift, b.position());
        let end = b.position();
        b.emit(Opcode::LoopEnd, Operand::None, Operand::None, Target::None);

        let live = analyze(&b.finish());
        assert!(live.last_use(k).unwrap() >= end);
        // values local to one iteration are not extended
        assert!(live.last_use(tmp).unwrap() < end);
    }

    #[test]
    fn nested_loops_extend_to_outer_end() {
        let mut b = Builder::new();
        let one = b.intern(Value::number(1.0));
        let k = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        b.emit(Opcode::LoopBegin, Operand::None, Operand::None, Target::None);
        b.emit(Opcode::LoopBegin, Operand::None, Operand::None, Target::None);
        b.emit(Opcode::Arg, k.into(), Operand::None, Target::None);
        b.emit(Opcode::LoopEnd, Operand::None, Operand::None, Target::None);
        let outer_end = b.position();
        b.emit(Opcode::LoopEnd, Operand::None, Operand::None, Target::None);
        let live = analyze(&b.finish());
        assert_eq!(live.last_use(k), Some(outer_end));
    }

    #[test]
    fn late_writes_extend_the_range() {
        let mut b = Builder::new();
        let one = b.intern(Value::number(1.0));
        let x = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        b.emit(Opcode::Arg, x.into(), Operand::None, Target::None);
        let y = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        // A second write to `x` after its only read, as left behind by phi
        // elimination
        let late = b.position();
        b.emit(Opcode::Copy, one.into(), Operand::None, Target::Value(x));
        b.emit(Opcode::Ret, y.into(), Operand::None, Target::None);

        // A value that is never read keeps no range, however often written
        let z = b.emit_value(Opcode::Copy, one.into(), Operand::None);
        b.emit(Opcode::Copy, one.into(), Operand::None, Target::Value(z));

        let live = analyze(&b.finish());
        assert_eq!(live.def_pos(x), Some(0));
        assert_eq!(live.last_use(x), Some(late));
        assert!(live.def_pos(y).unwrap() < live.last_use(x).unwrap());
        assert_eq!(live.last_use(z), None);
    }
}
