//! Phi elimination by coalescing
//!
//! The front end only ever merges successive values of the same surface
//! variable, so the inputs and result of a phi never need to be live in
//! different places at once.  Each phi's result and inputs are unioned into
//! one web, every reference is renamed to the web's representative, and the
//! phis themselves become dead.  After this pass a value may have more than
//! one definition.
use crate::ir::{Opcode, Unit, ValueId};

/// Union-find over value ids
struct Webs(Vec<usize>);

impl Webs {
    fn new(n: usize) -> Self {
        Self((0..n).collect())
    }

    fn find(&mut self, mut v: usize) -> usize {
        while self.0[v] != v {
            self.0[v] = self.0[self.0[v]];
            v = self.0[v];
        }
        v
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        // Keep the smallest id as the representative
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.0[hi] = lo;
    }
}

/// Removes every phi, returning the number eliminated
pub fn eliminate(unit: &mut Unit) -> usize {
    let mut webs = Webs::new(unit.value_count);
    let mut count = 0;
    for insn in unit.log.iter_mut().filter(|i| i.op == Opcode::Phi) {
        if !insn.dead {
            if let Some(t) = insn.target.value() {
                for v in insn.phi_inputs() {
                    webs.union(t.index(), v.index());
                }
            }
            count += 1;
        }
        insn.dead = true;
    }
    if count == 0 {
        return 0;
    }

    let reps: Vec<ValueId> = (0..unit.value_count)
        .map(|i| ValueId::from(webs.find(i)))
        .collect();
    for insn in &mut unit.log {
        insn.rename(|v| reps[v.index()]);
    }
    count
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend, runtime::State};

    #[test]
    fn if_else_coalesces() {
        let mut state = State::new();
        let mut unit = frontend::parse(
            "local x = 0 if c then x = 1 else x = 2 end return x",
            &mut state,
        )
        .unwrap();
        assert_eq!(eliminate(&mut unit), 1);
        assert!(unit.log.iter().all(|i| i.op != Opcode::Phi || i.dead));

        // Every definition of the variable now targets the same value
        let ret = unit.log.iter().find(|i| i.op == Opcode::Ret).unwrap();
        let x = ret.a.value().unwrap();
        let defs = unit
            .log
            .iter()
            .filter(|i| !i.dead && i.def() == Some(x))
            .count();
        assert_eq!(defs, 3);
    }

    #[test]
    fn no_phis_is_a_no_op() {
        let mut state = State::new();
        let mut unit = frontend::parse("return 1 + 2", &mut state).unwrap();
        let before = unit.log.clone();
        assert_eq!(eliminate(&mut unit), 0);
        assert_eq!(unit.log, before);
    }
}
