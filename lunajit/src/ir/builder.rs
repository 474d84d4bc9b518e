use super::{
    ConstIndex, ConstantPool, Insn, Opcode, Operand, Target, Unit, ValueId,
};
use crate::value::Value;

/// Maximum nesting of open control-flow constructs
pub const JOIN_DEPTH_MAX: usize = 128;

/// Flavor of control-flow merge
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinKind {
    /// `if` / `elseif` / `else`, and short-circuit `and` / `or`
    Conditional,
    /// `while` and numeric `for`, with the test at the loop head
    Loop,
    /// `repeat ... until`, with the test at the loop tail
    Repeat,
}

/// An open control-flow construct
#[derive(Copy, Clone, Debug)]
struct Join {
    /// Log position when the construct was opened
    pos: usize,
    kind: JoinKind,
    /// Height of the phi staging stack when the construct was opened
    phi_base: usize,
}

/// A phi that hasn't been placed in the log yet
#[derive(Copy, Clone, Debug)]
struct StagedPhi {
    /// Value of the variable before the construct was opened
    pre: ValueId,
    /// Value on the arm currently being built
    current: ValueId,
    /// Value on the other incoming edge
    other: ValueId,
}

/// A variable whose value was merged when a construct was committed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Merge {
    /// The variable's value before the construct was opened
    pub pre: ValueId,
    /// The variable's value at the point of commit
    pub current: ValueId,
    /// The freshly minted phi result
    pub merged: ValueId,
}

/// Result of [`Builder::commit_join`]
#[derive(Clone, Debug, Default)]
pub struct JoinCommit {
    /// Number of instructions inserted at the join position
    ///
    /// Forward-branch indices recorded at or after the join position must be
    /// offset by this amount before they're patched.
    pub shift: usize,
    pub merges: Vec<Merge>,
}

/// Incremental builder for a compile unit's instruction log
///
/// The front end drives this with an ordered stream of calls; SSA ids are
/// handed out densely, and merges at control-flow joins are tracked on two
/// explicit stacks (open constructs and staged phis).
#[derive(Debug, Default)]
pub struct Builder {
    log: Vec<Insn>,
    pool: ConstantPool,

    /// Join depth at which the variable carried by each id was introduced
    ///
    /// Reassigning a variable only needs a merge if it was introduced outside
    /// the innermost open construct.
    origin: Vec<usize>,

    joins: Vec<Join>,
    staged: Vec<StagedPhi>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh SSA id, strictly greater than every previous one
    pub fn new_var(&mut self) -> ValueId {
        let v = ValueId::from(self.origin.len());
        self.origin.push(self.joins.len());
        v
    }

    pub fn intern(&mut self, v: Value) -> ConstIndex {
        self.pool.intern(v)
    }

    /// Log index of the next instruction to be emitted
    pub fn position(&self) -> usize {
        self.log.len()
    }

    pub fn log(&self) -> &[Insn] {
        &self.log
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    /// Number of currently open constructs
    pub fn join_depth(&self) -> usize {
        self.joins.len()
    }

    /// Appends an instruction, returning its target
    pub fn emit(
        &mut self,
        op: Opcode,
        a: Operand,
        b: Operand,
        target: Target,
    ) -> Target {
        self.log.push(Insn::new(op, a, b, target));
        target
    }

    /// Appends an instruction defining a fresh SSA id
    pub fn emit_value(&mut self, op: Opcode, a: Operand, b: Operand) -> ValueId {
        debug_assert!(op.defines_target());
        let v = self.new_var();
        self.emit(op, a, b, Target::Value(v));
        v
    }

    /// Appends a branch with an unresolved destination, returning its index
    pub fn emit_jump(&mut self, op: Opcode, a: Operand, b: Operand) -> usize {
        let i = self.position();
        self.emit(op, a, b, Target::None);
        i
    }

    /// Sets the destination of a previously emitted branch or marker
    pub fn patch_jump(&mut self, at: usize, dest: usize) {
        self.log[at].target = Target::Label(dest);
    }

    /// Opens a control-flow construct at the current position
    ///
    /// # Panics
    /// If more than [`JOIN_DEPTH_MAX`] constructs are open
    pub fn begin_join(&mut self, kind: JoinKind) {
        assert!(self.joins.len() < JOIN_DEPTH_MAX, "join stack exhausted");
        self.joins.push(Join {
            pos: self.position(),
            kind,
            phi_base: self.staged.len(),
        });
    }

    /// Records that a variable holding `old` was reassigned to `new`
    ///
    /// Does nothing if no construct is open, or if the variable was
    /// introduced inside the innermost one.
    pub fn insert_phi(&mut self, new: ValueId, old: ValueId) {
        let depth = self.joins.len();
        let Some(join) = self.joins.last() else {
            return;
        };
        let origin = self.origin[old.index()];
        if origin >= depth {
            return;
        }
        self.origin[new.index()] = origin;

        if let Some(p) = self.staged[join.phi_base..]
            .iter_mut()
            .find(|p| p.current == old)
        {
            p.current = new;
        } else {
            self.staged.push(StagedPhi {
                pre: old,
                current: new,
                other: old,
            });
        }
    }

    /// Switches from the `then` arm of a conditional to its alternative
    ///
    /// Every staged phi keeps the `then` value on its other edge and resets
    /// its current value to the pre-join id.  Returns `(then, pre)` pairs so
    /// the caller can roll its variable bindings back.
    pub fn switch_arm(&mut self) -> Vec<(ValueId, ValueId)> {
        let join = self.joins.last().expect("switch_arm without open join");
        debug_assert_eq!(join.kind, JoinKind::Conditional);
        self.staged[join.phi_base..]
            .iter_mut()
            .map(|p| {
                let then = p.current;
                p.other = then;
                p.current = p.pre;
                (then, p.pre)
            })
            .collect()
    }

    /// Closes the innermost construct, placing its phis in the log
    ///
    /// Loop phis are inserted at the loop head and every read of a pre-loop
    /// value inside the loop is rewritten to the merged value; conditional
    /// phis are appended at the current position.  Merges are forwarded to
    /// the enclosing construct when needed.
    pub fn commit_join(&mut self) -> JoinCommit {
        let join = self.joins.pop().expect("commit_join without open join");
        let staged: Vec<StagedPhi> =
            self.staged.drain(join.phi_base..).collect();
        if staged.is_empty() {
            return JoinCommit::default();
        }

        let until = self.log.len();
        let mut phis = Vec::with_capacity(staged.len());
        let mut merges = Vec::with_capacity(staged.len());
        for p in staged {
            let merged = ValueId::from(self.origin.len());
            self.origin.push(self.origin[p.pre.index()]);
            phis.push(Insn::new(
                Opcode::Phi,
                p.current.into(),
                p.other.into(),
                Target::Value(merged),
            ));
            if join.kind != JoinKind::Conditional {
                for insn in &mut self.log[join.pos..until] {
                    insn.rewrite_reads(p.pre, merged.into());
                }
            }
            merges.push(Merge {
                pre: p.pre,
                current: p.current,
                merged,
            });
        }

        let shift = match join.kind {
            JoinKind::Conditional => {
                self.log.extend(phis);
                0
            }
            JoinKind::Loop | JoinKind::Repeat => {
                let n = phis.len();
                self.shift_labels(join.pos, n);
                self.log.splice(join.pos..join.pos, phis);
                n
            }
        };

        for m in &merges {
            self.insert_phi(m.merged, m.pre);
        }
        JoinCommit { shift, merges }
    }

    /// Adjusts instruction-index references for `n` insertions at `pos`
    ///
    /// Branches that target `pos` itself keep pointing there, which after
    /// insertion is the first phi (the loop head); structural links to
    /// instructions at `pos` follow them.
    fn shift_labels(&mut self, pos: usize, n: usize) {
        for insn in &mut self.log {
            match (insn.op, insn.target) {
                (op, Target::Label(l)) if op.is_branch() && l > pos => {
                    insn.target = Target::Label(l + n);
                }
                (
                    Opcode::FunctionBegin(..) | Opcode::FunctionEnd,
                    Target::Label(l),
                ) if l >= pos => insn.target = Target::Label(l + n),
                _ => (),
            }
            if let Opcode::Closure(f) = &mut insn.op {
                if f.0 >= pos {
                    f.0 += n;
                }
            }
        }
    }

    /// Finishes the unit
    ///
    /// # Panics
    /// If a construct is still open
    pub fn finish(self) -> Unit {
        assert!(self.joins.is_empty(), "unit finished with open joins");
        Unit {
            log: self.log,
            pool: self.pool,
            value_count: self.origin.len(),
        }
    }
}
