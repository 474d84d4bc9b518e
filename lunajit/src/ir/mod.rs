//! Instruction log, constant pool, and SSA construction
//!
//! A compile unit is a flat, append-only log of [`Insn`]s.  The index of an
//! instruction in the log is both its program point (for liveness) and its
//! address (for branches), so passes never remove instructions; they tag them
//! as dead instead.
use crate::indexed::define_index;
use arrayvec::ArrayVec;

mod builder;
mod pool;

pub use builder::{Builder, JOIN_DEPTH_MAX, JoinCommit, JoinKind, Merge};
pub use pool::{ConstIndex, ConstantPool, MAX_CONSTANTS};

define_index!(ValueId, "An SSA value id, dense within one compile unit");

/// Identifies a nested function by the log index of its begin marker
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FunctionId(pub usize);

/// Source operand of an instruction
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Operand {
    #[default]
    None,
    /// Index into the unit's constant pool
    Constant(ConstIndex),
    /// SSA value
    Value(ValueId),
}

impl Operand {
    pub fn value(self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Value(v)
    }
}

impl From<ConstIndex> for Operand {
    fn from(c: ConstIndex) -> Self {
        Operand::Constant(c)
    }
}

/// Destination of an instruction; its meaning depends on the opcode class
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Target {
    #[default]
    None,
    /// SSA value; defined by most opcodes, read by [`Opcode::SetField`]
    Value(ValueId),
    /// Instruction index; a branch destination or a function marker link
    Label(usize),
}

impl Target {
    pub fn value(self) -> Option<ValueId> {
        match self {
            Target::Value(v) => Some(v),
            _ => None,
        }
    }
    pub fn label(self) -> Option<usize> {
        match self {
            Target::Label(i) => Some(i),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Binary arithmetic operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
}

impl ArithOp {
    /// Evaluates the operation on two numbers
    ///
    /// Returns `None` for [`ArithOp::Concat`], which produces a string.
    pub fn eval(self, a: f64, b: f64) -> Option<f64> {
        Some(match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Concat => return None,
        })
    }

    pub(crate) fn from_u8(i: u8) -> Option<Self> {
        [
            ArithOp::Add,
            ArithOp::Sub,
            ArithOp::Mul,
            ArithOp::Div,
            ArithOp::Mod,
            ArithOp::Pow,
            ArithOp::Concat,
        ]
        .get(i as usize)
        .copied()
    }
}

/// Unary operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum UnaryOp {
    Neg,
    Not,
    Len,
}

impl UnaryOp {
    pub(crate) fn from_u8(i: u8) -> Option<Self> {
        [UnaryOp::Neg, UnaryOp::Not, UnaryOp::Len]
            .get(i as usize)
            .copied()
    }
}

/// Comparisons, producing a boolean
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn eval(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }

    pub(crate) fn from_u8(i: u8) -> Option<Self> {
        [
            CmpOp::Eq,
            CmpOp::Ne,
            CmpOp::Lt,
            CmpOp::Le,
            CmpOp::Gt,
            CmpOp::Ge,
        ]
        .get(i as usize)
        .copied()
    }
}

/// Instruction opcodes
///
/// The comment on each variant describes how it uses `a`, `b`, and `target`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// `target = a`
    Copy,
    /// `target = a op b`
    Arith(ArithOp),
    /// `target = op a`
    Unary(UnaryOp),
    /// `target = (a op b)` as a boolean
    Compare(CmpOp),
    /// `target = {}`
    NewTable,
    /// `target = a[b]`
    GetField,
    /// `target[a] = b`; the target is read, not written
    SetField,
    /// `target = globals[a]`
    GetGlobal,
    /// `globals[a] = b`
    SetGlobal,
    /// Marshals `a` as the next argument of the following call
    Arg,
    /// `target = a(args)`, consuming the preceding `Arg` instructions
    ///
    /// The argument count lives here rather than in an operand slot.
    Call(u8),
    /// Returns `a` (or `nil` if absent)
    Ret,
    /// Unconditional branch to `target`
    Jump,
    /// Branches to `target` if `a` is `nil` or `false`
    JumpIfFalse,
    /// Branches to `target` if `a` is neither `nil` nor `false`
    JumpIfTrue,
    /// Branches to `target` if `(a cmp b) == when`
    BranchCmp { cmp: CmpOp, when: bool },
    /// `target = φ(a, b)`; inputs are merge inputs, not reads
    Phi,
    /// Start of a loop body, for liveness extension
    LoopBegin,
    /// End of a loop body, for liveness extension
    LoopEnd,
    /// Start of a nested function with the given parameter count; `target`
    /// links to the matching [`Opcode::FunctionEnd`]
    FunctionBegin(u8),
    /// `target` = the function's i-th argument
    Param(u8),
    /// End of a nested function; `target` links back to its begin marker
    FunctionEnd,
    /// `target` = the compiled form of the given nested function
    Closure(FunctionId),
}

impl Opcode {
    /// Checks whether this opcode defines its target value
    pub fn defines_target(&self) -> bool {
        matches!(
            self,
            Opcode::Copy
                | Opcode::Arith(..)
                | Opcode::Unary(..)
                | Opcode::Compare(..)
                | Opcode::NewTable
                | Opcode::GetField
                | Opcode::GetGlobal
                | Opcode::Call(..)
                | Opcode::Phi
                | Opcode::Param(..)
                | Opcode::Closure(..)
        )
    }

    /// Checks whether this opcode's target is an instruction index
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::BranchCmp { .. }
        )
    }

    /// Checks whether this is a pure bookkeeping marker with no code
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            Opcode::LoopBegin
                | Opcode::LoopEnd
                | Opcode::FunctionBegin(..)
                | Opcode::FunctionEnd
        )
    }

    /// Returns a short mnemonic, used when dumping the log
    pub fn name(&self) -> String {
        match self {
            Opcode::Copy => "copy".to_owned(),
            Opcode::Arith(op) => <&str>::from(op).to_owned(),
            Opcode::Unary(op) => <&str>::from(op).to_owned(),
            Opcode::Compare(op) => <&str>::from(op).to_owned(),
            Opcode::NewTable => "newtable".to_owned(),
            Opcode::GetField => "getfield".to_owned(),
            Opcode::SetField => "setfield".to_owned(),
            Opcode::GetGlobal => "getglobal".to_owned(),
            Opcode::SetGlobal => "setglobal".to_owned(),
            Opcode::Arg => "arg".to_owned(),
            Opcode::Call(n) => format!("call/{n}"),
            Opcode::Ret => "ret".to_owned(),
            Opcode::Jump => "jmp".to_owned(),
            Opcode::JumpIfFalse => "jz".to_owned(),
            Opcode::JumpIfTrue => "jnz".to_owned(),
            Opcode::BranchCmp { cmp, when } => {
                let c: &str = cmp.into();
                format!("b{c}.{}", if *when { "t" } else { "f" })
            }
            Opcode::Phi => "phi".to_owned(),
            Opcode::LoopBegin => "loop{".to_owned(),
            Opcode::LoopEnd => "}loop".to_owned(),
            Opcode::FunctionBegin(n) => format!("fn/{n}{{"),
            Opcode::Param(i) => format!("param/{i}"),
            Opcode::FunctionEnd => "}fn".to_owned(),
            Opcode::Closure(f) => format!("closure@{}", f.0),
        }
    }
}

/// A single instruction in the log
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Insn {
    pub op: Opcode,
    pub a: Operand,
    pub b: Operand,
    pub target: Target,
    /// Dead instructions keep their index but emit no code
    pub dead: bool,
}

impl Insn {
    pub fn new(op: Opcode, a: Operand, b: Operand, target: Target) -> Self {
        Self {
            op,
            a,
            b,
            target,
            dead: false,
        }
    }

    /// Returns the value defined by this instruction, if any
    pub fn def(&self) -> Option<ValueId> {
        if self.op.defines_target() {
            self.target.value()
        } else {
            None
        }
    }

    /// Returns every value read by this instruction
    ///
    /// Phi inputs are not reads: they are satisfied along incoming edges.
    pub fn reads(&self) -> ArrayVec<ValueId, 3> {
        let mut out = ArrayVec::new();
        if self.op == Opcode::Phi {
            return out;
        }
        out.extend(self.a.value());
        out.extend(self.b.value());
        if self.op == Opcode::SetField {
            out.extend(self.target.value());
        }
        out
    }

    /// Returns the phi inputs of this instruction (empty for non-phis)
    pub fn phi_inputs(&self) -> ArrayVec<ValueId, 2> {
        let mut out = ArrayVec::new();
        if self.op == Opcode::Phi {
            out.extend(self.a.value());
            out.extend(self.b.value());
        }
        out
    }

    /// Replaces every operand (including phi inputs and read targets) equal
    /// to `from` with `to`; definitions are left untouched
    pub fn rewrite_reads(&mut self, from: ValueId, to: Operand) {
        if self.a == Operand::Value(from) {
            self.a = to;
        }
        if self.b == Operand::Value(from) {
            self.b = to;
        }
        if self.op == Opcode::SetField && self.target == Target::Value(from) {
            if let Operand::Value(v) = to {
                self.target = Target::Value(v);
            }
        }
    }

    /// Applies `f` to every value id mentioned by this instruction
    pub fn rename(&mut self, f: impl Fn(ValueId) -> ValueId) {
        if let Operand::Value(v) = self.a {
            self.a = Operand::Value(f(v));
        }
        if let Operand::Value(v) = self.b {
            self.b = Operand::Value(f(v));
        }
        if let Target::Value(v) = self.target {
            self.target = Target::Value(f(v));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A finished compile unit: instruction log plus constant pool
#[derive(Debug, Default)]
pub struct Unit {
    pub log: Vec<Insn>,
    pub pool: ConstantPool,
    /// Number of SSA ids minted; every [`ValueId`] is below this
    pub value_count: usize,
}

/// Extent of a nested function in the log
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FunctionRange {
    pub id: FunctionId,
    /// Index of the [`Opcode::FunctionBegin`] marker
    pub begin: usize,
    /// Index of the [`Opcode::FunctionEnd`] marker
    pub end: usize,
    pub params: u8,
}

impl Unit {
    /// Returns every nested function, innermost (latest-starting) first
    pub fn functions(&self) -> Vec<FunctionRange> {
        let mut out: Vec<FunctionRange> = self
            .log
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| match (insn.op, insn.target) {
                (Opcode::FunctionBegin(params), Target::Label(end)) => {
                    Some(FunctionRange {
                        id: FunctionId(i),
                        begin: i,
                        end,
                        params,
                    })
                }
                _ => None,
            })
            .collect();
        out.sort_by_key(|f| std::cmp::Reverse(f.begin));
        out
    }

    /// Returns a human-readable listing of the instruction log
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let operand = |o: Operand| match o {
            Operand::None => String::new(),
            Operand::Value(v) => format!("v{}", v.index()),
            Operand::Constant(c) => format!("{:?}", self.pool.get(c)),
        };
        let mut out = String::new();
        for (i, insn) in self.log.iter().enumerate() {
            let target = match insn.target {
                Target::None => String::new(),
                Target::Value(v) => format!("v{}", v.index()),
                Target::Label(l) => format!("@{l}"),
            };
            let _ = writeln!(
                out,
                "{}{i:04} {:<10} {:>8} {:>8} {target}",
                if insn.dead { ";" } else { " " },
                insn.op.name(),
                operand(insn.a),
                operand(insn.b),
            );
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_and_defs() {
        let v = ValueId::from;
        let add = Insn::new(
            Opcode::Arith(ArithOp::Add),
            v(0).into(),
            v(1).into(),
            Target::Value(v(2)),
        );
        assert_eq!(add.def(), Some(v(2)));
        assert_eq!(add.reads().as_slice(), &[v(0), v(1)]);

        let store = Insn::new(
            Opcode::SetField,
            v(3).into(),
            v(4).into(),
            Target::Value(v(5)),
        );
        assert_eq!(store.def(), None);
        assert_eq!(store.reads().as_slice(), &[v(3), v(4), v(5)]);

        let call = Insn::new(
            Opcode::Call(2),
            v(6).into(),
            Operand::None,
            Target::Value(v(7)),
        );
        assert_eq!(call.reads().as_slice(), &[v(6)]);

        let phi = Insn::new(
            Opcode::Phi,
            v(0).into(),
            v(1).into(),
            Target::Value(v(8)),
        );
        assert!(phi.reads().is_empty());
        assert_eq!(phi.phi_inputs().as_slice(), &[v(0), v(1)]);
    }

    #[test]
    fn arith_eval() {
        assert_eq!(ArithOp::Mod.eval(5.5, 2.0), Some(1.5));
        assert_eq!(ArithOp::Mod.eval(-1.0, 3.0), Some(2.0));
        assert_eq!(ArithOp::Pow.eval(2.0, 10.0), Some(1024.0));
        assert_eq!(ArithOp::Concat.eval(1.0, 2.0), None);
        for i in 0..7 {
            assert_eq!(ArithOp::from_u8(i).map(|op| op as u8), Some(i));
        }
        assert!(CmpOp::Le.eval(1.0, 1.0));
        assert!(!CmpOp::Lt.eval(f64::NAN, 1.0));
    }
}
