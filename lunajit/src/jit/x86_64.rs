use super::{CodeBuffer, Fixup, Mmap, rel32};
use crate::{
    Error,
    compiler::{
        alloc::{Allocation, Location},
        types::{self, Type},
    },
    ir::{
        ArithOp, CmpOp, ConstIndex, FunctionId, Insn, Opcode, Operand, Target,
        UnaryOp, Unit,
    },
    runtime::{NativeEntry, helpers},
    value::Value,
};
use dynasmrt::{DynasmApi, dynasm};
use std::collections::HashMap;

/// Callee-saved registers available to the allocator, in allocation order
///
/// | Index | Register |
/// |-------|----------|
/// | 0     | `rbx`    |
/// | 1     | `rbp`    |
/// | 2     | `r12`    |
/// | 3     | `r13`    |
/// | 4     | `r14`    |
/// | 5     | `r15`    |
///
/// Everything else is scratch: operands are staged in `rax`, `rcx`, `rdx`,
/// `rsi`, and `rdi` (matching the helper argument order) and in `xmm0` /
/// `xmm1` for inline floating-point math.
const REGISTERS: [u8; 6] = [3, 5, 12, 13, 14, 15];

/// Number of registers that values can be allocated into
pub(crate) const REGISTER_COUNT: usize = REGISTERS.len();

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSI: u8 = 6;

// Condition codes for `0F 8x` near jumps
const JB: u8 = 0x82;
const JAE: u8 = 0x83;
const JE: u8 = 0x84;
const JNE: u8 = 0x85;
const JBE: u8 = 0x86;
const JA: u8 = 0x87;

/// Everything needed to emit one routine
pub(crate) struct Chunk<'a> {
    pub unit: &'a Unit,
    pub types: &'a [Type],
    pub alloc: &'a Allocation,
    /// Owning function of each log position (`None` for the top level)
    pub owner: &'a [Option<FunctionId>],
    /// Function being emitted (`None` for the top level)
    pub function: Option<FunctionId>,
    /// Log positions `start..end` make up the routine's body
    pub start: usize,
    pub end: usize,
    pub params: u8,
    /// Pool entries holding nested functions that have already been compiled
    pub closures: &'a HashMap<FunctionId, ConstIndex>,
}

/// Single-routine assembler for `x86_64` (System V calling convention)
///
/// On entry, `rdi` holds the `*mut State` and `rsi` points to the argument
/// array.  The stack is laid out as follows, relative to `rsp` after the
/// prologue (`A` is the largest argument count of any call in the body):
///
/// ```text
/// | Position         | Value                                           |
/// |------------------|-------------------------------------------------|
/// | ...              | Saved callee-saved registers, return address    |
/// |------------------|-------------------------------------------------|
/// | 8 * (A + 1 + s)  | Spill slot `s` (parameters occupy the first)    |
/// |------------------|-------------------------------------------------|
/// | 8 * A            | `*mut State`                                    |
/// |------------------|-------------------------------------------------|
/// | 0 .. 8 * A       | Outgoing arguments for `call_value`             |
/// ```
///
/// The frame is padded so that `rsp` is 16-byte aligned at every helper call.
pub(crate) struct FunctionAssembler<'a> {
    ops: CodeBuffer,
    chunk: &'a Chunk<'a>,

    /// Code offset of each log position, once emitted
    ///
    /// Indexed by absolute log position; `end` is the fall-through exit
    /// (returning `nil`) and `end + 1` is the shared epilogue.
    offsets: Vec<Option<usize>>,
    fixups: Vec<Fixup>,

    max_args: usize,
    frame: i32,
    next_arg: usize,
}

impl<'a> FunctionAssembler<'a> {
    pub fn new(chunk: &'a Chunk<'a>) -> Result<Self, Error> {
        let max_args = chunk.unit.log[chunk.start..chunk.end]
            .iter()
            .enumerate()
            .filter(|(i, insn)| {
                !insn.dead && chunk.owner[chunk.start + i] == chunk.function
            })
            .filter_map(|(_, insn)| match insn.op {
                Opcode::Call(n) => Some(n as usize),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let slots = (chunk.alloc.slots as usize).max(chunk.params as usize);
        let saved = chunk.alloc.registers_used.len();

        // Return address + saved registers + frame must be a multiple of 16
        let mut frame = 8 * (max_args + 1 + slots);
        if (8 + 8 * saved + frame) % 16 != 0 {
            frame += 8;
        }

        Ok(Self {
            ops: CodeBuffer::new()?,
            chunk,
            offsets: vec![None; chunk.end + 2],
            fixups: vec![],
            max_args,
            frame: frame as i32,
            next_arg: 0,
        })
    }

    fn state_offset(&self) -> i32 {
        8 * self.max_args as i32
    }

    fn slot_offset(&self, slot: u32) -> i32 {
        8 * (self.max_args as i32 + 1 + slot as i32)
    }

    fn is_number(&self, op: Operand) -> bool {
        types::operand_type(op, &self.chunk.unit.pool, self.chunk.types)
            .is_number()
    }

    fn load_imm(&mut self, dst: u8, v: Value) {
        dynasm!(self.ops
            ; mov Rq(dst), QWORD v.to_bits() as i64
        );
    }

    /// Loads an operand into a scratch register
    fn load(&mut self, dst: u8, op: Operand) {
        match op {
            Operand::None => self.load_imm(dst, Value::NIL),
            Operand::Constant(c) => {
                let v = self.chunk.unit.pool.get(c);
                self.load_imm(dst, v);
            }
            Operand::Value(v) => match self.chunk.alloc.get(v) {
                Location::Register(r) => {
                    let src = REGISTERS[r as usize];
                    dynasm!(self.ops
                        ; mov Rq(dst), Rq(src)
                    );
                }
                Location::Slot(s) => {
                    let off = self.slot_offset(s);
                    dynasm!(self.ops
                        ; mov Rq(dst), QWORD [rsp + off]
                    );
                }
                // Never defined in this routine
                Location::Unassigned => self.load_imm(dst, Value::NIL),
            },
        }
    }

    /// Stores `rax` into the target's location
    fn store(&mut self, t: Target) {
        let Some(v) = t.value() else {
            return;
        };
        match self.chunk.alloc.get(v) {
            Location::Register(r) => {
                let dst = REGISTERS[r as usize];
                dynasm!(self.ops
                    ; mov Rq(dst), rax
                );
            }
            Location::Slot(s) => {
                let off = self.slot_offset(s);
                dynasm!(self.ops
                    ; mov QWORD [rsp + off], rax
                );
            }
            Location::Unassigned => (),
        }
    }

    /// Calls a runtime helper, passing the state pointer in `rdi`
    ///
    /// The remaining arguments must already be in `rsi`, `rdx`, and `rcx`.
    fn call_helper(&mut self, f: usize) {
        let off = self.state_offset();
        dynasm!(self.ops
            ; mov rdi, QWORD [rsp + off]
            ; mov rax, QWORD f as i64
            ; call rax
        );
    }

    /// Emits a near branch with the given opcode bytes to a log position
    fn branch(&mut self, opcode: &[u8], target: usize) {
        self.ops.extend(opcode);
        let at = self.ops.offset().0;
        let rel = match self.offsets[target] {
            Some(dest) => rel32(at, dest),
            None => {
                self.fixups.push(Fixup { at, target });
                0
            }
        };
        self.ops.push_i32(rel);
    }

    fn branch_target(&self, t: Target) -> usize {
        t.label().expect("branch without a destination")
    }

    fn prologue(&mut self) {
        for &r in &self.chunk.alloc.registers_used {
            let r = REGISTERS[r as usize];
            dynasm!(self.ops
                ; push Rq(r)
            );
        }
        let frame = self.frame;
        let state = self.state_offset();
        dynasm!(self.ops
            ; sub rsp, frame
            ; mov QWORD [rsp + state], rdi
        );
        for i in 0..self.chunk.params {
            let src = 8 * i as i32;
            let dst = self.slot_offset(i as u32);
            dynasm!(self.ops
                ; mov rax, QWORD [rsi + src]
                ; mov QWORD [rsp + dst], rax
            );
        }
    }

    fn epilogue(&mut self) {
        let frame = self.frame;
        dynasm!(self.ops
            ; add rsp, frame
        );
        for &r in self.chunk.alloc.registers_used.iter().rev() {
            let r = REGISTERS[r as usize];
            dynasm!(self.ops
                ; pop Rq(r)
            );
        }
        dynasm!(self.ops
            ; ret
        );
    }

    fn build_arith(&mut self, op: ArithOp, insn: &Insn) {
        let inline = matches!(
            op,
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div
        ) && self.is_number(insn.a)
            && self.is_number(insn.b);
        if inline {
            self.load(RAX, insn.a);
            dynasm!(self.ops
                ; movq xmm0, rax
            );
            self.load(RAX, insn.b);
            dynasm!(self.ops
                ; movq xmm1, rax
            );
            match op {
                ArithOp::Add => dynasm!(self.ops ; addsd xmm0, xmm1),
                ArithOp::Sub => dynasm!(self.ops ; subsd xmm0, xmm1),
                ArithOp::Mul => dynasm!(self.ops ; mulsd xmm0, xmm1),
                ArithOp::Div => dynasm!(self.ops ; divsd xmm0, xmm1),
                _ => unreachable!(),
            }
            dynasm!(self.ops
                ; movq rax, xmm0
            );
        } else {
            self.load(RSI, insn.a);
            self.load(RDX, insn.b);
            dynasm!(self.ops
                ; mov ecx, op as u8 as i32
            );
            self.call_helper(helpers::arith as *const () as usize);
        }
        self.store(insn.target);
    }

    fn build_branch_cmp(
        &mut self,
        cmp: CmpOp,
        when: bool,
        insn: &Insn,
    ) {
        let ordered = matches!(cmp, CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge);
        let target = self.branch_target(insn.target);
        if ordered && self.is_number(insn.a) && self.is_number(insn.b) {
            self.load(RAX, insn.a);
            dynasm!(self.ops
                ; movq xmm0, rax
            );
            self.load(RAX, insn.b);
            dynasm!(self.ops
                ; movq xmm1, rax
            );
            // `a < b` is tested as `b > a`, so that an unordered result
            // (either side is NaN) reads as false
            match cmp {
                CmpOp::Lt | CmpOp::Le => dynasm!(self.ops ; ucomisd xmm1, xmm0),
                _ => dynasm!(self.ops ; ucomisd xmm0, xmm1),
            }
            let strict = matches!(cmp, CmpOp::Lt | CmpOp::Gt);
            let cc = match (strict, when) {
                (true, true) => JA,
                (true, false) => JBE,
                (false, true) => JAE,
                (false, false) => JB,
            };
            self.branch(&[0x0f, cc], target);
        } else {
            self.load(RSI, insn.a);
            self.load(RDX, insn.b);
            dynasm!(self.ops
                ; mov ecx, cmp as u8 as i32
            );
            self.call_helper(helpers::compare as *const () as usize);
            self.load_imm(RCX, Value::TRUE);
            dynasm!(self.ops
                ; cmp rax, rcx
            );
            self.branch(&[0x0f, if when { JE } else { JNE }], target);
        }
    }

    fn build(&mut self, i: usize) {
        let insn = self.chunk.unit.log[i];
        match insn.op {
            Opcode::Copy => {
                if let (Some(src), Some(dst)) = (insn.a.value(), insn.target.value())
                {
                    let (src, dst) =
                        (self.chunk.alloc.get(src), self.chunk.alloc.get(dst));
                    if src == dst {
                        return;
                    }
                }
                self.load(RAX, insn.a);
                self.store(insn.target);
            }
            Opcode::Arith(op) => self.build_arith(op, &insn),
            Opcode::Unary(UnaryOp::Neg) if self.is_number(insn.a) => {
                // Flip the sign bit
                self.load(RAX, insn.a);
                dynasm!(self.ops
                    ; mov rcx, QWORD i64::MIN
                    ; xor rax, rcx
                );
                self.store(insn.target);
            }
            Opcode::Unary(op) => {
                self.load(RSI, insn.a);
                dynasm!(self.ops
                    ; mov edx, op as u8 as i32
                );
                self.call_helper(helpers::unary as *const () as usize);
                self.store(insn.target);
            }
            Opcode::Compare(cmp) => {
                self.load(RSI, insn.a);
                self.load(RDX, insn.b);
                dynasm!(self.ops
                    ; mov ecx, cmp as u8 as i32
                );
                self.call_helper(helpers::compare as *const () as usize);
                self.store(insn.target);
            }
            Opcode::NewTable => {
                self.call_helper(helpers::new_table as *const () as usize);
                self.store(insn.target);
            }
            Opcode::GetField => {
                self.load(RSI, insn.a);
                self.load(RDX, insn.b);
                self.call_helper(helpers::get_field as *const () as usize);
                self.store(insn.target);
            }
            Opcode::SetField => {
                let table = insn.target.value().map(Operand::Value);
                self.load(RSI, table.unwrap_or_default());
                self.load(RDX, insn.a);
                self.load(RCX, insn.b);
                self.call_helper(helpers::set_field as *const () as usize);
            }
            Opcode::GetGlobal => {
                self.load(RSI, insn.a);
                self.call_helper(helpers::get_global as *const () as usize);
                self.store(insn.target);
            }
            Opcode::SetGlobal => {
                self.load(RSI, insn.a);
                self.load(RDX, insn.b);
                self.call_helper(helpers::set_global as *const () as usize);
            }
            Opcode::Arg => {
                let off = 8 * self.next_arg as i32;
                self.load(RAX, insn.a);
                dynasm!(self.ops
                    ; mov QWORD [rsp + off], rax
                );
                self.next_arg += 1;
            }
            Opcode::Call(n) => {
                self.load(RSI, insn.a);
                dynasm!(self.ops
                    ; mov edx, n as i32
                    ; mov rcx, rsp
                );
                self.call_helper(helpers::call_value as *const () as usize);
                self.store(insn.target);
                self.next_arg = 0;
            }
            Opcode::Ret => {
                self.load(RAX, insn.a);
                let epilogue = self.chunk.end + 1;
                self.branch(&[0xe9], epilogue);
            }
            Opcode::Jump => {
                let target = self.branch_target(insn.target);
                self.branch(&[0xe9], target);
            }
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                // `nil` and `false` differ only in their lowest bit
                let target = self.branch_target(insn.target);
                self.load(RAX, insn.a);
                let falsy = (Value::NIL.to_bits() >> 1) as i64;
                dynasm!(self.ops
                    ; mov rcx, QWORD falsy
                    ; shr rax, 1
                    ; cmp rax, rcx
                );
                let cc = if insn.op == Opcode::JumpIfFalse { JE } else { JNE };
                self.branch(&[0x0f, cc], target);
            }
            Opcode::BranchCmp { cmp, when } => {
                self.build_branch_cmp(cmp, when, &insn)
            }
            Opcode::Closure(f) => {
                let c = self.chunk.closures[&f];
                self.load(RAX, Operand::Constant(c));
                self.store(insn.target);
            }
            // Parameters are copied into their slots by the prologue
            Opcode::Param(..) => (),
            Opcode::Phi
            | Opcode::LoopBegin
            | Opcode::LoopEnd
            | Opcode::FunctionBegin(..)
            | Opcode::FunctionEnd => (),
        }
    }

    /// Emits the whole routine, returning its memory and entry point
    pub fn assemble(mut self) -> Result<(Mmap, NativeEntry), Error> {
        self.prologue();
        for i in self.chunk.start..self.chunk.end {
            self.offsets[i] = Some(self.ops.offset().0);
            let insn = &self.chunk.unit.log[i];
            if insn.dead || self.chunk.owner[i] != self.chunk.function {
                continue;
            }
            self.build(i);
        }

        let end = self.chunk.end;
        self.offsets[end] = Some(self.ops.offset().0);
        self.load_imm(RAX, Value::NIL);
        self.offsets[end + 1] = Some(self.ops.offset().0);
        self.epilogue();

        for f in std::mem::take(&mut self.fixups) {
            let dest = self.offsets[f.target]
                .unwrap_or_else(|| panic!("branch to unemitted position {}", f.target));
            self.ops.patch_i32(f.at, rel32(f.at, dest));
        }
        log::trace!(
            "assembled {:?}: {} bytes, {} byte frame",
            self.chunk.function,
            self.ops.offset().0,
            self.frame
        );

        let mmap = self.ops.finalize()?;
        // SAFETY: the map holds a complete routine following the
        // `NativeEntry` calling convention, starting at its first byte
        let entry = unsafe {
            std::mem::transmute::<*const std::ffi::c_void, NativeEntry>(
                mmap.as_ptr(),
            )
        };
        Ok((mmap, entry))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        CompileSettings,
        compiler::{self, alloc::RegisterAllocator},
        frontend,
        runtime::State,
    };

    /// Builds an assembler for the top level of `src` and passes it to `f`
    fn with_top_level<F>(src: &str, registers: usize, f: F)
    where
        F: FnOnce(FunctionAssembler),
    {
        let mut state = State::new();
        let mut unit = frontend::parse(src, &mut state).unwrap();
        let (types, live) =
            compiler::lower(&mut unit, &CompileSettings::default());
        let owner = compiler::owners(&unit);
        let ranges: Vec<_> = live
            .ranges
            .iter()
            .filter(|r| owner[r.def].is_none())
            .copied()
            .collect();
        let alloc = RegisterAllocator::new(registers, unit.value_count, &[])
            .run(&ranges);
        let closures = HashMap::new();
        let chunk = Chunk {
            unit: &unit,
            types: &types,
            alloc: &alloc,
            owner: &owner,
            function: None,
            start: 0,
            end: unit.log.len(),
            params: 0,
            closures: &closures,
        };
        f(FunctionAssembler::new(&chunk).unwrap());
    }

    #[test]
    fn frame_is_aligned() {
        for registers in 0..=REGISTER_COUNT {
            with_top_level(
                "local a = 1 local b = a + 2 print(a, b, a * b) return b",
                registers,
                |asm| {
                    let saved = asm.chunk.alloc.registers_used.len() as i32;
                    assert_eq!((8 + 8 * saved + asm.frame) % 16, 0);
                    assert_eq!(asm.max_args, 3);
                    assert!(asm.frame >= 8 * 4);
                },
            );
        }
    }

    #[test]
    fn forward_branches_are_patched() {
        with_top_level(
            "local x = 0 if x < 1 then x = 2 else x = 3 end return x",
            REGISTER_COUNT,
            |mut asm| {
                asm.prologue();
                for i in asm.chunk.start..asm.chunk.end {
                    asm.offsets[i] = Some(asm.ops.offset().0);
                    if !asm.chunk.unit.log[i].dead {
                        asm.build(i);
                    }
                }
                let end = asm.chunk.end;
                asm.offsets[end] = Some(asm.ops.offset().0);
                asm.offsets[end + 1] = Some(asm.ops.offset().0);
                assert!(!asm.fixups.is_empty());

                for f in std::mem::take(&mut asm.fixups) {
                    let dest = asm.offsets[f.target].unwrap();
                    asm.ops.patch_i32(f.at, rel32(f.at, dest));
                    let code = asm.ops.code();
                    let rel = i32::from_le_bytes(
                        code[f.at..f.at + 4].try_into().unwrap(),
                    );
                    assert_eq!(f.at as i64 + 4 + rel as i64, dest as i64);
                }
            },
        );
    }

    #[test]
    fn helper_calls_embed_entry_points() {
        with_top_level("print(1)", REGISTER_COUNT, |mut asm| {
            asm.prologue();
            for i in asm.chunk.start..asm.chunk.end {
                asm.offsets[i] = Some(asm.ops.offset().0);
                if !asm.chunk.unit.log[i].dead {
                    asm.build(i);
                }
            }
            let code = asm.ops.code();
            for f in [
                helpers::get_global as *const () as usize,
                helpers::call_value as *const () as usize,
            ] {
                let bytes = (f as u64).to_le_bytes();
                assert!(
                    code.windows(8).any(|w| w == bytes),
                    "missing helper address {f:#x}"
                );
            }
        });
    }

    #[test]
    fn compiled_top_level_runs() {
        for registers in [0, 2, REGISTER_COUNT] {
            let mut state = State::new();
            let settings = CompileSettings {
                optimize: true,
                registers,
            };
            let f = state
                .load_with(
                    "local x = 0 if x < 1 then x = 2 else x = 3 end return x",
                    &settings,
                )
                .unwrap();
            let v = state.call(f, &[]).unwrap();
            assert_eq!(v.as_number(), Some(2.0));
        }
    }
}
