//! Optimization, analysis, and register allocation
//!
//! [`lower`] runs the machine-independent passes over a parsed [`Unit`];
//! `compile` (with the `jit` feature) then allocates registers and emits a
//! native routine for each function, innermost first, so that every
//! [`Opcode::Closure`] can refer to an already-compiled function.
use crate::ir::{FunctionId, Opcode, Target, Unit, ValueId};

pub mod alloc;
pub mod liveness;
pub mod opt;
pub mod phi;
pub mod types;

use liveness::Liveness;
use types::Type;

/// Settings for compilation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompileSettings {
    /// Run the peephole and constant-folding passes
    pub optimize: bool,

    /// Number of physical registers given to the allocator
    ///
    /// Values beyond what the backend supports are clamped; `0` forces every
    /// value onto the stack.
    pub registers: usize,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            optimize: true,
            registers: 6,
        }
    }
}

/// Runs every pass up to (but not including) register allocation
///
/// The optimizer runs once on the SSA form and once more after phis have been
/// eliminated, which exposes copies between coalesced values.
pub fn lower(
    unit: &mut Unit,
    settings: &CompileSettings,
) -> (Vec<Type>, Liveness) {
    if settings.optimize {
        opt::optimize(unit);
    }
    let phis = phi::eliminate(unit);
    if settings.optimize {
        opt::optimize(unit);
    }
    let types = types::infer(unit);
    let live = liveness::analyze(unit);
    log::debug!(
        "lowered {} instructions ({} live), {} phis eliminated",
        unit.log.len(),
        unit.log.iter().filter(|i| !i.dead).count(),
        phis
    );
    (types, live)
}

/// Returns the innermost function containing each log position
///
/// Function markers belong to the function they delimit; positions outside
/// every function belong to the top level (`None`).
pub fn owners(unit: &Unit) -> Vec<Option<FunctionId>> {
    let mut out = vec![None; unit.log.len()];
    // Outer functions start first, so inner ones overwrite them
    for f in unit.functions().iter().rev() {
        for o in &mut out[f.begin..=f.end] {
            *o = Some(f.id);
        }
    }
    out
}

/// Returns the `(value, slot)` pins for a function's parameters
fn params(
    unit: &Unit,
    owner: &[Option<FunctionId>],
    function: Option<FunctionId>,
    range: std::ops::Range<usize>,
) -> Vec<(ValueId, u32)> {
    range
        .filter(|&i| owner[i] == function)
        .filter_map(|i| match (unit.log[i].op, unit.log[i].target) {
            (Opcode::Param(p), Target::Value(v)) => Some((v, p as u32)),
            _ => None,
        })
        .collect()
}

#[cfg(feature = "jit")]
mod native {
    use super::*;
    use crate::{
        Error,
        ir::ConstIndex,
        jit::{Chunk, FunctionAssembler, REGISTER_COUNT},
        runtime::{NativeFunction, State},
        value::Value,
    };
    use super::alloc::RegisterAllocator;
    use std::collections::HashMap;

    /// Compiles a parsed unit into native code owned by `state`
    ///
    /// Returns the top-level routine as a callable function value.
    pub fn compile(
        mut unit: Unit,
        state: &mut State,
        settings: &CompileSettings,
    ) -> Result<Value, Error> {
        let (types, live) = lower(&mut unit, settings);
        log::trace!("lowered unit:\n{}", unit.dump());

        let owner = owners(&unit);
        let registers = settings.registers.min(REGISTER_COUNT);
        let mut closures: HashMap<FunctionId, ConstIndex> = HashMap::new();

        let chunks = unit
            .functions()
            .into_iter()
            .map(|f| (Some(f.id), f.begin + 1, f.end, f.params))
            .chain(std::iter::once((None, 0, unit.log.len(), 0)));

        let mut top = Value::NIL;
        for (function, start, end, nparams) in chunks {
            let ranges: Vec<_> = live
                .ranges
                .iter()
                .filter(|r| owner[r.def] == function)
                .copied()
                .collect();
            let pinned = params(&unit, &owner, function, start..end);
            let alloc = RegisterAllocator::new(
                registers,
                unit.value_count,
                &pinned,
            )
            .run(&ranges);
            log::debug!(
                "{function:?}: {} values, {} registers, {} slots",
                ranges.len(),
                alloc.registers_used.len(),
                alloc.slots
            );

            let chunk = Chunk {
                unit: &unit,
                types: &types,
                alloc: &alloc,
                owner: &owner,
                function,
                start,
                end,
                params: nparams,
                closures: &closures,
            };
            let (code, entry) = FunctionAssembler::new(&chunk)?.assemble()?;
            let v = state.add_function(NativeFunction {
                entry,
                params: nparams,
                _code: code,
            });
            match function {
                Some(id) => {
                    let c = unit.pool.intern(v);
                    closures.insert(id, c);
                }
                None => top = v,
            }
        }
        Ok(top)
    }
}

#[cfg(feature = "jit")]
pub use native::compile;

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend, runtime::State};

    #[test]
    fn nested_owners() {
        let mut state = State::new();
        let unit = frontend::parse(
            "local x = 1\n             local function f(a) local function g(b) return b end return g(a) end
             return f(1)",
            &mut state,
        )
        .unwrap();
        let fs = unit.functions();
        assert_eq!(fs.len(), 2);
        let (inner, outer) = (fs[0], fs[1]);
        assert!(outer.begin < inner.begin && inner.end < outer.end);

        let owner = owners(&unit);
        assert_eq!(owner[outer.begin], Some(outer.id));
        assert_eq!(owner[inner.begin + 1], Some(inner.id));
        assert_eq!(owner[inner.end + 1], Some(outer.id));
        assert_eq!(owner[outer.end], Some(outer.id));
        assert_eq!(owner[outer.end + 1], None);
        assert_eq!(owner[0], None);

        let pins = params(&unit, &owner, Some(inner.id), inner.begin..inner.end);
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].1, 0);
    }

    #[test]
    fn lowering_leaves_no_phis() {
        let mut state = State::new();
        let mut unit = frontend::parse(
            "local s = 0 for i = 1, 10 do if i % 2 == 0 then s = s + i end end return s",
            &mut state,
        )
        .unwrap();
        assert!(unit.log.iter().any(|i| i.op == Opcode::Phi));
        let (types, live) = lower(&mut unit, &CompileSettings::default());
        assert!(unit.log.iter().all(|i| i.op != Opcode::Phi || i.dead));
        assert_eq!(types.len(), unit.value_count);
        assert_eq!(live.last_use.len(), unit.value_count);
    }
}
