use super::liveness::LiveRange;
use crate::ir::ValueId;

use arrayvec::ArrayVec;

/// Maximum number of physical registers handed to the allocator
pub const MAX_REGISTERS: usize = 16;

/// Storage assigned to a value for its whole lifetime
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Index into the register list passed to [`RegisterAllocator::new`]
    Register(u8),
    /// Spill slot in the function's frame
    Slot(u32),
    /// The value is never read, so its result can be discarded
    Unassigned,
}

/// Output of linear-scan allocation for one chunk
#[derive(Debug)]
pub struct Allocation {
    /// Location of each value, indexed by value id
    pub locations: Vec<Location>,
    /// Which registers were handed out at least once
    pub registers_used: Vec<u8>,
    /// Total spill slots, including pinned parameter slots
    pub slots: u32,
}

impl Allocation {
    pub fn get(&self, v: ValueId) -> Location {
        self.locations[v.index()]
    }
}

/// Linear-scan register allocator
///
/// Values are visited in order of their definition.  Each one takes over a
/// register whose previous occupant is already dead, or else an unused
/// register; when every register is busy, whichever candidate (new value or
/// resident) lives longest is sent to a fresh spill slot.
pub struct RegisterAllocator {
    locations: Vec<Location>,

    /// Current occupant of each register, with its last use
    active: ArrayVec<Option<(ValueId, usize)>, MAX_REGISTERS>,

    used: ArrayVec<bool, MAX_REGISTERS>,

    /// Next spill slot to hand out
    ///
    /// Slots are never reused, so spilled values can't collide.
    next_slot: u32,
}

impl RegisterAllocator {
    /// Builds a new allocator with `registers` physical registers
    ///
    /// `pinned` values (function parameters) are bound to the given spill
    /// slots before allocation starts; fresh slots are numbered after them.
    ///
    /// # Panics
    /// If `registers > MAX_REGISTERS`
    pub fn new(
        registers: usize,
        value_count: usize,
        pinned: &[(ValueId, u32)],
    ) -> Self {
        assert!(registers <= MAX_REGISTERS);
        let mut locations = vec![Location::Unassigned; value_count];
        let mut next_slot = 0;
        for &(v, slot) in pinned {
            locations[v.index()] = Location::Slot(slot);
            next_slot = next_slot.max(slot + 1);
        }
        Self {
            locations,
            active: (0..registers).map(|_| None).collect(),
            used: (0..registers).map(|_| false).collect(),
            next_slot,
        }
    }

    fn spill(&mut self) -> Location {
        let s = self.next_slot;
        self.next_slot += 1;
        Location::Slot(s)
    }

    fn bind(&mut self, reg: usize, r: &LiveRange, last: usize) {
        self.active[reg] = Some((r.id, last));
        self.used[reg] = true;
        self.locations[r.id.index()] = Location::Register(reg as u8);
    }

    /// Allocates a single value
    fn step(&mut self, r: &LiveRange) {
        if self.locations[r.id.index()] != Location::Unassigned {
            return; // pinned
        }
        let Some(last) = r.last_use else {
            return;
        };

        let expired = self
            .active
            .iter()
            .position(|a| matches!(a, Some((_, end)) if *end < r.def));
        let free = expired
            .or_else(|| self.active.iter().position(|a| a.is_none()));
        if let Some(reg) = free {
            self.bind(reg, r, last);
            return;
        }

        let victim = self
            .active
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.map(|(v, end)| (i, v, end)))
            .max_by_key(|(_, _, end)| *end);
        match victim {
            Some((reg, v, end)) if end > last => {
                self.locations[v.index()] = self.spill();
                self.bind(reg, r, last);
            }
            _ => self.locations[r.id.index()] = self.spill(),
        }
    }

    /// Runs allocation over live ranges sorted by definition position
    pub fn run(mut self, ranges: &[LiveRange]) -> Allocation {
        for r in ranges {
            self.step(r);
        }
        Allocation {
            locations: self.locations,
            registers_used: self
                .used
                .iter()
                .enumerate()
                .filter(|(_, u)| **u)
                .map(|(i, _)| i as u8)
                .collect(),
            slots: self.next_slot,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn range(id: usize, def: usize, last: Option<usize>) -> LiveRange {
        LiveRange {
            id: ValueId::from(id),
            def,
            last_use: last,
        }
    }

    #[test]
    fn reuse_dead_register() {
        let ranges = [
            range(0, 0, Some(1)),
            range(1, 1, Some(3)),
            range(2, 2, Some(3)), // v0 is dead by now
        ];
        let a = RegisterAllocator::new(2, 3, &[]).run(&ranges);
        assert_eq!(a.get(ValueId::from(0)), Location::Register(0));
        assert_eq!(a.get(ValueId::from(1)), Location::Register(1));
        assert_eq!(a.get(ValueId::from(2)), Location::Register(0));
        assert_eq!(a.slots, 0);
    }

    #[test]
    fn spill_furthest() {
        let ranges = [
            range(0, 0, Some(10)),
            range(1, 1, Some(3)),
            range(2, 2, Some(4)),
        ];
        let a = RegisterAllocator::new(2, 3, &[]).run(&ranges);
        // v0 lives longest, so it's evicted in favor of v2
        assert_eq!(a.get(ValueId::from(0)), Location::Slot(0));
        assert_eq!(a.get(ValueId::from(1)), Location::Register(1));
        assert_eq!(a.get(ValueId::from(2)), Location::Register(0));

        let ranges = [
            range(0, 0, Some(3)),
            range(1, 1, Some(3)),
            range(2, 2, Some(10)),
        ];
        let a = RegisterAllocator::new(2, 3, &[]).run(&ranges);
        // the new value lives longest, so it goes straight to memory
        assert_eq!(a.get(ValueId::from(2)), Location::Slot(0));
    }

    #[test]
    fn unread_and_pinned() {
        let ranges = [range(0, 0, Some(5)), range(1, 1, None)];
        let a = RegisterAllocator::new(0, 2, &[(ValueId::from(0), 0)])
            .run(&ranges);
        assert_eq!(a.get(ValueId::from(0)), Location::Slot(0));
        assert_eq!(a.get(ValueId::from(1)), Location::Unassigned);
        assert_eq!(a.slots, 1);
        assert!(a.registers_used.is_empty());
    }

    #[test]
    fn no_overlapping_storage() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1234);
        for registers in 0..=4 {
            for _ in 0..50 {
                let count = rng.gen_range(1..40);
                let mut ranges: Vec<_> = (0..count)
                    .map(|i| {
                        let def = rng.gen_range(0..60);
                        let last = rng.gen_bool(0.9).then(|| {
                            def + rng.gen_range(0..20)
                        });
                        range(i, def, last)
                    })
                    .collect();
                ranges.sort_by_key(|r| (r.def, r.id));
                let a = RegisterAllocator::new(registers, count, &[])
                    .run(&ranges);

                for (i, x) in ranges.iter().enumerate() {
                    for y in &ranges[i + 1..] {
                        let (Some(xe), Some(ye)) = (x.last_use, y.last_use)
                        else {
                            continue;
                        };
                        let overlap = x.def <= ye && y.def <= xe;
                        if overlap {
                            assert_ne!(
                                a.get(x.id),
                                a.get(y.id),
                                "{x:?} and {y:?} share storage"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Runs the allocator over every chunk of real programs, where values
    /// may be written in several places once phis are eliminated
    #[test]
    fn lowered_programs_never_share_storage() {
        use crate::{
            compiler::{self, CompileSettings},
            frontend,
            runtime::State,
        };

        let programs = [
            "local x = 0 print(x) local y = 5 if true then x = 7 end return y",
            "local x = 0 print(x) local y = #\"hello\" local i = 0
             while i < 2 do i = i + 1 if i > 0 then x = tostring(i) end end
             return y",
            "local a = 1 local b = 2 a = 3 b = a + b a = 4 return b",
            "local x = 0 if c then x = 1 elseif d then x = 2 else x = 3 end
             return x",
            "local s = 0
             for i = 1, 4 do
                 local j = 0
                 while j < i do s = s + j j = j + 1 end
                 if s > 3 then break end
             end
             return s",
            "local i = 0 repeat local d = i * 2 i = i + 1 until d >= 6
             return i",
            "local function f(a, b)
                 local t = a
                 if b then t = b end
                 local u = a or b
                 return t + u
             end
             return f(1, 2)",
        ];

        for src in programs {
            for optimize in [false, true] {
                let mut state = State::new();
                let mut unit = frontend::parse(src, &mut state).unwrap();
                let settings = CompileSettings {
                    optimize,
                    registers: 6,
                };
                let (_, live) = compiler::lower(&mut unit, &settings);
                let owner = compiler::owners(&unit);

                let chunks = unit
                    .functions()
                    .into_iter()
                    .map(|f| (Some(f.id), f.begin + 1, f.end))
                    .chain(std::iter::once((None, 0, unit.log.len())));
                for (function, start, end) in chunks {
                    let ranges: Vec<_> = live
                        .ranges
                        .iter()
                        .filter(|r| owner[r.def] == function)
                        .copied()
                        .collect();
                    let pinned =
                        compiler::params(&unit, &owner, function, start..end);

                    for registers in 0..=6 {
                        let a = RegisterAllocator::new(
                            registers,
                            unit.value_count,
                            &pinned,
                        )
                        .run(&ranges);

                        for p in start..end {
                            let insn = unit.log[p];
                            if insn.dead || owner[p] != function {
                                continue;
                            }
                            for v in insn.reads().into_iter().chain(insn.def())
                            {
                                let loc = a.get(v);
                                if loc == Location::Unassigned {
                                    continue;
                                }
                                for w in &ranges {
                                    let Some(last) = w.last_use else {
                                        continue;
                                    };
                                    if w.id != v && (w.def..=last).contains(&p)
                                    {
                                        assert_ne!(
                                            a.get(w.id),
                                            loc,
                                            "{v:?} and {w:?} share storage \
                                             at {p} ({registers} registers) \
                                             in {src:?}\n{}",
                                            unit.dump()
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
