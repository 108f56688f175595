//! Linear-scan register allocation with live-interval splitting.
//!
//! Intervals are built from a sequential numbering of every IR across
//! the function's blocks, extended across jumps by block live-in/out
//! sets. Allocation runs separately for the integer and floating-point
//! register files. Spilling inserts `LoadSpilled`/`StoreSpilled`
//! bracketing through fresh no-spill temporaries, which itself creates
//! vregs, so the whole procedure iterates to a fixed point (typically
//! two rounds).

use std::collections::HashSet;

use crate::ids::{BBId, VRegId};

use super::{FuncIr, Ir, IrKind, VRegFlags};

/// Target description consumed by the allocator.
pub struct RegAllocConfig {
    /// Number of allocatable integer registers.
    pub phys_max: usize,
    /// Low range reserved as scratch; skipped unless parameter
    /// constraints demand it.
    pub temporary_count: usize,
    /// Integer argument index to allocator register index; `NO_PHYS`
    /// marks argument registers outside the allocatable set.
    pub reg_param_map: &'static [usize],
    /// Caller-saved integer registers as a bitmask over allocator
    /// indices.
    pub caller_saved: u64,

    pub fphys_max: usize,
    pub ftemporary_count: usize,
    /// Number of floating-point argument registers (identity mapped).
    pub freg_param_count: usize,
    pub fcaller_saved: u64,
}

pub const NO_PHYS: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntervalState {
    Normal,
    Const,
    Spilled,
}

/// The live range of one vreg, in IR indices.
#[derive(Clone, Copy, Debug)]
pub struct LiveInterval {
    pub virt: VRegId,
    pub start: i32,
    pub end: i32,
    pub phys: Option<usize>,
    pub state: IntervalState,
    /// Physical registers occupied at some point inside this interval
    /// by argument passing or call clobbers.
    pub occupied: u64,
}

/// Allocate physical registers for one function. Returns the final
/// per-vreg intervals (indexed by vreg).
pub fn allocate(func: &mut FuncIr, config: &RegAllocConfig) -> Vec<LiveInterval> {
    loop {
        analyze_liveness(func);
        let mut intervals = build_intervals(func);

        let mut sorted: Vec<usize> = (0..intervals.len()).collect();
        sorted.sort_by(|&a, &b| {
            intervals[a]
                .start
                .cmp(&intervals[b].start)
                .then(intervals[b].end.cmp(&intervals[a].end))
        });

        detect_occupancy(func, &mut intervals, config);
        let (used, fused) = linear_scan(func, &mut intervals, &sorted, config);
        func.used_regs = used;
        func.used_fregs = fused;

        // Materialize spill decisions as frame slots.
        for li in &intervals {
            if li.state != IntervalState::Spilled {
                continue;
            }
            let vreg = &mut func.vregs[li.virt];
            if vreg.flags.contains(VRegFlags::SPILLED) {
                continue;
            }
            debug_assert!(
                !vreg.flags.contains(VRegFlags::NO_SPILL),
                "no-spill temporary was spilled"
            );
            vreg.flags |= VRegFlags::SPILLED;
            vreg.phys = None;
            let size = vreg.vtype.size.max(1);
            let align = vreg.vtype.align.max(1);
            let slot = func.add_frame_slot(size, align);
            func.vregs[li.virt].frame_slot = Some(slot);
        }

        if insert_spill_irs(func) == 0 {
            // Publish the assignment.
            for li in &intervals {
                if li.state == IntervalState::Normal {
                    func.vregs[li.virt].phys = li.phys;
                }
            }
            return intervals;
        }
    }
}

// ----------------------------------------------------------------------
// Liveness
// ----------------------------------------------------------------------

/// Iterative backward dataflow filling each block's in/out vreg sets.
pub fn analyze_liveness(func: &mut FuncIr) {
    let order = func.bbcon.order.clone();
    let n = order.len();

    let mut uses: Vec<HashSet<VRegId>> = Vec::with_capacity(n);
    let mut defs: Vec<HashSet<VRegId>> = Vec::with_capacity(n);
    let mut succs: Vec<Vec<usize>> = Vec::with_capacity(n);
    let pos_of = |bb: BBId| order.iter().position(|&b| b == bb);

    for (i, &bb) in order.iter().enumerate() {
        let mut use_set = HashSet::new();
        let mut def_set = HashSet::new();
        let mut targets: Vec<usize> = Vec::new();
        let mut falls_through = true;

        for ir in &func.bbcon.pool[bb].irs {
            for opr in [ir.opr1, ir.opr2].into_iter().flatten() {
                if func.vregs[opr].is_const() {
                    continue;
                }
                if !def_set.contains(&opr) {
                    use_set.insert(opr);
                }
            }
            if let Some(dst) = ir.dst {
                if !func.vregs[dst].is_const() {
                    def_set.insert(dst);
                }
            }
            for target in ir.branch_targets() {
                if let Some(p) = pos_of(target) {
                    if !targets.contains(&p) {
                        targets.push(p);
                    }
                }
            }
            if ir.is_unconditional_branch() {
                falls_through = false;
            }
        }
        if falls_through && i + 1 < n {
            targets.push(i + 1);
        }

        uses.push(use_set);
        defs.push(def_set);
        succs.push(targets);
    }

    let mut ins: Vec<HashSet<VRegId>> = vec![HashSet::new(); n];
    let mut outs: Vec<HashSet<VRegId>> = vec![HashSet::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..n).rev() {
            let mut out = HashSet::new();
            for &s in &succs[i] {
                out.extend(ins[s].iter().copied());
            }
            let mut inn: HashSet<VRegId> = uses[i].clone();
            for &v in &out {
                if !defs[i].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != outs[i] || inn != ins[i] {
                outs[i] = out;
                ins[i] = inn;
                changed = true;
            }
        }
    }

    for (i, &bb) in order.iter().enumerate() {
        let mut in_regs: Vec<VRegId> = ins[i].iter().copied().collect();
        let mut out_regs: Vec<VRegId> = outs[i].iter().copied().collect();
        in_regs.sort_unstable();
        out_regs.sort_unstable();
        func.bbcon.pool[bb].in_regs = in_regs;
        func.bbcon.pool[bb].out_regs = out_regs;
    }
}

fn build_intervals(func: &FuncIr) -> Vec<LiveInterval> {
    let mut intervals: Vec<LiveInterval> = (0..func.vregs.len())
        .map(|i| LiveInterval {
            virt: VRegId::new(i as u32),
            start: -1,
            end: -1,
            phys: None,
            state: IntervalState::Normal,
            occupied: 0,
        })
        .collect();

    let extend = |intervals: &mut Vec<LiveInterval>, regs: &[VRegId], nip: i32, func: &FuncIr| {
        for &v in regs {
            let li = &mut intervals[v.index()];
            if !func.vregs[v].flags.contains(VRegFlags::PARAM)
                && (li.start < 0 || li.start > nip)
            {
                li.start = nip;
            }
            if li.end < nip {
                li.end = nip;
            }
        }
    };

    let mut nip = 0i32;
    for &bb in &func.bbcon.order {
        let block = &func.bbcon.pool[bb];
        extend(&mut intervals, &block.in_regs, nip, func);

        for ir in &block.irs {
            for v in [ir.dst, ir.opr1, ir.opr2].into_iter().flatten() {
                if func.vregs[v].is_const() {
                    continue;
                }
                let li = &mut intervals[v.index()];
                if li.start < 0 && !func.vregs[v].flags.contains(VRegFlags::PARAM) {
                    li.start = nip;
                }
                if li.end < nip {
                    li.end = nip;
                }
            }
            nip += 1;
        }

        extend(&mut intervals, &block.out_regs, nip, func);
    }

    for li in intervals.iter_mut() {
        let vreg = &func.vregs[li.virt];
        if vreg.flags.contains(VRegFlags::PARAM) {
            // Register parameters are given a priori at function entry.
            li.start = 0;
        }
        if vreg.is_const() {
            li.state = IntervalState::Const;
        } else if vreg.flags.contains(VRegFlags::SPILLED) {
            li.state = IntervalState::Spilled;
        }
    }

    intervals
}

// ----------------------------------------------------------------------
// Occupancy annotations
// ----------------------------------------------------------------------

/// Walk the IR stream marking, for every live interval, which physical
/// registers argument passing and call clobbers occupy inside it.
fn detect_occupancy(func: &FuncIr, intervals: &mut [LiveInterval], config: &RegAllocConfig) {
    let mut pending: Vec<usize> = (0..intervals.len())
        .filter(|&i| intervals[i].state == IntervalState::Normal && intervals[i].end >= 0)
        .collect();
    pending.sort_by_key(|&i| intervals[i].start);
    let mut pending = pending.into_iter().peekable();

    let mut active: Vec<usize> = Vec::new();
    // Parameters (start 0) activate immediately.
    let mut nip = 0i32;
    let mut iargset = 0u64;
    let mut fargset = 0u64;

    let activate = |active: &mut Vec<usize>,
                    pending: &mut std::iter::Peekable<std::vec::IntoIter<usize>>,
                    nip: i32,
                    intervals: &[LiveInterval]| {
        while let Some(&i) = pending.peek() {
            if intervals[i].start > nip {
                break;
            }
            active.push(i);
            pending.next();
        }
    };
    activate(&mut active, &mut pending, 0, intervals);

    for &bb in &func.bbcon.order {
        for ir in &func.bbcon.pool[bb].irs {
            if let IrKind::PushArg {
                index,
                stack_offset: None,
            } = &ir.kind
            {
                let index = *index;
                let flonum = ir
                    .opr1
                    .map(|v| func.vregs[v].vtype.flonum)
                    .unwrap_or(false);
                if flonum {
                    if index < config.freg_param_count {
                        fargset |= 1 << index;
                    }
                } else if let Some(&phys) = config.reg_param_map.get(index) {
                    if phys != NO_PHYS {
                        iargset |= 1 << phys;
                    }
                }
            }
            if iargset != 0 || fargset != 0 {
                for &i in &active {
                    let flonum = func.vregs[intervals[i].virt].vtype.flonum;
                    intervals[i].occupied |= if flonum { fargset } else { iargset };
                }
            }

            // Deactivate intervals ending here.
            active.retain(|&i| intervals[i].end > nip);

            // A call clobbers every caller-saved register for intervals
            // spanning it.
            if matches!(ir.kind, IrKind::Call { .. }) {
                for &i in &active {
                    let flonum = func.vregs[intervals[i].virt].vtype.flonum;
                    intervals[i].occupied |= if flonum {
                        config.fcaller_saved
                    } else {
                        config.caller_saved
                    };
                }
                iargset = 0;
                fargset = 0;
            }

            nip += 1;
            activate(&mut active, &mut pending, nip, intervals);
        }
    }
}

// ----------------------------------------------------------------------
// The scan
// ----------------------------------------------------------------------

struct PhysFile {
    active: Vec<usize>,
    phys_max: usize,
    temporary_count: usize,
    using_bits: u64,
    used_bits: u64,
}

impl PhysFile {
    fn expire(&mut self, intervals: &[LiveInterval], start: i32) {
        let mut using_bits = self.using_bits;
        self.active.retain(|&i| {
            if intervals[i].end <= start {
                if let Some(phys) = intervals[i].phys {
                    using_bits &= !(1u64 << phys);
                }
                false
            } else {
                true
            }
        });
        self.using_bits = using_bits;
    }

    /// Keep `active` sorted by interval end.
    fn insert_active(&mut self, intervals: &[LiveInterval], idx: usize) {
        let pos = self
            .active
            .iter()
            .position(|&i| intervals[idx].end < intervals[i].end)
            .unwrap_or(self.active.len());
        self.active.insert(pos, idx);
    }
}

fn linear_scan(
    func: &FuncIr,
    intervals: &mut [LiveInterval],
    sorted: &[usize],
    config: &RegAllocConfig,
) -> (u64, u64) {
    let mut iregs = PhysFile {
        active: Vec::new(),
        phys_max: config.phys_max,
        temporary_count: config.temporary_count,
        using_bits: 0,
        used_bits: 0,
    };
    let mut fregs = PhysFile {
        active: Vec::new(),
        phys_max: config.fphys_max,
        temporary_count: config.ftemporary_count,
        using_bits: 0,
        used_bits: 0,
    };

    for &idx in sorted {
        if intervals[idx].state != IntervalState::Normal || intervals[idx].end < 0 {
            continue;
        }
        let start = intervals[idx].start;
        iregs.expire(intervals, start);
        fregs.expire(intervals, start);

        let vreg = &func.vregs[intervals[idx].virt];
        let file = if vreg.vtype.flonum {
            &mut fregs
        } else {
            &mut iregs
        };

        let occupied = file.using_bits | intervals[idx].occupied;
        let mut regno = None;
        let mut start_index = file.temporary_count;

        if let Some(pi) = vreg.param_index {
            let preferred = if vreg.vtype.flonum {
                if (pi as usize) < config.freg_param_count {
                    Some(pi as usize)
                } else {
                    None
                }
            } else {
                config
                    .reg_param_map
                    .get(pi as usize)
                    .copied()
                    .filter(|&p| p != NO_PHYS)
            };
            match preferred {
                Some(p) if occupied & (1 << p) == 0 => regno = Some(p),
                // The ABI register is taken: parameter constraints may
                // fall back on the scratch range.
                _ => start_index = 0,
            }
        }

        if regno.is_none() {
            regno = (start_index..file.phys_max).find(|j| occupied & (1 << j) == 0);
            if regno.is_none() && start_index > 0 {
                regno = (0..start_index).find(|j| occupied & (1 << j) == 0);
            }
        }

        match regno {
            Some(phys) => {
                intervals[idx].phys = Some(phys);
                file.using_bits |= 1 << phys;
                file.insert_active(intervals, idx);
            }
            None => split_at_interval(file, intervals, idx),
        }
        file.used_bits |= file.using_bits;
    }

    (iregs.used_bits, fregs.used_bits)
}

/// On pressure, the interval with the latest end among the actives and
/// the current one is spilled; the other keeps the physical register.
fn split_at_interval(file: &mut PhysFile, intervals: &mut [LiveInterval], current: usize) {
    let Some(&victim) = file.active.last() else {
        intervals[current].state = IntervalState::Spilled;
        return;
    };
    if intervals[victim].end > intervals[current].end {
        intervals[current].phys = intervals[victim].phys;
        intervals[victim].phys = None;
        intervals[victim].state = IntervalState::Spilled;
        file.active.pop();
        file.insert_active(intervals, current);
    } else {
        intervals[current].phys = None;
        intervals[current].state = IntervalState::Spilled;
    }
}

// ----------------------------------------------------------------------
// Spill materialization
// ----------------------------------------------------------------------

/// Bracket every use of a spilled vreg with `LoadSpilled`/`StoreSpilled`
/// through fresh no-spill temporaries. Returns the number of IRs
/// inserted.
fn insert_spill_irs(func: &mut FuncIr) -> usize {
    let mut inserted = 0;
    let order = func.bbcon.order.clone();

    for bb in order {
        let mut j = 0;
        while j < func.bbcon.pool[bb].irs.len() {
            let ir = &func.bbcon.pool[bb].irs[j];
            if matches!(ir.kind, IrKind::LoadSpilled | IrKind::StoreSpilled) {
                j += 1;
                continue;
            }

            let opr1 = ir.opr1;

            let spilled_operand = |v: Option<VRegId>, func: &FuncIr| {
                v.filter(|&v| {
                    !func.vregs[v].is_const() && func.vregs[v].flags.contains(VRegFlags::SPILLED)
                })
            };

            if let Some(v) = spilled_operand(opr1, func) {
                let tmp = func.new_vreg(func.vregs[v].vtype, VRegFlags::NO_SPILL);
                func.bbcon.pool[bb]
                    .irs
                    .insert(j, Ir::with(IrKind::LoadSpilled, Some(tmp), Some(v), None));
                j += 1;
                let ir = &mut func.bbcon.pool[bb].irs[j];
                if ir.opr1 == Some(v) {
                    ir.opr1 = Some(tmp);
                }
                if ir.opr2 == Some(v) {
                    ir.opr2 = Some(tmp);
                }
                inserted += 1;
            }

            let ir = &func.bbcon.pool[bb].irs[j];
            if let Some(v) = spilled_operand(ir.opr2, func) {
                let tmp = func.new_vreg(func.vregs[v].vtype, VRegFlags::NO_SPILL);
                func.bbcon.pool[bb]
                    .irs
                    .insert(j, Ir::with(IrKind::LoadSpilled, Some(tmp), Some(v), None));
                j += 1;
                let ir = &mut func.bbcon.pool[bb].irs[j];
                if ir.opr2 == Some(v) {
                    ir.opr2 = Some(tmp);
                }
                inserted += 1;
            }

            let ir = &func.bbcon.pool[bb].irs[j];
            if let Some(v) = spilled_operand(ir.dst, func) {
                let tmp = func.new_vreg(func.vregs[v].vtype, VRegFlags::NO_SPILL);
                func.bbcon.pool[bb].irs[j].dst = Some(tmp);
                func.bbcon.pool[bb].irs.insert(
                    j + 1,
                    Ir::with(IrKind::StoreSpilled, Some(v), Some(tmp), None),
                );
                j += 1;
                inserted += 1;
            }

            j += 1;
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Name;
    use crate::ir::{IrBinOp, VRegType};

    fn x64_config() -> RegAllocConfig {
        // Mirrors the native backend: index 0 is scratch, 1..=5
        // callee-saved, 6.. argument registers.
        static MAP: [usize; 6] = [6, 7, NO_PHYS, 8, 9, 10];
        RegAllocConfig {
            phys_max: 11,
            temporary_count: 1,
            reg_param_map: &MAP,
            caller_saved: 0b111_1100_0001,
            fphys_max: 15,
            ftemporary_count: 0,
            freg_param_count: 8,
            fcaller_saved: (1 << 15) - 1,
        }
    }

    /// Every vreg live at the same instruction must hold a distinct
    /// physical register, and no assignment may fall in its own
    /// occupied set.
    fn check_soundness(func: &FuncIr, intervals: &[LiveInterval]) {
        for a in intervals {
            if let Some(phys) = a.phys {
                assert_eq!(a.occupied & (1 << phys), 0, "{:?} in occupied set", a.virt);
            }
        }
        for a in intervals {
            for b in intervals {
                if a.virt == b.virt {
                    continue;
                }
                let (Some(pa), Some(pb)) = (a.phys, b.phys) else {
                    continue;
                };
                let fa = func.vregs[a.virt].vtype.flonum;
                let fb = func.vregs[b.virt].vtype.flonum;
                if pa == pb && fa == fb && a.start < b.end && b.start < a.end {
                    panic!(
                        "{:?} and {:?} share phys {} while overlapping",
                        a.virt, b.virt, pa
                    );
                }
            }
        }
    }

    fn int_vt() -> VRegType {
        VRegType::int(8, false)
    }

    #[test]
    fn test_disjoint_intervals_share_registers() {
        let mut func = FuncIr::new(Name(0), false);
        let bb = func.bbcon.new_bb();
        func.bbcon.schedule(bb);

        let a = func.new_vreg(int_vt(), VRegFlags::empty());
        let b = func.new_vreg(int_vt(), VRegFlags::empty());
        let c = func.new_const_vreg(1, int_vt());
        // a defined and used, then b defined and used; disjoint.
        func.bbcon.push(bb, Ir::with(IrKind::Mov, Some(a), Some(c), None));
        func.bbcon
            .push(bb, Ir::with(IrKind::BinOp(IrBinOp::Add), Some(a), Some(a), Some(c)));
        func.bbcon.push(bb, Ir::with(IrKind::Mov, Some(b), Some(c), None));
        func.bbcon
            .push(bb, Ir::with(IrKind::BinOp(IrBinOp::Add), Some(b), Some(b), Some(c)));

        let intervals = allocate(&mut func, &x64_config());
        check_soundness(&func, &intervals);
        assert!(func.vregs[a].phys.is_some());
        assert!(func.vregs[b].phys.is_some());
    }

    #[test]
    fn test_pressure_forces_spill_with_bracketing() {
        let config = x64_config();
        let mut func = FuncIr::new(Name(0), false);
        let bb = func.bbcon.new_bb();
        func.bbcon.schedule(bb);

        // More simultaneously-live values than integer registers.
        let count = config.phys_max + 4;
        let one = func.new_const_vreg(1, int_vt());
        let vregs: Vec<_> = (0..count)
            .map(|_| func.new_vreg(int_vt(), VRegFlags::empty()))
            .collect();
        for &v in &vregs {
            func.bbcon
                .push(bb, Ir::with(IrKind::Mov, Some(v), Some(one), None));
        }
        // All still live here: use every one of them.
        for &v in &vregs {
            func.bbcon.push(
                bb,
                Ir::with(IrKind::BinOp(IrBinOp::Add), Some(v), Some(v), Some(one)),
            );
        }

        let intervals = allocate(&mut func, &x64_config());
        check_soundness(&func, &intervals);

        let spilled: Vec<_> = func
            .vregs
            .iter()
            .filter(|v| v.flags.contains(VRegFlags::SPILLED))
            .collect();
        assert!(!spilled.is_empty(), "expected at least one spill");
        // Every spilled vreg received a frame slot of at least its size.
        for v in &spilled {
            let slot = v.frame_slot.expect("spilled vreg without a frame slot");
            assert!(func.frame[slot].size >= 8);
        }

        // Spilled vregs appear only in LoadSpilled/StoreSpilled.
        for bb in &func.bbcon.order {
            for ir in &func.bbcon.pool[*bb].irs {
                if matches!(ir.kind, IrKind::LoadSpilled | IrKind::StoreSpilled) {
                    continue;
                }
                for v in [ir.dst, ir.opr1, ir.opr2].into_iter().flatten() {
                    assert!(
                        !func.vregs[v].flags.contains(VRegFlags::SPILLED),
                        "spilled vreg referenced directly"
                    );
                }
            }
        }
    }

    #[test]
    fn test_param_gets_abi_register_when_free() {
        let mut func = FuncIr::new(Name(0), false);
        let bb = func.bbcon.new_bb();
        func.bbcon.schedule(bb);

        let p0 = func.new_vreg(int_vt(), VRegFlags::PARAM);
        func.vregs[p0].param_index = Some(0);
        func.param_vregs.push(p0);
        let out = func.new_vreg(int_vt(), VRegFlags::empty());
        func.bbcon
            .push(bb, Ir::with(IrKind::Mov, Some(out), Some(p0), None));
        func.bbcon
            .push(bb, Ir::with(IrKind::Result, None, Some(out), None));

        let intervals = allocate(&mut func, &x64_config());
        check_soundness(&func, &intervals);
        // Argument 0 maps to allocator index 6.
        assert_eq!(func.vregs[p0].phys, Some(6));
    }

    #[test]
    fn test_call_clobbers_push_values_to_callee_saved() {
        let config = x64_config();
        let mut func = FuncIr::new(Name(0), false);
        let bb = func.bbcon.new_bb();
        func.bbcon.schedule(bb);

        let one = func.new_const_vreg(1, int_vt());
        let live = func.new_vreg(int_vt(), VRegFlags::empty());
        func.bbcon
            .push(bb, Ir::with(IrKind::Mov, Some(live), Some(one), None));
        func.bbcon.push(
            bb,
            Ir::new(IrKind::PreCall {
                arg_count: 0,
                stack_space: 0,
            }),
        );
        func.bbcon.push(
            bb,
            Ir::with(
                IrKind::Call {
                    label: Some(Name(1)),
                    arg_count: 0,
                    reg_arg_count: 0,
                    stack_space: 0,
                },
                None,
                None,
                None,
            ),
        );
        // `live` survives the call.
        func.bbcon.push(
            bb,
            Ir::with(IrKind::BinOp(IrBinOp::Add), Some(live), Some(live), Some(one)),
        );

        let intervals = allocate(&mut func, &x64_config());
        check_soundness(&func, &intervals);
        let phys = func.vregs[live].phys.expect("live value spilled unnecessarily");
        assert_eq!(
            config.caller_saved & (1 << phys),
            0,
            "call-crossing value landed in a caller-saved register"
        );
    }
}
