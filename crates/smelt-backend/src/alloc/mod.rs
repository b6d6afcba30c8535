use std::collections::HashMap;

use log::{debug, info, trace};
use smelt_common::config::BackendConfig;
use smelt_common::driver::{Driver, Phase};
use smelt_common::lir::{
    BlockId, GapPos, Instruction, Location, Operand, Policy, Rep, Sequence, VirtualId,
};
use smelt_common::target::{AliasingKind, RegisterSetup};

use self::holes::Holes;
use self::liveness::Liveness;
use self::state::{RegState, SpillSlots};

mod holes;
mod liveness;
mod state;

#[cfg(test)]
mod tests;

/// Assign a physical location to every unallocated operand in the sequence,
/// inserting spill, fill and reconciliation moves into the instruction gaps.
/// Blocks are visited in reverse post order, so every forward predecessor's
/// exit state exists before its successors need it.
///
/// Running out of registers is not an error here; it spills. The fatal
/// conditions are structural: a register read before any definition, or a
/// fixed policy naming a location outside its operand's class.
pub fn regalloc(
    config: &BackendConfig,
    setup: &RegisterSetup,
    driver: &mut dyn Driver,
    sequence: &mut Sequence,
) {
    info!(
        "allocating {} virtual registers across {} instructions in {} blocks",
        sequence.vregs,
        sequence.instruction_count(),
        sequence.blocks.len()
    );

    let liveness = liveness::analyze(sequence);
    let holes = holes::compute(sequence);

    let mut allocator = Allocator {
        setup,
        liveness: &liveness,
        holes: &holes,
        slots: SpillSlots::default(),
        entries: HashMap::new(),
        exits: HashMap::new(),
        current: RegState::new(setup),
    };

    for ndx in 0..sequence.blocks.len() {
        allocator.allocate_block(BlockId(ndx), sequence, driver);
    }

    allocator.finish(config, sequence);
    trace!("done allocating; frame {:?}", sequence.frame);
}

/// A program point during the walk: global position plus the bounds needed
/// for in-block next-use queries.
#[derive(Clone, Copy, Debug)]
struct Point {
    block: BlockId,
    pos: usize,
    end: usize,
}

struct Allocator<'a> {
    setup: &'a RegisterSetup,
    liveness: &'a Liveness,
    holes: &'a Holes,
    slots: SpillSlots,
    entries: HashMap<BlockId, RegState>,
    exits: HashMap<BlockId, RegState>,
    current: RegState,
}

impl Allocator<'_> {
    fn allocate_block(&mut self, id: BlockId, sequence: &mut Sequence, driver: &mut dyn Driver) {
        self.start_state(id, sequence);
        self.allocate_phis(id, sequence);
        self.entries.insert(id, self.current.clone());

        let mut insts = std::mem::take(&mut sequence.block_mut(id).insts);
        let base = self.liveness.offsets[id.0];
        let end = base + insts.len() - 1;

        for (at, inst) in insts.iter_mut().enumerate() {
            let point = Point {
                block: id,
                pos: base + at,
                end,
            };
            self.allocate_instruction(point, inst);
        }

        // Back edges: whatever we hold must land where the header expects it.
        let succs = sequence.block(id).succs.clone();
        for succ in succs {
            if succ <= id {
                self.reconcile_back_edge(id, succ, &mut insts, sequence);
            }
        }

        sequence.block_mut(id).insts = insts;
        self.exits.insert(id, self.current.clone());

        debug!("allocated {id}");
        if driver.tracing() {
            driver.trace_registers(id, self.current.dump());
            driver.trace_block(Phase::Allocate, id, format!("{}", sequence.block(id)));
        }
    }

    /// Register state at block entry: blank for handlers and loop headers
    /// reachable only by looping, inherited from a sole predecessor, or
    /// merged across several.
    fn start_state(&mut self, id: BlockId, sequence: &mut Sequence) {
        let block = sequence.block(id);
        let blank = block.handler || (block.loop_header && block.only_back_edge_preds());
        let preds: Vec<BlockId> = block.preds.iter().copied().filter(|p| *p < id).collect();

        if blank {
            self.current = RegState::new(self.setup);

            // Everything alive across a blank entry meets in its spill slot.
            let mut live: Vec<VirtualId> = self.liveness.live_in(id).collect();
            live.sort_unstable();

            for vreg in live {
                let rep = self.liveness.rep(vreg);
                let slot = self.slots.slot_for(vreg, rep, self.liveness);
                self.current.set(vreg, slot);

                for pred in preds.iter() {
                    let src = self.exits[pred]
                        .location(vreg)
                        .expect("value live into blank block but absent in a predecessor");
                    if !src.same_place(&slot) {
                        let gap = terminator_end_gap(sequence, *pred);
                        gap.push(Operand::Allocated(src), Operand::Allocated(slot));
                    }
                }
            }
            return;
        }

        match preds.len() {
            0 => self.current = RegState::new(self.setup),
            1 => {
                self.current = self.exits[&preds[0]].clone();

                // Drop everything dead on entry so its registers free up.
                let stale: Vec<VirtualId> = self
                    .current
                    .locations
                    .keys()
                    .copied()
                    .filter(|vreg| {
                        !self
                            .liveness
                            .live_in
                            .get(&id)
                            .map(|live| live.contains(vreg))
                            .unwrap_or(false)
                    })
                    .collect();
                for vreg in stale {
                    self.current.release(vreg);
                }
            }
            _ => self.merge_states(id, &preds, sequence),
        }
    }

    /// Reconcile divergent predecessor states. The predecessors' highest
    /// common post-dominating hole decides the treatment of each value:
    /// anything not used before that unavoidable point meets in its spill
    /// slot, everything else gets a register if one can be agreed on.
    fn merge_states(&mut self, id: BlockId, preds: &[BlockId], sequence: &mut Sequence) {
        let mut state = RegState::new(self.setup);

        let hole = self.holes.common(preds.iter().map(|pred| self.holes.at(*pred)));
        let hole_end = self.liveness.block_end(sequence, hole);
        let entry_pos = self.liveness.offsets[id.0];

        let mut live: Vec<VirtualId> = self.liveness.live_in(id).collect();
        live.sort_unstable();

        for vreg in live {
            let rep = self.liveness.rep(vreg);
            let locs: Vec<Location> = preds
                .iter()
                .map(|pred| {
                    self.exits[pred]
                        .location(vreg)
                        .expect("value live at merge but missing in a predecessor")
                })
                .collect();

            let all_same = locs.windows(2).all(|pair| pair[0].same_place(&pair[1]));
            let target = if all_same && (locs[0].is_slot() || state.is_free(rep, locs[0].index)) {
                locs[0]
            } else {
                let urgent = self
                    .liveness
                    .first_use_at_or_after(vreg, entry_pos)
                    .map(|use_pos| use_pos <= hole_end)
                    .unwrap_or(false);

                if !urgent {
                    self.slots.slot_for(vreg, rep, self.liveness)
                } else {
                    // Prefer a register some predecessor already uses.
                    let mut choice = locs
                        .iter()
                        .find(|loc| loc.is_register() && state.is_free(rep, loc.index))
                        .map(|loc| Location::register(loc.index, rep));

                    if choice.is_none() {
                        choice = state
                            .free_register(self.setup, rep, &[])
                            .map(|index| Location::register(index, rep));
                    }

                    match choice {
                        Some(loc) => loc,
                        None => self.slots.slot_for(vreg, rep, self.liveness),
                    }
                }
            };

            state.set(vreg, target);

            for (pred, loc) in preds.iter().zip(locs) {
                if !loc.same_place(&target) {
                    assert_eq!(
                        1,
                        sequence.block(*pred).succs.len(),
                        "critical edge into merge block"
                    );
                    let gap = terminator_end_gap(sequence, *pred);
                    gap.push(Operand::Allocated(loc), Operand::Allocated(target));
                }
            }
        }

        self.current = state;
    }

    /// Place every live phi, preferring a location an input already holds so
    /// the edge costs nothing. Handler phis carrying the incoming exception
    /// value are pinned to the designated register. Forward-edge inputs are
    /// resolved here; back-edge inputs wait for their blocks.
    fn allocate_phis(&mut self, id: BlockId, sequence: &mut Sequence) {
        let block = sequence.block(id);
        if block.phis.is_empty() {
            return;
        }

        let preds = block.preds.clone();
        let handler = block.handler;
        let blank = handler || (block.loop_header && block.only_back_edge_preds());
        let count = block.phis.len();

        for ndx in 0..count {
            let phi = sequence.block(id).phis[ndx].clone();
            let rep = phi.rep;

            let live = self.liveness.is_used(phi.output)
                || self.liveness.is_live_out(id, phi.output);

            let target = if !live {
                None
            } else if phi.exception_value {
                assert!(handler, "exception phi outside a handler block");
                Some(Location::register(self.setup.exception_register, rep))
            } else if blank {
                Some(self.slots.slot_for(phi.output, rep, self.liveness))
            } else {
                let mut choice = None;
                for (pred, input) in preds.iter().zip(phi.inputs.iter()) {
                    if *pred >= id {
                        continue;
                    }
                    if let Some(vreg) = input.vreg() {
                        if let Some(loc) = self.exits[pred].location(vreg) {
                            if loc.is_register() && self.current.is_free(rep, loc.index) {
                                choice = Some(Location::register(loc.index, rep));
                                break;
                            }
                        }
                    }
                }

                if choice.is_none() {
                    choice = self
                        .current
                        .free_register(self.setup, rep, &[])
                        .map(|index| Location::register(index, rep));
                }

                match choice {
                    Some(loc) => Some(loc),
                    None => Some(self.slots.slot_for(phi.output, rep, self.liveness)),
                }
            };

            if let Some(target) = target {
                self.current.set(phi.output, target);
            }

            for (k, pred) in preds.iter().enumerate() {
                if *pred >= id {
                    continue;
                }

                let input = sequence.block(id).phis[ndx].inputs[k];
                let src = match input {
                    Operand::Unallocated { vreg, .. } => Operand::Allocated(
                        self.exits[pred]
                            .location(vreg)
                            .expect("phi input not live out of its predecessor"),
                    ),
                    other => other,
                };
                sequence.block_mut(id).phis[ndx].inputs[k] = src;

                if let Some(target) = target {
                    if !src.same_place(&Operand::Allocated(target)) {
                        assert_eq!(
                            1,
                            sequence.block(*pred).succs.len(),
                            "critical edge into merge block"
                        );
                        let gap = terminator_end_gap(sequence, *pred);
                        gap.push(src, Operand::Allocated(target));
                    }
                }
            }
        }
    }

    fn allocate_instruction(&mut self, point: Point, inst: &mut Instruction) {
        let input_vregs: Vec<Option<VirtualId>> = inst
            .inputs
            .iter()
            .map(|input| {
                if input.is_unallocated() {
                    input.vreg()
                } else {
                    None
                }
            })
            .collect();

        for ndx in 0..inst.inputs.len() {
            self.allocate_input(point, inst, ndx);
        }

        // Last uses free their registers before outputs are placed, so
        // results can reuse them. Dead-result instructions fall out of this
        // too: their outputs are released at the next instruction's uses.
        for vreg in input_vregs.iter().flatten() {
            if self.dead_after(point, *vreg) {
                self.current.release(*vreg);
            }
        }

        if inst.is_call() {
            self.spill_caller_saved(inst);
        }

        let temps = self.allocate_temps(point, inst);

        let output_vregs: Vec<VirtualId> = inst
            .outputs
            .iter()
            .filter(|output| output.is_unallocated())
            .filter_map(|output| output.vreg())
            .collect();

        self.allocate_outputs(point, inst, &input_vregs);

        for vreg in temps {
            self.current.release(vreg);
        }

        // Results nothing ever reads don't get to hold their registers.
        for vreg in output_vregs {
            if self.dead_after(point, vreg) {
                self.current.release(vreg);
            }
        }
    }

    fn allocate_input(&mut self, point: Point, inst: &mut Instruction, ndx: usize) {
        let (vreg, policy, rep) = match inst.inputs[ndx] {
            Operand::Unallocated { vreg, policy, rep } => (vreg, policy, rep),
            _ => return,
        };

        let loc = self
            .current
            .location(vreg)
            .unwrap_or_else(|| panic!("v{vreg} used before any definition"));

        let resolved = match policy {
            Policy::Any => loc,

            Policy::MustHaveRegister => {
                if loc.is_register() {
                    loc
                } else {
                    let exclude = fixed_registers(inst, rep);
                    let index = self.take_register(point, rep, inst, &exclude);
                    let target = Location::register(index, rep);
                    inst.gap_or_default(GapPos::Start)
                        .push(Operand::Allocated(loc), Operand::Allocated(target));
                    self.current.set(vreg, target);
                    target
                }
            }

            Policy::FixedRegister(index) => {
                let target = Location::register(index, rep);
                if !loc.same_place(&target) {
                    // The instruction gets a copy; the value's own location
                    // stays put. That keeps the copy's register out of the
                    // picture when a call right here clobbers it.
                    self.evict(inst, rep, index);
                    inst.gap_or_default(GapPos::Start)
                        .push(Operand::Allocated(loc), Operand::Allocated(target));
                }
                target
            }

            Policy::FixedSlot(index) => {
                let target = Location::fixed_slot(index, rep);
                if !loc.same_place(&target) {
                    inst.gap_or_default(GapPos::Start)
                        .push(Operand::Allocated(loc), Operand::Allocated(target));
                }
                target
            }

            Policy::SameAsInput(_) => panic!("same-as-input is an output-only policy"),
        };

        inst.inputs[ndx] = Operand::Allocated(resolved);
    }

    fn allocate_temps(&mut self, point: Point, inst: &mut Instruction) -> Vec<VirtualId> {
        let mut marks = Vec::new();

        for ndx in 0..inst.temps.len() {
            let (vreg, policy, rep) = match inst.temps[ndx] {
                Operand::Unallocated { vreg, policy, rep } => (vreg, policy, rep),
                _ => continue,
            };

            let index = match policy {
                Policy::FixedRegister(index) => {
                    self.evict(inst, rep, index);
                    index
                }
                _ => {
                    let exclude = fixed_registers(inst, rep);
                    self.take_register(point, rep, inst, &exclude)
                }
            };

            let loc = Location::register(index, rep);
            self.current.set(vreg, loc);
            marks.push(vreg);
            inst.temps[ndx] = Operand::Allocated(loc);
        }

        marks
    }

    fn allocate_outputs(
        &mut self,
        point: Point,
        inst: &mut Instruction,
        input_vregs: &[Option<VirtualId>],
    ) {
        for ndx in 0..inst.outputs.len() {
            let (vreg, policy, rep) = match inst.outputs[ndx] {
                Operand::Unallocated { vreg, policy, rep } => (vreg, policy, rep),
                _ => continue,
            };

            let target = match policy {
                Policy::FixedRegister(index) => {
                    self.evict(inst, rep, index);
                    Location::register(index, rep)
                }

                Policy::FixedSlot(index) => Location::fixed_slot(index, rep),

                Policy::SameAsInput(input) => {
                    let shared = inst.inputs[input]
                        .location()
                        .expect("same-as-input needs an allocated input");

                    // If the shared input survives this instruction it must
                    // vacate the location: the output overwrites it.
                    if let Some(witness) = input_vregs[input] {
                        let still_there = self
                            .current
                            .location(witness)
                            .map(|loc| loc.same_place(&shared))
                            .unwrap_or(false);
                        if still_there {
                            self.displace(inst, witness, shared);
                        }
                    }

                    let target = Location {
                        kind: shared.kind,
                        index: shared.index,
                        rep,
                    };
                    if target.is_slot() {
                        self.slots.note_occupant(vreg, target);
                    }
                    target
                }

                Policy::MustHaveRegister | Policy::Any => {
                    let exclude = fixed_registers(inst, rep);
                    let index = self.take_register(point, rep, inst, &exclude);
                    Location::register(index, rep)
                }
            };

            assert!(
                self.current.location(vreg).is_none(),
                "v{vreg} defined twice"
            );
            self.current.set(vreg, target);
            inst.outputs[ndx] = Operand::Allocated(target);
        }
    }

    /// A register (or a free one spilled for the purpose) of the wanted
    /// class. Spills the occupant we will need last.
    fn take_register(
        &mut self,
        point: Point,
        rep: Rep,
        inst: &mut Instruction,
        exclude: &[usize],
    ) -> usize {
        if let Some(index) = self.current.free_register(self.setup, rep, exclude) {
            return index;
        }

        let mut victim: Option<(VirtualId, Location, usize)> = None;
        for (vreg, loc) in self.current.values_in_registers() {
            if loc.rep.is_fp() != rep.is_fp() {
                continue;
            }
            if loc.rep.is_fp() && loc.rep != rep {
                continue;
            }
            if exclude.contains(&loc.index) {
                continue;
            }

            let distance = match self.liveness.next_use_within(vreg, point.pos, point.end) {
                Some(use_pos) => use_pos,
                None => usize::MAX,
            };

            victim = match victim {
                Some((_, _, best)) if best >= distance => victim,
                _ => Some((vreg, loc, distance)),
            };
        }

        let (vreg, loc, _) = victim.expect("no spillable register in class");
        let slot = self.slots.slot_for(vreg, loc.rep, self.liveness);
        inst.gap_or_default(GapPos::Start)
            .push(Operand::Allocated(loc), Operand::Allocated(slot));
        self.current.set(vreg, slot);
        loc.index
    }

    /// Clear a specific register for a fixed policy, moving any occupant to
    /// another register of its class or to its spill slot.
    fn evict(&mut self, inst: &mut Instruction, rep: Rep, index: usize) {
        while let Some(witness) = self.current.occupant(rep, index) {
            let from = self.current.location(witness).unwrap();
            let mut exclude = fixed_registers(inst, from.rep);
            if from.rep.is_fp() && self.setup.fp_aliasing == AliasingKind::Combining {
                let (base, count) = self.setup.aliases(rep, index, from.rep);
                exclude.extend(base..base + count);
            } else {
                exclude.push(index);
            }

            let to = match self.current.free_register(self.setup, from.rep, &exclude) {
                Some(free) => Location::register(free, from.rep),
                None => self.slots.slot_for(witness, from.rep, self.liveness),
            };

            inst.gap_or_default(GapPos::Start)
                .push(Operand::Allocated(from), Operand::Allocated(to));
            self.current.set(witness, to);
        }
    }

    /// Move a surviving value out of a location the instruction is about to
    /// overwrite.
    fn displace(&mut self, inst: &mut Instruction, vreg: VirtualId, from: Location) {
        let exclude = {
            let mut exclude = fixed_registers(inst, from.rep);
            if from.is_register() {
                exclude.push(from.index);
            }
            exclude
        };

        let to = match self.current.free_register(self.setup, from.rep, &exclude) {
            Some(free) => Location::register(free, from.rep),
            None => self.slots.slot_for(vreg, from.rep, self.liveness),
        };

        inst.gap_or_default(GapPos::Start)
            .push(Operand::Allocated(from), Operand::Allocated(to));
        self.current.set(vreg, to);
    }

    /// Values in caller-saved registers move to their slots across a call.
    fn spill_caller_saved(&mut self, inst: &mut Instruction) {
        for (vreg, loc) in self.current.values_in_registers() {
            let clobbered = if loc.rep.is_fp() {
                let units = state::fp_units(self.setup.fp_aliasing, loc.rep, loc.index);
                self.setup
                    .float_call_clobbers
                    .iter()
                    .any(|unit| units.contains(unit))
            } else {
                self.setup.call_clobbers.contains(&loc.index)
            };

            if clobbered {
                let slot = self.slots.slot_for(vreg, loc.rep, self.liveness);
                inst.gap_or_default(GapPos::Start)
                    .push(Operand::Allocated(loc), Operand::Allocated(slot));
                self.current.set(vreg, slot);
            }
        }
    }

    fn dead_after(&self, point: Point, vreg: VirtualId) -> bool {
        !self.liveness.is_live_out(point.block, vreg)
            && self
                .liveness
                .next_use_within(vreg, point.pos, point.end)
                .is_none()
    }

    /// A block ending in a back edge must leave every loop-carried value
    /// where the header's entry state expects it, phis included.
    fn reconcile_back_edge(
        &mut self,
        id: BlockId,
        header: BlockId,
        insts: &mut [Instruction],
        sequence: &mut Sequence,
    ) {
        let entry = self.entries[&header].clone();
        let mut moves: Vec<(Operand, Operand)> = Vec::new();

        let mut live: Vec<VirtualId> = self.liveness.live_in(header).collect();
        live.sort_unstable();

        for vreg in live {
            // Phi outputs are defined by the header itself.
            if sequence.block(header).phis.iter().any(|phi| phi.output == vreg) {
                continue;
            }

            let target = entry
                .location(vreg)
                .expect("value live into loop header without an entry location");
            let cur = self
                .current
                .location(vreg)
                .expect("loop-carried value lost before the back edge");
            if !cur.same_place(&target) {
                moves.push((Operand::Allocated(cur), Operand::Allocated(target)));
            }
        }

        let ndx = sequence
            .block(header)
            .preds
            .iter()
            .position(|pred| *pred == id)
            .expect("back edge without matching predecessor entry");

        for k in 0..sequence.block(header).phis.len() {
            let input = sequence.block(header).phis[k].inputs[ndx];
            let src = match input {
                Operand::Unallocated { vreg, .. } => Operand::Allocated(
                    self.current
                        .location(vreg)
                        .expect("phi input dead before the back edge"),
                ),
                other => other,
            };
            sequence.block_mut(header).phis[k].inputs[ndx] = src;

            let output = sequence.block(header).phis[k].output;
            if let Some(target) = entry.location(output) {
                if !src.same_place(&Operand::Allocated(target)) {
                    moves.push((src, Operand::Allocated(target)));
                }
            }
        }

        if !moves.is_empty() {
            let gap = insts
                .last_mut()
                .expect("block without instructions")
                .gap_or_default(GapPos::End);
            for (from, to) in moves {
                gap.push(from, to);
            }
        }
    }

    /// Frame sizing: OSR floors the tagged region at the interpreter
    /// frame's size, and the slot total is padded to odd by frame-layout
    /// convention.
    fn finish(&mut self, config: &BackendConfig, sequence: &mut Sequence) {
        let (tagged, untagged) = self.slots.tops();
        let frame = &mut sequence.frame;

        frame.tagged_slots = tagged.max(config.osr_tagged_floor.unwrap_or(0));
        frame.untagged_slots = untagged;

        if frame.total_slots() % 2 == 0 {
            frame.untagged_slots += 1;
        }
    }
}

/// Register indices this instruction pins through fixed policies, for the
/// given representation's class. Eviction and spilling must steer clear of
/// them.
fn fixed_registers(inst: &Instruction, rep: Rep) -> Vec<usize> {
    let mut fixed = Vec::new();
    let same_class = |op_rep: &Rep| {
        if rep.is_fp() {
            *op_rep == rep
        } else {
            !op_rep.is_fp()
        }
    };

    for operand in inst
        .inputs
        .iter()
        .chain(inst.outputs.iter())
        .chain(inst.temps.iter())
    {
        if let Operand::Unallocated {
            policy: Policy::FixedRegister(index),
            rep: op_rep,
            ..
        } = operand
        {
            if same_class(op_rep) {
                fixed.push(*index);
            }
        }
    }

    // Scratch registers already handed to this instruction are off limits
    // too: the instruction writes them while it runs.
    for operand in inst.temps.iter() {
        if let Operand::Allocated(loc) = operand {
            if loc.is_register() && same_class(&loc.rep) {
                fixed.push(loc.index);
            }
        }
    }

    fixed
}

fn terminator_end_gap(sequence: &mut Sequence, block: BlockId) -> &mut smelt_common::lir::ParallelMove {
    sequence
        .block_mut(block)
        .insts
        .last_mut()
        .expect("block without instructions")
        .gap_or_default(GapPos::End)
}
