use std::collections::{HashMap, HashSet};

use log::{debug, info, trace};
use smelt_common::driver::{Driver, Phase};
use smelt_common::lir::{
    Block, BlockId, GapPos, Instruction, MoveOp, Operand, ParallelMove, Sequence,
};
use smelt_common::target::{AliasingKind, RegisterSetup};

use self::set::OperandSet;

mod set;


/// Shrink the parallel moves allocation introduced: canonicalize gaps,
/// drop moves the instructions themselves clobber, sink moves downward
/// through their blocks, and hoist the moves every predecessor of a merge
/// shares. Anything that cannot be proven safe is left exactly where it
/// was; a second run finds nothing further to do.
pub fn optimize_moves(setup: &RegisterSetup, driver: &mut dyn Driver, sequence: &mut Sequence) {
    info!("optimizing moves across {} blocks", sequence.blocks.len());

    let mut optimizer = MoveOptimizer::new(setup);

    for block in sequence.blocks.iter_mut() {
        for inst in block.insts.iter_mut() {
            optimizer.compress_gaps(inst);
        }
    }

    for block in sequence.blocks.iter_mut() {
        optimizer.compress_block(block);
    }

    for ndx in 0..sequence.blocks.len() {
        let id = BlockId(ndx);
        let block = sequence.block(id);
        if block.preds.len() <= 1 {
            continue;
        }

        // A hot merge fed only by cold paths is left alone: hoisting would
        // drag deferred-path moves onto the hot entry.
        if !block.deferred
            && block
                .preds
                .iter()
                .all(|pred| sequence.block(*pred).deferred)
        {
            continue;
        }

        optimizer.optimize_merge(id, sequence);
    }

    let mut dropped = 0;
    for block in sequence.blocks.iter_mut() {
        for inst in block.insts.iter_mut() {
            dropped += finalize(inst);
        }
    }

    debug!("{dropped} moves dropped");
    if driver.tracing() {
        for block in sequence.blocks.iter() {
            driver.trace_block(Phase::Moves, block.id, format!("{block}"));
        }
    }

    trace!("done optimizing moves");
}

/// Compaction: physically drop tombstoned and self moves, exactly once.
fn finalize(inst: &mut Instruction) -> usize {
    let mut dropped = 0;

    for gap in inst.gaps.iter_mut() {
        if let Some(moves) = gap {
            let before = moves.moves.len();
            moves.compact();
            dropped += before - moves.moves.len();
            if moves.moves.is_empty() {
                *gap = None;
            }
        }
    }

    dropped
}

struct MoveOptimizer<'a> {
    setup: &'a RegisterSetup,
}

impl<'a> MoveOptimizer<'a> {
    fn new(setup: &'a RegisterSetup) -> Self {
        Self { setup }
    }

    /// Canonicalize an instruction's two gaps into the start position.
    fn compress_gaps(&mut self, inst: &mut Instruction) {
        let has_start = inst
            .gap(GapPos::Start)
            .map(|gap| !gap.moves.is_empty())
            .unwrap_or(false);
        let has_end = inst
            .gap(GapPos::End)
            .map(|gap| !gap.moves.is_empty())
            .unwrap_or(false);

        if !has_start && has_end {
            inst.gaps.swap(0, 1);
        } else if has_start && has_end {
            let end = inst.gaps[1].take().unwrap();
            let mut start = inst.gaps[0].take().unwrap();
            self.compress_moves(&mut start, end.moves);
            inst.gaps[0] = Some(start);
        }
    }

    /// Fold `right` (logically later) into `left`: chain sources through
    /// earlier destinations and tombstone moves the later set overwrites.
    fn compress_moves(&mut self, left: &mut ParallelMove, right: Vec<MoveOp>) {
        if right.is_empty() {
            return;
        }

        let mut right = right;
        if !left.moves.is_empty() {
            for op in right.iter_mut() {
                if op.is_redundant() {
                    continue;
                }
                self.prepare_insert_after(left, op);
            }
        }

        for op in right {
            if !op.is_redundant() {
                left.moves.push(op);
            }
        }
    }

    /// Rewrite `op` so it can join `left` as if it executed after it: its
    /// source follows what `left` wrote there, and anything in `left` whose
    /// destination `op` overwrites dies.
    fn prepare_insert_after(&self, left: &mut ParallelMove, op: &mut MoveOp) {
        let mut replacement = None;
        let mut overwritten = Vec::new();

        for (ndx, curr) in left.moves.iter().enumerate() {
            if curr.is_eliminated() {
                continue;
            }
            if curr.to.same_place(&op.from) {
                debug_assert!(replacement.is_none());
                replacement = Some(curr.from);
            } else if self.interferes(&curr.to, &op.to) {
                overwritten.push(ndx);
            }
        }

        if let Some(source) = replacement {
            op.from = source;
        }
        for ndx in overwritten {
            left.moves[ndx].eliminate();
        }
    }

    /// Overlap test: same place, or partially aliased floating-point
    /// registers of different widths.
    fn interferes(&self, a: &Operand, b: &Operand) -> bool {
        if a.same_place(b) {
            return true;
        }

        if self.setup.fp_aliasing == AliasingKind::Combining
            && a.is_fp_register()
            && b.is_fp_register()
        {
            let (la, lb) = (a.location().unwrap(), b.location().unwrap());
            if la.rep == lb.rep {
                return false;
            }
            let (base, count) = self.setup.aliases(la.rep, la.index, lb.rep);
            return (base..base + count).contains(&lb.index);
        }

        false
    }

    /// A move whose destination the instruction overwrites without reading
    /// never needs to run. Returns and tail calls go further:
    /// only moves feeding their own inputs still matter.
    fn remove_clobbered_destinations(&mut self, inst: &mut Instruction) {
        if inst.is_call() {
            return;
        }

        let mut moves = match inst.gaps[0].take() {
            Some(moves) => moves,
            None => return,
        };
        debug_assert!(inst.gaps[1].as_ref().map(|gap| gap.moves.is_empty()).unwrap_or(true));

        let mut outputs = OperandSet::new(self.setup);
        let mut inputs = OperandSet::new(self.setup);

        for operand in inst.outputs.iter().chain(inst.temps.iter()) {
            outputs.insert(operand);
        }
        for operand in inst.inputs.iter() {
            inputs.insert(operand);
        }

        for op in moves.iter_mut() {
            if op.is_eliminated() {
                continue;
            }
            if outputs.contains_or_aliases(&op.to) && !inputs.contains_or_aliases(&op.to) {
                op.eliminate();
            }
        }

        if inst.is_return() || inst.is_tail_call() {
            for op in moves.iter_mut() {
                if !op.is_eliminated() && !inputs.contains_or_aliases(&op.to) {
                    op.eliminate();
                }
            }
        }

        inst.gaps[0] = Some(moves);
    }

    /// Sink eligible moves from `from`'s gap across `from` into `to`'s gap.
    /// A move stays put when `from` reads its destination, when `from`
    /// clobbers its source, or when another staying move writes its source;
    /// the last condition is propagated to a fixed point.
    fn migrate_moves(&mut self, to: &mut Instruction, from: &mut Instruction) {
        if from.is_call() {
            return;
        }

        let mut from_moves = match from.gaps[0].take() {
            Some(moves) => moves,
            None => return,
        };
        if from_moves.moves.is_empty() {
            from.gaps[0] = Some(from_moves);
            return;
        }

        let mut dst_cant_be = OperandSet::new(self.setup);
        let mut src_cant_be = OperandSet::new(self.setup);

        // The instruction reads its inputs: moves targeting them must stay
        // above it.
        for operand in from.inputs.iter() {
            dst_cant_be.insert(operand);
        }
        // The instruction overwrites outputs and temps: moves reading them
        // would see the new value below it. Destinations of staying moves
        // poison sources the same way.
        for operand in from.outputs.iter().chain(from.temps.iter()) {
            src_cant_be.insert(operand);
        }
        for op in from_moves.iter() {
            if !op.is_redundant() {
                src_cant_be.insert(&op.to);
            }
        }

        let mut candidates: HashSet<(Operand, Operand)> = HashSet::new();
        for op in from_moves.iter() {
            if !op.is_redundant() && !dst_cant_be.contains_or_aliases(&op.to) {
                candidates.insert((op.from, op.to));
            }
        }
        if candidates.is_empty() {
            from.gaps[0] = Some(from_moves);
            return;
        }

        // Worklist pass: removing one candidate can newly poison another.
        loop {
            let mut poisoned = Vec::new();
            for (from_op, to_op) in candidates.iter() {
                if src_cant_be.contains_or_aliases(from_op) {
                    poisoned.push((*from_op, *to_op));
                }
            }
            if poisoned.is_empty() {
                break;
            }
            for key in poisoned {
                src_cant_be.insert(&key.1);
                candidates.remove(&key);
            }
        }
        if candidates.is_empty() {
            from.gaps[0] = Some(from_moves);
            return;
        }

        let mut migrated = ParallelMove::new();
        for op in from_moves.iter_mut() {
            if op.is_redundant() {
                continue;
            }
            if candidates.contains(&(op.from, op.to)) {
                migrated.moves.push(op.clone());
                op.eliminate();
            }
        }
        from.gaps[0] = Some(from_moves);

        // The migrated moves run logically before whatever `to` already had.
        if let Some(existing) = to.gaps[0].take() {
            self.compress_moves(&mut migrated, existing.moves);
        }
        to.gaps[0] = Some(migrated);
    }

    /// Within one block: clobber-elimination at the top, then sink moves
    /// instruction by instruction toward the terminator.
    fn compress_block(&mut self, block: &mut Block) {
        if block.insts.is_empty() {
            return;
        }

        self.remove_clobbered_destinations(&mut block.insts[0]);

        for ndx in 1..block.insts.len() {
            let (before, after) = block.insts.split_at_mut(ndx);
            let prev = before.last_mut().unwrap();
            let inst = &mut after[0];

            self.migrate_moves(inst, prev);
            self.remove_clobbered_destinations(inst);
        }
    }

    /// Hoist the moves every predecessor ends with into the merge block's
    /// entry: exactly the common subset, minus anything entangled with a
    /// move left behind.
    fn optimize_merge(&mut self, id: BlockId, sequence: &mut Sequence) {
        let preds = sequence.block(id).preds.clone();
        assert!(preds.len() > 1);

        // Every predecessor must end in something moves can cross: one
        // successor, no call, no clobbers, nothing but constant inputs.
        for pred in preds.iter() {
            let pred_block = sequence.block(*pred);
            if pred_block.succs.len() > 1 {
                return;
            }

            let last = pred_block.insts.last().unwrap();
            if last.is_call() || !last.temps.is_empty() || !last.outputs.is_empty() {
                return;
            }
            for input in last.inputs.iter() {
                if !input.is_constant() {
                    return;
                }
            }
        }

        let mut move_map: HashMap<(Operand, Operand), usize> = HashMap::new();
        let mut correct = 0;

        for pred in preds.iter() {
            let last = sequence.block(*pred).insts.last().unwrap();
            let moves = match last.gap(GapPos::Start) {
                Some(moves) if !moves.is_empty() => moves,
                _ => return,
            };

            for op in moves.iter() {
                if op.is_redundant() {
                    continue;
                }
                let count = move_map.entry((op.from, op.to)).or_insert(0);
                *count += 1;
                if *count == preds.len() {
                    correct += 1;
                }
            }
        }

        if correct == 0 {
            return;
        }

        if correct != move_map.len() {
            // Moves unique to some predecessor stay behind; their
            // destinations may not feed anything we hoist, propagated to a
            // fixed point like in migration.
            let mut conflicting = OperandSet::new(self.setup);

            let partial: Vec<(Operand, Operand)> = move_map
                .iter()
                .filter(|(_, count)| **count != preds.len())
                .map(|(key, _)| *key)
                .collect();
            for key in partial {
                conflicting.insert(&key.1);
                move_map.remove(&key);
            }

            loop {
                let mut poisoned = Vec::new();
                for key in move_map.keys() {
                    if conflicting.contains_or_aliases(&key.0) {
                        poisoned.push(*key);
                    }
                }
                if poisoned.is_empty() {
                    break;
                }
                for key in poisoned {
                    conflicting.insert(&key.1);
                    move_map.remove(&key);
                }
            }
        }

        if move_map.is_empty() {
            return;
        }

        // Delete the common moves everywhere, remembering the first
        // predecessor's copy in its own order.
        let mut hoisted = ParallelMove::new();
        let mut first = true;
        for pred in preds.iter() {
            let last = sequence.block_mut(*pred).insts.last_mut().unwrap();
            let moves = last.gap_mut(GapPos::Start).unwrap();

            for op in moves.iter_mut() {
                if op.is_redundant() {
                    continue;
                }
                if move_map.contains_key(&(op.from, op.to)) {
                    if first {
                        hoisted.moves.push(op.clone());
                    }
                    op.eliminate();
                }
            }
            first = false;
        }

        // The hoisted moves run before whatever the merge entry already had.
        let entry = sequence.block_mut(id).insts.first_mut().unwrap();
        if let Some(existing) = entry.gaps[0].take() {
            self.compress_moves(&mut hoisted, existing.moves);
        }
        entry.gaps[0] = Some(hoisted);
    }
}
