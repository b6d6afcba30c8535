use std::collections::HashMap;

use im::HashSet;
use ranges::{GenericRange, Ranges};
use smelt_common::lir::{BlockId, Rep, Sequence, VirtualId};

pub type LiveRange = GenericRange<usize>;
pub type LiveRanges = Ranges<usize>;

pub fn range(start: usize, end: usize) -> LiveRange {
    GenericRange::new_closed(start, end)
}

/// Block-level live sets plus the global picture: per-register live
/// intervals, use positions, and representations. Positions are block-major:
/// block `b`'s instruction `i` sits at `offsets[b] + i`, and a block's phis
/// share the position of its first instruction.
#[derive(Debug)]
pub struct Liveness {
    pub live_in: HashMap<BlockId, HashSet<VirtualId>>,
    pub live_out: HashMap<BlockId, HashSet<VirtualId>>,
    pub ranges: HashMap<VirtualId, LiveRanges>,
    pub offsets: Vec<usize>,
    uses: HashMap<VirtualId, Vec<usize>>,
    reps: HashMap<VirtualId, Rep>,
}

impl Liveness {
    pub fn block_end(&self, sequence: &Sequence, block: BlockId) -> usize {
        self.offsets[block.0] + sequence.block(block).insts.len() - 1
    }

    pub fn live_in(&self, block: BlockId) -> impl Iterator<Item = VirtualId> + '_ {
        self.live_in.get(&block).into_iter().flatten().copied()
    }

    pub fn is_live_out(&self, block: BlockId, vreg: VirtualId) -> bool {
        self.live_out
            .get(&block)
            .map(|live| live.contains(&vreg))
            .unwrap_or(false)
    }

    /// Next use strictly after `pos` but no later than `end`.
    pub fn next_use_within(&self, vreg: VirtualId, pos: usize, end: usize) -> Option<usize> {
        let uses = self.uses.get(&vreg)?;
        let at = uses.partition_point(|use_pos| *use_pos <= pos);
        uses.get(at).copied().filter(|use_pos| *use_pos <= end)
    }

    pub fn first_use_at_or_after(&self, vreg: VirtualId, pos: usize) -> Option<usize> {
        let uses = self.uses.get(&vreg)?;
        let at = uses.partition_point(|use_pos| *use_pos < pos);
        uses.get(at).copied()
    }

    /// Whether the register is ever read at all.
    pub fn is_used(&self, vreg: VirtualId) -> bool {
        self.uses.get(&vreg).map(|uses| !uses.is_empty()).unwrap_or(false)
    }

    pub fn rep(&self, vreg: VirtualId) -> Rep {
        self.reps.get(&vreg).copied().unwrap_or(Rep::Tagged)
    }

    pub fn ranges_of(&self, vreg: VirtualId) -> Option<&LiveRanges> {
        self.ranges.get(&vreg)
    }
}

pub fn analyze(sequence: &Sequence) -> Liveness {
    let mut analyzer = Analyzer::new(sequence);
    analyzer.analyze();

    Liveness {
        live_in: analyzer.live_in,
        live_out: analyzer.live_out,
        ranges: analyzer.ranges,
        offsets: analyzer.offsets,
        uses: analyzer.uses,
        reps: analyzer.reps,
    }
}

#[derive(Debug)]
struct Analyzer<'a> {
    live_in: HashMap<BlockId, HashSet<VirtualId>>,
    live_out: HashMap<BlockId, HashSet<VirtualId>>,
    ranges: HashMap<VirtualId, LiveRanges>,
    uses: HashMap<VirtualId, Vec<usize>>,
    reps: HashMap<VirtualId, Rep>,
    offsets: Vec<usize>,

    gens: HashMap<BlockId, HashSet<VirtualId>>,
    kills: HashMap<BlockId, HashSet<VirtualId>>,

    sequence: &'a Sequence,
}

impl<'a> Analyzer<'a> {
    fn new(sequence: &'a Sequence) -> Self {
        let mut offsets = Vec::with_capacity(sequence.blocks.len());
        let mut at = 0;
        for block in sequence.blocks.iter() {
            offsets.push(at);
            at += block.insts.len();
        }

        Self {
            live_in: HashMap::new(),
            live_out: HashMap::new(),
            ranges: HashMap::new(),
            uses: HashMap::new(),
            reps: HashMap::new(),
            offsets,
            gens: HashMap::new(),
            kills: HashMap::new(),
            sequence,
        }
    }

    fn analyze(&mut self) {
        self.collect_local();
        self.flow();
        self.build_ranges();

        for positions in self.uses.values_mut() {
            positions.sort_unstable();
            positions.dedup();
        }
    }

    /// Upward-exposed uses and definitions of every block, plus the global
    /// use-position and representation tables.
    fn collect_local(&mut self) {
        for block in self.sequence.blocks.iter() {
            let mut gens = HashSet::new();
            let mut kills = HashSet::new();
            let start = self.offsets[block.id.0];

            for phi in block.phis.iter() {
                kills.insert(phi.output);
                self.reps.insert(phi.output, phi.rep);
            }

            for (at, inst) in block.insts.iter().enumerate() {
                for input in inst.inputs.iter() {
                    self.note_rep(input);
                    if let Some(vreg) = input.vreg() {
                        if input.is_unallocated() {
                            if !kills.contains(&vreg) {
                                gens.insert(vreg);
                            }
                            self.uses.entry(vreg).or_default().push(start + at);
                        }
                    }
                }

                for output in inst.outputs.iter() {
                    self.note_rep(output);
                    if let Some(vreg) = output.vreg() {
                        kills.insert(vreg);
                    }
                }
            }

            // A successor's phi reads this block at the very end of it.
            let end = start + block.insts.len() - 1;
            for succ in block.succs.iter() {
                let ndx = self.pred_index(*succ, block.id);
                for phi in self.sequence.block(*succ).phis.iter() {
                    let input = &phi.inputs[ndx];
                    if let Some(vreg) = input.vreg() {
                        if input.is_unallocated() {
                            self.uses.entry(vreg).or_default().push(end);
                        }
                    }
                }
            }

            self.gens.insert(block.id, gens);
            self.kills.insert(block.id, kills);
        }
    }

    fn note_rep(&mut self, operand: &smelt_common::lir::Operand) {
        if let smelt_common::lir::Operand::Unallocated { vreg, rep, .. } = operand {
            self.reps.insert(*vreg, *rep);
        }
    }

    fn pred_index(&self, block: BlockId, pred: BlockId) -> usize {
        self.sequence
            .block(block)
            .preds
            .iter()
            .position(|p| *p == pred)
            .expect("edge without matching predecessor entry")
    }

    /// Standard backward worklist over the block-level equations.
    fn flow(&mut self) {
        // Popping from the back visits exits first, which converges fastest.
        let mut worklist: Vec<BlockId> = self.sequence.blocks.iter().map(|b| b.id).collect();

        while let Some(id) = worklist.pop() {
            let out = self.flow_out(id);

            let mut inn = self.gens.get(&id).cloned().unwrap_or_default();
            let kills = self.kills.get(&id).cloned().unwrap_or_default();
            for vreg in out.iter() {
                if !kills.contains(vreg) {
                    inn.insert(*vreg);
                }
            }

            self.live_out.insert(id, out);

            let grown = match self.live_in.get(&id) {
                Some(old) => inn.len() > old.len(),
                None => true,
            };

            if grown {
                self.live_in.insert(id, inn);
                worklist.extend(self.sequence.block(id).preds.iter().copied());
            }
        }
    }

    /// Live-out of a block: everything live into a successor (minus that
    /// successor's phi definitions) plus whatever our edge feeds its phis.
    fn flow_out(&self, id: BlockId) -> HashSet<VirtualId> {
        let mut out = HashSet::new();

        for succ in self.sequence.block(id).succs.iter() {
            let succ_block = self.sequence.block(*succ);

            for vreg in self.live_in.get(succ).into_iter().flatten() {
                if !succ_block.phis.iter().any(|phi| phi.output == *vreg) {
                    out.insert(*vreg);
                }
            }

            let ndx = self.pred_index(*succ, id);
            for phi in succ_block.phis.iter() {
                let input = &phi.inputs[ndx];
                if input.is_unallocated() {
                    if let Some(vreg) = input.vreg() {
                        out.insert(vreg);
                    }
                }
            }
        }

        out
    }

    /// One interval per block per register, from its first touch (or block
    /// entry if live-in) to its last (or block end if live-out).
    fn build_ranges(&mut self) {
        for block in self.sequence.blocks.iter() {
            let start = self.offsets[block.id.0];
            let end = start + block.insts.len() - 1;
            let mut touched: HashMap<VirtualId, (usize, usize)> = HashMap::new();

            let touch = |touched: &mut HashMap<VirtualId, (usize, usize)>,
                         vreg: VirtualId,
                         at: usize| {
                touched
                    .entry(vreg)
                    .and_modify(|(lo, hi)| {
                        *lo = (*lo).min(at);
                        *hi = (*hi).max(at);
                    })
                    .or_insert((at, at));
            };

            for vreg in self.live_in.get(&block.id).into_iter().flatten() {
                touch(&mut touched, *vreg, start);
            }

            for phi in block.phis.iter() {
                touch(&mut touched, phi.output, start);
            }

            for (at, inst) in block.insts.iter().enumerate() {
                for operand in inst.inputs.iter().chain(inst.outputs.iter()) {
                    if operand.is_unallocated() {
                        if let Some(vreg) = operand.vreg() {
                            touch(&mut touched, vreg, start + at);
                        }
                    }
                }
            }

            for vreg in self.live_out.get(&block.id).into_iter().flatten() {
                touch(&mut touched, *vreg, end);
            }

            for (vreg, (lo, hi)) in touched {
                self.ranges
                    .entry(vreg)
                    .or_insert_with(LiveRanges::new)
                    .insert(range(lo, hi));
            }
        }
    }
}
