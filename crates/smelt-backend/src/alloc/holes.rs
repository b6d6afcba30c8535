use smelt_common::lir::{BlockId, Opcode, Sequence};

/// Post-dominating "holes": for every block, the nearest later control-flow
/// point that is unavoidable once the block's terminator runs: a return, a
/// loop back edge, a jump that is not a fallthrough, or a switch without a
/// fallthrough arm. Conditional branches are never holes themselves; their
/// hole is the merge point of their targets' holes.
///
/// The allocator consults this at control-flow joins to decide which values
/// deserve registers: a value with no use before the predecessors' highest
/// common hole is reconciled straight into its spill slot.
#[derive(Debug)]
pub struct Holes {
    /// Nearest hole at or after each block's terminator.
    at: Vec<BlockId>,
    /// Nearest hole strictly after each block's terminator.
    after: Vec<BlockId>,
    /// Whether the block's terminator ends the walk outright (return, tail
    /// call, or loop back edge).
    terminal: Vec<bool>,
}

impl Holes {
    pub fn at(&self, block: BlockId) -> BlockId {
        self.at[block.0]
    }

    /// Highest common hole of several branches: repeatedly advance the
    /// earliest one until all converge, stopping early when a branch
    /// terminates.
    pub fn common(&self, blocks: impl IntoIterator<Item = BlockId>) -> BlockId {
        common(&self.after, &self.terminal, blocks)
    }
}

fn common(
    after: &[BlockId],
    terminal: &[bool],
    blocks: impl IntoIterator<Item = BlockId>,
) -> BlockId {
    let mut holes: Vec<BlockId> = blocks.into_iter().collect();
    assert!(!holes.is_empty());

    // Highest (earliest) first, merged pairwise.
    holes.sort_by(|a, b| b.cmp(a));
    let mut result = holes.pop().unwrap();
    while let Some(next) = holes.pop() {
        result = merge(after, terminal, result, next);
    }
    result
}

fn merge(after: &[BlockId], terminal: &[bool], first: BlockId, second: BlockId) -> BlockId {
    let (mut first, mut second) = (first, second);

    while first != second {
        if first > second {
            std::mem::swap(&mut first, &mut second);
        }

        // If the earlier branch terminates or loops back, the later hole is
        // as far as anyone unavoidably gets.
        if terminal[first.0] {
            return second;
        }

        first = after[first.0];
    }

    first
}

pub fn compute(sequence: &Sequence) -> Holes {
    let count = sequence.blocks.len();
    let mut at = vec![BlockId(0); count];
    let mut after = vec![BlockId(0); count];
    let mut terminal = vec![false; count];

    // Reverse order: successors of forward edges are already resolved, and
    // back edges resolve to the block itself.
    for block in sequence.blocks.iter().rev() {
        let ndx = block.id.0;
        let opcode = block.terminator().opcode;

        let (is_hole, is_terminal, next) = match opcode {
            Opcode::Return | Opcode::TailCall => (true, true, block.id),

            Opcode::Jump => {
                let succ = block.succs[0];
                if block.is_back_edge_to(succ) {
                    (true, true, block.id)
                } else {
                    let not_fallthrough = succ.0 != ndx + 1;
                    (not_fallthrough, false, at[succ.0])
                }
            }

            Opcode::Branch | Opcode::Switch => {
                let fallthrough = block.succs.contains(&BlockId(ndx + 1));
                let is_hole = opcode == Opcode::Switch && !fallthrough;

                let forward: Vec<BlockId> = block
                    .succs
                    .iter()
                    .filter(|succ| !block.is_back_edge_to(**succ))
                    .map(|succ| at[succ.0])
                    .collect();

                if forward.is_empty() {
                    (true, true, block.id)
                } else {
                    (is_hole, false, common(&after, &terminal, forward))
                }
            }

            _ => unreachable!("not a terminator"),
        };

        after[ndx] = next;
        terminal[ndx] = is_terminal;
        at[ndx] = if is_hole { block.id } else { next };
    }

    Holes { at, after, terminal }
}
