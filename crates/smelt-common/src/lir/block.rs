use std::fmt;

use super::{Instruction, Operand, Rep, VirtualId};

/// Block id doubling as the block's reverse-post-order number.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A merge value: one input per predecessor, in predecessor order.
#[derive(Clone, Debug, PartialEq)]
pub struct Phi {
    pub output: VirtualId,
    pub rep: Rep,
    pub inputs: Vec<Operand>,
    /// Bound to the incoming exception value on handler entries; such phis
    /// are forced into the designated exception register.
    pub exception_value: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub phis: Vec<Phi>,
    pub insts: Vec<Instruction>,
    /// Cold, rarely executed.
    pub deferred: bool,
    pub loop_header: bool,
    /// Exception handler entry.
    pub handler: bool,
}

impl Block {
    pub fn terminator(&self) -> &Instruction {
        let last = self.insts.last().expect("block without instructions");
        assert!(last.is_terminator(), "block does not end in a terminator");
        last
    }

    /// A back edge is an edge to a block at or before its source.
    pub fn is_back_edge_to(&self, succ: BlockId) -> bool {
        succ <= self.id
    }

    /// Reachable only by looping: every predecessor sits at or after the
    /// block itself. Such loop headers restart allocation from a blank
    /// register state.
    pub fn only_back_edge_preds(&self) -> bool {
        !self.preds.is_empty() && self.preds.iter().all(|pred| *pred >= self.id)
    }
}
