use super::{Block, BlockId, Instruction, Phi};

/// Stack frame accounting. Slot counts are high-water marks that only grow
/// while allocation runs; the final parity padding happens once, when the
/// allocator finishes the function.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Frame {
    /// Caller-managed slots (parameters, context), laid out by the linkage.
    pub fixed_slots: usize,
    pub tagged_slots: usize,
    pub untagged_slots: usize,
}

impl Frame {
    pub fn total_slots(&self) -> usize {
        self.fixed_slots + self.tagged_slots + self.untagged_slots
    }
}

/// A whole function's instructions, grouped into basic blocks stored in
/// reverse post order. This is the object every backend stage transforms in
/// place.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    pub blocks: Vec<Block>,
    pub vregs: usize,
    pub frame: Frame,
}

impl Sequence {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|block| block.insts.len()).sum()
    }
}

/// Builds a well-formed `Sequence` block by block. Blocks must be added in
/// reverse post order; successor lists are derived from the predecessor
/// lists when the sequence is built.
#[derive(Debug, Default)]
pub struct SequenceBuilder {
    blocks: Vec<Block>,
    vregs: usize,
    fixed_slots: usize,
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixed_slots(mut self, fixed_slots: usize) -> Self {
        self.fixed_slots = fixed_slots;
        self
    }

    pub fn fresh_vreg(&mut self) -> usize {
        let id = self.vregs;
        self.vregs += 1;
        id
    }

    pub fn add(
        &mut self,
        preds: Vec<BlockId>,
        phis: Vec<Phi>,
        insts: Vec<Instruction>,
    ) -> BlockId {
        let id = BlockId(self.blocks.len());

        assert!(!insts.is_empty(), "a block needs at least a terminator");
        for phi in phis.iter() {
            assert_eq!(
                phi.inputs.len(),
                preds.len(),
                "phi inputs must match predecessors"
            );
        }

        self.blocks.push(Block {
            id,
            preds,
            succs: Vec::new(),
            phis,
            insts,
            deferred: false,
            loop_header: false,
            handler: false,
        });

        id
    }

    pub fn deferred(&mut self, id: BlockId) {
        self.blocks[id.0].deferred = true;
    }

    pub fn loop_header(&mut self, id: BlockId) {
        self.blocks[id.0].loop_header = true;
    }

    pub fn handler(&mut self, id: BlockId) {
        self.blocks[id.0].handler = true;
    }

    pub fn build(mut self) -> Sequence {
        let mut edges = Vec::new();
        for block in self.blocks.iter() {
            assert!(block.insts.last().unwrap().is_terminator());
            for pred in block.preds.iter() {
                edges.push((*pred, block.id));
            }
        }

        for (from, to) in edges {
            self.blocks[from.0].succs.push(to);
        }

        Sequence {
            blocks: self.blocks,
            vregs: self.vregs,
            frame: Frame {
                fixed_slots: self.fixed_slots,
                tagged_slots: 0,
                untagged_slots: 0,
            },
        }
    }
}
