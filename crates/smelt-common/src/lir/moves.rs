use super::Operand;

/// One source-to-destination copy inside a parallel move. Elimination is a
/// tombstone: the record stays in its container until a compaction pass
/// physically drops it, so iterators handed out elsewhere stay valid.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveOp {
    pub from: Operand,
    pub to: Operand,
    eliminated: bool,
}

impl MoveOp {
    pub fn new(from: Operand, to: Operand) -> Self {
        Self {
            from,
            to,
            eliminated: false,
        }
    }

    pub fn eliminate(&mut self) {
        self.eliminated = true;
    }

    pub fn is_eliminated(&self) -> bool {
        self.eliminated
    }

    /// Eliminated, or a copy onto its own place.
    pub fn is_redundant(&self) -> bool {
        self.eliminated || self.to.same_place(&self.from)
    }
}

/// An unordered set of moves that conceptually execute simultaneously at one
/// gap position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParallelMove {
    pub moves: Vec<MoveOp>,
}

impl ParallelMove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, from: Operand, to: Operand) {
        self.moves.push(MoveOp::new(from, to));
    }

    /// True when no move in the set would actually execute.
    pub fn is_empty(&self) -> bool {
        self.moves.iter().all(|op| op.is_redundant())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MoveOp> {
        self.moves.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MoveOp> {
        self.moves.iter_mut()
    }

    /// Physically drop tombstoned and self moves. Must run exactly once,
    /// after all marking passes are done.
    pub fn compact(&mut self) {
        self.moves.retain(|op| !op.is_redundant());
    }
}

impl<'a> IntoIterator for &'a ParallelMove {
    type Item = &'a MoveOp;
    type IntoIter = std::slice::Iter<'a, MoveOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.moves.iter()
    }
}
