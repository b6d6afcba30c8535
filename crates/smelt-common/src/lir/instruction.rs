use std::ops::BitOr;

use super::{Operand, ParallelMove};
use crate::target::TargetClassifier;

/// Reordering constraints of an opcode, as a small bitset.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const LOAD: Flags = Flags(1);
    pub const SIDE_EFFECT: Flags = Flags(1 << 1);
    pub const BARRIER: Flags = Flags(1 << 2);
    pub const DEOPT_OR_TRAP: Flags = Flags(1 << 3);

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// The closed opcode set of the machine IR. Target-specific opcodes escape
/// through `Target` and are classified by a `TargetClassifier`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Opcode {
    Nop,
    /// Fixed-location parameter-defining no-op at function entry.
    Parameter,
    Materialize,
    Add,
    Sub,
    Mul,
    Compare,
    Load,
    Store,
    AtomicStore,
    AtomicExchange,
    ReadStackPointer,
    SetStackPointer,
    Call,
    SaveCallerRegisters,
    RestoreCallerRegisters,
    DebugBreak,
    Deopt,
    Check,
    Jump,
    Branch,
    Switch,
    Return,
    TailCall,
    Target(u16),
}

impl Opcode {
    /// Exhaustive classification. Anything not recognized here is a target
    /// opcode and defers to the target's classifier.
    pub fn flags(&self, target: &dyn TargetClassifier) -> Flags {
        match self {
            Opcode::Nop
            | Opcode::Parameter
            | Opcode::Materialize
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Compare
            | Opcode::Jump
            | Opcode::Branch
            | Opcode::Switch
            | Opcode::Return
            | Opcode::TailCall => Flags::NONE,

            Opcode::Load | Opcode::ReadStackPointer => Flags::LOAD,

            Opcode::Store
            | Opcode::AtomicStore
            | Opcode::AtomicExchange
            | Opcode::SetStackPointer
            | Opcode::Call => Flags::SIDE_EFFECT,

            Opcode::SaveCallerRegisters | Opcode::RestoreCallerRegisters => {
                Flags::SIDE_EFFECT | Flags::BARRIER
            }

            Opcode::DebugBreak => Flags::BARRIER,

            Opcode::Deopt | Opcode::Check => Flags::DEOPT_OR_TRAP,

            Opcode::Target(op) => target.classify(*op),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Branch | Opcode::Switch | Opcode::Return | Opcode::TailCall
        )
    }
}

/// The two move-attachment points of an instruction: `Start` moves execute
/// before the instruction, `End` moves after it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum GapPos {
    Start,
    End,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub outputs: Vec<Operand>,
    pub inputs: Vec<Operand>,
    pub temps: Vec<Operand>,
    pub gaps: [Option<ParallelMove>; 2],
}

impl Instruction {
    pub fn new(opcode: Opcode, outputs: Vec<Operand>, inputs: Vec<Operand>) -> Self {
        Self {
            opcode,
            outputs,
            inputs,
            temps: Vec::new(),
            gaps: [None, None],
        }
    }

    pub fn with_temps(mut self, temps: Vec<Operand>) -> Self {
        self.temps = temps;
        self
    }

    pub fn is_call(&self) -> bool {
        matches!(self.opcode, Opcode::Call | Opcode::TailCall)
    }

    pub fn is_return(&self) -> bool {
        matches!(self.opcode, Opcode::Return)
    }

    pub fn is_tail_call(&self) -> bool {
        matches!(self.opcode, Opcode::TailCall)
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    pub fn gap(&self, pos: GapPos) -> Option<&ParallelMove> {
        self.gaps[pos as usize].as_ref()
    }

    pub fn gap_mut(&mut self, pos: GapPos) -> Option<&mut ParallelMove> {
        self.gaps[pos as usize].as_mut()
    }

    pub fn gap_or_default(&mut self, pos: GapPos) -> &mut ParallelMove {
        self.gaps[pos as usize].get_or_insert_with(ParallelMove::default)
    }

    /// Whether any gap still holds a move that would actually execute.
    pub fn has_moves(&self) -> bool {
        self.gaps
            .iter()
            .flatten()
            .any(|gap| !gap.is_empty())
    }
}
