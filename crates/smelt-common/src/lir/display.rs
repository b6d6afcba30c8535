use std::fmt;

use super::{
    Block, Constant, GapPos, Instruction, Location, LocationKind, MoveOp, Operand, ParallelMove,
    Policy,
};

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocationKind::Register if self.rep.is_fp() => write!(f, "f{}", self.index),
            LocationKind::Register => write!(f, "r{}", self.index),
            LocationKind::FixedSlot => write!(f, "[fixed+{}]", self.index),
            LocationKind::TaggedSlot => write!(f, "[tagged+{}]", self.index),
            LocationKind::UntaggedSlot => write!(f, "[raw+{}]", self.index),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Invalid => write!(f, "invalid"),
            Operand::Constant {
                what: Constant::Immediate(value),
                ..
            } => write!(f, "#{value}"),
            Operand::Constant {
                what: Constant::Pool(vreg),
                ..
            } => write!(f, "pool(v{vreg})"),
            Operand::Unallocated { vreg, policy, .. } => match policy {
                Policy::Any => write!(f, "v{vreg}"),
                Policy::MustHaveRegister => write!(f, "v{vreg}:reg"),
                Policy::FixedRegister(index) => write!(f, "v{vreg}:r{index}"),
                Policy::FixedSlot(index) => write!(f, "v{vreg}:[fixed+{index}]"),
                Policy::SameAsInput(index) => write!(f, "v{vreg}:=in{index}"),
            },
            Operand::Allocated(loc) => write!(f, "{loc}"),
        }
    }
}

impl fmt::Display for MoveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_eliminated() {
            write!(f, "({} <- {})", self.to, self.from)
        } else {
            write!(f, "{} <- {}", self.to, self.from)
        }
    }
}

impl fmt::Display for ParallelMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for op in self.iter() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{op}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(gap) = self.gap(GapPos::Start) {
            if !gap.is_empty() {
                write!(f, "[{gap}] ")?;
            }
        }

        write!(f, "{:?}", self.opcode)?;

        for (ndx, output) in self.outputs.iter().enumerate() {
            let sep = if ndx == 0 { " " } else { ", " };
            write!(f, "{sep}{output}")?;
        }

        if !self.inputs.is_empty() {
            write!(f, " <-")?;
            for (ndx, input) in self.inputs.iter().enumerate() {
                let sep = if ndx == 0 { " " } else { ", " };
                write!(f, "{sep}{input}")?;
            }
        }

        if let Some(gap) = self.gap(GapPos::End) {
            if !gap.is_empty() {
                write!(f, " [{gap}]")?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        for phi in self.phis.iter() {
            write!(f, "  phi v{} <-", phi.output)?;
            for input in phi.inputs.iter() {
                write!(f, " {input}")?;
            }
            writeln!(f)?;
        }
        for inst in self.insts.iter() {
            writeln!(f, "  {inst}")?;
        }
        Ok(())
    }
}
