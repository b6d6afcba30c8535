use smelt_common::lir::{Location, Operand, Rep};
use smelt_common::target::{AliasingKind, RegisterSetup};

/// Operand membership with canonical equality, plus the cross-width checks
/// combining floating-point aliasing demands: a register must not be judged
/// absent while a different-width value partially overlaps it.
pub struct OperandSet<'a> {
    setup: &'a RegisterSetup,
    set: Vec<Operand>,
    fp_reps: u8,
}

fn rep_bit(rep: Rep) -> u8 {
    match rep {
        Rep::Float32 => 1,
        Rep::Float64 => 2,
        Rep::Simd128 => 4,
        _ => 0,
    }
}

fn mixed(reps: u8) -> bool {
    reps != 0 && !reps.is_power_of_two()
}

impl<'a> OperandSet<'a> {
    pub fn new(setup: &'a RegisterSetup) -> Self {
        Self {
            setup,
            set: Vec::new(),
            fp_reps: 0,
        }
    }

    pub fn insert(&mut self, operand: &Operand) {
        self.set.push(*operand);

        if self.setup.fp_aliasing == AliasingKind::Combining && operand.is_fp_register() {
            let loc = operand.location().unwrap();
            self.fp_reps |= rep_bit(loc.rep);
        }
    }

    pub fn contains(&self, operand: &Operand) -> bool {
        self.set.iter().any(|member| member.same_place(operand))
    }

    pub fn contains_or_aliases(&self, operand: &Operand) -> bool {
        if self.contains(operand) {
            return true;
        }

        if self.setup.fp_aliasing == AliasingKind::Combining && operand.is_fp_register() {
            let loc = operand.location().unwrap();

            // Unless widths actually mix, plain membership was enough.
            if !mixed(self.fp_reps | rep_bit(loc.rep)) {
                return false;
            }

            let others: [Rep; 2] = match loc.rep {
                Rep::Float32 => [Rep::Float64, Rep::Simd128],
                Rep::Float64 => [Rep::Float32, Rep::Simd128],
                Rep::Simd128 => [Rep::Float32, Rep::Float64],
                _ => unreachable!(),
            };

            for other in others {
                let (base, count) = self.setup.aliases(loc.rep, loc.index, other);
                for index in base..base + count {
                    let alias = Operand::Allocated(Location::register(index, other));
                    if self.contains(&alias) {
                        return true;
                    }
                }
            }
        }

        false
    }
}
