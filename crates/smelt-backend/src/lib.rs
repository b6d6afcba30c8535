pub use alloc::regalloc;
pub use moves::optimize_moves;
pub use sched::{schedule, Scheduler};

mod alloc;
mod moves;
mod sched;

#[cfg(test)]
mod tests;

use log::info;
use smelt_common::config::BackendConfig;
use smelt_common::driver::Driver;
use smelt_common::lir::Sequence;
use smelt_common::target::{RegisterSetup, TargetClassifier};

/// The whole backend for one compilation unit, run to completion: schedule,
/// then allocate, then optimize moves. The stages are strictly sequential
/// (each one's invariants are the next one's preconditions) and everything
/// happens in memory on the caller's thread. On return every operand is
/// `Allocated` or `Constant`, the frame records its spill-slot high-water
/// marks, and redundant moves are gone; the sequence is ready for an
/// external emitter.
pub fn run_backend(
    config: &BackendConfig,
    setup: &RegisterSetup,
    target: &dyn TargetClassifier,
    driver: &mut dyn Driver,
    sequence: &mut Sequence,
) {
    info!("running backend over {} blocks", sequence.blocks.len());

    sched::schedule(config, target, driver, sequence);
    alloc::regalloc(config, setup, driver, sequence);
    moves::optimize_moves(setup, driver, sequence);
}
