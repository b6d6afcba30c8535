use crate::lir::BlockId;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    Schedule,
    Allocate,
    Moves,
}

/// Diagnostics sink handed through the pipeline. Implementations receive
/// human-readable dumps and must never influence what the passes do; every
/// hook defaults to doing nothing, and passes skip building dumps entirely
/// unless `tracing` says otherwise.
pub trait Driver {
    fn tracing(&self) -> bool {
        false
    }

    fn trace_block(&mut self, phase: Phase, block: BlockId, dump: String) {
        let _ = (phase, block, dump);
    }

    fn trace_registers(&mut self, block: BlockId, state: String) {
        let _ = (block, state);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SilentDriver;

impl Driver for SilentDriver {}
