use std::collections::HashMap;

use log::{debug, info, trace};
use smelt_common::config::BackendConfig;
use smelt_common::driver::{Driver, Phase};
use smelt_common::lir::{Flags, Instruction, Opcode, Policy as OperandPolicy, Sequence, VirtualId};
use smelt_common::target::TargetClassifier;

use self::graph::{Graph, NodeId};
use self::queue::{CriticalPathFirst, Policy, Stress};

mod graph;
mod queue;


/// Reorder every block's instructions within the bounds of their dependency
/// graph. The sequence keeps its blocks and operands; only the order of
/// instructions inside each block changes.
pub fn schedule(
    config: &BackendConfig,
    target: &dyn TargetClassifier,
    driver: &mut dyn Driver,
    sequence: &mut Sequence,
) {
    info!("scheduling {} blocks", sequence.blocks.len());

    let mut scheduler = Scheduler::new(config, target);

    for block in sequence.blocks.iter_mut() {
        let insts = std::mem::take(&mut block.insts);
        let count = insts.len();

        scheduler.start_block();

        let mut insts = insts.into_iter();
        let terminator = insts
            .next_back()
            .expect("block without instructions");
        assert!(terminator.is_terminator());

        for inst in insts {
            scheduler.add_instruction(inst);
        }
        scheduler.add_terminator(terminator);

        block.insts = scheduler.end_block();
        assert_eq!(count, block.insts.len());

        debug!("scheduled {} ({count} instructions)", block.id);
        if driver.tracing() {
            driver.trace_block(Phase::Schedule, block.id, format!("{block}"));
        }
    }

    trace!("done scheduling");
}

/// Builds the dependency graph for one block at a time and drains it into a
/// new total order. All state is block-scoped: `start_block` asserts the
/// previous block left nothing behind.
///
/// Virtual registers are expected to be defined at most once per block; a
/// lowering stage that emits several definitions of the same register in one
/// block would under-constrain the graph (last writer wins here).
pub struct Scheduler<'a> {
    target: &'a dyn TargetClassifier,
    policy: Box<dyn Policy>,
    graph: Graph,
    out: Vec<Instruction>,
    last_side_effect: Option<NodeId>,
    pending_loads: Vec<NodeId>,
    last_live_in_marker: Option<NodeId>,
    last_deopt_or_trap: Option<NodeId>,
    definers: HashMap<VirtualId, NodeId>,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &BackendConfig, target: &'a dyn TargetClassifier) -> Self {
        let policy: Box<dyn Policy> = if config.stress_scheduling {
            Box::new(Stress::new(config.random_seed))
        } else {
            Box::new(CriticalPathFirst)
        };

        Self {
            target,
            policy,
            graph: Graph::default(),
            out: Vec::new(),
            last_side_effect: None,
            pending_loads: Vec::new(),
            last_live_in_marker: None,
            last_deopt_or_trap: None,
            definers: HashMap::new(),
        }
    }

    pub fn start_block(&mut self) {
        assert!(self.graph.is_empty());
        assert!(self.out.is_empty());
        assert!(self.last_side_effect.is_none());
        assert!(self.pending_loads.is_empty());
        assert!(self.last_live_in_marker.is_none());
        assert!(self.last_deopt_or_trap.is_none());
        assert!(self.definers.is_empty());
    }

    pub fn add_instruction(&mut self, instruction: Instruction) {
        let flags = instruction.opcode.flags(self.target);

        if flags.contains(Flags::BARRIER) {
            // Barriers never reorder relative to anything: flush whatever
            // is pending, then emit the barrier directly.
            self.flush();
            self.out.push(instruction);
            return;
        }

        let latency = self.target.latency(&instruction.opcode);
        let fixed_parameter = is_fixed_parameter(&instruction);
        let inputs: Vec<VirtualId> = instruction
            .inputs
            .iter()
            .filter(|input| input.is_unallocated())
            .filter_map(|input| input.vreg())
            .collect();
        let outputs: Vec<VirtualId> = instruction
            .outputs
            .iter()
            .filter_map(|output| output.vreg())
            .collect();

        let id = self.graph.add(instruction, latency);

        if fixed_parameter {
            // Register-defining pseudo-instructions chain in order; every
            // later node gets an edge from the last of them.
            if let Some(marker) = self.last_live_in_marker {
                self.graph.add_edge(marker, id);
            }
            self.last_live_in_marker = Some(id);
        } else {
            if let Some(marker) = self.last_live_in_marker {
                self.graph.add_edge(marker, id);
            }

            if let Some(last) = self.last_deopt_or_trap {
                if flags.intersects(Flags::DEOPT_OR_TRAP | Flags::SIDE_EFFECT | Flags::LOAD) {
                    self.graph.add_edge(last, id);
                }
            }

            if flags.contains(Flags::SIDE_EFFECT) {
                if let Some(last) = self.last_side_effect {
                    self.graph.add_edge(last, id);
                }
                for load in std::mem::take(&mut self.pending_loads) {
                    self.graph.add_edge(load, id);
                }
                self.last_side_effect = Some(id);
            } else if flags.contains(Flags::LOAD) {
                // Loads reorder among themselves but never cross a side
                // effect.
                if let Some(last) = self.last_side_effect {
                    self.graph.add_edge(last, id);
                }
                self.pending_loads.push(id);
            } else if flags.contains(Flags::DEOPT_OR_TRAP) {
                if let Some(last) = self.last_side_effect {
                    self.graph.add_edge(last, id);
                }
            }

            if flags.contains(Flags::DEOPT_OR_TRAP) {
                self.last_deopt_or_trap = Some(id);
            }

            for vreg in inputs {
                if let Some(def) = self.definers.get(&vreg) {
                    self.graph.add_edge(*def, id);
                }
            }
        }

        for vreg in outputs {
            self.definers.insert(vreg, id);
        }
    }

    /// Terminators are pinned to the end of the block: every pending node
    /// becomes a predecessor.
    pub fn add_terminator(&mut self, instruction: Instruction) {
        let latency = self.target.latency(&instruction.opcode);
        let id = self.graph.add(instruction, latency);
        for other in 0..id {
            self.graph.add_edge(other, id);
        }
    }

    pub fn end_block(&mut self) -> Vec<Instruction> {
        self.flush();
        std::mem::take(&mut self.out)
    }

    /// Schedule everything currently in the graph into the output, then
    /// reset all block-local state.
    fn flush(&mut self) {
        self.graph.compute_total_latencies();

        let mut ready = self.graph.ready();
        let mut emitted = 0;
        let mut cycle = 0;

        while emitted < self.graph.len() {
            if let Some(id) = self.policy.pick(&mut ready, &self.graph, cycle) {
                let latency = self.graph.node(id).latency;
                let succs = self.graph.node(id).succs.clone();

                self.out.push(self.graph.take_instruction(id));
                emitted += 1;

                for succ in succs {
                    let node = self.graph.node_mut(succ);
                    node.unscheduled_preds -= 1;
                    node.start_cycle = node.start_cycle.max(cycle + latency);
                    if node.unscheduled_preds == 0 {
                        ready.push(succ);
                    }
                }
            }

            cycle += 1;
        }

        assert!(ready.is_empty());

        self.graph.clear();
        self.definers.clear();
        self.pending_loads.clear();
        self.last_side_effect = None;
        self.last_live_in_marker = None;
        self.last_deopt_or_trap = None;
    }
}

/// A fixed-location parameter-defining no-op at function entry.
fn is_fixed_parameter(instruction: &Instruction) -> bool {
    instruction.opcode == Opcode::Parameter
        && !instruction.outputs.is_empty()
        && instruction.outputs.iter().all(|output| {
            matches!(
                output,
                smelt_common::lir::Operand::Unallocated {
                    policy: OperandPolicy::FixedRegister(_) | OperandPolicy::FixedSlot(_),
                    ..
                }
            )
        })
}
