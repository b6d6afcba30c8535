use super::graph::{Graph, NodeId};

/// Picks the next node to emit from the ready set. Implementations must pop
/// only nodes present in `ready`; returning `None` stalls the current cycle.
pub trait Policy {
    fn pick(&mut self, ready: &mut Vec<NodeId>, graph: &Graph, cycle: u32) -> Option<NodeId>;
}

/// Default policy: heaviest critical path first, ties broken by program
/// order so schedules are deterministic and stable. Nodes whose start cycle
/// lies in the future are left waiting.
#[derive(Debug, Default)]
pub struct CriticalPathFirst;

impl Policy for CriticalPathFirst {
    fn pick(&mut self, ready: &mut Vec<NodeId>, graph: &Graph, cycle: u32) -> Option<NodeId> {
        let mut best: Option<usize> = None;

        for (ndx, id) in ready.iter().enumerate() {
            if graph.node(*id).start_cycle > cycle {
                continue;
            }

            best = match best {
                None => Some(ndx),
                Some(prev) => {
                    let cand = graph.node(*id).total_latency;
                    let curr = graph.node(ready[prev]).total_latency;
                    if cand > curr || (cand == curr && *id < ready[prev]) {
                        Some(ndx)
                    } else {
                        Some(prev)
                    }
                }
            };
        }

        best.map(|ndx| ready.swap_remove(ndx))
    }
}

/// Stress policy: a uniformly random legal pick, driven by a deterministic
/// generator so failures reproduce. Exercises downstream tolerance to any
/// legal order; never a performance path.
#[derive(Debug)]
pub struct Stress {
    rng: Shuffle,
}

impl Stress {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Shuffle::new(seed),
        }
    }
}

impl Policy for Stress {
    fn pick(&mut self, ready: &mut Vec<NodeId>, _graph: &Graph, _cycle: u32) -> Option<NodeId> {
        if ready.is_empty() {
            return None;
        }

        let ndx = self.rng.below(ready.len());
        Some(ready.swap_remove(ndx))
    }
}

/// Small xorshift generator; quality only needs to be good enough to visit
/// many legal schedules.
#[derive(Debug)]
pub struct Shuffle {
    state: u64,
}

impl Shuffle {
    pub fn new(seed: u64) -> Self {
        Self {
            state: (seed ^ 0x9e37_79b9_7f4a_7c15) | 1,
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}
