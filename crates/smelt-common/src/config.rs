/// Knobs for one backend run. Passed by reference into the pipeline so
/// compilation units stay deterministic and isolated; there is no ambient
/// global configuration.
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    /// Replace the critical-path scheduling policy with a seeded random one.
    /// A fuzzing aid for downstream stages, never a performance feature.
    pub stress_scheduling: bool,
    pub random_seed: u64,
    /// On-stack-replacement: the tagged spill region must cover at least the
    /// interpreter frame's slots.
    pub osr_tagged_floor: Option<usize>,
}
