use std::collections::HashMap;
use std::fmt::Write;
use std::ops::Range;

use smelt_common::lir::{Location, LocationKind, Rep, VirtualId};
use smelt_common::target::{AliasingKind, RegisterSetup};

use super::liveness::Liveness;

/// Which value sits where, at one program point. Cloned freely: block entry
/// and exit snapshots drive merge-point reconciliation, so the location map
/// is persistent.
#[derive(Clone, Debug)]
pub struct RegState {
    general: Vec<Option<VirtualId>>,
    floats: Vec<Option<VirtualId>>,
    fp_aliasing: AliasingKind,
    pub locations: im::HashMap<VirtualId, Location>,
}

/// Unit span of a floating-point register within the 64-bit-granular file.
/// With independent aliasing every width shares one index space; with
/// combining aliasing a 32-bit value owns its containing unit and a 128-bit
/// value owns two adjacent ones.
pub(super) fn fp_units(aliasing: AliasingKind, rep: Rep, index: usize) -> Range<usize> {
    match (aliasing, rep) {
        (AliasingKind::Independent, _) => index..index + 1,
        (AliasingKind::Combining, Rep::Float32) => index / 2..index / 2 + 1,
        (AliasingKind::Combining, Rep::Float64) => index..index + 1,
        (AliasingKind::Combining, Rep::Simd128) => index * 2..index * 2 + 2,
        _ => unreachable!("not a floating-point representation"),
    }
}

impl RegState {
    pub fn new(setup: &RegisterSetup) -> Self {
        Self {
            general: vec![None; setup.general],
            floats: vec![None; setup.floats],
            fp_aliasing: setup.fp_aliasing,
            locations: im::HashMap::new(),
        }
    }

    pub fn location(&self, vreg: VirtualId) -> Option<Location> {
        self.locations.get(&vreg).copied()
    }

    pub fn occupant(&self, rep: Rep, index: usize) -> Option<VirtualId> {
        if rep.is_fp() {
            fp_units(self.fp_aliasing, rep, index).find_map(|unit| self.floats[unit])
        } else {
            self.general[index]
        }
    }

    pub fn is_free(&self, rep: Rep, index: usize) -> bool {
        self.occupant(rep, index).is_none()
    }

    /// Record `vreg` at `loc`, claiming register occupancy when `loc` is a
    /// register. The previous location, if any, is released first.
    pub fn set(&mut self, vreg: VirtualId, loc: Location) {
        self.release(vreg);

        if loc.is_register() {
            if loc.rep.is_fp() {
                for unit in fp_units(self.fp_aliasing, loc.rep, loc.index) {
                    debug_assert!(self.floats[unit].is_none());
                    self.floats[unit] = Some(vreg);
                }
            } else {
                debug_assert!(self.general[loc.index].is_none());
                self.general[loc.index] = Some(vreg);
            }
        }

        self.locations.insert(vreg, loc);
    }

    /// Forget `vreg` entirely, freeing its register if it held one.
    pub fn release(&mut self, vreg: VirtualId) {
        let loc = match self.locations.remove(&vreg) {
            Some(loc) => loc,
            None => return,
        };

        if loc.is_register() {
            if loc.rep.is_fp() {
                for unit in fp_units(self.fp_aliasing, loc.rep, loc.index) {
                    self.floats[unit] = None;
                }
            } else {
                self.general[loc.index] = None;
            }
        }
    }

    /// First free register of the class, skipping `exclude` indices.
    pub fn free_register(&self, setup: &RegisterSetup, rep: Rep, exclude: &[usize]) -> Option<usize> {
        (0..setup.count(rep))
            .filter(|index| !exclude.contains(index))
            .find(|index| self.is_free(rep, *index))
    }

    /// Every value currently in a register.
    pub fn values_in_registers(&self) -> Vec<(VirtualId, Location)> {
        let mut values: Vec<(VirtualId, Location)> = self
            .locations
            .iter()
            .filter(|(_, loc)| loc.is_register())
            .map(|(vreg, loc)| (*vreg, *loc))
            .collect();
        values.sort_by_key(|(vreg, _)| *vreg);
        values
    }

    /// Human-readable snapshot for the tracing driver.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (vreg, loc) in self.values_in_registers() {
            let _ = write!(out, "v{vreg}={loc} ");
        }
        let mut slotted: Vec<(VirtualId, Location)> = self
            .locations
            .iter()
            .filter(|(_, loc)| loc.is_slot())
            .map(|(vreg, loc)| (*vreg, *loc))
            .collect();
        slotted.sort_by_key(|(vreg, _)| *vreg);
        for (vreg, loc) in slotted {
            let _ = write!(out, "v{vreg}={loc} ");
        }
        out.trim_end().to_string()
    }
}

/// The function's spill area. Slot assignments are permanent for a value's
/// lifetime; freed slots are reused for values whose live ranges don't
/// overlap any previous occupant. The region tops are the high-water marks
/// the frame is sized by.
#[derive(Debug, Default)]
pub struct SpillSlots {
    tagged: Vec<Vec<VirtualId>>,
    untagged: Vec<Vec<VirtualId>>,
    assigned: HashMap<VirtualId, Location>,
}

impl SpillSlots {
    /// The value's spill slot, allocating one first-fit if it has none yet.
    pub fn slot_for(&mut self, vreg: VirtualId, rep: Rep, liveness: &Liveness) -> Location {
        if let Some(loc) = self.assigned.get(&vreg) {
            return *loc;
        }

        let region = if rep.is_tagged() {
            &mut self.tagged
        } else {
            &mut self.untagged
        };

        let mut index = region.len();
        'slots: for (ndx, occupants) in region.iter().enumerate() {
            for other in occupants.iter() {
                if overlaps(liveness, vreg, *other) {
                    continue 'slots;
                }
            }
            index = ndx;
            break;
        }

        if index == region.len() {
            region.push(Vec::new());
        }
        region[index].push(vreg);

        let loc = Location::slot(index, rep);
        self.assigned.insert(vreg, loc);
        loc
    }

    /// Record that `vreg` now lives in `loc` even though `slot_for` never
    /// assigned it (a same-as-input output inheriting a slot), so reuse
    /// checks see the new resident.
    pub fn note_occupant(&mut self, vreg: VirtualId, loc: Location) {
        let region = match loc.kind {
            LocationKind::TaggedSlot => &mut self.tagged,
            LocationKind::UntaggedSlot => &mut self.untagged,
            _ => return,
        };

        if let Some(occupants) = region.get_mut(loc.index) {
            if !occupants.contains(&vreg) {
                occupants.push(vreg);
            }
        }
        self.assigned.insert(vreg, loc);
    }

    /// High-water marks: (tagged, untagged).
    pub fn tops(&self) -> (usize, usize) {
        (self.tagged.len(), self.untagged.len())
    }
}

fn overlaps(liveness: &Liveness, a: VirtualId, b: VirtualId) -> bool {
    match (liveness.ranges_of(a), liveness.ranges_of(b)) {
        (Some(a), Some(b)) => {
            let intersection = a.clone() & b.clone();
            !intersection.is_empty()
        }
        // No interval information means we cannot prove disjointness.
        _ => true,
    }
}
