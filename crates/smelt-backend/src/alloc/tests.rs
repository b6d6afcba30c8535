use std::collections::HashMap;

use smelt_common::config::BackendConfig;
use smelt_common::driver::SilentDriver;
use smelt_common::lir::{
    BlockId, Constant, GapPos, Instruction, Location, LocationKind, Opcode, Operand, ParallelMove,
    Phi, Policy, Rep, Sequence, SequenceBuilder, VirtualId,
};
use smelt_common::target::{AliasingKind, RegisterSetup};

use super::regalloc;

fn setup(general: usize) -> RegisterSetup {
    RegisterSetup {
        general,
        floats: 2,
        call_clobbers: (0..general / 2).collect(),
        float_call_clobbers: vec![0],
        exception_register: 0,
        fp_aliasing: AliasingKind::Independent,
    }
}

fn vreg(id: VirtualId) -> Operand {
    Operand::unallocated(id, Policy::Any, Rep::Word64)
}

fn in_reg(id: VirtualId) -> Operand {
    Operand::unallocated(id, Policy::MustHaveRegister, Rep::Word64)
}

fn run(sequence: &mut Sequence, setup: &RegisterSetup) {
    let config = BackendConfig::default();
    regalloc(&config, setup, &mut SilentDriver, sequence);
}

fn assert_fully_allocated(sequence: &Sequence) {
    for block in sequence.blocks.iter() {
        for phi in block.phis.iter() {
            for input in phi.inputs.iter() {
                assert!(
                    input.is_allocated() || input.is_constant(),
                    "{} has unallocated phi input {input}",
                    block.id
                );
            }
        }
        for inst in block.insts.iter() {
            for operand in inst
                .inputs
                .iter()
                .chain(inst.outputs.iter())
                .chain(inst.temps.iter())
            {
                assert!(
                    operand.is_allocated() || operand.is_constant(),
                    "unallocated operand {operand} in {inst}"
                );
            }
        }
    }
}

/// A value during replay, named by its definition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Value {
    Def(VirtualId),
    Const(Constant),
}

/// Canonical key for a physical place.
fn key(loc: &Location) -> (u8, usize, u8) {
    match loc.kind {
        LocationKind::Register if loc.rep.is_fp() => (0, loc.index, loc.rep as u8),
        LocationKind::Register => (1, loc.index, 0),
        LocationKind::FixedSlot => (2, loc.index, 0),
        LocationKind::TaggedSlot => (3, loc.index, 0),
        LocationKind::UntaggedSlot => (4, loc.index, 0),
    }
}

/// Replay one control-flow path through the allocated sequence against its
/// pre-allocation twin, checking that at every use the assigned location
/// holds exactly the value the virtual register named. Parallel moves read
/// all their sources before any destination is written; calls wipe the
/// caller-saved registers.
fn replay_path(pre: &Sequence, post: &Sequence, setup: &RegisterSetup, path: &[BlockId]) {
    let mut env: HashMap<(u8, usize, u8), Value> = HashMap::new();
    let mut phi_values: HashMap<VirtualId, Value> = HashMap::new();

    let resolve = |phi_values: &HashMap<VirtualId, Value>, vreg: VirtualId| -> Value {
        phi_values.get(&vreg).copied().unwrap_or(Value::Def(vreg))
    };

    let lookup = |env: &HashMap<(u8, usize, u8), Value>, operand: &Operand| -> Option<Value> {
        match operand {
            Operand::Allocated(loc) => env.get(&key(loc)).copied(),
            Operand::Constant { what, .. } => Some(Value::Const(*what)),
            _ => panic!("replay over unallocated operand {operand}"),
        }
    };

    fn exec_gap(env: &mut HashMap<(u8, usize, u8), Value>, gap: Option<&ParallelMove>) {
        let Some(gap) = gap else { return };
        let mut writes = Vec::new();
        for op in gap.iter() {
            if op.is_eliminated() {
                continue;
            }
            let value = match &op.from {
                Operand::Allocated(loc) => env.get(&key(loc)).copied(),
                Operand::Constant { what, .. } => Some(Value::Const(*what)),
                other => panic!("unallocated move source {other}"),
            };
            let to = op.to.location().expect("move into non-location");
            writes.push((key(&to), value));
        }
        for (to, value) in writes {
            match value {
                Some(value) => env.insert(to, value),
                None => env.remove(&to),
            };
        }
    }

    for (step, id) in path.iter().enumerate() {
        let pre_block = pre.block(*id);
        let post_block = post.block(*id);

        if step > 0 {
            let from = path[step - 1];
            let ndx = pre_block
                .preds
                .iter()
                .position(|pred| *pred == from)
                .expect("path does not follow an edge");

            for (pre_phi, post_phi) in pre_block.phis.iter().zip(post_block.phis.iter()) {
                let expected = match &pre_phi.inputs[ndx] {
                    Operand::Unallocated { vreg, .. } => resolve(&phi_values, *vreg),
                    Operand::Constant { what, .. } => Value::Const(*what),
                    other => panic!("unexpected phi input {other}"),
                };
                let actual = lookup(&env, &post_phi.inputs[ndx])
                    .unwrap_or_else(|| panic!("phi input location dead on edge into {id}"));
                assert_eq!(expected, actual, "phi v{} fed wrongly", pre_phi.output);
                phi_values.insert(pre_phi.output, actual);
            }
        }

        assert_eq!(pre_block.insts.len(), post_block.insts.len());

        for (pre_inst, post_inst) in pre_block.insts.iter().zip(post_block.insts.iter()) {
            exec_gap(&mut env, post_inst.gap(GapPos::Start));

            for (pre_in, post_in) in pre_inst.inputs.iter().zip(post_inst.inputs.iter()) {
                if let Operand::Unallocated { vreg, .. } = pre_in {
                    let expected = resolve(&phi_values, *vreg);
                    let actual = lookup(&env, post_in).unwrap_or_else(|| {
                        panic!("v{vreg} read from dead location {post_in} in {post_inst}")
                    });
                    assert_eq!(
                        expected, actual,
                        "v{vreg} read the wrong value from {post_in} in {post_inst}"
                    );
                }
            }

            for temp in post_inst.temps.iter() {
                if let Some(loc) = temp.location() {
                    env.remove(&key(&loc));
                }
            }

            if post_inst.is_call() {
                let clobbered: Vec<(u8, usize, u8)> = env
                    .keys()
                    .copied()
                    .filter(|(kind, index, _)| {
                        (*kind == 1 && setup.call_clobbers.contains(index))
                            || (*kind == 0 && setup.float_call_clobbers.contains(index))
                    })
                    .collect();
                for place in clobbered {
                    env.remove(&place);
                }
            }

            for (pre_out, post_out) in pre_inst.outputs.iter().zip(post_inst.outputs.iter()) {
                if let Operand::Unallocated { vreg, .. } = pre_out {
                    let loc = post_out
                        .location()
                        .unwrap_or_else(|| panic!("output v{vreg} not allocated"));
                    env.insert(key(&loc), Value::Def(*vreg));
                }
            }

            exec_gap(&mut env, post_inst.gap(GapPos::End));
        }
    }
}

#[test]
fn straight_line_is_fully_allocated() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Add, vec![vreg(1)], vec![in_reg(0), in_reg(0)]),
            Instruction::new(Opcode::Return, vec![], vec![vreg(1)]),
        ],
    );
    let mut sequence = builder.build();
    let pre = sequence.clone();

    let setup = setup(4);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    replay_path(&pre, &sequence, &setup, &[BlockId(0)]);
}

#[test]
fn spills_when_registers_run_out() {
    // Five simultaneously live values on a two-register machine.
    let mut builder = SequenceBuilder::new();
    let mut insts: Vec<Instruction> = (0..5)
        .map(|v| Instruction::new(Opcode::Materialize, vec![vreg(v)], vec![]))
        .collect();
    for v in 0..5 {
        insts.push(Instruction::new(
            Opcode::Add,
            vec![vreg(5 + v)],
            vec![in_reg(v), in_reg(v)],
        ));
    }
    insts.push(Instruction::new(Opcode::Return, vec![], vec![vreg(9)]));
    builder.add(vec![], vec![], insts);
    let mut sequence = builder.build();
    let pre = sequence.clone();

    let setup = setup(2);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    replay_path(&pre, &sequence, &setup, &[BlockId(0)]);
    // Something must have hit the stack.
    assert!(sequence.frame.untagged_slots > 0);
}

#[test]
fn fixed_register_input_is_honored() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(
                Opcode::Call,
                vec![],
                vec![Operand::unallocated(0, Policy::FixedRegister(3), Rep::Word64)],
            ),
            Instruction::new(Opcode::Return, vec![], vec![]),
        ],
    );
    let mut sequence = builder.build();
    let pre = sequence.clone();

    let setup = setup(4);
    run(&mut sequence, &setup);

    let call = &sequence.blocks[0].insts[1];
    assert_eq!(
        Some(Location::register(3, Rep::Word64)),
        call.inputs[0].location()
    );
    replay_path(&pre, &sequence, &setup, &[BlockId(0)]);
}

#[test]
fn same_as_input_shares_the_location() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(
                Opcode::Add,
                vec![Operand::unallocated(1, Policy::SameAsInput(0), Rep::Word64)],
                vec![in_reg(0), Operand::immediate(1, Rep::Word64)],
            ),
            Instruction::new(Opcode::Return, vec![], vec![vreg(1)]),
        ],
    );
    let mut sequence = builder.build();

    let setup = setup(4);
    run(&mut sequence, &setup);

    let add = &sequence.blocks[0].insts[1];
    assert_eq!(add.inputs[0].location(), add.outputs[0].location());
}

#[test]
fn value_survives_a_call() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Call, vec![], vec![]),
            Instruction::new(Opcode::Return, vec![], vec![in_reg(0)]),
        ],
    );
    let mut sequence = builder.build();
    let pre = sequence.clone();

    // Every register is caller-saved.
    let setup = RegisterSetup {
        call_clobbers: (0..2).collect(),
        ..setup(2)
    };
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    replay_path(&pre, &sequence, &setup, &[BlockId(0)]);
}

fn diamond_with_phi() -> Sequence {
    // b0 branches to b1/b2, which jump to b3 merging v1/v2 into a phi.
    let mut builder = SequenceBuilder::new();
    let b0 = builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Branch, vec![], vec![in_reg(0)]),
        ],
    );
    let b1 = builder.add(
        vec![b0],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(1)], vec![]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    let b2 = builder.add(
        vec![b0],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(2)], vec![]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    builder.add(
        vec![b1, b2],
        vec![Phi {
            output: 3,
            rep: Rep::Word64,
            inputs: vec![vreg(1), vreg(2)],
            exception_value: false,
        }],
        vec![Instruction::new(Opcode::Return, vec![], vec![in_reg(3)])],
    );
    let mut sequence = builder.build();
    sequence.vregs = 4;
    sequence
}

#[test]
fn phi_merges_both_paths() {
    let mut sequence = diamond_with_phi();
    let pre = sequence.clone();

    let setup = setup(4);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    replay_path(
        &pre,
        &sequence,
        &setup,
        &[BlockId(0), BlockId(1), BlockId(3)],
    );
    replay_path(
        &pre,
        &sequence,
        &setup,
        &[BlockId(0), BlockId(2), BlockId(3)],
    );
}

#[test]
fn divergent_merge_without_phi_reconciles() {
    // The same value flows around both sides of a diamond; one side forces
    // it into a fixed register so the predecessors disagree.
    let mut builder = SequenceBuilder::new();
    let b0 = builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Branch, vec![], vec![in_reg(0)]),
        ],
    );
    let b1 = builder.add(
        vec![b0],
        vec![],
        vec![
            // Defining v4 into v0's register pushes v0 somewhere else on
            // this side only.
            Instruction::new(
                Opcode::Materialize,
                vec![Operand::unallocated(4, Policy::FixedRegister(0), Rep::Word64)],
                vec![],
            ),
            Instruction::new(Opcode::Store, vec![], vec![in_reg(4)]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    let b2 = builder.add(
        vec![b0],
        vec![],
        vec![Instruction::new(Opcode::Jump, vec![], vec![])],
    );
    builder.add(
        vec![b1, b2],
        vec![],
        vec![Instruction::new(Opcode::Return, vec![], vec![in_reg(0)])],
    );
    let mut sequence = builder.build();
    let pre = sequence.clone();

    let setup = setup(4);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    replay_path(
        &pre,
        &sequence,
        &setup,
        &[BlockId(0), BlockId(1), BlockId(3)],
    );
    replay_path(
        &pre,
        &sequence,
        &setup,
        &[BlockId(0), BlockId(2), BlockId(3)],
    );
}

#[test]
fn loop_carried_value_stays_consistent() {
    // b0 -> b1 (header, phi) -> b2 (latch) -> b1, b1 -> b3 (exit).
    let mut builder = SequenceBuilder::new();
    let b0 = builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    let b1 = builder.add(
        vec![b0, BlockId(2)],
        vec![Phi {
            output: 1,
            rep: Rep::Word64,
            inputs: vec![vreg(0), vreg(2)],
            exception_value: false,
        }],
        vec![Instruction::new(Opcode::Branch, vec![], vec![in_reg(1)])],
    );
    let b2 = builder.add(
        vec![b1],
        vec![],
        vec![
            Instruction::new(Opcode::Add, vec![vreg(2)], vec![in_reg(1), in_reg(1)]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    assert_eq!(BlockId(2), b2);
    builder.add(
        vec![b1],
        vec![],
        vec![Instruction::new(Opcode::Return, vec![], vec![in_reg(1)])],
    );
    builder.loop_header(b1);
    let mut sequence = builder.build();
    sequence.vregs = 3;
    let pre = sequence.clone();

    let setup = setup(4);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    // Two trips around the loop, then out.
    replay_path(
        &pre,
        &sequence,
        &setup,
        &[
            BlockId(0),
            BlockId(1),
            BlockId(2),
            BlockId(1),
            BlockId(2),
            BlockId(1),
            BlockId(3),
        ],
    );
}

#[test]
fn handler_phi_lands_in_the_exception_register() {
    let mut builder = SequenceBuilder::new();
    let b0 = builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    let b1 = builder.add(
        vec![b0],
        vec![Phi {
            output: 1,
            rep: Rep::Tagged,
            inputs: vec![Operand::unallocated(0, Policy::Any, Rep::Tagged)],
            exception_value: true,
        }],
        vec![Instruction::new(
            Opcode::Return,
            vec![],
            vec![Operand::unallocated(1, Policy::Any, Rep::Tagged)],
        )],
    );
    builder.handler(b1);
    let mut sequence = builder.build();
    sequence.vregs = 2;

    let setup = setup(4);
    run(&mut sequence, &setup);

    let ret = &sequence.blocks[1].insts[0];
    assert_eq!(
        Some(Location::register(setup.exception_register, Rep::Tagged)),
        ret.inputs[0].location()
    );
}

#[test]
fn frame_totals_are_padded_to_odd() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Return, vec![], vec![vreg(0)]),
        ],
    );
    let mut sequence = builder.build();

    let setup = setup(4);
    run(&mut sequence, &setup);

    assert_eq!(1, sequence.frame.total_slots() % 2);
}

#[test]
fn osr_floors_the_tagged_region() {
    let mut builder = SequenceBuilder::new();
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![vreg(0)], vec![]),
            Instruction::new(Opcode::Return, vec![], vec![vreg(0)]),
        ],
    );
    let mut sequence = builder.build();

    let config = BackendConfig {
        osr_tagged_floor: Some(6),
        ..BackendConfig::default()
    };
    let setup = setup(4);
    regalloc(&config, &setup, &mut SilentDriver, &mut sequence);

    assert!(sequence.frame.tagged_slots >= 6);
    assert_eq!(1, sequence.frame.total_slots() % 2);
}

#[test]
fn tagged_and_untagged_values_spill_to_their_regions() {
    // One register: force both a tagged and an untagged value to spill.
    let mut builder = SequenceBuilder::new();
    let tagged = |v: VirtualId| Operand::unallocated(v, Policy::Any, Rep::Tagged);
    builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(Opcode::Materialize, vec![tagged(0)], vec![]),
            Instruction::new(Opcode::Materialize, vec![vreg(1)], vec![]),
            Instruction::new(Opcode::Materialize, vec![vreg(2)], vec![]),
            Instruction::new(
                Opcode::Add,
                vec![vreg(3)],
                vec![in_reg(1), in_reg(2)],
            ),
            Instruction::new(
                Opcode::Store,
                vec![],
                vec![
                    Operand::unallocated(0, Policy::MustHaveRegister, Rep::Tagged),
                    in_reg(3),
                ],
            ),
            Instruction::new(Opcode::Return, vec![], vec![]),
        ],
    );
    let mut sequence = builder.build();
    let pre = sequence.clone();

    let setup = setup(2);
    run(&mut sequence, &setup);

    assert_fully_allocated(&sequence);
    assert!(sequence.frame.tagged_slots >= 1);
    replay_path(&pre, &sequence, &setup, &[BlockId(0)]);
}
