use smelt_common::config::BackendConfig;
use smelt_common::driver::{Driver, Phase, SilentDriver};
use smelt_common::lir::{
    BlockId, Instruction, Opcode, Operand, Phi, Policy, Rep, Sequence, SequenceBuilder, VirtualId,
};
use smelt_common::target::{AliasingKind, GenericTarget, RegisterSetup};

use super::run_backend;

fn setup() -> RegisterSetup {
    RegisterSetup {
        general: 4,
        floats: 2,
        call_clobbers: vec![0, 1],
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

/// A loop summing loads until a condition, with a call in the exit path:
/// touches scheduling, phis, back edges, spilling and move optimization.
fn whole_function() -> Sequence {
    let mut builder = SequenceBuilder::new();

    let b0 = builder.add(
        vec![],
        vec![],
        vec![
            Instruction::new(
                Opcode::Parameter,
                vec![Operand::unallocated(0, Policy::FixedRegister(2), Rep::Word64)],
                vec![],
            ),
            Instruction::new(Opcode::Materialize, vec![vreg(1)], vec![]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );

    let b1 = builder.add(
        vec![b0, BlockId(2)],
        vec![Phi {
            output: 2,
            rep: Rep::Word64,
            inputs: vec![vreg(1), vreg(4)],
            exception_value: false,
        }],
        vec![
            Instruction::new(Opcode::Compare, vec![vreg(5)], vec![in_reg(2), in_reg(0)]),
            Instruction::new(Opcode::Branch, vec![], vec![in_reg(5)]),
        ],
    );

    let b2 = builder.add(
        vec![b1],
        vec![],
        vec![
            Instruction::new(Opcode::Load, vec![vreg(3)], vec![in_reg(0)]),
            Instruction::new(Opcode::Add, vec![vreg(4)], vec![in_reg(2), in_reg(3)]),
            Instruction::new(Opcode::Jump, vec![], vec![]),
        ],
    );
    assert_eq!(BlockId(2), b2);

    builder.add(
        vec![b1],
        vec![],
        vec![
            Instruction::new(
                Opcode::Call,
                vec![],
                vec![Operand::unallocated(2, Policy::FixedRegister(0), Rep::Word64)],
            ),
            Instruction::new(Opcode::Return, vec![], vec![in_reg(2)]),
        ],
    );

    builder.loop_header(b1);
    let mut sequence = builder.build();
    sequence.vregs = 6;
    sequence
}

#[test]
fn pipeline_leaves_nothing_unallocated() {
    let mut sequence = whole_function();
    let config = BackendConfig::default();
    let setup = setup();

    run_backend(
        &config,
        &setup,
        &GenericTarget,
        &mut SilentDriver,
        &mut sequence,
    );

    for block in sequence.blocks.iter() {
        for phi in block.phis.iter() {
            for input in phi.inputs.iter() {
                assert!(input.is_allocated() || input.is_constant());
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

    assert_eq!(1, sequence.frame.total_slots() % 2);
}

#[test]
fn pipeline_preserves_every_instruction() {
    let mut sequence = whole_function();
    let counts: Vec<usize> = sequence.blocks.iter().map(|b| b.insts.len()).collect();
    let opcodes: Vec<Vec<Opcode>> = sequence
        .blocks
        .iter()
        .map(|b| {
            let mut ops: Vec<Opcode> = b.insts.iter().map(|i| i.opcode).collect();
            ops.sort_by_key(|op| format!("{op:?}"));
            ops
        })
        .collect();

    run_backend(
        &BackendConfig::default(),
        &setup(),
        &GenericTarget,
        &mut SilentDriver,
        &mut sequence,
    );

    for (block, (count, mut expected)) in sequence
        .blocks
        .iter()
        .zip(counts.into_iter().zip(opcodes.into_iter()))
    {
        assert_eq!(count, block.insts.len());
        let mut ops: Vec<Opcode> = block.insts.iter().map(|i| i.opcode).collect();
        ops.sort_by_key(|op| format!("{op:?}"));
        expected.sort_by_key(|op| format!("{op:?}"));
        assert_eq!(expected, ops);
    }
}

#[test]
fn stressed_schedules_still_allocate() {
    for seed in 0..8 {
        let mut sequence = whole_function();
        let config = BackendConfig {
            stress_scheduling: true,
            random_seed: seed,
            ..BackendConfig::default()
        };

        run_backend(
            &config,
            &setup(),
            &GenericTarget,
            &mut SilentDriver,
            &mut sequence,
        );

        for block in sequence.blocks.iter() {
            for inst in block.insts.iter() {
                for operand in inst.inputs.iter().chain(inst.outputs.iter()) {
                    assert!(operand.is_allocated() || operand.is_constant());
                }
            }
        }
    }
}

/// Tracing must observe without steering: the same input with and without a
/// recording driver must come out identical.
#[test]
fn tracing_changes_nothing() {
    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
    }

    impl Driver for Recorder {
        fn tracing(&self) -> bool {
            true
        }

        fn trace_block(&mut self, _phase: Phase, _block: BlockId, dump: String) {
            self.lines.push(dump);
        }

        fn trace_registers(&mut self, _block: BlockId, state: String) {
            self.lines.push(state);
        }
    }

    let config = BackendConfig::default();
    let setup = setup();

    let mut silent = whole_function();
    run_backend(
        &config,
        &setup,
        &GenericTarget,
        &mut SilentDriver,
        &mut silent,
    );

    let mut recorder = Recorder::default();
    let mut traced = whole_function();
    run_backend(&config, &setup, &GenericTarget, &mut recorder, &mut traced);

    assert_eq!(silent, traced);
    assert!(!recorder.lines.is_empty());
}
