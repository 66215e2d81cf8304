//! End-to-end coverage of the assembler/VM pipeline: the seed scenarios
//! and cross-module invariants that no single unit test spans alone.

use cellforge::config::WorldConfig;
use cellforge::environment::{coord, Environment};
use cellforge::error::{AssemblyErrorKind, VmFault};
use cellforge::isa::{InstructionSet, Opcode, RegisterId};
use cellforge::molecule::{Molecule, MoleculeType};
use cellforge::organism::{Organism, RegisterValue};
use cellforge::vm::VirtualMachine;
use cellforge::{assemble_program, Artifact};

use proptest::prelude::*;
use std::sync::Arc;

fn load(artifact: &Arc<Artifact>, shape: &[i64]) -> Environment {
    let mut env = Environment::new(shape, true);
    artifact.load_into(&mut env);
    env
}

// --- Seed scenario 1: macro arity mismatch -------------------------------

#[test]
fn macro_arity_mismatch_names_the_macro_and_the_line() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".MACRO $INC x\nADDI x 1\n.ENDM\n$INC A B\n";
    let err = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap_err();
    assert!(matches!(err.kind, AssemblyErrorKind::Arity(_)));
    assert!(err.text.contains("$INC") || matches!(&err.kind, AssemblyErrorKind::Arity(msg) if msg.contains("$INC")));
    assert_eq!(err.location.line, 4);
}

// --- Seed scenario 2: include deduplication -------------------------------

#[test]
fn second_include_of_the_same_signature_trampolines_to_the_first() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".ROUTINE FOO x\nADDI %x 1\n.ENDR\n.INCLUDE FOO AS A WITH %DR0\n.INCLUDE FOO AS B WITH %DR0\nCALL A\nCALL B\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let env = load(&artifact, &[16, 16]);

    let a_coord = artifact.label_to_coord["A"].clone();
    let b_coord = artifact.label_to_coord["B"].clone();
    assert_ne!(a_coord, b_coord);

    // B's body is exactly one JMPI targeting A.
    let text = cellforge::disassembler::disassemble_at(&env, &b_coord, config.dims(), Some(&artifact)).unwrap();
    assert_eq!(text, "JMPI A");

    // A's body is the fully expanded routine: an ADDI, not a jump.
    let text_a = cellforge::disassembler::disassemble_at(&env, &a_coord, config.dims(), Some(&artifact)).unwrap();
    assert!(text_a.starts_with("ADDI"));
}

// --- Seed scenario 3: jump back-patching ----------------------------------

#[test]
fn jump_delta_cells_hold_target_minus_opcode_and_the_vm_jumps_unconditionally() {
    let config = WorldConfig::new(vec![32, 32]);
    // JMPR occupies 3 cells (opcode + 2-component delta); three NOPs follow
    // before the label, landing it at address 5.
    let src = "JMPR L\nNOP\nNOP\nL:\nNOP\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[32, 32]);

    let opcode_coord = artifact.address_to_coord[0].clone();
    let target_coord = artifact.label_to_coord["L"].clone();
    assert_eq!(target_coord, coord(&[5, 0]));

    let delta_word0 = env.get(&artifact.address_to_coord[1]);
    let delta_word1 = env.get(&artifact.address_to_coord[2]);
    assert_eq!(delta_word0.scalar(), target_coord[0] - opcode_coord[0]);
    assert_eq!(delta_word1.scalar(), target_coord[1] - opcode_coord[1]);

    // Executing JMPR sets IP = ip + delta, regardless of DV's own value:
    // the planner never multiplies the delta by DV.
    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;
    vm.tick(&mut organism, &mut env);
    assert_eq!(organism.ip, coord(&[5, 0]));
}

// --- Seed scenario 4: register-ABI CALL through .WITH ---------------------

#[test]
fn with_call_copies_in_runs_the_body_and_copies_the_result_back() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".PROC SQ WITH x\nADDI %x 1\nRET\n.ENDP\n.WITH %DR3\nCALL SQ\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[16, 16]);

    // The source-level expansion reads `SETR %DR0 %DR3` (see passes.rs's
    // `with_clause_expands_to_literal_setr_copy_in_and_copy_out`); a
    // register source resolves to the `MOVR` opcode at assembly time (the
    // only opcode whose argument shape dereferences both operands live),
    // so disassembling the compiled artifact shows the opcode that is
    // actually executed.
    let residual = cellforge::disassembler::disassemble_artifact(&env, &artifact, config.dims());
    let residual_texts: Vec<&str> = residual
        .iter()
        .take_while(|(c, _)| *c != artifact.label_to_coord["SQ"])
        .map(|(_, t)| t.as_str())
        .collect();
    assert_eq!(residual_texts, ["MOVR %DR0 %DR3", "CALL SQ", "MOVR %DR3 %DR0"]);

    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 1000, &config);
    organism.write_register(RegisterId::data(3), RegisterValue::Scalar(6)).unwrap();
    let mut vm = VirtualMachine;
    // copy-in, CALL, ADDI, RET, copy-out
    for _ in 0..5 {
        vm.tick(&mut organism, &mut env);
    }
    assert_eq!(organism.read_register(RegisterId::data(3)).unwrap().as_scalar(), Some(7));
    // A register never bound as an actual is untouched by the call.
    assert_eq!(organism.read_register(RegisterId::data(1)).unwrap().as_scalar(), Some(0));
}

// --- Directional layout directives -----------------------------------------

#[test]
fn place_seeds_a_world_owned_cell_independent_of_code_layout() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".PLACE ENERGY:9 at 10|10\nNOP\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let env = load(&artifact, &[16, 16]);

    let placed = env.get(&coord(&[10, 10]));
    assert_eq!(placed.ty(), MoleculeType::Energy);
    assert_eq!(placed.scalar(), 9);
    assert_eq!(env.owner(&coord(&[10, 10])), 0);
    // .PLACE never moved the instruction cursor: NOP still sits at the origin.
    assert_eq!(env.get(&coord(&[0, 0])).ty(), MoleculeType::Code);
}

#[test]
fn org_and_dir_relocate_and_reorient_subsequent_layout() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".ORG 2|2\n.DIR 0|1\nADDI %DR0 5\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let env = load(&artifact, &[16, 16]);

    assert_eq!(artifact.address_to_coord[0], coord(&[2, 2]));
    assert_eq!(artifact.address_to_coord[1], coord(&[2, 3]));
    assert_eq!(artifact.address_to_coord[2], coord(&[2, 4]));
    assert!(env.get(&coord(&[0, 0])).is_empty());
}

#[test]
fn reg_alias_resolves_to_the_dr_slot_it_names() {
    let config = WorldConfig::new(vec![16, 16]);
    let src = ".REG SPEED 3\nADDI %SPEED 5\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[16, 16]);
    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;
    vm.tick(&mut organism, &mut env);
    assert_eq!(organism.read_register(RegisterId::data(3)).unwrap().as_scalar(), Some(5));
}

// --- Seed scenario 5: toroidal wrap ----------------------------------------

#[test]
fn an_instruction_landing_on_the_edge_wraps_the_instruction_pointer() {
    let config = WorldConfig::new(vec![4, 4]);
    let mut env = Environment::new(&[4, 4], true);
    env.set(&coord(&[3, 0]), Molecule::code(Opcode::Nop.to_u32() as i64));
    let artifact_config = config.clone();
    let _ = artifact_config;

    // A bare organism with no real artifact: NOP only reads its own opcode
    // cell, so a placeholder artifact built over an empty program is fine.
    let raw: Vec<_> = cellforge::source::LineSource::new("t.asm", "NOP\n").non_blank().cloned().collect();
    let tables = cellforge::definitions::extract(&raw).unwrap();
    let registers = cellforge::passes::build_register_table(&config, &tables.register_aliases, None);
    let mut program = cellforge::passes::assemble(
        &tables.residual,
        &hashbrown::HashMap::new(),
        &tables,
        &config,
        coord(&[0, 0]),
    )
    .unwrap();
    cellforge::resolver::resolve(&mut program).unwrap();
    let artifact = Artifact::build(program, coord(&[0, 0]), registers, tables.procs).unwrap();

    let mut organism = Organism::new(1, 0, artifact, coord(&[3, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;
    vm.tick(&mut organism, &mut env);
    assert_eq!(organism.ip, coord(&[0, 0]));
}

// --- Seed scenario 6: failure + penalty ------------------------------------

#[test]
fn a_bad_register_operand_faults_with_penalty_and_snapshots_the_call_stack() {
    let config = WorldConfig::new(vec![16, 16]);
    // F's body: ADDI %DR0 1; RET. We corrupt the register argument of ADDI
    // after loading cells into the environment, pointing it at a register
    // id outside every configured bank, bypassing assembly-time name
    // resolution entirely (source text can only ever name a declared
    // register).
    let src = ".PROC F\nADDI %DR0 1\nRET\n.ENDP\nCALL F\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[16, 16]);

    let f_coord = artifact.label_to_coord["F"].clone();
    let bad_reg_coord = coord(&[f_coord[0] + 1, f_coord[1]]);
    env.set(&bad_reg_coord, Molecule::code(99_999));

    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;

    // Tick 1: CALL F, pushing one call frame.
    let before_call_er = organism.er;
    vm.tick(&mut organism, &mut env);
    assert_eq!(organism.call_stack.len(), 1);
    let call_stack_snapshot: Vec<_> = organism.call_stack.iter().map(|f| f.return_ip.clone()).collect();
    assert_eq!(organism.er, before_call_er - config.energy_cost(Opcode::Call, 1));

    // Tick 2: the corrupted ADDI faults.
    let before_fault_er = organism.er;
    let outcome = vm.tick(&mut organism, &mut env);
    assert!(organism.instruction_failed);
    assert_eq!(organism.failure_reason, Some(VmFault::InvalidRegister(99_999)));
    assert_eq!(outcome.failure, Some(VmFault::InvalidRegister(99_999)));

    let expected_cost = config.energy_cost(Opcode::Addi, 1) + config.error_penalty;
    assert_eq!(organism.er, before_fault_er - expected_cost);

    let failed_snapshot: Vec<_> = organism.failure_call_stack.iter().map(|f| f.return_ip.clone()).collect();
    assert_eq!(failed_snapshot, call_stack_snapshot);
}

// --- Universal properties --------------------------------------------------

proptest! {
    #[test]
    fn molecule_pack_unpack_round_trips(tag in 0u32..4, value in cellforge::molecule::MIN_VALUE..=cellforge::molecule::MAX_VALUE) {
        let ty = MoleculeType::from_tag(tag).unwrap();
        let molecule = Molecule::pack(ty, value);
        let (unpacked_ty, unpacked_value) = molecule.unpack().unwrap();
        prop_assert_eq!(unpacked_ty, ty);
        prop_assert_eq!(unpacked_value, value);
    }
}

#[test]
fn code_zero_is_the_only_zero_word() {
    assert_eq!(Molecule::pack(MoleculeType::Code, 0).raw(), 0);
    for ty in [MoleculeType::Data, MoleculeType::Energy, MoleculeType::Structure] {
        assert_ne!(Molecule::pack(ty, 0).raw(), 0);
    }
}

#[test]
fn cell_count_equals_sum_of_instruction_lengths() {
    let config = WorldConfig::new(vec![16, 16]);
    let artifact = assemble_program("t.asm", "NOP\nADDI %DR0 1\nJMPR L\nL:\nNOP\n", &config, coord(&[0, 0])).unwrap();
    let isa = InstructionSet::global();
    let expected: usize = [Opcode::Nop, Opcode::Addi, Opcode::Jmpr, Opcode::Nop]
        .iter()
        .map(|op| isa.length(*op, config.dims()))
        .sum();
    assert_eq!(artifact.len(), expected);
}

#[test]
fn address_and_coordinate_maps_are_mutual_inverses() {
    let config = WorldConfig::new(vec![16, 16]);
    let artifact = assemble_program("t.asm", "NOP\nADDI %DR0 1\nNOP\n", &config, coord(&[0, 0])).unwrap();
    for address in 0..artifact.len() {
        let c = &artifact.address_to_coord[address];
        assert_eq!(artifact.coord_to_address[c], address);
    }
}

#[test]
fn with_call_cell_count_matches_the_copy_in_call_copy_out_contract() {
    let config = WorldConfig::new(vec![16, 16]);
    // Formals a, b bind to %DR0, %DR1; actuals %DR2, %DR3 share neither
    // slot, so no copy is elided.
    let src = ".PROC ADD WITH a b\nRET\n.ENDP\n.WITH %DR2, %DR3\nCALL ADD\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let isa = InstructionSet::global();
    let movr_len = isa.length(Opcode::Movr, config.dims());
    let call_len = isa.length(Opcode::Call, config.dims());
    let ret_len = isa.length(Opcode::Ret, config.dims());
    // k=2 actuals, none elided (no identity moves): 2 copy-in + 1 CALL + 2 copy-out.
    let residual_len = movr_len * 4 + call_len;
    assert_eq!(artifact.len(), residual_len + ret_len);
}

#[test]
fn with_call_elides_copies_already_in_their_formal_slot() {
    let config = WorldConfig::new(vec![16, 16]);
    // The first actual (%DR0) already sits in formal a's slot, so only
    // formal b's copy-in/copy-out survive.
    let src = ".PROC ADD WITH a b\nRET\n.ENDP\n.WITH %DR0, %DR3\nCALL ADD\n";
    let artifact = assemble_program("t.asm", src, &config, coord(&[0, 0])).unwrap();
    let isa = InstructionSet::global();
    let movr_len = isa.length(Opcode::Movr, config.dims());
    let call_len = isa.length(Opcode::Call, config.dims());
    let ret_len = isa.length(Opcode::Ret, config.dims());
    let residual_len = movr_len * 2 + call_len;
    assert_eq!(artifact.len(), residual_len + ret_len);
}

#[test]
fn energy_accounting_matches_cost_plus_penalty_on_failure() {
    let config = WorldConfig::new(vec![16, 16]);
    let artifact = assemble_program("t.asm", "ADDI %DR0 1\n", &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[16, 16]);
    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;
    let before = organism.er;
    let outcome = vm.tick(&mut organism, &mut env);
    assert!(outcome.failure.is_none());
    assert_eq!(organism.er, before - config.energy_cost(Opcode::Addi, 1));

    // Now force a failure: a cell that isn't code, under strict typing.
    let config2 = WorldConfig::new(vec![16, 16]);
    let mut env2 = Environment::new(&[16, 16], true);
    env2.set(&coord(&[0, 0]), Molecule::data(1));
    let (artifact2, _) = (
        {
            let raw: Vec<_> = cellforge::source::LineSource::new("t.asm", "NOP\n").non_blank().cloned().collect();
            let tables = cellforge::definitions::extract(&raw).unwrap();
            let registers = cellforge::passes::build_register_table(&config2, &tables.register_aliases, None);
            let mut program = cellforge::passes::assemble(
                &tables.residual,
                &hashbrown::HashMap::new(),
                &tables,
                &config2,
                coord(&[0, 0]),
            )
            .unwrap();
            cellforge::resolver::resolve(&mut program).unwrap();
            Artifact::build(program, coord(&[0, 0]), registers, tables.procs).unwrap()
        },
        (),
    );
    let mut organism2 = Organism::new(1, 0, artifact2, coord(&[0, 0]), coord(&[1, 0]), 100, &config2);
    let before2 = organism2.er;
    let outcome2 = vm.tick(&mut organism2, &mut env2);
    assert!(outcome2.failure.is_some());
    assert_eq!(organism2.er, before2 - config2.error_penalty);
}

#[test]
fn death_is_only_ever_explicit() {
    let config = WorldConfig::new(vec![16, 16]);
    let artifact = assemble_program("t.asm", "DIE\n", &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[16, 16]);
    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
    let mut vm = VirtualMachine;
    assert!(!organism.is_dead);
    let outcome = vm.tick(&mut organism, &mut env);
    assert!(organism.is_dead);
    assert!(outcome.died_this_tick);
}

#[test]
fn ip_advances_by_length_times_dv_when_not_jumping() {
    let config = WorldConfig::new(vec![32, 32]);
    let artifact = assemble_program("t.asm", "ADDI %DR0 1\n", &config, coord(&[0, 0])).unwrap();
    let mut env = load(&artifact, &[32, 32]);
    let dv = coord(&[2, 1]);
    let mut organism = Organism::new(1, 0, artifact, coord(&[0, 0]), dv.clone(), 100, &config);
    let mut vm = VirtualMachine;
    let isa = InstructionSet::global();
    let length = isa.length(Opcode::Addi, config.dims());
    vm.tick(&mut organism, &mut env);
    let expected: Vec<i64> = (0..config.dims()).map(|i| dv[i] * length as i64).collect();
    assert_eq!(organism.ip, coord(&expected));
}

#[test]
fn toroidal_get_is_invariant_under_normalize_and_normalize_is_idempotent() {
    let env = Environment::new(&[8, 8], true);
    let c = coord(&[-3, 19]);
    let normalized = env.normalize(&c);
    assert_eq!(env.get(&c).raw(), env.get(&normalized).raw());
    assert_eq!(env.normalize(&normalized), normalized);
}
