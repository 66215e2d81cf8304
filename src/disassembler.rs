//! Textual disassembly of compiled cells.
//!
//! With an [`Artifact`] on hand, every operand resolves back to its
//! original register/label name; without one, disassembly falls back to
//! printing raw register ids and absolute coordinates. Mirrors
//! `cranelift-codegen`'s two-tier `isa::print`/`MachInst::pretty_print`
//! split between "pretty names available" and "numeric fallback."

use std::fmt::Write as _;

use crate::artifact::Artifact;
use crate::environment::{Coord, Environment};
use crate::isa::table::{ArgType, Opcode};
use crate::isa::{InstructionSet, RegisterId};
use crate::molecule::MoleculeType;
use crate::passes::step_dir;

/// The layout direction in effect when no `.DIR` was ever issued: one step
/// along axis 0 per cell. Used as the fallback when an instruction's
/// coordinate has no recorded direction (no artifact given, or the cell
/// wasn't produced by the assembler at all).
fn axis0_direction(dims: usize) -> Coord {
    (0..dims).map(|i| if i == 0 { 1 } else { 0 }).collect()
}

fn instruction_direction(artifact: Option<&Artifact>, coord: &Coord, dims: usize) -> Coord {
    artifact
        .and_then(|a| a.coord_to_direction.get(coord))
        .cloned()
        .unwrap_or_else(|| axis0_direction(dims))
}

/// Render the instruction at `coord`, or `None` if the cell there is not a
/// recognized opcode word.
pub fn disassemble_at(env: &Environment, coord: &Coord, dims: usize, artifact: Option<&Artifact>) -> Option<String> {
    let isa = InstructionSet::global();
    let opcode_cell = env.get(coord);
    if !opcode_cell.is_type(MoleculeType::Code) {
        return None;
    }
    let opcode = Opcode::from_u32(opcode_cell.scalar() as u32)?;
    let spec = isa.spec(opcode);

    let direction = instruction_direction(artifact, coord, dims);
    let mut out = spec.mnemonic.to_string();
    let mut cursor = step_dir(coord, &direction, 1);
    for arg in spec.args {
        let width = arg.width(dims);
        out.push(' ');
        match arg {
            ArgType::Register => {
                let id = RegisterId::from_raw(env.get(&cursor).scalar() as u32);
                write_register(&mut out, id, artifact);
            }
            ArgType::Literal => {
                let word = env.get(&cursor);
                let _ = write!(out, "{word}");
            }
            ArgType::Vector => {
                write_vector(&mut out, env, &cursor, &direction, width);
            }
            ArgType::Label => {
                let raw = read_vector(env, &cursor, &direction, width);
                let absolute: Coord = if opcode == Opcode::Movip {
                    raw.clone()
                } else {
                    coord.iter().zip(raw.iter()).map(|(a, b)| a + b).collect()
                };
                match artifact.and_then(|a| a.coord_to_label.get(&absolute)) {
                    Some(name) => out.push_str(name),
                    None => write_vector(&mut out, env, &cursor, &direction, width),
                }
            }
        }
        cursor = step_dir(&cursor, &direction, width as i64);
    }
    Some(out)
}

fn read_vector(env: &Environment, start: &Coord, direction: &Coord, width: usize) -> Coord {
    let mut c = start.clone();
    let mut values = Vec::with_capacity(width);
    for _ in 0..width {
        values.push(env.get(&c).scalar());
        c = step_dir(&c, direction, 1);
    }
    Coord::from_vec(values)
}

fn write_vector(out: &mut String, env: &Environment, start: &Coord, direction: &Coord, width: usize) {
    let values = read_vector(env, start, direction, width);
    let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    out.push_str(&rendered.join("|"));
}

fn write_register(out: &mut String, id: RegisterId, artifact: Option<&Artifact>) {
    match artifact.and_then(|a| a.name_by_register.get(&id)) {
        Some(name) => {
            out.push('%');
            out.push_str(name);
        }
        None => {
            let _ = write!(out, "{id}");
        }
    }
}

/// Disassemble every instruction in `artifact`, in address order, as
/// `(coordinate, text)` pairs.
pub fn disassemble_artifact(env: &Environment, artifact: &Artifact, dims: usize) -> Vec<(Coord, String)> {
    let mut out = Vec::new();
    let mut address = 0;
    while address < artifact.len() {
        let coord = &artifact.address_to_coord[address];
        match disassemble_at(env, coord, dims, Some(artifact)) {
            Some(text) => {
                let isa = InstructionSet::global();
                let opcode_cell = env.get(coord);
                let opcode = Opcode::from_u32(opcode_cell.scalar() as u32).expect("validated by disassemble_at");
                let length = isa.length(opcode, dims);
                out.push((coord.clone(), text));
                address += length;
            }
            None => address += 1,
        }
    }
    out
}
