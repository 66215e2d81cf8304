//! The two-pass assembler proper: pass 1 computes instruction addresses
//! and label coordinates; pass 2 encodes every instruction into cell
//! words, leaving resolver placeholders for anything that depends on a
//! label's coordinate.
//!
//! Split the same way `cranelift-codegen`'s `binemit` module separates
//! "how long is this instruction" (used to lay out a function before any
//! byte is emitted) from "what are this instruction's bytes" (which needs
//! the final layout to resolve branch targets) — here generalized from a
//! linear byte offset to an N-dimensional grid coordinate.

use hashbrown::HashMap;
use log::debug;

use crate::definitions::{DefinitionTables, ProcAbi, ProcDef};
use crate::environment::Coord;
use crate::error::{asm_err, AssemblyResult, Location};
use crate::isa::encode::{ArgEncoding, EncodeContext, Operand, PlaceholderKind};
use crate::isa::table::Opcode;
use crate::isa::{InstructionSet, RegisterId};
use crate::molecule::Molecule;
use crate::source::Line;

/// A still-unresolved argument slot: `width` reserved cells starting at
/// `start`, to be filled once every label's coordinate is known.
#[derive(Debug, Clone)]
pub struct Placeholder {
    /// Coordinate of the opcode cell this placeholder's instruction begins at.
    pub opcode_coord: Coord,
    /// Coordinate of the placeholder's first reserved cell.
    pub start: Coord,
    pub kind: PlaceholderKind,
    pub label: String,
    pub width: usize,
    pub location: Location,
    /// The direction the placeholder's own reserved cells were laid out
    /// in, i.e. whatever `.DIR` was active when its instruction was
    /// emitted. The resolver walks the placeholder's cells in this same
    /// direction so it never has to re-derive layout state pass 2 already
    /// computed.
    pub direction: Coord,
}

/// The raw product of pass 1 + pass 2, before resolver patching.
#[derive(Debug, Clone, Default)]
pub struct AssembledProgram {
    /// Every emitted cell, keyed by coordinate (sparse: unwritten cells
    /// are implicitly `CODE:0`).
    pub cells: HashMap<Coord, Molecule>,
    /// Label name -> the coordinate of the instruction immediately
    /// following it.
    pub labels: HashMap<String, Coord>,
    /// Every placeholder pass 2 left behind.
    pub placeholders: Vec<Placeholder>,
    /// Coordinate -> originating source location, for diagnostics and
    /// disassembly.
    pub source_map: HashMap<Coord, Location>,
    /// Total cells emitted.
    pub cell_count: usize,
    /// Address (emission order) -> absolute coordinate, recorded as pass 2
    /// walks the program, so address/coordinate correspondence reflects
    /// whatever `.ORG`/`.DIR` directives were active rather than assuming
    /// a fixed axis.
    pub address_to_coord: Vec<Coord>,
    /// Absolute coordinate -> address, the inverse of `address_to_coord`.
    pub coord_to_address: HashMap<Coord, usize>,
    /// `.PLACE type:value at p0|p1|...` entries: an absolute coordinate
    /// and the molecule to seed there at artifact load time.
    pub placements: Vec<(Coord, Molecule)>,
    /// Opcode coordinate -> the `.DIR` direction its instruction (opcode
    /// plus operand cells) was laid out along, so a disassembler can walk
    /// the same instruction back off of any world state without assuming
    /// axis 0.
    pub direction_at: HashMap<Coord, Coord>,
}

/// Build the canonical register name table for a unit of code: `.REG`
/// aliases, `DR`/`PR`/`FPR`/`LR` by canonical name, plus — when assembling
/// inside a register-ABI `.PROC` body — that procedure's formal parameter
/// names aliased onto `DR[0..k-1]`, the slots `.WITH` copies actuals into.
/// Canonical bank names and proc-local names take priority over a
/// colliding `.REG` alias, since they're more specific to the code being
/// assembled.
pub fn build_register_table(
    config: &crate::config::WorldConfig,
    aliases: &HashMap<String, u32>,
    proc: Option<&ProcDef>,
) -> HashMap<String, RegisterId> {
    let mut table = HashMap::new();
    for (name, idx) in aliases {
        table.insert(name.clone(), RegisterId::data(*idx));
    }
    for i in 0..config.dr_count as u32 {
        table.insert(format!("DR{i}"), RegisterId::data(i));
    }
    for i in 0..config.pr_count as u32 {
        table.insert(format!("PR{i}"), RegisterId::proc_local(i));
    }
    for i in 0..config.fpr_count as u32 {
        table.insert(format!("FPR{i}"), RegisterId::formal_param(i));
    }
    for i in 0..config.lr_count as u32 {
        table.insert(format!("LR{i}"), RegisterId::location(i));
    }
    if let Some(proc) = proc {
        if proc.abi == ProcAbi::Register {
            for (i, name) in proc.params.iter().enumerate() {
                table.insert(name.clone(), RegisterId::data(i as u32));
            }
        }
        for (name, idx) in &proc.pregs {
            table.insert(name.clone(), RegisterId::proc_local(*idx));
        }
    }
    table
}

fn parse_operand(token: &str) -> Operand {
    if let Some(reg) = token.strip_prefix('%') {
        return Operand::Register(reg.to_string());
    }
    if token.contains('|') {
        let values: Vec<i64> = token.split('|').filter_map(|p| p.parse().ok()).collect();
        return Operand::Vector(values);
    }
    if let Some((ty, value)) = token.split_once(':') {
        if let (Some(ty), Ok(v)) = (crate::molecule::MoleculeType::from_name(ty), value.parse::<i64>()) {
            return Operand::Literal(Molecule::pack(ty, v));
        }
    }
    if let Ok(v) = token.parse::<i64>() {
        return Operand::Literal(Molecule::code(v));
    }
    Operand::Label(token.to_string())
}

fn parse_operands(rest: &str) -> Vec<Operand> {
    rest.split(',')
        .flat_map(|chunk| chunk.split_whitespace())
        .map(parse_operand)
        .collect()
}

/// A single parsed `.WITH` clause, naming the actual registers bound to a
/// following register-ABI `CALL`'s formal parameters, in order.
struct WithClause {
    actuals: Vec<String>,
    line: Line,
}

fn parse_with(line: &Line) -> WithClause {
    WithClause {
        actuals: line
            .rest()
            .split(',')
            .flat_map(|c| c.split_whitespace())
            .map(|s| s.trim_start_matches('%').to_string())
            .collect(),
        line: line.clone(),
    }
}

/// Advance `amount` steps of `direction` from `coord`, componentwise. Both
/// pass 1 (layout) and pass 2 (encoding) walk with this same function so
/// they can never diverge on where a cell lands.
pub(crate) fn step_dir(coord: &Coord, direction: &[i64], amount: i64) -> Coord {
    coord.iter().zip(direction).map(|(c, d)| c + d * amount).collect()
}

/// The layout direction in effect before any `.DIR` directive: one step
/// along axis 0 per cell.
fn default_direction(dims: usize) -> Coord {
    (0..dims).map(|i| if i == 0 { 1 } else { 0 }).collect()
}

/// Parse a `|`-separated integer vector token (an `.ORG`/`.DIR`/`.PLACE`
/// coordinate), validating it has exactly `dims` components.
fn parse_vector_token(token: &str, dims: usize, line: &Line, directive: &str) -> AssemblyResult<Coord> {
    let values: Result<Vec<i64>, _> = token.split('|').map(|p| p.trim().parse::<i64>()).collect();
    let values = values.map_err(|_| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(format!("{directive} requires pipe-separated integer components")),
        )
    })?;
    if values.len() != dims {
        return asm_err!(
            line.location,
            line.text.clone(),
            Arity,
            "{directive} has {} component(s), world has {} dimensions",
            values.len(),
            dims
        );
    }
    Ok(Coord::from_slice(&values))
}

/// Parse `.PLACE type:value at p0|p1|...` into the molecule to seed and
/// the absolute coordinate to seed it at.
fn parse_place(line: &Line, dims: usize) -> AssemblyResult<(Molecule, Coord)> {
    let rest = line.rest();
    let (value_tok, coord_tok) = rest.split_once(" at ").ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(".PLACE requires \"type:value at p0|p1|...\"".to_string()),
        )
    })?;
    let (ty, value) = value_tok.trim().split_once(':').ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(".PLACE requires a type:value literal".to_string()),
        )
    })?;
    let ty = crate::molecule::MoleculeType::from_name(ty).ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(format!(".PLACE names an unknown molecule type {ty}")),
        )
    })?;
    let value: i64 = value.parse().map_err(|_| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(".PLACE value must be a numeric literal".to_string()),
        )
    })?;
    let at = parse_vector_token(coord_tok.trim(), dims, line, ".PLACE")?;
    Ok((Molecule::pack(ty, value), at))
}

/// Resolve a mnemonic to the opcode pass 2 should actually emit. `SETR`'s
/// second argument is a literal or a label for every ordinary use, but the
/// register-ABI copy-in/copy-out moves need it to name a live register
/// instead — and a register source can't share `SETR`'s `[register,
/// literal]` argument layout, since nothing in the molecule encoding marks
/// a cell as "this word is a register id, not a value" for the fetch side
/// to branch on. `MOVR` already has the right shape (`[register,
/// register]`, both dereferenced through the normal operand dispatcher),
/// so a `SETR` written with a register source resolves to it instead,
/// the same way a real assembler resolves one mnemonic to different
/// opcodes depending on operand kind.
fn resolve_opcode(mnemonic: &str, operands: &[Operand], isa: &InstructionSet) -> Option<Opcode> {
    if mnemonic == "SETR" {
        if let [_, Operand::Register(_)] = operands {
            return Some(Opcode::Movr);
        }
    }
    isa.by_mnemonic(mnemonic)
}

/// The physical `DR` slot `name` refers to, if any: either the literal
/// `DRn` spelling or a `.REG` alias bound to one. Used to tell whether a
/// `.WITH` actual already sits in the formal's slot, so the copy around it
/// can be elided.
fn physical_dr_index(name: &str, aliases: &HashMap<String, u32>) -> Option<u32> {
    name.strip_prefix("DR").and_then(|n| n.parse().ok()).or_else(|| aliases.get(name).copied())
}

/// Expand `.WITH`-annotated `CALL`s into explicit copy-in/`CALL`/copy-out
/// `SETR`s, eliding a copy when the actual already resolves to the
/// formal's own `DRi` slot (a no-op move).
fn expand_with_calls(
    lines: &[Line],
    procs: &HashMap<String, ProcDef>,
    aliases: &HashMap<String, u32>,
) -> AssemblyResult<Vec<Line>> {
    let mut out = Vec::with_capacity(lines.len());
    let mut pending: Option<WithClause> = None;
    for line in lines {
        let head = line.head().unwrap_or_default();
        if head == ".WITH" {
            pending = Some(parse_with(line));
            continue;
        }
        if head == "CALL" {
            let target = line.rest().trim();
            let proc = procs.get(target);
            match (pending.take(), proc) {
                (Some(with), Some(proc)) if proc.abi == ProcAbi::Register => {
                    if with.actuals.len() != proc.params.len() {
                        return asm_err!(
                            line.location,
                            line.text.clone(),
                            Arity,
                            "CALL {target} .WITH supplies {} actual(s), procedure expects {}",
                            with.actuals.len(),
                            proc.params.len()
                        );
                    }
                    for (i, actual) in with.actuals.iter().enumerate() {
                        if physical_dr_index(actual, aliases) != Some(i as u32) {
                            out.push(Line::new(format!("SETR %DR{i} %{actual}"), line.location.file.clone(), line.location.line));
                        }
                    }
                    out.push(line.clone());
                    for (i, actual) in with.actuals.iter().enumerate() {
                        if physical_dr_index(actual, aliases) != Some(i as u32) {
                            out.push(Line::new(format!("SETR %{actual} %DR{i}"), line.location.file.clone(), line.location.line));
                        }
                    }
                }
                (Some(_), Some(proc)) if proc.abi == ProcAbi::Stack => {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Abi,
                        "CALL {target} is stack-ABI and cannot take a .WITH clause"
                    );
                }
                (None, Some(proc)) if proc.abi == ProcAbi::Register => {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Abi,
                        "CALL {target} is register-ABI and requires a .WITH clause"
                    );
                }
                _ => out.push(line.clone()),
            }
            continue;
        }
        if let Some(leftover) = pending.take() {
            return asm_err!(
                leftover.line.location,
                leftover.line.text.clone(),
                Structural,
                ".WITH clause must be immediately followed by a CALL"
            );
        }
        out.push(line.clone());
    }
    if let Some(leftover) = pending.take() {
        return asm_err!(
            leftover.line.location,
            leftover.line.text.clone(),
            Structural,
            ".WITH clause must be immediately followed by a CALL"
        );
    }
    Ok(out)
}

/// Run pass 1 (layout) and pass 2 (encoding) over an already-expanded
/// residual line stream and every `.PROC`'s already-expanded body, starting
/// instruction placement at `origin`.
///
/// `.PROC` bodies are deferred: each one is appended after the residual
/// stream, under a label matching its name, so that caller code still
/// begins at `origin` while `CALL`/`JMPI` references to the procedure still
/// resolve to a real coordinate.
pub fn assemble(
    lines: &[Line],
    expanded_procs: &HashMap<String, Vec<Line>>,
    tables: &DefinitionTables,
    config: &crate::config::WorldConfig,
    origin: Coord,
) -> AssemblyResult<AssembledProgram> {
    let residual = expand_with_calls(lines, &tables.procs, &tables.register_aliases)?;
    let default_registers = build_register_table(config, &tables.register_aliases, None);
    let isa = InstructionSet::global();
    let dims = config.dims();

    let mut proc_names: Vec<&String> = expanded_procs.keys().collect();
    proc_names.sort();
    let mut proc_registers: HashMap<&str, HashMap<String, RegisterId>> = HashMap::new();
    let mut tagged: Vec<(Line, Option<&str>)> = residual.into_iter().map(|l| (l, None)).collect();
    for name in proc_names {
        let proc = &tables.procs[name.as_str()];
        proc_registers.insert(name.as_str(), build_register_table(config, &tables.register_aliases, Some(proc)));
        let body = expand_with_calls(&expanded_procs[name], &tables.procs, &tables.register_aliases)?;
        tagged.push((Line::new(format!("{name}:"), "<proc>", 0), None));
        tagged.extend(body.into_iter().map(|l| (l, Some(name.as_str()))));
    }

    let mut program = AssembledProgram::default();
    let mut cursor = origin;
    let mut direction = default_direction(dims);

    // Pass 1: labels resolve to the coordinate of the next instruction.
    // `.ORG`/`.DIR`/`.PLACE` are layout-only directives: they update the
    // shared cursor/direction state (or record a placement) and emit no
    // cell of their own, so pass 2 replays the exact same state changes by
    // walking the same `instruction_lines` this pass builds.
    let mut instruction_lines: Vec<(&Line, Coord, Coord, Option<&str>)> = Vec::new();
    for (line, proc) in &tagged {
        if let Some(label) = line.text.strip_suffix(':') {
            if program.labels.insert(label.trim().to_string(), cursor.clone()).is_some() {
                return asm_err!(line.location, line.text.clone(), Semantic, "duplicate label {label}");
            }
            continue;
        }
        let head = line.head().unwrap_or_default();
        match head {
            ".ORG" => {
                cursor = parse_vector_token(line.rest(), dims, line, ".ORG")?;
                continue;
            }
            ".DIR" => {
                direction = parse_vector_token(line.rest(), dims, line, ".DIR")?;
                continue;
            }
            ".PLACE" => {
                let (molecule, at) = parse_place(line, dims)?;
                program.placements.push((at, molecule));
                continue;
            }
            _ => {}
        }
        let opcode = isa.by_mnemonic(head).ok_or_else(|| {
            crate::error::AssemblyError::new(
                line.location.clone(),
                line.text.clone(),
                crate::error::AssemblyErrorKind::Semantic(format!("unknown mnemonic {head}")),
            )
        })?;
        // `SETR` with a register source resolves to `MOVR` in pass 2 (see
        // `resolve_opcode`); both have the same argument shape, so the
        // length computed from the mnemonic alone is correct either way.
        let length = isa.length(opcode, dims);
        instruction_lines.push((line, cursor.clone(), direction.clone(), *proc));
        cursor = step_dir(&cursor, &direction, length as i64);
    }
    debug!(
        "pass 1: {} instructions laid out, {} labels bound",
        instruction_lines.len(),
        program.labels.len()
    );

    // Pass 2: encode, emitting zeroed placeholders for anything unresolved,
    // recording each cell's address in emission order.
    let mut address = 0usize;
    let mut emit = |program: &mut AssembledProgram, coord: Coord, word: Molecule| {
        program.cells.insert(coord.clone(), word);
        program.coord_to_address.insert(coord.clone(), address);
        program.address_to_coord.push(coord);
        address += 1;
    };
    for (line, coord, direction, proc) in instruction_lines {
        let mnemonic = line.head().unwrap();
        let operands = parse_operands(line.rest());
        let opcode = resolve_opcode(mnemonic, &operands, isa).expect("validated in pass 1");
        let spec = isa.spec(opcode);
        let registers = proc.map(|p| &proc_registers[p]).unwrap_or(&default_registers);
        let ctx = EncodeContext {
            registers,
            dims,
            location: line.location.clone(),
        };
        let arg_encodings = (spec.encode)(&operands, &ctx, &line.text)?;

        emit(&mut program, coord.clone(), Molecule::code(opcode.to_u32() as i64));
        program.source_map.insert(coord.clone(), line.location.clone());
        program.direction_at.insert(coord.clone(), direction.clone());
        let mut cell_cursor = step_dir(&coord, &direction, 1);
        for enc in arg_encodings {
            match enc {
                ArgEncoding::Literal(words) => {
                    for word in words {
                        emit(&mut program, cell_cursor.clone(), word);
                        cell_cursor = step_dir(&cell_cursor, &direction, 1);
                    }
                }
                ArgEncoding::Placeholder { kind, label, width } => {
                    program.placeholders.push(Placeholder {
                        opcode_coord: coord.clone(),
                        start: cell_cursor.clone(),
                        kind,
                        label,
                        width,
                        location: line.location.clone(),
                        direction: direction.clone(),
                    });
                    for _ in 0..width {
                        emit(&mut program, cell_cursor.clone(), Molecule::EMPTY);
                        cell_cursor = step_dir(&cell_cursor, &direction, 1);
                    }
                }
            }
        }
    }
    program.cell_count = address;
    debug!(
        "pass 2: {} cells emitted, {} placeholders pending resolution",
        program.cell_count,
        program.placeholders.len()
    );

    Ok(program)
}
