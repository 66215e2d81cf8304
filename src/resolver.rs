//! Placeholder resolution: patch every jump-delta and label-to-vector
//! placeholder pass 2 left behind, now that every label's final coordinate
//! is known.
//!
//! Split out of pass 2 itself the same way `cranelift-codegen`'s
//! `binemit::relax` separates branch-target fixups from initial encoding —
//! deltas are computed componentwise (this crate's "design of record"
//! resolution of the open question over DV-traced vs. componentwise jump
//! targets), never by tracing a direction vector through the grid.

use log::debug;

use crate::environment::Coord;
use crate::error::{asm_err, AssemblyResult};
use crate::isa::encode::PlaceholderKind;
use crate::molecule::Molecule;
use crate::passes::{step_dir, AssembledProgram};

/// Patch every placeholder in `program.cells` in place, resolving against
/// `program.labels`.
pub fn resolve(program: &mut AssembledProgram) -> AssemblyResult<()> {
    debug!("resolving {} placeholder(s)", program.placeholders.len());
    for placeholder in &program.placeholders {
        let target = program.labels.get(&placeholder.label).ok_or_else(|| {
            crate::error::AssemblyError::new(
                placeholder.location.clone(),
                placeholder.label.clone(),
                crate::error::AssemblyErrorKind::Resolver(format!(
                    "unresolved label {}",
                    placeholder.label
                )),
            )
        })?;

        let fill: Coord = match placeholder.kind {
            PlaceholderKind::Delta => target
                .iter()
                .zip(placeholder.opcode_coord.iter())
                .map(|(t, o)| t - o)
                .collect(),
            PlaceholderKind::Absolute => target.clone(),
        };

        if fill.len() != placeholder.width {
            return asm_err!(
                placeholder.location,
                placeholder.label.clone(),
                Resolver,
                "placeholder for {} expects width {}, world has {} dimensions",
                placeholder.label,
                placeholder.width,
                fill.len()
            );
        }

        let mut cursor = placeholder.start.clone();
        for component in fill {
            program.cells.insert(cursor.clone(), Molecule::code(component));
            cursor = step_dir(&cursor, &placeholder.direction, 1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::definitions::extract;
    use crate::environment::coord;
    use crate::source::LineSource;

    fn assemble_src(src: &str) -> AssembledProgram {
        let config = WorldConfig::new(vec![32, 32]);
        let raw: Vec<_> = LineSource::new("t.asm", src).non_blank().cloned().collect();
        let tables = extract(&raw).unwrap();
        crate::passes::assemble(&tables.residual, &hashbrown::HashMap::new(), &tables, &config, coord(&[0, 0])).unwrap()
    }

    #[test]
    fn jump_delta_equals_target_minus_opcode_coordinate() {
        let mut program = assemble_src("JMPR L\nNOP\nL:\nNOP\n");
        let opcode_coord = program.placeholders[0].opcode_coord.clone();
        let target = program.labels["L"].clone();
        resolve(&mut program).unwrap();

        let start = program.placeholders[0].start.clone();
        let word0 = program.cells[&start];
        let expected0 = target[0] - opcode_coord[0];
        assert_eq!(word0.scalar(), expected0);
    }

    #[test]
    fn delta_fill_is_patched_along_the_active_dir_direction() {
        // JMPR reserves `dims` cells for its delta. Under `.DIR 0|1` those
        // cells sit one row below the opcode, not one column to the right.
        let mut program = assemble_src(".DIR 0|1\nJMPR L\nNOP\nL:\nNOP\n");
        let start = program.placeholders[0].start.clone();
        resolve(&mut program).unwrap();
        assert!(program.cells.contains_key(&start));
        let next_component_cell = coord(&[start[0], start[1] + 1]);
        assert!(program.cells.contains_key(&next_component_cell));
    }

    #[test]
    fn unresolved_label_is_a_resolver_error() {
        let mut program = assemble_src("JMPR MISSING\n");
        let err = resolve(&mut program).unwrap_err();
        assert!(matches!(err.kind, crate::error::AssemblyErrorKind::Resolver(_)));
    }
}
