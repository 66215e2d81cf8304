//! `cellforge` — a spatial assembler and register/stack virtual machine
//! for toroidal-grid artificial-life organisms.
//!
//! A program is written in a small textual ISA, assembled into a
//! grid-shaped machine image (an [`artifact::Artifact`]), and then
//! executed one tick at a time by [`vm::VirtualMachine`] against an
//! [`environment::Environment`] shared by every organism living in it.
//!
//! The pipeline from source text to a runnable artifact:
//!
//! 1. [`source`] splits raw text into traceable [`source::Line`]s.
//! 2. [`definitions`] extracts `.MACRO`/`.ROUTINE`/`.PROC`/`.DEFINE`
//!    blocks, leaving a residual line stream.
//! 3. [`expander`] substitutes macro/routine calls (hygienically,
//!    cycle-checked) and resolves `.INCLUDE`/`.IMPORT`.
//! 4. [`passes`] lays out and encodes instructions in two passes,
//!    expanding `.WITH`-annotated calls into explicit copy-in/`CALL`/
//!    copy-out moves.
//! 5. [`resolver`] patches every jump-delta and label-to-vector
//!    placeholder pass 2 left behind.
//! 6. [`artifact`] packages the result into a content-addressed,
//!    immutable [`artifact::Artifact`].
//!
//! At runtime, [`organism::Organism`]s execute an artifact one tick at a
//! time via [`vm::VirtualMachine::tick`], reading and writing a shared
//! [`environment::Environment`] of packed [`molecule::Molecule`] cells.

#![warn(missing_docs)]

pub mod artifact;
pub mod config;
pub mod definitions;
pub mod disassembler;
pub mod environment;
pub mod error;
pub mod expander;
pub mod isa;
pub mod molecule;
pub mod organism;
pub mod passes;
pub mod resolver;
pub mod rng;
pub mod source;
pub mod vm;

pub use artifact::Artifact;
pub use config::WorldConfig;
pub use environment::Environment;
pub use error::{AssemblyError, AssemblyErrorKind, AssemblyResult, VmFault};
pub use molecule::Molecule;
pub use organism::Organism;
pub use vm::{TickOutcome, VirtualMachine};

use std::sync::Arc;

/// Assemble `source` (already macro/include-expanded by the caller, or
/// plain source with no blocks to expand) into a runnable [`Artifact`],
/// running every pipeline stage in order.
pub fn assemble_program(
    file: &str,
    source: &str,
    config: &config::WorldConfig,
    origin: environment::Coord,
) -> error::AssemblyResult<Arc<artifact::Artifact>> {
    let raw: Vec<source::Line> = source::LineSource::new(file, source).non_blank().cloned().collect();
    let tables = definitions::extract(&raw)?;
    let expander_ctx = expander::ExpanderContext {
        tables: &tables,
        includes: &Default::default(),
    };
    let expanded = expander::expand(&expander_ctx)?;
    let registers = passes::build_register_table(config, &tables.register_aliases, None);
    let mut program = passes::assemble(&expanded.residual, &expanded.procs, &tables, config, origin.clone())?;
    resolver::resolve(&mut program)?;
    artifact::Artifact::build(program, origin, registers, tables.procs)
}
