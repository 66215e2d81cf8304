//! The immutable, content-addressed output of assembly: a compiled
//! program's cell map, address/coordinate mappings, and the symbol tables
//! a disassembler needs to print it back out.
//!
//! The content-hash identity follows `cranelift-codegen`'s incremental
//! compilation cache (`context.rs`'s `compute_cache_key`, also a SHA-256
//! over the emitted bytes): two programs that assemble to the same cell
//! words share an [`Artifact`], so a world can cache and reuse compiled
//! programs across organisms that happen to run identical code.

use std::sync::{Arc, Mutex, OnceLock};

use hashbrown::HashMap;
use sha2::{Digest, Sha256};

use crate::definitions::ProcDef;
use crate::environment::Coord;
use crate::error::{AssemblyResult, Location};
use crate::isa::RegisterId;
use crate::molecule::Molecule;
use crate::passes::AssembledProgram;

/// An assembled, immutable program, addressable both by a linear address
/// (its position along the layout axis, relative to its origin) and by
/// its absolute world coordinate.
#[derive(Debug)]
pub struct Artifact {
    /// Hex-encoded SHA-256 over every emitted word, in address order.
    pub program_id: String,
    /// World coordinate this artifact was laid out from.
    pub origin: Coord,
    /// Every cell this program occupies, keyed by absolute coordinate.
    pub cell_map: HashMap<Coord, Molecule>,
    /// Address (0-based, along the layout axis) -> absolute coordinate.
    pub address_to_coord: Vec<Coord>,
    /// Absolute coordinate -> address, the inverse of
    /// [`Artifact::address_to_coord`].
    pub coord_to_address: HashMap<Coord, usize>,
    /// Label name -> absolute coordinate.
    pub label_to_coord: HashMap<String, Coord>,
    /// Absolute coordinate -> label name, for coordinates that are a
    /// jump/call target named by some label.
    pub coord_to_label: HashMap<Coord, String>,
    /// Canonical register name -> id.
    pub register_by_name: HashMap<String, RegisterId>,
    /// Register id -> canonical name, for disassembly.
    pub name_by_register: HashMap<RegisterId, String>,
    /// `.PROC` metadata, keyed by procedure name.
    pub proc_meta: HashMap<String, ProcDef>,
    /// Absolute coordinate -> the source location that produced the
    /// instruction starting there.
    pub source_map: HashMap<Coord, Location>,
    /// `.PLACE type:value at p0|p1|...` entries recorded during assembly,
    /// in source order. Loading this artifact into a world means also
    /// feeding each of these through [`crate::environment::Environment::place_initial`].
    pub placements: Vec<(Coord, Molecule)>,
    /// Opcode coordinate -> the `.DIR` direction that instruction's cells
    /// were laid out along, for direction-aware disassembly.
    pub coord_to_direction: HashMap<Coord, Coord>,
}

impl Artifact {
    /// Build an artifact from a resolved [`AssembledProgram`].
    pub fn build(
        program: AssembledProgram,
        origin: Coord,
        registers: HashMap<String, RegisterId>,
        procs: HashMap<String, ProcDef>,
    ) -> AssemblyResult<Arc<Artifact>> {
        let words: Vec<Molecule> = program
            .address_to_coord
            .iter()
            .map(|coord| program.cells.get(coord).copied().unwrap_or(Molecule::EMPTY))
            .collect();

        let program_id = hash_words(&words);

        let coord_to_label = program
            .labels
            .iter()
            .map(|(name, coord)| (coord.clone(), name.clone()))
            .collect();

        let name_by_register = registers.iter().map(|(name, id)| (*id, name.clone())).collect();

        Ok(Arc::new(Artifact {
            program_id,
            origin,
            cell_map: program.cells,
            address_to_coord: program.address_to_coord,
            coord_to_address: program.coord_to_address,
            label_to_coord: program.labels,
            coord_to_label,
            register_by_name: registers,
            name_by_register,
            proc_meta: procs,
            source_map: program.source_map,
            placements: program.placements,
            coord_to_direction: program.direction_at,
        }))
    }

    /// This program's cell count (its span along the layout axis).
    pub fn len(&self) -> usize {
        self.address_to_coord.len()
    }

    /// Whether this program has no cells.
    pub fn is_empty(&self) -> bool {
        self.address_to_coord.is_empty()
    }

    /// The molecule word at `address`, or `None` if out of range.
    pub fn word_at(&self, address: usize) -> Option<Molecule> {
        let coord = self.address_to_coord.get(address)?;
        self.cell_map.get(coord).copied().or(Some(Molecule::EMPTY))
    }

    /// Write this program's cells and `.PLACE` entries into `env`. Cells are
    /// set directly (they belong to the organism running them); `.PLACE`
    /// entries go through [`crate::environment::Environment::place_initial`]
    /// so they pick up world ownership.
    pub fn load_into(&self, env: &mut crate::environment::Environment) {
        for (coord, word) in &self.cell_map {
            env.set(coord, *word);
        }
        for (coord, molecule) in &self.placements {
            env.place_initial(coord, *molecule);
        }
    }
}

fn hash_words(words: &[Molecule]) -> String {
    let mut hasher = Sha256::new();
    for word in words {
        hasher.update(word.raw().to_be_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A process-wide cache of compiled artifacts, keyed by their content hash,
/// so that organisms running identical programs share one [`Artifact`].
#[derive(Default)]
pub struct ArtifactCache {
    entries: Mutex<HashMap<String, Arc<Artifact>>>,
}

impl ArtifactCache {
    /// The process-wide cache instance.
    pub fn global() -> &'static ArtifactCache {
        static INSTANCE: OnceLock<ArtifactCache> = OnceLock::new();
        INSTANCE.get_or_init(ArtifactCache::default)
    }

    /// Insert `artifact` into the cache if its `program_id` isn't already
    /// present, returning the now-canonical (possibly pre-existing) handle.
    pub fn intern(&self, artifact: Arc<Artifact>) -> Arc<Artifact> {
        let mut entries = self.entries.lock().expect("artifact cache mutex poisoned");
        entries
            .entry(artifact.program_id.clone())
            .or_insert(artifact)
            .clone()
    }

    /// Look up a previously interned artifact by its program id.
    pub fn get(&self, program_id: &str) -> Option<Arc<Artifact>> {
        self.entries.lock().expect("artifact cache mutex poisoned").get(program_id).cloned()
    }

    /// Number of distinct programs currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("artifact cache mutex poisoned").len()
    }
}
