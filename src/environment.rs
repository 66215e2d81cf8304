//! The N-dimensional toroidal (or bounded) molecule grid.
//!
//! An `Environment` is a flat array of [`Molecule`] words plus a parallel
//! array of owner ids, indexed by one shared flat index — the same "entity
//! references are indices into side tables, never pointers" discipline
//! `cranelift-codegen`'s `ir/entities.rs` describes for its own IR, applied
//! here to grid cells instead of IR values. A side [`hashbrown::HashSet`] of
//! occupied flat indices (fast non-cryptographic hashing, matching
//! `cranelift-codegen`'s `rustc-hash` dependency) lets callers iterate
//! non-empty cells without scanning the whole grid.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::molecule::Molecule;

/// A coordinate or direction vector in the world's space. Inline-stored up
/// to four dimensions (matching `cranelift-codegen`'s general preference
/// for `smallvec` over `Vec` on hot paths), spilling to the heap beyond
/// that.
pub type Coord = SmallVec<[i64; 4]>;

/// Build a [`Coord`] from a slice of components.
pub fn coord(components: &[i64]) -> Coord {
    Coord::from_slice(components)
}

/// The agent id that owns a cell. `0` means unowned.
pub type OwnerId = u32;

/// The N-dimensional grid of packed molecules and their owners.
pub struct Environment {
    shape: Coord,
    toroidal: bool,
    cells: Vec<Molecule>,
    owners: Vec<OwnerId>,
    occupied: FxHashSet<usize>,
}

impl Environment {
    /// Build an empty environment of the given shape. `toroidal` selects
    /// wrap-around (floored modulo) indexing; when `false`, out-of-range
    /// reads yield `CODE:0` and writes are silently elided.
    pub fn new(shape: &[i64], toroidal: bool) -> Self {
        assert!(!shape.is_empty(), "environment must have at least one dimension");
        assert!(shape.iter().all(|&d| d > 0), "every dimension must be positive");
        let len: usize = shape.iter().map(|&d| d as usize).product();
        Self {
            shape: coord(shape),
            toroidal,
            cells: vec![Molecule::EMPTY; len],
            owners: vec![0; len],
            occupied: FxHashSet::default(),
        }
    }

    /// The world's shape.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The world's dimensionality.
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    /// Whether this environment wraps around at its edges.
    pub fn is_toroidal(&self) -> bool {
        self.toroidal
    }

    /// Normalize a coordinate: floored modulo on every axis when toroidal,
    /// or the coordinate unchanged (but possibly out of bounds) otherwise.
    /// Normalization is idempotent.
    pub fn normalize(&self, c: &[i64]) -> Coord {
        debug_assert_eq!(c.len(), self.dims());
        if !self.toroidal {
            return coord(c);
        }
        let mut out = Coord::with_capacity(c.len());
        for (v, &d) in c.iter().zip(self.shape.iter()) {
            out.push(v.rem_euclid(d));
        }
        out
    }

    fn flat_index(&self, c: &[i64]) -> Option<usize> {
        let norm = self.normalize(c);
        let mut index = 0usize;
        for (v, &d) in norm.iter().zip(self.shape.iter()) {
            if *v < 0 || *v >= d {
                return None;
            }
            index = index * d as usize + *v as usize;
        }
        Some(index)
    }

    /// Read the molecule at `coord`. Out-of-bounds reads on a non-toroidal
    /// environment yield `CODE:0`.
    pub fn get(&self, c: &[i64]) -> Molecule {
        self.flat_index(c).map(|i| self.cells[i]).unwrap_or(Molecule::EMPTY)
    }

    /// The owner of the cell at `coord`, or `0` if out of bounds or
    /// unowned.
    pub fn owner(&self, c: &[i64]) -> OwnerId {
        self.flat_index(c).map(|i| self.owners[i]).unwrap_or(0)
    }

    fn refresh_occupied(&mut self, index: usize) {
        if self.cells[index].is_empty() && self.owners[index] == 0 {
            self.occupied.remove(&index);
        } else {
            self.occupied.insert(index);
        }
    }

    /// Write a molecule at `coord`, leaving ownership untouched. Writes to
    /// an out-of-bounds coordinate on a non-toroidal environment are
    /// elided.
    pub fn set(&mut self, c: &[i64], mol: Molecule) {
        if let Some(index) = self.flat_index(c) {
            self.cells[index] = mol;
            self.refresh_occupied(index);
        }
    }

    /// Write a molecule and its owner together. Unlike [`Environment::set`]
    /// this always writes the owner field, even when `mol` is the empty
    /// `CODE:0` cell — the "design of record" resolution of the open
    /// question about whether erasing a cell should also clear or
    /// overwrite ownership (it always overwrites, so callers observe
    /// consistent ownership even on erase).
    pub fn set_with_owner(&mut self, c: &[i64], mol: Molecule, owner: OwnerId) {
        if let Some(index) = self.flat_index(c) {
            self.cells[index] = mol;
            self.owners[index] = owner;
            self.refresh_occupied(index);
        }
    }

    /// Place an initial world object from assembly (`.PLACE`), seeding
    /// ownership as world-owned (`0`).
    pub fn place_initial(&mut self, c: &[i64], mol: Molecule) {
        self.set_with_owner(c, mol, 0);
    }

    /// Set only the owner of the cell at `coord`, leaving its molecule
    /// untouched.
    pub fn set_owner(&mut self, c: &[i64], owner: OwnerId) {
        if let Some(index) = self.flat_index(c) {
            self.owners[index] = owner;
            self.refresh_occupied(index);
        }
    }

    /// True iff every cell within `radius` (Chebyshev distance) of `center`
    /// is unowned.
    pub fn is_area_unowned(&self, center: &[i64], radius: i64) -> bool {
        self.for_each_in_radius(center, radius, |env, c| env.owner(c) == 0)
    }

    fn for_each_in_radius(&self, center: &[i64], radius: i64, mut pred: impl FnMut(&Self, &[i64]) -> bool) -> bool {
        let dims = self.dims();
        let mut offset = vec![-radius; dims];
        loop {
            let mut c = Coord::with_capacity(dims);
            for (a, b) in center.iter().zip(offset.iter()) {
                c.push(a + b);
            }
            if !pred(self, &c) {
                return false;
            }
            // odometer increment over `offset`
            let mut axis = dims;
            loop {
                if axis == 0 {
                    return true;
                }
                axis -= 1;
                offset[axis] += 1;
                if offset[axis] > radius {
                    offset[axis] = -radius;
                    continue;
                }
                break;
            }
        }
    }

    /// Call `f(coord, molecule, owner)` for every cell whose molecule word
    /// or owner is non-zero. A cell is in this set iff it is occupied
    /// (spec's invariant).
    pub fn for_each_occupied(&self, mut f: impl FnMut(&[i64], Molecule, OwnerId)) {
        for &index in &self.occupied {
            let c = self.unflatten(index);
            f(&c, self.cells[index], self.owners[index]);
        }
    }

    /// Number of currently-occupied cells.
    pub fn occupied_len(&self) -> usize {
        self.occupied.len()
    }

    fn unflatten(&self, mut index: usize) -> Coord {
        let mut out = vec![0i64; self.dims()];
        for axis in (0..self.dims()).rev() {
            let d = self.shape[axis] as usize;
            out[axis] = (index % d) as i64;
            index /= d;
        }
        Coord::from_vec(out)
    }
}
