//! The instruction set registry.
//!
//! A single, statically-built table maps each opcode to its mnemonic,
//! cell length, argument-type vector, pass-2 encoder, and per-tick planner.
//! Disassembly and pass 1's length computation both rely on this table
//! alone (specification §4.7): adding an opcode means adding one entry to
//! [`table::OPCODES`], nothing else.
//!
//! Grounded on `cranelift-codegen/src/isa/mod.rs`'s `TargetIsa` pattern of
//! routing every "how big is this / how do I encode this" question through
//! one registry rather than letting callers special-case per opcode.

pub mod encode;
pub mod exec;
pub mod table;

use std::fmt;
use std::sync::OnceLock;

pub use encode::{ArgEncoding, EncodeContext, Operand, PlaceholderKind};
pub use exec::{ExecContext, ExecEffect};
pub use table::{ArgType, Opcode, OpcodeSpec};

/// The register bank a [`RegisterId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    /// General-purpose data registers, `DR[0..]`.
    Data,
    /// Procedure-local registers, `PR[0..]`.
    ProcLocal,
    /// Formal-parameter registers, `FPR[0..]`.
    FormalParam,
    /// Location registers, `LR[0..]`.
    Location,
}

/// Base id of the `DR` bank.
pub const DR_BASE: u32 = 0;
/// Number of ids reserved for `DR` before the `PR` bank begins.
pub const DR_SPAN: u32 = 1_000;
/// Base id of the `PR` bank.
pub const PR_BASE: u32 = 1_000;
/// Number of ids reserved for `PR` before the `FPR` bank begins.
pub const PR_SPAN: u32 = 1_000;
/// Base id of the `FPR` bank.
pub const FPR_BASE: u32 = 2_000;
/// Number of ids reserved for `FPR` before the `LR` bank begins.
pub const FPR_SPAN: u32 = 1_000;
/// Base id of the `LR` bank.
pub const LR_BASE: u32 = 3_000;

/// An operand register reference: a bank plus an index within that bank,
/// packed into one `u32` id exactly as specification §4.7 describes
/// (`DR[0..]` at `0..DR_MAX`, `PR[0..]` at `PR_BASE + i`, and so on). All
/// register reads and writes route through this one id space so there is a
/// single operand-dispatch helper rather than one per bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterId(u32);

impl RegisterId {
    /// Construct a `DR[index]` reference.
    pub fn data(index: u32) -> Self {
        Self(DR_BASE + index)
    }

    /// Construct a `PR[index]` reference.
    pub fn proc_local(index: u32) -> Self {
        Self(PR_BASE + index)
    }

    /// Construct an `FPR[index]` reference.
    pub fn formal_param(index: u32) -> Self {
        Self(FPR_BASE + index)
    }

    /// Construct an `LR[index]` reference.
    pub fn location(index: u32) -> Self {
        Self(LR_BASE + index)
    }

    /// Build a register reference from a raw numeric id, as read from an
    /// already-encoded instruction argument.
    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// This reference's raw numeric id, as stored in encoded instructions.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Which bank this id falls in, and the index within that bank.
    pub fn decompose(self) -> (RegisterBank, u32) {
        match self.0 {
            id if id < PR_BASE => (RegisterBank::Data, id - DR_BASE),
            id if id < FPR_BASE => (RegisterBank::ProcLocal, id - PR_BASE),
            id if id < LR_BASE => (RegisterBank::FormalParam, id - FPR_BASE),
            id => (RegisterBank::Location, id - LR_BASE),
        }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (bank, idx) = self.decompose();
        let prefix = match bank {
            RegisterBank::Data => "DR",
            RegisterBank::ProcLocal => "PR",
            RegisterBank::FormalParam => "FPR",
            RegisterBank::Location => "LR",
        };
        write!(f, "%{prefix}{idx}")
    }
}

/// The process-wide, immutable instruction registry.
///
/// Built once from [`table::OPCODES`] and cached behind a [`OnceLock`],
/// matching specification §9's "prefer a statically-built table over
/// dynamic registration."
pub struct InstructionSet {
    by_opcode: Vec<OpcodeSpec>,
    by_name: hashbrown::HashMap<&'static str, Opcode>,
}

impl InstructionSet {
    fn build() -> Self {
        let specs = table::OPCODES;
        let mut by_opcode: Vec<OpcodeSpec> = specs.to_vec();
        by_opcode.sort_by_key(|s| s.opcode.to_u32());
        let by_name = specs.iter().map(|s| (s.mnemonic, s.opcode)).collect();
        Self { by_opcode, by_name }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static InstructionSet {
        static INSTANCE: OnceLock<InstructionSet> = OnceLock::new();
        INSTANCE.get_or_init(InstructionSet::build)
    }

    /// Look up an opcode's specification by its numeric id.
    pub fn spec(&self, opcode: Opcode) -> &OpcodeSpec {
        self.by_opcode
            .iter()
            .find(|s| s.opcode == opcode)
            .expect("every Opcode variant has a table entry")
    }

    /// Look up an opcode by its source-level mnemonic (case-sensitive,
    /// uppercase by convention).
    pub fn by_mnemonic(&self, mnemonic: &str) -> Option<Opcode> {
        self.by_name.get(mnemonic).copied()
    }

    /// The cell length of an instruction for the given opcode, in a world
    /// of `dims` dimensions: `1 + Σ width(argType)`.
    pub fn length(&self, opcode: Opcode, dims: usize) -> usize {
        self.spec(opcode).length(dims)
    }

    /// Iterate every registered opcode specification, e.g. for tooling
    /// that wants to print the whole instruction set.
    pub fn iter(&self) -> impl Iterator<Item = &OpcodeSpec> {
        self.by_opcode.iter()
    }
}
