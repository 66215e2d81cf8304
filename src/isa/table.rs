//! The static opcode table: one entry per instruction, naming its mnemonic,
//! argument shape, pass-2 encoder, and per-tick planner.
//!
//! Modeled directly on `cranelift-codegen`'s `isa/encoding.rs`
//! `Encoding`/`Encodings` table-of-function-pointers idiom: adding an
//! instruction is adding one row here, never touching the pipeline code
//! that walks the table.

use std::fmt;

use crate::error::AssemblyResult;

use super::encode::{self, ArgEncoding, EncodeContext, Operand};
use super::exec::{self, ExecContext, ExecEffect};

/// An argument slot's shape, used by both pass 1 (length) and disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// A single register reference: one cell.
    Register,
    /// A single literal molecule: one cell.
    Literal,
    /// A coordinate or direction vector: `dims` cells.
    Vector,
    /// A label reference, resolved to an absolute coordinate or delta:
    /// `dims` cells.
    Label,
}

impl ArgType {
    /// How many cells this argument type occupies in a world of `dims`
    /// dimensions.
    pub fn width(self, dims: usize) -> usize {
        match self {
            Self::Register | Self::Literal => 1,
            Self::Vector | Self::Label => dims,
        }
    }
}

/// The numeric opcode word stored in `CODE` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Setr,
    Addi,
    Subi,
    Addr,
    Mulr,
    Cmpr,
    Jmpr,
    Jmpi,
    Jzr,
    Skip,
    Call,
    Ret,
    Push,
    Pop,
    Movdv,
    Movip,
    Scan,
    Write,
    Eat,
    Die,
    Fork,
    Movr,
}

impl Opcode {
    /// This opcode's numeric encoding, stable for the lifetime of a
    /// compiled artifact.
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Recover an opcode from its numeric encoding.
    pub fn from_u32(v: u32) -> Option<Self> {
        OPCODES.iter().map(|s| s.opcode).find(|o| o.to_u32() == v)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", super::InstructionSet::global().spec(*self).mnemonic)
    }
}

type Encoder = fn(&[Operand], &EncodeContext, &str) -> AssemblyResult<Vec<ArgEncoding>>;

/// One instruction's full specification: how it's written, how big it is,
/// how it's encoded, and how it behaves at runtime.
#[derive(Clone)]
pub struct OpcodeSpec {
    /// Numeric identity.
    pub opcode: Opcode,
    /// Source-level mnemonic, uppercase by convention.
    pub mnemonic: &'static str,
    /// Argument shape, in source order.
    pub args: &'static [ArgType],
    /// Pass-2 operand encoder.
    pub encode: Encoder,
    /// Per-tick planner.
    pub plan: fn(&ExecContext) -> ExecEffect,
    /// Base energy cost of executing this instruction, before any
    /// per-world override table is consulted.
    pub base_energy_cost: i64,
}

impl OpcodeSpec {
    /// This instruction's cell length in a world of `dims` dimensions:
    /// `1 + Σ width(argType)`.
    pub fn length(&self, dims: usize) -> usize {
        1 + self.args.iter().map(|a| a.width(dims)).sum::<usize>()
    }
}

/// The full, process-wide instruction table. Order is insignificant; each
/// entry is found by field, never by position.
pub static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec {
        opcode: Opcode::Nop,
        mnemonic: "NOP",
        args: &[],
        encode: encode::encode_none,
        plan: exec::plan_nop,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Setr,
        mnemonic: "SETR",
        args: &[ArgType::Register, ArgType::Literal],
        encode: encode::encode_setr,
        plan: exec::plan_setr,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Addi,
        mnemonic: "ADDI",
        args: &[ArgType::Register, ArgType::Literal],
        encode: encode::encode_reg_literal,
        plan: exec::plan_addi,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Subi,
        mnemonic: "SUBI",
        args: &[ArgType::Register, ArgType::Literal],
        encode: encode::encode_reg_literal,
        plan: exec::plan_subi,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Addr,
        mnemonic: "ADDR",
        args: &[ArgType::Register, ArgType::Register],
        encode: encode::encode_two_reg,
        plan: exec::plan_addr,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Mulr,
        mnemonic: "MULR",
        args: &[ArgType::Register, ArgType::Register],
        encode: encode::encode_two_reg,
        plan: exec::plan_mulr,
        base_energy_cost: 2,
    },
    OpcodeSpec {
        opcode: Opcode::Cmpr,
        mnemonic: "CMPR",
        args: &[ArgType::Register, ArgType::Register],
        encode: encode::encode_two_reg,
        plan: exec::plan_cmpr,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Jmpr,
        mnemonic: "JMPR",
        args: &[ArgType::Label],
        encode: encode::encode_jump_label,
        plan: exec::plan_jmpr,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Jmpi,
        mnemonic: "JMPI",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_jmpi,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Jzr,
        mnemonic: "JZR",
        args: &[ArgType::Register, ArgType::Label],
        encode: encode::encode_reg_jump_label,
        plan: exec::plan_jzr,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Skip,
        mnemonic: "SKIP",
        args: &[],
        encode: encode::encode_none,
        plan: exec::plan_skip,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Call,
        mnemonic: "CALL",
        args: &[ArgType::Label],
        encode: encode::encode_jump_label,
        plan: exec::plan_call,
        base_energy_cost: 2,
    },
    OpcodeSpec {
        opcode: Opcode::Ret,
        mnemonic: "RET",
        args: &[],
        encode: encode::encode_none,
        plan: exec::plan_ret,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Push,
        mnemonic: "PUSH",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_push,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Pop,
        mnemonic: "POP",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_pop,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Movdv,
        mnemonic: "MOVDV",
        args: &[ArgType::Vector],
        encode: encode::encode_vector_literal,
        plan: exec::plan_movdv,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Movip,
        mnemonic: "MOVIP",
        args: &[ArgType::Register, ArgType::Label],
        encode: encode::encode_reg_vector_label,
        plan: exec::plan_movip,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Scan,
        mnemonic: "SCAN",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_scan,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Write,
        mnemonic: "WRITE",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_write,
        base_energy_cost: 3,
    },
    OpcodeSpec {
        opcode: Opcode::Eat,
        mnemonic: "EAT",
        args: &[ArgType::Register],
        encode: encode::encode_one_reg,
        plan: exec::plan_eat,
        base_energy_cost: 1,
    },
    OpcodeSpec {
        opcode: Opcode::Die,
        mnemonic: "DIE",
        args: &[],
        encode: encode::encode_none,
        plan: exec::plan_die,
        base_energy_cost: 0,
    },
    OpcodeSpec {
        opcode: Opcode::Fork,
        mnemonic: "FORK",
        args: &[ArgType::Label],
        encode: encode::encode_jump_label,
        plan: exec::plan_fork,
        base_energy_cost: 10,
    },
    OpcodeSpec {
        opcode: Opcode::Movr,
        mnemonic: "MOVR",
        args: &[ArgType::Register, ArgType::Register],
        encode: encode::encode_two_reg,
        plan: exec::plan_movr,
        base_energy_cost: 1,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mnemonic_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for spec in OPCODES {
            assert!(seen.insert(spec.mnemonic), "duplicate mnemonic {}", spec.mnemonic);
        }
    }

    #[test]
    fn arg_type_widths_match_expectations() {
        assert_eq!(ArgType::Register.width(3), 1);
        assert_eq!(ArgType::Literal.width(3), 1);
        assert_eq!(ArgType::Vector.width(3), 3);
        assert_eq!(ArgType::Label.width(3), 3);
    }

    #[test]
    fn opcode_round_trips_through_numeric_encoding() {
        for spec in OPCODES {
            assert_eq!(Opcode::from_u32(spec.opcode.to_u32()), Some(spec.opcode));
        }
    }
}
