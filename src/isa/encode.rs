//! Pass-2 operand encoders.
//!
//! Each opcode owns a small encoder function that turns its parsed source
//! operands into either literal cell words or a placeholder request for the
//! [resolver](crate::resolver) to patch in a later sweep. This mirrors
//! `cranelift-codegen`'s `isa/encoding.rs` contract that an opcode's byte
//! size and its encoding are both pure functions of its operands and the
//! current register/label context — nothing here consults global mutable
//! state.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::error::{AssemblyErrorKind, AssemblyResult, Location};
use crate::molecule::Molecule;

use super::{RegisterId};

/// A parsed source operand, before register names are resolved to
/// [`RegisterId`]s or labels are resolved to coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `%NAME` — a register or register alias.
    Register(String),
    /// `NAME` — a label reference.
    Label(String),
    /// `type:value` — a literal molecule.
    Literal(Molecule),
    /// `a|b|...` — a literal integer vector.
    Vector(Vec<i64>),
}

/// Whether a resolved placeholder should hold a control-flow delta or an
/// absolute coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// `target - opcode_coord`, componentwise (spec's "design of record").
    Delta,
    /// The target coordinate itself.
    Absolute,
}

/// One argument slot's pass-2 encoding: either already-resolved words, or a
/// request the resolver must patch once every label's coordinate is known.
#[derive(Debug, Clone)]
pub enum ArgEncoding {
    /// Fully resolved cell word(s) for this argument.
    Literal(SmallVec<[Molecule; 4]>),
    /// A deferred argument: `width` zero cells are emitted now, and
    /// recorded for the resolver to patch once `label`'s coordinate (and
    /// this instruction's own coordinate) are both known.
    Placeholder {
        /// Delta-from-opcode or absolute-coordinate fill.
        kind: PlaceholderKind,
        /// The label whose coordinate resolves this placeholder.
        label: String,
        /// Number of cells this placeholder reserves (the world's
        /// dimensionality for vector/label arguments).
        width: usize,
    },
}

impl ArgEncoding {
    /// How many cells this argument occupies.
    pub fn width(&self) -> usize {
        match self {
            Self::Literal(words) => words.len(),
            Self::Placeholder { width, .. } => *width,
        }
    }
}

/// Everything a pass-2 encoder needs besides the raw operands: the register
/// names currently in scope (formal parameters and `.PREG` aliases already
/// folded in by the caller) and the world's dimensionality.
pub struct EncodeContext<'a> {
    /// Effective register name → id map for the current scope.
    pub registers: &'a HashMap<String, RegisterId>,
    /// World dimensionality (how wide a vector/label argument is).
    pub dims: usize,
    /// Source location, for error reporting.
    pub location: Location,
}

impl<'a> EncodeContext<'a> {
    fn resolve_register(&self, name: &str, text: &str) -> AssemblyResult<RegisterId> {
        self.registers.get(name).copied().ok_or_else(|| {
            crate::error::AssemblyError::new(
                self.location.clone(),
                text,
                AssemblyErrorKind::Semantic(format!("unknown register %{name}")),
            )
        })
    }
}

fn expect_register(op: &Operand, ctx: &EncodeContext, text: &str) -> AssemblyResult<RegisterId> {
    match op {
        Operand::Register(name) => ctx.resolve_register(name, text),
        other => asm_arity_mismatch(ctx, text, "register", other),
    }
}

fn expect_label(op: &Operand, ctx: &EncodeContext, text: &str) -> AssemblyResult<String> {
    match op {
        Operand::Label(name) => Ok(name.clone()),
        other => asm_arity_mismatch(ctx, text, "label", other),
    }
}

fn expect_literal_or_label(op: &Operand, ctx: &EncodeContext, text: &str) -> AssemblyResult<ArgEncoding> {
    match op {
        Operand::Literal(m) => Ok(ArgEncoding::Literal(SmallVec::from_elem(*m, 1))),
        Operand::Label(name) => Ok(ArgEncoding::Placeholder {
            kind: PlaceholderKind::Absolute,
            label: name.clone(),
            width: 1,
        }),
        other => asm_arity_mismatch(ctx, text, "literal or label", other),
    }
}

fn asm_arity_mismatch<T>(ctx: &EncodeContext, text: &str, expected: &str, got: &Operand) -> AssemblyResult<T> {
    Err(crate::error::AssemblyError::new(
        ctx.location.clone(),
        text,
        AssemblyErrorKind::Arity(format!("expected {expected} operand, found {got:?}")),
    ))
}

fn reg_word(id: RegisterId) -> ArgEncoding {
    ArgEncoding::Literal(SmallVec::from_elem(Molecule::code(id.raw() as i64), 1))
}

/// No-operand opcodes: `NOP`, `RET`, `SKIP`, `DIE`.
pub fn encode_none(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    if !args.is_empty() {
        return asm_arity_mismatch(ctx, text, "no operands", &args[0]);
    }
    Ok(vec![])
}

/// `SETR dest, src` — `src` is a literal or a label (absolute coordinate
/// load). A live register-to-register copy is `MOVR`, not `SETR`: `SETR`'s
/// source argument is always baked into the cell at assembly time, so a
/// register name there would freeze that register's *id*, not its value.
pub fn encode_setr(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [dest, src] = require_arity(args, ctx, text)?;
    let dest = expect_register(dest, ctx, text)?;
    let src = expect_literal_or_label(src, ctx, text)?;
    Ok(vec![reg_word(dest), src])
}

/// `ADDI`/`SUBI reg, literal`.
pub fn encode_reg_literal(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [reg, lit] = require_arity(args, ctx, text)?;
    let reg = expect_register(reg, ctx, text)?;
    let lit = match lit {
        Operand::Literal(m) => *m,
        other => return asm_arity_mismatch(ctx, text, "literal", other),
    };
    Ok(vec![reg_word(reg), ArgEncoding::Literal(SmallVec::from_elem(lit, 1))])
}

/// `ADDR`/`MULR`/`CMPR reg, reg`.
pub fn encode_two_reg(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [a, b] = require_arity(args, ctx, text)?;
    let a = expect_register(a, ctx, text)?;
    let b = expect_register(b, ctx, text)?;
    Ok(vec![reg_word(a), reg_word(b)])
}

/// `PUSH`/`POP`/`SCAN`/`WRITE`/`EAT`/`JMPI reg`.
pub fn encode_one_reg(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [reg] = require_arity(args, ctx, text)?;
    let reg = expect_register(reg, ctx, text)?;
    Ok(vec![reg_word(reg)])
}

/// `JMPR`/`CALL label` — a jump-relative delta placeholder.
pub fn encode_jump_label(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [label] = require_arity(args, ctx, text)?;
    let label = expect_label(label, ctx, text)?;
    Ok(vec![ArgEncoding::Placeholder {
        kind: PlaceholderKind::Delta,
        label,
        width: ctx.dims,
    }])
}

/// `JZR reg, label` — conditional jump-relative delta placeholder.
pub fn encode_reg_jump_label(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [reg, label] = require_arity(args, ctx, text)?;
    let reg = expect_register(reg, ctx, text)?;
    let label = expect_label(label, ctx, text)?;
    Ok(vec![
        reg_word(reg),
        ArgEncoding::Placeholder {
            kind: PlaceholderKind::Delta,
            label,
            width: ctx.dims,
        },
    ])
}

/// `MOVDV a|b|...` — a literal direction vector.
pub fn encode_vector_literal(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [vec_op] = require_arity(args, ctx, text)?;
    let values = match vec_op {
        Operand::Vector(v) => v.clone(),
        other => return asm_arity_mismatch(ctx, text, "vector", other),
    };
    if values.len() != ctx.dims {
        return Err(crate::error::AssemblyError::new(
            ctx.location.clone(),
            text,
            AssemblyErrorKind::Arity(format!(
                "vector has {} components, world has {} dimensions",
                values.len(),
                ctx.dims
            )),
        ));
    }
    let words: SmallVec<[Molecule; 4]> = values.iter().map(|v| Molecule::code(*v)).collect();
    Ok(vec![ArgEncoding::Literal(words)])
}

/// `MOVIP reg, label` — load a label's absolute coordinate into `reg` at
/// runtime; the coordinate itself is a resolver placeholder.
pub fn encode_reg_vector_label(args: &[Operand], ctx: &EncodeContext, text: &str) -> AssemblyResult<Vec<ArgEncoding>> {
    let [reg, label] = require_arity(args, ctx, text)?;
    let reg = expect_register(reg, ctx, text)?;
    let label = expect_label(label, ctx, text)?;
    Ok(vec![
        reg_word(reg),
        ArgEncoding::Placeholder {
            kind: PlaceholderKind::Absolute,
            label,
            width: ctx.dims,
        },
    ])
}

fn require_arity<'a, const N: usize>(
    args: &'a [Operand],
    ctx: &EncodeContext,
    text: &str,
) -> AssemblyResult<&'a [Operand; N]> {
    args.try_into().map_err(|_| {
        crate::error::AssemblyError::new(
            ctx.location.clone(),
            text,
            AssemblyErrorKind::Arity(format!("expected {N} operand(s), found {}", args.len())),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dims: usize) -> EncodeContext<'static> {
        let regs: &'static HashMap<String, RegisterId> = Box::leak(Box::new(
            [("X".to_string(), RegisterId::data(0))].into_iter().collect(),
        ));
        EncodeContext {
            registers: regs,
            dims,
            location: Location::new("t", 1),
        }
    }

    #[test]
    fn setr_with_label_source_reserves_a_single_cell_placeholder() {
        let c = ctx(2);
        let out = encode_setr(&[Operand::Register("X".into()), Operand::Label("L".into())], &c, "SETR %X L").unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].width(), 1);
        assert_eq!(out[1].width(), 1);
    }

    #[test]
    fn setr_rejects_a_register_source() {
        let c = ctx(2);
        let err = encode_setr(
            &[Operand::Register("X".into()), Operand::Register("X".into())],
            &c,
            "SETR %X %X",
        )
        .unwrap_err();
        assert!(matches!(err.kind, AssemblyErrorKind::Arity(_)));
    }

    #[test]
    fn movr_takes_two_registers() {
        let c = ctx(2);
        let out = encode_two_reg(
            &[Operand::Register("X".into()), Operand::Register("X".into())],
            &c,
            "MOVR %X %X",
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].width(), 1);
        assert_eq!(out[1].width(), 1);
    }

    #[test]
    fn jump_label_reserves_dims_width() {
        let c = ctx(3);
        let out = encode_jump_label(&[Operand::Label("L".into())], &c, "JMPR L").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].width(), 3);
    }

    #[test]
    fn vector_literal_requires_matching_dims() {
        let c = ctx(2);
        let err = encode_vector_literal(&[Operand::Vector(vec![1, 0, 0])], &c, "MOVDV 1|0|0");
        assert!(err.is_err());
    }
}
