//! Per-tick instruction planners.
//!
//! Each opcode's planner is a pure function from the current organism and
//! environment state to an [`ExecEffect`] describing what should change.
//! The virtual machine's `execute` step applies the effect and its
//! `advance` step moves `IP`; planners themselves never mutate anything.
//! This generalizes `cranelift-codegen`'s "builder describes, emitter
//! applies" split (`ir`'s instruction builders vs. `binemit`'s `CodeSink`)
//! to a pure planning phase over a separate mutating apply phase.

use crate::environment::Coord;
use crate::error::VmFault;
use crate::organism::{Organism, RegisterValue};

use super::RegisterId;

/// One instruction operand, already decoded from its cell word(s) by the
/// virtual machine's fetch step: either a register still to be read, or an
/// already-resolved value (a literal, or a placeholder the resolver turned
/// into a concrete vector/delta at assembly time).
#[derive(Debug, Clone)]
pub enum ResolvedOperand {
    /// A register reference, not yet read.
    Register(RegisterId),
    /// An already-resolved value.
    Value(RegisterValue),
}

impl ResolvedOperand {
    /// This operand as a register reference, faulting if it is a value.
    pub fn as_register(&self) -> Result<RegisterId, VmFault> {
        match self {
            Self::Register(id) => Ok(*id),
            Self::Value(_) => Err(VmFault::WrongValueKind(0)),
        }
    }
}

/// Everything a planner needs to decide what an instruction does. Read-only:
/// planners describe mutation via [`ExecEffect`], they never perform it.
pub struct ExecContext<'a> {
    /// The organism about to execute this instruction.
    pub organism: &'a Organism,
    /// The world the organism lives in.
    pub env: &'a crate::environment::Environment,
    /// World-wide configuration (energy costs, strict typing, ...).
    pub config: &'a crate::config::WorldConfig,
    /// Coordinate of this instruction's opcode cell (`organism.ip` at fetch).
    pub opcode_coord: Coord,
    /// Decoded operands, in source order.
    pub operands: &'a [ResolvedOperand],
}

impl<'a> ExecContext<'a> {
    fn value(&self, idx: usize) -> Result<RegisterValue, VmFault> {
        match &self.operands[idx] {
            ResolvedOperand::Register(id) => self.organism.read_register(*id).map(|v| v.clone()),
            ResolvedOperand::Value(v) => Ok(v.clone()),
        }
    }

    fn scalar(&self, idx: usize) -> Result<i64, VmFault> {
        let v = self.value(idx)?;
        v.as_scalar().ok_or(VmFault::WrongValueKind(idx as u32))
    }

    fn vector(&self, idx: usize) -> Result<Coord, VmFault> {
        let v = self.value(idx)?;
        v.as_vector().cloned().ok_or(VmFault::WrongValueKind(idx as u32))
    }

    fn register(&self, idx: usize) -> Result<RegisterId, VmFault> {
        self.operands[idx].as_register()
    }

    /// The world coordinate currently pointed to by `IP + DV`, the target
    /// of `SCAN`/`WRITE`/`EAT`/`FORK`.
    pub fn ahead_coord(&self) -> Coord {
        let dv = &self.organism.dv;
        self.opcode_coord.iter().zip(dv.iter()).map(|(a, b)| a + b).collect()
    }
}

/// How a planner wants `IP` to move this tick, beyond the default
/// one-instruction-length advance.
#[derive(Debug, Clone)]
pub enum IpChange {
    /// Offset the opcode's own coordinate by this (already-resolved) delta.
    JumpDelta(Coord),
    /// Jump to this absolute coordinate.
    JumpAbsolute(Coord),
}

/// A cell mutation to apply to the environment.
#[derive(Debug, Clone)]
pub struct EnvWrite {
    /// Coordinate to write.
    pub coord: Coord,
    /// Molecule to write.
    pub molecule: crate::molecule::Molecule,
    /// Owner to stamp on the cell (always written, never left as-is).
    pub owner: crate::environment::OwnerId,
}

/// A request to push a new call frame and jump to `target`.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Where the call jumps to, relative to the opcode's own coordinate.
    pub target_delta: Coord,
}

/// The full description of one instruction's effect, produced by a planner
/// and applied by the virtual machine's execute step.
#[derive(Debug, Clone, Default)]
pub struct ExecEffect {
    /// Register writes to apply, in order.
    pub register_writes: Vec<(RegisterId, RegisterValue)>,
    /// Energy gained (positive) or spent (negative) beyond the
    /// instruction's base cost.
    pub energy_delta: i64,
    /// Environment cell writes to apply.
    pub env_writes: Vec<EnvWrite>,
    /// A new direction vector, if this instruction changes it.
    pub set_dv: Option<Coord>,
    /// An `IP` override beyond the default single-step advance.
    pub ip_override: Option<IpChange>,
    /// Whether the following instruction should be skipped.
    pub skip_next: bool,
    /// A value to push onto the data stack.
    pub push_data: Option<RegisterValue>,
    /// A register to pop the data stack's top into.
    pub pop_data_into: Option<RegisterId>,
    /// A call to perform: snapshot `PR`/`FPR`, push a frame, jump.
    pub call: Option<CallRequest>,
    /// Whether to pop the call stack and return.
    pub ret: bool,
    /// Whether this organism dies this tick.
    pub kill: bool,
    /// A replication request at this (already-resolved) delta coordinate.
    pub fork_request: Option<Coord>,
    /// A fault raised while planning; the VM records it as the tick's
    /// sticky failure and otherwise treats the tick as a no-op.
    pub fault: Option<VmFault>,
}

impl ExecEffect {
    fn faulted(fault: VmFault) -> Self {
        Self {
            fault: Some(fault),
            ..Default::default()
        }
    }
}

macro_rules! try_plan {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(f) => return ExecEffect::faulted(f),
        }
    };
}

pub fn plan_nop(_ctx: &ExecContext) -> ExecEffect {
    ExecEffect::default()
}

pub fn plan_setr(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let value = try_plan!(ctx.value(1));
    ExecEffect {
        register_writes: vec![(dest, value)],
        ..Default::default()
    }
}

/// `MOVR dest, src`: copy `src`'s current value into `dest`, live. Unlike
/// `SETR` (whose second argument is always a literal), both operands here
/// are registers read through the normal operand dispatcher, so this is
/// the opcode `.WITH` copy-in/copy-out moves compile to.
pub fn plan_movr(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let value = try_plan!(ctx.value(1));
    ExecEffect {
        register_writes: vec![(dest, value)],
        ..Default::default()
    }
}

pub fn plan_addi(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let a = try_plan!(ctx.scalar(0));
    let b = try_plan!(ctx.scalar(1));
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(a.wrapping_add(b)))],
        ..Default::default()
    }
}

pub fn plan_subi(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let a = try_plan!(ctx.scalar(0));
    let b = try_plan!(ctx.scalar(1));
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(a.wrapping_sub(b)))],
        ..Default::default()
    }
}

pub fn plan_addr(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let a = try_plan!(ctx.scalar(0));
    let b = try_plan!(ctx.scalar(1));
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(a.wrapping_add(b)))],
        ..Default::default()
    }
}

pub fn plan_mulr(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let a = try_plan!(ctx.scalar(0));
    let b = try_plan!(ctx.scalar(1));
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(a.wrapping_mul(b)))],
        ..Default::default()
    }
}

pub fn plan_cmpr(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let a = try_plan!(ctx.scalar(0));
    let b = try_plan!(ctx.scalar(1));
    let result = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(result))],
        ..Default::default()
    }
}

pub fn plan_jmpr(ctx: &ExecContext) -> ExecEffect {
    let delta = try_plan!(ctx.vector(0));
    ExecEffect {
        ip_override: Some(IpChange::JumpDelta(delta)),
        ..Default::default()
    }
}

pub fn plan_jmpi(ctx: &ExecContext) -> ExecEffect {
    let target = try_plan!(ctx.vector(0));
    ExecEffect {
        ip_override: Some(IpChange::JumpAbsolute(target)),
        ..Default::default()
    }
}

pub fn plan_jzr(ctx: &ExecContext) -> ExecEffect {
    let test = try_plan!(ctx.scalar(0));
    if test != 0 {
        return ExecEffect::default();
    }
    let delta = try_plan!(ctx.vector(1));
    ExecEffect {
        ip_override: Some(IpChange::JumpDelta(delta)),
        ..Default::default()
    }
}

pub fn plan_skip(_ctx: &ExecContext) -> ExecEffect {
    ExecEffect {
        skip_next: true,
        ..Default::default()
    }
}

pub fn plan_call(ctx: &ExecContext) -> ExecEffect {
    let delta = try_plan!(ctx.vector(0));
    ExecEffect {
        call: Some(CallRequest { target_delta: delta }),
        ..Default::default()
    }
}

pub fn plan_ret(ctx: &ExecContext) -> ExecEffect {
    if ctx.organism.call_stack.is_empty() {
        return ExecEffect::faulted(VmFault::EmptyCallStack);
    }
    ExecEffect {
        ret: true,
        ..Default::default()
    }
}

pub fn plan_push(ctx: &ExecContext) -> ExecEffect {
    let value = try_plan!(ctx.value(0));
    ExecEffect {
        push_data: Some(value),
        ..Default::default()
    }
}

pub fn plan_pop(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    ExecEffect {
        pop_data_into: Some(dest),
        ..Default::default()
    }
}

pub fn plan_movdv(ctx: &ExecContext) -> ExecEffect {
    let v = try_plan!(ctx.vector(0));
    ExecEffect {
        set_dv: Some(v),
        ..Default::default()
    }
}

pub fn plan_movip(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let target = try_plan!(ctx.vector(1));
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Vector(target))],
        ..Default::default()
    }
}

pub fn plan_scan(ctx: &ExecContext) -> ExecEffect {
    let dest = try_plan!(ctx.register(0));
    let coord = ctx.ahead_coord();
    let molecule = ctx.env.get(&coord);
    ExecEffect {
        register_writes: vec![(dest, RegisterValue::Scalar(molecule.raw() as i64))],
        ..Default::default()
    }
}

pub fn plan_write(ctx: &ExecContext) -> ExecEffect {
    let src = try_plan!(ctx.scalar(0));
    let coord = ctx.ahead_coord();
    let owner_there = ctx.env.owner(&coord);
    if !ctx.organism.can_write(owner_there) {
        return ExecEffect::faulted(VmFault::NotOwned);
    }
    let molecule = crate::molecule::Molecule::from_raw(src as u32);
    let owner = ctx.organism.id as crate::environment::OwnerId;
    ExecEffect {
        env_writes: vec![EnvWrite { coord, molecule, owner }],
        ..Default::default()
    }
}

pub fn plan_eat(ctx: &ExecContext) -> ExecEffect {
    let coord = ctx.ahead_coord();
    let molecule = ctx.env.get(&coord);
    if !molecule.is_type(crate::molecule::MoleculeType::Energy) {
        return ExecEffect::faulted(VmFault::WrongValueKind(0));
    }
    let gained = molecule.scalar();
    ExecEffect {
        energy_delta: gained,
        env_writes: vec![EnvWrite {
            coord,
            molecule: crate::molecule::Molecule::EMPTY,
            owner: 0,
        }],
        ..Default::default()
    }
}

pub fn plan_die(_ctx: &ExecContext) -> ExecEffect {
    ExecEffect {
        kill: true,
        ..Default::default()
    }
}

pub fn plan_fork(ctx: &ExecContext) -> ExecEffect {
    let delta = try_plan!(ctx.vector(0));
    ExecEffect {
        fork_request: Some(delta),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::environment::{coord, Environment};
    use crate::organism::Organism;

    fn fixture() -> (Organism, Environment, WorldConfig) {
        let (artifact, config) = crate::organism::test_fixture(&[8, 8]);
        let org = Organism::new(1, 0, artifact, coord(&[0, 0]), coord(&[1, 0]), 100, &config);
        let env = Environment::new(&[8, 8], true);
        (org, env, config)
    }

    #[test]
    fn addi_adds_literal_to_register() {
        let (mut org, env, config) = fixture();
        org.write_register(RegisterId::data(0), RegisterValue::Scalar(5)).unwrap();
        let operands = vec![
            ResolvedOperand::Register(RegisterId::data(0)),
            ResolvedOperand::Value(RegisterValue::Scalar(3)),
        ];
        let ctx = ExecContext {
            organism: &org,
            env: &env,
            config: &config,
            opcode_coord: org.ip.clone(),
            operands: &operands,
        };
        let effect = plan_addi(&ctx);
        assert_eq!(effect.register_writes, vec![(RegisterId::data(0), RegisterValue::Scalar(8))]);
    }

    #[test]
    fn jzr_jumps_only_when_zero() {
        let (mut org, env, config) = fixture();
        org.write_register(RegisterId::data(0), RegisterValue::Scalar(0)).unwrap();
        let operands = vec![
            ResolvedOperand::Register(RegisterId::data(0)),
            ResolvedOperand::Value(RegisterValue::Vector(coord(&[2, 0]))),
        ];
        let ctx = ExecContext {
            organism: &org,
            env: &env,
            config: &config,
            opcode_coord: org.ip.clone(),
            operands: &operands,
        };
        let effect = plan_jzr(&ctx);
        assert!(matches!(effect.ip_override, Some(IpChange::JumpDelta(_))));
    }

    #[test]
    fn write_rejects_foreign_ownership() {
        let (org, mut env, config) = fixture();
        env.set_with_owner(&[1, 0], crate::molecule::Molecule::code(0), 99);
        let operands = vec![ResolvedOperand::Value(RegisterValue::Scalar(0))];
        let ctx = ExecContext {
            organism: &org,
            env: &env,
            config: &config,
            opcode_coord: org.ip.clone(),
            operands: &operands,
        };
        let effect = plan_write(&ctx);
        assert_eq!(effect.fault, Some(VmFault::NotOwned));
    }

    #[test]
    fn eat_requires_energy_cell() {
        let (org, mut env, config) = fixture();
        env.set(&[1, 0], crate::molecule::Molecule::data(5));
        let ctx = ExecContext {
            organism: &org,
            env: &env,
            config: &config,
            opcode_coord: org.ip.clone(),
            operands: &[],
        };
        let effect = plan_eat(&ctx);
        assert!(effect.fault.is_some());
    }
}
