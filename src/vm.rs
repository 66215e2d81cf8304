//! The tick driver: fetch, plan, apply, advance.
//!
//! `VirtualMachine::tick` is the only public entry point; the three
//! private steps it wraps mirror the planner/effect split in
//! [`crate::isa::exec`] — fetch decodes the instruction under `IP`, plan
//! asks the opcode's registered planner what should happen, and apply/
//! advance are the only places that actually mutate the organism or the
//! environment. Keeping mutation in one place is the same discipline
//! `cranelift-codegen`'s `binemit::MachBuffer` uses: many passes compute
//! what to emit, exactly one step commits it.

use log::{debug, trace};

use crate::environment::{Coord, Environment};
use crate::error::VmFault;
use crate::isa::exec::{CallRequest, ExecContext, ExecEffect, IpChange, ResolvedOperand};
use crate::isa::table::{ArgType, Opcode, OpcodeSpec};
use crate::isa::{InstructionSet, RegisterId};
use crate::molecule::MoleculeType;
use crate::organism::{Organism, ProcFrame, RegisterValue};

/// A summary of what happened during one [`VirtualMachine::tick`] call.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    /// Net energy change applied this tick (instruction cost plus any
    /// gain/penalty).
    pub energy_delta: i64,
    /// The fault recorded this tick, if the instruction failed.
    pub failure: Option<VmFault>,
    /// Whether this organism died during this tick.
    pub died_this_tick: bool,
}

/// Stateless driver over one organism/environment pair. Holds no data of
/// its own; `tick` takes everything it needs as arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualMachine;

/// `coord + dv * amount`, componentwise, unnormalized.
fn step_by_dv(coord: &Coord, dv: &Coord, amount: i64) -> Coord {
    coord.iter().zip(dv.iter()).map(|(c, d)| c + d * amount).collect()
}

impl VirtualMachine {
    /// Run one tick for `organism` against `env`: fetch the instruction
    /// under `IP`, plan its effect, apply it, then advance `IP`.
    pub fn tick(&mut self, organism: &mut Organism, env: &mut Environment) -> TickOutcome {
        organism.reset_tick_flags();
        organism.ip_before_fetch = organism.ip.clone();
        organism.dv_before_fetch = organism.dv.clone();

        if organism.is_dead {
            return TickOutcome::default();
        }

        let (opcode, spec, operands, instruction_len) = match self.fetch(organism, env) {
            Ok(v) => v,
            Err(fault) => {
                debug!("organism {}: fetch at {:?} faulted: {fault:?}", organism.id, organism.ip);
                organism.instruction_failed(fault.clone());
                let nop_cost = organism.config.energy_cost(Opcode::Nop, InstructionSet::global().spec(Opcode::Nop).base_energy_cost);
                let energy_delta = -(nop_cost + organism.config.error_penalty);
                organism.er += energy_delta;
                if organism.er <= 0 {
                    organism.kill();
                }
                self.advance(organism, env, 1, false);
                return TickOutcome {
                    energy_delta,
                    failure: Some(fault),
                    died_this_tick: organism.is_dead,
                };
            }
        };
        trace!("organism {}: {} at {:?}", organism.id, spec.mnemonic, organism.ip);

        let ctx = ExecContext {
            organism,
            env,
            config: &organism.config,
            opcode_coord: organism.ip.clone(),
            operands: &operands,
        };
        let effect = (spec.plan)(&ctx);

        let base_cost = organism.config.energy_cost(opcode, spec.base_energy_cost);
        let outcome = self.apply(organism, env, effect, base_cost, instruction_len, opcode);
        if outcome.died_this_tick {
            debug!("organism {}: died this tick (er={})", organism.id, organism.er);
        }
        outcome
    }

    fn fetch(
        &self,
        organism: &Organism,
        env: &Environment,
    ) -> Result<(Opcode, &'static OpcodeSpec, Vec<ResolvedOperand>, usize), VmFault> {
        let isa = InstructionSet::global();
        let opcode_cell = env.get(&organism.ip);
        if organism.config.strict_typing && !opcode_cell.is_type(MoleculeType::Code) {
            return Err(VmFault::NotCode);
        }
        let opcode = Opcode::from_u32(opcode_cell.scalar() as u32).ok_or(VmFault::UnknownOpcode(opcode_cell.scalar() as u32))?;
        let spec = isa.spec(opcode);
        let dims = organism.config.dims();

        let dv = &organism.dv;
        let mut operands = Vec::with_capacity(spec.args.len());
        let mut cursor = step_by_dv(&organism.ip, dv, 1);
        for arg in spec.args {
            let width = arg.width(dims);
            match arg {
                ArgType::Register => {
                    let word = env.get(&cursor);
                    operands.push(ResolvedOperand::Register(RegisterId::from_raw(word.scalar() as u32)));
                }
                ArgType::Literal => {
                    let word = env.get(&cursor);
                    operands.push(ResolvedOperand::Value(RegisterValue::Scalar(word.scalar())));
                }
                ArgType::Vector | ArgType::Label => {
                    let mut components = Vec::with_capacity(width);
                    let mut c = cursor.clone();
                    for _ in 0..width {
                        components.push(env.get(&c).scalar());
                        c = step_by_dv(&c, dv, 1);
                    }
                    operands.push(ResolvedOperand::Value(RegisterValue::Vector(Coord::from_vec(components))));
                }
            }
            cursor = step_by_dv(&cursor, dv, width as i64);
        }

        let length = isa.length(opcode, dims);
        Ok((opcode, spec, operands, length))
    }

    fn apply(
        &self,
        organism: &mut Organism,
        env: &mut Environment,
        effect: ExecEffect,
        base_cost: i64,
        instruction_len: usize,
        _opcode: Opcode,
    ) -> TickOutcome {
        if let Some(fault) = effect.fault {
            organism.instruction_failed(fault.clone());
            let energy_delta = -(base_cost + organism.config.error_penalty);
            organism.er += energy_delta;
            if organism.er <= 0 {
                organism.kill();
            }
            self.advance(organism, env, instruction_len, false);
            return TickOutcome {
                energy_delta,
                failure: Some(fault),
                died_this_tick: organism.is_dead,
            };
        }

        for (id, value) in effect.register_writes {
            let _ = organism.write_register(id, value);
        }
        for write in effect.env_writes {
            env.set_with_owner(&write.coord, write.molecule, write.owner);
        }
        if let Some(dv) = effect.set_dv {
            organism.dv = dv;
        }
        if let Some(value) = effect.push_data {
            let _ = organism.data_stack.push(value);
        }
        if let Some(dest) = effect.pop_data_into {
            match organism.data_stack.pop() {
                Ok(value) => {
                    let _ = organism.write_register(dest, value);
                }
                Err(fault) => organism.instruction_failed(fault),
            }
        }
        if let Some(call) = effect.call {
            self.perform_call(organism, &call, instruction_len);
        }
        if effect.ret {
            self.perform_ret(organism);
        }
        if effect.kill {
            organism.kill();
        }
        if let Some(delta) = effect.fork_request {
            let target: Coord = organism
                .ip
                .iter()
                .zip(delta.iter())
                .map(|(a, b)| a + b)
                .collect();
            organism.pending_fork = Some(target);
        }

        let energy_delta = effect.energy_delta - base_cost;
        organism.er += energy_delta;
        if organism.er <= 0 {
            organism.kill();
        }

        let jumped = effect.ip_override.is_some();
        match effect.ip_override {
            Some(IpChange::JumpDelta(delta)) => {
                organism.ip = organism.ip.iter().zip(delta.iter()).map(|(a, b)| a + b).collect();
            }
            Some(IpChange::JumpAbsolute(target)) => {
                organism.ip = target;
            }
            None => {}
        }
        if !jumped {
            self.advance(organism, env, instruction_len, effect.skip_next);
        } else {
            organism.ip = env.normalize(&organism.ip);
        }
        if jumped && effect.skip_next {
            trace!("skip_next requested alongside a jump; jump takes precedence");
        }

        TickOutcome {
            energy_delta,
            failure: None,
            died_this_tick: organism.is_dead,
        }
    }

    fn perform_call(&self, organism: &mut Organism, call: &CallRequest, instruction_len: usize) {
        let target: Coord = organism
            .ip
            .iter()
            .zip(call.target_delta.iter())
            .map(|(a, b)| a + b)
            .collect();
        let frame = ProcFrame {
            proc_name: "".into(),
            return_ip: step_by_dv(&organism.ip, &organism.dv_before_fetch, instruction_len as i64),
            pr_snapshot: organism.pr.snapshot(),
            fpr_snapshot: organism.fpr.snapshot(),
            fpr_bindings: Vec::new(),
        };
        if organism.call_stack.push(frame).is_ok() {
            organism.ip = target;
        } else {
            organism.instruction_failed(VmFault::StackBounds("call stack overflow"));
        }
    }

    fn perform_ret(&self, organism: &mut Organism) {
        match organism.call_stack.pop() {
            Ok(frame) => {
                organism.pr.restore(frame.pr_snapshot);
                organism.fpr.restore(frame.fpr_snapshot);
                organism.ip = frame.return_ip;
            }
            Err(fault) => organism.instruction_failed(fault),
        }
    }

    fn advance(&self, organism: &mut Organism, env: &Environment, instruction_len: usize, skip_next: bool) {
        let isa = InstructionSet::global();
        let dv = organism.dv_before_fetch.clone();
        let mut next = step_by_dv(&organism.ip, &dv, instruction_len as i64);
        if skip_next {
            let next_opcode = Opcode::from_u32(env.get(&next).scalar() as u32);
            let skip_len = next_opcode.map(|op| isa.length(op, organism.config.dims())).unwrap_or(1);
            next = step_by_dv(&next, &dv, skip_len as i64);
        }
        organism.ip = env.normalize(&next);
    }
}
