//! Execution glue: wires the verifier, the interpreter, the promotion
//! controller and the compiled-entry table into one entry point.

use crate::compile::{CompiledTable, EmitError, Emitter};
use crate::intrinsics::Host;
use crate::interp::{self, Trap};
use crate::module::Module;
use crate::opcode::Instr;
use crate::promote::{PromotionAction, PromotionController, Tier};
use crate::value::Value;
use crate::error::VerifyError;
use crate::verify::{self, VerifyInfo};

const MAX_CALL_DEPTH: usize = 1024;

/// Per-function and per-opcode execution counters, surfaced on
/// [`ExecResult`] for tooling and tests that want to observe tiering
/// decisions without re-deriving them (spec.md §4.4, "Observability
/// contract").
#[derive(Debug, Clone)]
pub struct ExecCounters {
	pub call_counts: Vec<u32>,
	pub func_opcode_counts: Vec<u64>,
	pub opcode_counts: [u64; 256],
	pub jit_tiers: Vec<Option<Tier>>,
	pub compile_counts: Vec<u32>,
	pub compile_ticks_tier0: Vec<u64>,
	pub compile_ticks_tier1: Vec<u64>,
	pub jit_compiled_exec_counts: Vec<u32>,
	pub jit_tier1_exec_counts: Vec<u32>,
	pub jit_dispatch_counts: Vec<u32>,
}

impl ExecCounters {
	fn from_promotion(promote: &PromotionController) -> Self {
		let states = promote.states();
		Self {
			call_counts: states.iter().map(|s| s.call_count).collect(),
			func_opcode_counts: states.iter().map(|s| s.opcode_count).collect(),
			opcode_counts: [0; 256],
			jit_tiers: states.iter().map(|s| s.tier).collect(),
			compile_counts: states.iter().map(|s| s.compile_count).collect(),
			compile_ticks_tier0: states.iter().map(|s| s.compile_tick_tier0).collect(),
			compile_ticks_tier1: states.iter().map(|s| s.compile_tick_tier1).collect(),
			jit_compiled_exec_counts: states.iter().map(|s| s.compiled_exec_count).collect(),
			jit_tier1_exec_counts: states.iter().map(|s| s.tier1_exec_count).collect(),
			jit_dispatch_counts: states.iter().map(|s| s.dispatch_count).collect(),
		}
	}
}

/// The running engine for one loaded module: owns mutable global state and
/// the tiering machinery, and is threaded through every nested call.
pub struct Engine<'m, H: Host> {
	pub module: &'m Module,
	pub host: H,
	pub globals: Vec<Value>,
	opcode_counts: [u64; 256],
	promote: PromotionController,
	compiled: CompiledTable,
	emitter: Box<dyn Emitter>,
	verify_info: VerifyInfo,
	call_depth: usize,
}

impl<'m, H: Host> Engine<'m, H> {
	pub fn new(module: &'m Module, host: H, verify_info: VerifyInfo) -> Self {
		Self::with_jit_enabled(module, host, verify_info, true)
	}

	/// `jit_enabled = false` keeps the engine purely interpreted: the
	/// promotion controller never schedules a compile attempt and every
	/// JIT counter on the resulting [`ExecResult`] stays zero (spec.md
	/// §4.4, "When the caller disables compilation").
	pub fn with_jit_enabled(module: &'m Module, host: H, verify_info: VerifyInfo, jit_enabled: bool) -> Self {
		let globals = module.globals.iter().map(|g| init_global_value(module, g)).collect();
		Self {
			module,
			host,
			globals,
			opcode_counts: [0; 256],
			promote: PromotionController::with_jit_enabled(module, jit_enabled),
			compiled: CompiledTable::new(module.functions.len()),
			emitter: Box::new(crate::compile::reference::ReferenceEmitter),
			verify_info,
			call_depth: 0,
		}
	}

	pub fn call(&mut self, func_index: u32, args: Vec<Value>) -> Result<Vec<Value>, Trap> {
		self.call_with_upvalues(func_index, args, Vec::new())
	}

	pub fn call_with_upvalues(
		&mut self,
		func_index: u32,
		args: Vec<Value>,
		upvalues: Vec<Value>,
	) -> Result<Vec<Value>, Trap> {
		if self.call_depth >= MAX_CALL_DEPTH {
			return Err(Trap::StackOverflow);
		}
		self.call_depth += 1;
		let action = self.promote.record_call(func_index);
		self.maybe_compile(func_index, action);
		let tier = self.dispatch_tier(func_index);
		if tier.is_some() {
			self.promote.record_dispatch(func_index);
		}
		let func = self.module.functions[func_index as usize];
		let result = interp::run(self, func_index, &func, args, upvalues, tier);
		if let (Ok(_), Some(t)) = (&result, tier) {
			self.promote.record_compiled_completion(func_index, t);
		}
		self.call_depth -= 1;
		result
	}

	/// The tier this dispatch should actually run through: the promotion
	/// controller's nominal tier is not enough on its own, since a bailout
	/// can invalidate the compiled handle without immediately clearing the
	/// controller's own tier bookkeeping for the in-flight call.
	fn dispatch_tier(&self, func_index: u32) -> Option<Tier> {
		self.promote.tier(func_index).filter(|_| self.compiled.get(func_index).is_some())
	}

	/// Called by the interpreter when a live compiled entry hits a condition
	/// it cannot run to completion (spec.md §4.4 rule 7). The trap itself is
	/// still raised by the caller; this only stops crediting `tier` as a
	/// compiled execution going forward (testable property #8, "fallback
	/// one-shot").
	pub(crate) fn bailout(&mut self, func_index: u32, tier: Tier) {
		self.promote.record_bailout(func_index, tier);
		self.compiled.invalidate(func_index);
	}

	fn maybe_compile(&mut self, func_index: u32, action: PromotionAction) {
		let PromotionAction::AttemptCompile(tier) = action else { return };
		let info = self.verify_info.functions.get(&func_index).cloned().unwrap_or_default();
		let result = self.emitter.try_compile(self.module, func_index, tier, &info);
		match result {
			Ok(handle) => {
				self.compiled.install(func_index, handle);
				self.promote.record_compile_result(func_index, tier, Ok(()));
			}
			Err(EmitError::NotSupported(_)) => {
				self.promote.record_compile_result(func_index, tier, Err(true));
			}
			Err(EmitError::TransientError(_)) => {
				self.promote.record_compile_result(func_index, tier, Err(false));
			}
		}
	}

	pub fn tier(&self, func_index: u32) -> Option<Tier> {
		self.promote.tier(func_index)
	}

	/// Bumps the opcode-identity and per-function dispatch counters.
	/// `NOP` is excluded, per spec.md §4.4 rule 2, so a benchmarking loop
	/// built entirely of `NOP`s cannot promote itself.
	pub(crate) fn bump_opcode(&mut self, opcode: u8) {
		if opcode == Instr::Nop.opcode_byte() {
			return;
		}
		self.opcode_counts[opcode as usize] += 1;
	}

	/// Called by the interpreter core when a function body finishes running
	/// uncompiled, so a hot single invocation (high opcode count, low call
	/// count) can still trigger a promotion attempt.
	pub(crate) fn note_opcodes_run(&mut self, func_index: u32, opcodes_run: u64) {
		let action = self.promote.record_opcodes(func_index, opcodes_run);
		self.maybe_compile(func_index, action);
	}

	fn counters(&self) -> ExecCounters {
		let mut counters = ExecCounters::from_promotion(&self.promote);
		counters.opcode_counts = self.opcode_counts;
		counters
	}
}

fn init_global_value(module: &Module, global: &crate::module::GlobalDef) -> Value {
	use crate::module::TypeKind;
	let ty = &module.types[global.type_id as usize];
	if !global.is_initialized() {
		return zero_value(ty.kind);
	}
	match ty.kind {
		TypeKind::I8 | TypeKind::I16 | TypeKind::I32 | TypeKind::U8 | TypeKind::U16
		| TypeKind::U32 | TypeKind::Bool | TypeKind::Char => module
			.const_pool
			.scalar_const(global.init_const_id, 4)
			.map(|b| Value::I32(i32::from_le_bytes(b.try_into().unwrap())))
			.unwrap_or(Value::I32(0)),
		TypeKind::I64 | TypeKind::U64 => module
			.const_pool
			.scalar_const(global.init_const_id, 8)
			.map(|b| Value::I64(i64::from_le_bytes(b.try_into().unwrap())))
			.unwrap_or(Value::I64(0)),
		TypeKind::F32 => module
			.const_pool
			.scalar_const(global.init_const_id, 4)
			.map(|b| Value::F32(f32::from_le_bytes(b.try_into().unwrap())))
			.unwrap_or(Value::F32(0.0)),
		TypeKind::F64 => module
			.const_pool
			.scalar_const(global.init_const_id, 8)
			.map(|b| Value::F64(f64::from_le_bytes(b.try_into().unwrap())))
			.unwrap_or(Value::F64(0.0)),
		TypeKind::Ref | TypeKind::String | TypeKind::Unspecified | TypeKind::I128 | TypeKind::U128 => {
			Value::null_ref()
		}
	}
}

fn zero_value(kind: crate::module::TypeKind) -> Value {
	use crate::module::TypeKind;
	match kind {
		TypeKind::I8 | TypeKind::I16 | TypeKind::I32 | TypeKind::U8 | TypeKind::U16
		| TypeKind::U32 | TypeKind::Bool | TypeKind::Char => Value::I32(0),
		TypeKind::I64 | TypeKind::U64 => Value::I64(0),
		TypeKind::F32 => Value::F32(0.0),
		TypeKind::F64 => Value::F64(0.0),
		TypeKind::Ref | TypeKind::String | TypeKind::Unspecified | TypeKind::I128 | TypeKind::U128 => {
			Value::null_ref()
		}
	}
}

/// Whether an invocation ran to completion or hit an unrecoverable runtime
/// trap (spec.md §4.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecStatus {
	Halted,
	Trapped,
}

/// The result of one `execute(...)` invocation: the interpreter never
/// panics or unwinds across instruction dispatch, so every outcome short of
/// a verification failure is represented here rather than as an `Err`
/// (spec.md §4.3's public contract).
#[derive(Debug, Clone)]
pub struct ExecResult {
	pub status: ExecStatus,
	pub exit_code: i32,
	pub error: String,
	pub counters: ExecCounters,
}

/// Verifies and runs a module's entry function, wiring the whole tiered
/// pipeline together.
///
/// Load and verification failures are reported as `Err` rather than folded
/// into [`ExecResult`]: they mean execution was never attempted at all, so
/// Rust's `Result` is a closer fit than a third `ExecStatus` variant would
/// be (an Open Question decision, see `DESIGN.md`). `skip_verify` exists
/// for `simplevm-cli --no-verify` and for differential tests that
/// intentionally compare against malformed input; production embedders
/// should always verify. `jit_enabled = false` runs purely interpreted.
#[tracing::instrument(skip(module, host))]
pub fn execute<H: Host>(
	module: &Module,
	host: H,
	skip_verify: bool,
	jit_enabled: bool,
) -> Result<ExecResult, VerifyError> {
	let verify_info = if skip_verify { VerifyInfo::default() } else { verify::verify_module(module)? };
	let entry = match module.entry_function_index() {
		Some(entry) => entry as u32,
		None => {
			return Ok(ExecResult {
				status: ExecStatus::Trapped,
				exit_code: 1,
				error: "module has no entry point".to_owned(),
				counters: ExecCounters::from_promotion(&PromotionController::with_jit_enabled(module, jit_enabled)),
			});
		}
	};
	let mut engine = Engine::with_jit_enabled(module, host, verify_info, jit_enabled);
	let result = engine.call(entry, Vec::new());
	let counters = engine.counters();
	Ok(match result {
		Ok(results) => {
			let exit_code = match results.first() {
				Some(Value::I32(code)) => *code,
				_ => 0,
			};
			ExecResult { status: ExecStatus::Halted, exit_code, error: String::new(), counters }
		}
		Err(trap) => ExecResult { status: ExecStatus::Trapped, exit_code: 1, error: trap.to_string(), counters },
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::intrinsics::ReferenceHost;
	use crate::module::{ModuleBuilder, TypeDef, TypeKind};
	use crate::opcode::Instr;

	fn encode(instrs: &[Instr]) -> Vec<u8> {
		let mut out = Vec::new();
		for instr in instrs {
			out.push(instr.opcode_byte());
			match instr {
				Instr::Enter { local_count } => out.extend_from_slice(&local_count.to_le_bytes()),
				Instr::ConstI32(v) => out.extend_from_slice(&v.to_le_bytes()),
				Instr::Call { method_id } => out.extend_from_slice(&method_id.to_le_bytes()),
				Instr::LoadLocal { index } | Instr::StoreLocal { index } => out.extend_from_slice(&index.to_le_bytes()),
				_ => {}
			}
		}
		out
	}

	#[test]
	fn executes_simple_entry_point() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(1),
			Instr::ConstI32(2),
			Instr::AddI32,
			Instr::Ret,
		]);
		builder.push_function(method, &code, 2);
		builder.set_entry_method_id(method);
		let module = builder.build();
		let result = execute(&module, ReferenceHost, false, true).unwrap();
		assert_eq!(result.status, ExecStatus::Halted);
		assert_eq!(result.exit_code, 3);
	}

	#[test]
	fn division_by_zero_traps() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(1),
			Instr::ConstI32(0),
			Instr::DivI32,
			Instr::Ret,
		]);
		builder.push_function(method, &code, 2);
		builder.set_entry_method_id(method);
		let module = builder.build();
		let result = execute(&module, ReferenceHost, false, true).unwrap();
		assert_eq!(result.status, ExecStatus::Trapped);
		assert_eq!(result.error, "division by zero");
	}

	#[test]
	fn repeated_calls_promote_callee_to_tier0() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let callee_sig = builder.push_signature(&[], i32_ty);
		let callee = builder.push_method("callee", callee_sig, 0);
		let callee_code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(1), Instr::Ret]);
		builder.push_function(callee, &callee_code, 1);

		let caller_sig = builder.push_signature(&[], i32_ty);
		let caller = builder.push_method("caller", caller_sig, 0);
		let mut caller_code = encode(&[Instr::Enter { local_count: 0 }]);
		for _ in 0..=(crate::promote::TIER0_CALL_THRESHOLD) {
			caller_code.push(Instr::Call { method_id: callee }.opcode_byte());
			caller_code.extend_from_slice(&callee.to_le_bytes());
			caller_code.push(Instr::Pop.opcode_byte());
		}
		caller_code.extend(encode(&[Instr::ConstI32(0), Instr::Ret]));
		builder.push_function(caller, &caller_code, 2);
		builder.set_entry_method_id(caller);
		let module = builder.build();

		let verify_info = verify::verify_module(&module).unwrap();
		let mut engine = Engine::new(&module, ReferenceHost, verify_info);
		engine.call(1, Vec::new()).unwrap();
		assert_eq!(engine.tier(0), Some(Tier::Tier0));
	}

	#[test]
	fn compiled_division_bails_out_without_changing_the_trap() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[i32_ty, i32_ty], i32_ty);
		let method = builder.push_method("divide", sig, 2);
		let code = encode(&[
			Instr::Enter { local_count: 2 },
			Instr::LoadLocal { index: 0 },
			Instr::LoadLocal { index: 1 },
			Instr::DivI32,
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let verify_info = verify::verify_module(&module).unwrap();
		let mut engine = Engine::new(&module, ReferenceHost, verify_info);

		for _ in 0..=(crate::promote::TIER0_CALL_THRESHOLD) {
			engine.call(0, vec![Value::I32(10), Value::I32(1)]).unwrap();
		}
		assert_eq!(engine.tier(0), Some(Tier::Tier0));
		let compiled_before = engine.counters().jit_compiled_exec_counts[0];
		assert!(compiled_before > 0);

		let trap = engine.call(0, vec![Value::I32(10), Value::I32(0)]).unwrap_err();
		assert!(matches!(trap, Trap::DivisionByZero));

		let compiled_after_bailout = engine.counters().jit_compiled_exec_counts[0];
		assert_eq!(compiled_after_bailout, compiled_before);

		// Property #8: once bailed out, later dispatches no longer run through
		// the compiled entry, so `compiled_exec_count` stays put for good.
		engine.call(0, vec![Value::I32(10), Value::I32(1)]).unwrap();
		assert_eq!(engine.counters().jit_compiled_exec_counts[0], compiled_before);
	}

	#[test]
	fn disabling_jit_keeps_all_counters_zero() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(0), Instr::Ret]);
		builder.push_function(method, &code, 1);
		builder.set_entry_method_id(method);
		let module = builder.build();
		let result = execute(&module, ReferenceHost, false, false).unwrap();
		assert!(result.counters.jit_tiers.iter().all(Option::is_none));
		assert!(result.counters.compile_counts.iter().all(|&c| c == 0));
	}
}
