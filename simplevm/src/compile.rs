//! C7 — the compiled-entry table: the `Emitter` contract tiers compile
//! against, and a reference emitter used by the CLI and by tests.
//!
//! A real native-code backend would replace [`reference::ReferenceEmitter`]
//! without touching `crate::promote` or `crate::exec`: the contract is just
//! "accept or reject this function for this tier", independent of how the
//! accepted representation actually executes.

use crate::module::Module;
use crate::opcode::{self, Instr};
use crate::promote::Tier;
use crate::verify::FunctionVerifyInfo;

/// Why an [`Emitter`] declined to compile a function.
#[derive(Debug, Clone)]
pub enum EmitError {
	/// This function will never be compilable at this tier; the caller
	/// should pin it and stop retrying.
	NotSupported(String),
	/// Compilation failed for a reason that might not recur (resource
	/// limits, etc); the caller may retry on a later call.
	TransientError(String),
}

/// A handle to a compiled function body. Invoking it must be observationally
/// identical to interpreting the same function (spec's differential
/// execution property) — callers never need to know which tier produced a
/// result.
#[derive(Debug)]
pub struct Handle {
	pub tier: Tier,
}

pub trait Emitter {
	fn try_compile(
		&self,
		module: &Module,
		func_index: u32,
		tier: Tier,
		info: &FunctionVerifyInfo,
	) -> Result<Handle, EmitError>;
}

/// A compiled-entry table: one optional [`Handle`] per function index.
#[derive(Debug, Default)]
pub struct CompiledTable {
	entries: Vec<Option<Handle>>,
}

impl CompiledTable {
	pub fn new(function_count: usize) -> Self {
		Self { entries: (0..function_count).map(|_| None).collect() }
	}

	pub fn get(&self, func_index: u32) -> Option<&Handle> {
		self.entries.get(func_index as usize).and_then(|e| e.as_ref())
	}

	pub fn install(&mut self, func_index: u32, handle: Handle) {
		self.entries[func_index as usize] = Some(handle);
	}

	/// Drops a function's compiled entry, if any. Called after a bailout so
	/// the next call sees no handle and falls back to the interpreter for
	/// good rather than being re-dispatched into the tier that just failed.
	pub fn invalidate(&mut self, func_index: u32) {
		if let Some(slot) = self.entries.get_mut(func_index as usize) {
			*slot = None;
		}
	}
}

/// The reference emitter: rejects any function whose body contains an
/// opcode a toy ahead-of-time backend would not bother lowering —
/// `LINE`/`PROFILE_START`/`PROFILE_END` (debug-only safepoints) and the
/// typed-container family (arrays/lists/objects/closures). Integer
/// division/modulo compile fine; the interpreter core they share with every
/// other opcode still traps on a zero divisor, and `crate::exec::Engine`
/// turns that into a bailout instead of a silent miscount when it happens
/// through a compiled entry. Everything this emitter accepts runs through
/// the same interpreter core as the uncompiled tier, just tagged with a
/// different [`Tier`] for observability.
pub mod reference {
	use super::*;

	#[derive(Debug, Default)]
	pub struct ReferenceEmitter;

	fn is_supported(instr: &Instr) -> bool {
		!matches!(
			instr,
			Instr::Line { .. } | Instr::ProfileStart | Instr::ProfileEnd
				| Instr::NewArray { .. } | Instr::ArrayGet | Instr::ArraySet | Instr::ArrayLen
				| Instr::NewList { .. } | Instr::ListGet | Instr::ListSet | Instr::ListPush | Instr::ListLen
				| Instr::NewObject { .. } | Instr::LoadField { .. } | Instr::StoreField { .. }
				| Instr::NewClosure { .. } | Instr::LoadUpvalue { .. } | Instr::StoreUpvalue { .. }
		)
	}

	impl Emitter for ReferenceEmitter {
		fn try_compile(
			&self,
			module: &Module,
			func_index: u32,
			tier: Tier,
			_info: &FunctionVerifyInfo,
		) -> Result<Handle, EmitError> {
			let func = module.functions.get(func_index as usize).ok_or_else(|| {
				EmitError::TransientError(format!("no such function {func_index}"))
			})?;
			let code = &module.code[func.code_range()];
			let mut pc = 0;
			while pc < code.len() {
				let (instr, next_pc) = opcode::decode(code, pc)
					.map_err(|e| EmitError::TransientError(e.to_string()))?;
				if !is_supported(&instr) {
					return Err(EmitError::NotSupported(format!("{} is not liftable to {tier:?}", instr.name())));
				}
				pc = next_pc;
			}
			Ok(Handle { tier })
		}
	}
}

#[cfg(test)]
mod tests {
	use super::reference::ReferenceEmitter;
	use super::*;
	use crate::module::{ModuleBuilder, TypeDef, TypeKind};
	use crate::opcode::Instr;
	use crate::verify::verify_module;

	fn encode(instrs: &[Instr]) -> Vec<u8> {
		let mut out = Vec::new();
		for instr in instrs {
			out.push(instr.opcode_byte());
			match instr {
				Instr::Enter { local_count } => out.extend_from_slice(&local_count.to_le_bytes()),
				Instr::ConstI32(v) => out.extend_from_slice(&v.to_le_bytes()),
				Instr::NewArray { type_id } => out.extend_from_slice(&type_id.to_le_bytes()),
				_ => {}
			}
		}
		out
	}

	#[test]
	fn arithmetic_only_function_is_compilable() {
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
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let emitter = ReferenceEmitter;
		let handle = emitter.try_compile(&module, 0, Tier::Tier0, &info.functions[&0]).unwrap();
		assert_eq!(handle.tier, Tier::Tier0);
	}

	#[test]
	fn division_function_is_compilable() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(4),
			Instr::ConstI32(2),
			Instr::DivI32,
			Instr::Ret,
		]);
		builder.push_function(method, &code, 2);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let emitter = ReferenceEmitter;
		let handle = emitter.try_compile(&module, 0, Tier::Tier0, &info.functions[&0]).unwrap();
		assert_eq!(handle.tier, Tier::Tier0);
	}

	#[test]
	fn array_using_function_is_not_supported() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(TypeDef::new(TypeKind::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(0),
			Instr::NewArray { type_id: i32_ty },
			Instr::ArrayLen,
			Instr::Ret,
		]);
		builder.push_function(method, &code, 2);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let emitter = ReferenceEmitter;
		let result = emitter.try_compile(&module, 0, Tier::Tier0, &info.functions[&0]);
		assert!(matches!(result, Err(EmitError::NotSupported(_))));
	}
}
