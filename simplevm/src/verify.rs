//! C4 — the verifier: a single-pass abstract interpreter over a function's
//! bytecode that rejects anything the interpreter (`crate::interp`) or the
//! compiled tiers (`crate::compile`) would otherwise have to guard against
//! at every instruction.
//!
//! The pass is linear in `pc`, not a general fixpoint over the control-flow
//! graph: forward branches record their expected operand-stack shape in
//! [`PendingJoins`] and backward branches are checked against the shape
//! already recorded when that target was first visited. This mirrors how a
//! reducible-CFG bytecode verifier can get away without iterating to a
//! fixpoint, at the cost of being conservative about irreducible control
//! flow (not something this instruction set can produce, since every branch
//! target is a concrete `pc` validated against the function's own boundary
//! scan).

use std::collections::HashSet;

use fxhash::FxHashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::error::{FailureKind, VerifyError};
use crate::module::Module;
use crate::opcode::{self, Instr};
use crate::value::{ValType, VmType};

/// A reference-bit map recorded at a safepoint (`LINE`, `PROFILE_START`,
/// `PROFILE_END`): the operand-stack shape a garbage collector or tracing
/// tool would need to scan at that `pc`. `ref_bits` is a little-endian
/// bitset over `stack_height` slots, bottom of stack first; bit `i` is set
/// iff that slot holds a `Ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
	pub pc: usize,
	pub stack_height: u32,
	pub ref_bits: Vec<u8>,
}

fn ref_bits_of(stack: &[ValType]) -> Vec<u8> {
	let mut bits = vec![0u8; stack.len().div_ceil(8)];
	for (i, ty) in stack.iter().enumerate() {
		if *ty == ValType::Ref {
			bits[i / 8] |= 1 << (i % 8);
		}
	}
	bits
}

#[derive(Debug, Clone, Default)]
pub struct FunctionVerifyInfo {
	/// Final `VmType` of each local slot, parameters included, indexed the
	/// same as `LOAD_LOCAL`/`STORE_LOCAL` operands.
	pub locals: Vec<VmType>,
	/// Same encoding as `StackMap::ref_bits`, but over `locals` instead of
	/// the operand stack at a safepoint.
	pub locals_ref_bits: Vec<u8>,
	/// One entry per safepoint, in `pc` order.
	pub stack_maps: Vec<StackMap>,
	pub max_observed_stack: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyInfo {
	pub functions: FxHashMap<u32, FunctionVerifyInfo>,
	/// Same encoding as `StackMap::ref_bits`, over the module's global table.
	pub globals_ref_bits: Vec<u8>,
}

/// A local never written by the single linear pass (a dead slot) has no
/// tracked abstract type; it still needs a concrete `VmType` so the GC
/// table has one entry per declared local. `I32` is the narrowest and most
/// common widened type elsewhere in the runtime (`Value::vm_type` already
/// widens `Bool` into it), so it doubles as the default for slots that were
/// never assigned one.
fn final_vm_type(ty: Option<ValType>) -> VmType {
	match ty {
		None | Some(ValType::Unknown) | Some(ValType::I32) | Some(ValType::Bool) => VmType::I32,
		Some(ValType::I64) => VmType::I64,
		Some(ValType::F32) => VmType::F32,
		Some(ValType::F64) => VmType::F64,
		Some(ValType::Ref) => VmType::Ref,
	}
}

fn vm_ref_bits_of(types: &[VmType]) -> Vec<u8> {
	let mut bits = vec![0u8; types.len().div_ceil(8)];
	for (i, ty) in types.iter().enumerate() {
		if *ty == VmType::Ref {
			bits[i / 8] |= 1 << (i % 8);
		}
	}
	bits
}

/// Ref-bit map over the module's global table (spec's `VerifyResult.globals_ref_bits`).
/// A global with an unresolvable `type_id` defaults to "not a ref": any
/// function that actually touches it already fails at that `LOAD_GLOBAL`/
/// `STORE_GLOBAL` site, so an invalid entry here is unreachable in a module
/// that otherwise verifies.
fn globals_ref_bits(module: &Module) -> Vec<u8> {
	let types: Vec<ValType> = module.globals.iter()
		.map(|g| valtype_of(module, g.type_id).unwrap_or(ValType::Unknown))
		.collect();
	ref_bits_of(&types)
}

fn valtype_of(module: &Module, type_id: u32) -> Option<ValType> {
	use crate::module::TypeKind::*;
	let ty = module.types.get(type_id as usize)?;
	Some(match ty.kind {
		I8 | I16 | I32 | U8 | U16 | U32 | Bool | Char => ValType::I32,
		I64 | U64 => ValType::I64,
		F32 => ValType::F32,
		F64 => ValType::F64,
		Ref | String | Unspecified | I128 | U128 => ValType::Ref,
	})
}

struct FuncCtx<'m> {
	module: &'m Module,
	func_index: u32,
	method_name: Option<&'m str>,
	stack: Vec<ValType>,
	max_observed: u32,
	stack_maps: Vec<StackMap>,
	/// Per-local abstract type, `None` until the slot has been written (or
	/// seeded from a parameter). Monotonic over the single linear pass: a
	/// slot marked written by an earlier instruction stays written, even if
	/// that instruction sits on a branch not taken at runtime — the same
	/// conservative approximation the rest of this verifier makes by not
	/// running a true control-flow fixpoint.
	locals: Vec<Option<ValType>>,
	pc: usize,
	opcode: u8,
	opcode_name: Option<&'static str>,
}

impl<'m> FuncCtx<'m> {
	fn fail(&self, kind: FailureKind, reason: impl Into<String>) -> VerifyError {
		VerifyError::new(kind, self.func_index, reason)
			.with_name(self.method_name)
			.with_pc(self.pc, self.opcode, self.opcode_name)
	}

	fn pop(&mut self) -> Result<ValType, VerifyError> {
		self.stack.pop().ok_or_else(|| self.fail(FailureKind::Stack, "stack underflow"))
	}

	fn pop_expect(&mut self, expected: ValType) -> Result<(), VerifyError> {
		let actual = self.pop()?;
		if actual != expected {
			return Err(self.fail(FailureKind::Type, format!("expected {expected} on stack, found {actual}")));
		}
		Ok(())
	}

	fn push(&mut self, ty: ValType) {
		self.stack.push(ty);
		self.max_observed = self.max_observed.max(self.stack.len() as u32);
	}

	/// Emits a `StackMap` for a safepoint instruction (spec's `LINE`,
	/// `PROFILE_START`, `PROFILE_END`). Must only be called for those three
	/// opcodes; anything else would inflate stack-map coverage beyond what
	/// a GC actually needs to consult.
	fn record_stack_map(&mut self, pc: usize) {
		self.stack_maps.push(StackMap {
			pc,
			stack_height: self.stack.len() as u32,
			ref_bits: ref_bits_of(&self.stack),
		});
	}
}

/// Forward-branch targets whose expected operand-stack shape was recorded
/// before the linear scan reached them.
#[derive(Default)]
struct PendingJoins(FxHashMap<usize, Vec<ValType>>);

impl PendingJoins {
	fn record(&mut self, ctx: &FuncCtx<'_>, target: usize, stack: &[ValType]) -> Result<(), VerifyError> {
		match self.0.get(&target) {
			None => {
				self.0.insert(target, stack.to_vec());
				Ok(())
			}
			Some(existing) => {
				if existing.len() != stack.len() {
					return Err(ctx.fail(FailureKind::Stack, format!(
						"stack height mismatch at pc {target}: {} vs {}",
						existing.len(), stack.len(),
					)));
				}
				for (a, b) in existing.iter().zip(stack.iter()) {
					if a.join(*b).is_none() {
						return Err(ctx.fail(FailureKind::Type, format!(
							"incompatible types at merge point pc {target}: {a} vs {b}",
						)));
					}
				}
				Ok(())
			}
		}
	}
}

fn terminates_straight_line(instr: &Instr) -> bool {
	matches!(
		instr,
		Instr::Ret | Instr::TailCall { .. } | Instr::Halt | Instr::Trap
			| Instr::Jmp { .. } | Instr::JmpTable { .. }
	)
}

/// Verifies every function in `module`. Returns on the first failure,
/// matching the CLI's "one module, one verdict" contract (spec §6).
#[tracing::instrument(skip(module), fields(functions = module.functions.len()))]
pub fn verify_module(module: &Module) -> Result<VerifyInfo, VerifyError> {
	let mut info = VerifyInfo { globals_ref_bits: globals_ref_bits(module), ..VerifyInfo::default() };
	for (func_index, func) in module.functions.iter().enumerate() {
		let func_info = verify_function(module, func_index as u32, func)?;
		info.functions.insert(func_index as u32, func_info);
	}
	Ok(info)
}

fn verify_function(
	module: &Module,
	func_index: u32,
	func: &crate::module::FunctionDef,
) -> Result<FunctionVerifyInfo, VerifyError> {
	let method = module.method(func.method_id).ok_or_else(|| {
		VerifyError::new(FailureKind::Index, func_index, format!("no such method {}", func.method_id))
	})?;
	let sig = module.signature(method.sig_id).ok_or_else(|| {
		VerifyError::new(FailureKind::Index, func_index, format!("no such signature {}", method.sig_id))
	})?;
	let code = module.code.get(func.code_range()).ok_or_else(|| {
		VerifyError::new(FailureKind::Structural, func_index, "function code range out of bounds")
			.with_name(Some(&method.name))
	})?;

	if code.is_empty() {
		return Err(VerifyError::new(FailureKind::Structural, func_index, "empty function body")
			.with_name(Some(&method.name)));
	}

	// Boundary scan: decode every instruction once, record valid pcs.
	let mut instrs = Vec::new();
	let mut valid_pcs: HashSet<usize, BuildNoHashHasher<usize>> = HashSet::default();
	let mut pc = 0usize;
	while pc < code.len() {
		let (instr, next_pc) = opcode::decode(code, pc).map_err(|e| {
			VerifyError::new(FailureKind::Structural, func_index, e.to_string())
				.with_name(Some(&method.name))
				.with_pc(pc, code[pc], None)
		})?;
		valid_pcs.insert(pc);
		instrs.push((pc, instr, next_pc));
		pc = next_pc;
	}

	match &instrs[0].1 {
		Instr::Enter { local_count } if *local_count == method.local_count => {}
		Instr::Enter { local_count } => {
			return Err(VerifyError::new(
				FailureKind::Structural,
				func_index,
				format!("ENTER local count {local_count} does not match method local count {}", method.local_count),
			)
			.with_name(Some(&method.name)));
		}
		_ => {
			return Err(VerifyError::new(FailureKind::Structural, func_index, "function must begin with ENTER")
				.with_name(Some(&method.name)));
		}
	}

	if !terminates_straight_line(&instrs.last().unwrap().1) {
		return Err(VerifyError::new(FailureKind::Control, func_index, "missing return at end of function")
			.with_name(Some(&method.name)));
	}

	let mut locals: Vec<Option<ValType>> = vec![None; method.local_count as usize];
	for (i, type_id) in module.param_types(sig).iter().enumerate() {
		let ty = valtype_of(module, *type_id).ok_or_else(|| {
			VerifyError::new(FailureKind::Index, func_index, format!("param {i} has invalid type id"))
				.with_name(Some(&method.name))
		})?;
		locals[i] = Some(ty);
	}

	let mut ctx = FuncCtx {
		module,
		func_index,
		method_name: Some(&method.name),
		stack: Vec::new(),
		max_observed: 0,
		stack_maps: Vec::new(),
		locals,
		pc: 0,
		opcode: 0,
		opcode_name: None,
	};
	let mut joins = PendingJoins::default();
	let mut reachable_by_fallthrough = true;

	let validate_target = |ctx: &FuncCtx<'_>, next_pc: usize, rel: i32| -> Result<usize, VerifyError> {
		let target = next_pc as i64 + rel as i64;
		if target < 0 || target as usize >= code.len() || !valid_pcs.contains(&(target as usize)) {
			return Err(ctx.fail(FailureKind::Control, format!("invalid jump target {target}")));
		}
		Ok(target as usize)
	};

	for (pc, instr, next_pc) in &instrs {
		let (pc, next_pc) = (*pc, *next_pc);
		ctx.pc = pc;
		ctx.opcode = instr.opcode_byte();
		ctx.opcode_name = Some(instr.name());

		if let Some(expected) = joins.0.remove(&pc) {
			if reachable_by_fallthrough {
				if ctx.stack.len() != expected.len() {
					return Err(ctx.fail(FailureKind::Stack, format!(
						"stack height mismatch at pc {pc}: {} vs {}", ctx.stack.len(), expected.len(),
					)));
				}
				let mut merged = Vec::with_capacity(expected.len());
				for (a, b) in ctx.stack.iter().zip(expected.iter()) {
					match a.join(*b) {
						Some(j) => merged.push(j),
						None => return Err(ctx.fail(FailureKind::Type, format!(
							"incompatible types at merge point pc {pc}: {a} vs {b}",
						))),
					}
				}
				ctx.stack = merged;
			} else {
				// No live fallthrough reaches this pc (it follows an
				// unconditional transfer); adopt the recorded join shape.
				ctx.stack = expected;
			}
		}
		if matches!(instr, Instr::Line { .. } | Instr::ProfileStart | Instr::ProfileEnd) {
			ctx.record_stack_map(pc);
		}

		match instr {
			Instr::CallCheck => {
				if Some(func_index as usize) != module.entry_function_index() {
					return Err(ctx.fail(FailureKind::Control, "CALL_CHECK is only valid in the root function"));
				}
			}
			Instr::Enter { .. } | Instr::Line { .. } | Instr::ProfileStart | Instr::ProfileEnd | Instr::Nop => {}
			Instr::Halt | Instr::Trap => {}

			Instr::Pop => { ctx.pop()?; }
			Instr::Dup => { let t = ctx.pop()?; ctx.push(t); ctx.push(t); }
			Instr::Dup2 => {
				let b = ctx.pop()?;
				let a = ctx.pop()?;
				ctx.push(a); ctx.push(b); ctx.push(a); ctx.push(b);
			}
			Instr::Swap => {
				let b = ctx.pop()?;
				let a = ctx.pop()?;
				ctx.push(b); ctx.push(a);
			}
			Instr::Rot => {
				let c = ctx.pop()?; let b = ctx.pop()?; let a = ctx.pop()?;
				ctx.push(b); ctx.push(c); ctx.push(a);
			}

			Instr::ConstI8(_) | Instr::ConstI16(_) | Instr::ConstI32(_) | Instr::ConstU8(_)
			| Instr::ConstU16(_) | Instr::ConstU32(_) | Instr::ConstChar(_) => ctx.push(ValType::I32),
			Instr::ConstI64(_) | Instr::ConstU64(_) => ctx.push(ValType::I64),
			Instr::ConstF32(_) => ctx.push(ValType::F32),
			Instr::ConstF64(_) => ctx.push(ValType::F64),
			Instr::ConstBool(_) => ctx.push(ValType::Bool),
			Instr::ConstNull => ctx.push(ValType::Ref),
			Instr::ConstString { const_offset } => {
				if module.const_pool.string_const(*const_offset).is_none() {
					return Err(ctx.fail(FailureKind::ConstantPool, format!(
						"CONST_STRING needs >= 8 bytes at offset {const_offset}",
					)));
				}
				ctx.push(ValType::Ref);
			}

			Instr::LoadLocal { index } => {
				if *index >= method.local_count {
					return Err(ctx.fail(FailureKind::Index, format!("local index {index} out of range")));
				}
				let ty = ctx.locals[*index as usize].ok_or_else(|| {
					ctx.fail(FailureKind::Type, format!("local {index} loaded before being written"))
				})?;
				ctx.push(ty);
			}
			Instr::StoreLocal { index } => {
				if *index >= method.local_count {
					return Err(ctx.fail(FailureKind::Index, format!("local index {index} out of range")));
				}
				let value_ty = ctx.pop()?;
				let idx = *index as usize;
				let merged = match ctx.locals[idx] {
					Some(existing) => existing.join(value_ty).ok_or_else(|| ctx.fail(FailureKind::Type, format!(
						"local {index} store type mismatch: slot is {existing}, store value is {value_ty}",
					)))?,
					None => value_ty,
				};
				ctx.locals[idx] = Some(merged);
			}
			Instr::LoadGlobal { index } => {
				let global = module.globals.get(*index as usize).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("global index {index} out of range"))
				})?;
				let ty = valtype_of(module, global.type_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("global {index} has invalid type id"))
				})?;
				ctx.push(ty);
			}
			Instr::StoreGlobal { index } => {
				let global = module.globals.get(*index as usize).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("global index {index} out of range"))
				})?;
				let ty = valtype_of(module, global.type_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("global {index} has invalid type id"))
				})?;
				ctx.pop_expect(ty)?;
			}

			Instr::AddI32 | Instr::SubI32 | Instr::MulI32 | Instr::DivI32 | Instr::ModI32
			| Instr::AndI32 | Instr::OrI32 | Instr::XorI32 | Instr::ShlI32 | Instr::ShrI32
			| Instr::ShrUI32 => {
				ctx.pop_expect(ValType::I32)?; ctx.pop_expect(ValType::I32)?; ctx.push(ValType::I32);
			}
			Instr::NegI32 | Instr::NotI32 => { ctx.pop_expect(ValType::I32)?; ctx.push(ValType::I32); }
			Instr::CmpEqI32 | Instr::CmpNeI32 | Instr::CmpLtI32 | Instr::CmpLeI32
			| Instr::CmpGtI32 | Instr::CmpGeI32 => {
				ctx.pop_expect(ValType::I32)?; ctx.pop_expect(ValType::I32)?; ctx.push(ValType::Bool);
			}

			Instr::AddI64 | Instr::SubI64 | Instr::MulI64 | Instr::DivI64 | Instr::ModI64
			| Instr::AndI64 | Instr::OrI64 | Instr::XorI64 | Instr::ShlI64 | Instr::ShrI64
			| Instr::ShrUI64 => {
				ctx.pop_expect(ValType::I64)?; ctx.pop_expect(ValType::I64)?; ctx.push(ValType::I64);
			}
			Instr::NegI64 | Instr::NotI64 => { ctx.pop_expect(ValType::I64)?; ctx.push(ValType::I64); }
			Instr::CmpEqI64 | Instr::CmpNeI64 | Instr::CmpLtI64 | Instr::CmpLeI64
			| Instr::CmpGtI64 | Instr::CmpGeI64 => {
				ctx.pop_expect(ValType::I64)?; ctx.pop_expect(ValType::I64)?; ctx.push(ValType::Bool);
			}

			Instr::AddF32 | Instr::SubF32 | Instr::MulF32 | Instr::DivF32 => {
				ctx.pop_expect(ValType::F32)?; ctx.pop_expect(ValType::F32)?; ctx.push(ValType::F32);
			}
			Instr::NegF32 => { ctx.pop_expect(ValType::F32)?; ctx.push(ValType::F32); }
			Instr::CmpEqF32 | Instr::CmpNeF32 | Instr::CmpLtF32 | Instr::CmpLeF32
			| Instr::CmpGtF32 | Instr::CmpGeF32 => {
				ctx.pop_expect(ValType::F32)?; ctx.pop_expect(ValType::F32)?; ctx.push(ValType::Bool);
			}

			Instr::AddF64 | Instr::SubF64 | Instr::MulF64 | Instr::DivF64 => {
				ctx.pop_expect(ValType::F64)?; ctx.pop_expect(ValType::F64)?; ctx.push(ValType::F64);
			}
			Instr::NegF64 => { ctx.pop_expect(ValType::F64)?; ctx.push(ValType::F64); }
			Instr::CmpEqF64 | Instr::CmpNeF64 | Instr::CmpLtF64 | Instr::CmpLeF64
			| Instr::CmpGtF64 | Instr::CmpGeF64 => {
				ctx.pop_expect(ValType::F64)?; ctx.pop_expect(ValType::F64)?; ctx.push(ValType::Bool);
			}

			Instr::BoolAnd | Instr::BoolOr => {
				ctx.pop_expect(ValType::Bool)?; ctx.pop_expect(ValType::Bool)?; ctx.push(ValType::Bool);
			}
			Instr::BoolNot => { ctx.pop_expect(ValType::Bool)?; ctx.push(ValType::Bool); }

			Instr::ConvI32ToI64 => { ctx.pop_expect(ValType::I32)?; ctx.push(ValType::I64); }
			Instr::ConvI64ToI32 => { ctx.pop_expect(ValType::I64)?; ctx.push(ValType::I32); }
			Instr::ConvI32ToF32 => { ctx.pop_expect(ValType::I32)?; ctx.push(ValType::F32); }
			Instr::ConvI32ToF64 => { ctx.pop_expect(ValType::I32)?; ctx.push(ValType::F64); }
			Instr::ConvI64ToF32 => { ctx.pop_expect(ValType::I64)?; ctx.push(ValType::F32); }
			Instr::ConvI64ToF64 => { ctx.pop_expect(ValType::I64)?; ctx.push(ValType::F64); }
			Instr::ConvF32ToI32 => { ctx.pop_expect(ValType::F32)?; ctx.push(ValType::I32); }
			Instr::ConvF64ToI32 => { ctx.pop_expect(ValType::F64)?; ctx.push(ValType::I32); }
			Instr::ConvF32ToF64 => { ctx.pop_expect(ValType::F32)?; ctx.push(ValType::F64); }
			Instr::ConvF64ToF32 => { ctx.pop_expect(ValType::F64)?; ctx.push(ValType::F32); }

			Instr::IsNull => { ctx.pop_expect(ValType::Ref)?; ctx.push(ValType::Bool); }
			Instr::RefEq | Instr::RefNe => {
				ctx.pop_expect(ValType::Ref)?; ctx.pop_expect(ValType::Ref)?; ctx.push(ValType::Bool);
			}
			Instr::TypeOf => { ctx.pop_expect(ValType::Ref)?; ctx.push(ValType::I32); }

			Instr::NewArray { type_id } | Instr::NewList { type_id } => {
				if module.types.get(*type_id as usize).is_none() {
					return Err(ctx.fail(FailureKind::Index, format!("type index {type_id} out of range")));
				}
				ctx.pop_expect(ValType::I32)?;
				ctx.push(ValType::Ref);
			}
			Instr::ArrayGet | Instr::ListGet => {
				ctx.pop_expect(ValType::I32)?; ctx.pop_expect(ValType::Ref)?; ctx.push(ValType::Unknown);
			}
			Instr::ArraySet | Instr::ListSet => {
				ctx.pop()?; ctx.pop_expect(ValType::I32)?; ctx.pop_expect(ValType::Ref)?;
			}
			Instr::ListPush => { ctx.pop()?; ctx.pop_expect(ValType::Ref)?; }
			Instr::ArrayLen | Instr::ListLen => { ctx.pop_expect(ValType::Ref)?; ctx.push(ValType::I32); }

			Instr::NewObject { type_id } => {
				if module.types.get(*type_id as usize).is_none() {
					return Err(ctx.fail(FailureKind::Index, format!("type index {type_id} out of range")));
				}
				ctx.push(ValType::Ref);
			}
			Instr::LoadField { field_id } => {
				let field = module.fields.get(*field_id as usize).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("field index {field_id} out of range"))
				})?;
				let ty = valtype_of(module, field.type_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("field {field_id} has invalid type id"))
				})?;
				ctx.pop_expect(ValType::Ref)?;
				ctx.push(ty);
			}
			Instr::StoreField { field_id } => {
				let field = module.fields.get(*field_id as usize).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("field index {field_id} out of range"))
				})?;
				let ty = valtype_of(module, field.type_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("field {field_id} has invalid type id"))
				})?;
				ctx.pop_expect(ty)?;
				ctx.pop_expect(ValType::Ref)?;
			}
			Instr::NewClosure { func_id, upvalue_count } => {
				if module.functions.get(*func_id as usize).is_none() {
					return Err(ctx.fail(FailureKind::Index, format!("function index {func_id} out of range")));
				}
				for _ in 0..*upvalue_count { ctx.pop()?; }
				ctx.push(ValType::Ref);
			}
			Instr::LoadUpvalue { .. } => ctx.push(ValType::Unknown),
			Instr::StoreUpvalue { .. } => { ctx.pop()?; }

			Instr::Jmp { rel } => {
				let target = validate_target(&ctx, next_pc, *rel)?;
				joins.record(&ctx, target, &ctx.stack)?;
			}
			Instr::JmpTrue { rel } | Instr::JmpFalse { rel } => {
				ctx.pop_expect(ValType::Bool)?;
				let target = validate_target(&ctx, next_pc, *rel)?;
				joins.record(&ctx, target, &ctx.stack)?;
			}
			Instr::JmpTable { const_offset, default_rel } => {
				ctx.pop_expect(ValType::I32)?;
				let table = module.const_pool.jump_table(*const_offset).ok_or_else(|| {
					ctx.fail(FailureKind::ConstantPool, format!("invalid jump table blob at offset {const_offset}"))
				})?;
				let default_target = validate_target(&ctx, next_pc, *default_rel)?;
				joins.record(&ctx, default_target, &ctx.stack)?;
				for case_rel in &table.case_offsets {
					let target = validate_target(&ctx, next_pc, *case_rel)?;
					joins.record(&ctx, target, &ctx.stack)?;
				}
			}

			Instr::Call { method_id } => {
				let callee = module.method(*method_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("method index {method_id} out of range"))
				})?;
				let callee_sig = module.signature(callee.sig_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("signature index {} out of range", callee.sig_id))
				})?;
				check_call_args(&mut ctx, module, callee_sig)?;
				if !callee_sig.is_void() {
					let ret = valtype_of(module, callee_sig.ret_type_id).ok_or_else(|| {
						ctx.fail(FailureKind::Index, "callee return type id out of range")
					})?;
					ctx.push(ret);
				}
			}
			Instr::TailCall { method_id } => {
				let callee = module.method(*method_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("method index {method_id} out of range"))
				})?;
				let callee_sig = module.signature(callee.sig_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("signature index {} out of range", callee.sig_id))
				})?;
				if callee_sig.ret_type_id != sig.ret_type_id {
					return Err(ctx.fail(FailureKind::Type, "tail call return type does not match caller"));
				}
				check_call_args(&mut ctx, module, callee_sig)?;
				if !ctx.stack.is_empty() {
					return Err(ctx.fail(FailureKind::Stack, "tail call leaves values on the operand stack"));
				}
			}
			Instr::CallIndirect { sig_id } => {
				let target_sig = module.signature(*sig_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("signature index {sig_id} out of range"))
				})?;
				check_call_args(&mut ctx, module, target_sig)?;
				ctx.pop_expect(ValType::Ref)?;
				if !target_sig.is_void() {
					let ret = valtype_of(module, target_sig.ret_type_id).ok_or_else(|| {
						ctx.fail(FailureKind::Index, "indirect callee return type id out of range")
					})?;
					ctx.push(ret);
				}
			}
			Instr::Ret => {
				if sig.is_void() {
					if !ctx.stack.is_empty() {
						return Err(ctx.fail(FailureKind::Stack, "RET from void function must leave an empty stack"));
					}
				} else {
					let ret = valtype_of(module, sig.ret_type_id).ok_or_else(|| {
						ctx.fail(FailureKind::Index, "function return type id out of range")
					})?;
					ctx.pop_expect(ret)?;
					if !ctx.stack.is_empty() {
						return Err(ctx.fail(FailureKind::Stack, "RET leaves extra values on the operand stack"));
					}
				}
			}

			Instr::Intrinsic { intrinsic_id } => {
				let sig = crate::intrinsics::lookup(*intrinsic_id).ok_or_else(|| {
					ctx.fail(FailureKind::Index, format!("intrinsic id {intrinsic_id} out of range"))
				})?;
				for param in sig.params.iter().rev() {
					ctx.pop_expect((*param).into())?;
				}
				if let Some(ret) = sig.ret {
					ctx.push(ret.into());
				}
			}
			Instr::SysCall { .. } => {
				return Err(ctx.fail(FailureKind::Control, "SYS_CALL is not a supported instruction"));
			}
		}

		reachable_by_fallthrough = !terminates_straight_line(instr);
		if !reachable_by_fallthrough {
			ctx.stack.clear();
		}
	}

	let locals: Vec<VmType> = ctx.locals.iter().map(|slot| final_vm_type(*slot)).collect();
	let locals_ref_bits = vm_ref_bits_of(&locals);
	let info = FunctionVerifyInfo {
		locals,
		locals_ref_bits,
		stack_maps: ctx.stack_maps,
		max_observed_stack: ctx.max_observed,
	};
	if info.max_observed_stack > func.stack_max {
		return Err(VerifyError::new(
			FailureKind::Stack,
			func_index,
			format!("observed stack depth {} exceeds declared stack_max {}", info.max_observed_stack, func.stack_max),
		)
		.with_name(Some(&method.name)));
	}
	Ok(info)
}

fn check_call_args(
	ctx: &mut FuncCtx<'_>,
	module: &Module,
	sig: &crate::module::SignatureDef,
) -> Result<(), VerifyError> {
	for &type_id in module.param_types(sig).iter().rev() {
		let ty = valtype_of(module, type_id).ok_or_else(|| {
			ctx.fail(FailureKind::Index, "call parameter type id out of range")
		})?;
		ctx.pop_expect(ty)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::module::{ModuleBuilder, TypeDef, TypeKind};
	use crate::opcode::Instr;
	use pretty_assertions::assert_eq;

	fn encode(instrs: &[Instr]) -> Vec<u8> {
		let mut out = Vec::new();
		for instr in instrs {
			out.push(instr.opcode_byte());
			match instr {
				Instr::Enter { local_count } | Instr::LoadLocal { index: local_count }
				| Instr::StoreLocal { index: local_count } => out.extend_from_slice(&local_count.to_le_bytes()),
				Instr::ConstI32(v) => out.extend_from_slice(&v.to_le_bytes()),
				Instr::ConstF64(v) => out.extend_from_slice(&v.to_le_bytes()),
				Instr::ConstString { const_offset } => out.extend_from_slice(&const_offset.to_le_bytes()),
				Instr::Jmp { rel } | Instr::JmpTrue { rel } | Instr::JmpFalse { rel } => {
					out.extend_from_slice(&rel.to_le_bytes())
				}
				Instr::Call { method_id } => out.extend_from_slice(&method_id.to_le_bytes()),
				Instr::TailCall { method_id } => out.extend_from_slice(&method_id.to_le_bytes()),
				Instr::Line { line } => out.extend_from_slice(&line.to_le_bytes()),
				_ => {}
			}
		}
		out
	}

	fn i32_type(builder: &mut ModuleBuilder) -> u32 {
		builder.push_type(TypeDef::new(TypeKind::I32))
	}

	#[test]
	fn simple_function_verifies() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(1), Instr::Ret]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		assert!(verify_module(&module).is_ok());
	}

	#[test]
	fn empty_function_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		builder.push_function(method, &[], 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Structural);
	}

	#[test]
	fn stack_underflow_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[Instr::Enter { local_count: 0 }, Instr::Pop, Instr::Ret]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Stack);
	}

	#[test]
	fn invalid_jump_target_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::Jmp { rel: 1000 },
			Instr::ConstI32(0),
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Control);
	}

	#[test]
	fn missing_return_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(1)]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Control);
	}

	#[test]
	fn backward_jump_loop_verifies() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		// Local 0 is a parameter, so LOAD_LOCAL 0 reads an already-initialized slot.
		let sig = builder.push_signature(&[i32_ty], i32_ty);
		let method = builder.push_method("main", sig, 1);
		// loop: LOAD_LOCAL 0; JMP_TRUE loop; CONST_I32 0; RET
		let mut code = encode(&[Instr::Enter { local_count: 1 }]);
		let loop_start = code.len();
		code.push(Instr::LoadLocal { index: 0 }.opcode_byte());
		code.extend_from_slice(&0u16.to_le_bytes());
		let jmp_pc = code.len();
		code.push(Instr::JmpTrue { rel: 0 }.opcode_byte());
		let placeholder = code.len();
		code.extend_from_slice(&0i32.to_le_bytes());
		code.extend(encode(&[Instr::ConstI32(0), Instr::Ret]));
		let rel = loop_start as i32 - (jmp_pc as i32 + 5);
		code[placeholder..placeholder + 4].copy_from_slice(&rel.to_le_bytes());
		builder.push_function(method, &code, 1);
		let module = builder.build();
		assert!(verify_module(&module).is_ok());
	}

	#[test]
	fn call_argument_count_mismatch_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let callee_sig = builder.push_signature(&[i32_ty, i32_ty], i32_ty);
		let callee = builder.push_method("callee", callee_sig, 0);
		let callee_code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(0), Instr::Ret]);
		builder.push_function(callee, &callee_code, 1);

		let caller_sig = builder.push_signature(&[], i32_ty);
		let caller = builder.push_method("caller", caller_sig, 0);
		let caller_code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(1),
			Instr::Call { method_id: callee },
			Instr::Ret,
		]);
		builder.push_function(caller, &caller_code, 2);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Stack);
	}

	#[test]
	fn stack_map_emitted_only_at_safepoints() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[
			Instr::Enter { local_count: 0 },
			Instr::ConstI32(1),
			Instr::Line { line: 1 },
			Instr::ConstI32(2),
			Instr::ProfileStart,
			Instr::Pop,
			Instr::Pop,
			Instr::ProfileEnd,
			Instr::ConstI32(0),
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let func_info = &info.functions[&0];
		assert_eq!(func_info.stack_maps.len(), 3);
		assert_eq!(func_info.stack_maps[0].stack_height, 1);
		assert_eq!(func_info.stack_maps[1].stack_height, 2);
		assert_eq!(func_info.stack_maps[2].stack_height, 0);
	}

	#[test]
	fn ref_bits_mark_only_reference_slots() {
		assert_eq!(ref_bits_of(&[ValType::I32, ValType::Ref, ValType::I32, ValType::Ref]), vec![0b1010]);
		assert_eq!(ref_bits_of(&[ValType::I32; 3]), vec![0b0000]);
		assert!(ref_bits_of(&[]).is_empty());
	}

	#[test]
	fn load_local_before_store_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 1);
		let code = encode(&[
			Instr::Enter { local_count: 1 },
			Instr::LoadLocal { index: 0 },
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Type);
	}

	#[test]
	fn load_local_seeded_by_parameter_is_accepted() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[i32_ty], i32_ty);
		let method = builder.push_method("main", sig, 1);
		let code = encode(&[
			Instr::Enter { local_count: 1 },
			Instr::LoadLocal { index: 0 },
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		assert!(verify_module(&module).is_ok());
	}

	#[test]
	fn load_local_after_store_is_accepted() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 1);
		let code = encode(&[
			Instr::Enter { local_count: 1 },
			Instr::ConstI32(5),
			Instr::StoreLocal { index: 0 },
			Instr::LoadLocal { index: 0 },
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		assert!(verify_module(&module).is_ok());
	}

	#[test]
	fn store_local_type_mismatch_is_rejected() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 1);
		let code = encode(&[
			Instr::Enter { local_count: 1 },
			Instr::ConstI32(1),
			Instr::StoreLocal { index: 0 },
			Instr::ConstF64(1.0),
			Instr::StoreLocal { index: 0 },
			Instr::ConstI32(0),
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let err = verify_module(&module).unwrap_err();
		assert_eq!(err.kind, FailureKind::Type);
	}

	#[test]
	fn locals_and_locals_ref_bits_are_reported() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[i32_ty], i32_ty);
		let method = builder.push_method("main", sig, 2);
		let const_offset = builder.intern_string_const("hi");
		let code = encode(&[
			Instr::Enter { local_count: 2 },
			Instr::ConstString { const_offset },
			Instr::StoreLocal { index: 1 },
			Instr::ConstI32(0),
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let func_info = &info.functions[&0];
		assert_eq!(func_info.locals, vec![VmType::I32, VmType::Ref]);
		assert_eq!(func_info.locals_ref_bits, vec![0b10]);
	}

	#[test]
	fn unwritten_local_defaults_to_i32() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 2);
		let code = encode(&[
			Instr::Enter { local_count: 2 },
			Instr::ConstI32(0),
			Instr::StoreLocal { index: 0 },
			Instr::ConstI32(0),
			Instr::Ret,
		]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		let func_info = &info.functions[&0];
		assert_eq!(func_info.locals, vec![VmType::I32, VmType::I32]);
		assert!(func_info.locals_ref_bits.iter().all(|b| *b == 0));
	}

	#[test]
	fn globals_ref_bits_mark_reference_globals() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = i32_type(&mut builder);
		let ref_ty = builder.push_type(TypeDef::new(TypeKind::String));
		builder.push_global(i32_ty, crate::module::NONE_ID);
		builder.push_global(ref_ty, crate::module::NONE_ID);
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = encode(&[Instr::Enter { local_count: 0 }, Instr::ConstI32(0), Instr::Ret]);
		builder.push_function(method, &code, 1);
		let module = builder.build();
		let info = verify_module(&module).unwrap();
		assert_eq!(info.globals_ref_bits, vec![0b10]);
	}
}
