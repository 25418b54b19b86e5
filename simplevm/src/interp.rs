//! C5 — the interpreter core.
//!
//! `run` executes one function body to completion against an
//! [`crate::exec::Engine`]. Both the uncompiled tier and the reference
//! compiled tiers (`crate::compile::reference`) call into this function —
//! there is only one implementation of instruction semantics in the whole
//! engine, which is what makes interpreted and compiled execution
//! observationally identical by construction.

use std::fmt;

use crate::exec::Engine;
use crate::intrinsics::Host;
use crate::module::FunctionDef;
use crate::opcode::{self, Instr};
use crate::promote::Tier;
use crate::value::{RefValue, Value};

/// A runtime trap: a dynamic condition the verifier cannot rule out
/// statically (spec §5, "Runtime traps").
#[derive(Debug, Clone)]
pub enum Trap {
	DivisionByZero,
	NullDereference,
	IndexOutOfBounds { index: i64, len: usize },
	Explicit,
	StackOverflow,
	HostError(String),
}

impl fmt::Display for Trap {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Trap::DivisionByZero => write!(f, "division by zero"),
			Trap::NullDereference => write!(f, "null dereference"),
			Trap::IndexOutOfBounds { index, len } => write!(f, "index {index} out of bounds for length {len}"),
			Trap::Explicit => write!(f, "explicit trap"),
			Trap::StackOverflow => write!(f, "call stack overflow"),
			Trap::HostError(msg) => write!(f, "{msg}"),
		}
	}
}

impl std::error::Error for Trap {}

fn jump(next_pc: usize, rel: i32) -> usize {
	(next_pc as i64 + rel as i64) as usize
}

fn as_ref(value: &Value) -> Result<&std::rc::Rc<std::cell::RefCell<RefValue>>, Trap> {
	match value {
		Value::Ref(r) => Ok(r),
		_ => Err(Trap::NullDereference),
	}
}

/// Runs `func` with `args` already bound as its first locals and `upvalues`
/// available to `LOAD_UPVALUE`/`STORE_UPVALUE`. Returns the function's
/// result values (zero or one, per spec §3).
///
/// `tier` is `Some` when this dispatch is running through a live compiled
/// entry for that tier; a division or modulo by zero hit under a `Some`
/// tier still traps exactly as it would under the interpreter, but also
/// reports a bailout so the engine stops crediting that tier for this
/// function.
pub fn run<H: Host>(
	engine: &mut Engine<'_, H>,
	func_index: u32,
	func: &FunctionDef,
	args: Vec<Value>,
	upvalues: Vec<Value>,
	tier: Option<Tier>,
) -> Result<Vec<Value>, Trap> {
	let method = engine.module.method(func.method_id).expect("verified module");
	let code = &engine.module.code[func.code_range()];

	let mut locals = vec![Value::I32(0); method.local_count as usize];
	for (slot, arg) in locals.iter_mut().zip(args.into_iter()) {
		*slot = arg;
	}
	let mut upvalues = upvalues;

	let mut stack: Vec<Value> = Vec::new();
	let mut pc = 0usize;
	let mut opcodes_run: u64 = 0;

	loop {
		let (instr, next_pc) = opcode::decode(code, pc).expect("module was verified");
		if !matches!(instr, Instr::Nop) {
			opcodes_run += 1;
		}
		engine.bump_opcode(instr.opcode_byte());

		macro_rules! pop { () => { stack.pop().expect("verified stack discipline") } }
		macro_rules! bin_i32 { ($op:expr) => {{ let b = pop!().as_i32().unwrap(); let a = pop!().as_i32().unwrap(); stack.push(Value::I32($op(a, b))); }} }
		macro_rules! bin_i64 { ($op:expr) => {{ let b = pop!().as_i64().unwrap(); let a = pop!().as_i64().unwrap(); stack.push(Value::I64($op(a, b))); }} }
		macro_rules! cmp_i32 { ($op:expr) => {{ let b = pop!().as_i32().unwrap(); let a = pop!().as_i32().unwrap(); stack.push(Value::Bool($op(&a, &b))); }} }
		macro_rules! cmp_i64 { ($op:expr) => {{ let b = pop!().as_i64().unwrap(); let a = pop!().as_i64().unwrap(); stack.push(Value::Bool($op(&a, &b))); }} }
		macro_rules! bin_f32 { ($op:expr) => {{ let b = pop!().as_f32().unwrap(); let a = pop!().as_f32().unwrap(); stack.push(Value::F32($op(a, b))); }} }
		macro_rules! cmp_f32 { ($op:expr) => {{ let b = pop!().as_f32().unwrap(); let a = pop!().as_f32().unwrap(); stack.push(Value::Bool($op(&a, &b))); }} }
		macro_rules! bin_f64 { ($op:expr) => {{ let b = pop!().as_f64().unwrap(); let a = pop!().as_f64().unwrap(); stack.push(Value::F64($op(a, b))); }} }
		macro_rules! cmp_f64 { ($op:expr) => {{ let b = pop!().as_f64().unwrap(); let a = pop!().as_f64().unwrap(); stack.push(Value::Bool($op(&a, &b))); }} }

		match &instr {
			Instr::Nop | Instr::Enter { .. } | Instr::Line { .. } | Instr::ProfileStart
			| Instr::ProfileEnd | Instr::CallCheck => {}
			Instr::Halt => {
				engine.note_opcodes_run(func_index, opcodes_run);
				return Ok(vec![]);
			}
			Instr::Trap => return Err(Trap::Explicit),

			Instr::Pop => { pop!(); }
			Instr::Dup => { let v = pop!(); stack.push(v.clone()); stack.push(v); }
			Instr::Dup2 => {
				let b = pop!(); let a = pop!();
				stack.push(a.clone()); stack.push(b.clone()); stack.push(a); stack.push(b);
			}
			Instr::Swap => { let b = pop!(); let a = pop!(); stack.push(b); stack.push(a); }
			Instr::Rot => {
				let c = pop!(); let b = pop!(); let a = pop!();
				stack.push(b); stack.push(c); stack.push(a);
			}

			Instr::ConstI8(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstI16(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstI32(v) => stack.push(Value::I32(*v)),
			Instr::ConstU8(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstU16(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstU32(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstChar(v) => stack.push(Value::I32(*v as i32)),
			Instr::ConstI64(v) => stack.push(Value::I64(*v)),
			Instr::ConstU64(v) => stack.push(Value::I64(*v as i64)),
			Instr::ConstF32(v) => stack.push(Value::F32(*v)),
			Instr::ConstF64(v) => stack.push(Value::F64(*v)),
			Instr::ConstBool(v) => stack.push(Value::Bool(*v)),
			Instr::ConstNull => stack.push(Value::null_ref()),
			Instr::ConstString { const_offset } => {
				let s = engine.module.const_pool.string_const(*const_offset).expect("verified").to_owned();
				stack.push(Value::Ref(std::rc::Rc::new(std::cell::RefCell::new(RefValue::String(s)))));
			}

			Instr::LoadLocal { index } => stack.push(locals[*index as usize].clone()),
			Instr::StoreLocal { index } => locals[*index as usize] = pop!(),
			Instr::LoadGlobal { index } => stack.push(engine.globals[*index as usize].clone()),
			Instr::StoreGlobal { index } => engine.globals[*index as usize] = pop!(),

			Instr::AddI32 => bin_i32!(i32::wrapping_add),
			Instr::SubI32 => bin_i32!(i32::wrapping_sub),
			Instr::MulI32 => bin_i32!(i32::wrapping_mul),
			Instr::DivI32 => {
				let b = pop!().as_i32().unwrap(); let a = pop!().as_i32().unwrap();
				if b == 0 {
					if let Some(t) = tier { engine.bailout(func_index, t); }
					return Err(Trap::DivisionByZero);
				}
				stack.push(Value::I32(a.wrapping_div(b)));
			}
			Instr::ModI32 => {
				let b = pop!().as_i32().unwrap(); let a = pop!().as_i32().unwrap();
				if b == 0 {
					if let Some(t) = tier { engine.bailout(func_index, t); }
					return Err(Trap::DivisionByZero);
				}
				stack.push(Value::I32(a.wrapping_rem(b)));
			}
			Instr::NegI32 => { let a = pop!().as_i32().unwrap(); stack.push(Value::I32(a.wrapping_neg())); }
			Instr::AndI32 => bin_i32!(|a: i32, b: i32| a & b),
			Instr::OrI32 => bin_i32!(|a: i32, b: i32| a | b),
			Instr::XorI32 => bin_i32!(|a: i32, b: i32| a ^ b),
			Instr::ShlI32 => bin_i32!(|a: i32, b: i32| a.wrapping_shl(b as u32)),
			Instr::ShrI32 => bin_i32!(|a: i32, b: i32| a.wrapping_shr(b as u32)),
			Instr::ShrUI32 => bin_i32!(|a: i32, b: i32| ((a as u32).wrapping_shr(b as u32)) as i32),
			Instr::NotI32 => { let a = pop!().as_i32().unwrap(); stack.push(Value::I32(!a)); }
			Instr::CmpEqI32 => cmp_i32!(i32::eq),
			Instr::CmpNeI32 => cmp_i32!(i32::ne),
			Instr::CmpLtI32 => cmp_i32!(i32::lt),
			Instr::CmpLeI32 => cmp_i32!(i32::le),
			Instr::CmpGtI32 => cmp_i32!(i32::gt),
			Instr::CmpGeI32 => cmp_i32!(i32::ge),

			Instr::AddI64 => bin_i64!(i64::wrapping_add),
			Instr::SubI64 => bin_i64!(i64::wrapping_sub),
			Instr::MulI64 => bin_i64!(i64::wrapping_mul),
			Instr::DivI64 => {
				let b = pop!().as_i64().unwrap(); let a = pop!().as_i64().unwrap();
				if b == 0 {
					if let Some(t) = tier { engine.bailout(func_index, t); }
					return Err(Trap::DivisionByZero);
				}
				stack.push(Value::I64(a.wrapping_div(b)));
			}
			Instr::ModI64 => {
				let b = pop!().as_i64().unwrap(); let a = pop!().as_i64().unwrap();
				if b == 0 {
					if let Some(t) = tier { engine.bailout(func_index, t); }
					return Err(Trap::DivisionByZero);
				}
				stack.push(Value::I64(a.wrapping_rem(b)));
			}
			Instr::NegI64 => { let a = pop!().as_i64().unwrap(); stack.push(Value::I64(a.wrapping_neg())); }
			Instr::AndI64 => bin_i64!(|a: i64, b: i64| a & b),
			Instr::OrI64 => bin_i64!(|a: i64, b: i64| a | b),
			Instr::XorI64 => bin_i64!(|a: i64, b: i64| a ^ b),
			Instr::ShlI64 => bin_i64!(|a: i64, b: i64| a.wrapping_shl(b as u32)),
			Instr::ShrI64 => bin_i64!(|a: i64, b: i64| a.wrapping_shr(b as u32)),
			Instr::ShrUI64 => bin_i64!(|a: i64, b: i64| ((a as u64).wrapping_shr(b as u32)) as i64),
			Instr::NotI64 => { let a = pop!().as_i64().unwrap(); stack.push(Value::I64(!a)); }
			Instr::CmpEqI64 => cmp_i64!(i64::eq),
			Instr::CmpNeI64 => cmp_i64!(i64::ne),
			Instr::CmpLtI64 => cmp_i64!(i64::lt),
			Instr::CmpLeI64 => cmp_i64!(i64::le),
			Instr::CmpGtI64 => cmp_i64!(i64::gt),
			Instr::CmpGeI64 => cmp_i64!(i64::ge),

			Instr::AddF32 => bin_f32!(|a: f32, b: f32| a + b),
			Instr::SubF32 => bin_f32!(|a: f32, b: f32| a - b),
			Instr::MulF32 => bin_f32!(|a: f32, b: f32| a * b),
			Instr::DivF32 => bin_f32!(|a: f32, b: f32| a / b),
			Instr::NegF32 => { let a = pop!().as_f32().unwrap(); stack.push(Value::F32(-a)); }
			Instr::CmpEqF32 => cmp_f32!(f32::eq),
			Instr::CmpNeF32 => cmp_f32!(f32::ne),
			Instr::CmpLtF32 => cmp_f32!(f32::lt),
			Instr::CmpLeF32 => cmp_f32!(f32::le),
			Instr::CmpGtF32 => cmp_f32!(f32::gt),
			Instr::CmpGeF32 => cmp_f32!(f32::ge),

			Instr::AddF64 => bin_f64!(|a: f64, b: f64| a + b),
			Instr::SubF64 => bin_f64!(|a: f64, b: f64| a - b),
			Instr::MulF64 => bin_f64!(|a: f64, b: f64| a * b),
			Instr::DivF64 => bin_f64!(|a: f64, b: f64| a / b),
			Instr::NegF64 => { let a = pop!().as_f64().unwrap(); stack.push(Value::F64(-a)); }
			Instr::CmpEqF64 => cmp_f64!(f64::eq),
			Instr::CmpNeF64 => cmp_f64!(f64::ne),
			Instr::CmpLtF64 => cmp_f64!(f64::lt),
			Instr::CmpLeF64 => cmp_f64!(f64::le),
			Instr::CmpGtF64 => cmp_f64!(f64::gt),
			Instr::CmpGeF64 => cmp_f64!(f64::ge),

			Instr::BoolAnd => { let b = pop!().as_bool().unwrap(); let a = pop!().as_bool().unwrap(); stack.push(Value::Bool(a && b)); }
			Instr::BoolOr => { let b = pop!().as_bool().unwrap(); let a = pop!().as_bool().unwrap(); stack.push(Value::Bool(a || b)); }
			Instr::BoolNot => { let a = pop!().as_bool().unwrap(); stack.push(Value::Bool(!a)); }

			Instr::ConvI32ToI64 => { let a = pop!().as_i32().unwrap(); stack.push(Value::I64(a as i64)); }
			Instr::ConvI64ToI32 => { let a = pop!().as_i64().unwrap(); stack.push(Value::I32(a as i32)); }
			Instr::ConvI32ToF32 => { let a = pop!().as_i32().unwrap(); stack.push(Value::F32(a as f32)); }
			Instr::ConvI32ToF64 => { let a = pop!().as_i32().unwrap(); stack.push(Value::F64(a as f64)); }
			Instr::ConvI64ToF32 => { let a = pop!().as_i64().unwrap(); stack.push(Value::F32(a as f32)); }
			Instr::ConvI64ToF64 => { let a = pop!().as_i64().unwrap(); stack.push(Value::F64(a as f64)); }
			Instr::ConvF32ToI32 => { let a = pop!().as_f32().unwrap(); stack.push(Value::I32(a as i32)); }
			Instr::ConvF64ToI32 => { let a = pop!().as_f64().unwrap(); stack.push(Value::I32(a as i32)); }
			Instr::ConvF32ToF64 => { let a = pop!().as_f32().unwrap(); stack.push(Value::F64(a as f64)); }
			Instr::ConvF64ToF32 => { let a = pop!().as_f64().unwrap(); stack.push(Value::F32(a as f32)); }

			Instr::IsNull => { let v = pop!(); stack.push(Value::Bool(v.is_null())); }
			Instr::RefEq | Instr::RefNe => {
				let b = pop!(); let a = pop!();
				let eq = match (as_ref(&a)?, as_ref(&b)?) { (a, b) => std::rc::Rc::ptr_eq(a, b) || a.borrow().eq_null(&b.borrow()) };
				stack.push(Value::Bool(if matches!(instr, Instr::RefEq) { eq } else { !eq }));
			}
			Instr::TypeOf => { let v = pop!(); stack.push(Value::I32(type_tag(&v))); }

			Instr::NewArray { type_id } => {
				let len = pop!().as_i32().unwrap();
				if len < 0 { return Err(Trap::IndexOutOfBounds { index: len as i64, len: 0 }); }
				let elements = vec![Value::I32(0); len as usize];
				stack.push(Value::Ref(std::rc::Rc::new(std::cell::RefCell::new(RefValue::Array { type_id: *type_id, elements }))));
			}
			Instr::NewList { type_id } => {
				let cap = pop!().as_i32().unwrap().max(0) as usize;
				stack.push(Value::Ref(std::rc::Rc::new(std::cell::RefCell::new(RefValue::List { type_id: *type_id, elements: Vec::with_capacity(cap) }))));
			}
			Instr::ArrayGet | Instr::ListGet => {
				let index = pop!().as_i32().unwrap();
				let v = pop!();
				let cell = as_ref(&v)?;
				let borrowed = cell.borrow();
				let elements = match &*borrowed {
					RefValue::Array { elements, .. } | RefValue::List { elements, .. } => elements,
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
				let value = elements.get(index as usize).cloned().ok_or(Trap::IndexOutOfBounds { index: index as i64, len: elements.len() })?;
				drop(borrowed);
				stack.push(value);
			}
			Instr::ArraySet | Instr::ListSet => {
				let value = pop!();
				let index = pop!().as_i32().unwrap();
				let v = pop!();
				let cell = as_ref(&v)?;
				let mut borrowed = cell.borrow_mut();
				let elements = match &mut *borrowed {
					RefValue::Array { elements, .. } | RefValue::List { elements, .. } => elements,
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
				let len = elements.len();
				let slot = elements.get_mut(index as usize).ok_or(Trap::IndexOutOfBounds { index: index as i64, len })?;
				*slot = value;
			}
			Instr::ListPush => {
				let value = pop!();
				let v = pop!();
				let cell = as_ref(&v)?;
				match &mut *cell.borrow_mut() {
					RefValue::List { elements, .. } => elements.push(value),
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
			}
			Instr::ArrayLen | Instr::ListLen => {
				let v = pop!();
				let cell = as_ref(&v)?;
				let borrowed = cell.borrow();
				let len = match &*borrowed {
					RefValue::Array { elements, .. } | RefValue::List { elements, .. } => elements.len(),
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
				stack.push(Value::I32(len as i32));
			}

			Instr::NewObject { type_id } => {
				let field_count = engine.module.fields.len();
				stack.push(Value::Ref(std::rc::Rc::new(std::cell::RefCell::new(RefValue::Object {
					type_id: *type_id,
					fields: vec![Value::I32(0); field_count],
				}))));
			}
			Instr::LoadField { field_id } => {
				let v = pop!();
				let cell = as_ref(&v)?;
				let borrowed = cell.borrow();
				match &*borrowed {
					RefValue::Object { fields, .. } => stack.push(fields[*field_id as usize].clone()),
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				}
			}
			Instr::StoreField { field_id } => {
				let value = pop!();
				let v = pop!();
				let cell = as_ref(&v)?;
				match &mut *cell.borrow_mut() {
					RefValue::Object { fields, .. } => fields[*field_id as usize] = value,
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
			}
			Instr::NewClosure { func_id, upvalue_count } => {
				let mut captured = Vec::with_capacity(*upvalue_count as usize);
				for _ in 0..*upvalue_count {
					captured.push(pop!());
				}
				captured.reverse();
				stack.push(Value::Ref(std::rc::Rc::new(std::cell::RefCell::new(RefValue::Closure {
					func_id: *func_id,
					upvalues: captured,
				}))));
			}
			Instr::LoadUpvalue { index } => {
				stack.push(upvalues.get(*index as usize).cloned().ok_or(Trap::IndexOutOfBounds { index: *index as i64, len: upvalues.len() })?);
			}
			Instr::StoreUpvalue { index } => {
				let value = pop!();
				let len = upvalues.len();
				let slot = upvalues.get_mut(*index as usize).ok_or(Trap::IndexOutOfBounds { index: *index as i64, len })?;
				*slot = value;
			}

			Instr::Jmp { rel } => { pc = jump(next_pc, *rel); continue; }
			Instr::JmpTrue { rel } => {
				let cond = pop!().as_bool().unwrap();
				pc = if cond { jump(next_pc, *rel) } else { next_pc };
				continue;
			}
			Instr::JmpFalse { rel } => {
				let cond = pop!().as_bool().unwrap();
				pc = if !cond { jump(next_pc, *rel) } else { next_pc };
				continue;
			}
			Instr::JmpTable { const_offset, default_rel } => {
				let index = pop!().as_i32().unwrap();
				let table = engine.module.const_pool.jump_table(*const_offset).expect("verified");
				pc = match table.case_offsets.get(index as usize) {
					Some(rel) => jump(next_pc, *rel),
					None => jump(next_pc, *default_rel),
				};
				continue;
			}

			Instr::Call { method_id } => {
				let callee = engine.module.method(*method_id).expect("verified");
				let target = engine.module.function_index_for_method(*method_id).expect("verified") as u32;
				let sig = engine.module.signature(callee.sig_id).expect("verified");
				let call_args = split_args(&mut stack, engine.module.param_types(sig).len());
				let results = engine.call(target, call_args)?;
				stack.extend(results);
			}
			Instr::TailCall { method_id } => {
				let callee = engine.module.method(*method_id).expect("verified");
				let target = engine.module.function_index_for_method(*method_id).expect("verified") as u32;
				let sig = engine.module.signature(callee.sig_id).expect("verified");
				let call_args = split_args(&mut stack, engine.module.param_types(sig).len());
				let results = engine.call(target, call_args)?;
				engine.note_opcodes_run(func_index, opcodes_run);
				return Ok(results);
			}
			Instr::CallIndirect { sig_id } => {
				let target_ref = pop!();
				let cell = as_ref(&target_ref)?;
				let (target, closure_upvalues) = match &*cell.borrow() {
					RefValue::Closure { func_id, upvalues } => (*func_id, upvalues.clone()),
					RefValue::Null => return Err(Trap::NullDereference),
					_ => return Err(Trap::NullDereference),
				};
				let sig = engine.module.signature(*sig_id).expect("verified");
				let call_args = split_args(&mut stack, engine.module.param_types(sig).len());
				let results = engine.call_with_upvalues(target, call_args, closure_upvalues)?;
				stack.extend(results);
			}
			Instr::Ret => {
				engine.note_opcodes_run(func_index, opcodes_run);
				return Ok(stack.pop().into_iter().collect());
			}

			Instr::Intrinsic { intrinsic_id } => {
				let sig = crate::intrinsics::lookup(*intrinsic_id).expect("verified");
				let call_args = split_args(&mut stack, sig.params.len());
				let result = engine.host.call(*intrinsic_id, &call_args).map_err(|e| Trap::HostError(e.0))?;
				if let Some(v) = result {
					stack.push(v);
				}
			}
			Instr::SysCall { .. } => unreachable!("rejected by verifier"),
		}

		pc = next_pc;
	}
}

fn split_args(stack: &mut Vec<Value>, count: usize) -> Vec<Value> {
	let start = stack.len() - count;
	stack.split_off(start)
}

fn type_tag(value: &Value) -> i32 {
	match value {
		Value::I32(_) => 0,
		Value::I64(_) => 1,
		Value::F32(_) => 2,
		Value::F64(_) => 3,
		Value::Bool(_) => 4,
		Value::Ref(_) => 5,
	}
}

impl RefValue {
	fn eq_null(&self, other: &RefValue) -> bool {
		matches!((self, other), (RefValue::Null, RefValue::Null))
	}
}
