//! C1 — the in-memory module model (spec §3).
//!
//! A [`Module`] is an immutable bundle of flat tables produced by the
//! loader (`crate::loader`) or hand-assembled by a [`ModuleBuilder`] for
//! tests and tooling. Nothing in this module executes bytecode; it only
//! describes the shape of one.

use bitflags::bitflags;
use simplevm_derive::FromRepr;

/// `ret_type_id`/`entry_method_id`/"no such index" sentinel used throughout
/// the binary format.
pub const NONE_ID: u32 = 0xFFFF_FFFF;

/// The closed set of scalar kinds a [`TypeDef`] can describe. Discriminants
/// are load-bearing: they are the on-disk encoding the loader reads back
/// via [`TypeKind::from_repr`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
#[repr(u8)]
pub enum TypeKind {
	I8 = 0,
	I16 = 1,
	I32 = 2,
	I64 = 3,
	U8 = 4,
	U16 = 5,
	U32 = 6,
	U64 = 7,
	F32 = 8,
	F64 = 9,
	Bool = 10,
	Char = 11,
	Ref = 12,
	String = 13,
	I128 = 14,
	U128 = 15,
	Unspecified = 16,
}

bitflags! {
	/// Per-`TypeDef` flags. Only bit 0 is defined: on an `Unspecified` kind
	/// it marks the type as a reference (spec §3).
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
	pub struct TypeFlags: u8 {
		const REF = 0b0000_0001;
	}
}

/// One entry of the module's type table.
#[derive(Debug, Copy, Clone)]
pub struct TypeDef {
	pub kind: TypeKind,
	pub flags: TypeFlags,
}

impl TypeDef {
	pub const fn new(kind: TypeKind) -> Self {
		Self { kind, flags: TypeFlags::empty() }
	}

	pub const fn unspecified_ref() -> Self {
		Self { kind: TypeKind::Unspecified, flags: TypeFlags::REF }
	}

	/// Whether this module-level type denotes a GC/tracing reference.
	///
	/// `I128`/`U128` are represented as boxed references until a wide-integer
	/// runtime representation is defined (spec §9, open question).
	pub fn is_reference(&self) -> bool {
		match self.kind {
			TypeKind::Ref | TypeKind::String | TypeKind::I128 | TypeKind::U128 => true,
			TypeKind::Unspecified => self.flags.contains(TypeFlags::REF),
			_ => false,
		}
	}
}

#[derive(Debug, Copy, Clone)]
pub struct FieldDef {
	pub type_id: u32,
}

#[derive(Debug, Copy, Clone)]
pub struct GlobalDef {
	pub type_id: u32,
	pub init_const_id: u32,
}

impl GlobalDef {
	pub fn is_initialized(&self) -> bool {
		self.init_const_id != NONE_ID
	}
}

#[derive(Debug, Clone)]
pub struct SignatureDef {
	pub param_count: u32,
	pub param_type_start: u32,
	pub ret_type_id: u32,
}

impl SignatureDef {
	pub fn is_void(&self) -> bool {
		self.ret_type_id == NONE_ID
	}
}

#[derive(Debug, Clone)]
pub struct MethodDef {
	pub name: String,
	pub sig_id: u32,
	pub local_count: u16,
}

#[derive(Debug, Copy, Clone)]
pub struct FunctionDef {
	pub method_id: u32,
	pub code_offset: u32,
	pub code_size: u32,
	pub stack_max: u32,
}

impl FunctionDef {
	pub fn code_range(&self) -> std::ops::Range<usize> {
		self.code_offset as usize..(self.code_offset + self.code_size) as usize
	}
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Header {
	pub entry_method_id: u32,
}

impl Header {
	pub fn has_entry(&self) -> bool {
		self.entry_method_id != NONE_ID
	}
}

/// A jump table decoded from the const pool: relative case targets measured
/// from the instruction-after-operand position of the `JmpTable` that
/// referenced them (spec §4.2, `JMP_TABLE`).
#[derive(Debug, Clone)]
pub struct JumpTable {
	pub case_offsets: Vec<i32>,
}

/// The module's byte-addressable constant pool: null-terminated UTF-8 names
/// (resolved eagerly by the loader into `MethodDef::name` and friends) and
/// tagged constants, of which kind tag `6` is a jump-table blob (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
	pub bytes: Vec<u8>,
}

const JUMP_TABLE_TAG: u8 = 6;

impl ConstPool {
	pub fn new(bytes: Vec<u8>) -> Self {
		Self { bytes }
	}

	/// Reads a length-prefixed UTF-8 string constant: `u32` length, `u32`
	/// reserved, then `length` bytes of UTF-8. The header alone is 8 bytes,
	/// matching spec §4.2's "`CONST_STRING` needs ≥ 8 bytes at the offset".
	pub fn string_const(&self, offset: u32) -> Option<&str> {
		let offset = offset as usize;
		if offset + 8 > self.bytes.len() {
			return None;
		}
		let len = u32::from_le_bytes(self.bytes[offset..offset + 4].try_into().unwrap()) as usize;
		let start = offset + 8;
		let end = start.checked_add(len)?;
		if end > self.bytes.len() {
			return None;
		}
		std::str::from_utf8(&self.bytes[start..end]).ok()
	}

	/// Reads a null-terminated name string used for method/type/namespace
	/// names, as distinct from the length-prefixed `CONST_STRING` constants.
	pub fn name_at(&self, offset: u32) -> Option<&str> {
		let offset = offset as usize;
		let end = self.bytes[offset..].iter().position(|b| *b == 0)? + offset;
		std::str::from_utf8(&self.bytes[offset..end]).ok()
	}

	/// Reads a fixed-width little-endian scalar constant, used for global
	/// initializers. `width` must be 4 or 8.
	pub fn scalar_const(&self, offset: u32, width: usize) -> Option<&[u8]> {
		let offset = offset as usize;
		self.bytes.get(offset..offset + width)
	}

	/// Reads a `JMP_TABLE` blob: `u8` kind tag `6`, `u32` length, `u32` case
	/// count, then `count` little-endian `i32` relative case offsets, with
	/// `length == 4 + count * 4` (spec §4.2).
	pub fn jump_table(&self, offset: u32) -> Option<JumpTable> {
		let offset = offset as usize;
		if offset + 9 > self.bytes.len() {
			return None;
		}
		if self.bytes[offset] != JUMP_TABLE_TAG {
			return None;
		}
		let length = u32::from_le_bytes(self.bytes[offset + 1..offset + 5].try_into().unwrap());
		let count = u32::from_le_bytes(self.bytes[offset + 5..offset + 9].try_into().unwrap());
		if length != 4 + count.checked_mul(4)? {
			return None;
		}
		let entries_start = offset + 9;
		let entries_end = entries_start.checked_add(count as usize * 4)?;
		if entries_end > self.bytes.len() {
			return None;
		}
		let case_offsets = self.bytes[entries_start..entries_end]
			.chunks_exact(4)
			.map(|c| i32::from_le_bytes(c.try_into().unwrap()))
			.collect();
		Some(JumpTable { case_offsets })
	}
}

/// An immutable, loaded module. Produced by `crate::loader::load` or
/// [`ModuleBuilder::build`]; never mutated for the lifetime of the process
/// (spec §3, "Lifecycle").
#[derive(Debug, Clone)]
pub struct Module {
	pub code: Vec<u8>,
	pub functions: Vec<FunctionDef>,
	pub methods: Vec<MethodDef>,
	pub signatures: Vec<SignatureDef>,
	pub param_types: Vec<u32>,
	pub types: Vec<TypeDef>,
	pub fields: Vec<FieldDef>,
	pub globals: Vec<GlobalDef>,
	pub const_pool: ConstPool,
	pub header: Header,
}

impl Module {
	pub fn signature(&self, sig_id: u32) -> Option<&SignatureDef> {
		self.signatures.get(sig_id as usize)
	}

	pub fn param_types(&self, sig: &SignatureDef) -> &[u32] {
		let start = sig.param_type_start as usize;
		let end = start + sig.param_count as usize;
		&self.param_types[start..end]
	}

	pub fn method(&self, method_id: u32) -> Option<&MethodDef> {
		self.methods.get(method_id as usize)
	}

	pub fn function_signature(&self, func: &FunctionDef) -> Option<&SignatureDef> {
		let method = self.method(func.method_id)?;
		self.signature(method.sig_id)
	}

	/// Finds the function table index whose `method_id` matches the header's
	/// `entry_method_id`.
	pub fn entry_function_index(&self) -> Option<usize> {
		if !self.header.has_entry() {
			return None;
		}
		self.functions.iter().position(|f| f.method_id == self.header.entry_method_id)
	}

	/// Finds the function table index implementing a given method. Modules
	/// are expected to declare at most one function body per method.
	pub fn function_index_for_method(&self, method_id: u32) -> Option<usize> {
		self.functions.iter().position(|f| f.method_id == method_id)
	}
}

/// An ergonomic, in-memory assembler for [`Module`]s, used by tests and by
/// `simplevm-cli`'s module-authoring demos. Mirrors the teacher's approach of
/// building up a flat table incrementally and handing back stable indices.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
	code: Vec<u8>,
	functions: Vec<FunctionDef>,
	methods: Vec<MethodDef>,
	signatures: Vec<SignatureDef>,
	param_types: Vec<u32>,
	types: Vec<TypeDef>,
	fields: Vec<FieldDef>,
	globals: Vec<GlobalDef>,
	const_pool: Vec<u8>,
	entry_method_id: u32,
}

impl ModuleBuilder {
	pub fn new() -> Self {
		Self { entry_method_id: NONE_ID, ..Default::default() }
	}

	pub fn push_type(&mut self, def: TypeDef) -> u32 {
		self.types.push(def);
		(self.types.len() - 1) as u32
	}

	pub fn push_field(&mut self, type_id: u32) -> u32 {
		self.fields.push(FieldDef { type_id });
		(self.fields.len() - 1) as u32
	}

	pub fn push_global(&mut self, type_id: u32, init_const_id: u32) -> u32 {
		self.globals.push(GlobalDef { type_id, init_const_id });
		(self.globals.len() - 1) as u32
	}

	pub fn push_signature(&mut self, param_type_ids: &[u32], ret_type_id: u32) -> u32 {
		let param_type_start = self.param_types.len() as u32;
		self.param_types.extend_from_slice(param_type_ids);
		self.signatures.push(SignatureDef {
			param_count: param_type_ids.len() as u32,
			param_type_start,
			ret_type_id,
		});
		(self.signatures.len() - 1) as u32
	}

	pub fn push_method(&mut self, name: impl Into<String>, sig_id: u32, local_count: u16) -> u32 {
		self.methods.push(MethodDef { name: name.into(), sig_id, local_count });
		(self.methods.len() - 1) as u32
	}

	pub fn push_function(&mut self, method_id: u32, code: &[u8], stack_max: u32) -> u32 {
		let code_offset = self.code.len() as u32;
		self.code.extend_from_slice(code);
		self.functions.push(FunctionDef {
			method_id,
			code_offset,
			code_size: code.len() as u32,
			stack_max,
		});
		(self.functions.len() - 1) as u32
	}

	pub fn set_entry_method_id(&mut self, method_id: u32) -> &mut Self {
		self.entry_method_id = method_id;
		self
	}

	/// Appends a length-prefixed string constant; returns its byte offset
	/// for use as a `ConstString` operand.
	pub fn intern_string_const(&mut self, s: &str) -> u32 {
		let offset = self.const_pool.len() as u32;
		self.const_pool.extend_from_slice(&(s.len() as u32).to_le_bytes());
		self.const_pool.extend_from_slice(&0u32.to_le_bytes());
		self.const_pool.extend_from_slice(s.as_bytes());
		offset
	}

	/// Appends a jump-table blob; returns its byte offset for use as a
	/// `JmpTable` operand.
	pub fn intern_jump_table(&mut self, case_offsets: &[i32]) -> u32 {
		let offset = self.const_pool.len() as u32;
		self.const_pool.push(JUMP_TABLE_TAG);
		let length = 4 + case_offsets.len() as u32 * 4;
		self.const_pool.extend_from_slice(&length.to_le_bytes());
		self.const_pool.extend_from_slice(&(case_offsets.len() as u32).to_le_bytes());
		for case in case_offsets {
			self.const_pool.extend_from_slice(&case.to_le_bytes());
		}
		offset
	}

	pub fn build(self) -> Module {
		Module {
			code: self.code,
			functions: self.functions,
			methods: self.methods,
			signatures: self.signatures,
			param_types: self.param_types,
			types: self.types,
			fields: self.fields,
			globals: self.globals,
			const_pool: ConstPool::new(self.const_pool),
			header: Header { entry_method_id: self.entry_method_id },
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_const_round_trip() {
		let mut builder = ModuleBuilder::new();
		let offset = builder.intern_string_const("hello");
		let module = builder.build();
		assert_eq!(module.const_pool.string_const(offset), Some("hello"));
	}

	#[test]
	fn jump_table_round_trip() {
		let mut builder = ModuleBuilder::new();
		let offset = builder.intern_jump_table(&[10, 20, -5]);
		let module = builder.build();
		let table = module.const_pool.jump_table(offset).unwrap();
		assert_eq!(table.case_offsets, vec![10, 20, -5]);
	}

	#[test]
	fn unspecified_ref_is_reference() {
		assert!(TypeDef::unspecified_ref().is_reference());
		assert!(!TypeDef::new(TypeKind::I32).is_reference());
		assert!(TypeDef::new(TypeKind::I128).is_reference());
	}
}
