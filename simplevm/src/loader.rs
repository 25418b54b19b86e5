//! Ambient module loader (spec.md §3's data model, reconstructed per
//! `SPEC_FULL.md` §10.3): reads the flat-table binary layout a [`Module`]
//! describes off disk, grounded in the teacher's `raw::assembly` /
//! `raw::pe` little-endian cursor-reading idiom, without pulling in the
//! teacher's metadata-heap machinery this format has no use for.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic        4 bytes  b"SBC1"
//! version      u16
//! entry_method u32      (0xFFFF_FFFF = no entry point)
//! types[]      u32 count, then {kind: u8, flags: u8} each
//! fields[]     u32 count, then {type_id: u32} each
//! globals[]    u32 count, then {type_id: u32, init_const_id: u32} each
//! param_types[] u32 count, then u32 each
//! signatures[] u32 count, then {param_count: u32, param_type_start: u32, ret_type_id: u32} each
//! methods[]    u32 count, then {name_len: u32, name: [u8; name_len], sig_id: u32, local_count: u16} each
//! functions[]  u32 count, then {method_id: u32, code_offset: u32, code_size: u32, stack_max: u32} each
//! const_pool   u32 length, then that many bytes
//! code         u32 length, then that many bytes
//! ```

use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::LoadError;
use crate::module::{
	ConstPool, FieldDef, FunctionDef, GlobalDef, Header, MethodDef, Module, SignatureDef, TypeDef, TypeFlags,
	TypeKind,
};

const MAGIC: &[u8; 4] = b"SBC1";
const SUPPORTED_VERSION: u16 = 1;

fn read_exact<'a>(cursor: &mut Cursor<&'a [u8]>, len: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
	let start = cursor.position() as usize;
	let total_len = cursor.get_ref().len();
	let end = start.checked_add(len).filter(|&e| e <= total_len).ok_or(LoadError::UnexpectedEof { what })?;
	cursor.set_position(end as u64);
	Ok(&cursor.get_ref()[start..end])
}

fn read_u8(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u8, LoadError> {
	Ok(read_exact(cursor, 1, what)?[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u16, LoadError> {
	Ok(u16::from_le_bytes(read_exact(cursor, 2, what)?.try_into().unwrap()))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u32, LoadError> {
	Ok(u32::from_le_bytes(read_exact(cursor, 4, what)?.try_into().unwrap()))
}

/// Parses a module from an in-memory byte slice. The slice is fully
/// validated for boundary correctness (every table count is checked
/// against the remaining length before any read past it); it is not run
/// through [`crate::verify::verify_module`], which is a separate pass over
/// the resulting [`Module`].
#[tracing::instrument(skip(bytes))]
pub fn load(bytes: &[u8]) -> Result<Module, LoadError> {
	let mut cursor = Cursor::new(bytes);

	let magic = read_exact(&mut cursor, 4, "magic")?;
	if magic != MAGIC {
		return Err(LoadError::BadMagic);
	}
	let version = read_u16(&mut cursor, "version")?;
	if version != SUPPORTED_VERSION {
		return Err(LoadError::UnsupportedVersion(version));
	}
	let entry_method_id = read_u32(&mut cursor, "entry method id")?;

	let type_count = read_u32(&mut cursor, "type count")? as usize;
	let mut types = Vec::with_capacity(type_count);
	for index in 0..type_count {
		let raw_kind = read_u8(&mut cursor, "type kind")?;
		let kind = TypeKind::from_repr(raw_kind)
			.ok_or(LoadError::MalformedRecord { what: "unknown type kind", index })?;
		let flags = TypeFlags::from_bits_truncate(read_u8(&mut cursor, "type flags")?);
		types.push(TypeDef { kind, flags });
	}

	let field_count = read_u32(&mut cursor, "field count")? as usize;
	let mut fields = Vec::with_capacity(field_count);
	for _ in 0..field_count {
		fields.push(FieldDef { type_id: read_u32(&mut cursor, "field type id")? });
	}

	let global_count = read_u32(&mut cursor, "global count")? as usize;
	let mut globals = Vec::with_capacity(global_count);
	for _ in 0..global_count {
		let type_id = read_u32(&mut cursor, "global type id")?;
		let init_const_id = read_u32(&mut cursor, "global init const id")?;
		globals.push(GlobalDef { type_id, init_const_id });
	}

	let param_type_count = read_u32(&mut cursor, "param type count")? as usize;
	let mut param_types = Vec::with_capacity(param_type_count);
	for _ in 0..param_type_count {
		param_types.push(read_u32(&mut cursor, "param type")?);
	}

	let signature_count = read_u32(&mut cursor, "signature count")? as usize;
	let mut signatures = Vec::with_capacity(signature_count);
	for index in 0..signature_count {
		let param_count = read_u32(&mut cursor, "signature param count")?;
		let param_type_start = read_u32(&mut cursor, "signature param type start")?;
		let ret_type_id = read_u32(&mut cursor, "signature ret type id")?;
		let end = param_type_start.checked_add(param_count).ok_or(LoadError::MalformedRecord {
			what: "signature param range overflow",
			index,
		})?;
		if end as usize > param_types.len() {
			return Err(LoadError::MalformedRecord { what: "signature param range out of bounds", index });
		}
		signatures.push(SignatureDef { param_count, param_type_start, ret_type_id });
	}

	let method_count = read_u32(&mut cursor, "method count")? as usize;
	let mut methods = Vec::with_capacity(method_count);
	for _ in 0..method_count {
		let name_len = read_u32(&mut cursor, "method name length")? as usize;
		let name_bytes = read_exact(&mut cursor, name_len, "method name")?;
		let name = std::str::from_utf8(name_bytes)
			.map_err(|_| LoadError::MalformedRecord { what: "method name is not valid utf-8", index: methods.len() })?
			.to_owned();
		let sig_id = read_u32(&mut cursor, "method sig id")?;
		let local_count = read_u16(&mut cursor, "method local count")?;
		methods.push(MethodDef { name, sig_id, local_count });
	}

	let function_count = read_u32(&mut cursor, "function count")? as usize;
	let mut functions = Vec::with_capacity(function_count);
	for _ in 0..function_count {
		let method_id = read_u32(&mut cursor, "function method id")?;
		let code_offset = read_u32(&mut cursor, "function code offset")?;
		let code_size = read_u32(&mut cursor, "function code size")?;
		let stack_max = read_u32(&mut cursor, "function stack max")?;
		functions.push(FunctionDef { method_id, code_offset, code_size, stack_max });
	}

	let const_pool_len = read_u32(&mut cursor, "const pool length")? as usize;
	let const_pool = read_exact(&mut cursor, const_pool_len, "const pool")?.to_vec();

	let code_len = read_u32(&mut cursor, "code length")? as usize;
	let code = read_exact(&mut cursor, code_len, "code")?.to_vec();

	for (index, function) in functions.iter().enumerate() {
		let range = function.code_range();
		if range.end > code.len() {
			return Err(LoadError::MalformedRecord { what: "function code range out of bounds", index });
		}
	}

	Ok(Module {
		code,
		functions,
		methods,
		signatures,
		param_types,
		types,
		fields,
		globals,
		const_pool: ConstPool::new(const_pool),
		header: Header { entry_method_id },
	})
}

/// Reads and parses a module file from disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<Module, LoadError> {
	let mut file = std::fs::File::open(path)?;
	let mut bytes = Vec::new();
	file.read_to_end(&mut bytes)?;
	load(&bytes)
}

/// Memory-maps a module file and parses it, avoiding a full read into an
/// owned buffer for large modules. Requires the `mmap` feature.
#[cfg(feature = "mmap")]
pub fn load_mmap(path: impl AsRef<Path>) -> Result<Module, LoadError> {
	let file = std::fs::File::open(path)?;
	// SAFETY: the caller is responsible for not mutating the file out from
	// under the mapping for the lifetime of this call; `load` copies
	// everything it needs into owned `Vec`s before returning.
	let map = unsafe { memmap2::Mmap::map(&file) }.map_err(LoadError::MemMapError)?;
	load(&map)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::module::{ModuleBuilder, TypeDef as Ty, TypeKind as Tk};
	use crate::opcode::Instr;

	fn encode_module_bytes(module: &Module) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(MAGIC);
		out.extend_from_slice(&SUPPORTED_VERSION.to_le_bytes());
		out.extend_from_slice(&module.header.entry_method_id.to_le_bytes());

		out.extend_from_slice(&(module.types.len() as u32).to_le_bytes());
		for ty in &module.types {
			out.push(type_kind_to_u8(ty.kind));
			out.push(ty.flags.bits());
		}

		out.extend_from_slice(&(module.fields.len() as u32).to_le_bytes());
		for field in &module.fields {
			out.extend_from_slice(&field.type_id.to_le_bytes());
		}

		out.extend_from_slice(&(module.globals.len() as u32).to_le_bytes());
		for global in &module.globals {
			out.extend_from_slice(&global.type_id.to_le_bytes());
			out.extend_from_slice(&global.init_const_id.to_le_bytes());
		}

		out.extend_from_slice(&(module.param_types.len() as u32).to_le_bytes());
		for param_type in &module.param_types {
			out.extend_from_slice(&param_type.to_le_bytes());
		}

		out.extend_from_slice(&(module.signatures.len() as u32).to_le_bytes());
		for sig in &module.signatures {
			out.extend_from_slice(&sig.param_count.to_le_bytes());
			out.extend_from_slice(&sig.param_type_start.to_le_bytes());
			out.extend_from_slice(&sig.ret_type_id.to_le_bytes());
		}

		out.extend_from_slice(&(module.methods.len() as u32).to_le_bytes());
		for method in &module.methods {
			out.extend_from_slice(&(method.name.len() as u32).to_le_bytes());
			out.extend_from_slice(method.name.as_bytes());
			out.extend_from_slice(&method.sig_id.to_le_bytes());
			out.extend_from_slice(&method.local_count.to_le_bytes());
		}

		out.extend_from_slice(&(module.functions.len() as u32).to_le_bytes());
		for function in &module.functions {
			out.extend_from_slice(&function.method_id.to_le_bytes());
			out.extend_from_slice(&function.code_offset.to_le_bytes());
			out.extend_from_slice(&function.code_size.to_le_bytes());
			out.extend_from_slice(&function.stack_max.to_le_bytes());
		}

		out.extend_from_slice(&(module.const_pool.bytes.len() as u32).to_le_bytes());
		out.extend_from_slice(&module.const_pool.bytes);

		out.extend_from_slice(&(module.code.len() as u32).to_le_bytes());
		out.extend_from_slice(&module.code);
		out
	}

	fn type_kind_to_u8(kind: Tk) -> u8 {
		match kind {
			Tk::I8 => 0,
			Tk::I16 => 1,
			Tk::I32 => 2,
			Tk::I64 => 3,
			Tk::U8 => 4,
			Tk::U16 => 5,
			Tk::U32 => 6,
			Tk::U64 => 7,
			Tk::F32 => 8,
			Tk::F64 => 9,
			Tk::Bool => 10,
			Tk::Char => 11,
			Tk::Ref => 12,
			Tk::String => 13,
			Tk::I128 => 14,
			Tk::U128 => 15,
			Tk::Unspecified => 16,
		}
	}

	#[test]
	fn round_trips_a_builder_module() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(Ty::new(Tk::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		let code = {
			let mut out = Vec::new();
			out.push(Instr::Enter { local_count: 0 }.opcode_byte());
			out.extend_from_slice(&0u16.to_le_bytes());
			out.push(Instr::ConstI32(7).opcode_byte());
			out.extend_from_slice(&7i32.to_le_bytes());
			out.push(Instr::Ret.opcode_byte());
			out
		};
		builder.push_function(method, &code, 1);
		builder.set_entry_method_id(method);
		let original = builder.build();

		let bytes = encode_module_bytes(&original);
		let loaded = load(&bytes).unwrap();
		assert_eq!(loaded.functions.len(), 1);
		assert_eq!(loaded.code, original.code);
		assert_eq!(loaded.header.entry_method_id, method);
	}

	#[test]
	fn rejects_bad_magic() {
		let bytes = vec![0u8; 16];
		assert!(matches!(load(&bytes), Err(LoadError::BadMagic)));
	}

	#[test]
	fn rejects_truncated_header() {
		let bytes = MAGIC.to_vec();
		assert!(matches!(load(&bytes), Err(LoadError::UnexpectedEof { .. })));
	}

	#[test]
	fn rejects_unsupported_version() {
		let mut bytes = MAGIC.to_vec();
		bytes.extend_from_slice(&99u16.to_le_bytes());
		assert!(matches!(load(&bytes), Err(LoadError::UnsupportedVersion(99))));
	}

	#[test]
	fn rejects_function_code_range_out_of_bounds() {
		let mut builder = ModuleBuilder::new();
		let i32_ty = builder.push_type(Ty::new(Tk::I32));
		let sig = builder.push_signature(&[], i32_ty);
		let method = builder.push_method("main", sig, 0);
		builder.push_function(method, &[], 1);
		let module = builder.build();
		let mut bytes = encode_module_bytes(&module);
		// Corrupt the function's code_size (last table field before const
		// pool/code is written after it here it sits right before the two
		// trailing length-prefixed blobs) to point past the empty code blob.
		let code_size_offset = bytes.len() - 8 /* const_pool_len + code_len */ - 4 /* stack_max */ - 4 /* code_size */;
		bytes[code_size_offset..code_size_offset + 4].copy_from_slice(&99u32.to_le_bytes());
		assert!(matches!(load(&bytes), Err(LoadError::MalformedRecord { .. })));
	}
}
