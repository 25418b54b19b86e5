//! C2 — the instruction set: decoding, static stack effect and mnemonics.
//!
//! Bytecode is a flat byte stream: a one-byte opcode followed by a
//! fixed-size, opcode-specific operand encoded little-endian. Nothing here
//! knows about *types* beyond the typing class each opcode belongs to
//! (spec §4.2.1) — the verifier (`crate::verify`) is the only place that
//! narrows a typing class down to a concrete [`crate::value::ValType`].

use std::fmt;

/// A decode-time failure: truncated operand or an unrecognized opcode byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
	UnknownOpcode(u8),
	TruncatedOperand,
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DecodeError::UnknownOpcode(b) => write!(f, "unknown opcode {b:#04X}"),
			DecodeError::TruncatedOperand => write!(f, "truncated operand"),
		}
	}
}

impl std::error::Error for DecodeError {}

/// A decoded instruction: the opcode together with its operand, if any.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Instr {
	Nop,
	Halt,
	Trap,
	Pop,
	Dup,
	Dup2,
	Swap,
	Rot,
	Enter { local_count: u16 },
	Line { line: u32 },
	ProfileStart,
	ProfileEnd,
	CallCheck,

	ConstI8(i8),
	ConstI16(i16),
	ConstI32(i32),
	ConstI64(i64),
	ConstU8(u8),
	ConstU16(u16),
	ConstU32(u32),
	ConstU64(u64),
	ConstF32(f32),
	ConstF64(f64),
	ConstBool(bool),
	ConstChar(u32),
	ConstNull,
	ConstString { const_offset: u32 },

	LoadLocal { index: u16 },
	StoreLocal { index: u16 },
	LoadGlobal { index: u32 },
	StoreGlobal { index: u32 },

	AddI32, SubI32, MulI32, DivI32, ModI32, NegI32,
	AndI32, OrI32, XorI32, ShlI32, ShrI32, ShrUI32, NotI32,
	CmpEqI32, CmpNeI32, CmpLtI32, CmpLeI32, CmpGtI32, CmpGeI32,

	AddI64, SubI64, MulI64, DivI64, ModI64, NegI64,
	AndI64, OrI64, XorI64, ShlI64, ShrI64, ShrUI64, NotI64,
	CmpEqI64, CmpNeI64, CmpLtI64, CmpLeI64, CmpGtI64, CmpGeI64,

	AddF32, SubF32, MulF32, DivF32, NegF32,
	CmpEqF32, CmpNeF32, CmpLtF32, CmpLeF32, CmpGtF32, CmpGeF32,

	AddF64, SubF64, MulF64, DivF64, NegF64,
	CmpEqF64, CmpNeF64, CmpLtF64, CmpLeF64, CmpGtF64, CmpGeF64,

	BoolAnd, BoolOr, BoolNot,

	ConvI32ToI64, ConvI64ToI32,
	ConvI32ToF32, ConvI32ToF64,
	ConvI64ToF32, ConvI64ToF64,
	ConvF32ToI32, ConvF64ToI32,
	ConvF32ToF64, ConvF64ToF32,

	IsNull, RefEq, RefNe, TypeOf,

	NewArray { type_id: u32 },
	ArrayGet,
	ArraySet,
	ArrayLen,
	NewList { type_id: u32 },
	ListGet,
	ListSet,
	ListPush,
	ListLen,
	NewObject { type_id: u32 },
	LoadField { field_id: u32 },
	StoreField { field_id: u32 },
	NewClosure { func_id: u32, upvalue_count: u16 },
	LoadUpvalue { index: u16 },
	StoreUpvalue { index: u16 },

	Jmp { rel: i32 },
	JmpTrue { rel: i32 },
	JmpFalse { rel: i32 },
	JmpTable { const_offset: u32, default_rel: i32 },
	Call { method_id: u32 },
	TailCall { method_id: u32 },
	CallIndirect { sig_id: u32 },
	Ret,

	Intrinsic { intrinsic_id: u32 },
	SysCall { id: u32 },
}

macro_rules! opcode_bytes {
	($($variant:ident = $byte:expr),* $(,)?) => {
		/// The raw byte a given instruction decodes from/encodes to.
		pub fn opcode_byte(&self) -> u8 {
			match self {
				$(Instr::$variant { .. } => $byte,)*
			}
		}
	};
}

impl Instr {
	opcode_bytes! {
		Nop = 0x00, Halt = 0x01, Trap = 0x02, Pop = 0x03, Dup = 0x04, Dup2 = 0x05,
		Swap = 0x06, Rot = 0x07, Enter = 0x08, Line = 0x09, CallCheck = 0x0A,
		ProfileStart = 0x0B, ProfileEnd = 0x0C,

		ConstI8 = 0x10, ConstI16 = 0x11, ConstI32 = 0x12, ConstI64 = 0x13,
		ConstU8 = 0x14, ConstU16 = 0x15, ConstU32 = 0x16, ConstU64 = 0x17,
		ConstF32 = 0x18, ConstF64 = 0x19, ConstBool = 0x1A, ConstChar = 0x1B,
		ConstNull = 0x1C, ConstString = 0x1D,

		LoadLocal = 0x20, StoreLocal = 0x21, LoadGlobal = 0x22, StoreGlobal = 0x23,

		AddI32 = 0x30, SubI32 = 0x31, MulI32 = 0x32, DivI32 = 0x33, ModI32 = 0x34, NegI32 = 0x35,
		AndI32 = 0x36, OrI32 = 0x37, XorI32 = 0x38, ShlI32 = 0x39, ShrI32 = 0x3A, ShrUI32 = 0x3B, NotI32 = 0x3C,
		CmpEqI32 = 0x3D, CmpNeI32 = 0x3E, CmpLtI32 = 0x3F, CmpLeI32 = 0x40, CmpGtI32 = 0x41, CmpGeI32 = 0x42,

		AddI64 = 0x50, SubI64 = 0x51, MulI64 = 0x52, DivI64 = 0x53, ModI64 = 0x54, NegI64 = 0x55,
		AndI64 = 0x56, OrI64 = 0x57, XorI64 = 0x58, ShlI64 = 0x59, ShrI64 = 0x5A, ShrUI64 = 0x5B, NotI64 = 0x5C,
		CmpEqI64 = 0x5D, CmpNeI64 = 0x5E, CmpLtI64 = 0x5F, CmpLeI64 = 0x60, CmpGtI64 = 0x61, CmpGeI64 = 0x62,

		AddF32 = 0x70, SubF32 = 0x71, MulF32 = 0x72, DivF32 = 0x73, NegF32 = 0x74,
		CmpEqF32 = 0x75, CmpNeF32 = 0x76, CmpLtF32 = 0x77, CmpLeF32 = 0x78, CmpGtF32 = 0x79, CmpGeF32 = 0x7A,

		AddF64 = 0x80, SubF64 = 0x81, MulF64 = 0x82, DivF64 = 0x83, NegF64 = 0x84,
		CmpEqF64 = 0x85, CmpNeF64 = 0x86, CmpLtF64 = 0x87, CmpLeF64 = 0x88, CmpGtF64 = 0x89, CmpGeF64 = 0x8A,

		BoolAnd = 0x90, BoolOr = 0x91, BoolNot = 0x92,

		ConvI32ToI64 = 0xA0, ConvI64ToI32 = 0xA1,
		ConvI32ToF32 = 0xA2, ConvI32ToF64 = 0xA3,
		ConvI64ToF32 = 0xA4, ConvI64ToF64 = 0xA5,
		ConvF32ToI32 = 0xA6, ConvF64ToI32 = 0xA7,
		ConvF32ToF64 = 0xA8, ConvF64ToF32 = 0xA9,

		IsNull = 0xB0, RefEq = 0xB1, RefNe = 0xB2, TypeOf = 0xB3,

		NewArray = 0xC0, ArrayGet = 0xC1, ArraySet = 0xC2, ArrayLen = 0xC3,
		NewList = 0xC4, ListGet = 0xC5, ListSet = 0xC6, ListPush = 0xC7, ListLen = 0xC8,
		NewObject = 0xC9, LoadField = 0xCA, StoreField = 0xCB,
		NewClosure = 0xCC, LoadUpvalue = 0xCD, StoreUpvalue = 0xCE,

		Jmp = 0xD0, JmpTrue = 0xD1, JmpFalse = 0xD2, JmpTable = 0xD3,
		Call = 0xD4, TailCall = 0xD5, CallIndirect = 0xD6, Ret = 0xD7,

		Intrinsic = 0xE0, SysCall = 0xE1,
	}

	/// Mnemonic used in `verify failed: ... op 0xHH [NAME]` messages.
	pub fn name(&self) -> &'static str {
		match self {
			Instr::Nop => "NOP", Instr::Halt => "HALT", Instr::Trap => "TRAP",
			Instr::Pop => "POP", Instr::Dup => "DUP", Instr::Dup2 => "DUP2",
			Instr::Swap => "SWAP", Instr::Rot => "ROT", Instr::Enter { .. } => "ENTER",
			Instr::Line { .. } => "LINE", Instr::CallCheck => "CALL_CHECK",
			Instr::ProfileStart => "PROFILE_START", Instr::ProfileEnd => "PROFILE_END",

			Instr::ConstI8(_) => "CONST_I8", Instr::ConstI16(_) => "CONST_I16",
			Instr::ConstI32(_) => "CONST_I32", Instr::ConstI64(_) => "CONST_I64",
			Instr::ConstU8(_) => "CONST_U8", Instr::ConstU16(_) => "CONST_U16",
			Instr::ConstU32(_) => "CONST_U32", Instr::ConstU64(_) => "CONST_U64",
			Instr::ConstF32(_) => "CONST_F32", Instr::ConstF64(_) => "CONST_F64",
			Instr::ConstBool(_) => "CONST_BOOL", Instr::ConstChar(_) => "CONST_CHAR",
			Instr::ConstNull => "CONST_NULL", Instr::ConstString { .. } => "CONST_STRING",

			Instr::LoadLocal { .. } => "LOAD_LOCAL", Instr::StoreLocal { .. } => "STORE_LOCAL",
			Instr::LoadGlobal { .. } => "LOAD_GLOBAL", Instr::StoreGlobal { .. } => "STORE_GLOBAL",

			Instr::AddI32 => "ADD_I32", Instr::SubI32 => "SUB_I32", Instr::MulI32 => "MUL_I32",
			Instr::DivI32 => "DIV_I32", Instr::ModI32 => "MOD_I32", Instr::NegI32 => "NEG_I32",
			Instr::AndI32 => "AND_I32", Instr::OrI32 => "OR_I32", Instr::XorI32 => "XOR_I32",
			Instr::ShlI32 => "SHL_I32", Instr::ShrI32 => "SHR_I32", Instr::ShrUI32 => "SHR_U_I32",
			Instr::NotI32 => "NOT_I32",
			Instr::CmpEqI32 => "CMP_EQ_I32", Instr::CmpNeI32 => "CMP_NE_I32",
			Instr::CmpLtI32 => "CMP_LT_I32", Instr::CmpLeI32 => "CMP_LE_I32",
			Instr::CmpGtI32 => "CMP_GT_I32", Instr::CmpGeI32 => "CMP_GE_I32",

			Instr::AddI64 => "ADD_I64", Instr::SubI64 => "SUB_I64", Instr::MulI64 => "MUL_I64",
			Instr::DivI64 => "DIV_I64", Instr::ModI64 => "MOD_I64", Instr::NegI64 => "NEG_I64",
			Instr::AndI64 => "AND_I64", Instr::OrI64 => "OR_I64", Instr::XorI64 => "XOR_I64",
			Instr::ShlI64 => "SHL_I64", Instr::ShrI64 => "SHR_I64", Instr::ShrUI64 => "SHR_U_I64",
			Instr::NotI64 => "NOT_I64",
			Instr::CmpEqI64 => "CMP_EQ_I64", Instr::CmpNeI64 => "CMP_NE_I64",
			Instr::CmpLtI64 => "CMP_LT_I64", Instr::CmpLeI64 => "CMP_LE_I64",
			Instr::CmpGtI64 => "CMP_GT_I64", Instr::CmpGeI64 => "CMP_GE_I64",

			Instr::AddF32 => "ADD_F32", Instr::SubF32 => "SUB_F32", Instr::MulF32 => "MUL_F32",
			Instr::DivF32 => "DIV_F32", Instr::NegF32 => "NEG_F32",
			Instr::CmpEqF32 => "CMP_EQ_F32", Instr::CmpNeF32 => "CMP_NE_F32",
			Instr::CmpLtF32 => "CMP_LT_F32", Instr::CmpLeF32 => "CMP_LE_F32",
			Instr::CmpGtF32 => "CMP_GT_F32", Instr::CmpGeF32 => "CMP_GE_F32",

			Instr::AddF64 => "ADD_F64", Instr::SubF64 => "SUB_F64", Instr::MulF64 => "MUL_F64",
			Instr::DivF64 => "DIV_F64", Instr::NegF64 => "NEG_F64",
			Instr::CmpEqF64 => "CMP_EQ_F64", Instr::CmpNeF64 => "CMP_NE_F64",
			Instr::CmpLtF64 => "CMP_LT_F64", Instr::CmpLeF64 => "CMP_LE_F64",
			Instr::CmpGtF64 => "CMP_GT_F64", Instr::CmpGeF64 => "CMP_GE_F64",

			Instr::BoolAnd => "BOOL_AND", Instr::BoolOr => "BOOL_OR", Instr::BoolNot => "BOOL_NOT",

			Instr::ConvI32ToI64 => "CONV_I32_TO_I64", Instr::ConvI64ToI32 => "CONV_I64_TO_I32",
			Instr::ConvI32ToF32 => "CONV_I32_TO_F32", Instr::ConvI32ToF64 => "CONV_I32_TO_F64",
			Instr::ConvI64ToF32 => "CONV_I64_TO_F32", Instr::ConvI64ToF64 => "CONV_I64_TO_F64",
			Instr::ConvF32ToI32 => "CONV_F32_TO_I32", Instr::ConvF64ToI32 => "CONV_F64_TO_I32",
			Instr::ConvF32ToF64 => "CONV_F32_TO_F64", Instr::ConvF64ToF32 => "CONV_F64_TO_F32",

			Instr::IsNull => "IS_NULL", Instr::RefEq => "REF_EQ", Instr::RefNe => "REF_NE",
			Instr::TypeOf => "TYPE_OF",

			Instr::NewArray { .. } => "NEW_ARRAY", Instr::ArrayGet => "ARRAY_GET",
			Instr::ArraySet => "ARRAY_SET", Instr::ArrayLen => "ARRAY_LEN",
			Instr::NewList { .. } => "NEW_LIST", Instr::ListGet => "LIST_GET",
			Instr::ListSet => "LIST_SET", Instr::ListPush => "LIST_PUSH", Instr::ListLen => "LIST_LEN",
			Instr::NewObject { .. } => "NEW_OBJECT", Instr::LoadField { .. } => "LOAD_FIELD",
			Instr::StoreField { .. } => "STORE_FIELD", Instr::NewClosure { .. } => "NEW_CLOSURE",
			Instr::LoadUpvalue { .. } => "LOAD_UPVALUE", Instr::StoreUpvalue { .. } => "STORE_UPVALUE",

			Instr::Jmp { .. } => "JMP", Instr::JmpTrue { .. } => "JMP_TRUE",
			Instr::JmpFalse { .. } => "JMP_FALSE", Instr::JmpTable { .. } => "JMP_TABLE",
			Instr::Call { .. } => "CALL", Instr::TailCall { .. } => "TAIL_CALL",
			Instr::CallIndirect { .. } => "CALL_INDIRECT", Instr::Ret => "RET",

			Instr::Intrinsic { .. } => "INTRINSIC", Instr::SysCall { .. } => "SYS_CALL",
		}
	}

	/// The static `(pops, pushes)` operand-stack effect. Some opcodes pop or
	/// push a variable operand count in practice (e.g. `CALL` depends on the
	/// target signature); those return `None` and the verifier computes the
	/// effect itself from module metadata.
	pub fn stack_effect(&self) -> Option<(u32, u32)> {
		use Instr::*;
		Some(match self {
			Nop | Halt | Trap | Enter { .. } | Line { .. } | ProfileStart | ProfileEnd | CallCheck => (0, 0),
			Pop => (1, 0),
			Dup => (1, 2),
			Dup2 => (2, 4),
			Swap => (2, 2),
			Rot => (3, 3),

			ConstI8(_) | ConstI16(_) | ConstI32(_) | ConstU8(_) | ConstU16(_) | ConstU32(_)
			| ConstBool(_) | ConstChar(_) | ConstI64(_) | ConstU64(_) | ConstF32(_) | ConstF64(_)
			| ConstNull | ConstString { .. } => (0, 1),

			LoadLocal { .. } | LoadGlobal { .. } => (0, 1),
			StoreLocal { .. } | StoreGlobal { .. } => (1, 0),

			NegI32 | NotI32 | NegI64 | NotI64 | NegF32 | NegF64 | BoolNot | IsNull | TypeOf
			| ConvI32ToI64 | ConvI64ToI32 | ConvI32ToF32 | ConvI32ToF64 | ConvI64ToF32
			| ConvI64ToF64 | ConvF32ToI32 | ConvF64ToI32 | ConvF32ToF64 | ConvF64ToF32 => (1, 1),

			AddI32 | SubI32 | MulI32 | DivI32 | ModI32 | AndI32 | OrI32 | XorI32 | ShlI32
			| ShrI32 | ShrUI32 | CmpEqI32 | CmpNeI32 | CmpLtI32 | CmpLeI32 | CmpGtI32 | CmpGeI32
			| AddI64 | SubI64 | MulI64 | DivI64 | ModI64 | AndI64 | OrI64 | XorI64 | ShlI64
			| ShrI64 | ShrUI64 | CmpEqI64 | CmpNeI64 | CmpLtI64 | CmpLeI64 | CmpGtI64 | CmpGeI64
			| AddF32 | SubF32 | MulF32 | DivF32 | CmpEqF32 | CmpNeF32 | CmpLtF32 | CmpLeF32
			| CmpGtF32 | CmpGeF32 | AddF64 | SubF64 | MulF64 | DivF64 | CmpEqF64 | CmpNeF64
			| CmpLtF64 | CmpLeF64 | CmpGtF64 | CmpGeF64 | BoolAnd | BoolOr | RefEq | RefNe => (2, 1),

			NewArray { .. } | NewList { .. } => (1, 1),
			ArrayGet | ListGet => (2, 1),
			ArraySet | ListSet | ListPush => (3, 0),
			ArrayLen | ListLen => (1, 1),
			NewObject { .. } => (0, 1),
			LoadField { .. } => (1, 1),
			StoreField { .. } => (2, 0),
			LoadUpvalue { .. } => (0, 1),
			StoreUpvalue { .. } => (1, 0),

			Jmp { .. } => (0, 0),
			JmpTrue { .. } | JmpFalse { .. } | JmpTable { .. } => (1, 0),
			Ret => (0, 0),

			NewClosure { .. } | Call { .. } | TailCall { .. } | CallIndirect { .. } | Intrinsic { .. }
			| SysCall { .. } => return None,
		})
	}
}

fn read_u8(code: &[u8], pc: usize) -> Result<u8, DecodeError> {
	code.get(pc).copied().ok_or(DecodeError::TruncatedOperand)
}

fn read_bytes<const N: usize>(code: &[u8], pc: usize) -> Result<[u8; N], DecodeError> {
	code.get(pc..pc + N).ok_or(DecodeError::TruncatedOperand)?.try_into().map_err(|_| DecodeError::TruncatedOperand)
}

/// Decodes one instruction at `pc`. Returns the instruction and the pc of
/// the next instruction.
pub fn decode(code: &[u8], pc: usize) -> Result<(Instr, usize), DecodeError> {
	let opcode = read_u8(code, pc)?;
	let body = pc + 1;
	macro_rules! u16_at { () => { u16::from_le_bytes(read_bytes::<2>(code, body)?) } }
	macro_rules! u32_at { () => { u32::from_le_bytes(read_bytes::<4>(code, body)?) } }
	macro_rules! u64_at { () => { u64::from_le_bytes(read_bytes::<8>(code, body)?) } }
	macro_rules! i32_at { () => { i32::from_le_bytes(read_bytes::<4>(code, body)?) } }

	let (instr, operand_len): (Instr, usize) = match opcode {
		0x00 => (Instr::Nop, 0), 0x01 => (Instr::Halt, 0), 0x02 => (Instr::Trap, 0),
		0x03 => (Instr::Pop, 0), 0x04 => (Instr::Dup, 0), 0x05 => (Instr::Dup2, 0),
		0x06 => (Instr::Swap, 0), 0x07 => (Instr::Rot, 0),
		0x08 => (Instr::Enter { local_count: u16_at!() }, 2),
		0x09 => (Instr::Line { line: u32_at!() }, 4),
		0x0A => (Instr::CallCheck, 0),
		0x0B => (Instr::ProfileStart, 0),
		0x0C => (Instr::ProfileEnd, 0),

		0x10 => (Instr::ConstI8(read_u8(code, body)? as i8), 1),
		0x11 => (Instr::ConstI16(i16::from_le_bytes(read_bytes::<2>(code, body)?)), 2),
		0x12 => (Instr::ConstI32(i32_at!()), 4),
		0x13 => (Instr::ConstI64(i64::from_le_bytes(read_bytes::<8>(code, body)?)), 8),
		0x14 => (Instr::ConstU8(read_u8(code, body)?), 1),
		0x15 => (Instr::ConstU16(u16_at!()), 2),
		0x16 => (Instr::ConstU32(u32_at!()), 4),
		0x17 => (Instr::ConstU64(u64_at!()), 8),
		0x18 => (Instr::ConstF32(f32::from_le_bytes(read_bytes::<4>(code, body)?)), 4),
		0x19 => (Instr::ConstF64(f64::from_le_bytes(read_bytes::<8>(code, body)?)), 8),
		0x1A => (Instr::ConstBool(read_u8(code, body)? != 0), 1),
		0x1B => (Instr::ConstChar(u32_at!()), 4),
		0x1C => (Instr::ConstNull, 0),
		0x1D => (Instr::ConstString { const_offset: u32_at!() }, 4),

		0x20 => (Instr::LoadLocal { index: u16_at!() }, 2),
		0x21 => (Instr::StoreLocal { index: u16_at!() }, 2),
		0x22 => (Instr::LoadGlobal { index: u32_at!() }, 4),
		0x23 => (Instr::StoreGlobal { index: u32_at!() }, 4),

		0x30 => (Instr::AddI32, 0), 0x31 => (Instr::SubI32, 0), 0x32 => (Instr::MulI32, 0),
		0x33 => (Instr::DivI32, 0), 0x34 => (Instr::ModI32, 0), 0x35 => (Instr::NegI32, 0),
		0x36 => (Instr::AndI32, 0), 0x37 => (Instr::OrI32, 0), 0x38 => (Instr::XorI32, 0),
		0x39 => (Instr::ShlI32, 0), 0x3A => (Instr::ShrI32, 0), 0x3B => (Instr::ShrUI32, 0),
		0x3C => (Instr::NotI32, 0),
		0x3D => (Instr::CmpEqI32, 0), 0x3E => (Instr::CmpNeI32, 0), 0x3F => (Instr::CmpLtI32, 0),
		0x40 => (Instr::CmpLeI32, 0), 0x41 => (Instr::CmpGtI32, 0), 0x42 => (Instr::CmpGeI32, 0),

		0x50 => (Instr::AddI64, 0), 0x51 => (Instr::SubI64, 0), 0x52 => (Instr::MulI64, 0),
		0x53 => (Instr::DivI64, 0), 0x54 => (Instr::ModI64, 0), 0x55 => (Instr::NegI64, 0),
		0x56 => (Instr::AndI64, 0), 0x57 => (Instr::OrI64, 0), 0x58 => (Instr::XorI64, 0),
		0x59 => (Instr::ShlI64, 0), 0x5A => (Instr::ShrI64, 0), 0x5B => (Instr::ShrUI64, 0),
		0x5C => (Instr::NotI64, 0),
		0x5D => (Instr::CmpEqI64, 0), 0x5E => (Instr::CmpNeI64, 0), 0x5F => (Instr::CmpLtI64, 0),
		0x60 => (Instr::CmpLeI64, 0), 0x61 => (Instr::CmpGtI64, 0), 0x62 => (Instr::CmpGeI64, 0),

		0x70 => (Instr::AddF32, 0), 0x71 => (Instr::SubF32, 0), 0x72 => (Instr::MulF32, 0),
		0x73 => (Instr::DivF32, 0), 0x74 => (Instr::NegF32, 0),
		0x75 => (Instr::CmpEqF32, 0), 0x76 => (Instr::CmpNeF32, 0), 0x77 => (Instr::CmpLtF32, 0),
		0x78 => (Instr::CmpLeF32, 0), 0x79 => (Instr::CmpGtF32, 0), 0x7A => (Instr::CmpGeF32, 0),

		0x80 => (Instr::AddF64, 0), 0x81 => (Instr::SubF64, 0), 0x82 => (Instr::MulF64, 0),
		0x83 => (Instr::DivF64, 0), 0x84 => (Instr::NegF64, 0),
		0x85 => (Instr::CmpEqF64, 0), 0x86 => (Instr::CmpNeF64, 0), 0x87 => (Instr::CmpLtF64, 0),
		0x88 => (Instr::CmpLeF64, 0), 0x89 => (Instr::CmpGtF64, 0), 0x8A => (Instr::CmpGeF64, 0),

		0x90 => (Instr::BoolAnd, 0), 0x91 => (Instr::BoolOr, 0), 0x92 => (Instr::BoolNot, 0),

		0xA0 => (Instr::ConvI32ToI64, 0), 0xA1 => (Instr::ConvI64ToI32, 0),
		0xA2 => (Instr::ConvI32ToF32, 0), 0xA3 => (Instr::ConvI32ToF64, 0),
		0xA4 => (Instr::ConvI64ToF32, 0), 0xA5 => (Instr::ConvI64ToF64, 0),
		0xA6 => (Instr::ConvF32ToI32, 0), 0xA7 => (Instr::ConvF64ToI32, 0),
		0xA8 => (Instr::ConvF32ToF64, 0), 0xA9 => (Instr::ConvF64ToF32, 0),

		0xB0 => (Instr::IsNull, 0), 0xB1 => (Instr::RefEq, 0), 0xB2 => (Instr::RefNe, 0),
		0xB3 => (Instr::TypeOf, 0),

		0xC0 => (Instr::NewArray { type_id: u32_at!() }, 4),
		0xC1 => (Instr::ArrayGet, 0), 0xC2 => (Instr::ArraySet, 0), 0xC3 => (Instr::ArrayLen, 0),
		0xC4 => (Instr::NewList { type_id: u32_at!() }, 4),
		0xC5 => (Instr::ListGet, 0), 0xC6 => (Instr::ListSet, 0), 0xC7 => (Instr::ListPush, 0),
		0xC8 => (Instr::ListLen, 0),
		0xC9 => (Instr::NewObject { type_id: u32_at!() }, 4),
		0xCA => (Instr::LoadField { field_id: u32_at!() }, 4),
		0xCB => (Instr::StoreField { field_id: u32_at!() }, 4),
		0xCC => {
			let func_id = u32_at!();
			let upvalue_count = u16::from_le_bytes(read_bytes::<2>(code, body + 4)?);
			(Instr::NewClosure { func_id, upvalue_count }, 6)
		}
		0xCD => (Instr::LoadUpvalue { index: u16_at!() }, 2),
		0xCE => (Instr::StoreUpvalue { index: u16_at!() }, 2),

		0xD0 => (Instr::Jmp { rel: i32_at!() }, 4),
		0xD1 => (Instr::JmpTrue { rel: i32_at!() }, 4),
		0xD2 => (Instr::JmpFalse { rel: i32_at!() }, 4),
		0xD3 => {
			let const_offset = u32_at!();
			let default_rel = i32::from_le_bytes(read_bytes::<4>(code, body + 4)?);
			(Instr::JmpTable { const_offset, default_rel }, 8)
		}
		0xD4 => (Instr::Call { method_id: u32_at!() }, 4),
		0xD5 => (Instr::TailCall { method_id: u32_at!() }, 4),
		0xD6 => (Instr::CallIndirect { sig_id: u32_at!() }, 4),
		0xD7 => (Instr::Ret, 0),

		0xE0 => (Instr::Intrinsic { intrinsic_id: u32_at!() }, 4),
		0xE1 => (Instr::SysCall { id: u32_at!() }, 4),

		other => return Err(DecodeError::UnknownOpcode(other)),
	};
	Ok((instr, body + operand_len))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_nop_and_const_i32() {
		let mut code = vec![0x00];
		code.push(0x12);
		code.extend_from_slice(&42i32.to_le_bytes());
		let (nop, next) = decode(&code, 0).unwrap();
		assert_eq!(nop, Instr::Nop);
		assert_eq!(next, 1);
		let (c, next) = decode(&code, 1).unwrap();
		assert_eq!(c, Instr::ConstI32(42));
		assert_eq!(next, code.len());
	}

	#[test]
	fn decode_profile_safepoints() {
		let code = vec![0x0B, 0x0C];
		let (start, next) = decode(&code, 0).unwrap();
		assert_eq!(start, Instr::ProfileStart);
		assert_eq!(start.stack_effect(), Some((0, 0)));
		let (end, next) = decode(&code, next).unwrap();
		assert_eq!(end, Instr::ProfileEnd);
		assert_eq!(next, code.len());
	}

	#[test]
	fn decode_truncated_operand() {
		let code = vec![0x12, 0x01, 0x02];
		assert_eq!(decode(&code, 0), Err(DecodeError::TruncatedOperand));
	}

	#[test]
	fn decode_unknown_opcode() {
		let code = vec![0xFF];
		assert_eq!(decode(&code, 0), Err(DecodeError::UnknownOpcode(0xFF)));
	}

	#[test]
	fn static_stack_effect_matches_arity() {
		assert_eq!(Instr::AddI32.stack_effect(), Some((2, 1)));
		assert_eq!(Instr::Dup.stack_effect(), Some((1, 2)));
		assert_eq!(Instr::Call { method_id: 0 }.stack_effect(), None);
	}

	#[test]
	fn name_round_trips_for_every_family() {
		assert_eq!(Instr::CmpGeF64.name(), "CMP_GE_F64");
		assert_eq!(Instr::JmpTable { const_offset: 0, default_rel: 0 }.name(), "JMP_TABLE");
	}
}
