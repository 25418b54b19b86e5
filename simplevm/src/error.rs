use std::fmt::{Display, Formatter};

/// Where in the verification pipeline a structural or type failure was detected.
///
/// Mirrors the failure taxonomy: structural, index, constant-pool,
/// type, control and stack failures are all fatal to verification, but tests
/// and tooling want to match on the *kind* of failure without parsing the
/// human-readable message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FailureKind {
	Structural,
	Index,
	ConstantPool,
	Type,
	Control,
	Stack,
}

/// A verification failure, with enough context to render the
/// `verify failed: func <n> [name <s>] pc <p> op 0x<HH> [<NAME>]: <reason>`
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyError {
	pub kind: FailureKind,
	pub func_index: u32,
	pub func_name: Option<String>,
	pub pc: Option<usize>,
	pub opcode: Option<u8>,
	pub opcode_name: Option<&'static str>,
	pub reason: String,
}

impl VerifyError {
	pub(crate) fn new(kind: FailureKind, func_index: u32, reason: impl Into<String>) -> Self {
		Self {
			kind,
			func_index,
			func_name: None,
			pc: None,
			opcode: None,
			opcode_name: None,
			reason: reason.into(),
		}
	}

	pub(crate) fn with_name(mut self, name: Option<&str>) -> Self {
		self.func_name = name.map(str::to_owned);
		self
	}

	pub(crate) fn with_pc(mut self, pc: usize, opcode: u8, opcode_name: Option<&'static str>) -> Self {
		self.pc = Some(pc);
		self.opcode = Some(opcode);
		self.opcode_name = opcode_name;
		self
	}
}

impl Display for VerifyError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "verify failed: func {}", self.func_index)?;
		if let Some(name) = &self.func_name {
			write!(f, " [name {name}]")?;
		}
		if let Some(pc) = self.pc {
			write!(f, " pc {pc}")?;
		}
		if let Some(op) = self.opcode {
			write!(f, " op {op:#04X}")?;
			if let Some(name) = self.opcode_name {
				write!(f, " [{name}]")?;
			}
		}
		write!(f, ": {}", self.reason)
	}
}

impl std::error::Error for VerifyError {}

/// Errors surfaced by the binary module loader (`simplevm::loader`).
///
/// Load errors are external to the verifier/interpreter core: the engine
/// simply refuses to run when a module fails to load.
#[derive(Debug)]
pub enum LoadError {
	IoError(std::io::Error),
	UnexpectedEof { what: &'static str },
	BadMagic,
	UnsupportedVersion(u16),
	MalformedRecord { what: &'static str, index: usize },

	#[cfg(feature = "mmap")]
	MemMapError(std::io::Error),
}

impl Display for LoadError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			LoadError::IoError(e) => write!(f, "io error: {e}"),
			LoadError::UnexpectedEof { what } => write!(f, "unexpected end of file while reading {what}"),
			LoadError::BadMagic => write!(f, "bad module magic"),
			LoadError::UnsupportedVersion(v) => write!(f, "unsupported module version {v}"),
			LoadError::MalformedRecord { what, index } => write!(f, "malformed {what} record at index {index}"),
			#[cfg(feature = "mmap")]
			LoadError::MemMapError(e) => write!(f, "mmap error: {e}"),
		}
	}
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
	fn from(value: std::io::Error) -> Self {
		Self::IoError(value)
	}
}
