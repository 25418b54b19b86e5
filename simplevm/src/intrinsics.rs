//! C3 — the intrinsic registry: fixed-signature host calls reachable via
//! `INTRINSIC`, as distinct from `SYS_CALL` which the verifier always
//! rejects (spec §9, Non-goals).

use crate::value::{Value, VmType};

/// A fixed intrinsic signature: parameter types in call order and an
/// optional return type (`None` for a void intrinsic).
#[derive(Debug, Clone)]
pub struct IntrinsicSignature {
	pub name: &'static str,
	pub params: &'static [VmType],
	pub ret: Option<VmType>,
}

/// The well-known intrinsics a conforming host must provide. IDs are stable
/// indices into this table; a module's `INTRINSIC` operand is looked up
/// here at verify time.
pub const INTRINSICS: &[IntrinsicSignature] = &[
	IntrinsicSignature { name: "abs_i32", params: &[VmType::I32], ret: Some(VmType::I32) },
	IntrinsicSignature { name: "min_i32", params: &[VmType::I32, VmType::I32], ret: Some(VmType::I32) },
	IntrinsicSignature { name: "max_i32", params: &[VmType::I32, VmType::I32], ret: Some(VmType::I32) },
	IntrinsicSignature { name: "sqrt_f64", params: &[VmType::F64], ret: Some(VmType::F64) },
	IntrinsicSignature { name: "min_f64", params: &[VmType::F64, VmType::F64], ret: Some(VmType::F64) },
	IntrinsicSignature { name: "max_f64", params: &[VmType::F64, VmType::F64], ret: Some(VmType::F64) },
	IntrinsicSignature { name: "log_i32", params: &[VmType::I32], ret: None },
	IntrinsicSignature { name: "write_stdout", params: &[VmType::Ref], ret: None },
];

pub fn lookup(intrinsic_id: u32) -> Option<&'static IntrinsicSignature> {
	INTRINSICS.get(intrinsic_id as usize)
}

/// Invocation failures a [`Host`] can report back to the interpreter; these
/// surface as runtime traps (spec §5, "Runtime traps").
#[derive(Debug, Clone)]
pub struct HostError(pub String);

impl std::fmt::Display for HostError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "host error: {}", self.0)
	}
}

impl std::error::Error for HostError {}

/// The host environment an engine is embedded in. `simplevm-cli` and tests
/// use [`ReferenceHost`]; embedders implement their own intrinsics by
/// providing this trait.
pub trait Host {
	fn call(&mut self, intrinsic_id: u32, args: &[Value]) -> Result<Option<Value>, HostError>;
}

/// A minimal [`Host`] implementing every intrinsic in [`INTRINSICS`], used
/// by the CLI and by differential tests comparing interpreted and compiled
/// execution.
#[derive(Debug, Default)]
pub struct ReferenceHost;

impl Host for ReferenceHost {
	fn call(&mut self, intrinsic_id: u32, args: &[Value]) -> Result<Option<Value>, HostError> {
		let sig = lookup(intrinsic_id).ok_or_else(|| HostError(format!("no such intrinsic {intrinsic_id}")))?;
		match sig.name {
			"abs_i32" => {
				let v = args[0].as_i32().ok_or_else(|| HostError("abs_i32: bad operand".into()))?;
				Ok(Some(Value::I32(v.wrapping_abs())))
			}
			"min_i32" => {
				let (a, b) = (args[0].as_i32().unwrap(), args[1].as_i32().unwrap());
				Ok(Some(Value::I32(a.min(b))))
			}
			"max_i32" => {
				let (a, b) = (args[0].as_i32().unwrap(), args[1].as_i32().unwrap());
				Ok(Some(Value::I32(a.max(b))))
			}
			"sqrt_f64" => {
				let v = args[0].as_f64().ok_or_else(|| HostError("sqrt_f64: bad operand".into()))?;
				Ok(Some(Value::F64(v.sqrt())))
			}
			"min_f64" => {
				let (a, b) = (args[0].as_f64().unwrap(), args[1].as_f64().unwrap());
				Ok(Some(Value::F64(a.min(b))))
			}
			"max_f64" => {
				let (a, b) = (args[0].as_f64().unwrap(), args[1].as_f64().unwrap());
				Ok(Some(Value::F64(a.max(b))))
			}
			"log_i32" => {
				let v = args[0].as_i32().ok_or_else(|| HostError("log_i32: bad operand".into()))?;
				tracing::info!(value = v, "log_i32 intrinsic");
				Ok(None)
			}
			"write_stdout" => {
				if let Value::Ref(cell) = &args[0] {
					if let crate::value::RefValue::String(s) = &*cell.borrow() {
						print!("{s}");
						return Ok(None);
					}
				}
				Err(HostError("write_stdout: expected a string".into()))
			}
			other => Err(HostError(format!("unimplemented intrinsic {other}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_known_intrinsic() {
		let sig = lookup(0).unwrap();
		assert_eq!(sig.name, "abs_i32");
		assert_eq!(sig.params, &[VmType::I32]);
	}

	#[test]
	fn lookup_out_of_range_is_none() {
		assert!(lookup(9999).is_none());
	}

	#[test]
	fn reference_host_abs_i32() {
		let mut host = ReferenceHost;
		let result = host.call(0, &[Value::I32(-7)]).unwrap();
		assert!(matches!(result, Some(Value::I32(7))));
	}
}
