//! A stack-based bytecode verifier and tiered execution engine.
//!
//! [`module`] defines the in-memory program representation, [`opcode`]
//! decodes it, [`verify`] statically checks it, and [`exec`] runs it
//! through an interpreter ([`interp`]) whose hot functions are promoted
//! ([`promote`]) to one of the tiers [`compile`] knows how to produce.
//! [`loader`] reads a module off disk; [`intrinsics`] is the ABI host
//! programs call out through.

pub mod compile;
pub mod error;
pub mod exec;
pub mod interp;
pub mod intrinsics;
pub mod loader;
pub mod module;
pub mod opcode;
pub mod promote;
pub mod value;
pub mod verify;

pub use error::{FailureKind, LoadError, VerifyError};
pub use exec::{execute, Engine, ExecCounters, ExecResult, ExecStatus};
pub use intrinsics::{Host, HostError, ReferenceHost};
pub use module::Module;
pub use opcode::Instr;
pub use promote::Tier;
pub use value::Value;
