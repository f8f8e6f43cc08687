//! ActionScript-style bytecode engine: a stack-machine interpreter with an
//! ECMAScript object model, plus a structural decompiler that turns
//! instruction listings back into pseudo-source.

pub mod base;
pub mod decompile;
pub mod runtime;

pub use base::listing::{parse_listing, serialize_listing, ListingError};
pub use base::{InstructionStream, Opcode, PoolEntry, RawInstruction, RawValue};
pub use decompile::{decompile, Decompiled, Diagnostic};
pub use runtime::vm::{Outcome, StepResult, VirtualMachine, VmError};
pub use runtime::Value;
