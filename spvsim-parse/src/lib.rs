//! SPIR-V binary decoding for the spvsim shader interpreter.
//!
//! The decoder turns a raw byte buffer into a list of [`Instruction`]s whose
//! operands are typed tokens, ready for the static and dynamic passes of the
//! executor. Operand layouts come from per-opcode schemas; anything outside
//! the supported opcode set is rejected up front.
pub use spirv;

pub mod bin;
pub mod decode;
pub mod instr;
pub mod schema;
pub mod token;

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, Error, Result};
}

pub use bin::{SpirvBinary, SpirvHeader};
pub use decode::{decode_module, Instruction};
pub use instr::{Instr, Instrs, InstructionBuilder};
pub use token::{Token, TokenKind};
