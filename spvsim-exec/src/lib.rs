//! Instruction dispatch and program orchestration for the spvsim shader
//! interpreter.
//!
//! The [`Program`] parses a SPIR-V binary into typed instructions, runs the
//! static pass to materialise types, constants, variables and functions,
//! binds inputs to the interface, then drives one frame stack per
//! invocation through the dynamic dispatcher.
pub use spirv;

pub mod compare;
pub mod deco;
pub mod exec;
pub mod ext;
pub mod frame;
pub mod make;
pub mod math;
pub mod program;
pub mod sbt;
pub mod substage;

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, Error, Result};
}

pub use frame::{Frame, RtTrigger};
pub use program::Program;
