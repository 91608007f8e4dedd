//! Runtime type and value model for the spvsim shader interpreter.
//!
//! Everything an executing module touches lives here: the interned type
//! graph, the polymorphic value variants with their copy and equality
//! semantics, the id-indexed data views frames read and write through, and
//! the ray-tracing acceleration structure.
pub use spirv;

pub mod data;
pub mod image;
pub mod rt;
pub mod ty;
pub mod util;
pub mod value;

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, Error, Result};
}

pub use data::{Data, DataManager, DataView, EntryPoint, Function, Variable, ViewHandle};
pub use ty::{Type, TypeArena, TypeBase, TypeHandle};
pub use value::{Aggregate, CoopMatrix, Pointer, Primitive, Value, ValueMap};
