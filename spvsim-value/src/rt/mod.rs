//! Ray-tracing data model: ray flags, geometry math, BVH nodes and the
//! acceleration structure with its stepwise trace.
pub mod accel;
pub mod flags;
pub mod geom;
pub mod node;

pub use accel::{AccelStruct, Intersection, IntersectionType, RayQuery, StepResult, Trace};
pub use flags::RayFlags;
pub use node::{Node, NodeRef};
