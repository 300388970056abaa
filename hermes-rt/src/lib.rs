pub mod accel;
pub mod compiler;
pub mod config;
pub mod intersect;
pub mod ir;
pub mod machine;
pub mod memory;
pub mod node;
pub mod op;
pub mod pipeline;
pub mod policy;
pub mod query;
pub mod sbt;
pub mod stack;
pub mod traversal;

#[cfg(test)]
mod test;

pub use accel::{Accel, BuildNode, InstanceDesc};
pub use compiler::compile;
pub use config::Config;
pub use ir::{Expr, ShaderBuilder, SystemValue, TraceRay, VarType};
pub use machine::{Machine, Report};
pub use memory::GlobalMemory;
pub use pipeline::{Pipeline, PipelineDesc, ShaderGroup, StageKind};
pub use policy::{InstanceFlags, RayFlags};
pub use sbt::{SbtWriter, ShaderBindingTable};
