// modelc — Model Compiler Collection
//
// Library root. Node-graph IR, model transformer, coordinate-level affine
// fusion and the emitter backends it drives.

pub mod affine;
pub mod codegen;
pub mod coords;
pub mod diag;
pub mod emit;
pub mod graph;
pub mod id;
pub mod lir;
pub mod node;
pub mod pass;
pub mod passes;
pub mod pipeline;
pub mod port;
pub mod transform;
