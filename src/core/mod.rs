pub mod config;
pub mod descriptor;
pub mod runtime;

/// Signed arc cost in the flow graph.
pub type Cost = i64;
