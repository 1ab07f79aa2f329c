use std::error::Error;

use crate::core::runtime::{NodeId, ResourceId, TaskId};

pub mod arc;
pub mod graph;
pub mod node;

pub use arc::{ArcClass, ArcKey, FlowArc};
pub use graph::{FlowGraph, MachineRemoval};
pub use node::{FlowNode, FlowNodeType, ResourceStats};

#[derive(Debug)]
pub enum FlowError {
    UnknownNode(NodeId),
    UnknownTask(TaskId),
    UnknownResource(ResourceId),
    TopologyNotEmpty,
    TopologyMissing,
    CostModelAlreadyBound,
}

impl Error for FlowError {}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::UnknownNode(id) => write!(f, "UnknownNode({})", id),
            FlowError::UnknownTask(id) => write!(f, "UnknownTask({})", id),
            FlowError::UnknownResource(id) => write!(f, "UnknownResource({})", id),
            FlowError::TopologyNotEmpty => write!(f, "TopologyNotEmpty"),
            FlowError::TopologyMissing => write!(f, "TopologyMissing"),
            FlowError::CostModelAlreadyBound => write!(f, "CostModelAlreadyBound"),
        }
    }
}
