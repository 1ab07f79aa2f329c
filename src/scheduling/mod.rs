//! Flow-graph scheduling subsystem
//! events -> flow graph -> solver -> scheduling deltas

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::core::descriptor::{JobDescriptor, ResourceDescriptor, TaskDescriptor};
use crate::core::runtime::{JobId, ResourceId, TaskId};

pub mod cost_model;
pub mod event_driven;
pub mod flow;
pub mod flow_scheduler;
pub mod knowledge_base;
pub mod solver;

/// Shared stores; every access happens under the scheduler lock, the inner
/// locks only guard the cost models' read paths.
pub type TaskMap = Arc<RwLock<HashMap<TaskId, TaskDescriptor>>>;
pub type JobMap = Arc<RwLock<HashMap<JobId, JobDescriptor>>>;
pub type ResourceMap = Arc<RwLock<HashMap<ResourceId, ResourceDescriptor>>>;
/// Ids of the currently registered leaf processing units.
pub type LeafResourceIds = Arc<RwLock<HashSet<ResourceId>>>;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum DeltaKind {
    Noop,
    Place,
    Preempt,
    Migrate,
}

impl std::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaKind::Noop => write!(f, "Noop"),
            DeltaKind::Place => write!(f, "Place"),
            DeltaKind::Preempt => write!(f, "Preempt"),
            DeltaKind::Migrate => write!(f, "Migrate"),
        }
    }
}

/// A decision the executor layer must realize.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SchedulingDelta {
    pub kind: DeltaKind,
    pub task_id: TaskId,
    pub resource_id: ResourceId,
    pub actioned: bool,
}

impl SchedulingDelta {
    pub fn new(kind: DeltaKind, task_id: TaskId, resource_id: ResourceId) -> Self {
        SchedulingDelta {
            kind,
            task_id,
            resource_id,
            actioned: false,
        }
    }
}

impl std::fmt::Display for SchedulingDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(task {} -> resource {})",
            self.kind, self.task_id, self.resource_id
        )
    }
}
