use std::collections::BTreeSet;

use crate::core::runtime::{EquivClass, JobId, NodeId, ResourceId, TaskId};
use crate::scheduling::flow::arc::ArcClass;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum FlowNodeType {
    RootTask,
    ScheduledTask,
    UnscheduledTask,
    JobAggregator,
    EquivClassAggregator,
    ResourceInternal,
    /// leaf processing unit
    Pu,
    UnscheduledAggregator,
    Sink,
}

impl FlowNodeType {
    pub fn is_task(&self) -> bool {
        matches!(
            self,
            FlowNodeType::RootTask | FlowNodeType::ScheduledTask | FlowNodeType::UnscheduledTask
        )
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, FlowNodeType::ResourceInternal | FlowNodeType::Pu)
    }
}

impl std::fmt::Display for FlowNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowNodeType::RootTask => write!(f, "RootTask"),
            FlowNodeType::ScheduledTask => write!(f, "ScheduledTask"),
            FlowNodeType::UnscheduledTask => write!(f, "UnscheduledTask"),
            FlowNodeType::JobAggregator => write!(f, "JobAggregator"),
            FlowNodeType::EquivClassAggregator => write!(f, "EquivClassAggregator"),
            FlowNodeType::ResourceInternal => write!(f, "ResourceInternal"),
            FlowNodeType::Pu => write!(f, "Pu"),
            FlowNodeType::UnscheduledAggregator => write!(f, "UnscheduledAggregator"),
            FlowNodeType::Sink => write!(f, "Sink"),
        }
    }
}

/// Aggregate statistics the cost models fold along the resource topology.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ResourceStats {
    pub num_slots_below: u64,
    pub num_running_tasks_below: u64,
    pub reserved_cpu_millicores: u64,
    pub reserved_ram_mb: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct FlowNode {
    pub id: NodeId,
    pub node_type: FlowNodeType,
    /// supply injected at this node; tasks carry +1, the sink the
    /// complementary negative, everything else 0
    pub excess: i64,
    /// set on task nodes only
    pub task_id: Option<TaskId>,
    /// set on resource nodes only
    pub resource_id: Option<ResourceId>,
    /// set on job-scoped aggregators only
    pub job_id: Option<JobId>,
    /// set on equivalence-class aggregators only
    pub equiv_class: Option<EquivClass>,
    /// task currently bound to this processing unit
    pub bound_task: Option<TaskId>,
    /// outgoing arc endpoints, keyed (dst, class); ordered for determinism
    pub outgoing: BTreeSet<(NodeId, ArcClass)>,
    /// incoming arc endpoints, keyed (src, class)
    pub incoming: BTreeSet<(NodeId, ArcClass)>,
    pub stats: ResourceStats,
}

impl FlowNode {
    pub fn new(id: NodeId, node_type: FlowNodeType) -> Self {
        FlowNode {
            id,
            node_type,
            excess: 0,
            task_id: None,
            resource_id: None,
            job_id: None,
            equiv_class: None,
            bound_task: None,
            outgoing: BTreeSet::new(),
            incoming: BTreeSet::new(),
            stats: ResourceStats::default(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type == FlowNodeType::Pu
    }
}
