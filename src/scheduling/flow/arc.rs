use crate::core::runtime::NodeId;
use crate::core::Cost;

/// The role an arc plays in the flow network; determines which cost-model
/// operation produces its cost.
#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd,
)]
pub enum ArcClass {
    TaskToEquiv,
    TaskToResourcePreference,
    TaskToUnscheduled,
    TaskToClusterAgg,
    EquivToResource,
    ResourceInternal,
    ResourceToSink,
    UnscheduledToSink,
}

impl std::fmt::Display for ArcClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArcClass::TaskToEquiv => write!(f, "TaskToEquiv"),
            ArcClass::TaskToResourcePreference => write!(f, "TaskToResourcePreference"),
            ArcClass::TaskToUnscheduled => write!(f, "TaskToUnscheduled"),
            ArcClass::TaskToClusterAgg => write!(f, "TaskToClusterAgg"),
            ArcClass::EquivToResource => write!(f, "EquivToResource"),
            ArcClass::ResourceInternal => write!(f, "ResourceInternal"),
            ArcClass::ResourceToSink => write!(f, "ResourceToSink"),
            ArcClass::UnscheduledToSink => write!(f, "UnscheduledToSink"),
        }
    }
}

/// (src, dst, class); (src, dst) alone is not unique because preference and
/// equivalence-class routes may coexist between the same endpoints.
pub type ArcKey = (NodeId, NodeId, ArcClass);

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct FlowArc {
    pub src: NodeId,
    pub dst: NodeId,
    pub class: ArcClass,
    pub lower_bound: u64,
    pub capacity: u64,
    pub cost: Cost,
}

impl FlowArc {
    pub fn new(src: NodeId, dst: NodeId, class: ArcClass, capacity: u64, cost: Cost) -> Self {
        FlowArc {
            src,
            dst,
            class,
            lower_bound: 0,
            capacity,
            cost,
        }
    }

    pub fn key(&self) -> ArcKey {
        (self.src, self.dst, self.class)
    }
}
