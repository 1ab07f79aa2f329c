//! Pluggable arc-cost policies
//!
//! A cost model computes the cost of every arc class in the flow graph and
//! may maintain per-task preference sets and per-resource aggregated
//! statistics. One model instance binds to exactly one flow graph.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::config::CostModelKind;
use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::flow::{FlowError, FlowNode};
use crate::scheduling::knowledge_base::KnowledgeBase;
use crate::scheduling::{LeafResourceIds, ResourceMap, TaskMap};
use crate::utils::clock::Clock;

pub mod coco;
pub mod octopus;
pub mod quincy;
pub mod random;
pub mod simulated_quincy;
pub mod sjf;
pub mod trivial;
pub mod whare;

/// Baseline penalty for leaving a task pending, before queue-age growth.
pub const UNSCHEDULED_BASE_COST: Cost = 5000;
/// One cost unit of queueing penalty accrues per this many micros of wait.
pub const WAIT_TIME_COST_FACTOR_US: u64 = 500_000;
/// Extra unscheduled-arc cost per failed attempt, doubled each attempt.
pub const TASK_FAILURE_PENALTY_BASE: Cost = 100;

static NEXT_GRAPH_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one `FlowGraph` instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct GraphToken(u64);

impl GraphToken {
    pub(crate) fn next() -> Self {
        GraphToken(NEXT_GRAPH_TOKEN.fetch_add(1, Ordering::SeqCst))
    }
}

/// One-shot graph binding slot every cost model embeds.
#[derive(Debug, Default)]
pub struct GraphBinding {
    token: Option<GraphToken>,
}

impl GraphBinding {
    pub fn bind(&mut self, token: GraphToken) -> Result<(), FlowError> {
        if self.token.is_some() {
            return Err(FlowError::CostModelAlreadyBound);
        }
        self.token = Some(token);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.token.is_some()
    }
}

/// Everything a bundled cost model may need; each implementation keeps only
/// the parts it uses.
#[derive(Clone)]
pub struct CostModelEnv {
    pub task_map: TaskMap,
    pub resource_map: ResourceMap,
    pub leaf_res_ids: LeafResourceIds,
    pub knowledge_base: Arc<dyn KnowledgeBase>,
    pub clock: Arc<dyn Clock>,
}

pub trait CostModel: Send {
    /// The binding slot; backs the provided `set_flow_graph`.
    fn graph_binding(&mut self) -> &mut GraphBinding;

    /// Bind this model to its owning graph. Called exactly once during graph
    /// construction; a second bind is an error.
    fn set_flow_graph(&mut self, token: GraphToken) -> Result<(), FlowError> {
        self.graph_binding().bind(token)
    }

    /// Penalty for leaving a task pending; strictly increasing over the
    /// task's queue time.
    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost;

    /// Per-job fairness term.
    fn unscheduled_agg_to_sink_cost(&self, job: JobId) -> Cost;

    /// Only invoked for resources returned by `get_task_preference_arcs`.
    fn task_to_resource_node_cost(&self, task: TaskId, res: ResourceId) -> Cost;

    /// Baseline cost for running the task on an arbitrary machine.
    fn task_to_cluster_agg_cost(&self, task: TaskId) -> Cost;

    fn resource_node_to_resource_node_cost(&self, parent: ResourceId, child: ResourceId) -> Cost;

    fn leaf_to_sink_cost(&self, leaf: ResourceId) -> Cost;

    /// Cost of keeping a running task where it is.
    fn task_continuation_cost(&self, task: TaskId) -> Cost;

    /// Cost of kicking a running task off its resource.
    fn task_preemption_cost(&self, task: TaskId) -> Cost;

    fn task_to_equiv_class_aggregator(&self, task: TaskId, ec: EquivClass) -> Cost;

    fn equiv_class_to_resource_node(&self, ec: EquivClass, res: ResourceId) -> Cost;

    fn equiv_class_to_equiv_class(&self, ec_src: EquivClass, ec_dst: EquivClass) -> Cost;

    fn get_task_equiv_classes(&self, task: TaskId) -> Vec<EquivClass>;

    fn get_resource_equiv_classes(&self, res: ResourceId) -> Vec<EquivClass>;

    fn get_task_preference_arcs(&self, task: TaskId) -> Vec<ResourceId>;

    fn get_equiv_class_to_equiv_class_arcs(&self, _ec: EquivClass) -> Vec<EquivClass> {
        Vec::new()
    }

    /// Lifecycle hooks; `add_task` tolerates repeat calls (refresh),
    /// `remove_task` is called exactly once per task.
    fn add_task(&mut self, task: TaskId);
    fn remove_task(&mut self, task: TaskId);
    fn add_machine(&mut self, root: &ResourceTopologyNode);
    fn remove_machine(&mut self, res: ResourceId);

    /// Topology statistics callbacks; only meaningful when
    /// `uses_topology_stats` returns true.
    fn prepare_stats(&mut self, _node: &mut FlowNode) {}
    fn gather_stats(&mut self, _parent: &mut FlowNode, _child: &FlowNode) {}
    fn update_stats(&mut self, _parent: &FlowNode, _child: &mut FlowNode) {}

    fn uses_topology_stats(&self) -> bool {
        false
    }

    /// Opaque diagnostic dump.
    fn debug_info_csv(&self) -> String;
}

/// Queue-age dependent pending penalty shared by most bundled models.
pub(crate) fn queue_age_cost(env: &CostModelEnv, task: TaskId) -> Cost {
    let now_us = env.clock.now_us();
    let submitted_at_us = env
        .task_map
        .read()
        .unwrap()
        .get(&task)
        .map(|td| td.submitted_at_us)
        .unwrap_or(now_us);
    let wait_us = now_us.saturating_sub(submitted_at_us);
    UNSCHEDULED_BASE_COST + (wait_us / WAIT_TIME_COST_FACTOR_US) as Cost
}

/// Instantiate the configured cost model; unknown selectors never reach this
/// point (the config layer rejects them).
pub fn create_cost_model(kind: CostModelKind, env: CostModelEnv) -> Box<dyn CostModel> {
    info!("using the {} cost model", kind);
    match kind {
        CostModelKind::Trivial => Box::new(trivial::TrivialCostModel::new(env)),
        CostModelKind::Random => Box::new(random::RandomCostModel::new(env)),
        CostModelKind::Sjf => Box::new(sjf::SjfCostModel::new(env)),
        CostModelKind::Quincy => Box::new(quincy::QuincyCostModel::new(env)),
        CostModelKind::Whare => Box::new(whare::WhareMapCostModel::new(env)),
        CostModelKind::Coco => Box::new(coco::CocoCostModel::new(env)),
        CostModelKind::Octopus => Box::new(octopus::OctopusCostModel::new(env)),
        CostModelKind::SimulatedQuincy => {
            Box::new(simulated_quincy::SimulatedQuincyCostModel::new(env))
        }
    }
}
