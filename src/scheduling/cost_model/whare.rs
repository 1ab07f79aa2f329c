use std::collections::{HashMap, HashSet};

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};
use crate::scheduling::flow::node::{FlowNode, ResourceStats};
use crate::utils::hash::hash64;

/// Scale: one cost unit per this many micros of interference-adjusted runtime.
const RUNTIME_COST_FACTOR_US: u64 = 100_000;
/// Cost charged for a (task class, machine class) pair with no samples yet.
const UNSAMPLED_PAIR_COST: Cost = 50;
const CONTENTION_COST_FACTOR: Cost = 10;

/// Interference-aware placement: the cost of routing a task class onto a
/// machine class is the mean runtime the knowledge base has observed for
/// that pairing, plus a contention term from the gathered load.
pub struct WhareMapCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    /// task classes currently represented in the graph
    task_ecs: HashSet<EquivClass>,
    machine_ecs: HashMap<ResourceId, EquivClass>,
    load_by_resource: HashMap<ResourceId, ResourceStats>,
}

impl WhareMapCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        WhareMapCostModel {
            env,
            binding: GraphBinding::default(),
            task_ecs: HashSet::new(),
            machine_ecs: HashMap::new(),
            load_by_resource: HashMap::new(),
        }
    }

    fn task_ec(&self, task: TaskId) -> EquivClass {
        let tasks = self.env.task_map.read().unwrap();
        match tasks.get(&task) {
            Some(td) => EquivClass(hash64(td.name.as_bytes())),
            None => EquivClass(task.0),
        }
    }

    fn pair_cost(&self, task_ec: EquivClass, res: ResourceId) -> Cost {
        let base = match self.machine_ecs.get(&res) {
            Some(machine_ec) => self
                .env
                .knowledge_base
                .runtime_for_ec_pair(task_ec, *machine_ec)
                .map(|runtime_us| (runtime_us / RUNTIME_COST_FACTOR_US) as Cost)
                .unwrap_or(UNSAMPLED_PAIR_COST),
            None => UNSAMPLED_PAIR_COST,
        };
        let contention = self
            .load_by_resource
            .get(&res)
            .map(|s| s.num_running_tasks_below as Cost)
            .unwrap_or(0);
        base + contention * CONTENTION_COST_FACTOR
    }
}

impl CostModel for WhareMapCostModel {
    fn graph_binding(&mut self) -> &mut GraphBinding {
        &mut self.binding
    }

    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost {
        queue_age_cost(&self.env, task)
    }

    fn unscheduled_agg_to_sink_cost(&self, _job: JobId) -> Cost {
        0
    }

    fn task_to_resource_node_cost(&self, task: TaskId, res: ResourceId) -> Cost {
        self.pair_cost(self.task_ec(task), res)
    }

    /// Run-anywhere must not undercut the sampled routes.
    fn task_to_cluster_agg_cost(&self, _task: TaskId) -> Cost {
        UNSAMPLED_PAIR_COST * 2
    }

    fn resource_node_to_resource_node_cost(&self, _parent: ResourceId, _child: ResourceId) -> Cost {
        0
    }

    fn leaf_to_sink_cost(&self, _leaf: ResourceId) -> Cost {
        0
    }

    fn task_continuation_cost(&self, _task: TaskId) -> Cost {
        0
    }

    fn task_preemption_cost(&self, _task: TaskId) -> Cost {
        UNSAMPLED_PAIR_COST
    }

    fn task_to_equiv_class_aggregator(&self, _task: TaskId, _ec: EquivClass) -> Cost {
        0
    }

    fn equiv_class_to_resource_node(&self, ec: EquivClass, res: ResourceId) -> Cost {
        self.pair_cost(ec, res)
    }

    fn equiv_class_to_equiv_class(&self, _ec_src: EquivClass, _ec_dst: EquivClass) -> Cost {
        0
    }

    fn get_task_equiv_classes(&self, task: TaskId) -> Vec<EquivClass> {
        vec![self.task_ec(task)]
    }

    /// Every machine accepts every known task class; the pair cost does the
    /// differentiation.
    fn get_resource_equiv_classes(&self, res: ResourceId) -> Vec<EquivClass> {
        if !self.machine_ecs.contains_key(&res) {
            return Vec::new();
        }
        let mut ecs: Vec<EquivClass> = self.task_ecs.iter().copied().collect();
        ecs.sort();
        ecs
    }

    fn get_task_preference_arcs(&self, _task: TaskId) -> Vec<ResourceId> {
        Vec::new()
    }

    fn add_task(&mut self, task: TaskId) {
        let ec = self.task_ec(task);
        self.task_ecs.insert(ec);
    }

    fn remove_task(&mut self, _task: TaskId) {
        // task classes survive their members; the aggregator refcounting in
        // the graph retires unused class nodes
    }

    fn add_machine(&mut self, root: &ResourceTopologyNode) {
        let ec = EquivClass(hash64(root.descriptor.friendly_name.as_bytes()));
        self.machine_ecs.insert(root.descriptor.uid, ec);
    }

    fn remove_machine(&mut self, res: ResourceId) {
        self.machine_ecs.remove(&res);
        self.load_by_resource.remove(&res);
    }

    fn prepare_stats(&mut self, node: &mut FlowNode) {
        node.stats = ResourceStats::default();
        if node.is_leaf() {
            node.stats.num_slots_below = 1;
            node.stats.num_running_tasks_below = node.bound_task.is_some() as u64;
        }
    }

    fn gather_stats(&mut self, parent: &mut FlowNode, child: &FlowNode) {
        parent.stats.num_slots_below += child.stats.num_slots_below;
        parent.stats.num_running_tasks_below += child.stats.num_running_tasks_below;
    }

    fn update_stats(&mut self, _parent: &FlowNode, child: &mut FlowNode) {
        if let Some(res) = child.resource_id {
            self.load_by_resource.insert(res, child.stats);
        }
    }

    fn uses_topology_stats(&self) -> bool {
        true
    }

    fn debug_info_csv(&self) -> String {
        let mut out = String::from("machine,machine_ec,running_tasks\n");
        let mut rows: Vec<(ResourceId, EquivClass)> = self
            .machine_ecs
            .iter()
            .map(|(res, ec)| (*res, *ec))
            .collect();
        rows.sort();
        for (res, ec) in rows {
            let running = self
                .load_by_resource
                .get(&res)
                .map(|s| s.num_running_tasks_below)
                .unwrap_or(0);
            out.push_str(&format!("{},{},{}\n", res, ec, running));
        }
        out
    }
}
