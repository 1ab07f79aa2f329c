use std::collections::HashSet;

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};
use crate::utils::hash::hash64;

/// Scale: one cost unit per this many micros of estimated runtime.
const RUNTIME_COST_FACTOR_US: u64 = 100_000;
/// Assumed runtime when the knowledge base has no samples yet.
const DEFAULT_RUNTIME_ESTIMATE_US: u64 = 10_000_000;

/// Shortest-job-first: the cluster-aggregator cost of a task is its
/// estimated runtime, so short tasks out-bid long ones for scarce slots.
pub struct SjfCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    tasks: HashSet<TaskId>,
}

impl SjfCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        SjfCostModel {
            env,
            binding: GraphBinding::default(),
            tasks: HashSet::new(),
        }
    }

    /// Tasks sharing a name form one equivalence class.
    fn task_ec(&self, task: TaskId) -> EquivClass {
        let tasks = self.env.task_map.read().unwrap();
        match tasks.get(&task) {
            Some(td) => EquivClass(hash64(td.name.as_bytes())),
            None => EquivClass(task.0),
        }
    }

    fn runtime_estimate_us(&self, task: TaskId) -> u64 {
        self.env
            .knowledge_base
            .average_runtime_for_ec(self.task_ec(task))
            .unwrap_or(DEFAULT_RUNTIME_ESTIMATE_US)
    }
}

impl CostModel for SjfCostModel {
    fn graph_binding(&mut self) -> &mut GraphBinding {
        &mut self.binding
    }

    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost {
        queue_age_cost(&self.env, task)
    }

    fn unscheduled_agg_to_sink_cost(&self, _job: JobId) -> Cost {
        0
    }

    fn task_to_resource_node_cost(&self, task: TaskId, _res: ResourceId) -> Cost {
        (self.runtime_estimate_us(task) / RUNTIME_COST_FACTOR_US) as Cost
    }

    fn task_to_cluster_agg_cost(&self, task: TaskId) -> Cost {
        (self.runtime_estimate_us(task) / RUNTIME_COST_FACTOR_US) as Cost
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

    fn task_preemption_cost(&self, task: TaskId) -> Cost {
        (self.runtime_estimate_us(task) / RUNTIME_COST_FACTOR_US) as Cost
    }

    fn task_to_equiv_class_aggregator(&self, task: TaskId, _ec: EquivClass) -> Cost {
        (self.runtime_estimate_us(task) / RUNTIME_COST_FACTOR_US) as Cost
    }

    fn equiv_class_to_resource_node(&self, _ec: EquivClass, _res: ResourceId) -> Cost {
        0
    }

    fn equiv_class_to_equiv_class(&self, _ec_src: EquivClass, _ec_dst: EquivClass) -> Cost {
        0
    }

    fn get_task_equiv_classes(&self, task: TaskId) -> Vec<EquivClass> {
        vec![self.task_ec(task)]
    }

    fn get_resource_equiv_classes(&self, _res: ResourceId) -> Vec<EquivClass> {
        Vec::new()
    }

    fn get_task_preference_arcs(&self, _task: TaskId) -> Vec<ResourceId> {
        Vec::new()
    }

    fn add_task(&mut self, task: TaskId) {
        self.tasks.insert(task);
    }

    fn remove_task(&mut self, task: TaskId) {
        if !self.tasks.remove(&task) {
            warn!("remove_task for unknown task {}", task);
        }
    }

    fn add_machine(&mut self, _root: &ResourceTopologyNode) {}

    fn remove_machine(&mut self, _res: ResourceId) {}

    fn debug_info_csv(&self) -> String {
        let mut out = String::from("task_id,runtime_estimate_us\n");
        let mut tasks: Vec<TaskId> = self.tasks.iter().copied().collect();
        tasks.sort();
        for task in tasks {
            out.push_str(&format!("{},{}\n", task, self.runtime_estimate_us(task)));
        }
        out
    }
}
