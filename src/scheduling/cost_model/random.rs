use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};

const MAX_ARC_COST: Cost = 1000;
const NUM_PREFERENCES: usize = 2;

/// Uniformly random arc costs, stable per (task, resource) so the graph does
/// not churn between refreshes. Costs derive from a per-task seed so runs
/// with the same inputs are reproducible.
pub struct RandomCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    tasks: HashSet<TaskId>,
    seed: u64,
}

impl RandomCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        RandomCostModel {
            env,
            binding: GraphBinding::default(),
            tasks: HashSet::new(),
            seed: 42,
        }
    }

    fn task_rng(&self, task: TaskId, salt: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ task.0.wrapping_mul(0x9e3779b97f4a7c15) ^ salt)
    }
}

impl CostModel for RandomCostModel {
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
        let mut rng = self.task_rng(task, res.handle());
        rng.gen_range(0..MAX_ARC_COST)
    }

    fn task_to_cluster_agg_cost(&self, task: TaskId) -> Cost {
        let mut rng = self.task_rng(task, 0);
        rng.gen_range(0..MAX_ARC_COST)
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
        MAX_ARC_COST
    }

    fn task_to_equiv_class_aggregator(&self, _task: TaskId, _ec: EquivClass) -> Cost {
        0
    }

    fn equiv_class_to_resource_node(&self, _ec: EquivClass, _res: ResourceId) -> Cost {
        0
    }

    fn equiv_class_to_equiv_class(&self, _ec_src: EquivClass, _ec_dst: EquivClass) -> Cost {
        0
    }

    fn get_task_equiv_classes(&self, _task: TaskId) -> Vec<EquivClass> {
        Vec::new()
    }

    fn get_resource_equiv_classes(&self, _res: ResourceId) -> Vec<EquivClass> {
        Vec::new()
    }

    /// A small random sample of the live leaves.
    fn get_task_preference_arcs(&self, task: TaskId) -> Vec<ResourceId> {
        let leaves = self.env.leaf_res_ids.read().unwrap();
        let mut candidates: Vec<ResourceId> = leaves.iter().copied().collect();
        candidates.sort();
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut rng = self.task_rng(task, 1);
        let mut out = Vec::new();
        for _ in 0..NUM_PREFERENCES.min(candidates.len()) {
            let idx = rng.gen_range(0..candidates.len());
            out.push(candidates.swap_remove(idx));
        }
        out
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
        let mut out = String::from("task_id,cluster_agg_cost\n");
        let mut tasks: Vec<TaskId> = self.tasks.iter().copied().collect();
        tasks.sort();
        for task in tasks {
            out.push_str(&format!("{},{}\n", task, self.task_to_cluster_agg_cost(task)));
        }
        out
    }
}
