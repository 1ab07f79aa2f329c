use std::collections::HashSet;

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};

const CLUSTER_AGG_COST: Cost = 200;
const PREFERENCE_COST: Cost = 100;

/// Constant costs apart from the mandatory queue-age growth on the
/// unscheduled arc. Mostly useful as a baseline and in tests.
pub struct TrivialCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    tasks: HashSet<TaskId>,
}

impl TrivialCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        TrivialCostModel {
            env,
            binding: GraphBinding::default(),
            tasks: HashSet::new(),
        }
    }
}

impl CostModel for TrivialCostModel {
    fn graph_binding(&mut self) -> &mut GraphBinding {
        &mut self.binding
    }

    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost {
        queue_age_cost(&self.env, task)
    }

    fn unscheduled_agg_to_sink_cost(&self, _job: JobId) -> Cost {
        0
    }

    fn task_to_resource_node_cost(&self, _task: TaskId, _res: ResourceId) -> Cost {
        PREFERENCE_COST
    }

    fn task_to_cluster_agg_cost(&self, _task: TaskId) -> Cost {
        CLUSTER_AGG_COST
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
        CLUSTER_AGG_COST
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
        let mut out = String::from("task_id,unscheduled_cost\n");
        let mut tasks: Vec<TaskId> = self.tasks.iter().copied().collect();
        tasks.sort();
        for task in tasks {
            out.push_str(&format!(
                "{},{}\n",
                task,
                self.task_to_unscheduled_agg_cost(task)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::core::descriptor::TaskDescriptor;
    use crate::core::runtime::{JobId, TaskId};
    use crate::scheduling::cost_model::trivial::TrivialCostModel;
    use crate::scheduling::cost_model::{CostModel, CostModelEnv};
    use crate::scheduling::knowledge_base::InMemoryKnowledgeBase;
    use crate::utils::clock::SettableClock;

    #[test]
    pub fn unscheduled_cost_monotone_test() {
        let clock = SettableClock::new(0);
        let env = CostModelEnv {
            task_map: Arc::new(RwLock::new(HashMap::new())),
            resource_map: Arc::new(RwLock::new(HashMap::new())),
            leaf_res_ids: Arc::new(RwLock::new(HashSet::new())),
            knowledge_base: Arc::new(InMemoryKnowledgeBase::new()),
            clock: clock.clone(),
        };
        env.task_map.write().unwrap().insert(
            TaskId(1),
            TaskDescriptor::new(TaskId(1), JobId(1), "t", 0),
        );
        let mut model = TrivialCostModel::new(env);
        model.add_task(TaskId(1));

        let c0 = model.task_to_unscheduled_agg_cost(TaskId(1));
        clock.advance(10_000_000);
        let c1 = model.task_to_unscheduled_agg_cost(TaskId(1));
        clock.advance(10_000_000);
        let c2 = model.task_to_unscheduled_agg_cost(TaskId(1));
        assert!(c0 < c1 && c1 < c2);
    }
}
