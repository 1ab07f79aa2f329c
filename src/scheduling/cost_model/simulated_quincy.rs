use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::quincy::QuincyCostModel;
use crate::scheduling::cost_model::{CostModel, CostModelEnv, GraphBinding};
use crate::scheduling::flow::node::FlowNode;
use crate::utils::hash::hash64;

const MB: u64 = 1 << 20;
/// Largest synthetic input a task can be assigned, MB.
const MAX_SYNTHETIC_INPUT_MB: u64 = 2048;

/// Quincy semantics over a synthetic block distribution: tasks that arrive
/// without input metadata get a deterministic input size drawn from their
/// id, which lets trace-driven simulations exercise the locality paths.
pub struct SimulatedQuincyCostModel {
    env: CostModelEnv,
    inner: QuincyCostModel,
}

impl SimulatedQuincyCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        SimulatedQuincyCostModel {
            inner: QuincyCostModel::new(env.clone()),
            env,
        }
    }

    fn synthesize_input(&self, task: TaskId) {
        let mut tasks = self.env.task_map.write().unwrap();
        if let Some(td) = tasks.get_mut(&task) {
            if td.input_size_bytes == 0 {
                let mb = hash64(format!("input_{}", task.0).as_bytes()) % MAX_SYNTHETIC_INPUT_MB + 1;
                td.input_size_bytes = mb * MB;
            }
        }
    }
}

impl CostModel for SimulatedQuincyCostModel {
    fn graph_binding(&mut self) -> &mut GraphBinding {
        self.inner.graph_binding()
    }

    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost {
        self.inner.task_to_unscheduled_agg_cost(task)
    }

    fn unscheduled_agg_to_sink_cost(&self, job: JobId) -> Cost {
        self.inner.unscheduled_agg_to_sink_cost(job)
    }

    fn task_to_resource_node_cost(&self, task: TaskId, res: ResourceId) -> Cost {
        self.inner.task_to_resource_node_cost(task, res)
    }

    fn task_to_cluster_agg_cost(&self, task: TaskId) -> Cost {
        self.inner.task_to_cluster_agg_cost(task)
    }

    fn resource_node_to_resource_node_cost(&self, parent: ResourceId, child: ResourceId) -> Cost {
        self.inner.resource_node_to_resource_node_cost(parent, child)
    }

    fn leaf_to_sink_cost(&self, leaf: ResourceId) -> Cost {
        self.inner.leaf_to_sink_cost(leaf)
    }

    fn task_continuation_cost(&self, task: TaskId) -> Cost {
        self.inner.task_continuation_cost(task)
    }

    fn task_preemption_cost(&self, task: TaskId) -> Cost {
        self.inner.task_preemption_cost(task)
    }

    fn task_to_equiv_class_aggregator(&self, task: TaskId, ec: EquivClass) -> Cost {
        self.inner.task_to_equiv_class_aggregator(task, ec)
    }

    fn equiv_class_to_resource_node(&self, ec: EquivClass, res: ResourceId) -> Cost {
        self.inner.equiv_class_to_resource_node(ec, res)
    }

    fn equiv_class_to_equiv_class(&self, ec_src: EquivClass, ec_dst: EquivClass) -> Cost {
        self.inner.equiv_class_to_equiv_class(ec_src, ec_dst)
    }

    fn get_task_equiv_classes(&self, task: TaskId) -> Vec<EquivClass> {
        self.inner.get_task_equiv_classes(task)
    }

    fn get_resource_equiv_classes(&self, res: ResourceId) -> Vec<EquivClass> {
        self.inner.get_resource_equiv_classes(res)
    }

    fn get_task_preference_arcs(&self, task: TaskId) -> Vec<ResourceId> {
        self.inner.get_task_preference_arcs(task)
    }

    fn add_task(&mut self, task: TaskId) {
        self.synthesize_input(task);
        self.inner.add_task(task);
    }

    fn remove_task(&mut self, task: TaskId) {
        self.inner.remove_task(task);
    }

    fn add_machine(&mut self, root: &ResourceTopologyNode) {
        self.inner.add_machine(root);
    }

    fn remove_machine(&mut self, res: ResourceId) {
        self.inner.remove_machine(res);
    }

    fn prepare_stats(&mut self, node: &mut FlowNode) {
        self.inner.prepare_stats(node);
    }

    fn gather_stats(&mut self, parent: &mut FlowNode, child: &FlowNode) {
        self.inner.gather_stats(parent, child);
    }

    fn update_stats(&mut self, parent: &FlowNode, child: &mut FlowNode) {
        self.inner.update_stats(parent, child);
    }

    fn uses_topology_stats(&self) -> bool {
        self.inner.uses_topology_stats()
    }

    fn debug_info_csv(&self) -> String {
        self.inner.debug_info_csv()
    }
}
