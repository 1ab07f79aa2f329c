use std::collections::{HashMap, HashSet};

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};
use crate::scheduling::flow::node::{FlowNode, ResourceStats};

/// Cost per running task already in a subtree; steers new flow towards the
/// least-loaded branch of the topology.
const LOAD_COST_FACTOR: Cost = 100;

/// Load balancing over aggregate running-task counts gathered along the
/// resource tree.
pub struct OctopusCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    tasks: HashSet<TaskId>,
    /// finalized per-resource statistics from the last traversal
    load_by_resource: HashMap<ResourceId, ResourceStats>,
}

impl OctopusCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        OctopusCostModel {
            env,
            binding: GraphBinding::default(),
            tasks: HashSet::new(),
            load_by_resource: HashMap::new(),
        }
    }

    fn load_of(&self, res: ResourceId) -> u64 {
        self.load_by_resource
            .get(&res)
            .map(|s| s.num_running_tasks_below)
            .unwrap_or(0)
    }
}

impl CostModel for OctopusCostModel {
    fn graph_binding(&mut self) -> &mut GraphBinding {
        &mut self.binding
    }

    fn task_to_unscheduled_agg_cost(&self, task: TaskId) -> Cost {
        queue_age_cost(&self.env, task)
    }

    fn unscheduled_agg_to_sink_cost(&self, _job: JobId) -> Cost {
        0
    }

    fn task_to_resource_node_cost(&self, _task: TaskId, res: ResourceId) -> Cost {
        self.load_of(res) as Cost * LOAD_COST_FACTOR
    }

    fn task_to_cluster_agg_cost(&self, _task: TaskId) -> Cost {
        0
    }

    fn resource_node_to_resource_node_cost(&self, _parent: ResourceId, child: ResourceId) -> Cost {
        self.load_of(child) as Cost * LOAD_COST_FACTOR
    }

    fn leaf_to_sink_cost(&self, leaf: ResourceId) -> Cost {
        self.load_of(leaf) as Cost * LOAD_COST_FACTOR
    }

    fn task_continuation_cost(&self, _task: TaskId) -> Cost {
        0
    }

    fn task_preemption_cost(&self, _task: TaskId) -> Cost {
        LOAD_COST_FACTOR
    }

    fn task_to_equiv_class_aggregator(&self, _task: TaskId, _ec: EquivClass) -> Cost {
        0
    }

    fn equiv_class_to_resource_node(&self, _ec: EquivClass, res: ResourceId) -> Cost {
        self.load_of(res) as Cost * LOAD_COST_FACTOR
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

    fn remove_machine(&mut self, res: ResourceId) {
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
        let mut out = String::from("resource_id,slots,running_tasks\n");
        let mut rows: Vec<(ResourceId, ResourceStats)> = self
            .load_by_resource
            .iter()
            .map(|(res, stats)| (*res, *stats))
            .collect();
        rows.sort_by_key(|(res, _stats)| *res);
        for (res, stats) in rows {
            out.push_str(&format!(
                "{},{},{}\n",
                res, stats.num_slots_below, stats.num_running_tasks_below
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::core::descriptor::{JobDescriptor, ResourceTopologyNode, TaskDescriptor};
    use crate::core::runtime::{JobId, ResourceId, TaskId};
    use crate::scheduling::cost_model::octopus::OctopusCostModel;
    use crate::scheduling::cost_model::{CostModel, CostModelEnv};
    use crate::scheduling::flow::FlowGraph;
    use crate::scheduling::knowledge_base::InMemoryKnowledgeBase;
    use crate::utils::clock::SettableClock;

    #[test]
    pub fn stats_follow_bindings_test() {
        let env = CostModelEnv {
            task_map: Arc::new(RwLock::new(HashMap::new())),
            resource_map: Arc::new(RwLock::new(HashMap::new())),
            leaf_res_ids: Arc::new(RwLock::new(HashSet::new())),
            knowledge_base: Arc::new(InMemoryKnowledgeBase::new()),
            clock: SettableClock::new(0),
        };
        let mut graph = FlowGraph::new(
            Box::new(OctopusCostModel::new(env.clone())),
            env.leaf_res_ids.clone(),
        )
        .unwrap();

        let mut cluster = ResourceTopologyNode::empty_cluster("cluster");
        let machine = ResourceTopologyNode::machine("m0", 2);
        let machine_id = machine.descriptor.uid;
        cluster.children.push(machine);
        graph.add_resource_topology(&cluster).unwrap();

        let mut jd = JobDescriptor::new(JobId(1), "job", TaskId(10));
        jd.tasks = vec![TaskId(10)];
        env.task_map.write().unwrap().insert(
            TaskId(10),
            TaskDescriptor::new(TaskId(10), JobId(1), "t", 0),
        );
        graph.add_or_update_job_nodes(&jd, &[TaskId(10)]);

        let pu_res = {
            let leaves = env.leaf_res_ids.read().unwrap();
            let mut ids: Vec<ResourceId> = leaves.iter().copied().collect();
            ids.sort();
            ids[0]
        };
        graph.task_scheduled(TaskId(10), pu_res).unwrap();
        graph.compute_topology_statistics();

        let machine_node = graph.resource_node_id(machine_id).unwrap();
        let stats = graph.node(machine_node).unwrap().stats;
        assert_eq!(stats.num_slots_below, 2);
        assert_eq!(stats.num_running_tasks_below, 1);

        // the gathered load now prices the busy branch
        assert!(graph
            .cost_model()
            .resource_node_to_resource_node_cost(cluster.descriptor.uid, machine_id) > 0);
    }
}
