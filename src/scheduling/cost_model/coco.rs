use std::collections::{HashMap, HashSet};

use crate::core::descriptor::{ResourceTopologyNode, ResourceVector};
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};
use crate::scheduling::flow::node::{FlowNode, ResourceStats};

/// Cost assigned to a machine whose free capacity cannot hold the request.
const INFEASIBLE_COST: Cost = 1_000_000;
/// Utilization is mapped onto [0, UTILIZATION_COST_RANGE].
const UTILIZATION_COST_RANGE: Cost = 1000;
const MAX_PREFERRED_MACHINES: usize = 4;

/// Multi-dimensional reservation-aware placement: free capacities are folded
/// up the topology each iteration, and arc costs grow with the utilization a
/// placement would produce. Machines that cannot hold a request are priced
/// out rather than filtered, so the solver still sees a connected graph.
pub struct CocoCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    tasks: HashSet<TaskId>,
    machine_capacity: HashMap<ResourceId, ResourceVector>,
    reserved_by_resource: HashMap<ResourceId, ResourceStats>,
}

impl CocoCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        CocoCostModel {
            env,
            binding: GraphBinding::default(),
            tasks: HashSet::new(),
            machine_capacity: HashMap::new(),
            reserved_by_resource: HashMap::new(),
        }
    }

    fn task_request(&self, task: TaskId) -> ResourceVector {
        let tasks = self.env.task_map.read().unwrap();
        tasks
            .get(&task)
            .map(|td| td.request)
            .unwrap_or_default()
    }

    fn free_capacity(&self, res: ResourceId) -> Option<ResourceVector> {
        let capacity = self.machine_capacity.get(&res)?;
        let reserved = self
            .reserved_by_resource
            .get(&res)
            .copied()
            .unwrap_or_default();
        Some(ResourceVector {
            cpu_millicores: capacity
                .cpu_millicores
                .saturating_sub(reserved.reserved_cpu_millicores),
            ram_mb: capacity.ram_mb.saturating_sub(reserved.reserved_ram_mb),
        })
    }

    fn placement_cost(&self, task: TaskId, res: ResourceId) -> Cost {
        let request = self.task_request(task);
        let capacity = match self.machine_capacity.get(&res) {
            Some(c) => *c,
            None => return INFEASIBLE_COST,
        };
        // an unsized machine accepts everything at a flat cost
        if capacity.cpu_millicores == 0 && capacity.ram_mb == 0 {
            return UTILIZATION_COST_RANGE / 2;
        }
        let free = match self.free_capacity(res) {
            Some(f) => f,
            None => return INFEASIBLE_COST,
        };
        if !request.fits_within(&free) {
            return INFEASIBLE_COST;
        }
        // utilization after placement, over the dominant dimension
        let cpu_util = if capacity.cpu_millicores > 0 {
            ((capacity.cpu_millicores - free.cpu_millicores + request.cpu_millicores)
                * UTILIZATION_COST_RANGE as u64)
                / capacity.cpu_millicores
        } else {
            0
        };
        let ram_util = if capacity.ram_mb > 0 {
            ((capacity.ram_mb - free.ram_mb + request.ram_mb) * UTILIZATION_COST_RANGE as u64)
                / capacity.ram_mb
        } else {
            0
        };
        cpu_util.max(ram_util) as Cost
    }
}

impl CostModel for CocoCostModel {
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
        self.placement_cost(task, res)
    }

    fn task_to_cluster_agg_cost(&self, _task: TaskId) -> Cost {
        UTILIZATION_COST_RANGE
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
        UTILIZATION_COST_RANGE
    }

    fn task_to_equiv_class_aggregator(&self, _task: TaskId, _ec: EquivClass) -> Cost {
        0
    }

    fn equiv_class_to_resource_node(&self, _ec: EquivClass, res: ResourceId) -> Cost {
        self.reserved_by_resource
            .get(&res)
            .map(|s| s.num_running_tasks_below as Cost)
            .unwrap_or(0)
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

    /// Feasible machines, least utilized first.
    fn get_task_preference_arcs(&self, task: TaskId) -> Vec<ResourceId> {
        let mut candidates: Vec<(Cost, ResourceId)> = self
            .machine_capacity
            .keys()
            .map(|res| (self.placement_cost(task, *res), *res))
            .filter(|(cost, _res)| *cost < INFEASIBLE_COST)
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .take(MAX_PREFERRED_MACHINES)
            .map(|(_cost, res)| res)
            .collect()
    }

    fn add_task(&mut self, task: TaskId) {
        self.tasks.insert(task);
    }

    fn remove_task(&mut self, task: TaskId) {
        if !self.tasks.remove(&task) {
            warn!("remove_task for unknown task {}", task);
        }
    }

    fn add_machine(&mut self, root: &ResourceTopologyNode) {
        self.machine_capacity
            .insert(root.descriptor.uid, root.descriptor.capacity);
    }

    fn remove_machine(&mut self, res: ResourceId) {
        self.machine_capacity.remove(&res);
        self.reserved_by_resource.remove(&res);
    }

    fn prepare_stats(&mut self, node: &mut FlowNode) {
        node.stats = ResourceStats::default();
        if node.is_leaf() {
            node.stats.num_slots_below = 1;
            if let Some(task) = node.bound_task {
                node.stats.num_running_tasks_below = 1;
                let request = self.task_request(task);
                node.stats.reserved_cpu_millicores = request.cpu_millicores;
                node.stats.reserved_ram_mb = request.ram_mb;
            }
        }
    }

    fn gather_stats(&mut self, parent: &mut FlowNode, child: &FlowNode) {
        parent.stats.num_slots_below += child.stats.num_slots_below;
        parent.stats.num_running_tasks_below += child.stats.num_running_tasks_below;
        parent.stats.reserved_cpu_millicores += child.stats.reserved_cpu_millicores;
        parent.stats.reserved_ram_mb += child.stats.reserved_ram_mb;
    }

    fn update_stats(&mut self, _parent: &FlowNode, child: &mut FlowNode) {
        if let Some(res) = child.resource_id {
            self.reserved_by_resource.insert(res, child.stats);
        }
    }

    fn uses_topology_stats(&self) -> bool {
        true
    }

    fn debug_info_csv(&self) -> String {
        let mut out = String::from("machine,reserved_cpu_millicores,reserved_ram_mb\n");
        let mut rows: Vec<ResourceId> = self.machine_capacity.keys().copied().collect();
        rows.sort();
        for res in rows {
            let reserved = self
                .reserved_by_resource
                .get(&res)
                .copied()
                .unwrap_or_default();
            out.push_str(&format!(
                "{},{},{}\n",
                res, reserved.reserved_cpu_millicores, reserved.reserved_ram_mb
            ));
        }
        out
    }
}
