use std::collections::{BTreeMap, HashMap};

use crate::core::descriptor::ResourceTopologyNode;
use crate::core::runtime::{EquivClass, JobId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{
    queue_age_cost, CostModel, CostModelEnv, GraphBinding,
};
use crate::utils::hash::hash64;

const MB: u64 = 1 << 20;
/// Per-MB transfer cost when most input blocks are machine-local.
const LOCAL_TRANSFER_COST_PER_MB: Cost = 1;
/// Per-MB transfer cost across the rack's top-of-rack switch.
const RACK_TRANSFER_COST_PER_MB: Cost = 2;
/// Per-MB transfer cost across the core switch.
const CLUSTER_TRANSFER_COST_PER_MB: Cost = 4;
const MAX_PREFERRED_MACHINES: usize = 3;
const MACHINES_PER_RACK: usize = 4;

/// Data-locality cost model from the Quincy paper: tasks prefer machines
/// (and racks) holding their input blocks; arc costs approximate the bytes
/// that would cross each switch tier.
pub struct QuincyCostModel {
    env: CostModelEnv,
    binding: GraphBinding,
    racks: Vec<Vec<ResourceId>>,
    machine_to_rack: HashMap<ResourceId, usize>,
    preferred_machines: HashMap<TaskId, BTreeMap<ResourceId, Cost>>,
    preferred_racks: HashMap<TaskId, BTreeMap<EquivClass, Cost>>,
}

impl QuincyCostModel {
    pub fn new(env: CostModelEnv) -> Self {
        QuincyCostModel {
            env,
            binding: GraphBinding::default(),
            racks: Vec::new(),
            machine_to_rack: HashMap::new(),
            preferred_machines: HashMap::new(),
            preferred_racks: HashMap::new(),
        }
    }

    fn rack_ec(rack_idx: usize) -> EquivClass {
        EquivClass(hash64(format!("rack_{}", rack_idx).as_bytes()))
    }

    fn task_input_mb(&self, task: TaskId) -> u64 {
        let tasks = self.env.task_map.read().unwrap();
        tasks
            .get(&task)
            .map(|td| td.input_size_bytes / MB)
            .unwrap_or(0)
    }

    /// Deterministic stand-in for the block-location lookup: the machines
    /// "holding" a task's input derive from a stable digest of the task id.
    fn machines_with_input(&self, task: TaskId) -> Vec<ResourceId> {
        let mut machines: Vec<ResourceId> = self.machine_to_rack.keys().copied().collect();
        machines.sort();
        if machines.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for i in 0..MAX_PREFERRED_MACHINES.min(machines.len()) {
            let idx = hash64(format!("{}_{}", task.0, i).as_bytes()) as usize % machines.len();
            let machine = machines[idx];
            if !out.contains(&machine) {
                out.push(machine);
            }
        }
        out
    }

    fn compute_preferences(&mut self, task: TaskId) {
        let input_mb = self.task_input_mb(task);
        let mut machine_costs = BTreeMap::new();
        let mut rack_costs = BTreeMap::new();
        if input_mb > 0 {
            for machine in self.machines_with_input(task) {
                machine_costs.insert(machine, input_mb as Cost * LOCAL_TRANSFER_COST_PER_MB);
                if let Some(rack_idx) = self.machine_to_rack.get(&machine) {
                    rack_costs.insert(
                        Self::rack_ec(*rack_idx),
                        input_mb as Cost * RACK_TRANSFER_COST_PER_MB,
                    );
                }
            }
        }
        self.preferred_machines.insert(task, machine_costs);
        self.preferred_racks.insert(task, rack_costs);
    }
}

impl CostModel for QuincyCostModel {
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
        self.preferred_machines
            .get(&task)
            .and_then(|costs| costs.get(&res).copied())
            .unwrap_or(0)
    }

    /// Worst case: every input byte crosses the core switch.
    fn task_to_cluster_agg_cost(&self, task: TaskId) -> Cost {
        self.task_input_mb(task) as Cost * CLUSTER_TRANSFER_COST_PER_MB
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
        self.task_to_cluster_agg_cost(task)
    }

    fn task_to_equiv_class_aggregator(&self, task: TaskId, ec: EquivClass) -> Cost {
        self.preferred_racks
            .get(&task)
            .and_then(|costs| costs.get(&ec).copied())
            .unwrap_or(0)
    }

    fn equiv_class_to_resource_node(&self, _ec: EquivClass, _res: ResourceId) -> Cost {
        0
    }

    fn equiv_class_to_equiv_class(&self, _ec_src: EquivClass, _ec_dst: EquivClass) -> Cost {
        0
    }

    /// The classes of a task are its preferred racks.
    fn get_task_equiv_classes(&self, task: TaskId) -> Vec<EquivClass> {
        self.preferred_racks
            .get(&task)
            .map(|costs| costs.keys().copied().collect())
            .unwrap_or_default()
    }

    fn get_resource_equiv_classes(&self, res: ResourceId) -> Vec<EquivClass> {
        self.machine_to_rack
            .get(&res)
            .map(|rack_idx| vec![Self::rack_ec(*rack_idx)])
            .unwrap_or_default()
    }

    fn get_task_preference_arcs(&self, task: TaskId) -> Vec<ResourceId> {
        self.preferred_machines
            .get(&task)
            .map(|costs| costs.keys().copied().collect())
            .unwrap_or_default()
    }

    fn add_task(&mut self, task: TaskId) {
        self.compute_preferences(task);
    }

    fn remove_task(&mut self, task: TaskId) {
        if self.preferred_machines.remove(&task).is_none() {
            warn!("remove_task for unknown task {}", task);
        }
        self.preferred_racks.remove(&task);
    }

    fn add_machine(&mut self, root: &ResourceTopologyNode) {
        let machine = root.descriptor.uid;
        let rack_idx = match self
            .racks
            .iter()
            .position(|rack| rack.len() < MACHINES_PER_RACK)
        {
            Some(idx) => idx,
            None => {
                self.racks.push(Vec::new());
                self.racks.len() - 1
            }
        };
        self.racks[rack_idx].push(machine);
        self.machine_to_rack.insert(machine, rack_idx);
    }

    fn remove_machine(&mut self, res: ResourceId) {
        if let Some(rack_idx) = self.machine_to_rack.remove(&res) {
            self.racks[rack_idx].retain(|m| *m != res);
        }
        // drop preference arcs to the departed machine
        for costs in self.preferred_machines.values_mut() {
            costs.remove(&res);
        }
    }

    fn debug_info_csv(&self) -> String {
        let mut out = String::from("task_id,preferred_machine,cost\n");
        let mut tasks: Vec<TaskId> = self.preferred_machines.keys().copied().collect();
        tasks.sort();
        for task in tasks {
            for (machine, cost) in &self.preferred_machines[&task] {
                out.push_str(&format!("{},{},{}\n", task, machine, cost));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::core::descriptor::{ResourceTopologyNode, TaskDescriptor};
    use crate::core::runtime::{JobId, TaskId};
    use crate::scheduling::cost_model::quincy::QuincyCostModel;
    use crate::scheduling::cost_model::{CostModel, CostModelEnv};
    use crate::scheduling::knowledge_base::InMemoryKnowledgeBase;
    use crate::utils::clock::SettableClock;

    fn test_env() -> CostModelEnv {
        CostModelEnv {
            task_map: Arc::new(RwLock::new(HashMap::new())),
            resource_map: Arc::new(RwLock::new(HashMap::new())),
            leaf_res_ids: Arc::new(RwLock::new(HashSet::new())),
            knowledge_base: Arc::new(InMemoryKnowledgeBase::new()),
            clock: SettableClock::new(0),
        }
    }

    #[test]
    pub fn preferences_follow_machines_test() {
        let env = test_env();
        let mut model = QuincyCostModel::new(env.clone());

        let m0 = ResourceTopologyNode::machine("m0", 2);
        let m1 = ResourceTopologyNode::machine("m1", 2);
        model.add_machine(&m0);
        model.add_machine(&m1);

        let mut td = TaskDescriptor::new(TaskId(1), JobId(1), "t", 0);
        td.input_size_bytes = 512 * (1 << 20);
        env.task_map.write().unwrap().insert(TaskId(1), td);
        model.add_task(TaskId(1));

        let prefs = model.get_task_preference_arcs(TaskId(1));
        assert!(!prefs.is_empty());
        for machine in &prefs {
            assert!(model.task_to_resource_node_cost(TaskId(1), *machine) > 0);
        }
        // preferred routes undercut the run-anywhere fallback
        let cluster_cost = model.task_to_cluster_agg_cost(TaskId(1));
        for machine in &prefs {
            assert!(model.task_to_resource_node_cost(TaskId(1), *machine) < cluster_cost);
        }

        // a removed machine disappears from the preference set
        model.remove_machine(m0.descriptor.uid);
        let prefs = model.get_task_preference_arcs(TaskId(1));
        assert!(!prefs.contains(&m0.descriptor.uid));
    }
}
