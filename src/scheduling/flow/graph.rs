use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::descriptor::{JobDescriptor, ResourceTopologyNode};
use crate::core::runtime::{EquivClass, JobId, NodeId, ResourceId, TaskId};
use crate::core::Cost;
use crate::scheduling::cost_model::{CostModel, GraphToken, TASK_FAILURE_PENALTY_BASE};
use crate::scheduling::flow::arc::{ArcClass, ArcKey, FlowArc};
use crate::scheduling::flow::node::{FlowNode, FlowNodeType};
use crate::scheduling::flow::FlowError;
use crate::scheduling::LeafResourceIds;

/// What `remove_machine` displaced.
#[derive(Debug, Default)]
pub struct MachineRemoval {
    pub evicted_tasks: Vec<TaskId>,
    pub removed_resources: Vec<ResourceId>,
}

/// Capacitated directed multigraph for the min-cost-flow formulation.
///
/// Nodes and arcs live in ordered maps so that iteration, and therefore the
/// solver serialization, is deterministic. The graph owns the cost model; the
/// model holds only the graph's opaque instance token.
pub struct FlowGraph {
    token: GraphToken,
    cost_model: Box<dyn CostModel>,

    nodes: BTreeMap<NodeId, FlowNode>,
    arcs: BTreeMap<ArcKey, FlowArc>,

    task_to_node: HashMap<TaskId, NodeId>,
    resource_to_node: HashMap<ResourceId, NodeId>,
    unsched_agg_by_job: HashMap<JobId, NodeId>,
    equiv_class_to_node: HashMap<EquivClass, NodeId>,

    /// job -> number of task nodes currently present
    job_task_count: HashMap<JobId, u64>,
    /// equivalence class -> number of member tasks
    ec_member_count: HashMap<EquivClass, u64>,
    task_ecs: HashMap<TaskId, Vec<EquivClass>>,
    task_job: HashMap<TaskId, JobId>,
    root_task_ids: BTreeSet<TaskId>,
    task_attempts: HashMap<TaskId, u32>,

    leaf_node_ids: BTreeSet<NodeId>,
    leaf_res_ids: LeafResourceIds,

    sink_node_id: NodeId,
    cluster_agg_node_id: Option<NodeId>,
    next_node_id: u64,
}

impl FlowGraph {
    pub fn new(
        mut cost_model: Box<dyn CostModel>,
        leaf_res_ids: LeafResourceIds,
    ) -> Result<Self, FlowError> {
        let token = GraphToken::next();
        cost_model.set_flow_graph(token)?;

        let mut graph = FlowGraph {
            token,
            cost_model,
            nodes: BTreeMap::new(),
            arcs: BTreeMap::new(),
            task_to_node: HashMap::new(),
            resource_to_node: HashMap::new(),
            unsched_agg_by_job: HashMap::new(),
            equiv_class_to_node: HashMap::new(),
            job_task_count: HashMap::new(),
            ec_member_count: HashMap::new(),
            task_ecs: HashMap::new(),
            task_job: HashMap::new(),
            root_task_ids: BTreeSet::new(),
            task_attempts: HashMap::new(),
            leaf_node_ids: BTreeSet::new(),
            leaf_res_ids,
            sink_node_id: NodeId(0),
            cluster_agg_node_id: None,
            next_node_id: 1,
        };
        graph.sink_node_id = graph.add_node(FlowNodeType::Sink);
        Ok(graph)
    }

    pub fn num_nodes(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn num_arcs(&self) -> u64 {
        self.arcs.len() as u64
    }

    pub fn sink_node_id(&self) -> NodeId {
        self.sink_node_id
    }

    pub fn cluster_agg_node_id(&self) -> Option<NodeId> {
        self.cluster_agg_node_id
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(&id)
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// Arcs in ascending (src, dst, class) order.
    pub fn arcs(&self) -> impl Iterator<Item = &FlowArc> {
        self.arcs.values()
    }

    pub fn arc(&self, key: &ArcKey) -> Option<&FlowArc> {
        self.arcs.get(key)
    }

    pub fn task_node_id(&self, task_id: TaskId) -> Option<NodeId> {
        self.task_to_node.get(&task_id).copied()
    }

    pub fn resource_node_id(&self, res_id: ResourceId) -> Option<NodeId> {
        self.resource_to_node.get(&res_id).copied()
    }

    pub fn leaf_node_ids(&self) -> &BTreeSet<NodeId> {
        &self.leaf_node_ids
    }

    pub fn cost_model(&self) -> &dyn CostModel {
        self.cost_model.as_ref()
    }

    pub fn token(&self) -> GraphToken {
        self.token
    }

    // ---- node/arc primitives ----

    fn add_node(&mut self, node_type: FlowNodeType) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.insert(id, FlowNode::new(id, node_type));
        id
    }

    /// Insert or refresh; a second insert with the same key only updates
    /// capacity and cost, which makes the lifecycle edits idempotent.
    fn add_arc(&mut self, arc: FlowArc) {
        let key = arc.key();
        if let Some(existing) = self.arcs.get_mut(&key) {
            existing.capacity = arc.capacity;
            existing.cost = arc.cost;
            return;
        }
        self.nodes
            .get_mut(&arc.src)
            .expect("arc source not in node store")
            .outgoing
            .insert((arc.dst, arc.class));
        self.nodes
            .get_mut(&arc.dst)
            .expect("arc destination not in node store")
            .incoming
            .insert((arc.src, arc.class));
        self.arcs.insert(key, arc);
    }

    fn remove_arc(&mut self, key: &ArcKey) {
        if self.arcs.remove(key).is_none() {
            return;
        }
        let (src, dst, class) = *key;
        if let Some(node) = self.nodes.get_mut(&src) {
            node.outgoing.remove(&(dst, class));
        }
        if let Some(node) = self.nodes.get_mut(&dst) {
            node.incoming.remove(&(src, class));
        }
    }

    /// Removing a node first removes every incident arc.
    fn remove_node(&mut self, id: NodeId) {
        let (outgoing, incoming) = match self.nodes.get(&id) {
            Some(node) => (
                node.outgoing.iter().copied().collect::<Vec<_>>(),
                node.incoming.iter().copied().collect::<Vec<_>>(),
            ),
            None => return,
        };
        for (dst, class) in outgoing {
            self.remove_arc(&(id, dst, class));
        }
        for (src, class) in incoming {
            self.remove_arc(&(src, id, class));
        }
        self.nodes.remove(&id);
        self.leaf_node_ids.remove(&id);
    }

    // ---- resource topology ----

    /// Install the entire machine tree; only legal while the graph holds
    /// nothing but the sink.
    pub fn add_resource_topology(&mut self, root: &ResourceTopologyNode) -> Result<(), FlowError> {
        if self.num_nodes() != 1 {
            return Err(FlowError::TopologyNotEmpty);
        }
        debug!("installing resource topology rooted at {}", root.descriptor.uid);
        let cluster_id = self.add_resource_node(root);
        self.cluster_agg_node_id = Some(cluster_id);
        for child in &root.children {
            self.splice_subtree(cluster_id, child);
            self.cost_model.add_machine(child);
        }
        self.update_resource_capacities();
        Ok(())
    }

    /// Splice a machine subtree into the existing topology.
    pub fn add_machine(&mut self, subtree: &ResourceTopologyNode) -> Result<(), FlowError> {
        let cluster_id = self.cluster_agg_node_id.ok_or(FlowError::TopologyMissing)?;
        debug!(
            "splicing machine {} ({} PUs) into the topology",
            subtree.descriptor.uid,
            subtree.num_leaves()
        );
        self.splice_subtree(cluster_id, subtree);
        self.cost_model.add_machine(subtree);
        self.connect_equiv_aggs_to_resource(subtree.descriptor.uid);
        self.update_resource_capacities();
        Ok(())
    }

    fn add_resource_node(&mut self, topo: &ResourceTopologyNode) -> NodeId {
        let node_type = if topo.is_leaf() {
            FlowNodeType::Pu
        } else {
            FlowNodeType::ResourceInternal
        };
        let id = self.add_node(node_type);
        let node = self.nodes.get_mut(&id).unwrap();
        node.resource_id = Some(topo.descriptor.uid);
        self.resource_to_node.insert(topo.descriptor.uid, id);
        if topo.is_leaf() {
            self.leaf_node_ids.insert(id);
            self.leaf_res_ids.write().unwrap().insert(topo.descriptor.uid);
            // every PU keeps a unit arc to the sink for its lifetime
            let cost = self.cost_model.leaf_to_sink_cost(topo.descriptor.uid);
            self.add_arc(FlowArc::new(
                id,
                self.sink_node_id,
                ArcClass::ResourceToSink,
                1,
                cost,
            ));
        }
        id
    }

    fn splice_subtree(&mut self, parent_id: NodeId, topo: &ResourceTopologyNode) {
        let id = self.add_resource_node(topo);
        let parent_res = self.nodes[&parent_id].resource_id.expect("resource parent");
        let cost = self
            .cost_model
            .resource_node_to_resource_node_cost(parent_res, topo.descriptor.uid);
        self.add_arc(FlowArc::new(
            parent_id,
            id,
            ArcClass::ResourceInternal,
            topo.num_leaves().max(1),
            cost,
        ));
        for child in &topo.children {
            self.splice_subtree(id, child);
        }
    }

    /// Evict every task bound in the subtree, then delete arcs and nodes
    /// bottom-up. Returns what was displaced; the caller repairs the binding
    /// table and emits external evictions on the next iteration.
    pub fn remove_machine(&mut self, res_id: ResourceId) -> Result<MachineRemoval, FlowError> {
        let machine_node = self
            .resource_to_node
            .get(&res_id)
            .copied()
            .ok_or(FlowError::UnknownResource(res_id))?;

        let subtree = self.collect_resource_subtree(machine_node);
        let mut evicted: Vec<(TaskId, ResourceId)> = Vec::new();
        for id in &subtree {
            let node = &self.nodes[id];
            if let (Some(task), Some(pu_res)) = (node.bound_task, node.resource_id) {
                evicted.push((task, pu_res));
            }
        }

        // drop the leaves from the shared set first so that re-installed
        // preference arcs cannot name them
        {
            let mut leaves = self.leaf_res_ids.write().unwrap();
            for id in &subtree {
                if let Some(res) = self.nodes[id].resource_id {
                    if self.nodes[id].is_leaf() {
                        leaves.remove(&res);
                    }
                }
            }
        }
        self.cost_model.remove_machine(res_id);

        for (task, pu_res) in &evicted {
            self.task_evicted(*task, *pu_res)?;
        }

        // bottom-up: the subtree list is in DFS pre-order
        let mut removed_resources = Vec::new();
        for id in subtree.iter().rev() {
            if let Some(res) = self.nodes.get(id).and_then(|n| n.resource_id) {
                self.resource_to_node.remove(&res);
                removed_resources.push(res);
            }
            self.remove_node(*id);
        }
        self.update_resource_capacities();
        Ok(MachineRemoval {
            evicted_tasks: evicted.into_iter().map(|(task, _res)| task).collect(),
            removed_resources,
        })
    }

    fn collect_resource_subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for (dst, class) in node.outgoing.iter().rev() {
                    if *class == ArcClass::ResourceInternal {
                        stack.push(*dst);
                    }
                }
            }
        }
        out
    }

    fn subtree_pu_count(&self, id: NodeId) -> u64 {
        let node = &self.nodes[&id];
        if node.is_leaf() {
            return 1;
        }
        node.outgoing
            .iter()
            .filter(|(_dst, class)| *class == ArcClass::ResourceInternal)
            .map(|(dst, _class)| self.subtree_pu_count(*dst))
            .sum()
    }

    /// Re-derive capacities bottom-up: an arc into a resource node carries
    /// the PU count of the subtree it opens.
    fn update_resource_capacities(&mut self) {
        let root = match self.cluster_agg_node_id {
            Some(id) => id,
            None => return,
        };
        let mut updates: Vec<(ArcKey, u64)> = Vec::new();
        for id in self.collect_resource_subtree(root) {
            let count = self.subtree_pu_count(id);
            for (src, class) in &self.nodes[&id].incoming {
                if matches!(class, ArcClass::ResourceInternal | ArcClass::EquivToResource) {
                    updates.push(((*src, id, *class), count));
                }
            }
        }
        for (key, capacity) in updates {
            if let Some(arc) = self.arcs.get_mut(&key) {
                arc.capacity = capacity.max(1);
            }
        }
    }

    // ---- job and task nodes ----

    /// Create or refresh the flow-graph representation of a job's runnable
    /// tasks. Calling this twice with the same arguments is equivalent to one
    /// call.
    pub fn add_or_update_job_nodes(&mut self, jd: &JobDescriptor, runnable: &[TaskId]) {
        let agg_id = self.ensure_unscheduled_agg(jd.uid);

        let mut tasks: Vec<TaskId> = runnable.to_vec();
        tasks.sort();
        for task_id in tasks {
            if !self.task_to_node.contains_key(&task_id) {
                let node_type = if task_id == jd.root_task {
                    self.root_task_ids.insert(task_id);
                    FlowNodeType::RootTask
                } else {
                    FlowNodeType::UnscheduledTask
                };
                let node_id = self.add_node(node_type);
                let node = self.nodes.get_mut(&node_id).unwrap();
                node.task_id = Some(task_id);
                node.excess = 1;
                let sink = self.sink_node_id;
                self.nodes.get_mut(&sink).unwrap().excess -= 1;
                self.task_to_node.insert(task_id, node_id);
                self.task_job.insert(task_id, jd.uid);
                *self.job_task_count.entry(jd.uid).or_insert(0) += 1;
                self.cost_model.add_task(task_id);
            } else {
                // refresh pass: the cost model may want to recompute
                // preference sets
                self.cost_model.add_task(task_id);
            }
            if !self.is_task_scheduled(task_id) {
                self.install_task_arcs(task_id, agg_id);
            }
        }
        self.refresh_unscheduled_agg(jd.uid);
    }

    fn ensure_unscheduled_agg(&mut self, job_id: JobId) -> NodeId {
        if let Some(id) = self.unsched_agg_by_job.get(&job_id) {
            return *id;
        }
        let id = self.add_node(FlowNodeType::UnscheduledAggregator);
        self.nodes.get_mut(&id).unwrap().job_id = Some(job_id);
        self.unsched_agg_by_job.insert(job_id, id);
        id
    }

    fn refresh_unscheduled_agg(&mut self, job_id: JobId) {
        let agg_id = match self.unsched_agg_by_job.get(&job_id) {
            Some(id) => *id,
            None => return,
        };
        let count = self.job_task_count.get(&job_id).copied().unwrap_or(0);
        if count == 0 {
            self.unsched_agg_by_job.remove(&job_id);
            self.remove_node(agg_id);
            return;
        }
        let cost = self.cost_model.unscheduled_agg_to_sink_cost(job_id);
        self.add_arc(FlowArc::new(
            agg_id,
            self.sink_node_id,
            ArcClass::UnscheduledToSink,
            count,
            cost,
        ));
    }

    fn is_task_scheduled(&self, task_id: TaskId) -> bool {
        self.task_to_node
            .get(&task_id)
            .and_then(|id| self.nodes.get(id))
            .map(|n| n.node_type == FlowNodeType::ScheduledTask)
            .unwrap_or(false)
    }

    /// Unscheduled-arc cost with the exponential failed-attempt penalty.
    fn unscheduled_cost(&self, task_id: TaskId) -> Cost {
        let base = self.cost_model.task_to_unscheduled_agg_cost(task_id);
        let attempts = self.task_attempts.get(&task_id).copied().unwrap_or(0);
        if attempts == 0 {
            base
        } else {
            let penalty = TASK_FAILURE_PENALTY_BASE.saturating_mul(1 << attempts.min(32));
            base.saturating_add(penalty)
        }
    }

    /// Install (or refresh) the full unscheduled-side arc set of a task:
    /// unscheduled-aggregator arc, cluster-aggregator arc, preference arcs
    /// and equivalence-class arcs.
    fn install_task_arcs(&mut self, task_id: TaskId, agg_id: NodeId) {
        let node_id = self.task_to_node[&task_id];

        let cost = self.unscheduled_cost(task_id);
        self.add_arc(FlowArc::new(
            node_id,
            agg_id,
            ArcClass::TaskToUnscheduled,
            1,
            cost,
        ));

        if let Some(cluster_id) = self.cluster_agg_node_id {
            let cost = self.cost_model.task_to_cluster_agg_cost(task_id);
            self.add_arc(FlowArc::new(
                node_id,
                cluster_id,
                ArcClass::TaskToClusterAgg,
                1,
                cost,
            ));
        }

        let mut prefs = self.cost_model.get_task_preference_arcs(task_id);
        prefs.sort();
        for res in prefs {
            let res_node = match self.resource_to_node.get(&res) {
                Some(id) => *id,
                None => {
                    warn!("preference arc to unknown resource {}, skipping", res);
                    continue;
                }
            };
            let cost = self.cost_model.task_to_resource_node_cost(task_id, res);
            self.add_arc(FlowArc::new(
                node_id,
                res_node,
                ArcClass::TaskToResourcePreference,
                1,
                cost,
            ));
        }

        let mut ecs = self.cost_model.get_task_equiv_classes(task_id);
        ecs.sort();
        for ec in &ecs {
            let ec_node = self.ensure_equiv_agg(*ec);
            let cost = self.cost_model.task_to_equiv_class_aggregator(task_id, *ec);
            self.add_arc(FlowArc::new(node_id, ec_node, ArcClass::TaskToEquiv, 1, cost));
        }
        let previous = self.task_ecs.insert(task_id, ecs.clone());
        let previous = previous.unwrap_or_default();
        for ec in &ecs {
            if !previous.contains(ec) {
                *self.ec_member_count.entry(*ec).or_insert(0) += 1;
            }
        }
        for ec in &previous {
            if !ecs.contains(ec) {
                self.release_equiv_membership(*ec);
            }
        }
    }

    fn ensure_equiv_agg(&mut self, ec: EquivClass) -> NodeId {
        if let Some(id) = self.equiv_class_to_node.get(&ec) {
            return *id;
        }
        let id = self.add_node(FlowNodeType::EquivClassAggregator);
        self.nodes.get_mut(&id).unwrap().equiv_class = Some(ec);
        self.equiv_class_to_node.insert(ec, id);

        // connect the aggregator to every registered machine that declares
        // membership of this class
        let mut machines: Vec<(ResourceId, NodeId)> = self
            .resource_to_node
            .iter()
            .map(|(res, node)| (*res, *node))
            .collect();
        machines.sort();
        for (res, res_node) in machines {
            if self.nodes[&res_node].node_type != FlowNodeType::ResourceInternal {
                continue;
            }
            if self.cost_model.get_resource_equiv_classes(res).contains(&ec) {
                let cost = self.cost_model.equiv_class_to_resource_node(ec, res);
                let capacity = self.subtree_pu_count(res_node);
                self.add_arc(FlowArc::new(
                    id,
                    res_node,
                    ArcClass::EquivToResource,
                    capacity.max(1),
                    cost,
                ));
            }
        }
        id
    }

    /// After a machine arrives, existing aggregators may gain an arc to it.
    fn connect_equiv_aggs_to_resource(&mut self, res: ResourceId) {
        let res_node = match self.resource_to_node.get(&res) {
            Some(id) => *id,
            None => return,
        };
        let ecs = self.cost_model.get_resource_equiv_classes(res);
        for ec in ecs {
            if let Some(ec_node) = self.equiv_class_to_node.get(&ec).copied() {
                let cost = self.cost_model.equiv_class_to_resource_node(ec, res);
                let capacity = self.subtree_pu_count(res_node);
                self.add_arc(FlowArc::new(
                    ec_node,
                    res_node,
                    ArcClass::EquivToResource,
                    capacity.max(1),
                    cost,
                ));
            }
        }
    }

    fn release_equiv_membership(&mut self, ec: EquivClass) {
        let count = self.ec_member_count.entry(ec).or_insert(0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.ec_member_count.remove(&ec);
            if let Some(node_id) = self.equiv_class_to_node.remove(&ec) {
                self.remove_node(node_id);
            }
        }
    }

    // ---- task lifecycle events ----

    /// Trim the task's arcs down to the single arc towards its processing
    /// unit.
    pub fn task_scheduled(&mut self, task_id: TaskId, res_id: ResourceId) -> Result<(), FlowError> {
        let node_id = self
            .task_to_node
            .get(&task_id)
            .copied()
            .ok_or(FlowError::UnknownTask(task_id))?;
        let pu_node = self
            .resource_to_node
            .get(&res_id)
            .copied()
            .ok_or(FlowError::UnknownResource(res_id))?;

        let outgoing: Vec<(NodeId, ArcClass)> =
            self.nodes[&node_id].outgoing.iter().copied().collect();
        for (dst, class) in outgoing {
            self.remove_arc(&(node_id, dst, class));
        }
        let cost = self.cost_model.task_continuation_cost(task_id);
        self.add_arc(FlowArc::new(
            node_id,
            pu_node,
            ArcClass::TaskToResourcePreference,
            1,
            cost,
        ));
        self.nodes.get_mut(&node_id).unwrap().node_type = FlowNodeType::ScheduledTask;
        self.nodes.get_mut(&pu_node).unwrap().bound_task = Some(task_id);
        Ok(())
    }

    /// Restore the unscheduled arc set after an eviction.
    pub fn task_evicted(&mut self, task_id: TaskId, res_id: ResourceId) -> Result<(), FlowError> {
        let node_id = match self.task_to_node.get(&task_id) {
            Some(id) => *id,
            None => {
                debug!("eviction for task {} without a graph node", task_id);
                return Ok(());
            }
        };
        if let Some(pu_node) = self.resource_to_node.get(&res_id).copied() {
            self.remove_arc(&(node_id, pu_node, ArcClass::TaskToResourcePreference));
            let pu = self.nodes.get_mut(&pu_node).unwrap();
            if pu.bound_task == Some(task_id) {
                pu.bound_task = None;
            }
        }
        self.nodes.get_mut(&node_id).unwrap().node_type = if self.root_task_ids.contains(&task_id) {
            FlowNodeType::RootTask
        } else {
            FlowNodeType::UnscheduledTask
        };
        let job_id = self.task_job[&task_id];
        let agg_id = self.ensure_unscheduled_agg(job_id);
        self.install_task_arcs(task_id, agg_id);
        self.refresh_unscheduled_agg(job_id);
        Ok(())
    }

    /// Move the continuation arc from one processing unit to another.
    pub fn task_migrated(
        &mut self,
        task_id: TaskId,
        from: ResourceId,
        to: ResourceId,
    ) -> Result<(), FlowError> {
        let node_id = self
            .task_to_node
            .get(&task_id)
            .copied()
            .ok_or(FlowError::UnknownTask(task_id))?;
        if let Some(old_pu) = self.resource_to_node.get(&from).copied() {
            self.remove_arc(&(node_id, old_pu, ArcClass::TaskToResourcePreference));
            let pu = self.nodes.get_mut(&old_pu).unwrap();
            if pu.bound_task == Some(task_id) {
                pu.bound_task = None;
            }
        }
        let new_pu = self
            .resource_to_node
            .get(&to)
            .copied()
            .ok_or(FlowError::UnknownResource(to))?;
        let cost = self.cost_model.task_continuation_cost(task_id);
        self.add_arc(FlowArc::new(
            node_id,
            new_pu,
            ArcClass::TaskToResourcePreference,
            1,
            cost,
        ));
        self.nodes.get_mut(&new_pu).unwrap().bound_task = Some(task_id);
        Ok(())
    }

    /// Remove the task node and all of its arcs.
    pub fn task_completed(&mut self, task_id: TaskId) {
        let node_id = match self.task_to_node.remove(&task_id) {
            Some(id) => id,
            None => {
                debug!("completion for task {} without a graph node", task_id);
                return;
            }
        };
        if let Some(node) = self.nodes.get(&node_id) {
            // unbind the processing unit if the task was placed
            let bound: Vec<NodeId> = node
                .outgoing
                .iter()
                .filter(|(_dst, class)| *class == ArcClass::TaskToResourcePreference)
                .map(|(dst, _class)| *dst)
                .collect();
            for pu_id in bound {
                if let Some(pu) = self.nodes.get_mut(&pu_id) {
                    if pu.bound_task == Some(task_id) {
                        pu.bound_task = None;
                    }
                }
            }
        }
        self.remove_node(node_id);
        let sink = self.sink_node_id;
        self.nodes.get_mut(&sink).unwrap().excess += 1;

        for ec in self.task_ecs.remove(&task_id).unwrap_or_default() {
            self.release_equiv_membership(ec);
        }
        self.root_task_ids.remove(&task_id);
        self.task_attempts.remove(&task_id);
        self.cost_model.remove_task(task_id);

        if let Some(job_id) = self.task_job.remove(&task_id) {
            if let Some(count) = self.job_task_count.get_mut(&job_id) {
                *count = count.saturating_sub(1);
            }
            self.refresh_unscheduled_agg(job_id);
        }
    }

    /// A failed attempt returns the task to the unscheduled route and bumps
    /// the exponential penalty on its unscheduled arc.
    pub fn task_failed(&mut self, task_id: TaskId) {
        *self.task_attempts.entry(task_id).or_insert(0) += 1;
        let node_id = match self.task_to_node.get(&task_id) {
            Some(id) => *id,
            None => return,
        };
        let bound_res = self.nodes[&node_id]
            .outgoing
            .iter()
            .filter(|(_dst, class)| *class == ArcClass::TaskToResourcePreference)
            .filter_map(|(dst, _class)| self.nodes[dst].bound_task.map(|_| *dst))
            .next()
            .and_then(|pu| self.nodes[&pu].resource_id);
        if self.is_task_scheduled(task_id) {
            if let Some(res) = bound_res {
                let _ = self.task_evicted(task_id, res);
                return;
            }
        }
        // unscheduled failure: only the penalty changes
        let job_id = self.task_job[&task_id];
        let agg_id = self.ensure_unscheduled_agg(job_id);
        self.install_task_arcs(task_id, agg_id);
    }

    /// Killed tasks are not re-enqueued.
    pub fn task_killed(&mut self, task_id: TaskId) {
        self.task_completed(task_id);
    }

    /// Drop the job's unscheduled aggregator and any surviving task nodes.
    pub fn job_completed(&mut self, job_id: JobId) {
        let tasks: Vec<TaskId> = self
            .task_job
            .iter()
            .filter(|(_task, job)| **job == job_id)
            .map(|(task, _job)| *task)
            .collect();
        for task in tasks {
            self.task_completed(task);
        }
        if let Some(agg_id) = self.unsched_agg_by_job.remove(&job_id) {
            self.remove_node(agg_id);
        }
        self.job_task_count.remove(&job_id);
    }

    // ---- time-dependent costs ----

    /// Refresh costs on arcs that are a function of current time or queueing
    /// age; touches no topology.
    pub fn update_time_dependent_costs(&mut self, jobs: &[JobId]) {
        let mut jobs: Vec<JobId> = jobs.to_vec();
        jobs.sort();
        for job_id in jobs {
            let agg_id = match self.unsched_agg_by_job.get(&job_id) {
                Some(id) => *id,
                None => continue,
            };
            let cost = self.cost_model.unscheduled_agg_to_sink_cost(job_id);
            if let Some(arc) = self
                .arcs
                .get_mut(&(agg_id, self.sink_node_id, ArcClass::UnscheduledToSink))
            {
                arc.cost = cost;
            }
            let task_arcs: Vec<(NodeId, TaskId)> = self.nodes[&agg_id]
                .incoming
                .iter()
                .filter(|(_src, class)| *class == ArcClass::TaskToUnscheduled)
                .filter_map(|(src, _class)| self.nodes[src].task_id.map(|t| (*src, t)))
                .collect();
            for (task_node, task_id) in task_arcs {
                let cost = self.unscheduled_cost(task_id);
                if let Some(arc) =
                    self.arcs
                        .get_mut(&(task_node, agg_id, ArcClass::TaskToUnscheduled))
                {
                    arc.cost = cost;
                }
                if let Some(cluster_id) = self.cluster_agg_node_id {
                    let cost = self.cost_model.task_to_cluster_agg_cost(task_id);
                    if let Some(arc) =
                        self.arcs
                            .get_mut(&(task_node, cluster_id, ArcClass::TaskToClusterAgg))
                    {
                        arc.cost = cost;
                    }
                }
            }
        }
    }

    // ---- topology statistics ----

    /// Two-phase aggregate-statistics traversal over the resource topology:
    /// post-order prepare+gather (children folded into parents, ties broken
    /// by node id), then pre-order update (finalized values written back to
    /// children). Visits each resource node exactly once per phase.
    pub fn compute_topology_statistics(&mut self) {
        let root = match self.cluster_agg_node_id {
            Some(id) => id,
            None => return,
        };
        let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for id in self.collect_resource_subtree(root) {
            let mut kids: Vec<NodeId> = self.nodes[&id]
                .outgoing
                .iter()
                .filter(|(_dst, class)| *class == ArcClass::ResourceInternal)
                .map(|(dst, _class)| *dst)
                .collect();
            kids.sort();
            children.insert(id, kids);
        }
        self.stats_prepare_gather(root, &children);
        self.stats_update(root, &children);
    }

    fn stats_prepare_gather(&mut self, id: NodeId, children: &BTreeMap<NodeId, Vec<NodeId>>) {
        {
            let FlowGraph {
                ref mut nodes,
                ref mut cost_model,
                ..
            } = *self;
            cost_model.prepare_stats(nodes.get_mut(&id).unwrap());
        }
        let kids = children.get(&id).cloned().unwrap_or_default();
        for child in kids {
            self.stats_prepare_gather(child, children);
            let FlowGraph {
                ref mut nodes,
                ref mut cost_model,
                ..
            } = *self;
            let snapshot = nodes[&child].clone();
            cost_model.gather_stats(nodes.get_mut(&id).unwrap(), &snapshot);
        }
    }

    fn stats_update(&mut self, id: NodeId, children: &BTreeMap<NodeId, Vec<NodeId>>) {
        let kids = children.get(&id).cloned().unwrap_or_default();
        for child in kids {
            {
                let FlowGraph {
                    ref mut nodes,
                    ref mut cost_model,
                    ..
                } = *self;
                let snapshot = nodes[&id].clone();
                cost_model.update_stats(&snapshot, nodes.get_mut(&child).unwrap());
            }
            self.stats_update(child, children);
        }
    }

    // ---- invariants ----

    /// Structural health check used by the test suite after every public
    /// operation.
    pub fn check_invariants(&self, bindings: &HashMap<TaskId, ResourceId>) {
        // supply conservation
        let total: i64 = self.nodes.values().map(|n| n.excess).sum();
        assert_eq!(total, 0, "supply conservation violated");

        for arc in self.arcs.values() {
            assert!(
                arc.lower_bound <= arc.capacity,
                "capacity bounds violated on {:?}",
                arc.key()
            );
            assert!(
                self.nodes.contains_key(&arc.src) && self.nodes.contains_key(&arc.dst),
                "dangling arc {:?}",
                arc.key()
            );
            if arc.class == ArcClass::ResourceInternal {
                assert!(
                    arc.capacity <= self.subtree_pu_count(arc.dst).max(1),
                    "resource arc capacity exceeds subtree PU count"
                );
            }
        }

        for node in self.nodes.values() {
            if node.is_leaf() {
                assert!(
                    self.arcs
                        .contains_key(&(node.id, self.sink_node_id, ArcClass::ResourceToSink)),
                    "leaf without sink arc"
                );
            }
            if let Some(task_id) = node.task_id {
                let bound = bindings.contains_key(&task_id);
                assert_eq!(
                    node.node_type == FlowNodeType::ScheduledTask,
                    bound,
                    "node type / binding mismatch for task {}",
                    task_id
                );
                if bound {
                    let outgoing: Vec<_> = node.outgoing.iter().copied().collect();
                    assert_eq!(outgoing.len(), 1, "scheduled task with multiple arcs");
                    let (dst, _class) = outgoing[0];
                    let pu = &self.nodes[&dst];
                    assert!(pu.is_leaf(), "scheduled task arc does not target a PU");
                    assert_eq!(pu.resource_id, bindings.get(&task_id).copied());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::core::descriptor::{JobDescriptor, ResourceTopologyNode, TaskDescriptor};
    use crate::core::runtime::{JobId, ResourceId, TaskId};
    use crate::scheduling::cost_model::trivial::TrivialCostModel;
    use crate::scheduling::cost_model::CostModelEnv;
    use crate::scheduling::flow::graph::FlowGraph;
    use crate::scheduling::flow::FlowError;
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

    fn test_graph(env: &CostModelEnv) -> FlowGraph {
        FlowGraph::new(
            Box::new(TrivialCostModel::new(env.clone())),
            env.leaf_res_ids.clone(),
        )
        .unwrap()
    }

    fn cluster_with_machine(num_pus: u32) -> (ResourceTopologyNode, ResourceId) {
        let mut cluster = ResourceTopologyNode::empty_cluster("test_cluster");
        let machine = ResourceTopologyNode::machine("m0", num_pus);
        let machine_id = machine.descriptor.uid;
        cluster.children.push(machine);
        (cluster, machine_id)
    }

    fn submit_job(env: &CostModelEnv, job_id: u64, task_ids: &[u64]) -> JobDescriptor {
        let mut jd = JobDescriptor::new(JobId(job_id), "job", TaskId(task_ids[0]));
        jd.tasks = task_ids.iter().map(|t| TaskId(*t)).collect();
        let mut tasks = env.task_map.write().unwrap();
        for t in task_ids {
            tasks.insert(
                TaskId(*t),
                TaskDescriptor::new(TaskId(*t), JobId(job_id), "t", 0),
            );
        }
        jd
    }

    #[test]
    pub fn topology_install_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);

        graph.add_resource_topology(&cluster).unwrap();
        // sink + cluster + machine + 2 PUs
        assert_eq!(graph.num_nodes(), 5);
        assert_eq!(graph.leaf_node_ids().len(), 2);
        graph.check_invariants(&HashMap::new());

        // a second install is rejected
        assert!(matches!(
            graph.add_resource_topology(&cluster),
            Err(FlowError::TopologyNotEmpty)
        ));
    }

    #[test]
    pub fn add_machine_updates_capacities_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);
        graph.add_resource_topology(&cluster).unwrap();

        let m1 = ResourceTopologyNode::machine("m1", 4);
        graph.add_machine(&m1).unwrap();
        assert_eq!(graph.leaf_node_ids().len(), 6);

        let cluster_node = graph.cluster_agg_node_id().unwrap();
        let m1_node = graph.resource_node_id(m1.descriptor.uid).unwrap();
        let arc = graph
            .arc(&(
                cluster_node,
                m1_node,
                crate::scheduling::flow::ArcClass::ResourceInternal,
            ))
            .unwrap();
        assert_eq!(arc.capacity, 4);
        graph.check_invariants(&HashMap::new());
    }

    #[test]
    pub fn job_nodes_idempotence_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);
        graph.add_resource_topology(&cluster).unwrap();

        let jd = submit_job(&env, 1, &[10, 11]);
        let runnable = vec![TaskId(10), TaskId(11)];
        graph.add_or_update_job_nodes(&jd, &runnable);
        let nodes_once = graph.num_nodes();
        let arcs_once = graph.num_arcs();

        graph.add_or_update_job_nodes(&jd, &runnable);
        assert_eq!(graph.num_nodes(), nodes_once);
        assert_eq!(graph.num_arcs(), arcs_once);
        graph.check_invariants(&HashMap::new());
    }

    #[test]
    pub fn schedule_evict_round_trip_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);
        graph.add_resource_topology(&cluster).unwrap();

        let jd = submit_job(&env, 1, &[10]);
        graph.add_or_update_job_nodes(&jd, &[TaskId(10)]);

        let task_node = graph.task_node_id(TaskId(10)).unwrap();
        let before: Vec<_> = graph.node(task_node).unwrap().outgoing.iter().copied().collect();

        let pu_res = {
            let leaves = env.leaf_res_ids.read().unwrap();
            let mut ids: Vec<ResourceId> = leaves.iter().copied().collect();
            ids.sort();
            ids[0]
        };
        graph.task_scheduled(TaskId(10), pu_res).unwrap();
        assert_eq!(graph.node(task_node).unwrap().outgoing.len(), 1);

        let mut bindings = HashMap::new();
        bindings.insert(TaskId(10), pu_res);
        graph.check_invariants(&bindings);

        graph.task_evicted(TaskId(10), pu_res).unwrap();
        let after: Vec<_> = graph.node(task_node).unwrap().outgoing.iter().copied().collect();
        assert_eq!(before, after);
        graph.check_invariants(&HashMap::new());
    }

    #[test]
    pub fn completion_order_commutes_test() {
        let env = test_env();
        let mut graph_a = test_graph(&env);
        let mut graph_b = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);
        graph_a.add_resource_topology(&cluster).unwrap();
        graph_b.add_resource_topology(&cluster).unwrap();

        let jd = submit_job(&env, 1, &[10, 11]);
        let runnable = vec![TaskId(10), TaskId(11)];
        graph_a.add_or_update_job_nodes(&jd, &runnable);
        graph_b.add_or_update_job_nodes(&jd, &runnable);

        graph_a.task_completed(TaskId(10));
        graph_a.task_completed(TaskId(11));
        graph_b.task_completed(TaskId(11));
        graph_b.task_completed(TaskId(10));

        assert_eq!(graph_a.num_nodes(), graph_b.num_nodes());
        assert_eq!(graph_a.num_arcs(), graph_b.num_arcs());
        graph_a.check_invariants(&HashMap::new());
        graph_b.check_invariants(&HashMap::new());
    }

    #[test]
    pub fn remove_machine_evicts_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, machine_id) = cluster_with_machine(2);
        graph.add_resource_topology(&cluster).unwrap();

        let jd = submit_job(&env, 1, &[10]);
        graph.add_or_update_job_nodes(&jd, &[TaskId(10)]);
        let pu_res = {
            let leaves = env.leaf_res_ids.read().unwrap();
            let mut ids: Vec<ResourceId> = leaves.iter().copied().collect();
            ids.sort();
            ids[0]
        };
        graph.task_scheduled(TaskId(10), pu_res).unwrap();

        let removal = graph.remove_machine(machine_id).unwrap();
        assert_eq!(removal.evicted_tasks, vec![TaskId(10)]);
        assert_eq!(removal.removed_resources.len(), 3);
        assert!(graph.leaf_node_ids().is_empty());
        assert!(env.leaf_res_ids.read().unwrap().is_empty());
        // the task is back on the unscheduled route
        let task_node = graph.task_node_id(TaskId(10)).unwrap();
        assert!(!graph.node(task_node).unwrap().outgoing.is_empty());
        graph.check_invariants(&HashMap::new());
    }

    #[test]
    pub fn shared_cost_model_rejected_test() {
        use crate::scheduling::cost_model::{CostModel, GraphToken};

        let env = test_env();
        let mut model = TrivialCostModel::new(env.clone());
        model.set_flow_graph(GraphToken::next()).unwrap();
        // binding the model into a second graph is rejected
        assert!(matches!(
            model.set_flow_graph(GraphToken::next()),
            Err(FlowError::CostModelAlreadyBound)
        ));
    }

    #[test]
    pub fn job_completed_removes_all_test() {
        let env = test_env();
        let mut graph = test_graph(&env);
        let (cluster, _machine) = cluster_with_machine(2);
        graph.add_resource_topology(&cluster).unwrap();
        let base_nodes = graph.num_nodes();
        let base_arcs = graph.num_arcs();

        let jd = submit_job(&env, 1, &[10, 11, 12]);
        graph.add_or_update_job_nodes(&jd, &[TaskId(10), TaskId(11), TaskId(12)]);
        graph.job_completed(JobId(1));

        assert_eq!(graph.num_nodes(), base_nodes);
        assert_eq!(graph.num_arcs(), base_arcs);
        graph.check_invariants(&HashMap::new());
    }
}
