//! Interface to the external min-cost-flow solver: serialize the graph,
//! run the solver to convergence, parse the flow back into task-node to
//! PU-node assignments.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::core::config::SchedulingParameters;
use crate::core::descriptor::{ResourceDescriptor, TaskDescriptor};
use crate::core::runtime::{NodeId, ResourceId, TaskId};
use crate::scheduling::flow::FlowGraph;
use crate::scheduling::{DeltaKind, SchedulingDelta};

pub mod co_process;
pub mod dimacs;
pub mod in_process;

/// Opaque min-cost-flow oracle; either a co-process over pipes or a library
/// call.
pub trait FlowSolver: Send {
    fn solve(&mut self, problem: &str, deadline: Option<Duration>) -> anyhow::Result<String>;
}

pub struct SolverDispatcher {
    solver: Box<dyn FlowSolver>,
    deadline: Option<Duration>,
    debug_export: bool,
    debug_output_dir: String,
    seq_num: u64,
}

impl SolverDispatcher {
    pub fn from_params(params: &SchedulingParameters) -> Self {
        let solver: Box<dyn FlowSolver> = match &params.solver_binary {
            Some(binary) => Box::new(co_process::CoProcessSolver::new(binary)),
            None => Box::new(in_process::InProcessSolver::default()),
        };
        Self::with_solver(solver, params)
    }

    pub fn with_solver(solver: Box<dyn FlowSolver>, params: &SchedulingParameters) -> Self {
        SolverDispatcher {
            solver,
            deadline: params.solver_deadline_ms.map(Duration::from_millis),
            debug_export: params.debug_cost_model,
            debug_output_dir: params.debug_output_dir.clone(),
            seq_num: 0,
        }
    }

    /// Number of completed solver runs; doubles as the debug file sequence.
    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    /// One full solver round trip. Errors are transient: the caller logs,
    /// applies zero placements and keeps the graph for the next iteration.
    pub fn run(&mut self, graph: &FlowGraph) -> anyhow::Result<Vec<(NodeId, NodeId)>> {
        self.seq_num += 1;
        let (problem, mapping) = dimacs::serialize(graph);
        if self.debug_export {
            let path = Path::new(&self.debug_output_dir)
                .join(format!("flow_graph_{}.dm", self.seq_num));
            if let Err(e) = std::fs::write(&path, &problem) {
                warn!("failed to export flow graph to {:?}: {}", path, e);
            }
        }
        let output = self.solver.solve(&problem, self.deadline)?;
        let flows = dimacs::parse_flow(&output)?;
        self.extract_assignments(graph, &mapping, &flows)
    }

    /// Walk the reported flow backwards from each processing unit to the
    /// task whose unit of supply reached it. Flow that terminates at an
    /// unscheduled aggregator never reaches a PU and is skipped.
    fn extract_assignments(
        &self,
        graph: &FlowGraph,
        mapping: &dimacs::NodeMapping,
        flows: &[dimacs::FlowLine],
    ) -> anyhow::Result<Vec<(NodeId, NodeId)>> {
        let mut incoming: BTreeMap<NodeId, BTreeMap<NodeId, u64>> = BTreeMap::new();
        for flow in flows {
            let src = mapping
                .to_node(flow.src)
                .ok_or_else(|| anyhow!("flow from unknown node index {}", flow.src))?;
            let dst = mapping
                .to_node(flow.dst)
                .ok_or_else(|| anyhow!("flow to unknown node index {}", flow.dst))?;
            *incoming.entry(dst).or_default().entry(src).or_insert(0) += flow.flow;
        }

        let mut assignments = Vec::new();
        for pu in graph.leaf_node_ids() {
            let units: u64 = incoming
                .get(pu)
                .map(|srcs| srcs.values().sum())
                .unwrap_or(0);
            for _unit in 0..units {
                let mut cursor = *pu;
                let mut hops = 0u64;
                loop {
                    let srcs = incoming
                        .get_mut(&cursor)
                        .ok_or_else(|| anyhow!("flow trace dead-ends at node {}", cursor))?;
                    let src = *srcs
                        .iter()
                        .find(|(_src, flow)| **flow > 0)
                        .ok_or_else(|| anyhow!("flow trace dead-ends at node {}", cursor))?
                        .0;
                    *srcs.get_mut(&src).unwrap() -= 1;
                    let node = graph
                        .node(src)
                        .ok_or_else(|| anyhow!("flow trace reaches removed node {}", src))?;
                    if node.node_type.is_task() {
                        assignments.push((src, *pu));
                        break;
                    }
                    cursor = src;
                    hops += 1;
                    if hops > graph.num_nodes() {
                        bail!("flow trace does not terminate");
                    }
                }
            }
        }
        assignments.sort();
        Ok(assignments)
    }

    /// Translate one (task, resource) binding into scheduling deltas against
    /// the current binding table.
    pub fn node_binding_to_scheduling_delta(
        task: &TaskDescriptor,
        resource: &ResourceDescriptor,
        bindings: &HashMap<TaskId, ResourceId>,
        deltas: &mut Vec<SchedulingDelta>,
    ) {
        match bindings.get(&task.uid) {
            None => {
                deltas.push(SchedulingDelta::new(
                    DeltaKind::Place,
                    task.uid,
                    resource.uid,
                ));
            }
            Some(bound) if *bound == resource.uid => {
                // filtered before the application loop
                deltas.push(SchedulingDelta::new(DeltaKind::Noop, task.uid, resource.uid));
            }
            Some(bound) => {
                deltas.push(SchedulingDelta::new(DeltaKind::Preempt, task.uid, *bound));
                deltas.push(SchedulingDelta::new(
                    DeltaKind::Place,
                    task.uid,
                    resource.uid,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::core::descriptor::{ResourceDescriptor, ResourceType, TaskDescriptor};
    use crate::core::runtime::{JobId, ResourceId, TaskId};
    use crate::scheduling::solver::SolverDispatcher;
    use crate::scheduling::DeltaKind;

    #[test]
    pub fn binding_to_delta_test() {
        let td = TaskDescriptor::new(TaskId(1), JobId(1), "t", 0);
        let res_a = ResourceDescriptor::new(ResourceId::generate(), "pu_a", ResourceType::Pu);
        let res_b = ResourceDescriptor::new(ResourceId::generate(), "pu_b", ResourceType::Pu);
        let mut bindings = HashMap::new();

        // unbound -> place
        let mut deltas = Vec::new();
        SolverDispatcher::node_binding_to_scheduling_delta(&td, &res_a, &bindings, &mut deltas);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Place);

        // bound to the same resource -> noop
        bindings.insert(TaskId(1), res_a.uid);
        let mut deltas = Vec::new();
        SolverDispatcher::node_binding_to_scheduling_delta(&td, &res_a, &bindings, &mut deltas);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Noop);

        // bound elsewhere -> preempt + place
        let mut deltas = Vec::new();
        SolverDispatcher::node_binding_to_scheduling_delta(&td, &res_b, &bindings, &mut deltas);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].kind, DeltaKind::Preempt);
        assert_eq!(deltas[0].resource_id, res_a.uid);
        assert_eq!(deltas[1].kind, DeltaKind::Place);
        assert_eq!(deltas[1].resource_id, res_b.uid);
    }
}
