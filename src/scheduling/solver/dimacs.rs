//! DIMACS-style wire format for the min-cost-flow solver.
//!
//! Nodes are 1-indexed and dense; the sink is node 1 by convention (it is
//! the first node the graph allocates and ids are monotone, so ascending
//! order pins it). Serializing an unchanged graph twice yields byte-equal
//! output.

use std::collections::HashMap;

use crate::core::runtime::NodeId;
use crate::scheduling::flow::FlowGraph;

pub struct NodeMapping {
    dense_to_node: Vec<NodeId>,
    node_to_dense: HashMap<NodeId, usize>,
}

impl NodeMapping {
    pub fn to_node(&self, dense: usize) -> Option<NodeId> {
        if dense == 0 || dense > self.dense_to_node.len() {
            return None;
        }
        Some(self.dense_to_node[dense - 1])
    }

    pub fn to_dense(&self, node: NodeId) -> Option<usize> {
        self.node_to_dense.get(&node).copied()
    }
}

/// Serialize the graph: `p min` header, `n` lines for nonzero supplies,
/// `a` lines in ascending (src, dst, class) order.
pub fn serialize(graph: &FlowGraph) -> (String, NodeMapping) {
    let mut dense_to_node = Vec::with_capacity(graph.num_nodes() as usize);
    let mut node_to_dense = HashMap::new();
    for node in graph.nodes() {
        dense_to_node.push(node.id);
        node_to_dense.insert(node.id, dense_to_node.len());
    }
    let mapping = NodeMapping {
        dense_to_node,
        node_to_dense,
    };

    let mut out = String::new();
    out.push_str(&format!("p min {} {}\n", graph.num_nodes(), graph.num_arcs()));
    for node in graph.nodes() {
        if node.excess != 0 {
            out.push_str(&format!("n {} {}\n", mapping.to_dense(node.id).unwrap(), node.excess));
        }
    }
    for arc in graph.arcs() {
        out.push_str(&format!(
            "a {} {} {} {} {}\n",
            mapping.to_dense(arc.src).unwrap(),
            mapping.to_dense(arc.dst).unwrap(),
            arc.lower_bound,
            arc.capacity,
            arc.cost
        ));
    }
    (out, mapping)
}

/// One reported flow over an arc, in dense node ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlowLine {
    pub src: usize,
    pub dst: usize,
    pub flow: u64,
}

/// Parse solver output: `f <src> <dst> <flow>` lines; `c` comments and the
/// `s` solution line are ignored; anything else is malformed.
pub fn parse_flow(output: &str) -> anyhow::Result<Vec<FlowLine>> {
    let mut flows = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('c') || line.starts_with('s') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let values: &[&str] = match fields.as_slice() {
            ["f", rest @ ..] => rest,
            rest => rest,
        };
        if values.len() != 3 {
            bail!("malformed flow line: {}", line);
        }
        let src: usize = values[0]
            .parse()
            .map_err(|e| anyhow!("malformed flow source in `{}`: {}", line, e))?;
        let dst: usize = values[1]
            .parse()
            .map_err(|e| anyhow!("malformed flow destination in `{}`: {}", line, e))?;
        let flow: u64 = values[2]
            .parse()
            .map_err(|e| anyhow!("malformed flow value in `{}`: {}", line, e))?;
        if flow > 0 {
            flows.push(FlowLine { src, dst, flow });
        }
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::core::descriptor::{JobDescriptor, ResourceTopologyNode, TaskDescriptor};
    use crate::core::runtime::{JobId, TaskId};
    use crate::scheduling::cost_model::trivial::TrivialCostModel;
    use crate::scheduling::cost_model::CostModelEnv;
    use crate::scheduling::flow::FlowGraph;
    use crate::scheduling::knowledge_base::InMemoryKnowledgeBase;
    use crate::scheduling::solver::dimacs::{parse_flow, serialize};
    use crate::utils::clock::SettableClock;

    #[test]
    pub fn serialization_is_referentially_pure_test() {
        let env = CostModelEnv {
            task_map: Arc::new(RwLock::new(HashMap::new())),
            resource_map: Arc::new(RwLock::new(HashMap::new())),
            leaf_res_ids: Arc::new(RwLock::new(HashSet::new())),
            knowledge_base: Arc::new(InMemoryKnowledgeBase::new()),
            clock: SettableClock::new(0),
        };
        let mut graph = FlowGraph::new(
            Box::new(TrivialCostModel::new(env.clone())),
            env.leaf_res_ids.clone(),
        )
        .unwrap();

        let mut cluster = ResourceTopologyNode::empty_cluster("cluster");
        cluster.children.push(ResourceTopologyNode::machine("m0", 2));
        graph.add_resource_topology(&cluster).unwrap();

        let mut jd = JobDescriptor::new(JobId(1), "job", TaskId(10));
        jd.tasks = vec![TaskId(10), TaskId(11)];
        {
            let mut tasks = env.task_map.write().unwrap();
            for t in [10, 11] {
                tasks.insert(
                    TaskId(t),
                    TaskDescriptor::new(TaskId(t), JobId(1), "t", 0),
                );
            }
        }
        graph.add_or_update_job_nodes(&jd, &[TaskId(10), TaskId(11)]);

        let (first, _mapping) = serialize(&graph);
        let (second, _mapping) = serialize(&graph);
        assert_eq!(first, second);
        assert!(first.starts_with("p min "));
    }

    #[test]
    pub fn parse_flow_test() {
        let output = "c comment\ns 42\nf 2 1 1\n3 1 2\nf 4 5 0\n";
        let flows = parse_flow(output).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!((flows[0].src, flows[0].dst, flows[0].flow), (2, 1, 1));
        assert_eq!((flows[1].src, flows[1].dst, flows[1].flow), (3, 1, 2));
    }

    #[test]
    pub fn parse_flow_malformed_test() {
        assert!(parse_flow("f 1 2\n").is_err());
        assert!(parse_flow("f one 2 3\n").is_err());
    }
}
