//! Library-call solver: deterministic successive shortest paths.
//!
//! Small clusters produce small graphs, so a Bellman-Ford based augmenting
//! loop is entirely adequate; the external co-process solver covers the
//! large-graph deployments. Determinism (fixed arc order, lowest-index tie
//! breaks) is what the test suite and the trace simulator rely on.

use std::time::Duration;

use crate::core::Cost;
use crate::scheduling::solver::FlowSolver;

#[derive(Debug, Default)]
pub struct InProcessSolver;

struct ResidualArc {
    src: usize,
    dst: usize,
    residual: u64,
    cost: Cost,
    /// index of the paired residual arc
    twin: usize,
}

struct Problem {
    num_nodes: usize,
    excess: Vec<i64>,
    arcs: Vec<(usize, usize, u64, Cost)>,
}

fn parse_problem(problem: &str) -> anyhow::Result<Problem> {
    let mut num_nodes = 0usize;
    let mut excess: Vec<i64> = Vec::new();
    let mut arcs = Vec::new();
    for line in problem.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["p", "min", n, _m] => {
                num_nodes = n.parse()?;
                excess = vec![0; num_nodes + 1];
            }
            ["n", id, supply] => {
                let id: usize = id.parse()?;
                if id == 0 || id > num_nodes {
                    bail!("supply for unknown node {}", id);
                }
                excess[id] = supply.parse()?;
            }
            ["a", src, dst, lower, cap, cost] => {
                let lower: u64 = lower.parse()?;
                if lower != 0 {
                    bail!("nonzero lower bounds are not supported");
                }
                arcs.push((src.parse()?, dst.parse()?, cap.parse()?, cost.parse()?));
            }
            ["c", ..] | [] => {}
            _ => bail!("malformed problem line: {}", line),
        }
    }
    if num_nodes == 0 {
        bail!("missing problem header");
    }
    Ok(Problem {
        num_nodes,
        excess,
        arcs,
    })
}

impl FlowSolver for InProcessSolver {
    fn solve(&mut self, problem: &str, _deadline: Option<Duration>) -> anyhow::Result<String> {
        let problem = parse_problem(problem)?;
        let mut residual: Vec<ResidualArc> = Vec::with_capacity(problem.arcs.len() * 2);
        for &(src, dst, cap, cost) in problem.arcs.iter() {
            let fwd = residual.len();
            residual.push(ResidualArc {
                src,
                dst,
                residual: cap,
                cost,
                twin: fwd + 1,
            });
            residual.push(ResidualArc {
                src: dst,
                dst: src,
                residual: 0,
                cost: -cost,
                twin: fwd,
            });
        }

        let mut excess = problem.excess.clone();
        loop {
            let source = match (1..=problem.num_nodes).find(|id| excess[*id] > 0) {
                Some(id) => id,
                None => break,
            };

            // Bellman-Ford over the residual network; fixed relaxation order
            // keeps path selection deterministic
            let mut dist: Vec<Option<Cost>> = vec![None; problem.num_nodes + 1];
            let mut pred: Vec<Option<usize>> = vec![None; problem.num_nodes + 1];
            dist[source] = Some(0);
            for _round in 0..problem.num_nodes {
                let mut changed = false;
                for (arc_idx, arc) in residual.iter().enumerate() {
                    if arc.residual == 0 {
                        continue;
                    }
                    let from = match dist[arc.src] {
                        Some(d) => d,
                        None => continue,
                    };
                    let candidate = from + arc.cost;
                    if dist[arc.dst].map_or(true, |d| candidate < d) {
                        dist[arc.dst] = Some(candidate);
                        pred[arc.dst] = Some(arc_idx);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            let target = (1..=problem.num_nodes)
                .filter(|id| excess[*id] < 0 && dist[*id].is_some())
                .min_by_key(|id| (dist[*id].unwrap(), *id));
            let target = match target {
                Some(id) => id,
                None => bail!("no augmenting path from node {}, problem infeasible", source),
            };

            // bottleneck along the path
            let mut delta = excess[source].min(-excess[target]) as u64;
            let mut cursor = target;
            while cursor != source {
                let arc_idx = pred[cursor].expect("path predecessor");
                delta = delta.min(residual[arc_idx].residual);
                cursor = residual[arc_idx].src;
            }
            if delta == 0 {
                bail!("zero-width augmenting path, problem degenerate");
            }

            let mut cursor = target;
            while cursor != source {
                let arc_idx = pred[cursor].expect("path predecessor");
                residual[arc_idx].residual -= delta;
                let twin = residual[arc_idx].twin;
                residual[twin].residual += delta;
                cursor = residual[arc_idx].src;
            }
            excess[source] -= delta as i64;
            excess[target] += delta as i64;
        }

        let mut out = String::new();
        for (idx, &(src, dst, cap, _cost)) in problem.arcs.iter().enumerate() {
            let fwd = idx * 2;
            let flow = cap - residual[fwd].residual;
            if flow > 0 {
                out.push_str(&format!("f {} {} {}\n", src, dst, flow));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::scheduling::solver::in_process::InProcessSolver;
    use crate::scheduling::solver::{dimacs, FlowSolver};

    #[test]
    pub fn picks_cheapest_route_test() {
        // node 1: sink; node 2: source with supply 1; arcs 2->3->1 (cheap)
        // and 2->4->1 (expensive)
        let problem = "p min 4 4\n\
                       n 1 -1\n\
                       n 2 1\n\
                       a 2 3 0 1 1\n\
                       a 2 4 0 1 10\n\
                       a 3 1 0 1 0\n\
                       a 4 1 0 1 0\n";
        let mut solver = InProcessSolver::default();
        let output = solver.solve(problem, None).unwrap();
        let flows = dimacs::parse_flow(&output).unwrap();
        assert!(flows.iter().any(|f| f.src == 2 && f.dst == 3 && f.flow == 1));
        assert!(!flows.iter().any(|f| f.src == 2 && f.dst == 4));
    }

    #[test]
    pub fn respects_capacity_test() {
        // two units of supply, one capacity-1 middle route plus a fallback
        let problem = "p min 5 6\n\
                       n 1 -2\n\
                       n 2 1\n\
                       n 3 1\n\
                       a 2 4 0 1 1\n\
                       a 3 4 0 1 1\n\
                       a 4 1 0 1 0\n\
                       a 2 5 0 1 5\n\
                       a 3 5 0 1 5\n\
                       a 5 1 0 2 0\n";
        let mut solver = InProcessSolver::default();
        let output = solver.solve(problem, None).unwrap();
        let flows = dimacs::parse_flow(&output).unwrap();
        let into_4: u64 = flows.iter().filter(|f| f.dst == 4).map(|f| f.flow).sum();
        assert_eq!(into_4, 1);
        let into_sink: u64 = flows.iter().filter(|f| f.dst == 1).map(|f| f.flow).sum();
        assert_eq!(into_sink, 2);
    }

    #[test]
    pub fn deterministic_output_test() {
        let problem = "p min 4 4\n\
                       n 1 -1\n\
                       n 2 1\n\
                       a 2 3 0 1 1\n\
                       a 2 4 0 1 1\n\
                       a 3 1 0 1 0\n\
                       a 4 1 0 1 0\n";
        let mut solver = InProcessSolver::default();
        let a = solver.solve(problem, None).unwrap();
        let b = solver.solve(problem, None).unwrap();
        assert_eq!(a, b);
    }
}
