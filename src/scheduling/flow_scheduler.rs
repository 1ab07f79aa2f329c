//! Quincy-style min-cost max-flow scheduler.
//!
//! Every externally visible entry point takes the scheduler mutex once and
//! drains into `*_locked` helpers that assume it is held; delta application
//! calls the locked helpers directly instead of re-entering the public
//! surface.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::config::SchedulingParameters;
use crate::core::descriptor::{
    JobDescriptor, JobState, ResourceTopologyNode, TaskDescriptor, TaskFinalReport, TaskState,
};
use crate::core::runtime::{JobId, ResourceId, TaskId};
use crate::scheduling::cost_model::{create_cost_model, CostModel, CostModelEnv};
use crate::scheduling::event_driven::{new_leaf_resource_set, EventDrivenCore, ExecutorBackend};
use crate::scheduling::flow::{FlowGraph, FlowNodeType};
use crate::scheduling::knowledge_base::KnowledgeBase;
use crate::scheduling::solver::{FlowSolver, SolverDispatcher};
use crate::scheduling::{DeltaKind, SchedulingDelta};
use crate::utils::clock::Clock;
use crate::utils::date_time;

pub struct FlowScheduler {
    inner: Mutex<SchedulerCore>,
}

struct SchedulerCore {
    parameters: SchedulingParameters,
    clock: Arc<dyn Clock>,
    base: EventDrivenCore,
    flow_graph: FlowGraph,
    dispatcher: SolverDispatcher,
    last_updated_time_dependent_costs: u64,
    /// deltas produced by the most recent iteration, in application order
    last_deltas: Vec<SchedulingDelta>,
}

impl FlowScheduler {
    pub fn new(
        parameters: SchedulingParameters,
        topology: &ResourceTopologyNode,
        executor: Box<dyn ExecutorBackend>,
        knowledge_base: Arc<dyn KnowledgeBase>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let dispatcher = SolverDispatcher::from_params(&parameters);
        Self::with_solver_dispatcher(
            parameters, topology, executor, knowledge_base, clock, dispatcher,
        )
    }

    /// Construction with an injected solver; the determinism tests and the
    /// simulator use this.
    pub fn with_solver(
        parameters: SchedulingParameters,
        topology: &ResourceTopologyNode,
        executor: Box<dyn ExecutorBackend>,
        knowledge_base: Arc<dyn KnowledgeBase>,
        clock: Arc<dyn Clock>,
        solver: Box<dyn FlowSolver>,
    ) -> anyhow::Result<Self> {
        let dispatcher = SolverDispatcher::with_solver(solver, &parameters);
        Self::with_solver_dispatcher(
            parameters, topology, executor, knowledge_base, clock, dispatcher,
        )
    }

    fn with_solver_dispatcher(
        parameters: SchedulingParameters,
        topology: &ResourceTopologyNode,
        executor: Box<dyn ExecutorBackend>,
        knowledge_base: Arc<dyn KnowledgeBase>,
        clock: Arc<dyn Clock>,
        dispatcher: SolverDispatcher,
    ) -> anyhow::Result<Self> {
        let base = EventDrivenCore::new(executor, knowledge_base.clone());
        let leaf_res_ids = new_leaf_resource_set();
        let env = CostModelEnv {
            task_map: base.task_map.clone(),
            resource_map: base.resource_map.clone(),
            leaf_res_ids: leaf_res_ids.clone(),
            knowledge_base,
            clock: clock.clone(),
        };
        let cost_model = create_cost_model(parameters.cost_model, env);
        let mut flow_graph = FlowGraph::new(cost_model, leaf_res_ids)
            .map_err(|e| anyhow!("flow graph construction failed: {}", e))?;

        base.insert_resource_subtree(topology);
        flow_graph
            .add_resource_topology(topology)
            .map_err(|e| anyhow!("initial topology install failed: {}", e))?;

        info!(
            "FlowScheduler initiated; cost model {}, update frequency {}us",
            parameters.cost_model, parameters.time_dependent_cost_update_frequency
        );

        let mut core = SchedulerCore {
            parameters,
            clock,
            base,
            flow_graph,
            dispatcher,
            last_updated_time_dependent_costs: 0,
            last_deltas: Vec::new(),
        };
        core.update_cost_model_resource_stats();
        Ok(FlowScheduler {
            inner: Mutex::new(core),
        })
    }

    // ---- public contract; every method locks once ----

    /// Splice a machine into the schedulable topology.
    pub fn register_resource(&self, subtree: &ResourceTopologyNode) -> anyhow::Result<()> {
        let mut core = self.inner.lock().unwrap();
        core.base.insert_resource_subtree(subtree);
        core.flow_graph
            .add_machine(subtree)
            .map_err(|e| anyhow!("machine registration failed: {}", e))?;
        core.update_cost_model_resource_stats();
        Ok(())
    }

    /// Remove a machine; its tasks return to the unscheduled queue and are
    /// reconsidered on the next iteration.
    pub fn deregister_resource(&self, res_id: ResourceId) -> anyhow::Result<()> {
        let mut core = self.inner.lock().unwrap();
        core.deregister_resource_locked(res_id)
    }

    /// Register a job and its tasks; submissions racing job completion are
    /// silently discarded.
    pub fn submit_job(
        &self,
        jd: JobDescriptor,
        tasks: Vec<TaskDescriptor>,
    ) -> anyhow::Result<()> {
        let mut core = self.inner.lock().unwrap();
        let now_us = core.clock.now_us();
        let mut tasks = tasks;
        for td in &mut tasks {
            if td.submitted_at_us == 0 {
                td.submitted_at_us = now_us;
            }
        }
        core.base.insert_job(jd, tasks);
        Ok(())
    }

    pub fn handle_task_completion(&self, task_id: TaskId) {
        let mut core = self.inner.lock().unwrap();
        core.task_completion_locked(task_id);
    }

    pub fn handle_task_failure(&self, task_id: TaskId) {
        let mut core = self.inner.lock().unwrap();
        core.task_failure_locked(task_id);
    }

    pub fn handle_task_eviction(&self, task_id: TaskId, res_id: ResourceId) {
        let mut core = self.inner.lock().unwrap();
        core.task_eviction_locked(task_id, res_id);
    }

    pub fn handle_task_migration(&self, task_id: TaskId, res_id: ResourceId) {
        let mut core = self.inner.lock().unwrap();
        core.task_migration_locked(task_id, res_id);
    }

    pub fn handle_task_placement(&self, task_id: TaskId, res_id: ResourceId) {
        let mut core = self.inner.lock().unwrap();
        core.place_task_locked(task_id, res_id);
    }

    /// Feed the final report through the task's equivalence classes into the
    /// knowledge base.
    pub fn handle_task_final_report(&self, report: TaskFinalReport) {
        let core = self.inner.lock().unwrap();
        let ecs = core.flow_graph.cost_model().get_task_equiv_classes(report.task_id);
        core.base.knowledge_base.process_task_final_report(&ecs, &report);
    }

    pub fn handle_job_completion(&self, job_id: JobId) {
        let mut core = self.inner.lock().unwrap();
        core.job_completion_locked(job_id);
    }

    pub fn kill_running_task(&self, task_id: TaskId) {
        let mut core = self.inner.lock().unwrap();
        core.kill_running_task_locked(task_id);
    }

    /// Schedule a single job. Slow in a flow scheduler; prefer
    /// `schedule_all_jobs`.
    pub fn schedule_job(&self, job_id: JobId) -> anyhow::Result<u64> {
        warn!(
            "scheduling job {} on its own is slow in the flow scheduler; \
             consider schedule_all_jobs instead",
            job_id
        );
        let mut core = self.inner.lock().unwrap();
        core.schedule_jobs_locked(&[job_id])
    }

    pub fn schedule_jobs(&self, job_ids: &[JobId]) -> anyhow::Result<u64> {
        let mut core = self.inner.lock().unwrap();
        core.schedule_jobs_locked(job_ids)
    }

    /// One scheduling round over every job with outstanding work.
    pub fn schedule_all_jobs(&self) -> anyhow::Result<u64> {
        let mut core = self.inner.lock().unwrap();
        let jobs: Vec<JobId> = core.base.jobs_to_schedule.iter().copied().collect();
        core.schedule_jobs_locked(&jobs)
    }

    // ---- observation helpers ----

    pub fn task_binding(&self, task_id: TaskId) -> Option<ResourceId> {
        let core = self.inner.lock().unwrap();
        core.base.task_bindings.get(&task_id).copied()
    }

    /// Deltas of the most recent iteration, in application order.
    pub fn last_deltas(&self) -> Vec<SchedulingDelta> {
        let core = self.inner.lock().unwrap();
        core.last_deltas.clone()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let core = self.inner.lock().unwrap();
        core.flow_graph.check_invariants(&core.base.task_bindings);
    }
}

impl SchedulerCore {
    fn deregister_resource_locked(&mut self, res_id: ResourceId) -> anyhow::Result<()> {
        let removal = self
            .flow_graph
            .remove_machine(res_id)
            .map_err(|e| anyhow!("machine deregistration failed: {}", e))?;
        for task_id in &removal.evicted_tasks {
            self.base.unbind_task(*task_id);
            let mut tasks = self.base.task_map.write().unwrap();
            if let Some(td) = tasks.get_mut(task_id) {
                td.set_state(TaskState::Runnable);
                self.base.jobs_to_schedule.insert(td.job_id);
            }
        }
        self.base.remove_resources(&removal.removed_resources);
        self.update_cost_model_resource_stats();
        Ok(())
    }

    fn schedule_jobs_locked(&mut self, job_ids: &[JobId]) -> anyhow::Result<u64> {
        info!("START SCHEDULING {} jobs", job_ids.len());
        // statistics must be current before arcs depending on them are added
        self.update_cost_model_resource_stats();

        let mut job_ids: Vec<JobId> = job_ids.to_vec();
        job_ids.sort();
        job_ids.dedup();

        let mut run_scheduler = false;
        for job_id in &job_ids {
            let runnable = self.base.runnable_tasks_for_job(*job_id);
            if runnable.is_empty() {
                continue;
            }
            run_scheduler = true;
            let jd = {
                let jobs = self.base.job_map.read().unwrap();
                jobs.get(job_id).cloned()
            };
            if let Some(jd) = jd {
                self.flow_graph.add_or_update_job_nodes(&jd, &runnable);
            }
        }

        let mut num_scheduled = 0;
        if run_scheduler {
            num_scheduled = self.run_scheduling_iteration()?;
            info!("STOP SCHEDULING, placed {} tasks", num_scheduled);
            if self.parameters.debug_cost_model {
                self.log_debug_cost_model();
            }
            // placements may have moved reservations; reconsider arc sets
            for job_id in &job_ids {
                let runnable = self.base.runnable_tasks_for_job(*job_id);
                if runnable.is_empty() {
                    continue;
                }
                let jd = {
                    let jobs = self.base.job_map.read().unwrap();
                    jobs.get(job_id).cloned()
                };
                if let Some(jd) = jd {
                    self.flow_graph.add_or_update_job_nodes(&jd, &runnable);
                }
            }
        } else {
            self.last_deltas.clear();
            info!("STOP SCHEDULING, no runnable tasks");
        }
        Ok(num_scheduled)
    }

    /// The central algorithm: refresh costs, solve, convert the flow into
    /// deltas, apply them, refresh statistics.
    fn run_scheduling_iteration(&mut self) -> anyhow::Result<u64> {
        if self.dispatcher.seq_num() == 0 {
            self.update_cost_model_resource_stats();
        }

        let now_us = self.clock.now_us();
        if now_us.saturating_sub(self.last_updated_time_dependent_costs)
            >= self.parameters.time_dependent_cost_update_frequency
        {
            let jobs = self.base.active_jobs();
            debug!(
                "refreshing time-dependent costs for {} jobs at {}",
                jobs.len(),
                date_time::timestamp_us_str(now_us)
            );
            self.flow_graph.update_time_dependent_costs(&jobs);
            self.last_updated_time_dependent_costs = now_us;
        }

        let assignments = match self.dispatcher.run(&self.flow_graph) {
            Ok(assignments) => assignments,
            Err(e) => {
                // transient: zero placements, graph retained for next round
                error!("solver run failed: {}", e);
                self.last_deltas.clear();
                return Ok(0);
            }
        };

        let mut deltas: Vec<SchedulingDelta> = Vec::new();
        for (task_node_id, pu_node_id) in assignments {
            let src = self
                .flow_graph
                .node(task_node_id)
                .unwrap_or_else(|| panic!("solver returned unknown source node {}", task_node_id));
            let dst = self
                .flow_graph
                .node(pu_node_id)
                .unwrap_or_else(|| panic!("solver returned unknown destination {}", pu_node_id));
            if !src.node_type.is_task() {
                panic!("assignment source {} is not a task node", task_node_id);
            }
            if dst.node_type != FlowNodeType::Pu {
                panic!("assignment destination {} is not a PU", pu_node_id);
            }
            let task_id = src.task_id.expect("task node without task id");
            let res_id = dst.resource_id.expect("PU node without resource id");
            debug!("bind task {} to resource {}", task_id, res_id);

            let td = {
                let tasks = self.base.task_map.read().unwrap();
                tasks
                    .get(&task_id)
                    .cloned()
                    .unwrap_or_else(|| panic!("task {} unknown to the task map", task_id))
            };
            let rd = {
                let resources = self.base.resource_map.read().unwrap();
                resources.get(&res_id).cloned()
            };
            let rd = match rd {
                Some(rd) => rd,
                None => {
                    warn!("resource {} vanished before delta conversion", res_id);
                    continue;
                }
            };
            SolverDispatcher::node_binding_to_scheduling_delta(
                &td,
                &rd,
                &self.base.task_bindings,
                &mut deltas,
            );
        }

        // NOOPs never reach the application loop
        deltas.retain(|d| d.kind != DeltaKind::Noop);
        let mut deltas = collapse_migrations(deltas);

        let num_scheduled = self.apply_scheduling_deltas(&mut deltas);
        self.last_deltas = deltas.clone();

        deltas.retain(|d| !d.actioned);
        if !deltas.is_empty() {
            warn!("not all deltas were processed, {} remain:", deltas.len());
            for delta in &deltas {
                warn!(" * {}", delta);
            }
        }

        // placements change the statistics the cost models fold
        self.update_cost_model_resource_stats();
        Ok(num_scheduled)
    }

    fn apply_scheduling_deltas(&mut self, deltas: &mut [SchedulingDelta]) -> u64 {
        debug!("applying {} scheduling deltas", deltas.len());
        let mut num_scheduled = 0;
        for delta in deltas.iter_mut() {
            match delta.kind {
                DeltaKind::Noop => panic!("noop delta reached the application loop"),
                DeltaKind::Place => {
                    if self.place_task_locked(delta.task_id, delta.resource_id) {
                        delta.actioned = true;
                        num_scheduled += 1;
                    }
                }
                DeltaKind::Preempt => {
                    if self.task_eviction_locked(delta.task_id, delta.resource_id) {
                        delta.actioned = true;
                    }
                }
                DeltaKind::Migrate => {
                    if self.task_migration_locked(delta.task_id, delta.resource_id) {
                        delta.actioned = true;
                    }
                }
            }
        }
        num_scheduled
    }

    /// PLACE: bind through the base scheduler, then trim the task's arcs.
    fn place_task_locked(&mut self, task_id: TaskId, res_id: ResourceId) -> bool {
        let runnable = {
            let tasks = self.base.task_map.read().unwrap();
            tasks
                .get(&task_id)
                .map(|td| td.state == TaskState::Runnable)
                .unwrap_or(false)
        };
        if !runnable {
            warn!("skipping placement of task {}: no longer runnable", task_id);
            return false;
        }
        if !self.base.bind_task_to_resource(task_id, res_id) {
            return false;
        }
        if let Err(e) = self.flow_graph.task_scheduled(task_id, res_id) {
            panic!("graph rejected placement of task {}: {}", task_id, e);
        }
        true
    }

    fn task_completion_locked(&mut self, task_id: TaskId) {
        let job_id = {
            let mut tasks = self.base.task_map.write().unwrap();
            let td = match tasks.get_mut(&task_id) {
                Some(td) => td,
                None => {
                    warn!("completion for unknown task {}", task_id);
                    return;
                }
            };
            td.set_state(TaskState::Completed);
            td.job_id
        };
        self.base.unbind_task(task_id);
        self.flow_graph.task_completed(task_id);
        if self.base.job_tasks_all_terminal(job_id) {
            self.job_completion_locked(job_id);
        }
    }

    fn task_failure_locked(&mut self, task_id: TaskId) {
        let job_id = {
            let mut tasks = self.base.task_map.write().unwrap();
            let td = match tasks.get_mut(&task_id) {
                Some(td) => td,
                None => {
                    warn!("failure for unknown task {}", task_id);
                    return;
                }
            };
            td.attempt_count += 1;
            td.set_state(TaskState::Runnable);
            td.job_id
        };
        self.base.unbind_task(task_id);
        self.flow_graph.task_failed(task_id);
        self.base.jobs_to_schedule.insert(job_id);
    }

    /// PREEMPT: vacate the resource and restore the task's unscheduled arcs.
    fn task_eviction_locked(&mut self, task_id: TaskId, res_id: ResourceId) -> bool {
        if !self.base.evict_through_executor(task_id, res_id) {
            warn!("executor refused eviction of task {}", task_id);
            return false;
        }
        self.base.unbind_task(task_id);
        let job_id = {
            let mut tasks = self.base.task_map.write().unwrap();
            match tasks.get_mut(&task_id) {
                Some(td) => {
                    td.set_state(TaskState::Runnable);
                    Some(td.job_id)
                }
                None => None,
            }
        };
        if let Err(e) = self.flow_graph.task_evicted(task_id, res_id) {
            warn!("graph eviction of task {} failed: {}", task_id, e);
        }
        if let Some(job_id) = job_id {
            self.base.jobs_to_schedule.insert(job_id);
        }
        true
    }

    /// MIGRATE: move the binding; the old resource id is read before the
    /// binding table changes.
    fn task_migration_locked(&mut self, task_id: TaskId, new_res_id: ResourceId) -> bool {
        let old_res_id = match self.base.task_bindings.get(&task_id) {
            Some(res) => *res,
            None => {
                warn!("migration for unbound task {}", task_id);
                return false;
            }
        };
        if !self.base.evict_through_executor(task_id, old_res_id) {
            return false;
        }
        self.base.unbind_task(task_id);
        {
            let mut tasks = self.base.task_map.write().unwrap();
            if let Some(td) = tasks.get_mut(&task_id) {
                td.set_state(TaskState::Runnable);
            }
        }
        if !self.base.bind_task_to_resource(task_id, new_res_id) {
            warn!("migration target refused task {}", task_id);
            return false;
        }
        if let Err(e) = self.flow_graph.task_migrated(task_id, old_res_id, new_res_id) {
            panic!("graph rejected migration of task {}: {}", task_id, e);
        }
        true
    }

    fn job_completion_locked(&mut self, job_id: JobId) {
        {
            let mut jobs = self.base.job_map.write().unwrap();
            match jobs.get_mut(&job_id) {
                Some(jd) => {
                    if !jd.state.is_terminal() {
                        jd.state = JobState::Completed;
                    }
                }
                None => {
                    warn!("completion for unknown job {}", job_id);
                    return;
                }
            }
        }
        self.flow_graph.job_completed(job_id);
        self.base.jobs_to_schedule.remove(&job_id);
        info!("job {} completed", job_id);
    }

    fn kill_running_task_locked(&mut self, task_id: TaskId) {
        if !self.base.kill_through_executor(task_id) {
            warn!("executor refused kill of task {}", task_id);
            return;
        }
        self.base.unbind_task(task_id);
        {
            let mut tasks = self.base.task_map.write().unwrap();
            if let Some(td) = tasks.get_mut(&task_id) {
                td.set_state(TaskState::Aborted);
            }
        }
        self.flow_graph.task_killed(task_id);
    }

    /// Only cost models that fold aggregate topology statistics pay for the
    /// traversal.
    fn update_cost_model_resource_stats(&mut self) {
        if self.flow_graph.cost_model().uses_topology_stats() {
            debug!("updating resource statistics in flow graph");
            self.flow_graph.compute_topology_statistics();
        } else {
            debug!("no resource stats update required");
        }
    }

    /// Best effort: scheduling continues when the dump cannot be written.
    fn log_debug_cost_model(&self) {
        let path = Path::new(&self.parameters.debug_output_dir)
            .join(format!("cost_model_{}.csv", self.dispatcher.seq_num()));
        let csv = self.flow_graph.cost_model().debug_info_csv();
        if let Err(e) = std::fs::write(&path, csv) {
            warn!("failed to write cost model debug info to {:?}: {}", path, e);
        }
    }
}

/// Collapse an adjacent PREEMPT/PLACE pair for the same task into MIGRATE.
fn collapse_migrations(deltas: Vec<SchedulingDelta>) -> Vec<SchedulingDelta> {
    let mut out: Vec<SchedulingDelta> = Vec::with_capacity(deltas.len());
    let mut iter = deltas.into_iter().peekable();
    while let Some(delta) = iter.next() {
        if delta.kind == DeltaKind::Preempt {
            if let Some(next) = iter.peek() {
                if next.kind == DeltaKind::Place && next.task_id == delta.task_id {
                    let place = iter.next().unwrap();
                    out.push(SchedulingDelta::new(
                        DeltaKind::Migrate,
                        place.task_id,
                        place.resource_id,
                    ));
                    continue;
                }
            }
        }
        out.push(delta);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::core::config::SchedulingParameters;
    use crate::core::descriptor::{
        JobDescriptor, ResourceDescriptor, ResourceTopologyNode, TaskDescriptor, TaskState,
    };
    use crate::core::runtime::{JobId, ResourceId, TaskId};
    use crate::scheduling::cost_model::CostModel;
    use crate::scheduling::event_driven::{ExecutorBackend, NoopExecutor};
    use crate::scheduling::flow_scheduler::FlowScheduler;
    use crate::scheduling::knowledge_base::InMemoryKnowledgeBase;
    use crate::scheduling::solver::in_process::InProcessSolver;
    use crate::scheduling::DeltaKind;
    use crate::utils::clock::SettableClock;

    fn topology(machines: &[(&str, u32)]) -> ResourceTopologyNode {
        let mut cluster = ResourceTopologyNode::empty_cluster("cluster");
        for (name, pus) in machines {
            cluster.children.push(ResourceTopologyNode::machine(name, *pus));
        }
        cluster
    }

    fn scheduler(topology: &ResourceTopologyNode) -> (FlowScheduler, Arc<SettableClock>) {
        let clock = SettableClock::new(1_000_000);
        let scheduler = FlowScheduler::with_solver(
            SchedulingParameters::default(),
            topology,
            Box::new(NoopExecutor::default()),
            Arc::new(InMemoryKnowledgeBase::new()),
            clock.clone(),
            Box::new(InProcessSolver::default()),
        )
        .unwrap();
        (scheduler, clock)
    }

    fn job(job_id: u64, task_ids: &[u64]) -> (JobDescriptor, Vec<TaskDescriptor>) {
        let mut jd = JobDescriptor::new(JobId(job_id), "job", TaskId(task_ids[0]));
        jd.tasks = task_ids.iter().map(|t| TaskId(*t)).collect();
        let tasks = task_ids
            .iter()
            .map(|t| TaskDescriptor::new(TaskId(*t), JobId(job_id), &format!("task_{}", t), 0))
            .collect();
        (jd, tasks)
    }

    #[test]
    pub fn empty_cluster_place_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();

        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 1);
        let deltas = scheduler.last_deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Place);
        assert!(deltas[0].actioned);
        assert!(scheduler.task_binding(TaskId(10)).is_some());
        scheduler.check_invariants();

        // a second iteration with no new events produces zero deltas
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);
        assert!(scheduler.last_deltas().is_empty());
        scheduler.check_invariants();
    }

    #[test]
    pub fn saturation_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10, 11, 12]);
        scheduler.submit_job(jd, tasks).unwrap();

        // iteration 1: both PUs fill up
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 2);
        let place_deltas: Vec<_> = scheduler
            .last_deltas()
            .into_iter()
            .filter(|d| d.kind == DeltaKind::Place)
            .collect();
        assert_eq!(place_deltas.len(), 2);
        scheduler.check_invariants();

        // iteration 2: nothing moves
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);
        assert!(scheduler.last_deltas().is_empty());
        scheduler.check_invariants();

        // iteration 3: a slot frees up, the third task lands
        let bound: Vec<TaskId> = [TaskId(10), TaskId(11), TaskId(12)]
            .iter()
            .filter(|t| scheduler.task_binding(**t).is_some())
            .copied()
            .collect();
        assert_eq!(bound.len(), 2);
        scheduler.handle_task_completion(bound[0]);
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 1);
        scheduler.check_invariants();
    }

    #[test]
    pub fn completion_race_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();
        assert!(scheduler.task_binding(TaskId(10)).is_some());

        // completion lands before the next iteration; no delta may mention
        // the task again
        scheduler.handle_task_completion(TaskId(10));
        scheduler.schedule_all_jobs().unwrap();
        assert!(scheduler
            .last_deltas()
            .iter()
            .all(|d| d.task_id != TaskId(10)));
        scheduler.check_invariants();
    }

    #[test]
    pub fn machine_removal_test() {
        let m0 = ResourceTopologyNode::machine("m0", 2);
        let m0_id = m0.descriptor.uid;
        let mut topo = ResourceTopologyNode::empty_cluster("cluster");
        topo.children.push(m0);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();
        assert!(scheduler.task_binding(TaskId(10)).is_some());

        scheduler.deregister_resource(m0_id).unwrap();
        assert!(scheduler.task_binding(TaskId(10)).is_none());
        scheduler.check_invariants();

        // with no machines left the task stays unscheduled
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);

        // a fresh machine picks it up again
        let m1 = ResourceTopologyNode::machine("m1", 2);
        scheduler.register_resource(&m1).unwrap();
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 1);
        scheduler.check_invariants();
    }

    #[test]
    pub fn determinism_test() {
        let topo = topology(&[("m0", 2), ("m1", 2)]);

        let run = || {
            let (scheduler, clock) = scheduler(&topo);
            let mut log: Vec<String> = Vec::new();
            let (jd, tasks) = job(1, &[10, 11, 12]);
            scheduler.submit_job(jd, tasks).unwrap();
            scheduler.schedule_all_jobs().unwrap();
            log.extend(scheduler.last_deltas().iter().map(|d| d.to_string()));
            clock.advance(20_000_000);
            let (jd2, tasks2) = job(2, &[20, 21]);
            scheduler.submit_job(jd2, tasks2).unwrap();
            scheduler.schedule_all_jobs().unwrap();
            log.extend(scheduler.last_deltas().iter().map(|d| d.to_string()));
            scheduler.handle_task_completion(TaskId(10));
            scheduler.schedule_all_jobs().unwrap();
            log.extend(scheduler.last_deltas().iter().map(|d| d.to_string()));
            log
        };

        assert_eq!(run(), run());
    }

    #[test]
    pub fn executor_refusal_leaves_delta_unactioned_test() {
        #[derive(Default)]
        struct RefusingExecutor;
        impl ExecutorBackend for RefusingExecutor {
            fn place_task(&mut self, _td: &TaskDescriptor, _rd: &ResourceDescriptor) -> bool {
                false
            }
            fn evict_task(&mut self, _td: &TaskDescriptor, _rd: &ResourceDescriptor) -> bool {
                true
            }
            fn kill_task(&mut self, _td: &TaskDescriptor) -> bool {
                true
            }
        }

        let topo = topology(&[("m0", 2)]);
        let clock = SettableClock::new(1_000_000);
        let scheduler = FlowScheduler::with_solver(
            SchedulingParameters::default(),
            &topo,
            Box::new(RefusingExecutor::default()),
            Arc::new(InMemoryKnowledgeBase::new()),
            clock,
            Box::new(InProcessSolver::default()),
        )
        .unwrap();

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);
        let deltas = scheduler.last_deltas();
        assert_eq!(deltas.len(), 1);
        assert!(!deltas[0].actioned);
        assert!(scheduler.task_binding(TaskId(10)).is_none());
    }

    #[test]
    pub fn task_failure_requeues_test() {
        let topo = topology(&[("m0", 1)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();
        assert!(scheduler.task_binding(TaskId(10)).is_some());

        scheduler.handle_task_failure(TaskId(10));
        assert!(scheduler.task_binding(TaskId(10)).is_none());
        scheduler.check_invariants();

        // the task is retried on the next round
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 1);
        scheduler.check_invariants();
    }

    #[test]
    pub fn job_completion_discards_late_submission_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd.clone(), tasks.clone()).unwrap();
        scheduler.schedule_all_jobs().unwrap();
        scheduler.handle_task_completion(TaskId(10));

        // the job auto-completed; a racing resubmission is dropped
        scheduler.submit_job(jd, tasks).unwrap();
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);
        scheduler.check_invariants();
    }

    #[test]
    pub fn unscheduled_cost_monotone_between_iterations_test() {
        let topo = topology(&[("m0", 1)]);
        let (scheduler, clock) = scheduler(&topo);

        // two tasks, one PU: one task stays unscheduled
        let (jd, tasks) = job(1, &[10, 11]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();

        let cost_before = {
            let core = scheduler.inner.lock().unwrap();
            let pending = if core.base.task_bindings.contains_key(&TaskId(10)) {
                TaskId(11)
            } else {
                TaskId(10)
            };
            (pending, core.flow_graph.cost_model().task_to_unscheduled_agg_cost(pending))
        };
        clock.advance(30_000_000);
        scheduler.schedule_all_jobs().unwrap();
        let cost_after = {
            let core = scheduler.inner.lock().unwrap();
            core.flow_graph
                .cost_model()
                .task_to_unscheduled_agg_cost(cost_before.0)
        };
        assert!(cost_after >= cost_before.1);
    }

    #[test]
    pub fn kill_does_not_requeue_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10, 11]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();

        scheduler.kill_running_task(TaskId(10));
        assert!(scheduler.task_binding(TaskId(10)).is_none());
        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 0);
        assert!(scheduler
            .last_deltas()
            .iter()
            .all(|d| d.task_id != TaskId(10)));
        scheduler.check_invariants();
    }

    #[test]
    pub fn eviction_restores_unscheduled_route_test() {
        let topo = topology(&[("m0", 2)]);
        let (scheduler, _clock) = scheduler(&topo);

        let (jd, tasks) = job(1, &[10]);
        scheduler.submit_job(jd, tasks).unwrap();
        scheduler.schedule_all_jobs().unwrap();
        let res = scheduler.task_binding(TaskId(10)).unwrap();

        scheduler.handle_task_eviction(TaskId(10), res);
        assert!(scheduler.task_binding(TaskId(10)).is_none());
        scheduler.check_invariants();

        let placed = scheduler.schedule_all_jobs().unwrap();
        assert_eq!(placed, 1);
        scheduler.check_invariants();
    }
}
