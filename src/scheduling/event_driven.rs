//! Base-scheduler contract shared by event-driven scheduler flavours:
//! the task/job/resource stores, the authoritative task-binding table and
//! the executor hooks that realize placement decisions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::core::descriptor::{
    JobDescriptor, JobState, ResourceDescriptor, ResourceState, TaskDescriptor, TaskState,
};
use crate::core::runtime::{JobId, ResourceId, TaskId};
use crate::scheduling::knowledge_base::KnowledgeBase;
use crate::scheduling::{JobMap, ResourceMap, TaskMap};

/// External layer that actually launches and stops tasks on bound
/// resources. A refusal leaves the corresponding delta un-actioned; the
/// solver reconsiders on the next iteration.
pub trait ExecutorBackend: Send {
    fn place_task(&mut self, td: &TaskDescriptor, rd: &ResourceDescriptor) -> bool;
    fn evict_task(&mut self, td: &TaskDescriptor, rd: &ResourceDescriptor) -> bool;
    fn kill_task(&mut self, td: &TaskDescriptor) -> bool;
}

/// Accepts every action; the default for deployments where launch failures
/// surface as task failure events instead.
#[derive(Debug, Default)]
pub struct NoopExecutor;

impl ExecutorBackend for NoopExecutor {
    fn place_task(&mut self, _td: &TaskDescriptor, _rd: &ResourceDescriptor) -> bool {
        true
    }

    fn evict_task(&mut self, _td: &TaskDescriptor, _rd: &ResourceDescriptor) -> bool {
        true
    }

    fn kill_task(&mut self, _td: &TaskDescriptor) -> bool {
        true
    }
}

pub struct EventDrivenCore {
    pub task_map: TaskMap,
    pub job_map: JobMap,
    pub resource_map: ResourceMap,
    /// task -> processing unit it currently occupies
    pub task_bindings: HashMap<TaskId, ResourceId>,
    /// jobs with work the next iteration should consider
    pub jobs_to_schedule: BTreeSet<JobId>,
    pub knowledge_base: Arc<dyn KnowledgeBase>,
    executor: Box<dyn ExecutorBackend>,
}

impl EventDrivenCore {
    pub fn new(executor: Box<dyn ExecutorBackend>, knowledge_base: Arc<dyn KnowledgeBase>) -> Self {
        EventDrivenCore {
            task_map: Arc::new(RwLock::new(HashMap::new())),
            job_map: Arc::new(RwLock::new(HashMap::new())),
            resource_map: Arc::new(RwLock::new(HashMap::new())),
            task_bindings: HashMap::new(),
            jobs_to_schedule: BTreeSet::new(),
            knowledge_base,
            executor,
        }
    }

    /// Register a job and its tasks. Submissions racing a completed job are
    /// silently discarded.
    pub fn insert_job(&mut self, jd: JobDescriptor, tasks: Vec<TaskDescriptor>) -> bool {
        {
            let jobs = self.job_map.read().unwrap();
            if let Some(existing) = jobs.get(&jd.uid) {
                if existing.state.is_terminal() {
                    debug!("dropping submission for terminal job {}", jd.uid);
                    return false;
                }
            }
        }
        let job_id = jd.uid;
        self.job_map.write().unwrap().insert(job_id, jd);
        let mut task_map = self.task_map.write().unwrap();
        for td in tasks {
            task_map.entry(td.uid).or_insert(td);
        }
        self.jobs_to_schedule.insert(job_id);
        true
    }

    /// Runnable tasks of a job, ascending by id for stable iteration order.
    pub fn runnable_tasks_for_job(&self, job_id: JobId) -> Vec<TaskId> {
        let jobs = self.job_map.read().unwrap();
        let tasks = self.task_map.read().unwrap();
        let mut runnable: Vec<TaskId> = jobs
            .get(&job_id)
            .map(|jd| {
                jd.tasks
                    .iter()
                    .filter(|t| {
                        tasks
                            .get(*t)
                            .map(|td| td.state == TaskState::Runnable)
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        runnable.sort();
        runnable
    }

    /// Bind through the executor and record the binding. Returns false when
    /// the executor refuses.
    pub fn bind_task_to_resource(&mut self, task_id: TaskId, res_id: ResourceId) -> bool {
        let accepted = {
            let tasks = self.task_map.read().unwrap();
            let resources = self.resource_map.read().unwrap();
            let td = match tasks.get(&task_id) {
                Some(td) => td,
                None => return false,
            };
            let rd = match resources.get(&res_id) {
                Some(rd) => rd,
                None => return false,
            };
            self.executor.place_task(td, rd)
        };
        if !accepted {
            warn!("executor refused placement of task {} on {}", task_id, res_id);
            return false;
        }
        self.task_bindings.insert(task_id, res_id);
        {
            let mut tasks = self.task_map.write().unwrap();
            tasks.get_mut(&task_id).unwrap().set_state(TaskState::Running);
        }
        {
            let mut resources = self.resource_map.write().unwrap();
            if let Some(rd) = resources.get_mut(&res_id) {
                rd.state = ResourceState::Busy;
            }
        }
        self.mark_job_running(task_id);
        true
    }

    fn mark_job_running(&self, task_id: TaskId) {
        let job_id = {
            let tasks = self.task_map.read().unwrap();
            match tasks.get(&task_id) {
                Some(td) => td.job_id,
                None => return,
            }
        };
        let mut jobs = self.job_map.write().unwrap();
        if let Some(jd) = jobs.get_mut(&job_id) {
            if jd.state == JobState::Pending {
                jd.state = JobState::Running;
            }
        }
    }

    /// Ask the executor to vacate the resource; the binding stays intact
    /// until `unbind_task` so callers can still observe it.
    pub fn evict_through_executor(&mut self, task_id: TaskId, res_id: ResourceId) -> bool {
        let tasks = self.task_map.read().unwrap();
        let resources = self.resource_map.read().unwrap();
        match (tasks.get(&task_id), resources.get(&res_id)) {
            (Some(td), Some(rd)) => self.executor.evict_task(td, rd),
            _ => true,
        }
    }

    pub fn kill_through_executor(&mut self, task_id: TaskId) -> bool {
        let tasks = self.task_map.read().unwrap();
        match tasks.get(&task_id) {
            Some(td) => self.executor.kill_task(td),
            None => true,
        }
    }

    /// Drop the binding and idle the resource.
    pub fn unbind_task(&mut self, task_id: TaskId) -> Option<ResourceId> {
        let res_id = self.task_bindings.remove(&task_id)?;
        let mut resources = self.resource_map.write().unwrap();
        if let Some(rd) = resources.get_mut(&res_id) {
            rd.state = ResourceState::Idle;
        }
        Some(res_id)
    }

    /// Register every descriptor of a topology subtree.
    pub fn insert_resource_subtree(&self, root: &crate::core::descriptor::ResourceTopologyNode) {
        let mut resources = self.resource_map.write().unwrap();
        root.visit(&mut |node| {
            resources
                .entry(node.descriptor.uid)
                .or_insert_with(|| node.descriptor.clone());
        });
    }

    pub fn remove_resources(&self, removed: &[ResourceId]) {
        let mut resources = self.resource_map.write().unwrap();
        for res in removed {
            resources.remove(res);
        }
    }

    /// True when every task of the job reached a terminal state.
    pub fn job_tasks_all_terminal(&self, job_id: JobId) -> bool {
        let jobs = self.job_map.read().unwrap();
        let tasks = self.task_map.read().unwrap();
        match jobs.get(&job_id) {
            Some(jd) => jd.tasks.iter().all(|t| {
                tasks
                    .get(t)
                    .map(|td| td.state.is_terminal())
                    .unwrap_or(true)
            }),
            None => false,
        }
    }

    /// Non-terminal jobs, ascending by id.
    pub fn active_jobs(&self) -> Vec<JobId> {
        let jobs = self.job_map.read().unwrap();
        let mut active: Vec<JobId> = jobs
            .values()
            .filter(|jd| !jd.state.is_terminal())
            .map(|jd| jd.uid)
            .collect();
        active.sort();
        active
    }
}

/// Shared set of live leaf processing units, handed to the flow graph and
/// the cost models.
pub fn new_leaf_resource_set() -> crate::scheduling::LeafResourceIds {
    Arc::new(RwLock::new(HashSet::new()))
}
