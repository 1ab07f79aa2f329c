use crate::core::runtime::{JobId, ResourceId, TaskId};

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// waiting for a placement decision
    Runnable,
    /// bound to a processing unit
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted
        )
    }

    fn can_transition_to(&self, to: TaskState) -> bool {
        match (self, to) {
            (TaskState::Runnable, TaskState::Running) => true,
            // eviction and failed attempts return the task to the queue
            (TaskState::Running, TaskState::Runnable) => true,
            (TaskState::Running, TaskState::Completed) => true,
            (TaskState::Running, TaskState::Failed) => true,
            (TaskState::Runnable, TaskState::Failed) => true,
            (_, TaskState::Aborted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Runnable => write!(f, "Runnable"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Completed => write!(f, "Completed"),
            TaskState::Failed => write!(f, "Failed"),
            TaskState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Multi-dimensional resource amount (request or capacity).
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Default)]
pub struct ResourceVector {
    pub cpu_millicores: u64,
    pub ram_mb: u64,
}

impl ResourceVector {
    pub fn new(cpu_millicores: u64, ram_mb: u64) -> Self {
        ResourceVector {
            cpu_millicores,
            ram_mb,
        }
    }

    pub fn add(&mut self, other: &ResourceVector) {
        self.cpu_millicores += other.cpu_millicores;
        self.ram_mb += other.ram_mb;
    }

    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.cpu_millicores <= capacity.cpu_millicores && self.ram_mb <= capacity.ram_mb
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TaskDescriptor {
    pub uid: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub state: TaskState,
    /// submission timestamp, micros
    pub submitted_at_us: u64,
    /// resource reservation request
    pub request: ResourceVector,
    /// bytes of input data, drives locality preferences
    pub input_size_bytes: u64,
    pub attempt_count: u32,
}

impl TaskDescriptor {
    pub fn new(uid: TaskId, job_id: JobId, name: &str, submitted_at_us: u64) -> Self {
        TaskDescriptor {
            uid,
            job_id,
            name: name.to_string(),
            state: TaskState::Runnable,
            submitted_at_us,
            request: ResourceVector::default(),
            input_size_bytes: 0,
            attempt_count: 0,
        }
    }

    /// Apply a lifecycle transition.
    ///
    /// Panics on a transition outside the task state machine; such a call
    /// indicates a scheduler bug, not an input error.
    pub fn set_state(&mut self, to: TaskState) {
        if !self.state.can_transition_to(to) {
            panic!(
                "illegal task state transition {} -> {} for task {}",
                self.state, to, self.uid
            );
        }
        self.state = to;
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Aborted => write!(f, "Aborted"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct JobDescriptor {
    pub uid: JobId,
    pub name: String,
    pub state: JobState,
    /// the task that spawns the rest of the job
    pub root_task: TaskId,
    pub tasks: Vec<TaskId>,
}

impl JobDescriptor {
    pub fn new(uid: JobId, name: &str, root_task: TaskId) -> Self {
        JobDescriptor {
            uid,
            name: name.to_string(),
            state: JobState::Pending,
            root_task,
            tasks: vec![root_task],
        }
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum ResourceType {
    /// topology root, doubles as the cluster aggregator
    Cluster,
    Machine,
    Socket,
    Core,
    /// leaf processing unit, typically one hardware thread
    Pu,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Cluster => write!(f, "Cluster"),
            ResourceType::Machine => write!(f, "Machine"),
            ResourceType::Socket => write!(f, "Socket"),
            ResourceType::Core => write!(f, "Core"),
            ResourceType::Pu => write!(f, "Pu"),
        }
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Idle,
    Busy,
    Lost,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ResourceDescriptor {
    pub uid: ResourceId,
    pub friendly_name: String,
    pub resource_type: ResourceType,
    pub state: ResourceState,
    pub capacity: ResourceVector,
}

impl ResourceDescriptor {
    pub fn new(uid: ResourceId, friendly_name: &str, resource_type: ResourceType) -> Self {
        ResourceDescriptor {
            uid,
            friendly_name: friendly_name.to_string(),
            resource_type,
            state: ResourceState::Idle,
            capacity: ResourceVector::default(),
        }
    }
}

/// Machine topology tree as delivered by resource registration.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ResourceTopologyNode {
    pub descriptor: ResourceDescriptor,
    pub children: Vec<ResourceTopologyNode>,
}

impl ResourceTopologyNode {
    pub fn new(descriptor: ResourceDescriptor) -> Self {
        ResourceTopologyNode {
            descriptor,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.descriptor.resource_type == ResourceType::Pu
    }

    /// Pre-order walk over the subtree.
    pub fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(&ResourceTopologyNode),
    {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    pub fn num_leaves(&self) -> u64 {
        if self.is_leaf() {
            1
        } else {
            self.children.iter().map(|c| c.num_leaves()).sum()
        }
    }

    /// Build a cluster root with no machines attached yet.
    pub fn empty_cluster(name: &str) -> Self {
        ResourceTopologyNode::new(ResourceDescriptor::new(
            ResourceId::generate(),
            name,
            ResourceType::Cluster,
        ))
    }

    /// Build a flat machine subtree with `num_pus` processing units.
    pub fn machine(name: &str, num_pus: u32) -> Self {
        let mut machine = ResourceTopologyNode::new(ResourceDescriptor::new(
            ResourceId::generate(),
            name,
            ResourceType::Machine,
        ));
        for i in 0..num_pus {
            machine
                .children
                .push(ResourceTopologyNode::new(ResourceDescriptor::new(
                    ResourceId::generate(),
                    &format!("{}_pu{}", name, i),
                    ResourceType::Pu,
                )));
        }
        machine
    }
}

/// Final statistics delivered by an executor when a task finishes.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct TaskFinalReport {
    pub task_id: TaskId,
    pub runtime_us: u64,
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use crate::core::descriptor::{
        ResourceTopologyNode, TaskDescriptor, TaskState, ResourceType,
    };
    use crate::core::runtime::{JobId, TaskId};

    #[test]
    pub fn task_state_transition_test() {
        let mut td = TaskDescriptor::new(TaskId(1), JobId(1), "t", 0);
        td.set_state(TaskState::Running);
        td.set_state(TaskState::Runnable);
        td.set_state(TaskState::Running);
        td.set_state(TaskState::Completed);
    }

    #[test]
    #[should_panic]
    pub fn task_state_illegal_transition_test() {
        let mut td = TaskDescriptor::new(TaskId(1), JobId(1), "t", 0);
        td.set_state(TaskState::Completed);
    }

    #[test]
    pub fn machine_topology_test() {
        let machine = ResourceTopologyNode::machine("m0", 4);
        assert_eq!(machine.num_leaves(), 4);
        assert_eq!(machine.descriptor.resource_type, ResourceType::Machine);

        let mut count = 0;
        machine.visit(&mut |_n| count += 1);
        assert_eq!(count, 5);
    }
}
