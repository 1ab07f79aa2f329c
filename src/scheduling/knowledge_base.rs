use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::descriptor::TaskFinalReport;
use crate::core::runtime::EquivClass;

/// Read-only oracle over task runtime statistics.
///
/// The scheduler feeds final reports in through
/// `process_task_final_report`; the cost models read aggregated estimates
/// back out.
pub trait KnowledgeBase: Send + Sync {
    /// Mean observed runtime for tasks of the class, micros.
    fn average_runtime_for_ec(&self, ec: EquivClass) -> Option<u64>;

    /// Mean observed runtime of a task class on a machine class, micros.
    fn runtime_for_ec_pair(&self, task_ec: EquivClass, machine_ec: EquivClass) -> Option<u64>;

    fn process_task_final_report(&self, equiv_classes: &[EquivClass], report: &TaskFinalReport);
}

#[derive(Debug, Default)]
pub struct InMemoryKnowledgeBase {
    /// ec -> (sum of runtimes, sample count)
    runtime_samples: RwLock<HashMap<EquivClass, (u64, u64)>>,
    pair_samples: RwLock<HashMap<(EquivClass, EquivClass), (u64, u64)>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        InMemoryKnowledgeBase::default()
    }

    /// Seed an interference sample, used by tests and trace replay.
    pub fn record_ec_pair_sample(&self, task_ec: EquivClass, machine_ec: EquivClass, runtime_us: u64) {
        let mut samples = self.pair_samples.write().unwrap();
        let entry = samples.entry((task_ec, machine_ec)).or_insert((0, 0));
        entry.0 += runtime_us;
        entry.1 += 1;
    }
}

impl KnowledgeBase for InMemoryKnowledgeBase {
    fn average_runtime_for_ec(&self, ec: EquivClass) -> Option<u64> {
        let samples = self.runtime_samples.read().unwrap();
        samples.get(&ec).map(|&(sum, count)| sum / count.max(1))
    }

    fn runtime_for_ec_pair(&self, task_ec: EquivClass, machine_ec: EquivClass) -> Option<u64> {
        let samples = self.pair_samples.read().unwrap();
        match samples.get(&(task_ec, machine_ec)) {
            Some(&(sum, count)) => Some(sum / count.max(1)),
            None => {
                drop(samples);
                self.average_runtime_for_ec(task_ec)
            }
        }
    }

    fn process_task_final_report(&self, equiv_classes: &[EquivClass], report: &TaskFinalReport) {
        let mut samples = self.runtime_samples.write().unwrap();
        for ec in equiv_classes {
            let entry = samples.entry(*ec).or_insert((0, 0));
            entry.0 += report.runtime_us;
            entry.1 += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::descriptor::TaskFinalReport;
    use crate::core::runtime::{EquivClass, TaskId};
    use crate::scheduling::knowledge_base::{InMemoryKnowledgeBase, KnowledgeBase};

    #[test]
    pub fn runtime_average_test() {
        let kb = InMemoryKnowledgeBase::new();
        let ec = EquivClass(7);
        assert_eq!(kb.average_runtime_for_ec(ec), None);

        for runtime_us in [100, 200, 300] {
            kb.process_task_final_report(
                &[ec],
                &TaskFinalReport {
                    task_id: TaskId(1),
                    runtime_us,
                    exit_code: 0,
                },
            );
        }
        assert_eq!(kb.average_runtime_for_ec(ec), Some(200));
    }
}
