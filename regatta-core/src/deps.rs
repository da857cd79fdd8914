use async_trait::async_trait;
use regatta_model::condition::Condition;
use regatta_model::instance::{InstanceId, TaskId};
use regatta_model::path::PathId;
use regatta_model::run_spec::RunSpec;

/// A task status as submitted to the offer layer for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub condition: Condition,
}

/// The launch side of the offer layer: asks for `count` more instances of a
/// spec to be matched against incoming resource offers.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    async fn add(&self, spec: RunSpec, count: u32);
    /// Drop any queued demand for a run spec.
    async fn purge(&self, run_spec_id: &PathId);
}

/// Kill and reconcile operations against the offer layer. Both are
/// fire-and-forget: outcomes arrive later as task status updates.
#[async_trait]
pub trait OfferLayer: Send + Sync {
    async fn kill_task(&self, task_id: &TaskId);
    /// Submit statuses for explicit reconciliation. An empty list is the
    /// sentinel that a reconciliation round is complete.
    async fn reconcile(&self, statuses: Vec<TaskStatus>);
}

/// External health check scheduling. The executor hands it the full app list
/// whenever leadership is (re)gained so probes match the persisted state.
#[async_trait]
pub trait HealthCheckManager: Send + Sync {
    async fn reconcile_with(&self, run_specs: Vec<RunSpec>);
}

/// Executes a spec's readiness checks against one instance during a
/// deployment. The step runner starts a probe per active instance of a
/// readiness-gated spec and writes the verdict into the tracker, where the
/// capacity counts pick it up.
#[async_trait]
pub trait ReadinessProvider: Send + Sync {
    /// Probe until the instance's readiness checks all pass. Resolves `true`
    /// once they do, `false` if the probes can never succeed (for example
    /// because the instance is gone).
    async fn await_ready(&self, spec: &RunSpec, instance_id: &InstanceId) -> bool;
}

pub mod doubles {
    //! In-process collaborator stand-ins for tests.

    use super::*;
    use regatta_model::instance::TaskId;
    use tokio::sync::Mutex;

    /// Records launch demand without matching anything.
    #[derive(Default)]
    pub struct RecordingLaunchQueue {
        pub added: Mutex<Vec<(PathId, u32)>>,
        pub purged: Mutex<Vec<PathId>>,
    }

    #[async_trait]
    impl LaunchQueue for RecordingLaunchQueue {
        async fn add(&self, spec: RunSpec, count: u32) {
            self.added.lock().await.push((spec.id().clone(), count));
        }

        async fn purge(&self, run_spec_id: &PathId) {
            self.purged.lock().await.push(run_spec_id.clone());
        }
    }

    /// Records kills and reconciliation batches.
    #[derive(Default)]
    pub struct RecordingOfferLayer {
        pub killed: Mutex<Vec<TaskId>>,
        pub reconciled: Mutex<Vec<Vec<TaskStatus>>>,
    }

    #[async_trait]
    impl OfferLayer for RecordingOfferLayer {
        async fn kill_task(&self, task_id: &TaskId) {
            self.killed.lock().await.push(task_id.clone());
        }

        async fn reconcile(&self, statuses: Vec<TaskStatus>) {
            self.reconciled.lock().await.push(statuses);
        }
    }

    #[derive(Default)]
    pub struct RecordingHealthCheckManager {
        pub reconciled_with: Mutex<Vec<Vec<PathId>>>,
    }

    #[async_trait]
    impl HealthCheckManager for RecordingHealthCheckManager {
        async fn reconcile_with(&self, run_specs: Vec<RunSpec>) {
            let ids = run_specs.iter().map(|s| s.id().clone()).collect();
            self.reconciled_with.lock().await.push(ids);
        }
    }

    /// Readiness provider that reports every instance ready on the first
    /// probe. The right default wherever readiness is not under test.
    pub struct ImmediateReadiness;

    #[async_trait]
    impl ReadinessProvider for ImmediateReadiness {
        async fn await_ready(&self, _spec: &RunSpec, _instance_id: &InstanceId) -> bool {
            true
        }
    }

    /// Readiness provider that parks every probe until the test reports a
    /// verdict for the instance.
    #[derive(Default)]
    pub struct ManualReadinessProvider {
        ready: Mutex<std::collections::HashSet<InstanceId>>,
        changed: tokio::sync::Notify,
    }

    impl ManualReadinessProvider {
        pub async fn report_ready(&self, instance_id: InstanceId) {
            self.ready.lock().await.insert(instance_id);
            self.changed.notify_waiters();
        }
    }

    #[async_trait]
    impl ReadinessProvider for ManualReadinessProvider {
        async fn await_ready(&self, _spec: &RunSpec, instance_id: &InstanceId) -> bool {
            loop {
                // register for wakeups before checking, or a report landing
                // in between would be missed
                let changed = self.changed.notified();
                if self.ready.lock().await.contains(instance_id) {
                    return true;
                }
                changed.await;
            }
        }
    }
}
