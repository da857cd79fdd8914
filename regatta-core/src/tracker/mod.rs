use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regatta_model::condition::Condition;
use regatta_model::instance::{
    AgentInfo, Goal, Instance, InstanceId, Task, TaskId, now,
};
use regatta_model::path::PathId;
use regatta_model::run_spec::{RunSpec, UnreachableStrategy};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, InstanceEvent};
use crate::repository::InstanceRepository;

/// Why a goal transition was requested; only used for logging and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalReason {
    Orphaned,
    Scaling,
    Stopping,
    UserRequest,
}

enum TrackerOp {
    Schedule {
        spec: RunSpec,
        role: String,
        count: u32,
        reply: oneshot::Sender<Vec<InstanceId>>,
    },
    Provision {
        instance_id: InstanceId,
        agent: AgentInfo,
        reply: oneshot::Sender<bool>,
    },
    UpdateTask {
        task_id: TaskId,
        condition: Condition,
        healthy: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    SetGoal {
        instance_id: InstanceId,
        goal: Goal,
        reason: GoalReason,
        reply: oneshot::Sender<bool>,
    },
    SetReady {
        instance_id: InstanceId,
        ready: bool,
    },
    CheckUnreachable {
        instance_id: InstanceId,
    },
    ReservationTimeout {
        instance_id: InstanceId,
    },
}

/// The authoritative view of every instance. All writes funnel through one
/// updater task, so operations on a single instance are totally ordered;
/// reads go against a lock-free mirror of the committed state.
#[derive(Clone)]
pub struct InstanceTracker {
    tx: mpsc::Sender<TrackerOp>,
    view: Arc<DashMap<InstanceId, Instance>>,
    ready: Arc<DashMap<InstanceId, bool>>,
    events: EventBus,
}

impl InstanceTracker {
    pub fn spawn(
        repo: Arc<dyn InstanceRepository>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let view: Arc<DashMap<InstanceId, Instance>> = Arc::new(DashMap::new());
        let ready: Arc<DashMap<InstanceId, bool>> = Arc::new(DashMap::new());

        let tracker = InstanceTracker {
            tx: tx.clone(),
            view: view.clone(),
            ready: ready.clone(),
            events: events.clone(),
        };

        let mut updater = Updater {
            repo,
            events,
            view,
            ready,
            tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(async move {
            updater.recover().await;
            let mut rx = rx;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        updater.handle(op).await;
                    }
                }
            }
        });
        tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Snapshot of every tracked instance.
    pub fn instances(&self) -> Vec<Instance> {
        self.view.iter().map(|e| e.value().clone()).collect()
    }

    pub fn instance(&self, id: &InstanceId) -> Option<Instance> {
        self.view.get(id).map(|e| e.value().clone())
    }

    pub fn instances_of(&self, run_spec_id: &PathId) -> Vec<Instance> {
        self.view
            .iter()
            .filter(|e| e.value().run_spec_id() == run_spec_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Readiness as last reported by the readiness-check executor; false
    /// until a positive result arrives. Only meaningful for instances whose
    /// spec declares readiness checks.
    pub fn is_ready(&self, id: &InstanceId) -> bool {
        self.ready.get(id).map(|e| *e.value()).unwrap_or(false)
    }

    pub async fn schedule(&self, spec: RunSpec, role: String, count: u32) -> Vec<InstanceId> {
        let (reply, rx) = oneshot::channel();
        let op = TrackerOp::Schedule {
            spec,
            role,
            count,
            reply,
        };
        if self.tx.send(op).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn provision(&self, instance_id: InstanceId, agent: AgentInfo) -> bool {
        let (reply, rx) = oneshot::channel();
        let op = TrackerOp::Provision {
            instance_id,
            agent,
            reply,
        };
        if self.tx.send(op).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn update_task(
        &self,
        task_id: TaskId,
        condition: Condition,
        healthy: Option<bool>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let op = TrackerOp::UpdateTask {
            task_id,
            condition,
            healthy,
            reply,
        };
        if self.tx.send(op).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_goal(&self, instance_id: InstanceId, goal: Goal, reason: GoalReason) -> bool {
        let (reply, rx) = oneshot::channel();
        let op = TrackerOp::SetGoal {
            instance_id,
            goal,
            reason,
            reply,
        };
        if self.tx.send(op).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_ready(&self, instance_id: InstanceId, ready: bool) {
        let _ = self
            .tx
            .send(TrackerOp::SetReady { instance_id, ready })
            .await;
    }

    pub async fn reservation_timeout(&self, instance_id: InstanceId) {
        let _ = self
            .tx
            .send(TrackerOp::ReservationTimeout { instance_id })
            .await;
    }
}

struct Updater {
    repo: Arc<dyn InstanceRepository>,
    events: EventBus,
    view: Arc<DashMap<InstanceId, Instance>>,
    ready: Arc<DashMap<InstanceId, bool>>,
    tx: mpsc::Sender<TrackerOp>,
    shutdown: CancellationToken,
}

impl Updater {
    /// Load persisted instances into the read view before serving updates.
    async fn recover(&mut self) {
        match self.repo.all().await {
            Ok(instances) => {
                for instance in instances {
                    self.view.insert(instance.instance_id.clone(), instance);
                }
            }
            Err(err) => tracing::error!("instance recovery failed: {err}"),
        }
    }

    async fn handle(&mut self, op: TrackerOp) {
        match op {
            TrackerOp::Schedule {
                spec,
                role,
                count,
                reply,
            } => {
                let mut ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let instance = Instance::scheduled(spec.clone(), role.clone(), now());
                    ids.push(instance.instance_id.clone());
                    self.commit(instance).await;
                }
                let _ = reply.send(ids);
            }
            TrackerOp::Provision {
                instance_id,
                agent,
                reply,
            } => {
                let Some(mut instance) = self.view.get(&instance_id).map(|e| e.value().clone())
                else {
                    let _ = reply.send(false);
                    return;
                };
                let tasks = provisioned_tasks(&instance);
                let ok = instance.provision(agent, tasks, now());
                if ok {
                    self.commit(instance).await;
                }
                let _ = reply.send(ok);
            }
            TrackerOp::UpdateTask {
                task_id,
                condition,
                healthy,
                reply,
            } => {
                let instance_id = task_id.instance_id.clone();
                let Some(mut instance) = self.view.get(&instance_id).map(|e| e.value().clone())
                else {
                    if condition.is_terminal() {
                        self.events
                            .publish_instance(InstanceEvent::UnknownInstanceTerminated {
                                instance_id,
                            });
                    } else {
                        tracing::debug!(task = %task_id, ?condition, "status for unknown instance");
                    }
                    let _ = reply.send(false);
                    return;
                };
                let ok = instance.update_task(&task_id, condition, healthy, now());
                if ok {
                    self.commit(instance).await;
                }
                let _ = reply.send(ok);
            }
            TrackerOp::SetGoal {
                instance_id,
                goal,
                reason,
                reply,
            } => {
                let Some(mut instance) = self.view.get(&instance_id).map(|e| e.value().clone())
                else {
                    let _ = reply.send(false);
                    return;
                };
                tracing::info!(instance = %instance_id, ?goal, ?reason, "goal change");
                instance.set_goal(goal, now());
                self.commit(instance).await;
                let _ = reply.send(true);
            }
            TrackerOp::SetReady { instance_id, ready } => {
                let Some(instance) = self.view.get(&instance_id).map(|e| e.value().clone()) else {
                    return;
                };
                self.ready.insert(instance_id, ready);
                self.events
                    .publish_instance(InstanceEvent::InstanceChanged { instance });
            }
            TrackerOp::CheckUnreachable { instance_id } => {
                let Some(mut instance) = self.view.get(&instance_id).map(|e| e.value().clone())
                else {
                    return;
                };
                let before = instance.state.condition;
                instance.update_state(now());
                if instance.state.condition != before {
                    self.commit(instance).await;
                }
            }
            TrackerOp::ReservationTimeout { instance_id } => {
                let Some(mut instance) = self.view.get(&instance_id).map(|e| e.value().clone())
                else {
                    return;
                };
                if let Some(reservation) = &mut instance.reservation {
                    let next = reservation.state.on_timeout();
                    tracing::info!(instance = %instance_id, ?next, "reservation timeout");
                    reservation.state = next;
                    if instance.state.goal == Goal::Decommissioned {
                        instance.reservation = None;
                    }
                    self.commit(instance).await;
                }
            }
        }
    }

    /// Persist, mirror into the view, publish, and expunge if the instance
    /// reached the end of its decommissioned life.
    async fn commit(&mut self, instance: Instance) {
        if instance.should_expunge() && instance.reservation.is_none() {
            if let Err(err) = self.repo.delete(&instance.instance_id).await {
                tracing::error!(instance = %instance.instance_id, "expunge failed: {err}");
            }
            self.view.remove(&instance.instance_id);
            self.ready.remove(&instance.instance_id);
            self.events
                .publish_instance(InstanceEvent::InstanceExpunged { instance });
            return;
        }
        if let Err(err) = self.repo.store(instance.clone()).await {
            tracing::error!(instance = %instance.instance_id, "store failed: {err}");
        }
        self.view
            .insert(instance.instance_id.clone(), instance.clone());
        self.arm_unreachable_timer(&instance);
        self.events
            .publish_instance(InstanceEvent::InstanceChanged { instance });
    }

    /// When an instance turns unreachable under an enabled strategy, make
    /// sure a re-check fires once the inactivity deadline can have passed.
    fn arm_unreachable_timer(&self, instance: &Instance) {
        if instance.state.condition != Condition::Unreachable {
            return;
        }
        let UnreachableStrategy::Enabled { inactive_after, .. } =
            *instance.run_spec.unreachable_strategy()
        else {
            return;
        };
        let tx = self.tx.clone();
        let instance_id = instance.instance_id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(inactive_after + Duration::from_millis(10)) => {
                    let _ = tx.send(TrackerOp::CheckUnreachable { instance_id }).await;
                }
            }
        });
    }
}

fn provisioned_tasks(instance: &Instance) -> Vec<Task> {
    match &instance.run_spec {
        RunSpec::App(_) => vec![Task::new(
            TaskId::for_instance(instance.instance_id.clone()),
            Condition::Provisioned,
        )],
        RunSpec::Pod(pod) => pod
            .containers
            .iter()
            .map(|c| {
                Task::new(
                    TaskId::for_container(instance.instance_id.clone(), &c.name),
                    Condition::Provisioned,
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryInstanceRepository;
    use regatta_model::run_spec::AppDefinition;

    fn tracker() -> InstanceTracker {
        InstanceTracker::spawn(
            Arc::new(InMemoryInstanceRepository::default()),
            EventBus::default(),
            CancellationToken::new(),
        )
    }

    fn spec(id: &str) -> RunSpec {
        RunSpec::App(AppDefinition::new(PathId::parse(id).unwrap()))
    }

    fn agent() -> AgentInfo {
        AgentInfo {
            host: "agent1".into(),
            agent_id: Some("a-1".into()),
            region: None,
            zone: None,
            attributes: vec![],
        }
    }

    #[tokio::test]
    async fn test_schedule_provision_run_flow() {
        let tracker = tracker();
        let ids = tracker.schedule(spec("/test/app"), "*".into(), 1).await;
        assert_eq!(ids.len(), 1);
        let id = ids[0].clone();

        assert!(tracker.provision(id.clone(), agent()).await);
        let instance = tracker.instance(&id).unwrap();
        assert_eq!(instance.state.condition, Condition::Provisioned);
        assert_eq!(instance.tasks.len(), 1);

        let task_id = instance.tasks.keys().next().unwrap().clone();
        assert!(
            tracker
                .update_task(task_id, Condition::Running, Some(true))
                .await
        );
        let instance = tracker.instance(&id).unwrap();
        assert_eq!(instance.state.condition, Condition::Running);
        assert_eq!(instance.state.healthy, Some(true));
    }

    #[tokio::test]
    async fn test_unknown_terminal_status_publishes_event() {
        let tracker = tracker();
        let mut events = tracker.events().subscribe_instances();
        let ghost = InstanceId::new(PathId::parse("/ghost").unwrap());
        let task_id = TaskId::for_instance(ghost.clone());

        assert!(!tracker.update_task(task_id, Condition::Killed, None).await);
        match events.recv().await.unwrap() {
            InstanceEvent::UnknownInstanceTerminated { instance_id } => {
                assert_eq!(instance_id, ghost)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decommissioned_instance_expunged_once_terminal() {
        let tracker = tracker();
        let ids = tracker.schedule(spec("/svc"), "*".into(), 1).await;
        let id = ids[0].clone();
        tracker.provision(id.clone(), agent()).await;
        let task_id = tracker
            .instance(&id)
            .unwrap()
            .tasks
            .keys()
            .next()
            .unwrap()
            .clone();
        tracker
            .update_task(task_id.clone(), Condition::Running, None)
            .await;

        tracker
            .set_goal(id.clone(), Goal::Decommissioned, GoalReason::Stopping)
            .await;
        assert!(tracker.instance(&id).is_some());

        tracker.update_task(task_id, Condition::Killed, None).await;
        assert!(tracker.instance(&id).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_timer_promotes_to_inactive() {
        let tracker = tracker();
        let mut def = AppDefinition::new(PathId::parse("/svc").unwrap());
        def.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after: Duration::from_millis(30),
            expunge_after: Duration::from_secs(300),
        };
        let ids = tracker.schedule(RunSpec::App(def), "*".into(), 1).await;
        let id = ids[0].clone();
        tracker.provision(id.clone(), agent()).await;
        let task_id = tracker
            .instance(&id)
            .unwrap()
            .tasks
            .keys()
            .next()
            .unwrap()
            .clone();
        tracker
            .update_task(task_id.clone(), Condition::Running, None)
            .await;
        tracker
            .update_task(task_id, Condition::Unreachable, None)
            .await;
        assert_eq!(
            tracker.instance(&id).unwrap().state.condition,
            Condition::Unreachable
        );

        // the armed timer re-checks after inactive_after has elapsed
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            tracker.instance(&id).unwrap().state.condition,
            Condition::UnreachableInactive
        );
    }

    #[tokio::test]
    async fn test_ready_flag_round_trip() {
        let tracker = tracker();
        let ids = tracker.schedule(spec("/svc"), "*".into(), 1).await;
        let id = ids[0].clone();
        assert!(!tracker.is_ready(&id));
        tracker.set_ready(id.clone(), true).await;
        // ops are serialized; a subsequent read observes the flag
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.is_ready(&id));
    }
}
