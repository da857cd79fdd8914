use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regatta_model::instance::{Instance, InstanceId, TaskId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::deps::OfferLayer;
use crate::events::InstanceEvent;
use crate::tracker::InstanceTracker;

/// After this many re-issues we complain; there is no backoff, kills are
/// idempotent at the offer layer.
const NOISY_ATTEMPTS: u32 = 3;

enum KillCommand {
    KillInstances {
        instances: Vec<Instance>,
        reply: Option<oneshot::Sender<()>>,
    },
    KillUnknownTask {
        task_id: TaskId,
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Drives non-terminal tasks to a killed state through the offer layer.
///
/// At most `kill_chunk_size` kill requests are in flight at a time; overdue
/// ones are re-issued after `kill_retry_timeout`. Completion is confirmed
/// exclusively through the instance event stream.
#[derive(Clone)]
pub struct KillService {
    tx: mpsc::Sender<KillCommand>,
}

impl KillService {
    pub fn spawn(
        offer: Arc<dyn OfferLayer>,
        tracker: InstanceTracker,
        config: &CoreConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        let mut actor = KillActor {
            offer,
            tracker: tracker.clone(),
            chunk_size: config.kill_chunk_size,
            retry_timeout: config.kill_retry_timeout,
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            watches: HashMap::new(),
            unknown_watches: HashMap::new(),
            promises: HashMap::new(),
            next_promise: 0,
        };
        tokio::spawn(async move {
            let mut events = tracker.events().subscribe_instances();
            actor.warm_start().await;
            let mut tick = tokio::time::interval(actor.retry_timeout.min(Duration::from_secs(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        actor.handle(cmd).await;
                    }
                    event = events.recv() => match event {
                        Ok(event) => actor.on_event(event).await,
                        Err(_) => actor.resync().await,
                    },
                    _ = tick.tick() => actor.retry_overdue().await,
                }
            }
        });
        KillService { tx }
    }

    /// Kill the given instances' tasks; resolves once every selected task is
    /// confirmed terminal (or unreachable) via the event stream.
    pub async fn kill_instances(&self, instances: Vec<Instance>) {
        let (reply, rx) = oneshot::channel();
        let cmd = KillCommand::KillInstances {
            instances,
            reply: Some(reply),
        };
        if self.tx.send(cmd).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Fire-and-forget variant used where nobody waits on the outcome.
    pub async fn request_kill(&self, instances: Vec<Instance>) {
        let _ = self
            .tx
            .send(KillCommand::KillInstances {
                instances,
                reply: None,
            })
            .await;
    }

    /// Kill a task the tracker does not know; resolves when the matching
    /// unknown-instance-terminated event is observed.
    pub async fn kill_unknown_task(&self, task_id: TaskId) {
        let (reply, rx) = oneshot::channel();
        let cmd = KillCommand::KillUnknownTask {
            task_id,
            reply: Some(reply),
        };
        if self.tx.send(cmd).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct KillAttempt {
    instance_id: InstanceId,
    first_requested: Instant,
    last_issued: Instant,
    attempts: u32,
}

struct Watch {
    /// Tasks that must reach a terminal-or-unreachable condition.
    tasks: HashSet<TaskId>,
    promise_ids: Vec<u64>,
}

struct PendingPromise {
    remaining: usize,
    reply: Option<oneshot::Sender<()>>,
}

struct KillActor {
    offer: Arc<dyn OfferLayer>,
    tracker: InstanceTracker,
    chunk_size: usize,
    retry_timeout: Duration,
    in_flight: HashMap<TaskId, KillAttempt>,
    pending: VecDeque<TaskId>,
    watches: HashMap<InstanceId, Watch>,
    unknown_watches: HashMap<InstanceId, Vec<u64>>,
    promises: HashMap<u64, PendingPromise>,
    next_promise: u64,
}

impl KillActor {
    /// Re-enqueue kills for anything that should already be dying: stopped or
    /// decommissioned instances that still carry live tasks.
    async fn warm_start(&mut self) {
        let leftovers: Vec<Instance> = self
            .tracker
            .instances()
            .into_iter()
            .filter(|i| {
                !matches!(i.state.goal, regatta_model::instance::Goal::Running)
                    && i.tasks
                        .values()
                        .any(|t| !t.condition.is_terminal_or_unreachable())
            })
            .collect();
        if !leftovers.is_empty() {
            tracing::info!(count = leftovers.len(), "resuming kills after restart");
            self.kill_instances(leftovers, None).await;
        }
    }

    async fn handle(&mut self, cmd: KillCommand) {
        match cmd {
            KillCommand::KillInstances { instances, reply } => {
                self.kill_instances(instances, reply).await;
            }
            KillCommand::KillUnknownTask { task_id, reply } => {
                let promise_id = self.new_promise(1, reply);
                self.unknown_watches
                    .entry(task_id.instance_id.clone())
                    .or_default()
                    .push(promise_id);
                self.issue_or_enqueue(task_id).await;
            }
        }
    }

    async fn kill_instances(
        &mut self,
        instances: Vec<Instance>,
        reply: Option<oneshot::Sender<()>>,
    ) {
        // select tasks worth a kill request: everything not already terminal
        // and not unreachable (the latter get no request; the mesos-side mark
        // or a later status update settles them)
        let mut selected: Vec<(InstanceId, Vec<TaskId>)> = Vec::new();
        for instance in &instances {
            if instance.state.condition == regatta_model::condition::Condition::Scheduled {
                continue;
            }
            let tasks: Vec<TaskId> = instance
                .tasks
                .values()
                .filter(|t| !t.condition.is_terminal_or_unreachable())
                .map(|t| t.task_id.clone())
                .collect();
            if !tasks.is_empty() {
                selected.push((instance.instance_id.clone(), tasks));
            }
        }

        if selected.is_empty() {
            // nothing to do: scheduled or already settled instances
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }

        let promise_id = self.new_promise(selected.len(), reply);
        for (instance_id, tasks) in selected {
            let mut fresh = Vec::new();
            let watch = self.watches.entry(instance_id).or_insert_with(|| Watch {
                tasks: HashSet::new(),
                promise_ids: Vec::new(),
            });
            watch.promise_ids.push(promise_id);
            for task_id in tasks {
                if watch.tasks.insert(task_id.clone()) {
                    fresh.push(task_id);
                }
            }
            for task_id in fresh {
                self.issue_or_enqueue(task_id).await;
            }
        }
    }

    fn new_promise(&mut self, remaining: usize, reply: Option<oneshot::Sender<()>>) -> u64 {
        self.next_promise += 1;
        self.promises.insert(
            self.next_promise,
            PendingPromise { remaining, reply },
        );
        self.next_promise
    }

    async fn issue_or_enqueue(&mut self, task_id: TaskId) {
        if self.in_flight.contains_key(&task_id) || self.pending.contains(&task_id) {
            return;
        }
        if self.in_flight.len() < self.chunk_size {
            self.issue(task_id).await;
        } else {
            self.pending.push_back(task_id);
        }
    }

    async fn issue(&mut self, task_id: TaskId) {
        tracing::debug!(task = %task_id, "issuing kill");
        self.offer.kill_task(&task_id).await;
        let now = Instant::now();
        self.in_flight.insert(
            task_id.clone(),
            KillAttempt {
                instance_id: task_id.instance_id,
                first_requested: now,
                last_issued: now,
                attempts: 1,
            },
        );
    }

    async fn retry_overdue(&mut self) {
        let overdue: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, a)| a.last_issued.elapsed() >= self.retry_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in overdue {
            self.offer.kill_task(&task_id).await;
            if let Some(attempt) = self.in_flight.get_mut(&task_id) {
                attempt.attempts += 1;
                attempt.last_issued = Instant::now();
                if attempt.attempts > NOISY_ATTEMPTS {
                    tracing::warn!(
                        task = %task_id,
                        attempts = attempt.attempts,
                        waited_secs = attempt.first_requested.elapsed().as_secs(),
                        "task still not terminal after repeated kills"
                    );
                }
            }
        }
    }

    async fn on_event(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::InstanceChanged { instance } => {
                let id = instance.instance_id.clone();
                self.evaluate(&id, Some(&instance)).await;
            }
            InstanceEvent::InstanceExpunged { instance } => {
                let id = instance.instance_id.clone();
                self.evaluate(&id, None).await;
            }
            InstanceEvent::UnknownInstanceTerminated { instance_id } => {
                self.evaluate(&instance_id, None).await;
            }
        }
    }

    /// The event stream lagged; re-derive every watch from the tracker.
    async fn resync(&mut self) {
        let ids: Vec<InstanceId> = self.watches.keys().cloned().collect();
        for id in ids {
            let instance = self.tracker.instance(&id);
            self.evaluate(&id, instance.as_ref()).await;
        }
    }

    async fn evaluate(&mut self, instance_id: &InstanceId, instance: Option<&Instance>) {
        if let Some(promise_ids) = self.unknown_watches.remove(instance_id) {
            if instance.is_none() {
                self.drop_instance_tasks(instance_id);
                for promise_id in promise_ids {
                    self.settle(promise_id);
                }
                self.refill().await;
            } else {
                // the instance turned out to be known after all; keep waiting
                self.unknown_watches
                    .insert(instance_id.clone(), promise_ids);
            }
        }

        let Some(watch) = self.watches.get(instance_id) else {
            return;
        };
        let done = match instance {
            None => true,
            Some(instance) => watch.tasks.iter().all(|task_id| {
                instance
                    .tasks
                    .get(task_id)
                    .map(|t| t.condition.is_terminal_or_unreachable())
                    .unwrap_or(true)
            }),
        };
        if !done {
            return;
        }
        let watch = self.watches.remove(instance_id).expect("checked above");
        self.drop_instance_tasks(instance_id);
        for promise_id in watch.promise_ids {
            self.settle(promise_id);
        }
        self.refill().await;
    }

    fn drop_instance_tasks(&mut self, instance_id: &InstanceId) {
        self.in_flight
            .retain(|_, attempt| &attempt.instance_id != instance_id);
        self.pending
            .retain(|task_id| &task_id.instance_id != instance_id);
    }

    fn settle(&mut self, promise_id: u64) {
        if let Some(promise) = self.promises.get_mut(&promise_id) {
            promise.remaining = promise.remaining.saturating_sub(1);
            if promise.remaining == 0 {
                if let Some(promise) = self.promises.remove(&promise_id) {
                    if let Some(reply) = promise.reply {
                        let _ = reply.send(());
                    }
                }
            }
        }
    }

    async fn refill(&mut self) {
        while self.in_flight.len() < self.chunk_size {
            let Some(task_id) = self.pending.pop_front() else {
                break;
            };
            self.issue(task_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::doubles::RecordingOfferLayer;
    use crate::events::EventBus;
    use crate::repository::InMemoryInstanceRepository;
    use regatta_model::condition::Condition;
    use regatta_model::instance::{AgentInfo, Goal};
    use regatta_model::path::PathId;
    use regatta_model::run_spec::{AppDefinition, PodContainer, PodDefinition, Resources, RunSpec};

    struct Fixture {
        offer: Arc<RecordingOfferLayer>,
        tracker: InstanceTracker,
        kill: KillService,
    }

    fn fixture(chunk: usize, retry: Duration) -> Fixture {
        let offer = Arc::new(RecordingOfferLayer::default());
        let tracker = InstanceTracker::spawn(
            Arc::new(InMemoryInstanceRepository::default()),
            EventBus::default(),
            CancellationToken::new(),
        );
        let config = CoreConfig {
            kill_chunk_size: chunk,
            kill_retry_timeout: retry,
            ..CoreConfig::default()
        };
        let kill = KillService::spawn(
            offer.clone(),
            tracker.clone(),
            &config,
            CancellationToken::new(),
        );
        Fixture {
            offer,
            tracker,
            kill,
        }
    }

    fn agent() -> AgentInfo {
        AgentInfo {
            host: "h".into(),
            agent_id: None,
            region: None,
            zone: None,
            attributes: vec![],
        }
    }

    async fn running_instance(tracker: &InstanceTracker, id: &str) -> Instance {
        let spec = RunSpec::App(AppDefinition::new(PathId::parse(id).unwrap()));
        let ids = tracker.schedule(spec, "*".into(), 1).await;
        tracker.provision(ids[0].clone(), agent()).await;
        let instance = tracker.instance(&ids[0]).unwrap();
        let task_id = instance.tasks.keys().next().unwrap().clone();
        tracker.update_task(task_id, Condition::Running, None).await;
        tracker.instance(&ids[0]).unwrap()
    }

    #[tokio::test]
    async fn test_kill_resolves_after_terminal_updates() {
        let f = fixture(5, Duration::from_secs(600));
        let instance = running_instance(&f.tracker, "/svc").await;
        let task_id = instance.tasks.keys().next().unwrap().clone();

        let kill = f.kill.clone();
        let wait = tokio::spawn(async move { kill.kill_instances(vec![instance]).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.offer.killed.lock().await.len(), 1);
        assert!(!wait.is_finished());

        f.tracker.update_task(task_id, Condition::Killed, None).await;
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("kill should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_instances_resolve_immediately() {
        let f = fixture(5, Duration::from_secs(600));
        let spec = RunSpec::App(AppDefinition::new(PathId::parse("/svc").unwrap()));
        let ids = f.tracker.schedule(spec, "*".into(), 1).await;
        let instance = f.tracker.instance(&ids[0]).unwrap();

        tokio::time::timeout(Duration::from_millis(200), f.kill.kill_instances(vec![instance]))
            .await
            .expect("scheduled instance needs no kill");
        assert!(f.offer.killed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_tasks_get_no_kill_request() {
        // S5: running(A), unreachable(B), staging(C) in one pod instance
        let f = fixture(5, Duration::from_secs(600));
        let mut pod = PodDefinition::new(PathId::parse("/pod").unwrap());
        pod.containers = ["a", "b", "c"]
            .iter()
            .map(|name| PodContainer {
                name: name.to_string(),
                exec: None,
                resources: Resources::default(),
            })
            .collect();
        let ids = f.tracker.schedule(RunSpec::Pod(pod), "*".into(), 1).await;
        f.tracker.provision(ids[0].clone(), agent()).await;
        let instance = f.tracker.instance(&ids[0]).unwrap();
        let tasks: Vec<TaskId> = instance.tasks.keys().cloned().collect();
        let (a, b, c) = (tasks[0].clone(), tasks[1].clone(), tasks[2].clone());
        f.tracker.update_task(a.clone(), Condition::Running, None).await;
        f.tracker
            .update_task(b.clone(), Condition::Unreachable, None)
            .await;
        f.tracker.update_task(c.clone(), Condition::Staging, None).await;
        let instance = f.tracker.instance(&ids[0]).unwrap();

        let kill = f.kill.clone();
        let wait = tokio::spawn(async move { kill.kill_instances(vec![instance]).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let killed = f.offer.killed.lock().await.clone();
        assert_eq!(killed.len(), 2);
        assert!(killed.contains(&a) && killed.contains(&c));
        assert!(!killed.contains(&b));

        // A killed, B gone, C unreachable: the promise resolves
        f.tracker.update_task(a, Condition::Killed, None).await;
        f.tracker.update_task(b, Condition::Gone, None).await;
        f.tracker.update_task(c, Condition::Unreachable, None).await;
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("kill should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_chunk_size() {
        let f = fixture(2, Duration::from_secs(600));
        let mut instances = Vec::new();
        for n in 0..5 {
            instances.push(running_instance(&f.tracker, &format!("/svc{n}")).await);
        }
        f.kill.request_kill(instances.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.offer.killed.lock().await.len(), 2);

        // confirming one frees a slot for the next pending task
        let first_task = instances[0].tasks.keys().next().unwrap().clone();
        f.tracker.update_task(first_task, Condition::Killed, None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.offer.killed.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_overdue_kills_are_reissued() {
        let f = fixture(5, Duration::from_millis(40));
        let instance = running_instance(&f.tracker, "/svc").await;
        f.kill.request_kill(vec![instance]).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        // initial request plus at least one retry, same task id
        let killed = f.offer.killed.lock().await.clone();
        assert!(killed.len() >= 2, "expected retries, saw {}", killed.len());
        assert!(killed.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_warm_start_kills_decommissioned_leftovers() {
        let offer = Arc::new(RecordingOfferLayer::default());
        let tracker = InstanceTracker::spawn(
            Arc::new(InMemoryInstanceRepository::default()),
            EventBus::default(),
            CancellationToken::new(),
        );
        let instance = running_instance(&tracker, "/svc").await;
        tracker
            .set_goal(
                instance.instance_id.clone(),
                Goal::Decommissioned,
                crate::tracker::GoalReason::Stopping,
            )
            .await;

        let _kill = KillService::spawn(
            offer.clone(),
            tracker.clone(),
            &CoreConfig::default(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(offer.killed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_kill_unknown_task_resolves_on_unknown_terminated() {
        let f = fixture(5, Duration::from_secs(600));
        let ghost = InstanceId::new(PathId::parse("/ghost").unwrap());
        let task_id = TaskId::for_instance(ghost.clone());

        let kill = f.kill.clone();
        let wait = {
            let task_id = task_id.clone();
            tokio::spawn(async move { kill.kill_unknown_task(task_id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.offer.killed.lock().await.len(), 1);
        assert!(!wait.is_finished());

        // a terminal status for the unknown task surfaces as this event
        f.tracker.update_task(task_id, Condition::Killed, None).await;
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("unknown kill should resolve")
            .unwrap();
    }
}
