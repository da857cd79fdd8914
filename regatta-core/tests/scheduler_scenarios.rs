//! End-to-end deployment scenarios against the in-memory stores, with a
//! simulated agent side: launches are provisioned and run by a driver task,
//! kills are confirmed by flipping the task to killed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use regatta_core::config::CoreConfig;
use regatta_core::deps::doubles::{
    ImmediateReadiness, ManualReadinessProvider, RecordingHealthCheckManager,
    RecordingLaunchQueue,
};
use regatta_core::deps::{OfferLayer, ReadinessProvider, TaskStatus};
use regatta_core::error::CoreError;
use regatta_core::events::EventBus;
use regatta_core::kill::KillService;
use regatta_core::repository::{
    InMemoryDeploymentRepository, InMemoryInstanceRepository, InMemoryRootRepository,
    InMemorySpecRepository, RootRepository,
};
use regatta_core::scheduler::{Scheduler, SchedulerEnv};
use regatta_core::tracker::InstanceTracker;
use regatta_model::condition::Condition;
use regatta_model::deployment::DeploymentPlan;
use regatta_model::instance::{AgentInfo, Goal, TaskId};
use regatta_model::path::PathId;
use regatta_model::run_spec::{
    AppDefinition, ReadinessCheckSpec, RunSpec, Timestamp, UpgradeStrategy,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn id(raw: &str) -> PathId {
    PathId::parse(raw).unwrap()
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

/// Offer layer that records reconciliations and confirms kills by reporting
/// the task killed back to the tracker, like a well-behaved agent would.
struct SimulatedOfferLayer {
    tracker: InstanceTracker,
    pub killed: Mutex<Vec<TaskId>>,
    pub reconciled: Mutex<Vec<Vec<TaskStatus>>>,
}

impl SimulatedOfferLayer {
    fn new(tracker: InstanceTracker) -> Self {
        SimulatedOfferLayer {
            tracker,
            killed: Mutex::new(Vec::new()),
            reconciled: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OfferLayer for SimulatedOfferLayer {
    async fn kill_task(&self, task_id: &TaskId) {
        self.killed.lock().await.push(task_id.clone());
        self.tracker
            .update_task(task_id.clone(), Condition::Killed, None)
            .await;
    }

    async fn reconcile(&self, statuses: Vec<TaskStatus>) {
        self.reconciled.lock().await.push(statuses);
    }
}

struct Harness {
    tracker: InstanceTracker,
    scheduler: Scheduler,
    roots: Arc<InMemoryRootRepository>,
    offer: Arc<SimulatedOfferLayer>,
    launch_queue: Arc<RecordingLaunchQueue>,
    shutdown: CancellationToken,
}

fn harness() -> Harness {
    harness_with_readiness(Arc::new(ImmediateReadiness))
}

fn harness_with_readiness(readiness: Arc<dyn ReadinessProvider>) -> Harness {
    let apps = Arc::new(InMemorySpecRepository::default());
    let pods = Arc::new(InMemorySpecRepository::default());
    let roots = Arc::new(InMemoryRootRepository::new(apps, pods));
    let deployments = Arc::new(InMemoryDeploymentRepository::default());
    let events = EventBus::default();
    let shutdown = CancellationToken::new();
    let tracker = InstanceTracker::spawn(
        Arc::new(InMemoryInstanceRepository::default()),
        events.clone(),
        shutdown.clone(),
    );
    let offer = Arc::new(SimulatedOfferLayer::new(tracker.clone()));
    let config = CoreConfig::default();
    let kill = KillService::spawn(offer.clone(), tracker.clone(), &config, shutdown.clone());
    let launch_queue = Arc::new(RecordingLaunchQueue::default());
    let scheduler = Scheduler::spawn(
        SchedulerEnv {
            config,
            roots: roots.clone(),
            deployments,
            tracker: tracker.clone(),
            kill,
            launch_queue: launch_queue.clone(),
            offer: offer.clone(),
            health: Arc::new(RecordingHealthCheckManager::default()),
            readiness,
            gc: None,
            events,
        },
        shutdown.clone(),
    );
    Harness {
        tracker,
        scheduler,
        roots,
        offer,
        launch_queue,
        shutdown,
    }
}

/// Simulated agent: provisions every scheduled instance and reports its
/// tasks running.
fn drive_launches(tracker: InstanceTracker, stop: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if stop.is_cancelled() {
                break;
            }
            for instance in tracker.instances() {
                if instance.state.condition == Condition::Scheduled
                    && instance.state.goal == Goal::Running
                {
                    let instance_id = instance.instance_id.clone();
                    if tracker.provision(instance_id.clone(), agent()).await {
                        if let Some(provisioned) = tracker.instance(&instance_id) {
                            for task_id in provisioned.tasks.keys() {
                                tracker
                                    .update_task(task_id.clone(), Condition::Running, None)
                                    .await;
                            }
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
}

fn app(raw: &str, instances: u32, cmd: &str) -> AppDefinition {
    let mut def = AppDefinition::new(id(raw));
    def.instances = instances;
    def.cmd = Some(cmd.into());
    def
}

fn no_kills() -> BTreeMap<PathId, Vec<regatta_model::instance::InstanceId>> {
    BTreeMap::new()
}

#[tokio::test]
async fn test_deploy_new_app_to_completion() {
    let h = harness();
    drive_launches(h.tracker.clone(), h.shutdown.clone());

    let original = h.roots.root().await.unwrap();
    let target = original.put_app(app("/test/app", 1, "test cmd"), t(1)).unwrap();
    let plan = DeploymentPlan::plan(&original, &target, &no_kills(), t(2));

    tokio::time::timeout(Duration::from_secs(5), h.scheduler.deploy(plan, false))
        .await
        .expect("deployment must finish")
        .expect("deployment must succeed");

    // target root persisted, one instance running, demand was enqueued
    let stored = h.roots.root().await.unwrap();
    assert!(stored.run_spec(&id("/test/app")).is_some());
    let instances = h.tracker.instances_of(&id("/test/app"));
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state.condition, Condition::Running);
    assert_eq!(h.launch_queue.added.lock().await.as_slice(), &[(id("/test/app"), 1)]);
    // locks were released: a follow-up no-op deploy succeeds
    assert!(h.scheduler.list_running_deployments().await.is_empty());
}

#[tokio::test]
async fn test_conflicting_deploy_is_rejected_with_app_locked() {
    let h = harness();
    // no launch driver: the first deployment parks in its scale step
    let original = h.roots.root().await.unwrap();
    let target = original.put_app(app("/foo/app1", 1, "v1"), t(1)).unwrap();
    let plan1 = DeploymentPlan::plan(&original, &target, &no_kills(), t(2));
    let plan2 = DeploymentPlan::plan(&original, &target, &no_kills(), t(3));

    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.deploy(plan1, false).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.scheduler.deploy(plan2, false).await;
    match second {
        Err(CoreError::AppLocked { run_spec_ids, .. }) => {
            assert_eq!(run_spec_ids, vec![id("/foo/app1")]);
        }
        other => panic!("expected AppLocked, got {other:?}"),
    }
    assert!(!first.is_finished());
    first.abort();
}

#[tokio::test]
async fn test_forced_deploy_preempts_and_fails_holder() {
    // S6: P1 holds /foo/app1; P2 with force cancels P1 and runs
    let h = harness();
    let original = h.roots.root().await.unwrap();
    let target = original.put_app(app("/foo/app1", 1, "v1"), t(1)).unwrap();
    let plan1 = DeploymentPlan::plan(&original, &target, &no_kills(), t(2));
    let plan2 = DeploymentPlan::plan(&original, &target, &no_kills(), t(3));

    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.deploy(plan1, false).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // P2 can finish: give it a working agent
    drive_launches(h.tracker.clone(), h.shutdown.clone());
    let second = tokio::time::timeout(Duration::from_secs(5), h.scheduler.deploy(plan2, true))
        .await
        .expect("forced deployment must finish");
    assert!(second.is_ok(), "forced deployment failed: {second:?}");

    let first = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .expect("preempted promise must settle")
        .unwrap();
    assert!(
        matches!(first, Err(CoreError::DeploymentCancelled(_))),
        "expected DeploymentCancelled, got {first:?}"
    );
}

#[tokio::test]
async fn test_restart_honours_upgrade_strategy() {
    // S3: instances=4, minimumHealthCapacity=0.5, maximumOverCapacity=0:
    // active count never below 2, never above 4
    let h = harness();

    let mut v1 = app("/svc", 4, "v1");
    v1.upgrade_strategy = UpgradeStrategy {
        minimum_health_capacity: 0.5,
        maximum_over_capacity: 0.0,
    };
    let original = h.roots.root().await.unwrap();
    let root1 = original.put_app(v1.clone(), t(1)).unwrap();
    h.roots
        .store_root(root1.clone(), vec![root1.app(&id("/svc")).unwrap().clone()], vec![], vec![], vec![])
        .await
        .unwrap();

    // bring 4 old instances up with the stored (v1) spec
    let stored_v1 = root1.run_spec(&id("/svc")).unwrap().clone();
    let ids = h.tracker.schedule(stored_v1, "*".into(), 4).await;
    for instance_id in &ids {
        h.tracker.provision(instance_id.clone(), agent()).await;
        let inst = h.tracker.instance(instance_id).unwrap();
        for task_id in inst.tasks.keys() {
            h.tracker
                .update_task(task_id.clone(), Condition::Running, None)
                .await;
        }
    }

    // capacity monitor: track physical active counts over the whole restart
    let monitor_tracker = h.tracker.clone();
    let mut events = h.tracker.events().subscribe_instances();
    let bounds = Arc::new(Mutex::new((usize::MAX, 0usize)));
    let monitor_bounds = bounds.clone();
    let monitor = tokio::spawn(async move {
        while events.recv().await.is_ok() {
            let active = monitor_tracker
                .instances_of(&id("/svc"))
                .into_iter()
                .filter(|i| i.is_active())
                .count();
            let mut b = monitor_bounds.lock().await;
            b.0 = b.0.min(active);
            b.1 = b.1.max(active);
        }
    });

    drive_launches(h.tracker.clone(), h.shutdown.clone());

    let mut v2 = v1.clone();
    v2.cmd = Some("v2".into());
    let root2 = root1.put_app(v2, t(10)).unwrap();
    let plan = DeploymentPlan::plan(&root1, &root2, &no_kills(), t(11));
    assert!(matches!(
        plan.steps[0].actions[0],
        regatta_model::deployment::DeploymentAction::Restart { .. }
    ));

    tokio::time::timeout(Duration::from_secs(10), h.scheduler.deploy(plan, false))
        .await
        .expect("restart must finish")
        .expect("restart must succeed");

    // all survivors run the new config
    let survivors = h.tracker.instances_of(&id("/svc"));
    assert_eq!(survivors.len(), 4);
    for instance in &survivors {
        assert_eq!(instance.run_spec.version(), t(10));
        assert_eq!(instance.state.condition, Condition::Running);
    }

    monitor.abort();
    let (min_active, max_active) = *bounds.lock().await;
    assert!(min_active >= 2, "dropped to {min_active} active instances");
    assert!(max_active <= 4, "peaked at {max_active} active instances");
}

#[tokio::test]
async fn test_readiness_gated_scale_waits_for_positive_results() {
    let readiness = Arc::new(ManualReadinessProvider::default());
    let h = harness_with_readiness(readiness.clone());
    drive_launches(h.tracker.clone(), h.shutdown.clone());

    let original = h.roots.root().await.unwrap();
    let mut def = app("/gated", 1, "cmd");
    def.readiness_checks.push(ReadinessCheckSpec {
        name: "http".into(),
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(3),
    });
    let target = original.put_app(def, t(1)).unwrap();
    let plan = DeploymentPlan::plan(&original, &target, &no_kills(), t(2));

    let scheduler = h.scheduler.clone();
    let deploy = tokio::spawn(async move { scheduler.deploy(plan, false).await });

    // the instance comes up and runs...
    let instance_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let running = h
                .tracker
                .instances_of(&id("/gated"))
                .into_iter()
                .find(|i| i.state.condition == Condition::Running);
            if let Some(instance) = running {
                break instance.instance_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("instance must come up");

    // ...but the scale step stays parked until a readiness verdict arrives
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!deploy.is_finished());
    assert!(!h.tracker.is_ready(&instance_id));

    readiness.report_ready(instance_id.clone()).await;
    tokio::time::timeout(Duration::from_secs(5), deploy)
        .await
        .expect("deployment must finish once readiness is reported")
        .unwrap()
        .expect("deployment must succeed");
    assert!(h.tracker.is_ready(&instance_id));
}

#[tokio::test]
async fn test_reconciliation_submits_exactly_live_tasks() {
    let h = harness();

    // persisted root knows /kept only
    let root = h
        .roots
        .root()
        .await
        .unwrap()
        .put_app(app("/kept", 1, "cmd"), t(1))
        .unwrap();
    h.roots
        .store_root(root.clone(), vec![root.app(&id("/kept")).unwrap().clone()], vec![], vec![], vec![])
        .await
        .unwrap();

    let spec = root.run_spec(&id("/kept")).unwrap().clone();
    let ids_kept = h.tracker.schedule(spec, "*".into(), 3).await;
    let mut live_task = None;
    for (n, instance_id) in ids_kept.iter().enumerate() {
        h.tracker.provision(instance_id.clone(), agent()).await;
        let task_id = h
            .tracker
            .instance(instance_id)
            .unwrap()
            .tasks
            .keys()
            .next()
            .unwrap()
            .clone();
        match n {
            // one running, one terminal, one left provisioned
            0 => {
                h.tracker
                    .update_task(task_id.clone(), Condition::Running, None)
                    .await;
                live_task = Some(task_id);
            }
            1 => {
                h.tracker.update_task(task_id, Condition::Failed, None).await;
            }
            _ => {}
        }
    }

    // an orphan with no spec in the root
    let orphan_spec = RunSpec::App(app("/orphan", 1, "cmd"));
    let orphan_ids = h.tracker.schedule(orphan_spec, "*".into(), 1).await;

    h.scheduler.reconcile_tasks().await;

    let rounds = h.offer.reconciled.lock().await.clone();
    assert_eq!(rounds.len(), 2, "one batch plus the sentinel");
    let batch = &rounds[0];
    // exactly the running task: terminal and provisioned tasks are excluded
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].task_id, live_task.unwrap());
    assert_eq!(batch[0].condition, Condition::Running);
    assert!(rounds[1].is_empty(), "sentinel must be the empty list");

    // the orphan was decommissioned (scheduled, so it expunges right away)
    assert!(h.tracker.instance(&orphan_ids[0]).is_none());
}

#[tokio::test]
async fn test_concurrent_reconciliations_coalesce() {
    let h = harness();
    let first = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.reconcile_tasks().await })
    };
    let second = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.reconcile_tasks().await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        first.await.unwrap();
        second.await.unwrap();
    })
    .await
    .expect("both acks must arrive");

    // at most one round ran for the overlapping requests: one batch plus one
    // sentinel, or two full rounds if the second request missed the window
    let rounds = h.offer.reconciled.lock().await.len();
    assert!(rounds == 2 || rounds == 4, "unexpected round count {rounds}");
}

#[tokio::test]
async fn test_scale_loop_enqueues_missing_instances() {
    let h = harness();
    let root = h
        .roots
        .root()
        .await
        .unwrap()
        .put_app(app("/svc", 3, "cmd"), t(1))
        .unwrap();
    h.roots
        .store_root(root.clone(), vec![root.app(&id("/svc")).unwrap().clone()], vec![], vec![], vec![])
        .await
        .unwrap();

    // one instance already lives
    let spec = root.run_spec(&id("/svc")).unwrap().clone();
    let ids_existing = h.tracker.schedule(spec, "*".into(), 1).await;
    h.tracker.provision(ids_existing[0].clone(), agent()).await;

    h.scheduler.scale_run_specs().await;

    let added = h.launch_queue.added.lock().await.clone();
    assert_eq!(added, vec![(id("/svc"), 2)]);
    // the missing two are scheduled in the tracker as well
    let scheduled = h
        .tracker
        .instances_of(&id("/svc"))
        .into_iter()
        .filter(|i| i.state.condition == Condition::Scheduled)
        .count();
    assert_eq!(scheduled, 2);

    // running it again adds nothing: scheduled instances count as demand
    h.scheduler.scale_run_specs().await;
    assert_eq!(h.launch_queue.added.lock().await.len(), 1);
}

#[tokio::test]
async fn test_leadership_resumes_stored_plans() {
    let h = harness();
    drive_launches(h.tracker.clone(), h.shutdown.clone());

    let original = h.roots.root().await.unwrap();
    let target = original.put_app(app("/resumed", 1, "cmd"), t(1)).unwrap();
    let plan = DeploymentPlan::plan(&original, &target, &no_kills(), t(2));

    // the plan is already persisted, as if a previous leader crashed mid-way
    let deployments = Arc::new(InMemoryDeploymentRepository::default());
    use regatta_core::repository::DeploymentRepository;
    deployments.store(plan).await.unwrap();
    h.roots
        .store_root(target.clone(), vec![target.app(&id("/resumed")).unwrap().clone()], vec![], vec![], vec![])
        .await
        .unwrap();

    let health = Arc::new(RecordingHealthCheckManager::default());
    let scheduler = Scheduler::spawn(
        SchedulerEnv {
            config: CoreConfig::default(),
            roots: h.roots.clone(),
            deployments,
            tracker: h.tracker.clone(),
            kill: KillService::spawn(
                h.offer.clone(),
                h.tracker.clone(),
                &CoreConfig::default(),
                h.shutdown.clone(),
            ),
            launch_queue: h.launch_queue.clone(),
            offer: h.offer.clone(),
            health: health.clone(),
            readiness: Arc::new(ImmediateReadiness),
            gc: None,
            events: EventBus::default(),
        },
        h.shutdown.clone(),
    );
    scheduler.elected_as_leader_and_ready().await;

    // the resumed plan drives the instance up
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let running = h
                .tracker
                .instances_of(&id("/resumed"))
                .into_iter()
                .filter(|i| i.state.condition == Condition::Running)
                .count();
            if running == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resumed deployment must converge");

    // health checks were reconciled with the persisted apps
    let reconciled = health.reconciled_with.lock().await.clone();
    assert_eq!(reconciled, vec![vec![id("/resumed")]]);
}
