use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regatta_model::deployment::DeploymentPlan;
use regatta_model::group::RootGroup;
use regatta_model::instance::{Goal, now};
use regatta_model::path::PathId;
use regatta_model::run_spec::RunSpec;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::deps::{HealthCheckManager, LaunchQueue, OfferLayer, ReadinessProvider, TaskStatus};
use crate::error::{CoreError, CoreResult};
use crate::events::{DeploymentEvent, EventBus};
use crate::gc::GarbageCollector;
use crate::kill::KillService;
use crate::repository::{DeploymentRepository, RootRepository};
use crate::tracker::{GoalReason, InstanceTracker};

mod steps;

use steps::StepContext;

/// Status of one in-flight deployment, as reported to observers.
#[derive(Debug, Clone)]
pub struct DeploymentStepInfo {
    pub plan: DeploymentPlan,
    /// Zero-based index of the step currently executing.
    pub current_step: usize,
    pub total_steps: usize,
}

/// Collaborators and stores the scheduler is wired to.
pub struct SchedulerEnv {
    pub config: CoreConfig,
    pub roots: Arc<dyn RootRepository>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub tracker: InstanceTracker,
    pub kill: KillService,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub offer: Arc<dyn OfferLayer>,
    pub health: Arc<dyn HealthCheckManager>,
    /// Runs readiness checks for gated specs while deployments wait on them.
    pub readiness: Arc<dyn ReadinessProvider>,
    /// When present, root and spec stores pass through the GC's write gates.
    pub gc: Option<GarbageCollector>,
    pub events: EventBus,
}

enum SchedulerCommand {
    ElectedAsLeaderAndReady,
    Deploy {
        plan: DeploymentPlan,
        force: bool,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Cancel {
        deployment_id: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ListRunningDeployments {
        reply: oneshot::Sender<Vec<DeploymentStepInfo>>,
    },
    ReconcileTasks {
        reply: oneshot::Sender<()>,
    },
    ScaleRunSpecs {
        reply: oneshot::Sender<()>,
    },
    DeploymentFinished {
        deployment_id: String,
        result: CoreResult<()>,
    },
    ReconcileFinished,
}

/// The single serializer of deployment starts, cancellations, task
/// reconciliation and the scale loop. One message at a time; deployments
/// themselves run as spawned drivers that report back through the inbox.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl Scheduler {
    pub fn spawn(env: SchedulerEnv, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        let mut actor = SchedulerActor {
            env,
            tx: tx.clone(),
            locks: HashMap::new(),
            running: HashMap::new(),
            reconcile_inflight: false,
            reconcile_waiters: Vec::new(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        actor.handle(cmd).await;
                    }
                }
            }
        });
        Scheduler { tx }
    }

    /// Start leading: reconcile health checks against the persisted root,
    /// resume stored deployment plans, then serve traffic.
    pub async fn elected_as_leader_and_ready(&self) {
        let _ = self.tx.send(SchedulerCommand::ElectedAsLeaderAndReady).await;
    }

    /// Run a deployment plan to completion. Resolves with `AppLocked` right
    /// away on a lock conflict (unless `force`), with `DeploymentCancelled`
    /// if pre-empted, and with the step outcome otherwise.
    pub async fn deploy(&self, plan: DeploymentPlan, force: bool) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Deploy { plan, force, reply })
            .await
            .map_err(|_| CoreError::Storage("scheduler stopped".into()))?;
        rx.await
            .map_err(|_| CoreError::Storage("scheduler stopped".into()))?
    }

    pub async fn cancel(&self, deployment_id: &str) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Cancel {
                deployment_id: deployment_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoreError::Storage("scheduler stopped".into()))?;
        rx.await
            .map_err(|_| CoreError::Storage("scheduler stopped".into()))?
    }

    pub async fn list_running_deployments(&self) -> Vec<DeploymentStepInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerCommand::ListRunningDeployments { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Reconcile tracked task state with the offer layer. Concurrent calls
    /// coalesce onto the in-flight round; everyone is acked when it ends.
    pub async fn reconcile_tasks(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerCommand::ReconcileTasks { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Enqueue launch demand for every run spec below its target count.
    pub async fn scale_run_specs(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerCommand::ScaleRunSpecs { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

struct RunningDeployment {
    plan: DeploymentPlan,
    cancel: CancellationToken,
    reply: Option<oneshot::Sender<CoreResult<()>>>,
    current_step: Arc<AtomicUsize>,
}

struct SchedulerActor {
    env: SchedulerEnv,
    tx: mpsc::Sender<SchedulerCommand>,
    /// Which deployment owns each affected run spec id.
    locks: HashMap<PathId, String>,
    running: HashMap<String, RunningDeployment>,
    reconcile_inflight: bool,
    reconcile_waiters: Vec<oneshot::Sender<()>>,
    shutdown: CancellationToken,
}

impl SchedulerActor {
    async fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::ElectedAsLeaderAndReady => self.on_elected().await,
            SchedulerCommand::Deploy { plan, force, reply } => {
                self.on_deploy(plan, force, reply).await;
            }
            SchedulerCommand::Cancel {
                deployment_id,
                reply,
            } => {
                let result = if self.running.contains_key(&deployment_id) {
                    self.cancel_deployment(&deployment_id, true).await;
                    Ok(())
                } else {
                    Err(CoreError::ValidationFailure(format!(
                        "deployment {deployment_id} is not running"
                    )))
                };
                let _ = reply.send(result);
            }
            SchedulerCommand::ListRunningDeployments { reply } => {
                let infos = self
                    .running
                    .values()
                    .map(|run| DeploymentStepInfo {
                        plan: run.plan.clone(),
                        current_step: run.current_step.load(Ordering::SeqCst),
                        total_steps: run.plan.steps.len(),
                    })
                    .collect();
                let _ = reply.send(infos);
            }
            SchedulerCommand::ReconcileTasks { reply } => {
                self.reconcile_waiters.push(reply);
                if !self.reconcile_inflight {
                    self.reconcile_inflight = true;
                    self.start_reconciliation();
                }
            }
            SchedulerCommand::ScaleRunSpecs { reply } => {
                self.scale_run_specs().await;
                let _ = reply.send(());
            }
            SchedulerCommand::DeploymentFinished {
                deployment_id,
                result,
            } => {
                self.on_deployment_finished(deployment_id, result).await;
            }
            SchedulerCommand::ReconcileFinished => {
                self.reconcile_inflight = false;
                for waiter in self.reconcile_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    async fn on_elected(&mut self) {
        let root = match self.env.roots.root().await {
            Ok(root) => root,
            Err(err) => {
                // an unreadable root at election time is not recoverable
                tracing::error!("cannot read root group at leader election: {err}");
                panic!("unrecoverable repository failure at leader election: {err}");
            }
        };
        let apps: Vec<RunSpec> = root
            .transitive_run_specs()
            .into_iter()
            .filter(|s| matches!(s, RunSpec::App(_)))
            .cloned()
            .collect();
        self.env.health.reconcile_with(apps).await;

        match self.env.deployments.all().await {
            Ok(plans) => {
                for plan in plans {
                    tracing::info!(deployment = %plan.id, "resuming stored deployment");
                    let affected = plan.affected_run_spec_ids();
                    if self.conflicting_deployments(&affected).is_empty() {
                        self.start_plan(plan, None);
                    } else {
                        tracing::warn!(deployment = %plan.id, "stored plan conflicts, skipping");
                    }
                }
            }
            Err(err) => {
                tracing::error!("cannot load deployments at leader election: {err}");
                panic!("unrecoverable repository failure at leader election: {err}");
            }
        }
    }

    async fn on_deploy(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        reply: oneshot::Sender<CoreResult<()>>,
    ) {
        let affected = plan.affected_run_spec_ids();
        let conflicts = self.conflicting_deployments(&affected);
        if !conflicts.is_empty() {
            if !force {
                let locked: Vec<PathId> = affected
                    .iter()
                    .filter(|id| self.locks.contains_key(*id))
                    .cloned()
                    .collect();
                let _ = reply.send(Err(CoreError::AppLocked {
                    deployment_id: conflicts[0].clone(),
                    run_spec_ids: locked,
                }));
                return;
            }
            for deployment_id in conflicts {
                tracing::info!(preempted = %deployment_id, "forced deployment cancels holder");
                self.cancel_deployment(&deployment_id, true).await;
            }
        }

        if let Err(err) = self.persist_target(&plan).await {
            let _ = reply.send(Err(err));
            return;
        }
        if let Err(err) = self.env.deployments.store(plan.clone()).await {
            let _ = reply.send(Err(err));
            return;
        }
        self.start_plan(plan, Some(reply));
    }

    fn conflicting_deployments(&self, affected: &BTreeSet<PathId>) -> Vec<String> {
        let mut conflicts: Vec<String> = affected
            .iter()
            .filter_map(|id| self.locks.get(id).cloned())
            .collect();
        conflicts.sort();
        conflicts.dedup();
        conflicts
    }

    /// Persist the plan's target root (with the spec versions it carries)
    /// before any step executes.
    async fn persist_target(&self, plan: &DeploymentPlan) -> CoreResult<()> {
        self.store_root_diffed(&plan.target, &plan.original).await
    }

    async fn store_root_diffed(&self, next: &RootGroup, previous: &RootGroup) -> CoreResult<()> {
        let prev_specs = previous.run_specs_by_id();
        let next_specs = next.run_specs_by_id();

        let mut updated_apps = Vec::new();
        let mut updated_pods = Vec::new();
        for (id, spec) in &next_specs {
            if prev_specs.get(id).is_some_and(|p| *p == *spec) {
                continue;
            }
            match spec {
                RunSpec::App(app) => updated_apps.push(app.clone()),
                RunSpec::Pod(pod) => updated_pods.push(pod.clone()),
            }
        }
        let mut deleted_app_ids = Vec::new();
        let mut deleted_pod_ids = Vec::new();
        for (id, spec) in &prev_specs {
            if !next_specs.contains_key(id) {
                match spec {
                    RunSpec::App(_) => deleted_app_ids.push(id.clone()),
                    RunSpec::Pod(_) => deleted_pod_ids.push(id.clone()),
                }
            }
        }

        if let Some(gc) = &self.env.gc {
            for app in &updated_apps {
                gc.store_app_gate(app.id.clone()).await;
            }
            for pod in &updated_pods {
                gc.store_pod_gate(pod.id.clone()).await;
            }
            gc.store_root_gate(next.version()).await;
        }
        self.env
            .roots
            .store_root(
                next.clone(),
                updated_apps,
                deleted_app_ids,
                updated_pods,
                deleted_pod_ids,
            )
            .await
    }

    fn start_plan(&mut self, plan: DeploymentPlan, reply: Option<oneshot::Sender<CoreResult<()>>>) {
        let cancel = self.shutdown.child_token();
        let current_step = Arc::new(AtomicUsize::new(0));
        for id in plan.affected_run_spec_ids() {
            self.locks.insert(id, plan.id.clone());
        }
        self.running.insert(
            plan.id.clone(),
            RunningDeployment {
                plan: plan.clone(),
                cancel: cancel.clone(),
                reply,
                current_step: current_step.clone(),
            },
        );

        let ctx = StepContext {
            tracker: self.env.tracker.clone(),
            kill: self.env.kill.clone(),
            launch_queue: self.env.launch_queue.clone(),
            readiness: self.env.readiness.clone(),
            config: self.env.config.clone(),
            current_step,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = steps::run_plan(&ctx, &plan, &cancel).await;
            let _ = tx
                .send(SchedulerCommand::DeploymentFinished {
                    deployment_id: plan.id.clone(),
                    result,
                })
                .await;
        });
    }

    /// Tear down an in-flight deployment: cancel its driver, release its
    /// locks, fail its promise, and (optionally) revert the root to undo the
    /// parts of the plan that have not happened yet.
    async fn cancel_deployment(&mut self, deployment_id: &str, revert: bool) {
        let Some(run) = self.running.remove(deployment_id) else {
            return;
        };
        run.cancel.cancel();
        self.locks.retain(|_, owner| owner != deployment_id);
        if let Err(err) = self.env.deployments.delete(deployment_id).await {
            tracing::warn!(deployment = %deployment_id, "failed to delete cancelled plan: {err}");
        }
        if revert {
            match self.env.roots.root().await {
                Ok(current) => match run.plan.revert(&current, now()) {
                    Ok(reverted) => {
                        if let Err(err) = self.store_root_diffed(&reverted, &current).await {
                            tracing::error!(deployment = %deployment_id, "revert store failed: {err}");
                        }
                    }
                    Err(err) => {
                        tracing::error!(deployment = %deployment_id, "revert failed: {err}")
                    }
                },
                Err(err) => {
                    tracing::error!(deployment = %deployment_id, "cannot read root for revert: {err}")
                }
            }
        }
        if let Some(reply) = run.reply {
            let _ = reply.send(Err(CoreError::DeploymentCancelled(
                deployment_id.to_string(),
            )));
        }
        self.env.events.publish_deployment(DeploymentEvent::Failed {
            id: deployment_id.to_string(),
            reason: "cancelled".into(),
        });
    }

    async fn on_deployment_finished(&mut self, deployment_id: String, result: CoreResult<()>) {
        let Some(run) = self.running.remove(&deployment_id) else {
            // already cancelled; locks and promise were handled there
            return;
        };
        self.locks.retain(|_, owner| owner != &deployment_id);
        if let Err(err) = self.env.deployments.delete(&deployment_id).await {
            tracing::warn!(deployment = %deployment_id, "failed to delete finished plan: {err}");
        }
        match &result {
            Ok(()) => {
                tracing::info!(deployment = %deployment_id, "deployment finished");
                self.env
                    .events
                    .publish_deployment(DeploymentEvent::Success {
                        id: deployment_id.clone(),
                    });
            }
            Err(err) => {
                tracing::warn!(deployment = %deployment_id, "deployment failed: {err}");
                self.env.events.publish_deployment(DeploymentEvent::Failed {
                    id: deployment_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        if let Some(reply) = run.reply {
            let _ = reply.send(result);
        }
    }

    /// Decommission orphans and hand the offer layer the statuses worth
    /// reconciling, closing with the empty-list sentinel.
    fn start_reconciliation(&self) {
        let tracker = self.env.tracker.clone();
        let roots = self.env.roots.clone();
        let offer = self.env.offer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let known_ids = match roots.root().await {
                Ok(root) => root.run_spec_ids(),
                Err(err) => {
                    tracing::error!("reconciliation cannot read root: {err}");
                    let _ = tx.send(SchedulerCommand::ReconcileFinished).await;
                    return;
                }
            };
            let instances = tracker.instances();
            for instance in &instances {
                if !known_ids.contains(instance.run_spec_id())
                    && instance.state.goal == Goal::Running
                {
                    tracing::info!(instance = %instance.instance_id, "decommissioning orphan");
                    tracker
                        .set_goal(
                            instance.instance_id.clone(),
                            Goal::Decommissioned,
                            GoalReason::Orphaned,
                        )
                        .await;
                }
            }

            let statuses: Vec<TaskStatus> = instances
                .iter()
                .flat_map(|i| i.tasks.values())
                .filter(|t| {
                    !t.condition.is_terminal()
                        && t.condition != regatta_model::condition::Condition::Provisioned
                })
                .map(|t| TaskStatus {
                    task_id: t.task_id.clone(),
                    condition: t.condition,
                })
                .collect();
            tracing::info!(tasks = statuses.len(), "submitting task reconciliation");
            offer.reconcile(statuses).await;
            // sentinel: reconciliation round complete
            offer.reconcile(Vec::new()).await;
            let _ = tx.send(SchedulerCommand::ReconcileFinished).await;
        });
    }

    /// Walk the persisted root and enqueue launch demand for every run spec
    /// whose live count is short of its target.
    async fn scale_run_specs(&self) {
        let root = match self.env.roots.root().await {
            Ok(root) => root,
            Err(err) => {
                tracing::error!("scale loop cannot read root: {err}");
                return;
            }
        };
        for spec in root.transitive_run_specs() {
            let live = self
                .env
                .tracker
                .instances_of(spec.id())
                .into_iter()
                .filter(|i| {
                    i.state.goal == Goal::Running && (i.is_active() || i.is_scheduled())
                })
                .count();
            let target = spec.instances() as usize;
            if live < target {
                let delta = (target - live) as u32;
                tracing::info!(run_spec = %spec.id(), delta, "scaling up to target");
                let role = spec
                    .role()
                    .unwrap_or(&self.env.config.default_role)
                    .to_string();
                self.env
                    .tracker
                    .schedule(spec.clone(), role, delta)
                    .await;
                self.env.launch_queue.add(spec.clone(), delta).await;
            }
        }
    }
}
