use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regatta_model::condition::Condition;
use regatta_model::deployment::{DeploymentAction, DeploymentPlan};
use regatta_model::instance::{Goal, Instance, InstanceId};
use regatta_model::run_spec::RunSpec;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::deps::{LaunchQueue, ReadinessProvider};
use crate::error::{CoreError, CoreResult};
use crate::kill::KillService;
use crate::tracker::{GoalReason, InstanceTracker};

/// Everything a deployment driver needs to execute steps, cloned out of the
/// scheduler so the actor never blocks on step progress.
#[derive(Clone)]
pub(crate) struct StepContext {
    pub tracker: InstanceTracker,
    pub kill: KillService,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub readiness: Arc<dyn ReadinessProvider>,
    pub config: CoreConfig,
    /// Index of the step currently executing, for status queries.
    pub current_step: Arc<AtomicUsize>,
}

impl StepContext {
    fn role_for(&self, spec: &RunSpec) -> String {
        spec.role().unwrap_or(&self.config.default_role).to_string()
    }

    fn tracker(&self) -> &InstanceTracker {
        &self.tracker
    }
}

/// Run every step of the plan in order; actions within a step run in
/// parallel and the next step starts only when all of them completed.
pub(crate) async fn run_plan(
    ctx: &StepContext,
    plan: &DeploymentPlan,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    for (index, step) in plan.steps.iter().enumerate() {
        ctx.current_step.store(index, Ordering::SeqCst);
        tracing::info!(
            deployment = %plan.id,
            step = index + 1,
            of = plan.steps.len(),
            actions = step.actions.len(),
            "running deployment step"
        );
        let all = futures::future::try_join_all(
            step.actions.iter().map(|action| perform_action(ctx, action)),
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CoreError::DeploymentCancelled(plan.id.clone()));
            }
            result = all => {
                result.map_err(|err| match err {
                    CoreError::DeploymentCancelled(id) => CoreError::DeploymentCancelled(id),
                    other => CoreError::DeploymentFailed {
                        id: plan.id.clone(),
                        reason: other.to_string(),
                    },
                })?;
            }
        }
    }
    Ok(())
}

async fn perform_action(ctx: &StepContext, action: &DeploymentAction) -> CoreResult<()> {
    match action {
        DeploymentAction::Start { spec } => {
            // compatibility placeholder: the spec starts with zero instances
            // and the scale action that follows does the actual work
            tracing::debug!(run_spec = %spec.id(), "start action (noop)");
            Ok(())
        }
        DeploymentAction::Stop { spec } => stop_run_spec(ctx, spec).await,
        DeploymentAction::Scale {
            spec,
            to,
            sentenced,
        } => scale_run_spec(ctx, spec, *to, sentenced).await,
        DeploymentAction::Restart { spec } => restart_run_spec(ctx, spec).await,
    }
}

/// Decommission every instance of a removed run spec and wait until the
/// tracker has forgotten all of them.
async fn stop_run_spec(ctx: &StepContext, spec: &RunSpec) -> CoreResult<()> {
    let id = spec.id();
    ctx.launch_queue.purge(id).await;
    let instances = ctx.tracker.instances_of(id);
    for instance in &instances {
        ctx.tracker
            .set_goal(
                instance.instance_id.clone(),
                Goal::Decommissioned,
                GoalReason::Stopping,
            )
            .await;
    }
    // re-read so the kill selection sees the new goals
    let doomed = ctx.tracker.instances_of(id);
    ctx.kill.kill_instances(doomed).await;
    wait_for(ctx, spec, |tracker| tracker.instances_of(id).is_empty()).await
}

/// Drive the live instance count of a run spec to `to`.
async fn scale_run_spec(
    ctx: &StepContext,
    spec: &RunSpec,
    to: u32,
    sentenced: &[InstanceId],
) -> CoreResult<()> {
    let id = spec.id();
    let target = to as usize;

    let launched: Vec<Instance> = ctx
        .tracker
        .instances_of(id)
        .into_iter()
        .filter(|i| i.state.goal == Goal::Running && (i.is_active() || i.is_scheduled()))
        .collect();

    if launched.len() > target {
        let surplus = launched.len() - target;
        let mut victims: Vec<Instance> = Vec::with_capacity(surplus);
        // sentenced instances die first, then the youngest
        for sentenced_id in sentenced {
            if victims.len() == surplus {
                break;
            }
            if let Some(instance) = launched.iter().find(|i| &i.instance_id == sentenced_id) {
                victims.push(instance.clone());
            }
        }
        let mut rest: Vec<&Instance> = launched
            .iter()
            .filter(|i| !victims.iter().any(|v| v.instance_id == i.instance_id))
            .collect();
        rest.sort_by_key(|i| std::cmp::Reverse(i.state.since));
        victims.extend(rest.into_iter().take(surplus - victims.len()).cloned());

        for victim in &victims {
            ctx.tracker
                .set_goal(
                    victim.instance_id.clone(),
                    Goal::Decommissioned,
                    GoalReason::Scaling,
                )
                .await;
        }
        let doomed: Vec<Instance> = victims
            .iter()
            .filter_map(|v| ctx.tracker.instance(&v.instance_id))
            .collect();
        ctx.kill.kill_instances(doomed).await;
    } else if launched.len() < target {
        let delta = (target - launched.len()) as u32;
        ctx.tracker
            .schedule(spec.clone(), ctx.role_for(spec), delta)
            .await;
        ctx.launch_queue.add(spec.clone(), delta).await;
    }

    wait_for(ctx, spec, |tracker| {
        let instances = tracker.instances_of(id);
        let launched = instances
            .iter()
            .filter(|i| i.state.goal == Goal::Running && (i.is_active() || i.is_scheduled()))
            .count();
        let ready = instances
            .iter()
            .filter(|i| is_ready_capacity(tracker, spec, i))
            .count();
        launched <= target && ready >= target
    })
    .await
}

/// Replace all instances of a run spec with the new configuration while
/// keeping old-plus-new capacity inside the upgrade strategy's bounds.
async fn restart_run_spec(ctx: &StepContext, spec: &RunSpec) -> CoreResult<()> {
    let id = spec.id();
    let target = spec.instances() as usize;
    let strategy = spec.upgrade_strategy();
    let floor = strategy.health_floor(spec.instances()) as usize;
    let ceiling = strategy.capacity_ceiling(spec.instances()) as usize;
    let new_version = spec.version();

    let mut events = ctx.tracker.events().subscribe_instances();
    let mut readiness = ReadinessWatch::default();
    loop {
        readiness.sync(ctx, spec);
        let instances = ctx.tracker.instances_of(id);
        let is_old = |i: &Instance| i.run_spec.version() < new_version;

        // anything not yet terminal occupies capacity, goals notwithstanding
        let occupied = instances
            .iter()
            .filter(|i| i.is_active() || i.state.condition == Condition::Scheduled)
            .count();
        let old_scheduled: Vec<&Instance> = instances
            .iter()
            .filter(|i| is_old(i) && i.state.goal == Goal::Running && i.is_scheduled())
            .collect();
        let mut old_active: Vec<&Instance> = instances
            .iter()
            .filter(|i| is_old(i) && i.state.goal == Goal::Running && i.is_active())
            .collect();
        let old_remaining = instances
            .iter()
            .filter(|i| is_old(i) && (i.is_active() || i.is_scheduled()))
            .count();
        let new_total = instances
            .iter()
            .filter(|i| {
                !is_old(i) && i.state.goal == Goal::Running && (i.is_active() || i.is_scheduled())
            })
            .count();
        let new_ready = instances
            .iter()
            .filter(|i| !is_old(i) && is_ready_capacity(ctx.tracker(), spec, i))
            .count();

        if old_remaining == 0 && new_ready >= target {
            return Ok(());
        }

        // old scheduled instances would launch the stale config; drop them
        // outright, they carry no capacity
        let mut victims: Vec<Instance> = old_scheduled.iter().map(|i| (*i).clone()).collect();

        // kill as many old running instances as the health floor allows
        let killable = (old_active.len() + new_ready).saturating_sub(floor);
        if killable > 0 {
            old_active.sort_by_key(|i| i.state.since);
            victims.extend(old_active.iter().take(killable).map(|i| (*i).clone()));
        }
        if !victims.is_empty() {
            for victim in &victims {
                ctx.tracker
                    .set_goal(
                        victim.instance_id.clone(),
                        Goal::Decommissioned,
                        GoalReason::Scaling,
                    )
                    .await;
            }
            let doomed: Vec<Instance> = victims
                .iter()
                .filter_map(|v| ctx.tracker.instance(&v.instance_id))
                .collect();
            ctx.kill.request_kill(doomed).await;
        }

        // launch replacements while staying under the capacity ceiling
        let room = ceiling.saturating_sub(occupied);
        let want = target.saturating_sub(new_total);
        let launch = room.min(want) as u32;
        if launch > 0 {
            ctx.tracker
                .schedule(spec.clone(), ctx.role_for(spec), launch)
                .await;
            ctx.launch_queue.add(spec.clone(), launch).await;
        }

        match events.recv().await {
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(CoreError::Storage("instance event stream closed".into()));
            }
        }
    }
}

/// An instance that counts toward a spec's healthy target capacity: live,
/// wanted, and ready if the spec gates on readiness checks.
fn is_ready_capacity(tracker: &InstanceTracker, spec: &RunSpec, instance: &Instance) -> bool {
    instance.state.goal == Goal::Running
        && instance.is_active()
        && (!spec.has_readiness_checks() || tracker.is_ready(&instance.instance_id))
}

/// Keeps one readiness probe running per active instance of a gated spec.
/// Verdicts land in the tracker's ready flags, whose change events wake the
/// surrounding wait loop.
#[derive(Default)]
struct ReadinessWatch {
    watched: HashSet<InstanceId>,
}

impl ReadinessWatch {
    fn sync(&mut self, ctx: &StepContext, spec: &RunSpec) {
        if !spec.has_readiness_checks() {
            return;
        }
        for instance in ctx.tracker.instances_of(spec.id()) {
            if !instance.is_active() || instance.state.goal != Goal::Running {
                continue;
            }
            if !self.watched.insert(instance.instance_id.clone()) {
                continue;
            }
            let provider = ctx.readiness.clone();
            let tracker = ctx.tracker.clone();
            let spec = spec.clone();
            let instance_id = instance.instance_id;
            tokio::spawn(async move {
                let ready = provider.await_ready(&spec, &instance_id).await;
                tracker.set_ready(instance_id, ready).await;
            });
        }
    }
}

/// Block until `predicate` holds, re-evaluating on every instance event and
/// probing readiness for instances that come up along the way.
async fn wait_for<F>(ctx: &StepContext, spec: &RunSpec, predicate: F) -> CoreResult<()>
where
    F: Fn(&InstanceTracker) -> bool,
{
    let mut events = ctx.tracker.events().subscribe_instances();
    let mut readiness = ReadinessWatch::default();
    loop {
        readiness.sync(ctx, spec);
        if predicate(&ctx.tracker) {
            return Ok(());
        }
        match events.recv().await {
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(CoreError::Storage("instance event stream closed".into()));
            }
        }
    }
}
