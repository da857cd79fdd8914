use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::group::{GroupError, GroupOp, RootGroup};
use crate::instance::InstanceId;
use crate::path::PathId;
use crate::run_spec::{RunSpec, Timestamp};

/// One unit of deployment work. Actions within a step run in parallel; the
/// step completes when every action has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Backward-compat placeholder emitted for freshly added run specs.
    /// Always completes immediately; the real work rides the Scale action.
    Start { spec: RunSpec },
    /// Stop and decommission every instance of a removed run spec.
    Stop { spec: RunSpec },
    /// Drive the live instance count to `to`, killing `sentenced` first when
    /// shrinking.
    Scale {
        spec: RunSpec,
        to: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sentenced: Vec<InstanceId>,
    },
    /// Replace every instance with the new configuration, honouring the
    /// spec's upgrade strategy.
    Restart { spec: RunSpec },
}

impl DeploymentAction {
    pub fn spec(&self) -> &RunSpec {
        match self {
            DeploymentAction::Start { spec }
            | DeploymentAction::Stop { spec }
            | DeploymentAction::Scale { spec, .. }
            | DeploymentAction::Restart { spec } => spec,
        }
    }

    fn json_name(&self) -> &'static str {
        match self {
            DeploymentAction::Start { .. } => "StartApplication",
            DeploymentAction::Stop { .. } => "StopApplication",
            DeploymentAction::Scale { .. } => "ScaleApplication",
            DeploymentAction::Restart { .. } => "RestartApplication",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

/// An ordered plan transforming `original` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub original: RootGroup,
    pub target: RootGroup,
    pub steps: Vec<DeploymentStep>,
    pub version: Timestamp,
}

impl DeploymentPlan {
    /// Compute the plan from `original` to `target`.
    ///
    /// Step composition: removed specs stop first, added specs then start at
    /// zero instances, and finally the affected specs scale or restart in
    /// dependency layers (specs whose longest dependency chain is shorter go
    /// first). Empty steps are dropped.
    pub fn plan(
        original: &RootGroup,
        target: &RootGroup,
        to_kill: &BTreeMap<PathId, Vec<InstanceId>>,
        version: Timestamp,
    ) -> DeploymentPlan {
        let original_specs = original.run_specs_by_id();
        let target_specs = target.run_specs_by_id();

        let mut steps: Vec<DeploymentStep> = Vec::new();

        let stops: Vec<DeploymentAction> = original_specs
            .iter()
            .filter(|(id, _)| !target_specs.contains_key(*id))
            .map(|(_, spec)| DeploymentAction::Stop {
                spec: (*spec).clone(),
            })
            .collect();
        steps.push(DeploymentStep { actions: stops });

        let starts: Vec<DeploymentAction> = target_specs
            .iter()
            .filter(|(id, _)| !original_specs.contains_key(*id))
            .map(|(_, spec)| DeploymentAction::Start {
                spec: (*spec).clone(),
            })
            .collect();
        steps.push(DeploymentStep { actions: starts });

        // dependency-layered scale/restart work over added and changed specs
        let graph = target.dependency_graph();
        let mut layers: BTreeMap<usize, Vec<DeploymentAction>> = BTreeMap::new();
        for (id, spec) in &target_specs {
            let action = match original_specs.get(id) {
                None => Some(DeploymentAction::Scale {
                    spec: (*spec).clone(),
                    to: spec.instances(),
                    sentenced: Vec::new(),
                }),
                Some(old) => {
                    if spec.is_only_scale_change(old) || (spec.needs_restart(old) && spec.is_scaled_to_zero()) {
                        Some(DeploymentAction::Scale {
                            spec: (*spec).clone(),
                            to: spec.instances(),
                            sentenced: to_kill.get(id).cloned().unwrap_or_default(),
                        })
                    } else if spec.needs_restart(old) {
                        Some(DeploymentAction::Restart {
                            spec: (*spec).clone(),
                        })
                    } else {
                        None
                    }
                }
            };
            if let Some(action) = action {
                // BTreeMap iteration keeps actions sorted by run spec id
                layers.entry(graph.longest_chain(id)).or_default().push(action);
            }
        }
        steps.extend(
            layers
                .into_values()
                .map(|actions| DeploymentStep { actions }),
        );

        steps.retain(|step| !step.actions.is_empty());

        DeploymentPlan {
            id: Uuid::new_v4().to_string(),
            original: original.clone(),
            target: target.clone(),
            steps,
            version,
        }
    }

    /// Ids this plan may touch: present in exactly one of the two roots, or
    /// present in both with different config or scale.
    pub fn affected_run_spec_ids(&self) -> BTreeSet<PathId> {
        affected_ids(&self.original, &self.target)
    }

    pub fn is_affecting(&self, id: &PathId) -> bool {
        self.affected_run_spec_ids().contains(id)
    }

    /// Undo `target - original` on top of `current`, leaving run specs that
    /// joined after this plan started untouched. Used when a deployment is
    /// cancelled mid-flight.
    pub fn revert(&self, current: &RootGroup, now: Timestamp) -> Result<RootGroup, GroupError> {
        let original_specs = self.original.run_specs_by_id();
        let mut ops: Vec<GroupOp> = Vec::new();
        for id in self.affected_run_spec_ids() {
            match original_specs.get(&id) {
                Some(spec) => ops.push(match (*spec).clone() {
                    RunSpec::App(app) => GroupOp::PutApp(app),
                    RunSpec::Pod(pod) => GroupOp::PutPod(pod),
                }),
                None => {
                    // only ever existed in the target: remove it again
                    match current.run_spec(&id) {
                        Some(RunSpec::App(_)) => ops.push(GroupOp::DeleteApp(id)),
                        Some(RunSpec::Pod(_)) => ops.push(GroupOp::DeletePod(id)),
                        None => {}
                    }
                }
            }
        }
        current.update(&PathId::root(), ops, now)
    }

    /// The external JSON shape: one `actions` array per step, each entry an
    /// action name plus the app or pod id it applies to.
    pub fn json_repr(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .steps
            .iter()
            .map(|step| {
                let actions: Vec<serde_json::Value> = step
                    .actions
                    .iter()
                    .map(|action| {
                        let key = match action.spec() {
                            RunSpec::App(_) => "app",
                            RunSpec::Pod(_) => "pod",
                        };
                        json!({
                            "action": action.json_name(),
                            key: action.spec().id().to_string(),
                        })
                    })
                    .collect();
                json!({ "actions": actions })
            })
            .collect();
        json!({
            "id": self.id,
            "version": self.version,
            "steps": steps,
        })
    }
}

impl Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(&self.json_repr()).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json)
    }
}

fn affected_ids(original: &RootGroup, target: &RootGroup) -> BTreeSet<PathId> {
    let original_specs = original.run_specs_by_id();
    let target_specs = target.run_specs_by_id();
    let mut out = BTreeSet::new();
    for (id, spec) in &original_specs {
        match target_specs.get(id) {
            None => {
                out.insert(id.clone());
            }
            Some(other) => {
                if spec.needs_restart(other) || spec.instances() != other.instances() {
                    out.insert(id.clone());
                }
            }
        }
    }
    for id in target_specs.keys() {
        if !original_specs.contains_key(id) {
            out.insert(id.clone());
        }
    }
    out
}
