use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dependency::DependencyGraph;
use crate::path::PathId;
use crate::run_spec::{AppDefinition, PodDefinition, RunSpec, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} conflicts with an existing entry of the other kind")]
    Conflict(PathId),
    #[error("dependency cycle: {0}")]
    Cycle(String),
}

/// A namespace of run specs and sub-groups. Children are keyed by their full
/// path id; nothing points back at the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: PathId,
    #[serde(default)]
    pub enforce_role: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<PathId, Group>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub run_specs: BTreeMap<PathId, RunSpec>,
    pub version: Timestamp,
}

impl Group {
    fn empty(id: PathId, version: Timestamp) -> Self {
        Group {
            id,
            enforce_role: false,
            groups: BTreeMap::new(),
            run_specs: BTreeMap::new(),
            version,
        }
    }

    /// Descend to the group with the given id, if present.
    pub fn find_group(&self, id: &PathId) -> Option<&Group> {
        if &self.id == id {
            return Some(self);
        }
        self.groups
            .values()
            .find(|g| id == &g.id || id.is_child_of(&g.id))
            .and_then(|g| g.find_group(id))
    }

    fn find_group_mut(&mut self, id: &PathId) -> Option<&mut Group> {
        if &self.id == id {
            return Some(self);
        }
        self.groups
            .values_mut()
            .find(|g| id == &g.id || id.is_child_of(&g.id))
            .and_then(|g| g.find_group_mut(id))
    }

    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut out: Vec<&RunSpec> = self.run_specs.values().collect();
        for group in self.groups.values() {
            out.extend(group.transitive_run_specs());
        }
        out
    }

    pub fn transitive_group_ids(&self) -> Vec<&PathId> {
        let mut out: Vec<&PathId> = vec![&self.id];
        for group in self.groups.values() {
            out.extend(group.transitive_group_ids());
        }
        out
    }
}

/// One operation inside a root-group update. Relative ids are resolved
/// against the update's target group path before anything else happens.
#[derive(Debug, Clone)]
pub enum GroupOp {
    PutApp(AppDefinition),
    PutPod(PodDefinition),
    PutGroup { id: PathId, enforce_role: bool },
    DeleteApp(PathId),
    DeletePod(PathId),
    DeleteGroup(PathId),
    SetEnforceRole { id: PathId, enforce_role: bool },
}

/// The top of the group tree; the unit of atomic update. All mutation goes
/// through [`RootGroup::update`], which returns a fresh validated root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootGroup {
    pub root: Group,
}

impl RootGroup {
    pub fn empty(version: Timestamp) -> Self {
        RootGroup {
            root: Group::empty(PathId::root(), version),
        }
    }

    pub fn version(&self) -> Timestamp {
        self.root.version
    }

    pub fn group(&self, id: &PathId) -> Option<&Group> {
        self.root.find_group(id)
    }

    pub fn run_spec(&self, id: &PathId) -> Option<&RunSpec> {
        self.root.find_group(&id.parent())?.run_specs.get(id)
    }

    pub fn app(&self, id: &PathId) -> Option<&AppDefinition> {
        match self.run_spec(id)? {
            RunSpec::App(app) => Some(app),
            RunSpec::Pod(_) => None,
        }
    }

    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        self.root.transitive_run_specs()
    }

    pub fn run_specs_by_id(&self) -> BTreeMap<PathId, &RunSpec> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| (s.id().clone(), s))
            .collect()
    }

    pub fn run_spec_ids(&self) -> BTreeSet<PathId> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| s.id().clone())
            .collect()
    }

    /// Dependency graph over run specs. A dependency naming a group expands
    /// to every run spec underneath that group.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut edges: BTreeMap<PathId, BTreeSet<PathId>> = BTreeMap::new();
        for spec in self.transitive_run_specs() {
            let mut deps: BTreeSet<PathId> = BTreeSet::new();
            for dep in spec.dependencies() {
                if let Some(group) = self.group(dep) {
                    deps.extend(
                        group
                            .transitive_run_specs()
                            .into_iter()
                            .map(|s| s.id().clone()),
                    );
                } else {
                    deps.insert(dep.clone());
                }
            }
            deps.remove(spec.id());
            edges.insert(spec.id().clone(), deps);
        }
        DependencyGraph::new(edges)
    }

    /// Convenience wrapper around [`RootGroup::update`] for a single app.
    pub fn put_app(&self, app: AppDefinition, now: Timestamp) -> Result<RootGroup, GroupError> {
        self.update(&PathId::root(), vec![GroupOp::PutApp(app)], now)
    }

    pub fn put_pod(&self, pod: PodDefinition, now: Timestamp) -> Result<RootGroup, GroupError> {
        self.update(&PathId::root(), vec![GroupOp::PutPod(pod)], now)
    }

    /// Apply a batch of operations atomically: either every op applies and
    /// the result validates, or the original root is left untouched.
    pub fn update(
        &self,
        base: &PathId,
        ops: Vec<GroupOp>,
        now: Timestamp,
    ) -> Result<RootGroup, GroupError> {
        let mut next = self.clone();
        next.reject_role_toggle_with_spec_changes(base, &ops)?;
        for op in ops {
            next.apply(base, op, now)?;
        }
        next.root.version = now;
        next.validate()?;
        Ok(next)
    }

    /// An update that flips `enforceRole` on a group must not also touch run
    /// specs under that group; allowing both would make the intended role of
    /// the touched specs ambiguous.
    fn reject_role_toggle_with_spec_changes(
        &self,
        base: &PathId,
        ops: &[GroupOp],
    ) -> Result<(), GroupError> {
        let mut toggled: Vec<PathId> = Vec::new();
        for op in ops {
            match op {
                GroupOp::SetEnforceRole { id, enforce_role }
                | GroupOp::PutGroup {
                    id,
                    enforce_role,
                } => {
                    let id = id.canonical(base);
                    let current = self.group(&id).map(|g| g.enforce_role).unwrap_or(false);
                    if current != *enforce_role {
                        toggled.push(id);
                    }
                }
                _ => {}
            }
        }
        if toggled.is_empty() {
            return Ok(());
        }
        for op in ops {
            let changed = match op {
                GroupOp::PutApp(app) => Some(app.id.canonical(base)),
                GroupOp::PutPod(pod) => Some(pod.id.canonical(base)),
                GroupOp::DeleteApp(id) | GroupOp::DeletePod(id) => Some(id.canonical(base)),
                _ => None,
            };
            if let Some(id) = changed {
                if let Some(group) = toggled.iter().find(|g| id.is_child_of(g)) {
                    return Err(GroupError::Validation(format!(
                        "cannot change {id} while toggling enforceRole on {group} in the same update"
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, base: &PathId, op: GroupOp, now: Timestamp) -> Result<(), GroupError> {
        match op {
            GroupOp::PutApp(mut app) => {
                app.id = app.id.canonical(base);
                self.put_run_spec(RunSpec::App(app), now)
            }
            GroupOp::PutPod(mut pod) => {
                pod.id = pod.id.canonical(base);
                self.put_run_spec(RunSpec::Pod(pod), now)
            }
            GroupOp::PutGroup { id, enforce_role } => {
                let id = id.canonical(base);
                if id.is_root() {
                    return Err(GroupError::Validation(
                        "the root group cannot be replaced".into(),
                    ));
                }
                self.ensure_group(&id, now)?;
                self.root
                    .find_group_mut(&id)
                    .expect("group just ensured")
                    .enforce_role = enforce_role;
                Ok(())
            }
            GroupOp::DeleteApp(id) | GroupOp::DeletePod(id) => {
                let id = id.canonical(base);
                if let Some(parent) = self.root.find_group_mut(&id.parent()) {
                    parent.run_specs.remove(&id);
                }
                Ok(())
            }
            GroupOp::DeleteGroup(id) => {
                let id = id.canonical(base);
                if id.is_root() {
                    return Err(GroupError::Validation("cannot delete the root group".into()));
                }
                if let Some(parent) = self.root.find_group_mut(&id.parent()) {
                    parent.groups.remove(&id);
                }
                Ok(())
            }
            GroupOp::SetEnforceRole { id, enforce_role } => {
                let id = id.canonical(base);
                let group = self.root.find_group_mut(&id).ok_or_else(|| {
                    GroupError::Validation(format!("group {id} does not exist"))
                })?;
                group.enforce_role = enforce_role;
                Ok(())
            }
        }
    }

    fn put_run_spec(&mut self, mut spec: RunSpec, now: Timestamp) -> Result<(), GroupError> {
        let id = spec.id().clone();
        if id.segments().is_empty() {
            return Err(GroupError::Validation(
                "a run spec id needs at least one segment".into(),
            ));
        }
        // a run spec id may never shadow a group id
        if self.group(&id).is_some() {
            return Err(GroupError::Conflict(id));
        }
        self.ensure_group(&id.parent(), now)?;

        if let Some(role) = self.enforced_role(&id) {
            match spec.role() {
                None => spec.set_role(role),
                Some(own) if own == role => {}
                Some(own) => {
                    return Err(GroupError::Validation(format!(
                        "{id} declares role {own:?} but its top-level group enforces {role:?}"
                    )));
                }
            }
        }

        let previous = self.run_spec(&id).cloned();
        let version_info = match &previous {
            None => crate::run_spec::VersionInfo::only(now),
            Some(prev) if spec.is_only_scale_change(prev) => {
                prev.version_info().with_scaling(now)
            }
            Some(prev) if !spec.needs_restart(prev) && spec.instances() == prev.instances() => {
                // nothing changed; keep the stored version
                prev.version_info().clone()
            }
            Some(prev) => prev.version_info().with_config_change(now),
        };
        spec.set_version_info(version_info);

        let parent = self
            .root
            .find_group_mut(&id.parent())
            .expect("parent group just ensured");
        parent.run_specs.insert(id, spec);
        Ok(())
    }

    /// Create the group chain down to `id`, refusing to shadow run specs.
    fn ensure_group(&mut self, id: &PathId, now: Timestamp) -> Result<(), GroupError> {
        let mut chain = id.ancestors();
        chain.push(id.clone());
        for group_id in chain {
            if group_id.is_root() {
                continue;
            }
            if self.run_spec(&group_id).is_some() {
                return Err(GroupError::Conflict(group_id));
            }
            let parent = self
                .root
                .find_group_mut(&group_id.parent())
                .expect("ancestors are created in order");
            parent
                .groups
                .entry(group_id.clone())
                .or_insert_with(|| Group::empty(group_id.clone(), now));
        }
        Ok(())
    }

    /// The role a run spec under `id` must carry, if its top-level group
    /// enforces one. The group's name is the role.
    pub fn enforced_role(&self, id: &PathId) -> Option<String> {
        let top_level = id.ancestors().into_iter().find(|a| !a.is_root())?;
        let group = self.group(&top_level)?;
        if group.enforce_role {
            Some(top_level.name().to_string())
        } else {
            None
        }
    }

    fn validate(&self) -> Result<(), GroupError> {
        // role consistency under enforcing top-level groups
        for spec in self.transitive_run_specs() {
            if let Some(role) = self.enforced_role(spec.id()) {
                match spec.role() {
                    Some(own) if own != role => {
                        return Err(GroupError::Validation(format!(
                            "{} carries role {own:?} under an enforced group expecting {role:?}",
                            spec.id()
                        )));
                    }
                    None => {
                        return Err(GroupError::Validation(format!(
                            "{} is missing the enforced role {role:?}",
                            spec.id()
                        )));
                    }
                    _ => {}
                }
            }
        }
        let graph = self.dependency_graph();
        if let Some(cycle) = graph.find_cycle() {
            let rendered: Vec<String> = cycle.iter().map(|p| p.to_string()).collect();
            return Err(GroupError::Cycle(rendered.join(" -> ")));
        }
        Ok(())
    }
}
