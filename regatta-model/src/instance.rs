use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{Condition, aggregate_health, reduce_conditions};
use crate::path::PathId;
use crate::run_spec::{RunSpec, Timestamp, UnreachableStrategy};

/// Prefix for ids minted by this control plane.
pub const INSTANCE_PREFIX: &str = "instance-";
/// Prefix found on ids minted before the instance/task split; still accepted
/// everywhere an id is parsed.
pub const LEGACY_PREFIX: &str = "marathon-";

/// Node id for time-based uuids. Random per process but stable within it,
/// so ids minted by one leader sort by creation time.
static NODE_ID: Lazy<[u8; 6]> = Lazy::new(|| {
    let mut node = [0u8; 6];
    node.copy_from_slice(&Uuid::new_v4().as_bytes()[..6]);
    node
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceIdError {
    #[error("{0:?} does not match <safeRunSpecId>.<prefix><uuid>")]
    Malformed(String),
    #[error("{0:?} embeds an invalid run spec id")]
    BadRunSpecId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPrefix {
    Instance,
    Legacy,
}

impl IdPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            IdPrefix::Instance => INSTANCE_PREFIX,
            IdPrefix::Legacy => LEGACY_PREFIX,
        }
    }
}

/// Identity of one replica of a run spec.
///
/// String form is `<safeRunSpecId>.<prefix><uuid>`; the run spec id embeds
/// with `/` replaced by the safe-path sentinel so the whole id stays a single
/// dot-delimited token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub run_spec_id: PathId,
    pub prefix: IdPrefix,
    pub uuid: Uuid,
}

impl InstanceId {
    /// Mint a fresh id for a replica of `run_spec_id` using a time-based uuid.
    pub fn new(run_spec_id: PathId) -> Self {
        InstanceId {
            run_spec_id,
            prefix: IdPrefix::Instance,
            uuid: Uuid::now_v1(&NODE_ID),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InstanceIdError> {
        // format: ^(.+)\.(instance-|marathon-)([^.]+)$
        let (safe_id, rest) = raw
            .rsplit_once('.')
            .filter(|(safe_id, _)| !safe_id.is_empty())
            .ok_or_else(|| InstanceIdError::Malformed(raw.to_string()))?;
        let (prefix, uuid_part) = if let Some(u) = rest.strip_prefix(INSTANCE_PREFIX) {
            (IdPrefix::Instance, u)
        } else if let Some(u) = rest.strip_prefix(LEGACY_PREFIX) {
            (IdPrefix::Legacy, u)
        } else {
            return Err(InstanceIdError::Malformed(raw.to_string()));
        };
        let uuid =
            Uuid::parse_str(uuid_part).map_err(|_| InstanceIdError::Malformed(raw.to_string()))?;
        let run_spec_id = PathId::from_safe_path(safe_id)
            .map_err(|_| InstanceIdError::BadRunSpecId(raw.to_string()))?;
        Ok(InstanceId {
            run_spec_id,
            prefix,
            uuid,
        })
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}{}",
            self.run_spec_id.safe_path(),
            self.prefix.as_str(),
            self.uuid
        )
    }
}

impl FromStr for InstanceId {
    type Err = InstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceId::parse(s)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        InstanceId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identity of the unit the offer layer launches. Apps have exactly one task
/// per instance; pod tasks are distinguished by container name. String form
/// is the instance id, with `.<container>` appended for pod tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub instance_id: InstanceId,
    pub container: Option<String>,
}

impl TaskId {
    pub fn for_instance(instance_id: InstanceId) -> Self {
        TaskId {
            instance_id,
            container: None,
        }
    }

    pub fn for_container(instance_id: InstanceId, container: &str) -> Self {
        TaskId {
            instance_id,
            container: Some(container.to_string()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InstanceIdError> {
        // a bare instance id is an app task; otherwise the trailing dot
        // segment is the container name
        if let Ok(instance_id) = InstanceId::parse(raw) {
            return Ok(TaskId {
                instance_id,
                container: None,
            });
        }
        let (left, container) = raw
            .rsplit_once('.')
            .ok_or_else(|| InstanceIdError::Malformed(raw.to_string()))?;
        let instance_id = InstanceId::parse(left)?;
        Ok(TaskId {
            instance_id,
            container: Some(container.to_string()),
        })
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}.{}", self.instance_id, container),
            None => write!(f, "{}", self.instance_id),
        }
    }
}

impl FromStr for TaskId {
    type Err = InstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::parse(s)
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TaskId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Placement facts bound when the offer layer commits a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    /// Set while the task is unreachable; drives the inactive promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable_since: Option<Timestamp>,
}

impl Task {
    pub fn new(task_id: TaskId, condition: Condition) -> Self {
        Task {
            task_id,
            condition,
            started_at: None,
            healthy: None,
            unreachable_since: None,
        }
    }
}

/// What the orchestrator wants for an instance, as opposed to what the offer
/// layer last reported about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Keep it running; relaunch through deployments when it dies.
    Running,
    /// Kill the tasks but retain the reservation for a later resume.
    Stopped,
    /// Kill the tasks, release reservations, expunge once terminal.
    Decommissioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    pub since: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_since: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    pub goal: Goal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationId {
    /// Derived from the instance id; the stable modern form.
    Simplified(InstanceId),
    /// Task-derived form carried over from old persisted state.
    Legacy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    New {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<Timestamp>,
    },
    Launched,
    Suspended {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<Timestamp>,
    },
    Garbage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<Timestamp>,
    },
    Unknown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<Timestamp>,
    },
}

impl ReservationState {
    pub fn deadline(&self) -> Option<Timestamp> {
        match self {
            ReservationState::New { deadline }
            | ReservationState::Suspended { deadline }
            | ReservationState::Garbage { deadline }
            | ReservationState::Unknown { deadline } => *deadline,
            ReservationState::Launched => None,
        }
    }

    /// State after the per-state deadline fires. Everything funnels toward
    /// `Garbage`; the tracker expunges garbage reservations.
    pub fn on_timeout(&self) -> ReservationState {
        match self {
            ReservationState::Launched => ReservationState::Launched,
            _ => ReservationState::Garbage { deadline: None },
        }
    }
}

/// A persistent resource claim (typically disk) bound to an instance id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub volume_ids: Vec<String>,
    pub state: ReservationState,
    pub id: ReservationId,
}

/// The runtime counterpart of one run spec replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_info: Option<AgentInfo>,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Snapshot of the spec this instance was launched with, version-pinned.
    pub run_spec: RunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
    /// Role resources were reserved against. Can lag behind `run_spec.role()`
    /// for resident instances during a role migration.
    pub role: String,
}

impl Instance {
    /// A fresh replica waiting for the offer layer: no tasks, no agent.
    pub fn scheduled(run_spec: RunSpec, role: String, now: Timestamp) -> Self {
        let instance_id = InstanceId::new(run_spec.id().clone());
        Instance {
            instance_id,
            agent_info: None,
            state: InstanceState {
                condition: Condition::Scheduled,
                since: now,
                active_since: None,
                healthy: None,
                goal: Goal::Running,
            },
            tasks: BTreeMap::new(),
            run_spec,
            reservation: None,
            role,
        }
    }

    pub fn run_spec_id(&self) -> &PathId {
        self.run_spec.id()
    }

    /// Waiting for (re)provisioning: goal is Running and nothing is live.
    pub fn is_scheduled(&self) -> bool {
        self.state.goal == Goal::Running
            && (self.state.condition.is_terminal() || self.state.condition == Condition::Scheduled)
    }

    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    /// Goal reached for a decommissioned instance: safe to forget entirely.
    pub fn should_expunge(&self) -> bool {
        self.state.goal == Goal::Decommissioned
            && (self.tasks.is_empty()
                || self.tasks.values().all(|t| t.condition.is_terminal()))
    }

    /// Commit a launch: bind the accepting agent and the freshly minted
    /// tasks. Only legal for a scheduled instance that still wants to run.
    pub fn provision(&mut self, agent: AgentInfo, tasks: Vec<Task>, now: Timestamp) -> bool {
        if self.state.condition != Condition::Scheduled || self.state.goal != Goal::Running {
            return false;
        }
        self.agent_info = Some(agent);
        self.tasks = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();
        self.state.condition = Condition::Provisioned;
        self.state.since = now;
        true
    }

    /// Apply a task status report and recompute the instance state.
    pub fn update_task(
        &mut self,
        task_id: &TaskId,
        condition: Condition,
        healthy: Option<bool>,
        now: Timestamp,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if condition == Condition::Unreachable {
            if task.condition != Condition::Unreachable {
                task.unreachable_since = Some(now);
            }
        } else {
            task.unreachable_since = None;
        }
        if condition == Condition::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        task.condition = condition;
        if let Some(h) = healthy {
            task.healthy = Some(h);
        }
        self.update_state(now);
        true
    }

    /// Recompute `(condition, healthy, active_since)` from the task map,
    /// preserving `since` when nothing observable changed.
    pub fn update_state(&mut self, now: Timestamp) {
        let reduced = reduce_conditions(self.tasks.values().map(|t| t.condition));
        let mut condition = self.promote_unreachable(reduced, now);
        // Once inactive, the instance stays inactive for capacity purposes
        // until a deployment action re-schedules it or a task terminates.
        if self.state.condition == Condition::UnreachableInactive && !condition.is_terminal() {
            condition = Condition::UnreachableInactive;
        }
        let healthy = aggregate_health(self.tasks.values().map(|t| (t.condition, t.healthy)));
        let active_since = self.tasks.values().filter_map(|t| t.started_at).min();

        if condition != self.state.condition || healthy != self.state.healthy {
            self.state.since = now;
        }
        self.state.condition = condition;
        self.state.healthy = healthy;
        self.state.active_since = active_since;
    }

    fn promote_unreachable(&self, reduced: Condition, now: Timestamp) -> Condition {
        if reduced != Condition::Unreachable {
            return reduced;
        }
        let UnreachableStrategy::Enabled { inactive_after, .. } =
            self.run_spec.unreachable_strategy()
        else {
            return reduced;
        };
        let inactive_after = chrono::Duration::from_std(*inactive_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let expired = self
            .tasks
            .values()
            .filter_map(|t| t.unreachable_since)
            .any(|since| since + inactive_after <= now);
        if expired {
            Condition::UnreachableInactive
        } else {
            Condition::Unreachable
        }
    }

    pub fn set_goal(&mut self, goal: Goal, now: Timestamp) {
        if self.state.goal != goal {
            self.state.goal = goal;
            self.state.since = now;
        }
    }
}

pub fn now() -> Timestamp {
    Utc::now()
}
