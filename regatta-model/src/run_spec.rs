use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::path::PathId;

pub type Timestamp = DateTime<Utc>;

fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(bytes.as_ref()))
}

fn hash_json<T: Serialize>(v: &T) -> String {
    let data = serde_json::to_vec(v).expect("hash_json serialization must not fail");
    sha256_hex(data)
}

/// Resource demand of a single instance (for pods: a single container).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    #[serde(default)]
    pub gpus: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            gpus: 0,
        }
    }
}

/// Where a spec version came from. Scaling updates keep the config-change
/// timestamp of the previous version so restart decisions can ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionInfo {
    OnlyVersion {
        version: Timestamp,
    },
    FullVersion {
        version: Timestamp,
        last_scaling_at: Timestamp,
        last_config_change_at: Timestamp,
    },
}

impl VersionInfo {
    pub fn only(version: Timestamp) -> Self {
        VersionInfo::OnlyVersion { version }
    }

    pub fn version(&self) -> Timestamp {
        match self {
            VersionInfo::OnlyVersion { version } => *version,
            VersionInfo::FullVersion { version, .. } => *version,
        }
    }

    pub fn last_config_change_at(&self) -> Timestamp {
        match self {
            VersionInfo::OnlyVersion { version } => *version,
            VersionInfo::FullVersion {
                last_config_change_at,
                ..
            } => *last_config_change_at,
        }
    }

    /// Next version after a scaling-only update.
    pub fn with_scaling(&self, now: Timestamp) -> Self {
        VersionInfo::FullVersion {
            version: now,
            last_scaling_at: now,
            last_config_change_at: self.last_config_change_at(),
        }
    }

    /// Next version after a config change.
    pub fn with_config_change(&self, now: Timestamp) -> Self {
        VersionInfo::FullVersion {
            version: now,
            last_scaling_at: now,
            last_config_change_at: now,
        }
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo::OnlyVersion {
            version: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }
}

/// What to do with instances the offer layer reports unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnreachableStrategy {
    Disabled,
    Enabled {
        inactive_after: Duration,
        expunge_after: Duration,
    },
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        UnreachableStrategy::Enabled {
            inactive_after: Duration::from_secs(0),
            expunge_after: Duration::from_secs(0),
        }
    }
}

/// Capacity bounds applied while replacing instances during a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of target instances that must stay healthy, in [0, 1].
    pub minimum_health_capacity: f64,
    /// Extra fraction of target instances allowed during replacement, in [0, 1].
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        UpgradeStrategy {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

impl UpgradeStrategy {
    /// Minimum number of instances (old + new) that must stay up while
    /// restarting toward `target` instances.
    pub fn health_floor(&self, target: u32) -> u32 {
        (self.minimum_health_capacity * f64::from(target)).ceil() as u32
    }

    /// Maximum number of instances (old + new) allowed while restarting
    /// toward `target` instances.
    pub fn capacity_ceiling(&self, target: u32) -> u32 {
        target + (self.maximum_over_capacity * f64::from(target)).floor() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub grace_period: Duration,
    pub interval: Duration,
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheckSpec {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub id: PathId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub instances: u32,
    #[serde(default)]
    pub resources: Resources,
    /// Resource-pool label. `None` inherits the enforced group role or the
    /// configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<PathId>,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    #[serde(default)]
    pub unreachable_strategy: UnreachableStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheckSpec>,
    #[serde(default)]
    pub version_info: VersionInfo,
}

impl AppDefinition {
    pub fn new(id: PathId) -> Self {
        AppDefinition {
            id,
            cmd: None,
            env: BTreeMap::new(),
            instances: 1,
            resources: Resources::default(),
            role: None,
            dependencies: BTreeSet::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            version_info: VersionInfo::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodContainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodDefinition {
    pub id: PathId,
    pub containers: Vec<PodContainer>,
    pub instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<PathId>,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    #[serde(default)]
    pub unreachable_strategy: UnreachableStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheckSpec>,
    #[serde(default)]
    pub version_info: VersionInfo,
}

impl PodDefinition {
    pub fn new(id: PathId) -> Self {
        PodDefinition {
            id,
            containers: Vec::new(),
            instances: 1,
            role: None,
            dependencies: BTreeSet::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            unreachable_strategy: UnreachableStrategy::default(),
            readiness_checks: Vec::new(),
            version_info: VersionInfo::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// A deployable workload specification: a single-task app or a multi-container
/// pod. Behaviour differences stay exhaustive matches over this tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunSpec {
    App(AppDefinition),
    Pod(PodDefinition),
}

impl RunSpec {
    pub fn id(&self) -> &PathId {
        match self {
            RunSpec::App(app) => &app.id,
            RunSpec::Pod(pod) => &pod.id,
        }
    }

    pub fn instances(&self) -> u32 {
        match self {
            RunSpec::App(app) => app.instances,
            RunSpec::Pod(pod) => pod.instances,
        }
    }

    pub fn with_instances(&self, instances: u32) -> RunSpec {
        match self {
            RunSpec::App(app) => RunSpec::App(AppDefinition {
                instances,
                ..app.clone()
            }),
            RunSpec::Pod(pod) => RunSpec::Pod(PodDefinition {
                instances,
                ..pod.clone()
            }),
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            RunSpec::App(app) => app.role.as_deref(),
            RunSpec::Pod(pod) => pod.role.as_deref(),
        }
    }

    pub fn set_role(&mut self, role: String) {
        match self {
            RunSpec::App(app) => app.role = Some(role),
            RunSpec::Pod(pod) => pod.role = Some(role),
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<PathId> {
        match self {
            RunSpec::App(app) => &app.dependencies,
            RunSpec::Pod(pod) => &pod.dependencies,
        }
    }

    pub fn upgrade_strategy(&self) -> &UpgradeStrategy {
        match self {
            RunSpec::App(app) => &app.upgrade_strategy,
            RunSpec::Pod(pod) => &pod.upgrade_strategy,
        }
    }

    pub fn unreachable_strategy(&self) -> &UnreachableStrategy {
        match self {
            RunSpec::App(app) => &app.unreachable_strategy,
            RunSpec::Pod(pod) => &pod.unreachable_strategy,
        }
    }

    pub fn has_readiness_checks(&self) -> bool {
        match self {
            RunSpec::App(app) => !app.readiness_checks.is_empty(),
            RunSpec::Pod(pod) => !pod.readiness_checks.is_empty(),
        }
    }

    pub fn has_health_checks(&self) -> bool {
        match self {
            RunSpec::App(app) => !app.health_checks.is_empty(),
            RunSpec::Pod(_) => false,
        }
    }

    pub fn version_info(&self) -> &VersionInfo {
        match self {
            RunSpec::App(app) => &app.version_info,
            RunSpec::Pod(pod) => &pod.version_info,
        }
    }

    pub fn set_version_info(&mut self, version_info: VersionInfo) {
        match self {
            RunSpec::App(app) => app.version_info = version_info,
            RunSpec::Pod(pod) => pod.version_info = version_info,
        }
    }

    pub fn version(&self) -> Timestamp {
        self.version_info().version()
    }

    /// Tasks launched per instance: one for apps, one per container for pods.
    pub fn task_count(&self) -> usize {
        match self {
            RunSpec::App(_) => 1,
            RunSpec::Pod(pod) => pod.containers.len().max(1),
        }
    }

    pub fn is_scaled_to_zero(&self) -> bool {
        self.instances() == 0
    }

    /// Hash of the spec with version info and instance count canonicalized
    /// away. Two specs with equal config hashes only ever differ by scale or
    /// by clock artifacts, neither of which warrants a restart.
    pub fn config_hash(&self) -> String {
        let mut canonical = self.with_instances(0);
        canonical.set_version_info(VersionInfo::default());
        hash_json(&canonical)
    }

    /// True if replacing `from` with `self` changes anything beyond the
    /// instance count.
    pub fn needs_restart(&self, from: &RunSpec) -> bool {
        self.config_hash() != from.config_hash()
    }

    /// True if `self` and `other` differ only in their instance counts.
    pub fn is_only_scale_change(&self, other: &RunSpec) -> bool {
        self.config_hash() == other.config_hash() && self.instances() != other.instances()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str) -> AppDefinition {
        AppDefinition::new(PathId::parse(id).unwrap())
    }

    #[test]
    fn test_scale_only_change_is_not_a_restart() {
        let a = RunSpec::App(app("/test/app"));
        let b = a.with_instances(7);
        assert!(a.is_only_scale_change(&b));
        assert!(!a.needs_restart(&b));
    }

    #[test]
    fn test_command_change_needs_restart() {
        let mut before = app("/test/app");
        before.cmd = Some("test cmd".into());
        let mut after = before.clone();
        after.cmd = Some("other cmd".into());
        let before = RunSpec::App(before);
        let after = RunSpec::App(after);
        assert!(after.needs_restart(&before));
        assert!(!after.is_only_scale_change(&before));
    }

    #[test]
    fn test_version_timestamps_do_not_force_restart() {
        // identical config stored twice with different version stamps
        let mut before = app("/svc");
        before.version_info = VersionInfo::only(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let mut after = before.clone();
        after.version_info = VersionInfo::only(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let before = RunSpec::App(before);
        let after = RunSpec::App(after);
        assert!(!after.needs_restart(&before));
    }

    #[test]
    fn test_upgrade_strategy_floor_and_ceiling() {
        let strategy = UpgradeStrategy {
            minimum_health_capacity: 0.5,
            maximum_over_capacity: 0.0,
        };
        assert_eq!(strategy.health_floor(4), 2);
        assert_eq!(strategy.capacity_ceiling(4), 4);

        let eager = UpgradeStrategy {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 0.3,
        };
        assert_eq!(eager.health_floor(4), 4);
        // floor(0.3 * 4) = 1 extra instance allowed
        assert_eq!(eager.capacity_ceiling(4), 5);
    }

    #[test]
    fn test_scaling_version_keeps_config_change_timestamp() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let scaled = VersionInfo::only(t0).with_scaling(t1);
        assert_eq!(scaled.version(), t1);
        assert_eq!(scaled.last_config_change_at(), t0);

        let changed = scaled.with_config_change(t1);
        assert_eq!(changed.last_config_change_at(), t1);
    }

    #[test]
    fn test_pod_task_count_tracks_containers() {
        let mut pod = PodDefinition::new(PathId::parse("/pod").unwrap());
        pod.containers = vec![
            PodContainer {
                name: "web".into(),
                exec: None,
                resources: Resources::default(),
            },
            PodContainer {
                name: "sidecar".into(),
                exec: None,
                resources: Resources::default(),
            },
        ];
        assert_eq!(RunSpec::Pod(pod).task_count(), 2);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut def = app("/test/app");
        def.cmd = Some("sleep 3600".into());
        let yaml = def.to_yaml().unwrap();
        let back = AppDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(back, def);
    }
}
