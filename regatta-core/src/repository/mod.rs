use async_trait::async_trait;
use regatta_model::deployment::DeploymentPlan;
use regatta_model::group::RootGroup;
use regatta_model::instance::{Instance, InstanceId};
use regatta_model::path::PathId;
use regatta_model::run_spec::{AppDefinition, PodDefinition, Timestamp};

use crate::error::CoreResult;

mod memory;

pub use memory::{
    InMemoryDeploymentRepository, InMemoryInstanceRepository, InMemoryRootRepository,
    InMemorySpecRepository,
};

/// Items a versioned repository can hold: anything with an id and a version
/// timestamp.
pub trait VersionedItem: Clone + Send + Sync + 'static {
    fn item_id(&self) -> &PathId;
    fn item_version(&self) -> Timestamp;
}

impl VersionedItem for AppDefinition {
    fn item_id(&self) -> &PathId {
        &self.id
    }

    fn item_version(&self) -> Timestamp {
        self.version_info.version()
    }
}

impl VersionedItem for PodDefinition {
    fn item_id(&self) -> &PathId {
        &self.id
    }

    fn item_version(&self) -> Timestamp {
        self.version_info.version()
    }
}

/// Versioned store for app or pod definitions. `store` replaces the current
/// value and records it as a version; `store_version` records a version
/// without touching the current value. Pruning old versions is exclusively
/// the garbage collector's business.
#[async_trait]
pub trait SpecRepository<T: VersionedItem>: Send + Sync {
    async fn store(&self, value: T) -> CoreResult<()>;
    async fn store_version(&self, value: T) -> CoreResult<()>;
    async fn get(&self, id: &PathId) -> CoreResult<Option<T>>;
    async fn get_version(&self, id: &PathId, version: Timestamp) -> CoreResult<Option<T>>;
    async fn ids(&self) -> CoreResult<Vec<PathId>>;
    /// Version timestamps for `id`, newest first.
    async fn versions(&self, id: &PathId) -> CoreResult<Vec<Timestamp>>;
    async fn delete(&self, id: &PathId) -> CoreResult<()>;
    async fn delete_version(&self, id: &PathId, version: Timestamp) -> CoreResult<()>;
}

pub type AppRepository = dyn SpecRepository<AppDefinition>;
pub type PodRepository = dyn SpecRepository<PodDefinition>;

/// The root group store. Storing a root also persists the spec versions that
/// changed with it, so a historical root version can always be resolved.
/// Deleted spec ids are *not* removed here; old root versions still reference
/// them and the garbage collector prunes once nothing does.
#[async_trait]
pub trait RootRepository: Send + Sync {
    async fn root(&self) -> CoreResult<RootGroup>;
    /// Root version timestamps, newest first.
    async fn root_versions(&self) -> CoreResult<Vec<Timestamp>>;
    async fn root_version(&self, version: Timestamp) -> CoreResult<Option<RootGroup>>;
    async fn store_root(
        &self,
        root: RootGroup,
        updated_apps: Vec<AppDefinition>,
        deleted_app_ids: Vec<PathId>,
        updated_pods: Vec<PodDefinition>,
        deleted_pod_ids: Vec<PathId>,
    ) -> CoreResult<()>;
    async fn delete_root_version(&self, version: Timestamp) -> CoreResult<()>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn store(&self, plan: DeploymentPlan) -> CoreResult<()>;
    async fn delete(&self, plan_id: &str) -> CoreResult<()>;
    async fn all(&self) -> CoreResult<Vec<DeploymentPlan>>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn store(&self, instance: Instance) -> CoreResult<()>;
    async fn get(&self, id: &InstanceId) -> CoreResult<Option<Instance>>;
    async fn ids(&self) -> CoreResult<Vec<InstanceId>>;
    async fn all(&self) -> CoreResult<Vec<Instance>>;
    async fn delete(&self, id: &InstanceId) -> CoreResult<()>;
}
