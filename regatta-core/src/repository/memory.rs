use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use regatta_model::deployment::DeploymentPlan;
use regatta_model::group::RootGroup;
use regatta_model::instance::{Instance, InstanceId};
use regatta_model::path::PathId;
use regatta_model::run_spec::{AppDefinition, PodDefinition, Timestamp};
use tokio::sync::RwLock;

use crate::error::CoreResult;

use super::{
    DeploymentRepository, InstanceRepository, RootRepository, SpecRepository, VersionedItem,
};

#[derive(Debug, Clone)]
struct Versioned<T> {
    current: Option<T>,
    versions: BTreeMap<Timestamp, T>,
}

impl<T> Default for Versioned<T> {
    fn default() -> Self {
        Versioned {
            current: None,
            versions: BTreeMap::new(),
        }
    }
}

/// In-memory versioned store. Every operation takes the single write lock,
/// which gives the atomic single-key read-modify-write the contract asks for.
pub struct InMemorySpecRepository<T> {
    entries: RwLock<HashMap<PathId, Versioned<T>>>,
}

impl<T> Default for InMemorySpecRepository<T> {
    fn default() -> Self {
        InMemorySpecRepository {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<T: VersionedItem> SpecRepository<T> for InMemorySpecRepository<T> {
    async fn store(&self, value: T) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(value.item_id().clone()).or_default();
        entry.versions.insert(value.item_version(), value.clone());
        entry.current = Some(value);
        Ok(())
    }

    async fn store_version(&self, value: T) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(value.item_id().clone()).or_default();
        entry.versions.insert(value.item_version(), value);
        Ok(())
    }

    async fn get(&self, id: &PathId) -> CoreResult<Option<T>> {
        Ok(self
            .entries
            .read()
            .await
            .get(id)
            .and_then(|e| e.current.clone()))
    }

    async fn get_version(&self, id: &PathId, version: Timestamp) -> CoreResult<Option<T>> {
        Ok(self
            .entries
            .read()
            .await
            .get(id)
            .and_then(|e| e.versions.get(&version).cloned()))
    }

    async fn ids(&self) -> CoreResult<Vec<PathId>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn versions(&self, id: &PathId) -> CoreResult<Vec<Timestamp>> {
        Ok(self
            .entries
            .read()
            .await
            .get(id)
            .map(|e| e.versions.keys().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, id: &PathId) -> CoreResult<()> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn delete_version(&self, id: &PathId, version: Timestamp) -> CoreResult<()> {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.versions.remove(&version);
        }
        Ok(())
    }
}

/// In-memory root store. Shares the app and pod repositories so storing a
/// root writes the changed spec versions in the same call.
pub struct InMemoryRootRepository {
    state: RwLock<RootState>,
    apps: Arc<InMemorySpecRepository<AppDefinition>>,
    pods: Arc<InMemorySpecRepository<PodDefinition>>,
}

#[derive(Default)]
struct RootState {
    current: Option<RootGroup>,
    versions: BTreeMap<Timestamp, RootGroup>,
}

impl InMemoryRootRepository {
    pub fn new(
        apps: Arc<InMemorySpecRepository<AppDefinition>>,
        pods: Arc<InMemorySpecRepository<PodDefinition>>,
    ) -> Self {
        InMemoryRootRepository {
            state: RwLock::new(RootState::default()),
            apps,
            pods,
        }
    }
}

#[async_trait]
impl RootRepository for InMemoryRootRepository {
    async fn root(&self) -> CoreResult<RootGroup> {
        let state = self.state.read().await;
        Ok(state
            .current
            .clone()
            .unwrap_or_else(|| RootGroup::empty(Utc.timestamp_opt(0, 0).unwrap())))
    }

    async fn root_versions(&self) -> CoreResult<Vec<Timestamp>> {
        Ok(self.state.read().await.versions.keys().rev().cloned().collect())
    }

    async fn root_version(&self, version: Timestamp) -> CoreResult<Option<RootGroup>> {
        Ok(self.state.read().await.versions.get(&version).cloned())
    }

    async fn store_root(
        &self,
        root: RootGroup,
        updated_apps: Vec<AppDefinition>,
        deleted_app_ids: Vec<PathId>,
        updated_pods: Vec<PodDefinition>,
        deleted_pod_ids: Vec<PathId>,
    ) -> CoreResult<()> {
        for app in updated_apps {
            self.apps.store(app).await?;
        }
        for pod in updated_pods {
            self.pods.store(pod).await?;
        }
        // deleted specs stay in their repos: older root versions still
        // reference them, GC prunes once nothing does
        tracing::debug!(
            deleted_apps = deleted_app_ids.len(),
            deleted_pods = deleted_pod_ids.len(),
            version = %root.version(),
            "storing root"
        );
        let mut state = self.state.write().await;
        state.versions.insert(root.version(), root.clone());
        state.current = Some(root);
        Ok(())
    }

    async fn delete_root_version(&self, version: Timestamp) -> CoreResult<()> {
        self.state.write().await.versions.remove(&version);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeploymentRepository {
    plans: RwLock<BTreeMap<String, DeploymentPlan>>,
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn store(&self, plan: DeploymentPlan) -> CoreResult<()> {
        self.plans.write().await.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn delete(&self, plan_id: &str) -> CoreResult<()> {
        self.plans.write().await.remove(plan_id);
        Ok(())
    }

    async fn all(&self) -> CoreResult<Vec<DeploymentPlan>> {
        Ok(self.plans.read().await.values().cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryInstanceRepository {
    instances: RwLock<BTreeMap<InstanceId, Instance>>,
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn store(&self, instance: Instance) -> CoreResult<()> {
        self.instances
            .write()
            .await
            .insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> CoreResult<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn ids(&self) -> CoreResult<Vec<InstanceId>> {
        Ok(self.instances.read().await.keys().cloned().collect())
    }

    async fn all(&self) -> CoreResult<Vec<Instance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &InstanceId) -> CoreResult<()> {
        self.instances.write().await.remove(id);
        Ok(())
    }
}
