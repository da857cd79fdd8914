use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use regatta_model::group::RootGroup;
use regatta_model::path::PathId;
use regatta_model::run_spec::{AppDefinition, PodDefinition, RunSpec, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::repository::{DeploymentRepository, RootRepository, SpecRepository};

/// What one scan decided may go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionSet {
    pub apps: BTreeSet<PathId>,
    pub app_versions: BTreeSet<(PathId, Timestamp)>,
    pub pods: BTreeSet<PathId>,
    pub pod_versions: BTreeSet<(PathId, Timestamp)>,
    pub root_versions: BTreeSet<Timestamp>,
}

impl DeletionSet {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
            && self.app_versions.is_empty()
            && self.pods.is_empty()
            && self.pod_versions.is_empty()
            && self.root_versions.is_empty()
    }
}

/// Entities the user stored while a scan was running. Subtracted from the
/// scan result so a concurrent write is never compacted away.
#[derive(Debug, Default)]
struct UpdatedEntities {
    apps: BTreeSet<PathId>,
    pods: BTreeSet<PathId>,
    root_versions: BTreeSet<Timestamp>,
}

impl UpdatedEntities {
    fn subtract_from(&self, deletes: &mut DeletionSet) {
        for id in &self.apps {
            deletes.apps.remove(id);
            deletes.app_versions.retain(|(vid, _)| vid != id);
        }
        for id in &self.pods {
            deletes.pods.remove(id);
            deletes.pod_versions.retain(|(vid, _)| vid != id);
        }
        for version in &self.root_versions {
            deletes.root_versions.remove(version);
        }
    }
}

enum GcCommand {
    RunGc {
        reply: Option<oneshot::Sender<()>>,
    },
    StoreApp {
        id: PathId,
        reply: oneshot::Sender<()>,
    },
    StorePod {
        id: PathId,
        reply: oneshot::Sender<()>,
    },
    StoreRoot {
        version: Timestamp,
        reply: oneshot::Sender<()>,
    },
    ScanDone(DeletionSet),
    CompactDone,
}

enum GcState {
    Resting,
    ReadyForGc,
    Scanning {
        updated: UpdatedEntities,
        gc_requested: bool,
    },
    Compacting {
        deletes: DeletionSet,
        blocked: Vec<oneshot::Sender<()>>,
        gc_requested: bool,
    },
}

/// Periodic and on-demand compaction of the app, pod, root and deployment
/// stores. A finite state machine: `Resting -> ReadyForGc -> Scanning ->
/// Compacting -> ...`. Writers pass through the store gates below so a write
/// racing a scan is never lost to compaction.
#[derive(Clone)]
pub struct GarbageCollector {
    tx: mpsc::Sender<GcCommand>,
}

impl GarbageCollector {
    pub fn spawn(
        apps: Arc<dyn SpecRepository<AppDefinition>>,
        pods: Arc<dyn SpecRepository<PodDefinition>>,
        roots: Arc<dyn RootRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        config: &CoreConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = GcActor {
            apps,
            pods,
            roots,
            deployments,
            max_versions: config.max_versions,
            max_root_versions: config.max_root_versions,
            interval: config.gc_scan_interval,
            tx: tx.clone(),
            state: if config.gc_scan_interval.is_some() {
                GcState::Resting
            } else {
                GcState::ReadyForGc
            },
            run_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(rx, shutdown));
        GarbageCollector { tx }
    }

    /// Trigger a GC cycle and wait for it to finish. If a cycle is already in
    /// flight, another is queued behind it and this resolves when the machine
    /// next goes idle.
    pub async fn run_gc(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(GcCommand::RunGc { reply: Some(reply) })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub async fn request_gc(&self) {
        let _ = self.tx.send(GcCommand::RunGc { reply: None }).await;
    }

    /// Gate a store of an app definition. Resolves immediately unless a
    /// compaction is about to delete that entity, in which case it resolves
    /// right after the compaction finished. Perform the actual store after
    /// awaiting this.
    pub async fn store_app_gate(&self, id: PathId) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(GcCommand::StoreApp { id, reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn store_pod_gate(&self, id: PathId) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(GcCommand::StorePod { id, reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn store_root_gate(&self, version: Timestamp) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(GcCommand::StoreRoot { version, reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

struct GcActor {
    apps: Arc<dyn SpecRepository<AppDefinition>>,
    pods: Arc<dyn SpecRepository<PodDefinition>>,
    roots: Arc<dyn RootRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    max_versions: usize,
    max_root_versions: usize,
    interval: Option<Duration>,
    tx: mpsc::Sender<GcCommand>,
    state: GcState,
    run_waiters: Vec<oneshot::Sender<()>>,
}

impl GcActor {
    async fn run(mut self, mut rx: mpsc::Receiver<GcCommand>, shutdown: CancellationToken) {
        loop {
            let resting = matches!(self.state, GcState::Resting);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval.unwrap_or(Duration::MAX)), if resting => {
                    self.state = GcState::ReadyForGc;
                    self.start_scan();
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd).await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: GcCommand) {
        match cmd {
            GcCommand::RunGc { reply } => {
                if let Some(reply) = reply {
                    self.run_waiters.push(reply);
                }
                match &mut self.state {
                    GcState::Resting | GcState::ReadyForGc => {
                        self.state = GcState::ReadyForGc;
                        self.start_scan();
                    }
                    GcState::Scanning { gc_requested, .. }
                    | GcState::Compacting { gc_requested, .. } => {
                        *gc_requested = true;
                    }
                }
            }
            GcCommand::StoreApp { id, reply } => match &mut self.state {
                GcState::Scanning { updated, .. } => {
                    updated.apps.insert(id);
                    let _ = reply.send(());
                }
                GcState::Compacting {
                    deletes, blocked, ..
                } => {
                    let hit = deletes.apps.contains(&id)
                        || deletes.app_versions.iter().any(|(vid, _)| vid == &id);
                    if hit {
                        blocked.push(reply);
                    } else {
                        let _ = reply.send(());
                    }
                }
                _ => {
                    let _ = reply.send(());
                }
            },
            GcCommand::StorePod { id, reply } => match &mut self.state {
                GcState::Scanning { updated, .. } => {
                    updated.pods.insert(id);
                    let _ = reply.send(());
                }
                GcState::Compacting {
                    deletes, blocked, ..
                } => {
                    let hit = deletes.pods.contains(&id)
                        || deletes.pod_versions.iter().any(|(vid, _)| vid == &id);
                    if hit {
                        blocked.push(reply);
                    } else {
                        let _ = reply.send(());
                    }
                }
                _ => {
                    let _ = reply.send(());
                }
            },
            GcCommand::StoreRoot { version, reply } => match &mut self.state {
                GcState::Scanning { updated, .. } => {
                    updated.root_versions.insert(version);
                    let _ = reply.send(());
                }
                GcState::Compacting {
                    deletes, blocked, ..
                } => {
                    if deletes.root_versions.contains(&version) {
                        blocked.push(reply);
                    } else {
                        let _ = reply.send(());
                    }
                }
                _ => {
                    let _ = reply.send(());
                }
            },
            GcCommand::ScanDone(mut deletes) => {
                match std::mem::replace(&mut self.state, GcState::ReadyForGc) {
                    GcState::Scanning {
                        updated,
                        gc_requested,
                    } => {
                        updated.subtract_from(&mut deletes);
                        if deletes.is_empty() {
                            self.finish_cycle(gc_requested);
                        } else {
                            tracing::info!(
                                apps = deletes.apps.len(),
                                app_versions = deletes.app_versions.len(),
                                pods = deletes.pods.len(),
                                pod_versions = deletes.pod_versions.len(),
                                root_versions = deletes.root_versions.len(),
                                "compacting"
                            );
                            self.state = GcState::Compacting {
                                deletes: deletes.clone(),
                                blocked: Vec::new(),
                                gc_requested,
                            };
                            self.start_compaction(deletes);
                        }
                    }
                    other => self.state = other,
                }
            }
            GcCommand::CompactDone => {
                match std::mem::replace(&mut self.state, GcState::ReadyForGc) {
                    GcState::Compacting {
                        blocked,
                        gc_requested,
                        ..
                    } => {
                        // release writers before anything else can observe the store
                        for reply in blocked {
                            let _ = reply.send(());
                        }
                        self.finish_cycle(gc_requested);
                    }
                    other => self.state = other,
                }
            }
        }
    }

    fn finish_cycle(&mut self, gc_requested: bool) {
        if gc_requested {
            self.state = GcState::ReadyForGc;
            self.start_scan();
            return;
        }
        for waiter in self.run_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.state = if self.interval.is_some() {
            GcState::Resting
        } else {
            GcState::ReadyForGc
        };
    }

    fn start_scan(&mut self) {
        self.state = GcState::Scanning {
            updated: UpdatedEntities::default(),
            gc_requested: false,
        };
        let apps = self.apps.clone();
        let pods = self.pods.clone();
        let roots = self.roots.clone();
        let deployments = self.deployments.clone();
        let max_versions = self.max_versions;
        let max_root_versions = self.max_root_versions;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let deletes = scan(
                apps,
                pods,
                roots,
                deployments,
                max_versions,
                max_root_versions,
            )
            .await;
            let _ = tx.send(GcCommand::ScanDone(deletes)).await;
        });
    }

    fn start_compaction(&mut self, deletes: DeletionSet) {
        let apps = self.apps.clone();
        let pods = self.pods.clone();
        let roots = self.roots.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            compact(apps, pods, roots, deletes).await;
            let _ = tx.send(GcCommand::CompactDone).await;
        });
    }
}

#[derive(Default)]
struct References {
    app_ids: BTreeSet<PathId>,
    app_versions: BTreeSet<(PathId, Timestamp)>,
    pod_ids: BTreeSet<PathId>,
    pod_versions: BTreeSet<(PathId, Timestamp)>,
    root_versions: BTreeSet<Timestamp>,
}

impl References {
    fn collect_root(&mut self, root: &RootGroup) {
        self.root_versions.insert(root.version());
        for spec in root.transitive_run_specs() {
            match spec {
                RunSpec::App(app) => {
                    self.app_ids.insert(app.id.clone());
                    self.app_versions
                        .insert((app.id.clone(), app.version_info.version()));
                }
                RunSpec::Pod(pod) => {
                    self.pod_ids.insert(pod.id.clone());
                    self.pod_versions
                        .insert((pod.id.clone(), pod.version_info.version()));
                }
            }
        }
    }
}

/// Compute the deletion candidates: everything stored that is referenced by
/// neither the current root, nor a retained root version, nor an in-flight
/// deployment, and that lies beyond the per-entity retention threshold.
///
/// Any failure yields an empty (or partial) result instead of an error; a
/// skipped branch merely means nothing is deleted there this round.
async fn scan(
    apps: Arc<dyn SpecRepository<AppDefinition>>,
    pods: Arc<dyn SpecRepository<PodDefinition>>,
    roots: Arc<dyn RootRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    max_versions: usize,
    max_root_versions: usize,
) -> DeletionSet {
    let mut refs = References::default();

    // reference gathering must be complete or we must not delete anything
    let current = match roots.root().await {
        Ok(root) => root,
        Err(err) => {
            tracing::warn!("gc scan aborted, cannot read current root: {err}");
            return DeletionSet::default();
        }
    };
    refs.collect_root(&current);

    let root_versions = match roots.root_versions().await {
        Ok(versions) => versions,
        Err(err) => {
            tracing::warn!("gc scan aborted, cannot list root versions: {err}");
            return DeletionSet::default();
        }
    };
    for version in root_versions.iter().take(max_root_versions) {
        match roots.root_version(*version).await {
            Ok(Some(root)) => refs.collect_root(&root),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("gc scan aborted, cannot read root version: {err}");
                return DeletionSet::default();
            }
        }
    }

    match deployments.all().await {
        Ok(plans) => {
            for plan in plans {
                refs.collect_root(&plan.original);
                refs.collect_root(&plan.target);
            }
        }
        Err(err) => {
            tracing::warn!("gc scan aborted, cannot list deployments: {err}");
            return DeletionSet::default();
        }
    }

    let mut deletes = DeletionSet::default();

    match scan_specs(apps.as_ref(), &refs.app_ids, &refs.app_versions, max_versions).await {
        Ok((ids, versions)) => {
            deletes.apps = ids;
            deletes.app_versions = versions;
        }
        Err(err) => tracing::warn!("gc app scan failed, skipping branch: {err}"),
    }

    match scan_specs(pods.as_ref(), &refs.pod_ids, &refs.pod_versions, max_versions).await {
        Ok((ids, versions)) => {
            deletes.pods = ids;
            deletes.pod_versions = versions;
        }
        Err(err) => tracing::warn!("gc pod scan failed, skipping branch: {err}"),
    }

    for version in root_versions.iter().skip(max_root_versions) {
        if !refs.root_versions.contains(version) {
            deletes.root_versions.insert(*version);
        }
    }

    deletes
}

type SpecCandidates = (BTreeSet<PathId>, BTreeSet<(PathId, Timestamp)>);

async fn scan_specs<T: crate::repository::VersionedItem>(
    repo: &dyn SpecRepository<T>,
    referenced_ids: &BTreeSet<PathId>,
    referenced_versions: &BTreeSet<(PathId, Timestamp)>,
    max_versions: usize,
) -> crate::error::CoreResult<SpecCandidates> {
    let mut delete_ids = BTreeSet::new();
    let mut delete_versions = BTreeSet::new();
    for id in repo.ids().await? {
        if !referenced_ids.contains(&id) {
            delete_ids.insert(id);
            continue;
        }
        // newest-first listing; keep the retention window, prune the rest
        // unless something still references the exact version
        for version in repo.versions(&id).await?.into_iter().skip(max_versions) {
            if !referenced_versions.contains(&(id.clone(), version)) {
                delete_versions.insert((id.clone(), version));
            }
        }
    }
    Ok((delete_ids, delete_versions))
}

/// Apply a deletion set. Failures are logged and swallowed; compaction
/// always reports done.
async fn compact(
    apps: Arc<dyn SpecRepository<AppDefinition>>,
    pods: Arc<dyn SpecRepository<PodDefinition>>,
    roots: Arc<dyn RootRepository>,
    deletes: DeletionSet,
) {
    for id in &deletes.apps {
        if let Err(err) = apps.delete(id).await {
            tracing::warn!("gc failed to delete app {id}: {err}");
        }
    }
    for (id, version) in &deletes.app_versions {
        if let Err(err) = apps.delete_version(id, *version).await {
            tracing::warn!("gc failed to delete app version {id}@{version}: {err}");
        }
    }
    for id in &deletes.pods {
        if let Err(err) = pods.delete(id).await {
            tracing::warn!("gc failed to delete pod {id}: {err}");
        }
    }
    for (id, version) in &deletes.pod_versions {
        if let Err(err) = pods.delete_version(id, *version).await {
            tracing::warn!("gc failed to delete pod version {id}@{version}: {err}");
        }
    }
    for version in &deletes.root_versions {
        if let Err(err) = roots.delete_root_version(*version).await {
            tracing::warn!("gc failed to delete root version {version}: {err}");
        }
    }
}
