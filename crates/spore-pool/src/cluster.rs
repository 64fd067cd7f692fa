//! The pool of provider instances and its reconciliation loop.
//!
//! The `Cluster` classifies every known instance into exactly one of
//! starting, available, stopping (three [`InstanceList`] buckets) or used
//! (the reservation map), and keeps that classification in sync with the
//! provider:
//!
//! 1. List disks, then instances, then instances carrying the reservation tag.
//! 2. Move every tagged instance out of its bucket and into `used`; release
//!    `used` entries whose tag disappeared.
//! 3. Place every unreserved instance with a resolved disk by status:
//!    Running → available, Starting → starting, Stopping → stopping,
//!    Stopped → unplaced and started again.
//!
//! Callers borrow instances with [`Cluster::get_instance`] and hand them
//! back with [`Cluster::stop_instance`], which force-stops the instance and
//! schedules a tracked restart so it re-enters the pool.
//!
//! The index, `used`, and disk cache live behind one async mutex. Every
//! bucket mutation happens while it is held; provider listings and the
//! starts of stopped instances run outside it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use spore_core::{Disk, InstanceAttributes, InstanceId, InstanceStatus, ResourceType};
use spore_provider::CloudProvider;

use crate::bucket::InstanceList;
use crate::delayer::Delayer;
use crate::error::{PoolError, PoolResult};
use crate::instance::{Instance, InstanceView, Location};
use crate::pager::collect_pages;
use crate::retry::StartFailures;
use crate::settings::PoolSettings;

/// Outcome of [`Cluster::get_instance`].
#[derive(Debug, Clone)]
pub enum Acquisition {
    /// Reserved for the caller.
    Acquired(Arc<Instance>),
    /// No available instance runs the requested image.
    NoneAvailable,
    /// A match existed but could not be tagged; it stays in the pool.
    Unavailable,
}

impl Acquisition {
    pub fn into_instance(self) -> Option<Arc<Instance>> {
        match self {
            Acquisition::Acquired(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }
}

/// Population of each collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub starting: usize,
    pub available: usize,
    pub stopping: usize,
    pub used: usize,
    /// Indexed but in no collection (no disk yet, stopped, or quarantined).
    pub unplaced: usize,
}

struct Reservation {
    instance: Arc<Instance>,
    /// When the reservation was first observed by this process.
    reserved_at: Instant,
}

struct ClusterState {
    instances: HashMap<InstanceId, Arc<Instance>>,
    used: HashMap<InstanceId, Reservation>,
    disks: Vec<Disk>,
    start_failures: StartFailures,
}

struct ClusterInner {
    provider: Arc<dyn CloudProvider>,
    settings: PoolSettings,
    delayer: Delayer,
    starting: InstanceList,
    available: InstanceList,
    stopping: InstanceList,
    state: Mutex<ClusterState>,
    /// Delayed restarts scheduled by `stop_instance`.
    restarts: StdMutex<JoinSet<()>>,
    shutdown: watch::Receiver<bool>,
}

/// A reconciled pool of provider instances.
pub struct Cluster {
    inner: Arc<ClusterInner>,
    shutdown_tx: watch::Sender<bool>,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Build a cluster and run one full reconciliation before returning.
    ///
    /// A background task then repeats the reconciliation after every
    /// randomized refresh delay until [`Cluster::shutdown`] is called or the
    /// cluster is dropped.
    pub async fn new(provider: Arc<dyn CloudProvider>, settings: PoolSettings) -> PoolResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ClusterInner {
            provider,
            delayer: Delayer::new(settings.refresh_min, settings.refresh_max),
            starting: InstanceList::new(Location::Starting),
            available: InstanceList::new(Location::Available),
            stopping: InstanceList::new(Location::Stopping),
            state: Mutex::new(ClusterState {
                instances: HashMap::new(),
                used: HashMap::new(),
                disks: Vec::new(),
                start_failures: StartFailures::new(settings.restart_policy),
            }),
            restarts: StdMutex::new(JoinSet::new()),
            shutdown: shutdown_rx,
            settings,
        });

        inner.refresh_disks().await?;
        inner.refresh_instances().await?;

        let stats = inner.stats().await;
        info!(
            region = %inner.settings.region_id,
            zone = %inner.settings.zone_id,
            total = stats.total,
            available = stats.available,
            used = stats.used,
            "cluster initialized"
        );

        let refresh_task = tokio::spawn(inner.clone().refresh_loop());

        Ok(Self {
            inner,
            shutdown_tx,
            refresh_task: StdMutex::new(Some(refresh_task)),
        })
    }

    /// Look up any known instance by id.
    pub async fn find(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.inner.state.lock().await.instances.get(instance_id).cloned()
    }

    /// Reserve an available instance running `image_id`.
    pub async fn get_instance(&self, image_id: &str) -> Acquisition {
        self.inner.get_instance(image_id).await
    }

    /// Release a reserved instance: force-stop it and schedule its restart.
    pub async fn stop_instance(&self, instance_id: &str) -> PoolResult<()> {
        self.inner.stop_instance(instance_id).await
    }

    /// Run one reconciliation pass now (disks, then instances).
    pub async fn refresh(&self) -> PoolResult<()> {
        self.inner.refresh().await
    }

    pub async fn stats(&self) -> PoolStats {
        self.inner.stats().await
    }

    /// Snapshots of every known instance, ordered by id.
    pub async fn instances(&self) -> Vec<InstanceView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<_> = state.instances.values().map(|i| i.view()).collect();
        views.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        views
    }

    /// Ids held at `location`. Bucket members come in bucket order; used
    /// and unplaced ids are sorted.
    pub async fn members(&self, location: Location) -> Vec<InstanceId> {
        let inner = &self.inner;
        let state = inner.state.lock().await;
        if let Some(bucket) = inner.bucket(location) {
            return bucket.ids();
        }
        let mut ids: Vec<_> = match location {
            Location::Used => state.used.keys().cloned().collect(),
            _ => state
                .instances
                .values()
                .filter(|i| i.location() == Location::None)
                .map(|i| i.id().to_string())
                .collect(),
        };
        ids.sort();
        ids
    }

    /// Restart follow-ups not yet finished.
    pub fn pending_restarts(&self) -> usize {
        let mut restarts = self.inner.lock_restarts();
        while restarts.try_join_next().is_some() {}
        restarts.len()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Stop the refresh loop and settle restart follow-ups.
    ///
    /// A pass already running completes first. Follow-ups still waiting out
    /// their delay are cancelled; those already starting an instance are
    /// awaited.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let refresh_task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = refresh_task
            && let Err(e) = handle.await
        {
            warn!(error = %e, "refresh loop ended abnormally");
        }

        let mut restarts = std::mem::take(&mut *self.inner.lock_restarts());
        while let Some(result) = restarts.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "restart follow-up ended abnormally");
            }
        }

        info!("cluster stopped");
    }
}

impl ClusterInner {
    async fn refresh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let (min, max) = self.delayer.range();
        debug!(?min, ?max, "refresh loop started");

        loop {
            tokio::select! {
                _ = self.delayer.wait() => {}
                _ = shutdown.changed() => {
                    debug!("refresh loop shutting down");
                    break;
                }
            }

            if let Err(e) = self.refresh().await {
                warn!(error = %e, "reconciliation pass failed, retrying next cycle");
                continue;
            }

            let stats = self.stats().await;
            debug!(
                total = stats.total,
                available = stats.available,
                used = stats.used,
                stopping = stats.stopping,
                starting = stats.starting,
                "finished refresh"
            );
        }
    }

    async fn refresh(&self) -> PoolResult<()> {
        self.refresh_disks().await?;
        self.refresh_instances().await
    }

    /// Replace the disk cache with a full listing.
    async fn refresh_disks(&self) -> PoolResult<()> {
        let provider = self.provider.as_ref();
        let query = self.settings.disk_query();
        let query = &query;
        let disks = collect_pages(self.settings.page_size, move |page| {
            provider.describe_disks(query, page)
        })
        .await?;

        debug!(total = disks.len(), "disks refreshed");
        self.state.lock().await.disks = disks;
        Ok(())
    }

    async fn refresh_instances(&self) -> PoolResult<()> {
        let provider = self.provider.as_ref();
        let page_size = self.settings.page_size;

        let instance_query = self.settings.instance_query();
        let query = &instance_query;
        let listed = collect_pages(page_size, move |page| provider.describe_instances(query, page))
            .await?;
        debug!(total = listed.len(), "instances listed");

        let tag_query = self.settings.reservation_query();
        let query = &tag_query;
        let listing_started = Instant::now();
        let tagged: HashSet<InstanceId> = collect_pages(page_size, move |page| {
            provider.describe_resources_by_tag(query, page)
        })
        .await?
        .into_iter()
        .filter(|r| r.resource_type == ResourceType::Instance)
        .map(|r| r.resource_id)
        .collect();
        debug!(total = tagged.len(), "reserved instances listed");

        let to_start = {
            let mut state = self.state.lock().await;
            state.start_failures.prune();
            self.reconcile_reservations(&mut state, &tagged, listing_started);
            self.reconcile_statuses(&mut state, listed)
        };

        for instance in to_start {
            self.start_stopped(instance).await;
        }
        Ok(())
    }

    /// Make `used` mirror the reservation tag listing.
    fn reconcile_reservations(
        &self,
        state: &mut ClusterState,
        tagged: &HashSet<InstanceId>,
        listing_started: Instant,
    ) {
        for id in tagged {
            let instance = state
                .instances
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Instance::placeholder(id.as_str())))
                .clone();

            // A tagged instance must not stay reachable through a bucket.
            if let Some(bucket) = self.bucket(instance.location())
                && let Err(e) = bucket.remove(&instance)
            {
                error!(instance_id = %id, error = %e, "failed to unbucket reserved instance");
                continue;
            }
            instance.set_membership(Location::Used, None);

            state.used.entry(id.clone()).or_insert_with(|| {
                debug!(instance_id = %id, "reservation adopted from tag listing");
                Reservation {
                    instance,
                    reserved_at: listing_started,
                }
            });
        }

        // Reservations made after the listing was requested may be missing
        // from it and are kept.
        let stale: Vec<InstanceId> = state
            .used
            .iter()
            .filter(|(id, r)| !tagged.contains(*id) && r.reserved_at < listing_started)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(reservation) = state.used.remove(&id) {
                reservation.instance.set_membership(Location::None, None);
                info!(instance_id = %id, "reservation tag gone, releasing instance");
            }
        }
    }

    /// Place unreserved instances by reported status. Returns the stopped
    /// instances to start once the state lock is released.
    fn reconcile_statuses(
        &self,
        state: &mut ClusterState,
        listed: Vec<InstanceAttributes>,
    ) -> Vec<Arc<Instance>> {
        let mut to_start = Vec::new();

        for attrs in listed {
            let id = attrs.instance_id.clone();
            let status = attrs.status;
            let disk = state.disks.iter().find(|d| d.is_attached_to(&id)).cloned();

            let instance = state
                .instances
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Instance::new(attrs.clone())))
                .clone();
            instance.update(attrs, disk);

            if instance.disk().is_none() {
                debug!(instance_id = %id, "no disk attached yet, not placing");
                continue;
            }

            if status != InstanceStatus::Stopped {
                state.start_failures.clear(&id);
            }

            if state.used.contains_key(&id) {
                continue;
            }

            let placed = match status {
                InstanceStatus::Running => self.place(&instance, &self.available),
                InstanceStatus::Starting => self.place(&instance, &self.starting),
                InstanceStatus::Stopping => self.place(&instance, &self.stopping),
                InstanceStatus::Stopped => {
                    let unplaced = self.unplace(&instance);
                    if state.start_failures.is_quarantined(&id) {
                        warn!(
                            instance_id = %id,
                            failures = state.start_failures.failures(&id),
                            "start attempts exhausted, leaving instance stopped"
                        );
                    } else {
                        to_start.push(instance.clone());
                    }
                    unplaced
                }
                InstanceStatus::Unknown => Ok(()),
            };

            if let Err(e) = placed {
                error!(instance_id = %id, %status, error = %e, "failed to place instance");
            }
        }

        to_start
    }

    /// Move `instance` into `target` unless it is already there.
    fn place(&self, instance: &Arc<Instance>, target: &InstanceList) -> PoolResult<()> {
        if instance.location() == target.location() {
            return Ok(());
        }
        self.unplace(instance)?;
        target.push(instance.clone())?;
        Ok(())
    }

    /// Take `instance` out of whichever bucket holds it.
    fn unplace(&self, instance: &Arc<Instance>) -> PoolResult<()> {
        if let Some(bucket) = self.bucket(instance.location()) {
            bucket.remove(instance)?;
        }
        Ok(())
    }

    async fn start_stopped(&self, instance: Arc<Instance>) {
        match instance.start(self.provider.as_ref(), &self.settings).await {
            Ok(()) => {
                self.state.lock().await.start_failures.clear(instance.id());
                info!(instance_id = %instance.id(), "stopped instance started");
            }
            Err(e) => {
                let quarantined = self
                    .state
                    .lock()
                    .await
                    .start_failures
                    .record_failure(instance.id());
                error!(
                    instance_id = %instance.id(),
                    status = %instance.status(),
                    error = %e,
                    "failed to start stopped instance"
                );
                if quarantined {
                    warn!(instance_id = %instance.id(), "instance quarantined after repeated start failures");
                }
            }
        }
    }

    async fn get_instance(&self, image_id: &str) -> Acquisition {
        let mut state = self.state.lock().await;

        let Some(instance) = self.available.find(image_id) else {
            debug!(%image_id, "no available instance for image");
            return Acquisition::NoneAvailable;
        };

        if let Err(e) = instance
            .set_used_tag(self.provider.as_ref(), &self.settings)
            .await
        {
            error!(instance_id = %instance.id(), error = %e, "failed to set reservation tag");
            if let Err(e) = self.available.push(instance.clone()) {
                error!(instance_id = %instance.id(), error = %e, "failed to return instance to pool");
            }
            return Acquisition::Unavailable;
        }

        instance.set_membership(Location::Used, None);
        state.used.insert(
            instance.id().to_string(),
            Reservation {
                instance: instance.clone(),
                reserved_at: Instant::now(),
            },
        );
        debug!(instance_id = %instance.id(), %image_id, "instance reserved");
        Acquisition::Acquired(instance)
    }

    async fn stop_instance(&self, instance_id: &str) -> PoolResult<()> {
        let mut state = self.state.lock().await;

        if !state.instances.contains_key(instance_id) {
            return Err(PoolError::NotFound(instance_id.to_string()));
        }
        let instance = state
            .used
            .get(instance_id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| PoolError::NotReserved(instance_id.to_string()))?;

        if let Err(e) = instance.stop(self.provider.as_ref(), &self.settings).await {
            error!(%instance_id, error = %e, "failed to stop instance");
            // Stop clears the tag first; an untagged entry would be released
            // by the next pass while the caller still holds the instance.
            if let Err(tag_err) = instance
                .set_used_tag(self.provider.as_ref(), &self.settings)
                .await
            {
                error!(%instance_id, error = %tag_err, "failed to restore reservation tag");
            }
            return Err(e);
        }

        state.used.remove(instance_id);
        instance.set_membership(Location::None, None);
        drop(state);

        info!(%instance_id, "instance released");
        self.schedule_restart(instance);
        Ok(())
    }

    /// A forced stop finishes while the instance is still settling, so the
    /// restart runs after `restart_delay` instead of waiting for a pass.
    fn schedule_restart(&self, instance: Arc<Instance>) {
        let provider = self.provider.clone();
        let settings = self.settings.clone();
        let mut shutdown = self.shutdown.clone();

        let mut restarts = self.lock_restarts();
        while restarts.try_join_next().is_some() {}

        restarts.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settings.restart_delay) => {}
                _ = shutdown.changed() => {
                    debug!(instance_id = %instance.id(), "restart cancelled by shutdown");
                    return;
                }
            }

            let previous = instance.status();
            instance.set_status(InstanceStatus::Stopped);
            match instance.start(provider.as_ref(), &settings).await {
                Ok(()) => info!(instance_id = %instance.id(), "released instance restarted"),
                Err(e) => {
                    instance.set_status(previous);
                    warn!(instance_id = %instance.id(), error = %e, "restart after release failed");
                }
            }
        });
    }

    async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let starting = self.starting.len();
        let available = self.available.len();
        let stopping = self.stopping.len();
        let used = state.used.len();
        let total = state.instances.len();
        PoolStats {
            total,
            starting,
            available,
            stopping,
            used,
            unplaced: total.saturating_sub(starting + available + stopping + used),
        }
    }

    fn bucket(&self, location: Location) -> Option<&InstanceList> {
        match location {
            Location::Starting => Some(&self.starting),
            Location::Available => Some(&self.available),
            Location::Stopping => Some(&self.stopping),
            Location::None | Location::Used => None,
        }
    }

    fn lock_restarts(&self) -> StdMutexGuard<'_, JoinSet<()>> {
        self.restarts.lock().unwrap_or_else(|e| e.into_inner())
    }
}
