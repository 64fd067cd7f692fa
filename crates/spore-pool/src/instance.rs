//! In-memory record of one pooled cloud instance.
//!
//! An [`Instance`] caches what the provider last reported about a
//! machine, the disk attached to it, and which lifecycle collection
//! currently holds it. Records are shared as `Arc<Instance>` between the
//! cluster index, the lifecycle buckets, and callers that acquired them.
//!
//! Lock order: a bucket's ring lock may be held while an instance's
//! state lock is taken, never the reverse.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, warn};

use spore_core::{Disk, InstanceAttributes, InstanceId, InstanceStatus};
use spore_provider::CloudProvider;

use crate::error::{PoolError, PoolResult};
use crate::settings::PoolSettings;

/// Which collection currently holds an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Not placed: disk unresolved, stopped, or being moved.
    #[default]
    None,
    Starting,
    Available,
    Stopping,
    /// Reserved by a caller.
    Used,
}

#[derive(Debug)]
struct InstanceState {
    attrs: InstanceAttributes,
    disk: Option<Disk>,
    location: Location,
    /// Arena slot inside the bucket named by `location`.
    slot: Option<usize>,
}

/// Serializable snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceView {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub image_id: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    state: Mutex<InstanceState>,
}

impl Instance {
    pub fn new(attrs: InstanceAttributes) -> Self {
        Self {
            id: attrs.instance_id.clone(),
            state: Mutex::new(InstanceState {
                attrs,
                disk: None,
                location: Location::None,
                slot: None,
            }),
        }
    }

    /// A record known only by id, e.g. from the reservation tag listing.
    pub fn placeholder(instance_id: impl Into<String>) -> Self {
        Self::new(InstanceAttributes::placeholder(instance_id))
    }

    pub fn with_disk(self, disk: Disk) -> Self {
        self.lock().disk = Some(disk);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attrs(&self) -> InstanceAttributes {
        self.lock().attrs.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.lock().attrs.status
    }

    pub fn image_id(&self) -> String {
        self.lock().attrs.image_id.clone()
    }

    pub fn disk(&self) -> Option<Disk> {
        self.lock().disk.clone()
    }

    pub fn location(&self) -> Location {
        self.lock().location
    }

    pub fn view(&self) -> InstanceView {
        let state = self.lock();
        InstanceView {
            instance_id: self.id.clone(),
            status: state.attrs.status,
            image_id: state.attrs.image_id.clone(),
            location: state.location,
            disk_id: state.disk.as_ref().map(|d| d.disk_id.clone()),
            instance_name: state.attrs.instance_name.clone(),
            private_ip: state.attrs.private_ip.clone(),
            public_ip: state.attrs.public_ip.clone(),
        }
    }

    /// Start a stopped instance from a freshly reinitialized disk.
    ///
    /// Clears the reservation tag (best effort), reinitializes the disk,
    /// waits out the settle period, then issues the start call.
    pub async fn start(&self, provider: &dyn CloudProvider, settings: &PoolSettings) -> PoolResult<()> {
        let status = self.status();
        if status != InstanceStatus::Stopped {
            return Err(self.invalid_state(status, "start"));
        }
        let disk = self
            .disk()
            .ok_or_else(|| PoolError::MissingDisk(self.id.clone()))?;

        self.clear_used_tag(provider, settings).await;

        if let Err(e) = provider.reinit_disk(&disk.disk_id).await {
            error!(instance_id = %self.id, disk_id = %disk.disk_id, error = %e, "disk reinit failed");
            return Err(e.into());
        }

        // Reinit completes asynchronously; starting too early is rejected.
        tokio::time::sleep(settings.settle_period).await;

        provider.start_instance(&self.id).await?;
        debug!(instance_id = %self.id, "start issued");
        Ok(())
    }

    /// Force-stop a running instance, clearing its reservation tag first.
    pub async fn stop(&self, provider: &dyn CloudProvider, settings: &PoolSettings) -> PoolResult<()> {
        let status = self.status();
        if status != InstanceStatus::Running {
            return Err(self.invalid_state(status, "stop"));
        }

        self.clear_used_tag(provider, settings).await;

        provider.stop_instance(&self.id, true).await?;
        debug!(instance_id = %self.id, "forced stop issued");
        Ok(())
    }

    /// Apply the reservation tag on the provider.
    pub async fn set_used_tag(&self, provider: &dyn CloudProvider, settings: &PoolSettings) -> PoolResult<()> {
        provider
            .add_tags(&settings.reservation_request(&self.id))
            .await?;
        Ok(())
    }

    /// A stale tag left behind is corrected by a later reconciliation.
    async fn clear_used_tag(&self, provider: &dyn CloudProvider, settings: &PoolSettings) {
        if let Err(e) = provider
            .remove_tags(&settings.reservation_request(&self.id))
            .await
        {
            warn!(instance_id = %self.id, error = %e, "failed to clear reservation tag");
        }
    }

    fn invalid_state(&self, status: InstanceStatus, action: &'static str) -> PoolError {
        PoolError::InvalidState {
            instance_id: self.id.clone(),
            status,
            action,
        }
    }

    pub(crate) fn update(&self, attrs: InstanceAttributes, disk: Option<Disk>) {
        let mut state = self.lock();
        state.attrs = attrs;
        if disk.is_some() {
            state.disk = disk;
        }
    }

    pub(crate) fn set_status(&self, status: InstanceStatus) {
        self.lock().attrs.status = status;
    }

    pub(crate) fn matches_image(&self, image_id: &str) -> bool {
        self.lock().attrs.image_id == image_id
    }

    pub(crate) fn membership(&self) -> (Location, Option<usize>) {
        let state = self.lock();
        (state.location, state.slot)
    }

    pub(crate) fn set_membership(&self, location: Location, slot: Option<usize>) {
        let mut state = self.lock();
        state.location = location;
        state.slot = slot;
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use spore_core::Tag;
    use spore_provider::{MemoryProvider, Operation};

    fn settings() -> PoolSettings {
        PoolSettings::new("r", "z", "sg", Tag::new("spore", "used"))
            .with_settle_period(Duration::ZERO)
    }

    fn fleet(status: InstanceStatus) -> (MemoryProvider, Instance) {
        let attrs = InstanceAttributes::new("i-1", status, "img-1");
        let provider = MemoryProvider::new();
        provider.add_instance(attrs.clone());
        provider.add_disk(Disk::attached("d-1", "i-1"));
        let instance = Instance::new(attrs).with_disk(Disk::attached("d-1", "i-1"));
        (provider, instance)
    }

    #[tokio::test]
    async fn start_runs_full_sequence() {
        let (provider, instance) = fleet(InstanceStatus::Stopped);
        provider.tag_instance("i-1", Tag::new("spore", "used"));

        instance.start(&provider, &settings()).await.unwrap();

        let ops: Vec<_> = provider.calls().into_iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            [Operation::RemoveTags, Operation::ReinitDisk, Operation::StartInstance]
        );
        assert!(!provider.has_tag("i-1", &Tag::new("spore", "used")));
        assert_eq!(provider.status("i-1"), Some(InstanceStatus::Starting));
    }

    #[tokio::test]
    async fn start_rejects_non_stopped() {
        let (provider, instance) = fleet(InstanceStatus::Running);
        let err = instance.start(&provider, &settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { action: "start", .. }));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn start_tolerates_tag_failure_but_not_reinit_failure() {
        let (provider, instance) = fleet(InstanceStatus::Stopped);
        provider.fail_next(Operation::RemoveTags, 1);
        instance.start(&provider, &settings()).await.unwrap();

        let (provider, instance) = fleet(InstanceStatus::Stopped);
        provider.fail_next(Operation::ReinitDisk, 1);
        let err = instance.start(&provider, &settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::Provider(_)));
        assert_eq!(provider.count_calls(Operation::StartInstance), 0);
    }

    #[tokio::test]
    async fn start_requires_disk() {
        let provider = MemoryProvider::new();
        let instance = Instance::new(InstanceAttributes::new("i-1", InstanceStatus::Stopped, "img"));
        let err = instance.start(&provider, &settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::MissingDisk(_)));
    }

    #[tokio::test]
    async fn stop_forces_running_instance() {
        let (provider, instance) = fleet(InstanceStatus::Running);
        provider.fail_next(Operation::RemoveTags, 1);

        instance.stop(&provider, &settings()).await.unwrap();
        assert_eq!(provider.status("i-1"), Some(InstanceStatus::Stopped));

        let (provider, instance) = fleet(InstanceStatus::Starting);
        let err = instance.stop(&provider, &settings()).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { action: "stop", .. }));
    }

    #[tokio::test]
    async fn set_used_tag_propagates_failure() {
        let (provider, instance) = fleet(InstanceStatus::Running);
        provider.fail_next(Operation::AddTags, 1);
        assert!(instance.set_used_tag(&provider, &settings()).await.is_err());

        instance.set_used_tag(&provider, &settings()).await.unwrap();
        assert!(provider.has_tag("i-1", &Tag::new("spore", "used")));
    }

    #[test]
    fn view_reflects_state() {
        let mut attrs = InstanceAttributes::new("i-1", InstanceStatus::Running, "img-1");
        attrs.public_ip = Some("203.0.113.5".to_string());
        let instance = Instance::new(attrs).with_disk(Disk::attached("d-1", "i-1"));
        instance.set_membership(Location::Used, None);

        let view = instance.view();
        assert_eq!(view.location, Location::Used);
        assert_eq!(view.disk_id.as_deref(), Some("d-1"));
        assert_eq!(view.public_ip.as_deref(), Some("203.0.113.5"));

        let placeholder = Instance::placeholder("i-2");
        assert_eq!(placeholder.status(), InstanceStatus::Unknown);
        assert_eq!(placeholder.location(), Location::None);
    }
}
