//! In-memory cloud provider.
//!
//! Keeps instances, disks, and tags in a shared map and answers the
//! [`CloudProvider`] calls against it with the same status rules a real
//! provider enforces: only stopped instances start, only running
//! instances stop, and a disk can only be reinitialized while its
//! instance is stopped.
//!
//! Every call is recorded, and any operation can be made to fail a
//! given number of times with [`MemoryProvider::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use spore_core::{
    Disk, DiskId, InstanceAttributes, InstanceId, InstanceStatus, Page, Pagination,
    ResourceItem, ResourceType, Tag,
};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{CloudProvider, DiskQuery, InstanceQuery, TagQuery, TagRequest};

/// Calls kept in the log before the oldest are dropped.
pub const CALL_LOG_CAPACITY: usize = 1024;

/// Provider operations, for call logs and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeDisks,
    DescribeInstances,
    DescribeResourcesByTag,
    AddTags,
    RemoveTags,
    ReinitDisk,
    StartInstance,
    StopInstance,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub operation: Operation,
    /// Resource the call acted on; `None` for listings.
    pub target: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    instances: BTreeMap<InstanceId, InstanceAttributes>,
    disks: BTreeMap<DiskId, Disk>,
    tags: BTreeMap<InstanceId, Vec<Tag>>,
    faults: HashMap<Operation, u32>,
    /// Most recent calls, oldest first, at most `CALL_LOG_CAPACITY`.
    calls: VecDeque<ProviderCall>,
    auto_advance: bool,
}

impl MemoryState {
    fn advance(&mut self) {
        for attrs in self.instances.values_mut() {
            attrs.status = match attrs.status {
                InstanceStatus::Starting => InstanceStatus::Running,
                InstanceStatus::Stopping => InstanceStatus::Stopped,
                other => other,
            };
        }
    }

    fn instance_mut(&mut self, instance_id: &str) -> ProviderResult<&mut InstanceAttributes> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {instance_id}")))
    }
}

/// Seed file layout for [`MemoryProvider::from_fixture_file`].
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    auto_advance: bool,
    #[serde(default)]
    instances: Vec<InstanceAttributes>,
    #[serde(default)]
    disks: Vec<Disk>,
    #[serde(default)]
    tags: Vec<FixtureTag>,
}

#[derive(Debug, Deserialize)]
struct FixtureTag {
    instance_id: InstanceId,
    key: String,
    value: String,
}

/// A cloneable handle to one shared in-memory fleet.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a fleet from a TOML fixture.
    pub fn from_fixture_file(path: &Path) -> ProviderResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Fixture(format!("{}: {e}", path.display())))?;
        Self::from_fixture_str(&content)
    }

    pub fn from_fixture_str(content: &str) -> ProviderResult<Self> {
        let fixture: Fixture =
            toml::from_str(content).map_err(|e| ProviderError::Fixture(e.to_string()))?;

        let provider = Self::new().with_auto_advance(fixture.auto_advance);
        for attrs in fixture.instances {
            provider.add_instance(attrs);
        }
        for disk in fixture.disks {
            provider.add_disk(disk);
        }
        for tag in fixture.tags {
            provider.tag_instance(&tag.instance_id, Tag::new(tag.key, tag.value));
        }
        Ok(provider)
    }

    /// Settle transitional statuses on every first-page instance listing.
    pub fn with_auto_advance(self, enabled: bool) -> Self {
        self.lock().auto_advance = enabled;
        self
    }

    pub fn add_instance(&self, attrs: InstanceAttributes) {
        self.lock().instances.insert(attrs.instance_id.clone(), attrs);
    }

    pub fn add_disk(&self, disk: Disk) {
        self.lock().disks.insert(disk.disk_id.clone(), disk);
    }

    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Some(attrs) = self.lock().instances.get_mut(instance_id) {
            attrs.status = status;
        }
    }

    pub fn status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.lock().instances.get(instance_id).map(|a| a.status)
    }

    /// Tag an instance out of band, as another process would.
    pub fn tag_instance(&self, instance_id: &str, tag: Tag) {
        let mut state = self.lock();
        let tags = state.tags.entry(instance_id.to_string()).or_default();
        tags.retain(|t| t.key != tag.key);
        tags.push(tag);
    }

    /// Remove a tag out of band.
    pub fn untag_instance(&self, instance_id: &str, tag: &Tag) {
        if let Some(tags) = self.lock().tags.get_mut(instance_id) {
            tags.retain(|t| t != tag);
        }
    }

    pub fn has_tag(&self, instance_id: &str, tag: &Tag) -> bool {
        self.lock()
            .tags
            .get(instance_id)
            .is_some_and(|tags| tags.contains(tag))
    }

    /// Move Starting instances to Running and Stopping ones to Stopped.
    pub fn advance(&self) {
        self.lock().advance();
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: Operation, times: u32) {
        *self.lock().faults.entry(operation).or_insert(0) += times;
    }

    /// Recent calls, oldest first.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.iter().cloned().collect()
    }

    /// Targets of every recorded call of `operation`, in call order.
    pub fn calls_for(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .filter_map(|c| c.target.clone())
            .collect()
    }

    pub fn count_calls(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and apply any pending injected fault.
    fn enter(
        &self,
        operation: Operation,
        target: Option<&str>,
    ) -> ProviderResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        if state.calls.len() == CALL_LOG_CAPACITY {
            state.calls.pop_front();
        }
        state.calls.push_back(ProviderCall {
            operation,
            target: target.map(str::to_string),
        });
        if let Some(remaining) = state.faults.get_mut(&operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::api(
                "InjectedFault",
                format!("{operation:?} failed by fault injection"),
            ));
        }
        Ok(state)
    }
}

fn page_of<T>(items: Vec<T>, page: Pagination) -> Page<T> {
    let total_count = items.len() as u32;
    let page_size = page.page_size.max(1);
    let page_number = page.page_number.max(1);
    let skip = (page_number as usize - 1) * page_size as usize;
    Page {
        items: items.into_iter().skip(skip).take(page_size as usize).collect(),
        total_count,
        page_number,
        page_size,
    }
}

fn incorrect_status(instance_id: &str, status: InstanceStatus, action: &str) -> ProviderError {
    ProviderError::api(
        "IncorrectInstanceStatus",
        format!("cannot {action} instance {instance_id} in status {status}"),
    )
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn describe_disks(
        &self,
        _query: &DiskQuery,
        page: Pagination,
    ) -> ProviderResult<Page<Disk>> {
        let state = self.enter(Operation::DescribeDisks, None)?;
        let disks = state.disks.values().cloned().collect();
        Ok(page_of(disks, page))
    }

    async fn describe_instances(
        &self,
        _query: &InstanceQuery,
        page: Pagination,
    ) -> ProviderResult<Page<InstanceAttributes>> {
        let mut state = self.enter(Operation::DescribeInstances, None)?;
        if state.auto_advance && page.page_number <= 1 {
            state.advance();
        }
        let instances = state.instances.values().cloned().collect();
        Ok(page_of(instances, page))
    }

    async fn describe_resources_by_tag(
        &self,
        query: &TagQuery,
        page: Pagination,
    ) -> ProviderResult<Page<ResourceItem>> {
        let state = self.enter(Operation::DescribeResourcesByTag, None)?;
        let resources = match query.resource_type {
            ResourceType::Instance => state
                .tags
                .iter()
                .filter(|(_, tags)| tags.contains(&query.tag))
                .map(|(id, _)| ResourceItem {
                    resource_id: id.clone(),
                    resource_type: ResourceType::Instance,
                })
                .collect(),
            ResourceType::Disk => Vec::new(),
        };
        Ok(page_of(resources, page))
    }

    async fn add_tags(&self, request: &TagRequest) -> ProviderResult<()> {
        let mut state = self.enter(Operation::AddTags, Some(&request.resource_id))?;
        state.instance_mut(&request.resource_id)?;
        let tags = state.tags.entry(request.resource_id.clone()).or_default();
        tags.retain(|t| t.key != request.tag.key);
        tags.push(request.tag.clone());
        debug!(instance_id = %request.resource_id, tag = %request.tag, "tag added");
        Ok(())
    }

    async fn remove_tags(&self, request: &TagRequest) -> ProviderResult<()> {
        let mut state = self.enter(Operation::RemoveTags, Some(&request.resource_id))?;
        state.instance_mut(&request.resource_id)?;
        if let Some(tags) = state.tags.get_mut(&request.resource_id) {
            tags.retain(|t| t != &request.tag);
        }
        debug!(instance_id = %request.resource_id, tag = %request.tag, "tag removed");
        Ok(())
    }

    async fn reinit_disk(&self, disk_id: &str) -> ProviderResult<()> {
        let mut state = self.enter(Operation::ReinitDisk, Some(disk_id))?;
        let attached = state
            .disks
            .get(disk_id)
            .ok_or_else(|| ProviderError::NotFound(format!("disk {disk_id}")))?
            .instance_id
            .clone();
        if let Some(instance_id) = attached {
            let attrs = state.instance_mut(&instance_id)?;
            if attrs.status != InstanceStatus::Stopped {
                return Err(incorrect_status(&instance_id, attrs.status, "reinit disk of"));
            }
        }
        debug!(%disk_id, "disk reinitialized");
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()> {
        let mut state = self.enter(Operation::StartInstance, Some(instance_id))?;
        let attrs = state.instance_mut(instance_id)?;
        if attrs.status != InstanceStatus::Stopped {
            return Err(incorrect_status(instance_id, attrs.status, "start"));
        }
        attrs.status = InstanceStatus::Starting;
        debug!(%instance_id, "instance starting");
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()> {
        let mut state = self.enter(Operation::StopInstance, Some(instance_id))?;
        let attrs = state.instance_mut(instance_id)?;
        if attrs.status != InstanceStatus::Running {
            return Err(incorrect_status(instance_id, attrs.status, "stop"));
        }
        attrs.status = if force {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Stopping
        };
        debug!(%instance_id, force, "instance stopping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_query() -> InstanceQuery {
        InstanceQuery {
            region_id: "r".to_string(),
            zone_id: "z".to_string(),
            security_group_id: "sg".to_string(),
        }
    }

    fn tag_request(id: &str) -> TagRequest {
        TagRequest {
            region_id: "r".to_string(),
            resource_id: id.to_string(),
            resource_type: ResourceType::Instance,
            tag: Tag::new("spore", "used"),
        }
    }

    fn seeded(count: usize) -> MemoryProvider {
        let provider = MemoryProvider::new();
        for i in 0..count {
            provider.add_instance(InstanceAttributes::new(
                format!("i-{i:02}"),
                InstanceStatus::Running,
                "img-1",
            ));
        }
        provider
    }

    #[tokio::test]
    async fn pages_instances_in_id_order() {
        let provider = seeded(5);
        let page = provider
            .describe_instances(&instance_query(), Pagination { page_number: 2, page_size: 2 })
            .await
            .unwrap();

        assert_eq!(page.total_count, 5);
        let ids: Vec<_> = page.items.iter().map(|a| a.instance_id.as_str()).collect();
        assert_eq!(ids, ["i-02", "i-03"]);
        assert!(page.next_page().is_some());

        let last = provider
            .describe_instances(&instance_query(), Pagination { page_number: 3, page_size: 2 })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_page().is_none());
    }

    #[tokio::test]
    async fn start_and_stop_enforce_status() {
        let provider = seeded(1);

        let err = provider.start_instance("i-00").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { ref code, .. } if code == "IncorrectInstanceStatus"));

        provider.stop_instance("i-00", true).await.unwrap();
        assert_eq!(provider.status("i-00"), Some(InstanceStatus::Stopped));

        provider.start_instance("i-00").await.unwrap();
        assert_eq!(provider.status("i-00"), Some(InstanceStatus::Starting));

        provider.advance();
        provider.stop_instance("i-00", false).await.unwrap();
        assert_eq!(provider.status("i-00"), Some(InstanceStatus::Stopping));

        assert!(matches!(
            provider.start_instance("i-missing").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tags_round_trip_through_listing() {
        let provider = seeded(3);
        provider.add_tags(&tag_request("i-01")).await.unwrap();

        let query = TagQuery {
            region_id: "r".to_string(),
            resource_type: ResourceType::Instance,
            tag: Tag::new("spore", "used"),
        };
        let page = provider
            .describe_resources_by_tag(&query, Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].resource_id, "i-01");

        provider.remove_tags(&tag_request("i-01")).await.unwrap();
        assert!(!provider.has_tag("i-01", &Tag::new("spore", "used")));

        assert!(provider.add_tags(&tag_request("i-missing")).await.is_err());
    }

    #[tokio::test]
    async fn reinit_requires_stopped_instance() {
        let provider = seeded(1);
        provider.add_disk(Disk::attached("d-00", "i-00"));

        assert!(provider.reinit_disk("d-00").await.is_err());
        provider.set_status("i-00", InstanceStatus::Stopped);
        provider.reinit_disk("d-00").await.unwrap();
        assert!(matches!(
            provider.reinit_disk("d-missing").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fault_injection_fails_exact_count() {
        let provider = seeded(1);
        provider.fail_next(Operation::AddTags, 2);

        assert!(provider.add_tags(&tag_request("i-00")).await.is_err());
        assert!(provider.add_tags(&tag_request("i-00")).await.is_err());
        provider.add_tags(&tag_request("i-00")).await.unwrap();

        assert_eq!(provider.count_calls(Operation::AddTags), 3);
        assert_eq!(provider.calls_for(Operation::AddTags), ["i-00", "i-00", "i-00"]);
    }

    #[tokio::test]
    async fn auto_advance_settles_on_first_page() {
        let provider = seeded(1).with_auto_advance(true);
        provider.set_status("i-00", InstanceStatus::Starting);

        let page = provider
            .describe_instances(&instance_query(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.items[0].status, InstanceStatus::Running);
    }

    #[test]
    fn loads_fixture() {
        let provider = MemoryProvider::from_fixture_str(
            r#"
auto_advance = true

[[instances]]
instance_id = "i-a"
status = "Running"
image_id = "img-1"
public_ip = "203.0.113.10"

[[instances]]
instance_id = "i-b"
status = "Stopped"
image_id = "img-1"

[[disks]]
disk_id = "d-a"
instance_id = "i-a"

[[tags]]
instance_id = "i-a"
key = "spore"
value = "used"
"#,
        )
        .unwrap();

        assert_eq!(provider.status("i-a"), Some(InstanceStatus::Running));
        assert_eq!(provider.status("i-b"), Some(InstanceStatus::Stopped));
        assert!(provider.has_tag("i-a", &Tag::new("spore", "used")));
    }

    #[tokio::test]
    async fn call_log_keeps_only_recent_calls() {
        let provider = seeded(1);
        for _ in 0..CALL_LOG_CAPACITY + 5 {
            provider
                .describe_instances(&instance_query(), Pagination::first(10))
                .await
                .unwrap();
        }
        provider.add_tags(&tag_request("i-00")).await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), CALL_LOG_CAPACITY);
        assert_eq!(calls.last().unwrap().operation, Operation::AddTags);
        assert_eq!(provider.count_calls(Operation::DescribeInstances), CALL_LOG_CAPACITY - 1);
    }

    #[test]
    fn rejects_malformed_fixture() {
        let err = MemoryProvider::from_fixture_str("[[instances]]\nstatus = 3\n").unwrap_err();
        assert!(matches!(err, ProviderError::Fixture(_)));
    }
}
