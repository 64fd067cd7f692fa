//! The `CloudProvider` trait and its request types.

use async_trait::async_trait;

use spore_core::{
    Disk, InstanceAttributes, Page, Pagination, ResourceItem, ResourceType, Tag,
};

use crate::error::ProviderResult;

/// Disk listing scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskQuery {
    pub region_id: String,
    pub zone_id: String,
}

/// Instance listing scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    pub region_id: String,
    pub zone_id: String,
    pub security_group_id: String,
}

/// Tag-based resource listing scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagQuery {
    pub region_id: String,
    pub resource_type: ResourceType,
    pub tag: Tag,
}

/// Add or remove one tag on one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRequest {
    pub region_id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub tag: Tag,
}

/// Operations Spore consumes from a cloud provider.
///
/// Listings are paged; callers drive pagination with
/// [`Page::next_page`]. No call is retried here and no timeout is
/// imposed: a hanging provider stalls the caller.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_disks(
        &self,
        query: &DiskQuery,
        page: Pagination,
    ) -> ProviderResult<Page<Disk>>;

    async fn describe_instances(
        &self,
        query: &InstanceQuery,
        page: Pagination,
    ) -> ProviderResult<Page<InstanceAttributes>>;

    async fn describe_resources_by_tag(
        &self,
        query: &TagQuery,
        page: Pagination,
    ) -> ProviderResult<Page<ResourceItem>>;

    async fn add_tags(&self, request: &TagRequest) -> ProviderResult<()>;

    async fn remove_tags(&self, request: &TagRequest) -> ProviderResult<()>;

    /// Reset a disk to its image. Completes asynchronously on the provider.
    async fn reinit_disk(&self, disk_id: &str) -> ProviderResult<()>;

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()>;

    async fn stop_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()>;
}
