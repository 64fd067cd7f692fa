//! Provider-facing records shared across Spore crates.
//!
//! These mirror what the cloud provider reports about instances, disks,
//! and tagged resources. The pool engine never invents these values; it
//! only caches and classifies them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider identifier of a compute instance.
pub type InstanceId = String;

/// Provider identifier of a disk.
pub type DiskId = String;

/// Provider identifier of a machine image.
pub type ImageId = String;

/// Default number of records requested per listing page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle status of an instance as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Anything else, including records known only through the tag listing.
    #[default]
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "Starting",
            InstanceStatus::Running => "Running",
            InstanceStatus::Stopping => "Stopping",
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes of one instance from the provider's instance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAttributes {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub image_id: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

impl InstanceAttributes {
    pub fn new(instance_id: impl Into<String>, status: InstanceStatus, image_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            image_id: image_id.into(),
            instance_name: None,
            private_ip: None,
            public_ip: None,
        }
    }

    /// Attributes for an instance seen only by id (e.g. via its tags).
    pub fn placeholder(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, InstanceStatus::Unknown, "")
    }
}

// ── Disks and tags ────────────────────────────────────────────────

/// A provider disk and the instance it is attached to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub disk_id: DiskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

impl Disk {
    pub fn attached(disk_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            disk_id: disk_id.into(),
            instance_id: Some(instance_id.into()),
        }
    }

    pub fn is_attached_to(&self, instance_id: &str) -> bool {
        self.instance_id.as_deref() == Some(instance_id)
    }
}

/// Kind of resource a tag is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Instance,
    Disk,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Instance => "instance",
            ResourceType::Disk => "disk",
        }
    }
}

/// One entry of a tag-based resource listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceItem {
    pub resource_id: String,
    pub resource_type: ResourceType,
}

/// A provider-side key/value label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// ── Pagination ────────────────────────────────────────────────────

/// Page request for provider listings. Page numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_number: u32,
    pub page_size: u32,
}

impl Pagination {
    /// The first page with the given size.
    pub fn first(page_size: u32) -> Self {
        Self {
            page_number: 1,
            page_size: page_size.max(1),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// One page of a provider listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u32,
    pub page_number: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Request for the following page, or `None` when this was the last.
    pub fn next_page(&self) -> Option<Pagination> {
        if self.page_size == 0 {
            return None;
        }
        let seen = u64::from(self.page_number) * u64::from(self.page_size);
        if seen >= u64::from(self.total_count) {
            return None;
        }
        Some(Pagination {
            page_number: self.page_number + 1,
            page_size: self.page_size,
        })
    }
}
