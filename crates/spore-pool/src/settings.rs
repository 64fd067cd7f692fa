//! Immutable settings for a [`Cluster`](crate::Cluster).

use std::time::Duration;

use spore_core::{DEFAULT_PAGE_SIZE, ResourceType, SporeConfig, Tag};
use spore_provider::{DiskQuery, InstanceQuery, TagQuery, TagRequest};

use crate::error::PoolResult;

/// What reconciliation does with an instance whose start keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Failed starts tolerated within `window`; `None` retries every pass.
    pub max_attempts: Option<u32>,
    pub window: Duration,
}

impl RestartPolicy {
    /// Retry on every reconciliation pass.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            window: Duration::from_secs(10 * 60),
        }
    }

    /// Quarantine after `max_attempts` failures inside `window`.
    pub fn limited(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            window,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Provider scope, reservation tag, and timing for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub region_id: String,
    pub zone_id: String,
    pub security_group_id: String,
    /// Tag marking an instance as handed out.
    pub reservation_tag: Tag,
    pub refresh_min: Duration,
    pub refresh_max: Duration,
    /// Wait between disk reinit and the start call.
    pub settle_period: Duration,
    /// Wait between a forced stop and the restart follow-up.
    pub restart_delay: Duration,
    pub page_size: u32,
    pub restart_policy: RestartPolicy,
}

impl PoolSettings {
    pub fn new(
        region_id: impl Into<String>,
        zone_id: impl Into<String>,
        security_group_id: impl Into<String>,
        reservation_tag: Tag,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            zone_id: zone_id.into(),
            security_group_id: security_group_id.into(),
            reservation_tag,
            refresh_min: Duration::from_secs(30),
            refresh_max: Duration::from_secs(60),
            settle_period: Duration::from_secs(2),
            restart_delay: Duration::from_secs(3),
            page_size: DEFAULT_PAGE_SIZE,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn from_config(config: &SporeConfig) -> PoolResult<Self> {
        config.validate()?;
        let (refresh_min, refresh_max) = config.refresh.bounds()?;
        let lifecycle = &config.lifecycle;
        let restart_policy = match lifecycle.max_start_attempts {
            0 => RestartPolicy::unlimited(),
            n => RestartPolicy::limited(n, lifecycle.start_retry_window()?),
        };

        Ok(Self {
            region_id: config.provider.region_id.clone(),
            zone_id: config.provider.zone_id.clone(),
            security_group_id: config.provider.security_group_id.clone(),
            reservation_tag: config.reservation.tag(),
            refresh_min,
            refresh_max,
            settle_period: lifecycle.settle_period()?,
            restart_delay: lifecycle.restart_delay()?,
            page_size: config.provider.page_size,
            restart_policy,
        })
    }

    pub fn with_refresh_interval(mut self, min: Duration, max: Duration) -> Self {
        self.refresh_min = min;
        self.refresh_max = max.max(min);
        self
    }

    pub fn with_settle_period(mut self, period: Duration) -> Self {
        self.settle_period = period;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub(crate) fn disk_query(&self) -> DiskQuery {
        DiskQuery {
            region_id: self.region_id.clone(),
            zone_id: self.zone_id.clone(),
        }
    }

    pub(crate) fn instance_query(&self) -> InstanceQuery {
        InstanceQuery {
            region_id: self.region_id.clone(),
            zone_id: self.zone_id.clone(),
            security_group_id: self.security_group_id.clone(),
        }
    }

    pub(crate) fn reservation_query(&self) -> TagQuery {
        TagQuery {
            region_id: self.region_id.clone(),
            resource_type: ResourceType::Instance,
            tag: self.reservation_tag.clone(),
        }
    }

    pub(crate) fn reservation_request(&self, instance_id: &str) -> TagRequest {
        TagRequest {
            region_id: self.region_id.clone(),
            resource_id: instance_id.to_string(),
            resource_type: ResourceType::Instance,
            tag: self.reservation_tag.clone(),
        }
    }
}
