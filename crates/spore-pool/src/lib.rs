//! Spore pool engine.
//!
//! Keeps a pool of pre-provisioned cloud instances in sync with the
//! provider and hands them out by image:
//!
//! - [`Cluster`]: reconciliation loop, acquire ([`Cluster::get_instance`])
//!   and release ([`Cluster::stop_instance`])
//! - [`InstanceList`]: lifecycle bucket with O(1) removal
//! - [`Instance`]: cached provider record with start/stop sequences
//! - [`Delayer`]: randomized refresh interval

pub mod bucket;
pub mod cluster;
pub mod delayer;
pub mod error;
pub mod instance;
pub mod pager;
pub mod retry;
pub mod settings;

pub use bucket::InstanceList;
pub use cluster::{Acquisition, Cluster, PoolStats};
pub use delayer::Delayer;
pub use error::{PoolError, PoolResult};
pub use instance::{Instance, InstanceView, Location};
pub use pager::collect_pages;
pub use settings::{PoolSettings, RestartPolicy};
