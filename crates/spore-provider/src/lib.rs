//! spore-provider — the cloud provider seam for Spore.
//!
//! The pool engine talks to the provider exclusively through the
//! [`CloudProvider`] trait: paged listings of disks, instances, and
//! tagged resources, plus the handful of mutating calls the instance
//! lifecycle needs (tagging, disk reinit, start, stop).
//!
//! [`MemoryProvider`] is a complete in-process implementation. It backs
//! the test suites and the daemon's `memory` backend, and supports
//! fault injection so reservation and recovery paths can be exercised.

pub mod error;
pub mod memory;
pub mod provider;

pub use error::{ProviderError, ProviderResult};
pub use memory::{CALL_LOG_CAPACITY, MemoryProvider, Operation, ProviderCall};
pub use provider::{CloudProvider, DiskQuery, InstanceQuery, TagQuery, TagRequest};
