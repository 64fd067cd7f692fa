//! Pool error types.

use thiserror::Error;

use spore_core::{ConfigError, InstanceStatus};
use spore_provider::ProviderError;

use crate::instance::Location;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The instance's provider status does not permit the operation.
    #[error("cannot {action} instance {instance_id} in status {status}")]
    InvalidState {
        instance_id: String,
        status: InstanceStatus,
        action: &'static str,
    },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance not reserved: {0}")]
    NotReserved(String),

    #[error("instance {0} has no resolved disk")]
    MissingDisk(String),

    /// A bucket operation was handed an instance it does not hold.
    #[error("instance {instance_id} is in {actual:?}, not {expected:?}")]
    Membership {
        instance_id: String,
        expected: Location,
        actual: Location,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;
