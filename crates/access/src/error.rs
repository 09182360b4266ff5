//! Crate-level error type.

use thiserror::Error;

use crate::path::PathError;
use crate::policy::PolicyError;
use crate::root::RootError;
use crate::store::StoreError;
use crate::vault::VaultError;

/// Any error raised by the access core.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Root(#[from] RootError),
}

/// Result alias using [`AccessError`].
pub type Result<T> = std::result::Result<T, AccessError>;
