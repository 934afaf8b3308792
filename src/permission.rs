//! The permission-grant capability for radio access.
//!
//! Platform permission flows live outside this crate; the session only needs
//! the granted/denied/never-ask-again outcome so callers can pick the right
//! recovery action (retry the request vs. send the user to system settings).

use async_trait::async_trait;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    NeverAskAgain,
}

#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn request_permission(&self) -> PermissionStatus;

    /// Deep-links into the platform's settings surface for the case where
    /// the user must grant access manually.
    fn open_system_settings(&self);
}

/// Maps a permission outcome onto the error taxonomy.
pub fn ensure_granted(status: PermissionStatus) -> Result<()> {
    match status {
        PermissionStatus::Granted => Ok(()),
        PermissionStatus::Denied => Err(Error::PermissionDenied),
        PermissionStatus::NeverAskAgain => Err(Error::PermissionPermanentlyDenied),
    }
}

/// An authorizer for platforms where radio access needs no runtime grant.
pub struct AlwaysGranted;

#[async_trait]
impl Authorizer for AlwaysGranted {
    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    fn open_system_settings(&self) {}
}
