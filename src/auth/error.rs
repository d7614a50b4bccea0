/// Errors surfaced by the trusted-device service.
///
/// Revoking or relabelling a device that is unknown, foreign or already
/// inactive is not an error; those calls return `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// No current pepper configured. Trust must not be issued without one.
    #[error("trusted device pepper is not configured (set TD_PEPPER)")]
    MissingPepper,

    /// The device does not exist or is no longer active.
    #[error("trusted device {0} not found or inactive")]
    DeviceNotFound(String),

    /// A user-supplied label failed validation.
    #[error("device label must be 1-{max} characters")]
    InvalidLabel { max: usize },

    /// A trust duration outside what the service will issue.
    #[error("trust duration of {days} days exceeds the maximum of {max}")]
    InvalidDuration { days: u32, max: u32 },

    /// The device store failed.
    #[error("device store error: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for TrustError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}
