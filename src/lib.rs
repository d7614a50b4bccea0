//! trustgate: trusted-device tokens that let a remembered browser skip MFA.

pub mod auth;
pub mod config;
pub mod jobs;

pub use auth::{TrustError, TrustedDeviceService};
pub use config::Config;
