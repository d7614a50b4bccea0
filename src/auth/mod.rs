//! Trusted-device tokens: remember a browser after MFA so the next login
//! from it can skip the second factor.
//!
//! Provides:
//! - Secret generation and peppered HMAC-SHA256 hashing (`codec`)
//! - Device lifecycle: issue, verify, rotate, revoke, list, cleanup (`lifecycle`)
//! - Coarse browser / OS labelling of user agents (`labeler`)
//! - SQLite and in-memory device stores (`store`, `memory`)
//! - The `td_v1` cookie format (`cookie`)
//!
//! ## Design Decisions
//! - Only the HMAC digest is stored; the plaintext secret leaves the service
//!   once, at issue or rotation time.
//! - Two peppers may be configured. A match under the previous one rotates
//!   the token, so pepper rollover needs no forced re-enrolment.
//! - Verification failures of any kind read as "not trusted", never as an
//!   error to the login flow.

pub mod codec;
pub mod cookie;
pub mod error;
pub mod labeler;
pub mod lifecycle;
pub mod memory;
pub mod store;

pub use cookie::TrustCookie;
pub use error::TrustError;
pub use labeler::{parse_user_agent, UserAgentFamilies};
pub use lifecycle::{
    DeviceView, IssuedDevice, TrustedDeviceService, VerifiedDevice, REVOKED_BY_MAX_LIMIT,
    REVOKED_BY_USER,
};
pub use memory::MemoryDeviceStore;
pub use store::{DeviceStore, PurgeFilter, SqliteDeviceStore, TrustedDevice};
