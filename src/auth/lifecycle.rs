//! Trusted-device lifecycle: issue, verify, rotate, revoke, list, sweep.
//!
//! Per-device states:
//!
//! ```text
//!  (none) --create--> ACTIVE
//!  ACTIVE --verify, current pepper--> ACTIVE (last_used_at bumped)
//!  ACTIVE --verify, previous pepper--> ACTIVE (token re-hashed, rotated_at set)
//!  ACTIVE --revoke--> REVOKED
//!  ACTIVE --expires_at passes--> EXPIRED (implicit, no write)
//!  REVOKED | EXPIRED --cleanup after retention--> deleted
//! ```
//!
//! Verification never fails loudly: any internal error is logged and
//! reported as "no match", which sends the caller back to full MFA.

use super::codec;
use super::error::TrustError;
use super::labeler::parse_user_agent;
use super::store::{DeviceStore, PurgeFilter, TrustedDevice};
use crate::config::{TrustedDeviceConfig, MAX_WINDOW_DAYS};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// `revoked_by` tag for user-initiated revocation.
pub const REVOKED_BY_USER: &str = "user";

/// `revoked_by` tag for eviction at the per-user cap.
pub const REVOKED_BY_MAX_LIMIT: &str = "system:max_limit";

/// Maximum device label length, in characters.
pub const MAX_LABEL_CHARS: usize = 100;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Result of issuing trust to a device. The secret is only ever available
/// here; hand it to the client and drop it.
#[derive(Clone)]
pub struct IssuedDevice {
    pub device_id: String,
    pub device_secret: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedDevice")
            .field("device_id", &self.device_id)
            .field("device_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A successful verification. `rotated_secret` is set when the stored hash
/// was replaced and the client copy must be rewritten.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifiedDevice {
    pub user_id: String,
    pub device_id: String,
    pub rotated_secret: Option<String>,
}

impl fmt::Debug for VerifiedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedDevice")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("rotated", &self.rotated_secret.is_some())
            .finish()
    }
}

/// Display form of an active device for settings pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    pub label: String,
    pub browser: String,
    pub os: String,
    pub ip_created: Option<String>,
    pub ip_last_used: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub expires_in: String,
}

impl DeviceView {
    fn from_device(device: TrustedDevice, now: DateTime<Utc>) -> Self {
        let label = device
            .device_label
            .clone()
            .unwrap_or_else(|| format!("{} on {}", device.ua_family, device.os_family));
        Self {
            expires_in: expires_in_text(device.expires_at, now),
            id: device.id,
            label,
            browser: device.ua_family,
            os: device.os_family,
            ip_created: device.ip_created,
            ip_last_used: device.ip_last_used,
            created_at: device.created_at,
            last_used_at: device.last_used_at,
            expires_at: device.expires_at,
        }
    }
}

/// Which pepper produced the matching hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PepperMatch {
    Current,
    Previous,
}

/// Trusted-device service. Cheap to clone; all clones share the store.
#[derive(Clone)]
pub struct TrustedDeviceService {
    store: Arc<dyn DeviceStore>,
    config: TrustedDeviceConfig,
}

impl TrustedDeviceService {
    pub fn new(store: Arc<dyn DeviceStore>, config: TrustedDeviceConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TrustedDeviceConfig {
        &self.config
    }

    fn current_pepper(&self) -> Result<&str, TrustError> {
        self.config.current_pepper().ok_or(TrustError::MissingPepper)
    }

    // ── Issue ───────────────────────────────────────────────────────

    /// Trust the caller's device for `duration_days` (default from config).
    /// Evicts the user's oldest device first when at the cap.
    pub fn create_trusted_device(
        &self,
        user_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        duration_days: Option<u32>,
    ) -> Result<IssuedDevice, TrustError> {
        let pepper = self.current_pepper()?;
        let days = duration_days
            .filter(|d| *d > 0)
            .unwrap_or(self.config.default_duration_days);
        let invalid = TrustError::InvalidDuration {
            days,
            max: MAX_WINDOW_DAYS,
        };
        if days > MAX_WINDOW_DAYS {
            return Err(invalid);
        }

        let device_secret = codec::generate_secret();
        let token_hash = codec::hash(pepper, &device_secret)?;
        let families = parse_user_agent(user_agent);

        self.enforce_device_limit(user_id)?;

        let now = Utc::now();
        let expires_at = Duration::try_days(i64::from(days))
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or(invalid)?;
        let device = TrustedDevice::new(user_id, token_hash, families, ip_address, now, expires_at);
        self.store.insert(&device)?;

        tracing::info!(
            device_id = %device.id,
            user_id = user_id,
            days,
            "Trusted device created"
        );

        Ok(IssuedDevice {
            device_id: device.id,
            device_secret,
            expires_at: device.expires_at,
        })
    }

    /// Revoke the user's oldest active device if they are at the cap.
    /// Returns the evicted device id.
    pub fn enforce_device_limit(&self, user_id: &str) -> Result<Option<String>, TrustError> {
        let now = Utc::now();
        let active = self.store.find_active_for_user(user_id, now)?;
        if active.len() < self.config.max_devices_per_user {
            return Ok(None);
        }

        let Some(oldest) = active.into_iter().next() else {
            return Ok(None);
        };
        if !self
            .store
            .revoke(&oldest.id, user_id, REVOKED_BY_MAX_LIMIT, now)?
        {
            // Revoked or expired since the read; the user is under the cap.
            return Ok(None);
        }

        tracing::info!(
            device_id = %oldest.id,
            user_id = user_id,
            limit = self.config.max_devices_per_user,
            "Evicted oldest trusted device (max limit)"
        );
        Ok(Some(oldest.id))
    }

    // ── Verify / rotate ─────────────────────────────────────────────

    /// Match a client-held secret against every active device.
    ///
    /// Returns `None` for a missing secret, no match, or any internal
    /// failure. A match under the previous pepper rotates the token and
    /// returns the new secret.
    pub fn verify_trusted_device(
        &self,
        candidate_secret: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<VerifiedDevice> {
        let candidate = candidate_secret.filter(|s| !s.is_empty())?;

        match self.try_verify(candidate, ip_address, user_agent) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Trusted device verification failed: {e}");
                None
            }
        }
    }

    fn try_verify(
        &self,
        candidate: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<VerifiedDevice>, TrustError> {
        let current_hash = codec::hash(self.current_pepper()?, candidate)?;
        let previous_hash = self
            .config
            .previous_pepper()
            .map(|pepper| codec::hash(pepper, candidate))
            .transpose()?;

        let now = Utc::now();
        let devices = self.store.find_all_active(now)?;
        let Some((device, matched)) =
            match_device(&devices, &current_hash, previous_hash.as_deref())
        else {
            tracing::debug!(scanned = devices.len(), "No trusted device matched");
            return Ok(None);
        };
        // Logged only, never enforced.
        let families = parse_user_agent(user_agent);
        if families.drifted_from(&device.ua_family, &device.os_family) {
            tracing::warn!(
                device_id = %device.id,
                stored_ua = %device.ua_family,
                stored_os = %device.os_family,
                seen_ua = %families.ua_family,
                seen_os = %families.os_family,
                "UA/OS drift detected for trusted device"
            );
        }

        let user_id = device.user_id.clone();
        let device_id = device.id.clone();

        // The scan may be stale; the write decides whether the device is
        // still active.
        let rotated_secret = match matched {
            PepperMatch::Previous => {
                tracing::warn!(device_id = %device_id, "Trusted device matched previous pepper, rotating");
                match self.rotate(&device_id, ip_address, now) {
                    Ok(secret) => Some(secret),
                    Err(TrustError::DeviceNotFound(_)) => {
                        tracing::info!(device_id = %device_id, "Trusted device deactivated during verification");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            PepperMatch::Current => {
                if !self.store.touch(&device_id, ip_address, now)? {
                    tracing::info!(device_id = %device_id, "Trusted device deactivated during verification");
                    return Ok(None);
                }
                None
            }
        };

        tracing::info!(device_id = %device_id, user_id = %user_id, "Trusted device verified");
        Ok(Some(VerifiedDevice {
            user_id,
            device_id,
            rotated_secret,
        }))
    }

    /// Replace an active device's token with a fresh secret under the
    /// current pepper. Returns the new secret.
    pub fn rotate_device_token(
        &self,
        device_id: &str,
        ip_address: Option<&str>,
    ) -> Result<String, TrustError> {
        self.rotate(device_id, ip_address, Utc::now())
    }

    fn rotate(
        &self,
        device_id: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, TrustError> {
        let new_secret = codec::generate_secret();
        let token_hash = codec::hash(self.current_pepper()?, &new_secret)?;

        if !self
            .store
            .rotate_hash(device_id, &token_hash, ip_address, now)?
        {
            return Err(TrustError::DeviceNotFound(device_id.to_string()));
        }

        tracing::info!(device_id = device_id, "Rotated trusted device token");
        Ok(new_secret)
    }

    // ── Revoke / relabel ────────────────────────────────────────────

    /// Revoke one active device owned by `user_id`. `false` when the device
    /// is unknown, foreign, or already inactive.
    pub fn revoke_device(
        &self,
        user_id: &str,
        device_id: &str,
        revoked_by: &str,
    ) -> Result<bool, TrustError> {
        let changed = self
            .store
            .revoke(device_id, user_id, revoked_by, Utc::now())?;

        if changed {
            tracing::info!(device_id = device_id, revoked_by = revoked_by, "Revoked trusted device");
        }
        Ok(changed)
    }

    /// Revoke every active device owned by `user_id`. Returns how many.
    pub fn revoke_all_devices(&self, user_id: &str, revoked_by: &str) -> Result<u64, TrustError> {
        let count = self
            .store
            .revoke_all_for_user(user_id, revoked_by, Utc::now())?;

        tracing::info!(user_id = user_id, count, revoked_by = revoked_by, "Revoked trusted devices");
        Ok(count)
    }

    /// Set the nickname of an active device owned by `user_id`.
    pub fn update_device_label(
        &self,
        user_id: &str,
        device_id: &str,
        label: &str,
    ) -> Result<bool, TrustError> {
        let label = label.trim();
        let len = label.chars().count();
        if len == 0 || len > MAX_LABEL_CHARS {
            return Err(TrustError::InvalidLabel {
                max: MAX_LABEL_CHARS,
            });
        }

        Ok(self
            .store
            .set_label(device_id, user_id, label, Utc::now())?)
    }

    // ── List ────────────────────────────────────────────────────────

    /// Active devices for display: most recently used first (never-used
    /// last), then newest. Store failures yield an empty list.
    pub fn list_user_devices(&self, user_id: &str) -> Vec<DeviceView> {
        let now = Utc::now();
        let mut devices = match self.store.find_active_for_user(user_id, now) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(user_id = user_id, "Failed to list trusted devices: {e:#}");
                return Vec::new();
            }
        };

        devices.sort_by(|a, b| {
            match (a.last_used_at, b.last_used_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| b.created_at.cmp(&a.created_at))
        });

        devices
            .into_iter()
            .map(|d| DeviceView::from_device(d, now))
            .collect()
    }

    // ── Retention ───────────────────────────────────────────────────

    /// Delete devices past the expired / revoked retention windows.
    pub fn try_cleanup_expired_devices(&self) -> Result<u64, TrustError> {
        let now = Utc::now();
        let filter = PurgeFilter {
            expired_before: retention_cutoff(now, self.config.expired_retention_days),
            revoked_before: retention_cutoff(now, self.config.revoked_retention_days),
        };
        let deleted = self.store.delete_where(&filter)?;
        tracing::info!(deleted, "Cleaned up expired trusted devices");
        Ok(deleted)
    }

    /// Like [`Self::try_cleanup_expired_devices`], but store failures are
    /// logged and reported as zero deletions.
    pub fn cleanup_expired_devices(&self) -> u64 {
        self.try_cleanup_expired_devices().unwrap_or_else(|e| {
            tracing::error!("Trusted device cleanup failed: {e}");
            0
        })
    }
}

/// `now - days`. A window too large to represent keeps everything.
fn retention_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn match_device<'a>(
    devices: &'a [TrustedDevice],
    current_hash: &str,
    previous_hash: Option<&str>,
) -> Option<(&'a TrustedDevice, PepperMatch)> {
    devices.iter().find_map(|device| {
        if codec::constant_time_eq(current_hash, &device.token_hash) {
            return Some((device, PepperMatch::Current));
        }
        match previous_hash {
            Some(prev) if codec::constant_time_eq(prev, &device.token_hash) => {
                Some((device, PepperMatch::Previous))
            }
            _ => None,
        }
    })
}

/// Remaining lifetime in whole days, rounded up.
pub fn expires_in_text(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = (expires_at - now).num_milliseconds();
    let days = if remaining <= 0 {
        0
    } else {
        (remaining + DAY_MILLIS - 1) / DAY_MILLIS
    };
    match days {
        d if d < 1 => "Less than 1 day".to_string(),
        1 => "1 day".to_string(),
        d => format!("{d} days"),
    }
}
