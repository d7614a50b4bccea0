//! In-process device store.
//!
//! Keeps records in insertion order, which doubles as the tie-break when
//! two devices share a `created_at`. Nothing survives a restart; meant for
//! tests and single-process embedding.

use super::store::{DeviceStore, PurgeFilter, TrustedDevice};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<Vec<TrustedDevice>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records held, active or not.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Copy of every record, including revoked and expired ones.
    pub fn snapshot(&self) -> Vec<TrustedDevice> {
        self.devices.read().clone()
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn insert(&self, device: &TrustedDevice) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.iter().any(|d| d.id == device.id) {
            bail!("Trusted device {} already exists", device.id);
        }
        if devices.iter().any(|d| d.token_hash == device.token_hash) {
            bail!("Token hash collision for trusted device {}", device.id);
        }
        devices.push(device.clone());
        Ok(())
    }

    fn find_active_by_id(&self, id: &str, now: DateTime<Utc>) -> Result<Option<TrustedDevice>> {
        Ok(self
            .devices
            .read()
            .iter()
            .find(|d| d.id == id && d.is_active(now))
            .cloned())
    }

    fn find_all_active(&self, now: DateTime<Utc>) -> Result<Vec<TrustedDevice>> {
        let mut active: Vec<TrustedDevice> = self
            .devices
            .read()
            .iter()
            .filter(|d| d.is_active(now))
            .cloned()
            .collect();
        active.sort_by_key(|d| d.created_at);
        Ok(active)
    }

    fn find_active_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrustedDevice>> {
        let mut active: Vec<TrustedDevice> = self
            .devices
            .read()
            .iter()
            .filter(|d| d.user_id == user_id && d.is_active(now))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps
        active.sort_by_key(|d| d.created_at);
        Ok(active)
    }

    fn touch(&self, id: &str, ip: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let mut devices = self.devices.write();
        Ok(match active_mut(&mut devices, id, now) {
            Some(device) => {
                device.last_used_at = Some(now);
                if let Some(ip) = ip {
                    device.ip_last_used = Some(ip.to_string());
                }
                true
            }
            None => false,
        })
    }

    fn rotate_hash(
        &self,
        id: &str,
        token_hash: &str,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut devices = self.devices.write();
        if devices.iter().any(|d| d.id != id && d.token_hash == token_hash) {
            bail!("Token hash collision for trusted device {id}");
        }
        Ok(match active_mut(&mut devices, id, now) {
            Some(device) => {
                device.token_hash = token_hash.to_string();
                device.rotated_at = Some(now);
                device.last_used_at = Some(now);
                if let Some(ip) = ip {
                    device.ip_last_used = Some(ip.to_string());
                }
                true
            }
            None => false,
        })
    }

    fn revoke(
        &self,
        id: &str,
        user_id: &str,
        revoked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut devices = self.devices.write();
        Ok(match active_mut(&mut devices, id, now) {
            Some(device) if device.user_id == user_id => {
                device.revoked_at = Some(now);
                device.revoked_by = Some(revoked_by.to_string());
                true
            }
            _ => false,
        })
    }

    fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut count = 0;
        for device in self
            .devices
            .write()
            .iter_mut()
            .filter(|d| d.user_id == user_id && d.is_active(now))
        {
            device.revoked_at = Some(now);
            device.revoked_by = Some(revoked_by.to_string());
            count += 1;
        }
        Ok(count)
    }

    fn set_label(
        &self,
        id: &str,
        user_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut devices = self.devices.write();
        Ok(match active_mut(&mut devices, id, now) {
            Some(device) if device.user_id == user_id => {
                device.device_label = Some(label.to_string());
                true
            }
            _ => false,
        })
    }

    fn delete_where(&self, filter: &PurgeFilter) -> Result<u64> {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| !filter.matches(d));
        Ok((before - devices.len()) as u64)
    }
}

/// Writes only ever land on a device that is active under the write lock.
fn active_mut<'a>(
    devices: &'a mut [TrustedDevice],
    id: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut TrustedDevice> {
    devices.iter_mut().find(|d| d.id == id && d.is_active(now))
}
