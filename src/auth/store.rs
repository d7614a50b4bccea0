//! Trusted device records and the storage seam behind them.
//!
//! Table:
//! - `trusted_devices`: id, user_id, token_hash (unique), ua/os family,
//!   provenance IPs, optional label, and the lifecycle timestamps
//!   (created, last used, expires, rotated, revoked).
//!
//! Timestamps are stored as Unix epoch milliseconds.

use super::labeler::UserAgentFamilies;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// A persisted trusted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedDevice {
    pub id: String,
    pub user_id: String,
    /// HMAC of the device secret. Never the secret itself.
    pub token_hash: String,
    pub ua_family: String,
    pub os_family: String,
    pub ip_created: Option<String>,
    pub ip_last_used: Option<String>,
    pub device_label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
}

impl TrustedDevice {
    /// Build a fresh, active record with a random id.
    pub fn new(
        user_id: &str,
        token_hash: String,
        families: UserAgentFamilies,
        ip_address: Option<&str>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_hash,
            ua_family: families.ua_family,
            os_family: families.os_family,
            ip_created: ip_address.map(str::to_string),
            ip_last_used: ip_address.map(str::to_string),
            device_label: None,
            created_at,
            last_used_at: None,
            expires_at,
            rotated_at: None,
            revoked_at: None,
            revoked_by: None,
        }
    }

    /// Not revoked and not past expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Age thresholds for the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeFilter {
    /// Delete devices that expired before this instant.
    pub expired_before: DateTime<Utc>,
    /// Delete devices that were revoked before this instant.
    pub revoked_before: DateTime<Utc>,
}

impl PurgeFilter {
    pub fn matches(&self, device: &TrustedDevice) -> bool {
        device.expires_at < self.expired_before
            || device
                .revoked_at
                .is_some_and(|revoked_at| revoked_at < self.revoked_before)
    }
}

/// Storage for trusted devices.
///
/// "Active" queries take `now` from the caller so every operation in a
/// single lifecycle call agrees on the same instant.
pub trait DeviceStore: Send + Sync {
    /// Insert a new record. Fails on a duplicate id or token hash.
    fn insert(&self, device: &TrustedDevice) -> Result<()>;

    /// Look up a single active device.
    fn find_active_by_id(&self, id: &str, now: DateTime<Utc>) -> Result<Option<TrustedDevice>>;

    /// Every active device across all users.
    fn find_all_active(&self, now: DateTime<Utc>) -> Result<Vec<TrustedDevice>>;

    /// Active devices owned by `user_id`, oldest first.
    fn find_active_for_user(&self, user_id: &str, now: DateTime<Utc>)
        -> Result<Vec<TrustedDevice>>;

    /// Record a use of an active device. `ip` replaces `ip_last_used` when
    /// given. Returns `false` if the device is gone or no longer active.
    fn touch(&self, id: &str, ip: Option<&str>, now: DateTime<Utc>) -> Result<bool>;

    /// Swap the token hash of an active device and mark it rotated and used.
    fn rotate_hash(
        &self,
        id: &str,
        token_hash: &str,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Revoke one active device owned by `user_id`.
    fn revoke(&self, id: &str, user_id: &str, revoked_by: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Revoke every active device owned by `user_id`. Returns how many.
    fn revoke_all_for_user(&self, user_id: &str, revoked_by: &str, now: DateTime<Utc>)
        -> Result<u64>;

    /// Set the label of an active device owned by `user_id`.
    fn set_label(&self, id: &str, user_id: &str, label: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Permanently delete every record the filter matches.
    fn delete_where(&self, filter: &PurgeFilter) -> Result<u64>;
}

// ── SQLite store ────────────────────────────────────────────────

const COLUMNS: &str = "id, user_id, token_hash, ua_family, os_family, ip_created, ip_last_used,
     device_label, created_at, last_used_at, expires_at, rotated_at, revoked_at, revoked_by";

/// SQLite-backed device store.
pub struct SqliteDeviceStore {
    conn: Mutex<Connection>,
}

impl SqliteDeviceStore {
    /// Open (or create) the device database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create device store dir: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open device store: {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trusted_devices (
                id           TEXT PRIMARY KEY,
                user_id      TEXT NOT NULL,
                token_hash   TEXT NOT NULL UNIQUE,
                ua_family    TEXT NOT NULL,
                os_family    TEXT NOT NULL,
                ip_created   TEXT,
                ip_last_used TEXT,
                device_label TEXT,
                created_at   INTEGER NOT NULL,
                last_used_at INTEGER,
                expires_at   INTEGER NOT NULL,
                rotated_at   INTEGER,
                revoked_at   INTEGER,
                revoked_by   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trusted_devices_user ON trusted_devices(user_id);
            CREATE INDEX IF NOT EXISTS idx_trusted_devices_user_expires
                ON trusted_devices(user_id, expires_at);
            CREATE INDEX IF NOT EXISTS idx_trusted_devices_expires ON trusted_devices(expires_at);",
        )?;
        Ok(())
    }
}

impl DeviceStore for SqliteDeviceStore {
    fn insert(&self, device: &TrustedDevice) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO trusted_devices ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                device.id,
                device.user_id,
                device.token_hash,
                device.ua_family,
                device.os_family,
                device.ip_created,
                device.ip_last_used,
                device.device_label,
                device.created_at.timestamp_millis(),
                device.last_used_at.map(|t| t.timestamp_millis()),
                device.expires_at.timestamp_millis(),
                device.rotated_at.map(|t| t.timestamp_millis()),
                device.revoked_at.map(|t| t.timestamp_millis()),
                device.revoked_by,
            ],
        )
        .with_context(|| format!("Failed to insert trusted device {}", device.id))?;
        Ok(())
    }

    fn find_active_by_id(&self, id: &str, now: DateTime<Utc>) -> Result<Option<TrustedDevice>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM trusted_devices
                     WHERE id = ?1 AND revoked_at IS NULL AND expires_at > ?2"
                ),
                params![id, now.timestamp_millis()],
                row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    fn find_all_active(&self, now: DateTime<Utc>) -> Result<Vec<TrustedDevice>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM trusted_devices
             WHERE revoked_at IS NULL AND expires_at > ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let devices = stmt
            .query_map(params![now.timestamp_millis()], row_to_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    fn find_active_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrustedDevice>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM trusted_devices
             WHERE user_id = ?1 AND revoked_at IS NULL AND expires_at > ?2
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let devices = stmt
            .query_map(params![user_id, now.timestamp_millis()], row_to_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    // Every write below re-checks "active" in SQL, so a row revoked or
    // expired after it was read is never brought back.

    fn touch(&self, id: &str, ip: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE trusted_devices
                 SET last_used_at = ?1, ip_last_used = COALESCE(?2, ip_last_used)
                 WHERE id = ?3 AND revoked_at IS NULL AND expires_at > ?1",
                params![now.timestamp_millis(), ip, id],
            )
            .with_context(|| format!("Failed to record use of trusted device {id}"))?;
        Ok(changed > 0)
    }

    fn rotate_hash(
        &self,
        id: &str,
        token_hash: &str,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE trusted_devices
                 SET token_hash = ?1, rotated_at = ?2, last_used_at = ?2,
                     ip_last_used = COALESCE(?3, ip_last_used)
                 WHERE id = ?4 AND revoked_at IS NULL AND expires_at > ?2",
                params![token_hash, now.timestamp_millis(), ip, id],
            )
            .with_context(|| format!("Failed to rotate trusted device {id}"))?;
        Ok(changed > 0)
    }

    fn revoke(
        &self,
        id: &str,
        user_id: &str,
        revoked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE trusted_devices SET revoked_at = ?1, revoked_by = ?2
                 WHERE id = ?3 AND user_id = ?4 AND revoked_at IS NULL AND expires_at > ?1",
                params![now.timestamp_millis(), revoked_by, id, user_id],
            )
            .with_context(|| format!("Failed to revoke trusted device {id}"))?;
        Ok(changed > 0)
    }

    fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE trusted_devices SET revoked_at = ?1, revoked_by = ?2
                 WHERE user_id = ?3 AND revoked_at IS NULL AND expires_at > ?1",
                params![now.timestamp_millis(), revoked_by, user_id],
            )
            .with_context(|| format!("Failed to revoke trusted devices for {user_id}"))?;
        Ok(changed as u64)
    }

    fn set_label(
        &self,
        id: &str,
        user_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE trusted_devices SET device_label = ?1
                 WHERE id = ?2 AND user_id = ?3 AND revoked_at IS NULL AND expires_at > ?4",
                params![label, id, user_id, now.timestamp_millis()],
            )
            .with_context(|| format!("Failed to relabel trusted device {id}"))?;
        Ok(changed > 0)
    }

    fn delete_where(&self, filter: &PurgeFilter) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM trusted_devices
             WHERE expires_at < ?1
                OR (revoked_at IS NOT NULL AND revoked_at < ?2)",
            params![
                filter.expired_before.timestamp_millis(),
                filter.revoked_before.timestamp_millis(),
            ],
        )?;
        Ok(deleted as u64)
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrustedDevice> {
    Ok(TrustedDevice {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        ua_family: row.get(3)?,
        os_family: row.get(4)?,
        ip_created: row.get(5)?,
        ip_last_used: row.get(6)?,
        device_label: row.get(7)?,
        created_at: timestamp(row, 8)?,
        last_used_at: optional_timestamp(row, 9)?,
        expires_at: timestamp(row, 10)?,
        rotated_at: optional_timestamp(row, 11)?,
        revoked_at: optional_timestamp(row, 12)?,
        revoked_by: row.get(13)?,
    })
}

fn timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn optional_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|ms| {
            DateTime::from_timestamp_millis(ms)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
        })
        .transpose()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::labeler::parse_user_agent;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteDeviceStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("devices").join("trusted.db");
        let store = SqliteDeviceStore::open(&db_path).unwrap();
        (tmp, store)
    }

    fn make_device(user_id: &str, hash: &str, expires_in: Duration) -> TrustedDevice {
        let now = Utc::now();
        TrustedDevice::new(
            user_id,
            hash.to_string(),
            parse_user_agent(Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/127.0")),
            Some("10.0.0.1"),
            now,
            now + expires_in,
        )
    }

    #[test]
    fn insert_and_find_by_id() {
        let (_tmp, store) = test_store();
        let device = make_device("user_1", "hash_a", Duration::days(7));
        store.insert(&device).unwrap();

        let found = store
            .find_active_by_id(&device.id, Utc::now())
            .unwrap()
            .unwrap();
        // Millisecond storage precision
        assert_eq!(found.id, device.id);
        assert_eq!(found.user_id, "user_1");
        assert_eq!(found.ua_family, "Firefox");
        assert_eq!(found.os_family, "Linux");
        assert_eq!(found.ip_created.as_deref(), Some("10.0.0.1"));
        assert_eq!(
            found.expires_at.timestamp_millis(),
            device.expires_at.timestamp_millis()
        );
        assert!(found.last_used_at.is_none());
    }

    #[test]
    fn duplicate_token_hash_is_rejected() {
        let (_tmp, store) = test_store();
        store
            .insert(&make_device("user_1", "same_hash", Duration::days(7)))
            .unwrap();
        let result = store.insert(&make_device("user_2", "same_hash", Duration::days(7)));
        assert!(result.is_err());
    }

    #[test]
    fn inactive_devices_are_filtered() {
        let (_tmp, store) = test_store();
        let expired = make_device("user_1", "hash_expired", Duration::days(-1));
        let mut revoked = make_device("user_1", "hash_revoked", Duration::days(7));
        revoked.revoked_at = Some(Utc::now());
        revoked.revoked_by = Some("user".into());
        let active = make_device("user_1", "hash_active", Duration::days(7));

        for d in [&expired, &revoked, &active] {
            store.insert(d).unwrap();
        }

        let now = Utc::now();
        assert!(store.find_active_by_id(&expired.id, now).unwrap().is_none());
        assert!(store.find_active_by_id(&revoked.id, now).unwrap().is_none());

        let all = store.find_all_active(now).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, active.id);

        let mine = store.find_active_for_user("user_1", now).unwrap();
        assert_eq!(mine.len(), 1);
        assert!(store.find_active_for_user("user_2", now).unwrap().is_empty());
    }

    #[test]
    fn user_devices_come_back_oldest_first() {
        let (_tmp, store) = test_store();
        let ids: Vec<String> = (0..4)
            .map(|i| {
                let d = make_device("user_1", &format!("hash_{i}"), Duration::days(7));
                store.insert(&d).unwrap();
                d.id
            })
            .collect();

        let found: Vec<String> = store
            .find_active_for_user("user_1", Utc::now())
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(found, ids);
    }

    #[test]
    fn touch_and_rotate_write_only_their_columns() {
        let (_tmp, store) = test_store();
        let device = make_device("user_1", "hash_a", Duration::days(7));
        store.insert(&device).unwrap();

        let now = Utc::now();
        assert!(store.touch(&device.id, None, now).unwrap());
        let found = store.find_active_by_id(&device.id, now).unwrap().unwrap();
        assert!(found.last_used_at.is_some());
        assert_eq!(found.ip_last_used.as_deref(), Some("10.0.0.1"));

        assert!(store
            .rotate_hash(&device.id, "hash_b", Some("10.0.0.2"), now)
            .unwrap());
        let found = store.find_active_by_id(&device.id, now).unwrap().unwrap();
        assert_eq!(found.token_hash, "hash_b");
        assert_eq!(found.ip_last_used.as_deref(), Some("10.0.0.2"));
        assert_eq!(found.ip_created.as_deref(), Some("10.0.0.1"));
        assert!(found.rotated_at.is_some());

        assert!(store
            .set_label(&device.id, "user_1", "Work laptop", now)
            .unwrap());
        assert!(!store.set_label(&device.id, "user_2", "Mine", now).unwrap());
        let found = store.find_active_by_id(&device.id, now).unwrap().unwrap();
        assert_eq!(found.device_label.as_deref(), Some("Work laptop"));
    }

    #[test]
    fn writes_skip_inactive_devices() {
        let (_tmp, store) = test_store();
        let device = make_device("user_1", "hash_a", Duration::days(7));
        let expired = make_device("user_1", "hash_old", Duration::days(-1));
        store.insert(&device).unwrap();
        store.insert(&expired).unwrap();

        let now = Utc::now();
        assert!(!store.revoke(&device.id, "user_2", "user", now).unwrap());
        assert!(store.revoke(&device.id, "user_1", "user", now).unwrap());
        assert!(!store.revoke(&device.id, "user_1", "user", now).unwrap());

        // A revoked row stays revoked whatever is written afterwards.
        assert!(!store.touch(&device.id, Some("10.0.0.9"), now).unwrap());
        assert!(!store.rotate_hash(&device.id, "hash_b", None, now).unwrap());
        assert!(!store.set_label(&device.id, "user_1", "x", now).unwrap());
        assert!(store.find_active_by_id(&device.id, now).unwrap().is_none());

        assert!(!store.touch(&expired.id, None, now).unwrap());
        assert!(!store.touch("missing", None, now).unwrap());
    }

    #[test]
    fn revoke_all_counts_active_rows() {
        let (_tmp, store) = test_store();
        for i in 0..3 {
            store
                .insert(&make_device("user_1", &format!("hash_{i}"), Duration::days(7)))
                .unwrap();
        }
        store
            .insert(&make_device("user_1", "hash_old", Duration::days(-1)))
            .unwrap();
        store
            .insert(&make_device("user_2", "hash_other", Duration::days(7)))
            .unwrap();

        let now = Utc::now();
        assert_eq!(store.revoke_all_for_user("user_1", "admin", now).unwrap(), 3);
        assert_eq!(store.revoke_all_for_user("user_1", "admin", now).unwrap(), 0);
        assert_eq!(store.find_all_active(now).unwrap().len(), 1);
    }

    #[test]
    fn delete_where_applies_both_windows() {
        let store = SqliteDeviceStore::in_memory().unwrap();
        let now = Utc::now();

        let long_expired = make_device("user_1", "h1", Duration::days(-8));
        let recently_expired = make_device("user_1", "h2", Duration::days(-2));
        let mut long_revoked = make_device("user_1", "h3", Duration::days(7));
        long_revoked.revoked_at = Some(now - Duration::days(31));
        let mut recently_revoked = make_device("user_1", "h4", Duration::days(7));
        recently_revoked.revoked_at = Some(now - Duration::days(3));
        let active = make_device("user_1", "h5", Duration::days(7));

        for d in [
            &long_expired,
            &recently_expired,
            &long_revoked,
            &recently_revoked,
            &active,
        ] {
            store.insert(d).unwrap();
        }

        let filter = PurgeFilter {
            expired_before: now - Duration::days(7),
            revoked_before: now - Duration::days(30),
        };
        assert!(filter.matches(&long_expired));
        assert!(filter.matches(&long_revoked));
        assert!(!filter.matches(&recently_expired));

        assert_eq!(store.delete_where(&filter).unwrap(), 2);
        assert_eq!(store.delete_where(&filter).unwrap(), 0);
    }

    #[test]
    fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("trusted.db");
        let device = make_device("user_1", "hash_a", Duration::days(7));
        {
            let store = SqliteDeviceStore::open(&db_path).unwrap();
            store.insert(&device).unwrap();
        }
        let store = SqliteDeviceStore::open(&db_path).unwrap();
        assert!(store
            .find_active_by_id(&device.id, Utc::now())
            .unwrap()
            .is_some());
    }
}
