//! SQLite-backed configuration store: broker settings and the robot roster
//!
//! A single `config.db` file. Thread-safe via an internal mutex (the
//! SQLite connection is not `Sync`). Opening or migrating the store is
//! fatal to startup; everything later surfaces as a typed [`StoreError`].

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Placeholder substituted with the device-EUI in topic templates
const TOPIC_PLACEHOLDER: &str = "{robot_id}";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open config store: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("failed to migrate config store schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("duplicate {field}: {value}")]
    Conflict { field: &'static str, value: String },

    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// One roster row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub robot_id: String,
    pub robot_name: String,
    pub serial_number: u16,
    pub enabled: bool,
    pub alarm_fa: u32,
    pub alarm_fb: u16,
    pub alarm_fc: u32,
    pub alarm_fd: u16,
}

impl RosterEntry {
    /// A fresh entry with no alarms, enabled
    #[must_use]
    pub fn new(robot_id: impl Into<String>, robot_name: impl Into<String>, serial: u16) -> Self {
        Self {
            robot_id: robot_id.into(),
            robot_name: robot_name.into(),
            serial_number: serial,
            enabled: true,
            alarm_fa: 0,
            alarm_fb: 0,
            alarm_fc: 0,
            alarm_fd: 0,
        }
    }
}

/// One page of the roster plus the stats the admin UI shows
#[derive(Debug, Clone, Serialize)]
pub struct RosterPage {
    pub data: Vec<RosterEntry>,
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Broker/runtime settings read at startup
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub broker_url: String,
    pub client_id_prefix: String,
    pub qos: u8,
    pub keepalive_secs: u64,
    pub publish_interval_secs: u64,
    pub http_port: u16,
}

pub struct ConfigStore {
    conn: Mutex<Connection>,
}

impl ConfigStore {
    /// Open (or create) the store at the given path
    #[allow(clippy::missing_errors_doc)]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(StoreError::Open)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.seed_defaults()?;
        Ok(store)
    }

    /// In-memory store for tests
    #[allow(clippy::missing_errors_doc)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Open)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.seed_defaults()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(StoreError::Schema)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS robots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                robot_id TEXT UNIQUE NOT NULL,
                robot_name TEXT NOT NULL DEFAULT '',
                serial_number INTEGER UNIQUE NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                alarm_fa INTEGER NOT NULL DEFAULT 0,
                alarm_fb INTEGER NOT NULL DEFAULT 0,
                alarm_fc INTEGER NOT NULL DEFAULT 0,
                alarm_fd INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(StoreError::Schema)?;

        Ok(())
    }

    /// Insert default settings and example robots into a fresh store
    fn seed_defaults(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let settings_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))?;
        if settings_count == 0 {
            let defaults: &[(&str, &str)] = &[
                ("broker", "tcp://test.mosquitto.org:1883"),
                ("client_id_prefix", "sim_robot_cpp"),
                ("qos", "1"),
                ("keepalive", "60"),
                ("publish_interval", "10"),
                ("http_port", "8080"),
                (
                    "publish_topic",
                    "application/902d7d6e-d3ac-44c0-a128-6d6743ba2b59/device/{robot_id}/event/up",
                ),
                (
                    "subscribe_topic",
                    "application/902d7d6e-d3ac-44c0-a128-6d6743ba2b59/device/{robot_id}/command/down",
                ),
            ];
            for (key, value) in defaults {
                conn.execute(
                    "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
            tracing::info!("seeded default settings");
        }

        let robots_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM robots", [], |row| row.get(0))?;
        if robots_count == 0 {
            let seeds = [
                ("303930306350729d", "Robot 1", 1i64, 1i64),
                ("303930306350729e", "Robot 2", 2, 0),
                ("303930306350729f", "Robot 3", 3, 0),
            ];
            for (id, name, serial, enabled) in seeds {
                conn.execute(
                    "INSERT OR IGNORE INTO robots (robot_id, robot_name, serial_number, enabled)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, name, serial, enabled],
                )?;
            }
            tracing::info!("seeded example robots");
        }

        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    /// Read a scalar setting, with a default when absent
    #[must_use]
    pub fn get_value(&self, key: &str, default: &str) -> String {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .unwrap_or_else(|_| default.to_string())
    }

    /// Read a scalar setting parsed as an integer
    #[must_use]
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_value(key, "")
            .parse()
            .unwrap_or(default)
    }

    /// Write a scalar setting
    #[allow(clippy::missing_errors_doc)]
    pub fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// All broker/runtime settings at once, for startup
    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            broker_url: self.get_value("broker", "tcp://test.mosquitto.org:1883"),
            client_id_prefix: self.get_value("client_id_prefix", "sim_robot_cpp"),
            qos: self.get_int("qos", 1).clamp(0, 2) as u8,
            keepalive_secs: self.get_int("keepalive", 60).max(1) as u64,
            publish_interval_secs: self.get_int("publish_interval", 10).max(1) as u64,
            http_port: self.get_int("http_port", 8080).clamp(1, 65535) as u16,
        }
    }

    // ── Topics ──────────────────────────────────────────────────────

    /// Publish topic for a robot, from the stored template
    #[must_use]
    pub fn publish_topic(&self, robot_id: &str) -> String {
        render_topic(&self.get_value("publish_topic", ""), robot_id)
    }

    /// Subscribe topic for a robot, from the stored template
    #[must_use]
    pub fn subscribe_topic(&self, robot_id: &str) -> String {
        render_topic(&self.get_value("subscribe_topic", ""), robot_id)
    }

    // ── Roster ──────────────────────────────────────────────────────

    /// Device-EUIs of all enabled robots
    #[allow(clippy::missing_errors_doc)]
    pub fn enabled_robot_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT robot_id FROM robots WHERE enabled = 1 ORDER BY serial_number")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// One roster page (1-based) plus fleet-wide statistics
    #[allow(clippy::missing_errors_doc)]
    pub fn list_robots(&self, page: usize, page_size: usize) -> Result<RosterPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let conn = self.conn.lock().unwrap();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM robots", [], |row| row.get(0))?;
        let enabled: i64 = conn.query_row(
            "SELECT COUNT(*) FROM robots WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT robot_id, robot_name, serial_number, enabled,
                    alarm_fa, alarm_fb, alarm_fc, alarm_fd
             FROM robots ORDER BY serial_number LIMIT ?1 OFFSET ?2",
        )?;
        let data = stmt
            .query_map(
                params![page_size as i64, ((page - 1) * page_size) as i64],
                Self::row_to_entry,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RosterPage {
            data,
            total: total as usize,
            enabled: enabled as usize,
            disabled: (total - enabled) as usize,
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<RosterEntry> {
        Ok(RosterEntry {
            robot_id: row.get(0)?,
            robot_name: row.get(1)?,
            serial_number: row.get::<_, i64>(2)? as u16,
            enabled: row.get::<_, i64>(3)? != 0,
            alarm_fa: row.get::<_, i64>(4)? as u32,
            alarm_fb: row.get::<_, i64>(5)? as u16,
            alarm_fc: row.get::<_, i64>(6)? as u32,
            alarm_fd: row.get::<_, i64>(7)? as u16,
        })
    }

    /// Look up one roster row by device-EUI
    #[allow(clippy::missing_errors_doc)]
    pub fn get_robot(&self, robot_id: &str) -> Result<Option<RosterEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT robot_id, robot_name, serial_number, enabled,
                    alarm_fa, alarm_fb, alarm_fc, alarm_fd
             FROM robots WHERE robot_id = ?1",
        )?;
        let mut rows = stmt.query_map([robot_id], Self::row_to_entry)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// Look up one roster row by device number
    #[allow(clippy::missing_errors_doc)]
    pub fn get_robot_by_serial(&self, serial: u16) -> Result<Option<RosterEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT robot_id, robot_name, serial_number, enabled,
                    alarm_fa, alarm_fb, alarm_fc, alarm_fd
             FROM robots WHERE serial_number = ?1",
        )?;
        let mut rows = stmt.query_map([i64::from(serial)], Self::row_to_entry)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// Insert one roster row; EUI and serial number must both be unique
    #[allow(clippy::missing_errors_doc)]
    pub fn add_robot(&self, entry: &RosterEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::insert_entry(&conn, entry)
    }

    fn insert_entry(conn: &Connection, entry: &RosterEntry) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO robots
                 (robot_id, robot_name, serial_number, enabled,
                  alarm_fa, alarm_fb, alarm_fc, alarm_fd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.robot_id,
                entry.robot_name,
                i64::from(entry.serial_number),
                i64::from(entry.enabled),
                i64::from(entry.alarm_fa),
                i64::from(entry.alarm_fb),
                i64::from(entry.alarm_fc),
                i64::from(entry.alarm_fd),
            ],
        )
        .map_err(|e| map_conflict(e, entry))?;
        Ok(())
    }

    /// Delete one roster row; returns whether a row existed
    #[allow(clippy::missing_errors_doc)]
    pub fn remove_robot(&self, robot_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM robots WHERE robot_id = ?1", [robot_id])?;
        Ok(changed > 0)
    }

    /// Flip the enabled flag; returns whether a row existed
    #[allow(clippy::missing_errors_doc)]
    pub fn set_enabled(&self, robot_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE robots SET enabled = ?1 WHERE robot_id = ?2",
            params![i64::from(enabled), robot_id],
        )?;
        Ok(changed > 0)
    }

    /// Insert many rows inside one transaction; any failure rolls the
    /// whole batch back
    #[allow(clippy::missing_errors_doc)]
    pub fn batch_add(&self, entries: &[RosterEntry]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for entry in entries {
            Self::insert_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete many rows inside one transaction; returns deleted count
    #[allow(clippy::missing_errors_doc)]
    pub fn batch_remove(&self, robot_ids: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for robot_id in robot_ids {
            removed += tx.execute("DELETE FROM robots WHERE robot_id = ?1", [robot_id])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

/// Substitute every `{robot_id}` occurrence in a topic template
#[must_use]
pub fn render_topic(template: &str, robot_id: &str) -> String {
    template.replace(TOPIC_PLACEHOLDER, robot_id)
}

/// Map SQLite uniqueness violations to a typed conflict
fn map_conflict(e: rusqlite::Error, entry: &RosterEntry) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            let message = message.as_deref().unwrap_or("");
            if message.contains("serial_number") {
                return StoreError::Conflict {
                    field: "serial_number",
                    value: entry.serial_number.to_string(),
                };
            }
            return StoreError::Conflict {
                field: "robot_id",
                value: entry.robot_id.clone(),
            };
        }
    }
    StoreError::Query(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_seeded() {
        let store = ConfigStore::open_in_memory().unwrap();
        assert_eq!(store.get_value("client_id_prefix", ""), "sim_robot_cpp");
        assert_eq!(store.get_int("qos", 0), 1);
        assert_eq!(store.get_int("publish_interval", 0), 10);

        let enabled = store.enabled_robot_ids().unwrap();
        assert_eq!(enabled, vec!["303930306350729d".to_string()]);
    }

    #[test]
    fn test_topic_substitution() {
        let store = ConfigStore::open_in_memory().unwrap();
        let topic = store.subscribe_topic("303930306350729d");
        assert_eq!(
            topic,
            "application/902d7d6e-d3ac-44c0-a128-6d6743ba2b59/device/303930306350729d/command/down"
        );
        assert_eq!(render_topic("a/{robot_id}/b/{robot_id}", "x"), "a/x/b/x");
    }

    #[test]
    fn test_set_value_overwrites() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.set_value("qos", "2").unwrap();
        assert_eq!(store.get_int("qos", 1), 2);
    }

    #[test]
    fn test_add_lookup_remove() {
        let store = ConfigStore::open_in_memory().unwrap();
        store
            .add_robot(&RosterEntry::new("aabb000000000001", "North row", 10))
            .unwrap();

        let by_id = store.get_robot("aabb000000000001").unwrap().unwrap();
        assert_eq!(by_id.robot_name, "North row");
        let by_serial = store.get_robot_by_serial(10).unwrap().unwrap();
        assert_eq!(by_serial.robot_id, "aabb000000000001");

        assert!(store.remove_robot("aabb000000000001").unwrap());
        assert!(!store.remove_robot("aabb000000000001").unwrap());
        assert!(store.get_robot("aabb000000000001").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_serial_conflicts() {
        let store = ConfigStore::open_in_memory().unwrap();
        store
            .add_robot(&RosterEntry::new("aabb000000000001", "", 10))
            .unwrap();
        let err = store
            .add_robot(&RosterEntry::new("aabb000000000002", "", 10))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                field: "serial_number",
                ..
            }
        ));
    }

    #[test]
    fn test_batch_add_rolls_back_on_conflict() {
        let store = ConfigStore::open_in_memory().unwrap();
        let before = store.list_robots(1, 100).unwrap().total;

        // Two rows sharing serial 20: the whole batch must roll back
        let result = store.batch_add(&[
            RosterEntry::new("aabb000000000001", "", 20),
            RosterEntry::new("aabb000000000002", "", 20),
        ]);
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert_eq!(store.list_robots(1, 100).unwrap().total, before);
        assert!(store.get_robot("aabb000000000001").unwrap().is_none());
    }

    #[test]
    fn test_batch_remove() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.add_robot(&RosterEntry::new("a1", "", 10)).unwrap();
        store.add_robot(&RosterEntry::new("a2", "", 11)).unwrap();
        let removed = store
            .batch_remove(&["a1".to_string(), "a2".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_set_enabled_drives_roster() {
        let store = ConfigStore::open_in_memory().unwrap();
        assert!(store.set_enabled("303930306350729e", true).unwrap());
        let enabled = store.enabled_robot_ids().unwrap();
        assert!(enabled.contains(&"303930306350729e".to_string()));

        assert!(store.set_enabled("303930306350729e", false).unwrap());
        assert!(!store
            .enabled_robot_ids()
            .unwrap()
            .contains(&"303930306350729e".to_string()));

        assert!(!store.set_enabled("nope", true).unwrap());
    }

    #[test]
    fn test_pagination_and_stats() {
        let store = ConfigStore::open_in_memory().unwrap();
        for i in 0..25u16 {
            store
                .add_robot(&RosterEntry::new(format!("eui{i:04}"), "", 100 + i))
                .unwrap();
        }
        let page = store.list_robots(2, 10).unwrap();
        assert_eq!(page.total, 28); // 25 + 3 seeded
        assert_eq!(page.data.len(), 10);
        assert_eq!(page.enabled + page.disabled, page.total);

        // Pages are ordered by serial number
        assert!(page.data[0].serial_number < page.data[9].serial_number);
    }

    #[test]
    fn test_alarm_masks_roundtrip() {
        let store = ConfigStore::open_in_memory().unwrap();
        let mut entry = RosterEntry::new("aabb000000000001", "", 10);
        entry.alarm_fa = 0x8000_0001;
        entry.alarm_fd = 0x0003;
        store.add_robot(&entry).unwrap();

        let back = store.get_robot("aabb000000000001").unwrap().unwrap();
        assert_eq!(back.alarm_fa, 0x8000_0001);
        assert_eq!(back.alarm_fd, 0x0003);
    }
}
