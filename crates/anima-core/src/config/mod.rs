//! Configuration Store
//!
//! A flat key -> JSON mapping persisted in the `config` table. Keys are
//! namespaced (`heartbeat.*`, `maintenance.*`, `agent.*`, `llm.*`,
//! `emotion.*`, `embedding.*`, `transformation.*`, `user.contact`,
//! `memory.*`). Values are read from the store on demand; nothing is cached
//! in memory beyond the duration of a single heartbeat or maintenance pass.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;

use crate::storage::{Result, Storage};

// ============================================================================
// ROW-LEVEL HELPERS (usable inside transactions)
// ============================================================================

/// Read one config value
pub(crate) fn get_config_tx(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

/// Write one config value (upsert)
pub(crate) fn set_config_tx(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, serde_json::to_string(value)?, Utc::now()],
    )?;
    Ok(())
}

pub(crate) fn get_f64(conn: &Connection, key: &str) -> Result<Option<f64>> {
    Ok(get_config_tx(conn, key)?.and_then(|v| v.as_f64()))
}

pub(crate) fn get_u64(conn: &Connection, key: &str) -> Result<Option<u64>> {
    Ok(get_config_tx(conn, key)?.and_then(|v| v.as_u64()))
}

pub(crate) fn get_bool(conn: &Connection, key: &str) -> Result<Option<bool>> {
    Ok(get_config_tx(conn, key)?.and_then(|v| v.as_bool()))
}

pub(crate) fn get_string(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(get_config_tx(conn, key)?.and_then(|v| v.as_str().map(str::to_string)))
}

// ============================================================================
// AGENT GATES
// ============================================================================

/// True once initialization has mirrored `agent.is_configured = true`
pub(crate) fn is_agent_configured_tx(conn: &Connection) -> Result<bool> {
    Ok(get_bool(conn, "agent.is_configured")?.unwrap_or(false))
}

/// Recorded consent decision, if any
pub(crate) fn consent_status_tx(conn: &Connection) -> Result<Option<String>> {
    get_string(conn, "agent.consent_status")
}

/// True once a confirmed termination has been executed
pub(crate) fn is_agent_terminated_tx(conn: &Connection) -> Result<bool> {
    Ok(get_bool(conn, "agent.terminated")?.unwrap_or(false))
}

// ============================================================================
// TYPED BUNDLES
// ============================================================================

/// Heartbeat scheduling and budget knobs, read once per cycle
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// Minimum minutes between heartbeat ends
    pub interval_minutes: i64,
    /// Energy ceiling
    pub max_energy: f64,
    /// Energy regained at each heartbeat start
    pub base_regeneration: f64,
    /// More active goals than this is surfaced as an issue
    pub max_active_goals: usize,
    /// Whitelist of actions the decision may use; `None` = all known actions
    pub allowed_actions: Option<Vec<String>>,
    /// Token budget handed to the decision call
    pub max_decision_tokens: u32,
    /// Per-action cost overrides (`heartbeat.cost_<action>`)
    pub cost_overrides: HashMap<String, f64>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            max_energy: 20.0,
            base_regeneration: 10.0,
            max_active_goals: 3,
            allowed_actions: None,
            max_decision_tokens: 2048,
            cost_overrides: HashMap::new(),
        }
    }
}

pub(crate) fn heartbeat_settings_tx(conn: &Connection) -> Result<HeartbeatSettings> {
    let defaults = HeartbeatSettings::default();
    let allowed_actions = get_config_tx(conn, "heartbeat.allowed_actions")?.and_then(|v| {
        v.as_array().map(|items| {
            items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
    });

    let mut cost_overrides = HashMap::new();
    {
        let mut stmt =
            conn.prepare("SELECT key, value FROM config WHERE key LIKE 'heartbeat.cost_%'")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, raw) = row?;
            if let Some(action) = key.strip_prefix("heartbeat.cost_") {
                if let Ok(Value::Number(n)) = serde_json::from_str::<Value>(&raw) {
                    if let Some(cost) = n.as_f64() {
                        cost_overrides.insert(action.to_string(), cost);
                    }
                }
            }
        }
    }

    Ok(HeartbeatSettings {
        interval_minutes: get_u64(conn, "heartbeat.heartbeat_interval_minutes")?
            .map_or(defaults.interval_minutes, |v| v as i64),
        max_energy: get_f64(conn, "heartbeat.max_energy")?.unwrap_or(defaults.max_energy),
        base_regeneration: get_f64(conn, "heartbeat.base_regeneration")?
            .unwrap_or(defaults.base_regeneration),
        max_active_goals: get_u64(conn, "heartbeat.max_active_goals")?
            .map_or(defaults.max_active_goals, |v| v as usize),
        allowed_actions,
        max_decision_tokens: get_u64(conn, "heartbeat.max_decision_tokens")?
            .map_or(defaults.max_decision_tokens, |v| v as u32),
        cost_overrides,
    })
}

/// Maintenance cadence and retention knobs
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// Seconds between maintenance passes
    pub maintenance_interval_seconds: i64,
    /// Seconds between subconscious decider runs
    pub subconscious_interval_seconds: i64,
    /// Master switch for the subconscious decider
    pub subconscious_enabled: bool,
    /// Archived memories older than this are deleted
    pub retention_days: i64,
    /// Working-memory accesses required before promotion to episodic
    pub promotion_access_count: i64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            maintenance_interval_seconds: 60,
            subconscious_interval_seconds: 3600,
            subconscious_enabled: true,
            retention_days: 365,
            promotion_access_count: 3,
        }
    }
}

pub(crate) fn maintenance_settings_tx(conn: &Connection) -> Result<MaintenanceSettings> {
    let defaults = MaintenanceSettings::default();
    Ok(MaintenanceSettings {
        maintenance_interval_seconds: get_u64(conn, "maintenance.maintenance_interval_seconds")?
            .map_or(defaults.maintenance_interval_seconds, |v| v as i64),
        subconscious_interval_seconds: get_u64(conn, "maintenance.subconscious_interval_seconds")?
            .map_or(defaults.subconscious_interval_seconds, |v| v as i64),
        subconscious_enabled: get_bool(conn, "maintenance.subconscious_enabled")?
            .unwrap_or(defaults.subconscious_enabled),
        retention_days: get_u64(conn, "maintenance.retention_days")?
            .map_or(defaults.retention_days, |v| v as i64),
        promotion_access_count: get_u64(conn, "maintenance.promotion_access_count")?
            .map_or(defaults.promotion_access_count, |v| v as i64),
    })
}

/// Weights of the combined recall score
#[derive(Debug, Clone, Copy)]
pub struct RecallWeights {
    /// Cosine similarity
    pub alpha: f64,
    /// Decayed importance
    pub beta: f64,
    /// Trust level
    pub gamma: f64,
    /// Recency boost
    pub delta: f64,
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 1.0,
            delta: 1.0,
        }
    }
}

pub(crate) fn recall_weights_tx(conn: &Connection) -> Result<RecallWeights> {
    let defaults = RecallWeights::default();
    let Some(v) = get_config_tx(conn, "memory.recall_weights")? else {
        return Ok(defaults);
    };
    Ok(RecallWeights {
        alpha: v.get("alpha").and_then(Value::as_f64).unwrap_or(defaults.alpha),
        beta: v.get("beta").and_then(Value::as_f64).unwrap_or(defaults.beta),
        gamma: v.get("gamma").and_then(Value::as_f64).unwrap_or(defaults.gamma),
        delta: v.get("delta").and_then(Value::as_f64).unwrap_or(defaults.delta),
    })
}

// ============================================================================
// PUBLIC SURFACE
// ============================================================================

impl Storage {
    /// Read one config value
    pub fn get_config(&self, key: &str) -> Result<Option<Value>> {
        self.with_reader(|conn| get_config_tx(conn, key))
    }

    /// Write one config value
    pub fn set_config(&self, key: &str, value: &Value) -> Result<()> {
        self.with_writer(|conn| set_config_tx(conn, key, value))
    }

    /// Delete one config key; returns whether it existed
    pub fn delete_config(&self, key: &str) -> Result<bool> {
        self.with_writer(|conn| {
            let n = conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    /// All (key, value) pairs whose key starts with any of `prefixes`
    pub fn get_config_by_prefixes(&self, prefixes: &[&str]) -> Result<Vec<(String, Value)>> {
        self.with_reader(|conn| {
            let mut out = Vec::new();
            let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, raw) = row?;
                if prefixes.iter().any(|p| key.starts_with(p)) {
                    out.push((key, serde_json::from_str(&raw)?));
                }
            }
            Ok(out)
        })
    }

    /// True once initialization has marked the agent configured
    pub fn is_agent_configured(&self) -> Result<bool> {
        self.with_reader(is_agent_configured_tx)
    }

    /// Recorded consent decision, if any
    pub fn consent_status(&self) -> Result<Option<String>> {
        self.with_reader(consent_status_tx)
    }

    /// True once a confirmed termination has been executed
    pub fn is_agent_terminated(&self) -> Result<bool> {
        self.with_reader(is_agent_terminated_tx)
    }

    /// Heartbeat knobs snapshot
    pub fn heartbeat_settings(&self) -> Result<HeartbeatSettings> {
        self.with_reader(heartbeat_settings_tx)
    }

    /// Maintenance knobs snapshot
    pub fn maintenance_settings(&self) -> Result<MaintenanceSettings> {
        self.with_reader(maintenance_settings_tx)
    }

    pub(crate) fn get_config_u64(&self, key: &str) -> Result<Option<u64>> {
        self.with_reader(|conn| get_u64(conn, key))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_test_storage;
    use serde_json::json;

    #[test]
    fn test_set_get_delete_roundtrip() {
        let (storage, _dir) = open_test_storage();
        storage.set_config("heartbeat.test.alpha", &json!(1)).unwrap();
        storage.set_config("heartbeat.test.beta", &json!(2)).unwrap();
        storage.set_config("agent.misc", &json!(3)).unwrap();

        let rows = storage.get_config_by_prefixes(&["heartbeat.test."]).unwrap();
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["heartbeat.test.alpha", "heartbeat.test.beta"]);

        assert!(storage.delete_config("heartbeat.test.alpha").unwrap());
        assert!(storage.get_config("heartbeat.test.alpha").unwrap().is_none());
        assert!(!storage.delete_config("heartbeat.test.alpha").unwrap());
    }

    #[test]
    fn test_set_config_overwrites() {
        let (storage, _dir) = open_test_storage();
        storage.set_config("agent.mode", &json!("persona")).unwrap();
        storage.set_config("agent.mode", &json!("raw")).unwrap();
        assert_eq!(storage.get_config("agent.mode").unwrap(), Some(json!("raw")));
    }

    #[test]
    fn test_heartbeat_settings_defaults_and_overrides() {
        let (storage, _dir) = open_test_storage();
        let settings = storage.heartbeat_settings().unwrap();
        assert_eq!(settings.interval_minutes, 60);
        assert_eq!(settings.max_energy, 20.0);
        assert!(settings.allowed_actions.is_none());

        storage
            .set_config("heartbeat.heartbeat_interval_minutes", &json!(15))
            .unwrap();
        storage
            .set_config("heartbeat.allowed_actions", &json!(["rest", "recall"]))
            .unwrap();
        storage.set_config("heartbeat.cost_recall", &json!(2.5)).unwrap();

        let settings = storage.heartbeat_settings().unwrap();
        assert_eq!(settings.interval_minutes, 15);
        assert_eq!(
            settings.allowed_actions,
            Some(vec!["rest".to_string(), "recall".to_string()])
        );
        assert_eq!(settings.cost_overrides.get("recall"), Some(&2.5));
    }

    #[test]
    fn test_agent_gates_default_closed() {
        let (storage, _dir) = open_test_storage();
        assert!(!storage.is_agent_configured().unwrap());
        assert!(!storage.is_agent_terminated().unwrap());
        assert!(storage.consent_status().unwrap().is_none());
    }
}
