//! Drives
//!
//! Slow homeostatic pressures that accrue with wall-clock time and surface in
//! the decision context once they cross their threshold. Rest relieves them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::storage::{Result, Storage};

/// A drive row
#[derive(Debug, Clone, serde::Serialize)]
pub struct Drive {
    /// Drive name
    pub name: String,
    /// Current pressure
    pub level: f64,
    /// Pressure at which the drive becomes urgent
    pub threshold: f64,
    /// Pressure gained per hour
    pub accrual_rate: f64,
    /// Last accrual time
    pub updated_at: DateTime<Utc>,
}

/// A drive above threshold, as shown to the decision call
#[derive(Debug, Clone, serde::Serialize)]
pub struct UrgentDrive {
    /// Drive name
    pub name: String,
    /// Current pressure
    pub level: f64,
    /// `level / threshold`
    pub urgency_ratio: f64,
}

/// (name, threshold, accrual per hour) seeded on first run
const DEFAULT_DRIVES: &[(&str, f64, f64)] = &[
    ("curiosity", 1.0, 0.04),
    ("connection", 1.0, 0.02),
    ("reflection", 1.0, 0.01),
];

impl Storage {
    /// Seed the default drive set; existing rows are left alone
    pub fn seed_default_drives(&self) -> Result<()> {
        let now = Utc::now();
        self.with_writer(|conn| {
            for (name, threshold, rate) in DEFAULT_DRIVES {
                conn.execute(
                    "INSERT OR IGNORE INTO drives (name, level, threshold, accrual_rate, updated_at)
                     VALUES (?1, 0.0, ?2, ?3, ?4)",
                    params![name, threshold, rate, now],
                )?;
            }
            Ok(())
        })
    }

    /// All drives
    pub fn list_drives(&self) -> Result<Vec<Drive>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, level, threshold, accrual_rate, updated_at FROM drives ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Drive {
                    name: row.get(0)?,
                    level: row.get(1)?,
                    threshold: row.get(2)?,
                    accrual_rate: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Relieve every drive by a fraction of its level (what `rest` does)
    pub fn relieve_drives(&self, fraction: f64) -> Result<()> {
        let fraction = fraction.clamp(0.0, 1.0);
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE drives SET level = level * (1.0 - ?1), updated_at = ?2",
                params![fraction, Utc::now()],
            )?;
            Ok(())
        })
    }
}

/// Accrue pressure for elapsed time, clamped to twice the threshold
pub(crate) fn accrue_drives_tx(conn: &Connection, now: DateTime<Utc>) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT name, level, threshold, accrual_rate, updated_at FROM drives")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, DateTime<Utc>>(4)?,
        ))
    })?;
    let drives: Vec<_> = rows.collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for (name, level, threshold, rate, updated_at) in drives {
        let hours = (now - updated_at).num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            continue;
        }
        let next = (level + rate * hours).clamp(0.0, 2.0 * threshold);
        conn.execute(
            "UPDATE drives SET level = ?1, updated_at = ?2 WHERE name = ?3",
            params![next, now, name],
        )?;
    }
    Ok(())
}

/// Drives at or above threshold, most urgent first
pub(crate) fn urgent_drives_tx(conn: &Connection) -> Result<Vec<UrgentDrive>> {
    let mut stmt = conn.prepare(
        "SELECT name, level, threshold FROM drives
         WHERE threshold > 0 AND level >= threshold
         ORDER BY level / threshold DESC, name ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let level: f64 = row.get(1)?;
        let threshold: f64 = row.get(2)?;
        Ok(UrgentDrive {
            name: row.get(0)?,
            level,
            urgency_ratio: level / threshold,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
