//! SQLite persistence for the summary series

use crate::telemetry::SummaryPoint;
use chrono::DateTime;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the store. The parent directory must already exist.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Open a store that must already exist; never creates the file.
    pub fn open_existing(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))
    }

    pub fn load_points(&self) -> rusqlite::Result<Vec<SummaryPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp_ms, kilohashes_5s, hardware_errors, stale
             FROM summary_points ORDER BY timestamp_ms, seq",
        )?;
        let rows = stmt.query_map([], Self::map_point)?;
        rows.collect()
    }

    fn map_point(row: &rusqlite::Row) -> rusqlite::Result<SummaryPoint> {
        let millis: i64 = row.get(0)?;
        let timestamp = DateTime::from_timestamp_millis(millis)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, millis))?;
        Ok(SummaryPoint {
            timestamp,
            kilohashes_5s: row.get(1)?,
            hardware_errors: row.get(2)?,
            stale: row.get(3)?,
        })
    }

    /// Replace the whole series in one transaction.
    pub fn replace_points(&mut self, points: &[SummaryPoint]) -> rusqlite::Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM summary_points", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO summary_points (timestamp_ms, kilohashes_5s, hardware_errors, stale)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for p in points {
                stmt.execute(params![
                    p.timestamp.timestamp_millis(),
                    p.kilohashes_5s,
                    p.hardware_errors,
                    p.stale
                ])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    pub fn count_points(&self) -> rusqlite::Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM summary_points", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}
