//! Append-only flight history in SQLite.
//!
//! Samples are staged in memory by [`HistoryStore::append`] and written in
//! one transaction by [`HistoryStore::flush`]. A failed flush keeps every
//! staged row for the next attempt; nothing is dropped silently.

pub mod doctor;
pub mod error;
pub mod export;
pub mod schema;

use ground_proto::{HistoryRecord, TelemetrySample};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use error::PersistenceError;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub db_path: PathBuf,

    /// Commit after every appended sample.
    #[serde(default = "default_flush_every_sample")]
    pub flush_every_sample: bool,

    /// Periodic commit; 0 disables. At least one of the two policies must be active.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: Option<u64>,
}

fn default_flush_every_sample() -> bool {
    true
}

fn default_flush_interval_ms() -> Option<u64> {
    Some(1000)
}

impl HistoryConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), flush_every_sample: true, flush_interval_ms: default_flush_interval_ms() }
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn has_flush_policy(&self) -> bool {
        self.flush_every_sample || self.flush_interval().is_some()
    }
}

#[derive(Debug)]
struct StagedRow {
    ingested_at: String,
    source: String,
    sample: TelemetrySample,
}

/// Exclusive owner of the history database connection.
#[derive(Debug)]
pub struct HistoryStore {
    conn: SqliteConnection,
    staged: Vec<StagedRow>,
}

impl HistoryStore {
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .connect()
            .await?;
        sqlx::query(schema::CREATE_TABLE).execute(&mut conn).await?;

        info!("history: opened {}", path.display());
        Ok(Self { conn, staged: Vec::new() })
    }

    /// Stages one sample. Storage is not touched until `flush`.
    pub fn append(&mut self, source: &str, sample: &TelemetrySample) -> Result<(), PersistenceError> {
        let ingested_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
        self.staged.push(StagedRow { ingested_at, source: source.to_string(), sample: sample.clone() });
        Ok(())
    }

    /// Rows staged but not yet committed.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Commits all staged rows in one transaction, in staging order.
    pub async fn flush(&mut self) -> Result<usize, PersistenceError> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        let mut tx = self.conn.begin().await?;
        for row in &self.staged {
            let s = &row.sample;
            sqlx::query(schema::INSERT)
                .bind(row.ingested_at.as_str())
                .bind(row.source.as_str())
                .bind(s.raw_line.as_deref())
                .bind(s.time_s)
                .bind(s.lat_deg)
                .bind(s.lon_deg)
                .bind(s.abs_alt_m)
                .bind(s.rel_alt_m)
                .bind(s.roll_deg)
                .bind(s.pitch_deg)
                .bind(s.yaw_deg)
                .bind(s.vx_ms)
                .bind(s.vy_ms)
                .bind(s.vz_ms)
                .bind(s.groundspeed_ms)
                .bind(s.voltage_v)
                .bind(s.battery_percent)
                .bind(s.flight_mode.as_deref())
                .bind(s.in_air)
                .bind(s.gps_fix_type.map(i64::from))
                .bind(s.num_sat.map(i64::from))
                .bind(s.temp_c)
                .bind(s.hum_pct)
                .bind(s.pres_hpa)
                .bind(s.rad_mwcm2)
                .bind(s.acc_ms2)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let n = self.staged.len();
        self.staged.clear();
        debug!("history: committed {} rows", n);
        Ok(n)
    }

    pub async fn get_all(&mut self) -> Result<Vec<HistoryRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, schema::SampleRow>(schema::SELECT_ALL)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    /// Up to `n` most recent records, newest first.
    pub async fn get_latest(&mut self, n: usize) -> Result<Vec<HistoryRecord>, PersistenceError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, schema::SampleRow>(schema::SELECT_LATEST)
            .bind(limit)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    /// Deletes every persisted row and discards staged ones, then compacts.
    pub async fn clear(&mut self) -> Result<(), PersistenceError> {
        let dropped = self.staged.len();
        self.staged.clear();
        let deleted = sqlx::query("DELETE FROM samples").execute(&mut self.conn).await?;
        sqlx::query("VACUUM").execute(&mut self.conn).await?;
        info!("history: cleared {} rows ({} staged discarded)", deleted.rows_affected(), dropped);
        Ok(())
    }

    /// Writes every persisted record as CSV after committing staged rows.
    pub async fn export_csv<W: std::io::Write>(&mut self, out: W) -> Result<usize, PersistenceError> {
        self.flush().await?;
        let records = self.get_all().await?;
        export::write_csv(&records, out)
    }

    /// Final flush, then close. The connection is closed even if the flush fails.
    pub async fn close(mut self) -> Result<(), PersistenceError> {
        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            warn!("history: final flush failed, {} rows lost: {}", self.staged.len(), e);
        }
        self.conn.close().await?;
        flushed.map(|_| ())
    }
}

/// Reorders a `get_latest` result oldest first.
pub fn chronological(mut records: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    records.reverse();
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_tmp() -> (TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).await.unwrap();
        (dir, store)
    }

    fn sample(t: f64) -> TelemetrySample {
        let mut s = TelemetrySample::at(t);
        s.lat_deg = Some(19.332);
        s.battery_percent = Some(80.0 - t);
        s
    }

    #[tokio::test]
    async fn test_round_trip_keeps_absent_fields_absent() {
        let (_dir, mut store) = open_tmp().await;

        let mut full = sample(1.0);
        full.flight_mode = Some("LOITER".into());
        full.in_air = Some(false);
        full.gps_fix_type = Some(3);
        full.num_sat = Some(11);
        full.raw_line = Some("lat:19.3320,bat:79".into());
        store.append("MAVLINK", &full).unwrap();
        store.append("RADIO", &TelemetrySample::at(2.0)).unwrap();
        assert_eq!(store.flush().await.unwrap(), 2);

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source, "MAVLINK");
        assert_eq!(all[0].sample, full);
        assert_eq!(all[1].sample, TelemetrySample::at(2.0));
        assert_eq!(all[1].sample.in_air, None);
        assert!(OffsetDateTime::parse(&all[0].ingested_at, &Rfc3339).is_ok());
    }

    #[tokio::test]
    async fn test_ids_follow_append_order() {
        let (_dir, mut store) = open_tmp().await;
        for i in 0..5 {
            store.append("DEMO", &sample(i as f64)).unwrap();
        }
        store.flush().await.unwrap();

        let all = store.get_all().await.unwrap();
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
        let times: Vec<f64> = all.iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, [0.0, 1.0, 2.0, 3.0, 4.0]);

        let latest = store.get_latest(3).await.unwrap();
        let times: Vec<f64> = latest.iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, [4.0, 3.0, 2.0]);
        let times: Vec<f64> = chronological(latest).iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, [2.0, 3.0, 4.0]);

        assert_eq!(store.get_latest(100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_append_alone_does_not_persist() {
        let (_dir, mut store) = open_tmp().await;
        store.append("DEMO", &sample(0.0)).unwrap();
        assert_eq!(store.pending(), 1);
        assert!(store.get_all().await.unwrap().is_empty());
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.pending(), 0);
        assert_eq!(store.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_staged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let mut store = HistoryStore::open(&path).await.unwrap();

        // A second connection makes every insert fail.
        let mut other = SqliteConnectOptions::new().filename(&path).connect().await.unwrap();
        sqlx::query("CREATE TRIGGER reject BEFORE INSERT ON samples BEGIN SELECT RAISE(ABORT, 'disk full'); END")
            .execute(&mut other)
            .await
            .unwrap();

        for i in 0..3 {
            store.append("DEMO", &sample(i as f64)).unwrap();
        }
        assert!(store.flush().await.is_err());
        assert_eq!(store.pending(), 3);
        assert!(store.get_all().await.unwrap().is_empty());

        sqlx::query("DROP TRIGGER reject").execute(&mut other).await.unwrap();
        other.close().await.unwrap();

        store.append("DEMO", &sample(3.0)).unwrap();
        assert_eq!(store.flush().await.unwrap(), 4);
        let times: Vec<f64> = store.get_all().await.unwrap().iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, [0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_clear_drops_persisted_and_staged() {
        let (_dir, mut store) = open_tmp().await;
        store.append("DEMO", &sample(0.0)).unwrap();
        store.flush().await.unwrap();
        store.append("DEMO", &sample(1.0)).unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.pending(), 0);
        assert!(store.get_all().await.unwrap().is_empty());

        store.append("DEMO", &sample(2.0)).unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let empty = HistoryStore::open(&path).await.unwrap();
        empty.close().await.unwrap();

        let mut store = HistoryStore::open(&path).await.unwrap();
        store.append("DEMO", &sample(0.5)).unwrap();
        store.close().await.unwrap();

        let mut reopened = HistoryStore::open(&path).await.unwrap();
        let all = reopened.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sample.time_s, 0.5);
    }

    #[tokio::test]
    async fn test_export_includes_staged_rows() {
        let (_dir, mut store) = open_tmp().await;
        store.append("DEMO", &sample(0.0)).unwrap();
        store.append("DEMO", &sample(1.0)).unwrap();

        let mut out = Vec::new();
        assert_eq!(store.export_csv(&mut out).await.unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("id,ingested_at,source,raw_line,time_s,lat,"));
    }

    #[test]
    fn test_flush_policy() {
        let mut cfg = HistoryConfig::new("h.db");
        assert!(cfg.has_flush_policy());
        cfg.flush_every_sample = false;
        cfg.flush_interval_ms = Some(0);
        assert!(!cfg.has_flush_policy());
        cfg.flush_interval_ms = Some(500);
        assert_eq!(cfg.flush_interval(), Some(Duration::from_millis(500)));
    }
}
