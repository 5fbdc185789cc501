//! Durable measurement store.
//!
//! SQLite-backed storage of measurements and their point data. Writes go through
//! [`MeasurementStore::append_locations`] / [`MeasurementStore::append_samples`], which
//! split the input into transactions of at most `max_batch_operations` rows. Reads are
//! paginated with a stable `(timestamp, row id)` order so that sweeping `offset` by
//! `limit` visits every row exactly once.
//!
//! The connection sits behind a mutex that is taken once per sub-batch or page, so a
//! running capture session and a sync cycle can interleave on the same store.

mod schema;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::model::{
    GeoLocation, Measurement, MeasurementId, MeasurementStatus, Point3D, PointKind, Vehicle,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Outcome of a batched write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchWriteReport {
    /// Sub-batch transactions committed
    pub batches: usize,
    pub points: usize,
}

pub struct MeasurementStore {
    conn: Mutex<Connection>,
    device_id: Option<String>,
    max_batch_operations: usize,
    query_limit: usize,
}

impl MeasurementStore {
    pub fn open(path: &Path, config: &StorageConfig) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        log::debug!("Opened measurement store at {:?}", path);
        Self::init(conn, config)
    }

    pub fn open_in_memory(config: &StorageConfig) -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: &StorageConfig) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            device_id: None,
            max_batch_operations: config.max_batch_operations.max(1),
            query_limit: config.query_limit.max(1),
        })
    }

    /// Device identifier recorded on every measurement created from now on
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn query_limit(&self) -> usize {
        self.query_limit
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Create a fresh OPEN measurement
    pub fn create_measurement(&self, vehicle: Vehicle) -> StorageResult<MeasurementId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO measurement (vehicle, status, device_id) VALUES (?1, ?2, ?3)",
            params![
                vehicle.as_str(),
                MeasurementStatus::Open.as_str(),
                self.device_id
            ],
        )?;
        let id = MeasurementId(conn.last_insert_rowid() as u64);
        log::info!("Created measurement {} ({})", id, vehicle.as_str());
        Ok(id)
    }

    pub fn load_measurement(&self, id: MeasurementId) -> StorageResult<Measurement> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, vehicle, status, device_id FROM measurement WHERE id = ?1",
                params![id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some(row) => measurement_from_row(row),
            None => Err(StorageError::NoSuchMeasurement(id)),
        }
    }

    pub fn load_measurements(&self) -> StorageResult<Vec<Measurement>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, vehicle, status, device_id FROM measurement ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(measurement_from_row).collect()
    }

    /// The measurement still OPEN, e.g. after the capturing process died
    pub fn open_measurement(&self) -> StorageResult<Option<MeasurementId>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM measurement WHERE status = ?1 ORDER BY id DESC LIMIT 1",
                params![MeasurementStatus::Open.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(|id| MeasurementId(id as u64)))
    }

    pub fn load_status(&self, id: MeasurementId) -> StorageResult<MeasurementStatus> {
        let conn = self.lock()?;
        current_status(&conn, id)
    }

    /// Move a measurement forward in its lifecycle; regressions are rejected
    pub fn set_status(&self, id: MeasurementId, status: MeasurementStatus) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = current_status(&tx, id)?;
        if !current.can_transition_to(status) {
            return Err(StorageError::StatusRegression {
                id,
                from: current,
                to: status,
            });
        }
        if current != status {
            tx.execute(
                "UPDATE measurement SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.0 as i64],
            )?;
            log::debug!(
                "Measurement {} status {} -> {}",
                id,
                current.as_str(),
                status.as_str()
            );
        }
        tx.commit()?;
        Ok(())
    }

    /// Measurements finished capturing but not yet synchronized, in id order
    pub fn load_syncable(&self) -> StorageResult<Vec<MeasurementId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT id FROM measurement WHERE status = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![MeasurementStatus::Finished.as_str()], |row| {
                row.get::<_, i64>(0)
            })?
            .map(|id| id.map(|id| MeasurementId(id as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn append_locations(
        &self,
        id: MeasurementId,
        locations: &[GeoLocation],
    ) -> StorageResult<BatchWriteReport> {
        self.append_batched(id, locations, |tx, fk, location| {
            tx.prepare_cached(schema::INSERT_GEO_LOCATION)?.execute(params![
                fk,
                location.timestamp_ms,
                location.lat,
                location.lon,
                location.speed,
                location.accuracy
            ])?;
            Ok(())
        })
    }

    /// Append samples of any mix of kinds; each is routed to its kind's table
    pub fn append_samples<'a>(
        &self,
        id: MeasurementId,
        samples: impl IntoIterator<Item = &'a Point3D>,
    ) -> StorageResult<BatchWriteReport> {
        let samples: Vec<&Point3D> = samples.into_iter().collect();
        self.append_batched(id, &samples, |tx, fk, sample| {
            tx.prepare_cached(schema::insert_sample_sql(sample.kind))?
                .execute(params![fk, sample.timestamp_ms, sample.x, sample.y, sample.z])?;
            Ok(())
        })
    }

    fn append_batched<T>(
        &self,
        id: MeasurementId,
        rows: &[T],
        insert: impl Fn(&Transaction<'_>, i64, &T) -> rusqlite::Result<()>,
    ) -> StorageResult<BatchWriteReport> {
        let mut report = BatchWriteReport::default();
        if rows.is_empty() {
            return Ok(report);
        }
        let status = current_status(&*self.lock()?, id)?;
        if status != MeasurementStatus::Open {
            return Err(StorageError::NotOpen { id, status });
        }

        let fk = id.0 as i64;
        for batch in rows.chunks(self.max_batch_operations) {
            let mut conn = self.lock()?;
            if let Err(source) = write_batch(&mut conn, fk, batch, &insert) {
                log::warn!(
                    "Write for measurement {} failed after {} of {} batches",
                    id,
                    report.batches,
                    rows.len().div_ceil(self.max_batch_operations)
                );
                return Err(StorageError::PartialWrite {
                    id,
                    committed_batches: report.batches,
                    committed_points: report.points,
                    source,
                });
            }
            report.batches += 1;
            report.points += batch.len();
        }

        log::trace!(
            "Stored {} points for measurement {} in {} batches",
            report.points,
            id,
            report.batches
        );
        Ok(report)
    }

    /// Page of locations ordered by timestamp; `limit` is capped at the query limit
    pub fn load_locations(
        &self,
        id: MeasurementId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<GeoLocation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(schema::SELECT_GEO_LOCATIONS)?;
        let rows = stmt
            .query_map(
                params![id.0 as i64, self.page_limit(limit), offset as i64],
                |row| {
                    Ok(GeoLocation {
                        timestamp_ms: row.get(0)?,
                        lat: row.get(1)?,
                        lon: row.get(2)?,
                        speed: row.get(3)?,
                        accuracy: row.get(4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn load_samples(
        &self,
        id: MeasurementId,
        kind: PointKind,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Point3D>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(schema::select_samples_sql(kind))?;
        let rows = stmt
            .query_map(
                params![id.0 as i64, self.page_limit(limit), offset as i64],
                |row| {
                    Ok(Point3D {
                        kind,
                        timestamp_ms: row.get(0)?,
                        x: row.get(1)?,
                        y: row.get(2)?,
                        z: row.get(3)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn page_limit(&self, limit: usize) -> i64 {
        limit.min(self.query_limit) as i64
    }

    pub fn count_locations(&self, id: MeasurementId) -> StorageResult<usize> {
        self.count(schema::GEO_LOCATION_TABLE, id)
    }

    pub fn count_samples(&self, id: MeasurementId, kind: PointKind) -> StorageResult<usize> {
        self.count(schema::sample_table(kind), id)
    }

    fn count(&self, table: &str, id: MeasurementId) -> StorageResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE measurement_fk = ?1", table),
            params![id.0 as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete all point data of a measurement, keeping the measurement itself
    pub fn clean_measurement(&self, id: MeasurementId) -> StorageResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for table in schema::POINT_TABLES {
            deleted += tx.execute(
                &format!("DELETE FROM {} WHERE measurement_fk = ?1", table),
                params![id.0 as i64],
            )?;
        }
        tx.commit()?;
        if deleted > 0 {
            log::info!("Deleted {} points of measurement {}", deleted, id);
        }
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> StorageResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

/// One transaction; dropping it uncommitted rolls the whole batch back
fn write_batch<T>(
    conn: &mut Connection,
    fk: i64,
    batch: &[T],
    insert: &impl Fn(&Transaction<'_>, i64, &T) -> rusqlite::Result<()>,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for row in batch {
        insert(&tx, fk, row)?;
    }
    tx.commit()
}

fn current_status(conn: &Connection, id: MeasurementId) -> StorageResult<MeasurementStatus> {
    let status = conn
        .query_row(
            "SELECT status FROM measurement WHERE id = ?1",
            params![id.0 as i64],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or(StorageError::NoSuchMeasurement(id))?;
    MeasurementStatus::parse(&status)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown status {}", status)))
}

fn measurement_from_row(
    (id, vehicle, status, device_id): (i64, String, String, Option<String>),
) -> StorageResult<Measurement> {
    let status = MeasurementStatus::parse(&status)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown status {}", status)))?;
    Ok(Measurement {
        id: MeasurementId(id as u64),
        vehicle: Vehicle::parse(&vehicle),
        status,
        device_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MeasurementStore {
        MeasurementStore::open_in_memory(&StorageConfig::default()).unwrap()
    }

    fn location(timestamp_ms: i64) -> GeoLocation {
        GeoLocation::new(timestamp_ms, 51.05, 13.73, 1.0, 5.0)
    }

    #[test]
    fn test_create_measurement_is_open_with_fresh_id() {
        let store = store().with_device_id("device-1");
        let first = store.create_measurement(Vehicle::Bicycle).unwrap();
        let second = store.create_measurement(Vehicle::Car).unwrap();

        assert!(second > first);
        let loaded = store.load_measurement(first).unwrap();
        assert_eq!(loaded.status, MeasurementStatus::Open);
        assert_eq!(loaded.vehicle, Vehicle::Bicycle);
        assert_eq!(loaded.device_id.as_deref(), Some("device-1"));
        assert_eq!(store.open_measurement().unwrap(), Some(second));
    }

    #[test]
    fn test_load_and_clean_each_point_kind() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        let samples: Vec<Point3D> = PointKind::ALL
            .iter()
            .flat_map(|kind| (0..3).map(move |_| Point3D::new(*kind, 1.0, 1.0, 1.0, 1)))
            .collect();
        store.append_samples(id, &samples).unwrap();

        for kind in PointKind::ALL {
            assert_eq!(store.load_samples(id, kind, 0, 100).unwrap().len(), 3);
        }

        assert_eq!(store.clean_measurement(id).unwrap(), 9);

        for kind in PointKind::ALL {
            assert_eq!(store.load_samples(id, kind, 0, 100).unwrap().len(), 0);
        }
        assert!(store.load_measurement(id).is_ok());
    }

    #[test]
    fn test_clean_measurement_is_idempotent() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        store.append_locations(id, &[location(1), location(2)]).unwrap();

        assert_eq!(store.clean_measurement(id).unwrap(), 2);
        assert_eq!(store.clean_measurement(id).unwrap(), 0);
    }

    #[test]
    fn test_bulk_write_splits_into_sub_batches() {
        let store = store();
        let id = store.create_measurement(Vehicle::Car).unwrap();
        let locations: Vec<GeoLocation> = (0..10_000).map(location).collect();

        let report = store.append_locations(id, &locations).unwrap();

        assert_eq!(report.batches, 19);
        assert_eq!(report.points, 10_000);
        assert_eq!(store.count_locations(id).unwrap(), 10_000);
    }

    #[test]
    fn test_ten_hour_track_pages_without_gaps_or_duplicates() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        // Identical timestamps force the row id tie-break to carry the ordering
        let locations: Vec<GeoLocation> = (0..36_000)
            .map(|i| GeoLocation::new(1, 1.0, i as f64, 1.0, 1.0))
            .collect();
        store.append_locations(id, &locations).unwrap();

        let page_size = store.query_limit();
        let mut offset = 0;
        let mut seen = std::collections::HashSet::new();
        loop {
            let page = store.load_locations(id, offset, page_size).unwrap();
            for loc in &page {
                assert!(seen.insert(loc.lon as i64), "duplicate row {}", loc.lon);
            }
            if page.len() < page_size {
                break;
            }
            offset += page_size;
        }

        assert_eq!(seen.len(), 36_000);
    }

    #[test]
    fn test_pages_are_ordered_by_timestamp() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        store
            .append_locations(id, &[location(30), location(10), location(20)])
            .unwrap();

        let first = store.load_locations(id, 0, 2).unwrap();
        let rest = store.load_locations(id, 2, 2).unwrap();

        let times: Vec<i64> = first.iter().chain(rest.iter()).map(|l| l.timestamp_ms).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn test_page_limit_is_capped() {
        let config = StorageConfig {
            query_limit: 5,
            ..StorageConfig::default()
        };
        let store = MeasurementStore::open_in_memory(&config).unwrap();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        let locations: Vec<GeoLocation> = (0..8).map(location).collect();
        store.append_locations(id, &locations).unwrap();

        assert_eq!(store.load_locations(id, 0, 100).unwrap().len(), 5);
    }

    #[test]
    fn test_status_regression_is_rejected() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        store.set_status(id, MeasurementStatus::Finished).unwrap();
        store.set_status(id, MeasurementStatus::Synced).unwrap();

        let err = store.set_status(id, MeasurementStatus::Finished).unwrap_err();
        assert!(matches!(err, StorageError::StatusRegression { .. }));
        let err = store.set_status(id, MeasurementStatus::Open).unwrap_err();
        assert!(matches!(err, StorageError::StatusRegression { .. }));
        assert_eq!(store.load_status(id).unwrap(), MeasurementStatus::Synced);
    }

    #[test]
    fn test_set_status_on_unknown_measurement() {
        let err = store()
            .set_status(MeasurementId(99), MeasurementStatus::Finished)
            .unwrap_err();
        assert!(matches!(err, StorageError::NoSuchMeasurement(MeasurementId(99))));
    }

    #[test]
    fn test_load_syncable_returns_only_finished() {
        let store = store();
        let open = store.create_measurement(Vehicle::Bicycle).unwrap();
        let finished = store.create_measurement(Vehicle::Bicycle).unwrap();
        let synced = store.create_measurement(Vehicle::Bicycle).unwrap();
        store.set_status(finished, MeasurementStatus::Finished).unwrap();
        store.set_status(synced, MeasurementStatus::Finished).unwrap();
        store.set_status(synced, MeasurementStatus::Synced).unwrap();

        let syncable = store.load_syncable().unwrap();
        assert_eq!(syncable, vec![finished]);
        assert!(!syncable.contains(&open));
    }

    #[test]
    fn test_partial_write_reports_committed_batches() {
        let config = StorageConfig {
            max_batch_operations: 100,
            ..StorageConfig::default()
        };
        let store = MeasurementStore::open_in_memory(&config).unwrap();
        store
            .execute_raw(
                "CREATE TRIGGER reject_negative BEFORE INSERT ON geo_location \
                 WHEN NEW.gps_time < 0 BEGIN SELECT RAISE(ABORT, 'negative time'); END;",
            )
            .unwrap();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        let mut locations: Vec<GeoLocation> = (0..300).map(location).collect();
        locations[250].timestamp_ms = -1;

        let err = store.append_locations(id, &locations).unwrap_err();

        match err {
            StorageError::PartialWrite {
                committed_batches,
                committed_points,
                ..
            } => {
                assert_eq!(committed_batches, 2);
                assert_eq!(committed_points, 200);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.count_locations(id).unwrap(), 200);
    }

    #[test]
    fn test_append_to_unknown_measurement() {
        let err = store()
            .append_locations(MeasurementId(7), &[location(1)])
            .unwrap_err();
        assert!(matches!(err, StorageError::NoSuchMeasurement(_)));
    }

    #[test]
    fn test_append_after_finish_is_rejected() {
        let store = store();
        let id = store.create_measurement(Vehicle::Bicycle).unwrap();
        store.append_locations(id, &[location(1)]).unwrap();
        store.set_status(id, MeasurementStatus::Finished).unwrap();

        let err = store.append_locations(id, &[location(2)]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::NotOpen {
                status: MeasurementStatus::Finished,
                ..
            }
        ));

        store.set_status(id, MeasurementStatus::Synced).unwrap();
        let err = store
            .append_samples(id, &[Point3D::new(PointKind::Rotation, 0.0, 0.0, 0.0, 1)])
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::NotOpen {
                status: MeasurementStatus::Synced,
                ..
            }
        ));
        assert_eq!(store.count_locations(id).unwrap(), 1);
        assert_eq!(store.count_samples(id, PointKind::Rotation).unwrap(), 0);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.db");
        let config = StorageConfig::default();
        let id = {
            let store = MeasurementStore::open(&path, &config).unwrap();
            let id = store.create_measurement(Vehicle::Walking).unwrap();
            store.append_locations(id, &[location(5)]).unwrap();
            store.set_status(id, MeasurementStatus::Finished).unwrap();
            id
        };

        let store = MeasurementStore::open(&path, &config).unwrap();
        assert_eq!(store.load_syncable().unwrap(), vec![id]);
        assert_eq!(store.count_locations(id).unwrap(), 1);
    }
}
