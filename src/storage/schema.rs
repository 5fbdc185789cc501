use crate::model::PointKind;

pub(crate) const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS measurement (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vehicle TEXT NOT NULL,
    status TEXT NOT NULL,
    device_id TEXT
);

CREATE TABLE IF NOT EXISTS geo_location (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_fk INTEGER NOT NULL REFERENCES measurement(id),
    gps_time INTEGER NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    speed REAL NOT NULL,
    accuracy REAL NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS geo_location_by_measurement
    ON geo_location (measurement_fk, gps_time, id);

CREATE TABLE IF NOT EXISTS acceleration (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_fk INTEGER NOT NULL REFERENCES measurement(id),
    time INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS acceleration_by_measurement
    ON acceleration (measurement_fk, time, id);

CREATE TABLE IF NOT EXISTS rotation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_fk INTEGER NOT NULL REFERENCES measurement(id),
    time INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS rotation_by_measurement
    ON rotation (measurement_fk, time, id);

CREATE TABLE IF NOT EXISTS direction (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    measurement_fk INTEGER NOT NULL REFERENCES measurement(id),
    time INTEGER NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS direction_by_measurement
    ON direction (measurement_fk, time, id);
";

pub(crate) const GEO_LOCATION_TABLE: &str = "geo_location";

pub(crate) const POINT_TABLES: [&str; 4] = ["geo_location", "acceleration", "rotation", "direction"];

pub(crate) fn sample_table(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Acceleration => "acceleration",
        PointKind::Rotation => "rotation",
        PointKind::Direction => "direction",
    }
}

pub(crate) const INSERT_GEO_LOCATION: &str = "INSERT INTO geo_location \
    (measurement_fk, gps_time, lat, lon, speed, accuracy, is_synced) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)";

pub(crate) fn insert_sample_sql(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Acceleration => {
            "INSERT INTO acceleration (measurement_fk, time, x, y, z, is_synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)"
        }
        PointKind::Rotation => {
            "INSERT INTO rotation (measurement_fk, time, x, y, z, is_synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)"
        }
        PointKind::Direction => {
            "INSERT INTO direction (measurement_fk, time, x, y, z, is_synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)"
        }
    }
}

pub(crate) const SELECT_GEO_LOCATIONS: &str = "SELECT gps_time, lat, lon, speed, accuracy \
    FROM geo_location WHERE measurement_fk = ?1 \
    ORDER BY gps_time ASC, id ASC LIMIT ?2 OFFSET ?3";

pub(crate) fn select_samples_sql(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Acceleration => {
            "SELECT time, x, y, z FROM acceleration WHERE measurement_fk = ?1 \
             ORDER BY time ASC, id ASC LIMIT ?2 OFFSET ?3"
        }
        PointKind::Rotation => {
            "SELECT time, x, y, z FROM rotation WHERE measurement_fk = ?1 \
             ORDER BY time ASC, id ASC LIMIT ?2 OFFSET ?3"
        }
        PointKind::Direction => {
            "SELECT time, x, y, z FROM direction WHERE measurement_fk = ?1 \
             ORDER BY time ASC, id ASC LIMIT ?2 OFFSET ?3"
        }
    }
}
