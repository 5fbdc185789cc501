//! Binary transfer format for one stored measurement.
//!
//! Layout, all integers and floats big-endian:
//!
//! ```text
//! u16 format version
//! u32 location count, then per location: i64 time ms, f64 lat, f64 lon, f64 speed, i32 accuracy cm
//! u32 acceleration count, then per sample: i64 time ms, f64 x, f64 y, f64 z
//! u32 rotation count, ...
//! u32 direction count, ...
//! ```
//!
//! Rows are read through the store one page at a time, so memory use does not grow with
//! the size of the measurement.

use crate::error::SerializeError;
use crate::model::{GeoLocation, MeasurementId, Point3D, PointKind};
use crate::storage::MeasurementStore;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

pub const FORMAT_VERSION: u16 = 1;
pub const GEO_LOCATION_RECORD_BYTES: usize = 36;
pub const POINT_3D_RECORD_BYTES: usize = 32;

pub struct MeasurementSerializer<'a> {
    store: &'a MeasurementStore,
    page_size: usize,
}

impl<'a> MeasurementSerializer<'a> {
    pub fn new(store: &'a MeasurementStore) -> Self {
        Self {
            store,
            page_size: store.query_limit(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Write the uncompressed form; returns the number of bytes written
    pub fn serialize<W: Write>(&self, id: MeasurementId, writer: &mut W) -> Result<usize, SerializeError> {
        let mut written = 0;
        writer.write_all(&FORMAT_VERSION.to_be_bytes())?;
        written += 2;
        written += self.write_locations(id, writer)?;
        for kind in PointKind::ALL {
            written += self.write_samples(id, kind, writer)?;
        }
        Ok(written)
    }

    /// Write the zlib-compressed form, the one handed to uploads
    pub fn serialize_compressed<W: Write>(
        &self,
        id: MeasurementId,
        writer: W,
    ) -> Result<W, SerializeError> {
        let mut encoder = ZlibEncoder::new(writer, Compression::default());
        let raw = self.serialize(id, &mut encoder)?;
        let inner = encoder.finish()?;
        log::debug!("Serialized measurement {} ({} bytes before compression)", id, raw);
        Ok(inner)
    }

    /// Compressed form in memory
    pub fn to_compressed_bytes(&self, id: MeasurementId) -> Result<Vec<u8>, SerializeError> {
        self.serialize_compressed(id, Vec::new())
    }

    fn write_locations<W: Write>(&self, id: MeasurementId, writer: &mut W) -> Result<usize, SerializeError> {
        let expected = self.store.count_locations(id)?;
        writer.write_all(&count_field(expected)?)?;

        let mut read = 0;
        while read < expected {
            let page = self
                .store
                .load_locations(id, read, self.page_size.min(expected - read))?;
            if page.is_empty() {
                break;
            }
            for location in &page {
                write_location(location, writer)?;
            }
            read += page.len();
        }
        check_complete(id, "geo_location", expected, read)?;
        Ok(4 + expected * GEO_LOCATION_RECORD_BYTES)
    }

    fn write_samples<W: Write>(
        &self,
        id: MeasurementId,
        kind: PointKind,
        writer: &mut W,
    ) -> Result<usize, SerializeError> {
        let expected = self.store.count_samples(id, kind)?;
        writer.write_all(&count_field(expected)?)?;

        let mut read = 0;
        while read < expected {
            let page = self
                .store
                .load_samples(id, kind, read, self.page_size.min(expected - read))?;
            if page.is_empty() {
                break;
            }
            for sample in &page {
                write_point(sample, writer)?;
            }
            read += page.len();
        }
        check_complete(id, kind_name(kind), expected, read)?;
        Ok(4 + expected * POINT_3D_RECORD_BYTES)
    }
}

/// Counts are `u32` on the wire
fn count_field(count: usize) -> std::io::Result<[u8; 4]> {
    u32::try_from(count).map(u32::to_be_bytes).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} points do not fit the u32 count field", count),
        )
    })
}

fn write_location<W: Write>(location: &GeoLocation, writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&location.timestamp_ms.to_be_bytes())?;
    writer.write_all(&location.lat.to_be_bytes())?;
    writer.write_all(&location.lon.to_be_bytes())?;
    writer.write_all(&location.speed.to_be_bytes())?;
    let accuracy_cm = (location.accuracy * 100.0).round() as i32;
    writer.write_all(&accuracy_cm.to_be_bytes())
}

fn write_point<W: Write>(point: &Point3D, writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&point.timestamp_ms.to_be_bytes())?;
    writer.write_all(&point.x.to_be_bytes())?;
    writer.write_all(&point.y.to_be_bytes())?;
    writer.write_all(&point.z.to_be_bytes())
}

fn check_complete(
    id: MeasurementId,
    kind: &'static str,
    expected: usize,
    read: usize,
) -> Result<(), SerializeError> {
    if read != expected {
        return Err(SerializeError::Inconsistent {
            id,
            kind,
            expected,
            read,
        });
    }
    Ok(())
}

fn kind_name(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Acceleration => "acceleration",
        PointKind::Rotation => "rotation",
        PointKind::Direction => "direction",
    }
}
