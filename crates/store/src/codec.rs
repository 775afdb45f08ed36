//! Column encodings shared by the collection modules.

use canopy_core::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// Fixed-width RFC 3339 with nanoseconds, so text order equals time order.
pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(collection: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            collection,
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

pub(crate) fn get<'r, T>(row: &'r SqliteRow, collection: &'static str, column: &'static str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| StoreError::Corrupt {
        collection,
        reason: format!("{column} column: {e}"),
    })
}

pub(crate) fn get_ts(row: &SqliteRow, collection: &'static str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = get(row, collection, column)?;
    parse_ts(collection, &raw)
}

pub(crate) fn to_json<T: serde::Serialize>(collection: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        collection,
        reason: format!("serialize: {e}"),
    })
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(collection: &'static str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        collection,
        reason: format!("deserialize: {e}"),
    })
}

/// Serialize an embedding vector to little-endian bytes.
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
