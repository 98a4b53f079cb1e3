//! Column decoding that reports which table and column held bad data.

use serde::de::DeserializeOwned;

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: String) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail,
    }
}

pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx)
        .map_err(|e| corrupt(table, column, e.to_string()))
}

/// Nullable column; SQL NULL becomes `None`.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// A JSON text column.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("bad json ({e})")))
}

/// A status-like text column.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unrecognised value {raw:?}")))
}

/// SQLite integers come back as i64; reject negatives instead of wrapping.
pub fn get_u32(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<u32, StoreError> {
    let raw: i64 = get(row, idx, table, column)?;
    u32::try_from(raw).map_err(|_| corrupt(table, column, format!("out of range: {raw}")))
}
