use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// layer holding one row per sub-catchment divide
pub const DIVIDES_LAYER: &str = "divides";

/// number of catchment divides in a geopackage
pub fn count_divides(path: &Path) -> Result<u32, rusqlite::Error> {
    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let count: i64 = connection.query_row(
        &format!("select count(*) from {DIVIDES_LAYER}"),
        [],
        |row| row.get(0),
    )?;

    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}
