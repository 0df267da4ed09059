//! Ledger of basins that passed config generation.
//!
//! A two column, comma separated table (`basin_id,num_divides`, older trees use `gage_id`).
//! Rows are only ever appended and an id is never recorded twice.

use super::RegistryError;
use parking_lot::FairMutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const ID_COLUMNS: [&str; 2] = ["basin_id", "gage_id"];
pub const COUNT_COLUMNS: [&str; 2] = ["num_divides", "n_cats"];
pub const HEADER: &str = "basin_id,num_divides";

/// Read all recorded ids, a missing or empty ledger records nothing
pub fn load_passed(path: &Path) -> Result<BTreeSet<String>, RegistryError> {
    Ok(load_entries(path)?.into_keys().collect())
}

/// Read all recorded rows as id -> catchment count
pub fn load_entries(path: &Path) -> Result<BTreeMap<String, u32>, RegistryError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(RegistryError::Ledger {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let malformed = |line: usize, reason: String| RegistryError::MalformedLedger {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut lines = content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());

    let Some((header_line, header)) = lines.next() else {
        return Ok(BTreeMap::new());
    };

    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let find = |names: &[&str]| columns.iter().position(|column| names.contains(column));
    let (Some(id_column), Some(count_column)) = (find(&ID_COLUMNS), find(&COUNT_COLUMNS)) else {
        return Err(malformed(header_line, format!("unexpected header `{header}`")));
    };

    let mut entries = BTreeMap::new();

    for (line_number, line) in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        let (Some(id), Some(count)) = (fields.get(id_column), fields.get(count_column)) else {
            return Err(malformed(line_number, format!("missing columns in `{line}`")));
        };

        let count = count
            .parse::<u32>()
            .map_err(|error| malformed(line_number, format!("bad count `{count}`: {error}")))?;

        entries.entry((*id).to_owned()).or_insert(count);
    }

    Ok(entries)
}

/// Append entries whose id is not yet recorded, creating the ledger with a header if needed.
///
/// Returns the number of rows written
pub fn record_passed(path: &Path, new_entries: &[(String, u32)]) -> Result<usize, RegistryError> {
    let io_error = |source| RegistryError::Ledger {
        path: path.to_path_buf(),
        source,
    };

    let mut existing = load_passed(path)?;
    let rows: Vec<&(String, u32)> = new_entries
        .iter()
        .filter(|(id, _)| existing.insert(id.clone()))
        .collect();

    if rows.is_empty() {
        debug!(path = ?path, "No new basins to add");
        return Ok(0);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let current = match fs::read(path) {
        Ok(current) => current,
        Err(error) if error.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(source) => return Err(io_error(source)),
    };
    // an empty or all-whitespace ledger is rewritten so the header lands on the first line
    let fresh = current.iter().all(u8::is_ascii_whitespace);
    let mut buffer = String::new();

    if fresh {
        buffer.push_str(HEADER);
        buffer.push('\n');
    } else if current.last() != Some(&b'\n') {
        buffer.push('\n');
    }

    for (id, count) in &rows {
        buffer.push_str(&format!("{id},{count}\n"));
    }

    let mut options = OpenOptions::new();
    if fresh {
        options.write(true).create(true).truncate(true);
    } else {
        options.append(true);
    }
    let mut file = options.open(path).map_err(io_error)?;

    file.write_all(buffer.as_bytes()).map_err(io_error)?;
    file.sync_data().map_err(io_error)?;

    info!("Added {} new basin(s) to {}", rows.len(), path.display());

    Ok(rows.len())
}

/// Ledger of one output tree, writes are serialized through the lock
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    lock: FairMutex<()>,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: FairMutex::new(()),
        }
    }

    pub fn load_passed(&self) -> Result<BTreeSet<String>, RegistryError> {
        let _guard = self.lock.lock();

        load_passed(&self.path)
    }

    pub fn record_passed(&self, new_entries: &[(String, u32)]) -> Result<usize, RegistryError> {
        let _guard = self.lock.lock();

        record_passed(&self.path, new_entries)
    }
}
