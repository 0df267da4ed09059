pub mod geopackage;
pub mod ledger;

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use ledger::Ledger;

/// catchment descriptors relative to the input root: `<basin>/data/<name>.gpkg`
static DESCRIPTOR_GLOB: Lazy<GlobMatcher> = Lazy::new(|| {
    GlobBuilder::new("*/data/*.gpkg")
        .literal_separator(true)
        .build()
        .expect("static descriptor glob is valid")
        .compile_matcher()
});

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No basins with a catchment descriptor found under {0:?}")]
    NoBasinsFound(PathBuf),
    #[error("Failed to access ledger {path:?}: {source}")]
    Ledger { path: PathBuf, source: io::Error },
    #[error("Malformed ledger {path:?} at line {line}: {reason}")]
    MalformedLedger {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// One independent catchment, immutable once discovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basin {
    pub id: String,
    pub num_divides: u32,
    pub input_dir: PathBuf,
    pub geopackage: PathBuf,
}

/// Lifecycle of a basin within one invocation, it only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Discovered,
    ConfigGenerated,
    Running,
    Completed,
    Validated,
}

impl Lifecycle {
    /// move to `next` if it lies ahead, returns false for attempted regressions
    pub fn advance(&mut self, next: Lifecycle) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            next == *self
        }
    }
}

/// Scan `input_root` for basins and read their catchment counts.
///
/// With a non-empty `filter_ids` only basins whose descriptor name contains one of the ids
/// are kept. Basins come back ordered by id, which is the dispatch order.
#[instrument(skip(filter_ids), level = "info")]
pub fn discover(input_root: &Path, filter_ids: &[String]) -> Result<Vec<Basin>, RegistryError> {
    let mut descriptors: BTreeMap<String, PathBuf> = BTreeMap::new();

    let walker = WalkBuilder::new(input_root)
        .standard_filters(false)
        .max_depth(Some(3))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(error = ?error, "Failed to search input directory");
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(input_root) else {
            continue;
        };

        if !DESCRIPTOR_GLOB.is_match(relative) || !entry.path().is_file() {
            continue;
        }

        if let Some(basin_id) = relative
            .components()
            .next()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
        {
            descriptors
                .entry(basin_id)
                .or_insert_with(|| entry.into_path());
        }
    }

    if !filter_ids.is_empty() {
        descriptors.retain(|_, descriptor| {
            let stem = descriptor
                .file_stem()
                .map(|stem| stem.to_string_lossy())
                .unwrap_or_default();

            filter_ids.iter().any(|id| stem.contains(id.as_str()))
        });
    }

    let basins = descriptors
        .into_iter()
        .filter_map(|(id, descriptor)| match geopackage::count_divides(&descriptor) {
            Ok(0) => {
                warn!(basin = %id, path = ?descriptor, "Descriptor has no divides, skipping basin");
                None
            }
            Ok(num_divides) => {
                debug!(basin = %id, num_divides, "Discovered basin");
                Some(Basin {
                    input_dir: input_root.join(&id),
                    id,
                    num_divides,
                    geopackage: descriptor,
                })
            }
            Err(error) => {
                warn!(basin = %id, path = ?descriptor, error = ?error, "Failed to read descriptor, skipping basin: {error}");
                None
            }
        })
        .collect_vec();

    if basins.is_empty() {
        return Err(RegistryError::NoBasinsFound(input_root.to_path_buf()));
    }

    info!("Discovered {} basin(s) under {}", basins.len(), input_root.display());

    Ok(basins)
}

/// basins recorded in the ledger, in discovery order
pub fn eligible<'a>(basins: &'a [Basin], passed: &BTreeSet<String>) -> Vec<&'a Basin> {
    basins
        .iter()
        .filter(|basin| passed.contains(&basin.id))
        .collect()
}
