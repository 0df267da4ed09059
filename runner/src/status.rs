use crate::{
    layout::ExperimentLayout,
    registry::Basin,
    tracker::IterationTracker,
};
use itertools::Itertools;
use std::io::{self, Write};
use thiserror::Error;
use tracing::warn;

const HEADER: [&str; 4] = ["Gage", "Formulation", "Calib (cur/max)", "Validation"];

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Failed to write status report: {0}")]
    Write(#[from] io::Error),
}

/// one row per basin and formulation
pub fn rows(basins: &[Basin], layouts: &[ExperimentLayout]) -> Vec<[String; 4]> {
    let mut rows = Vec::with_capacity(basins.len() * layouts.len());

    for layout in layouts {
        let tracker = IterationTracker::new(layout);
        let model = layout.model().unwrap_or("-").to_owned();

        for basin in basins.iter().filter(|basin| layout.includes(&basin.id)) {
            let progress = tracker.progress(&basin.id).map(|checkpoint| checkpoint.progress);
            let validated = tracker.has_validation(&basin.id);

            let (progress, validated) = match (progress, validated) {
                (Ok(progress), Ok(validated)) => (
                    progress.to_string(),
                    if validated { "YES" } else { "NO" }.to_owned(),
                ),
                (Err(error), _) | (_, Err(error)) => {
                    warn!(basin = %basin.id, error = ?error, "Failed to read progress: {error}");
                    ("?".to_owned(), "?".to_owned())
                }
            };

            rows.push([basin.id.clone(), model.clone(), progress, validated]);
        }
    }

    rows
}

/// write the status table, columns padded to their widest cell
pub fn report<W: Write>(
    out: &mut W,
    basins: &[Basin],
    layouts: &[ExperimentLayout],
) -> Result<(), StatusError> {
    let rows = rows(basins, layouts);
    let widths: Vec<usize> = (0..HEADER.len())
        .map(|column| {
            rows.iter()
                .map(|row| row[column].len())
                .chain([HEADER[column].len()])
                .max()
                .unwrap_or_default()
        })
        .collect();

    let format_row = |cells: &[&str]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .join("  ")
            .trim_end()
            .to_owned()
    };

    writeln!(out, "{}", format_row(&HEADER))?;
    writeln!(
        out,
        "{}",
        widths.iter().map(|width| "-".repeat(*width)).join("  ")
    )?;
    for row in &rows {
        writeln!(out, "{}", format_row(&row.iter().map(String::as_str).collect_vec()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::Path};

    #[test]
    fn reports_progress_per_basin_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let layouts = vec![
            ExperimentLayout::new(Some("CFE, T-route".into()), dir.path().join("cfe"), Path::new("exp_info")),
            ExperimentLayout::new(Some("NOM, CFE, T-route".into()), dir.path().join("nom_cfe"), Path::new("exp_info")),
        ];
        let basins = vec![Basin {
            id: "01123000".into(),
            num_divides: 5,
            input_dir: dir.path().join("in/01123000"),
            geopackage: dir.path().join("in/01123000/data/a.gpkg"),
        }];

        let paths = layouts[0].basin("01123000");
        fs::create_dir_all(paths.configs_dir()).unwrap();
        fs::write(paths.calib_config(), "general:\n  iterations: 100\n").unwrap();
        let validation = paths.output_dir().join("01123000_worker/output_sim_obs");
        fs::create_dir_all(&validation).unwrap();
        fs::write(validation.join("sim_obs_validation.csv"), "").unwrap();
        fs::write(
            paths.output_dir().join("01123000_worker/best_params.txt"),
            "41\n",
        )
        .unwrap();

        let mut out = Vec::new();
        report(&mut out, &basins, &layouts).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Gage"));
        assert!(lines[0].contains("Calib (cur/max)"));
        assert_eq!(
            lines[2].split_whitespace().collect_vec(),
            ["01123000", "CFE,", "T-route", "42/100", "YES"]
        );
        assert_eq!(
            lines[3].split_whitespace().collect_vec(),
            ["01123000", "NOM,", "CFE,", "T-route", "0/0", "NO"]
        );
    }
}
