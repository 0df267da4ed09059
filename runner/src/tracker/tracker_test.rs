use super::*;
use std::path::Path;

fn layout(root: &Path) -> ExperimentLayout {
    ExperimentLayout::new(None, root.to_path_buf(), Path::new("exp_info"))
}

fn write_calib_config(paths: &BasinPaths, iterations: u32) {
    fs::create_dir_all(paths.configs_dir()).unwrap();
    fs::write(
        paths.calib_config(),
        format!("general:\n  strategy: estimation\n  iterations: {iterations}\n"),
    )
    .unwrap();
}

fn write_checkpoint(paths: &BasinPaths, content: &str) -> PathBuf {
    let worker = paths.output_dir().join("202401010000_worker");
    fs::create_dir_all(&worker).unwrap();
    let path = worker.join(CHECKPOINT_FILE);
    fs::write(&path, content).unwrap();

    path
}

#[test]
pub fn absent_checkpoint_means_iteration_zero() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    write_calib_config(&layout.basin("01"), 10);

    let tracker = IterationTracker::new(&layout);
    let checkpoint = tracker.progress("01").unwrap();

    assert_eq!(checkpoint.progress, Progress::new(0, 10));
    assert_eq!(checkpoint.artifact, None);
}

#[test]
pub fn checkpoint_value_is_last_completed_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    let paths = layout.basin("01");
    write_calib_config(&paths, 10);
    let artifact = write_checkpoint(&paths, "3\n0.25\n1.7\n");

    let tracker = IterationTracker::new(&layout);
    let first = tracker.progress("01").unwrap();
    let second = tracker.progress("01").unwrap();

    assert_eq!(first.progress, Progress::new(4, 10));
    assert_eq!(first.artifact, Some(artifact));
    assert_eq!(first, second);

    write_checkpoint(&paths, "7\n");
    assert_eq!(tracker.progress("01").unwrap().progress, Progress::new(8, 10));
}

#[test]
pub fn missing_calibration_config_means_no_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    let tracker = IterationTracker::new(&layout);

    assert_eq!(tracker.progress("01").unwrap().progress, Progress::new(0, 0));

    // generated later in the same invocation
    write_calib_config(&layout.basin("01"), 5);
    assert_eq!(tracker.progress("01").unwrap().progress, Progress::new(0, 5));
}

#[test]
pub fn metadata_output_directory_wins() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(&dir.path().join("tree"));
    let elsewhere = BasinPaths::new(dir.path().join("elsewhere").join("01"));
    write_calib_config(&elsewhere, 6);
    write_checkpoint(&elsewhere, "1");
    ExperimentMeta {
        basin_id: "01".into(),
        input_dir: dir.path().join("in"),
        output_dir: elsewhere.output_dir().to_path_buf(),
        cwd: elsewhere.output_dir().to_path_buf(),
        num_cpus: None,
    }
    .write_once(&layout.meta_path("01"))
    .unwrap();

    let tracker = IterationTracker::new(&layout);

    assert_eq!(tracker.progress("01").unwrap().progress, Progress::new(2, 6));
}

#[test]
pub fn validation_artifact_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    let paths = layout.basin("01");
    let tracker = IterationTracker::new(&layout);

    assert!(!tracker.has_validation("01").unwrap());

    let output = paths
        .output_dir()
        .join("202401010000_worker")
        .join(VALIDATION_DIR);
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join("sim_obs_calibration.csv"), "").unwrap();
    assert!(!tracker.has_validation("01").unwrap());

    fs::write(output.join(VALIDATION_FILE), "time,sim,obs\n").unwrap();
    assert!(tracker.has_validation("01").unwrap());
}

#[test]
pub fn malformed_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    write_checkpoint(&layout.basin("01"), "iteration\n");

    let tracker = IterationTracker::new(&layout);

    assert!(matches!(
        tracker.progress("01"),
        Err(TrackerError::MalformedCheckpoint { value, .. }) if value == "iteration"
    ));
}

#[test]
pub fn checkpoint_parsing() {
    assert_eq!(parse_checkpoint("3"), Ok(Some(3)));
    assert_eq!(parse_checkpoint("  12,0.5,0.25\n"), Ok(Some(12)));
    assert_eq!(parse_checkpoint("4.0\n"), Ok(Some(4)));
    assert_eq!(parse_checkpoint("\n\n"), Ok(None));
    assert_eq!(parse_checkpoint("-1"), Err("-1".to_owned()));
    assert_eq!(parse_checkpoint("2.5"), Err("2.5".to_owned()));
}
