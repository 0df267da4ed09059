use super::*;
use crate::{command::CommandTemplate, config::ExecutorConfig};
use std::{fs, os::unix::fs::PermissionsExt, path::Path};

const DRIVER_ARGS: &str = "\"driver\", \"{config}\", \"{output_dir}\", \"{stage}\", \"{basin_id}\"";

/// config with a calibration driver running `script`, $1 config, $2 output dir, $3 stage, $4 id
fn config(root: &Path, task: &str, wallclock: &str, script: &str, basins_in_par: usize) -> SandboxConfig {
    let content = format!(
        "
general:
  input_dir: inputs
  output_dir: outputs
formulation:
  ngen_dir: /opt/ngen
  basins_in_par: {basins_in_par}
simulation:
  task_type: {task}
launcher:
  wallclock: {wallclock}
  buffer: 0
  poll_interval: 50ms
  grace_period: 300ms
  resubmit:
    mode: never
tools:
  calibration: [\"sh\", \"-c\", {script:?}, {DRIVER_ARGS}]
  validation: [\"sh\", \"-c\", {script:?}, {DRIVER_ARGS}]
"
    );

    SandboxConfig::parse(&content, root).unwrap()
}

fn basin(config: &SandboxConfig, id: &str) -> Basin {
    let input_dir = config.general.input_dir.join(id);

    Basin {
        id: id.into(),
        num_divides: 4,
        geopackage: input_dir.join("data").join(format!("{id}.gpkg")),
        input_dir,
    }
}

/// record the basin as generated with `iterations` configured and an optional checkpoint
fn prepare(layout: &ExperimentLayout, id: &str, iterations: u32, checkpoint: Option<&str>) {
    let paths = layout.basin(id);
    fs::create_dir_all(paths.configs_dir()).unwrap();
    fs::write(
        paths.calib_config(),
        format!("general:\n  iterations: {iterations}\n"),
    )
    .unwrap();

    if let Some(checkpoint) = checkpoint {
        let worker = paths.output_dir().join("calib_worker");
        fs::create_dir_all(&worker).unwrap();
        fs::write(worker.join("best_params.txt"), checkpoint).unwrap();
    }

    Ledger::new(layout.ledger_path())
        .record_passed(&[(id.to_owned(), 4)])
        .unwrap();
}

fn supervise(config: &SandboxConfig, basins: &[Basin]) -> Supervision {
    let layouts = ExperimentLayout::for_config(config);

    WallclockSupervisor::new(config, Phase::Run, false)
        .supervise(basins, &layouts)
        .unwrap()
}

#[test]
pub fn deadline_terminates_gracefully_before_killing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "calibration", "1s", "sleep 30", 2);
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "01", 10, None);
    let start = Instant::now();

    let supervision = supervise(&config, &[basin(&config, "01")]);

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(
        supervision.outcome,
        Outcome::NotResubmitted {
            incomplete: vec!["01".into()]
        }
    );

    let record = &supervision.records[0];
    assert_eq!(
        record.history(),
        [
            JobState::Pending,
            JobState::Running,
            JobState::GraceTerminating,
            JobState::Terminated
        ]
    );
    assert!(!record.forced());
}

#[test]
pub fn jobs_ignoring_sigterm_are_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "calibration",
        "500ms",
        "trap '' TERM; while true; do sleep 1; done",
        1,
    );
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "01", 10, Some("2\n"));

    let supervision = supervise(&config, &[basin(&config, "01")]);

    let record = &supervision.records[0];
    assert_eq!(record.state(), JobState::Terminated);
    assert!(record.history().contains(&JobState::GraceTerminating));
    assert!(record.forced());
    // termination leaves the checkpoint alone
    assert_eq!(
        fs::read_to_string(layout.basin("01").output_dir().join("calib_worker/best_params.txt"))
            .unwrap(),
        "2\n"
    );
}

#[test]
pub fn checkpointed_basins_restart_instead_of_calibrating() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "calibration",
        "30s",
        "echo \"$3\" > \"$2/stage.txt\"; echo 9 > \"$2/calib_worker/best_params.txt\"",
        2,
    );
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "01", 10, Some("3"));

    let supervision = supervise(&config, &[basin(&config, "01")]);

    assert_eq!(supervision.outcome, Outcome::Complete);
    assert_eq!(supervision.records[0].stage, Some(Stage::Restart));
    assert_eq!(supervision.records[0].state(), JobState::Completed);
    assert_eq!(supervision.records[0].lifecycle, Lifecycle::Completed);
    assert_eq!(
        fs::read_to_string(layout.basin("01").output_dir().join("stage.txt")).unwrap(),
        "restart\n"
    );
    assert!(layout.basin("01").restart_config().is_file());
}

#[test]
pub fn no_progress_without_deadline_is_a_stall() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "calibration", "30s", "exit 0", 2);
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "01", 10, None);

    let supervision = supervise(&config, &[basin(&config, "01")]);

    assert_eq!(
        supervision.outcome,
        Outcome::Stalled {
            incomplete: vec!["01".into()]
        }
    );
    assert_eq!(supervision.records[0].stage, Some(Stage::Calibrate));
}

#[test]
pub fn validated_basins_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "calibvalid", "30s", "exit 1", 2);
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "done", 10, Some("9"));
    let validation = layout
        .basin("done")
        .output_dir()
        .join("calib_worker/output_sim_obs");
    fs::create_dir_all(&validation).unwrap();
    fs::write(validation.join("sim_obs_validation.csv"), "time,sim,obs\n").unwrap();
    // discovered but never generated, not part of the workload
    let basins = [basin(&config, "done"), basin(&config, "fresh")];

    let supervision = supervise(&config, &basins);

    assert_eq!(supervision.outcome, Outcome::Complete);
    assert_eq!(supervision.records.len(), 1);
    assert_eq!(supervision.records[0].state(), JobState::Skipped);
    assert_eq!(supervision.records[0].lifecycle, Lifecycle::Validated);
}

#[test]
pub fn dispatch_follows_discovery_order_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "calibration",
        "30s",
        "echo \"$4\" >> \"$2/../order.txt\"; sleep 0.2; echo 9 > \"$2/calib_worker/best_params.txt\"",
        1,
    );
    let layout = &ExperimentLayout::for_config(&config)[0];
    for id in ["a", "b", "c"] {
        prepare(layout, id, 10, Some("0"));
    }
    let basins = [basin(&config, "a"), basin(&config, "b"), basin(&config, "c")];

    let supervision = supervise(&config, &basins);

    assert_eq!(supervision.outcome, Outcome::Complete);
    assert_eq!(
        fs::read_to_string(layout.root().join("order.txt")).unwrap(),
        "a\nb\nc\n"
    );
}

#[test]
pub fn failed_dispatch_stays_basin_local() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(
        dir.path(),
        "calibration",
        "30s",
        "echo 9 > \"$2/calib_worker/best_params.txt\"",
        2,
    );
    config.formulation.np_per_basin = 2;
    config.tools.partitioner = CommandTemplate::new(["sh", "-c", "exit 1"]);
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "good", 10, Some("1"));
    prepare(layout, "large", 10, Some("1"));
    // a single divide needs no partition, forty need one that cannot be generated
    let good = Basin {
        num_divides: 1,
        ..basin(&config, "good")
    };
    let large = Basin {
        num_divides: 40,
        ..basin(&config, "large")
    };

    let supervision = supervise(&config, &[good, large]);

    let states: Vec<JobState> = supervision.records.iter().map(JobRecord::state).collect();
    assert_eq!(states, vec![JobState::Completed, JobState::Failed]);
    assert_eq!(
        supervision.outcome,
        Outcome::NotResubmitted {
            incomplete: vec!["large".into()]
        }
    );
}

#[test]
pub fn empty_ledger_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "calibration", "30s", "exit 0", 1);
    let layouts = ExperimentLayout::for_config(&config);

    assert!(matches!(
        WallclockSupervisor::new(&config, Phase::Run, false)
            .supervise(&[basin(&config, "01")], &layouts),
        Err(SupervisorError::NoEligibleBasins(_))
    ));
}

fn fake_sbatch(path: &Path, body: &str) -> String {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();

    path.to_string_lossy().into_owned()
}

#[test]
pub fn queued_work_resubmits_the_launcher_after_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "calibration", "30s", "exit 0", 2);
    let counter = dir.path().join("next_id");
    let launcher_args = dir.path().join("launcher_args.txt");
    config.executor = ExecutorConfig::Slurm {
        script: dir.path().join("run_basin.slurm"),
        sbatch: fake_sbatch(
            &dir.path().join("sbatch_jobs"),
            &format!(
                "n=$(cat {0:?} 2>/dev/null || echo 100); n=$((n+1)); echo $n > {0:?}; echo \"$n;cluster\"",
                counter
            ),
        ),
        extra_args: Vec::new(),
    };
    config.launcher.resubmit = ResubmitConfig::Sbatch {
        script: dir.path().join("launcher.slurm"),
        sbatch: fake_sbatch(
            &dir.path().join("sbatch_launcher"),
            &format!("echo \"$@\" > {launcher_args:?}; echo 900"),
        ),
    };
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "a", 10, None);
    prepare(layout, "b", 10, Some("4"));
    let layouts = ExperimentLayout::for_config(&config);

    let supervision = WallclockSupervisor::new(&config, Phase::Run, true)
        .supervise(&[basin(&config, "a"), basin(&config, "b")], &layouts)
        .unwrap();

    let states: Vec<JobState> = supervision.records.iter().map(JobRecord::state).collect();
    assert_eq!(states, vec![JobState::Submitted, JobState::Submitted]);
    assert_eq!(
        supervision.outcome,
        Outcome::Resubmitted {
            incomplete: vec!["a".into(), "b".into()],
            submission: SubmissionId::parse("900").unwrap(),
        }
    );
    let args = fs::read_to_string(launcher_args).unwrap();
    assert!(args.starts_with("--parsable --dependency=afterany:101:102 "));
    assert!(args.contains("launcher.slurm"));
}

#[test]
pub fn partition_generation_never_outlasts_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "calibration", "1s", "sleep 30", 2);
    config.formulation.np_per_basin = 2;
    config.tools.partitioner = CommandTemplate::new(["sleep", "5"]);
    let layout = &ExperimentLayout::for_config(&config)[0];
    prepare(layout, "a", 10, None);
    prepare(layout, "b", 10, None);
    let a = Basin {
        num_divides: 1,
        ..basin(&config, "a")
    };
    let b = Basin {
        num_divides: 40,
        ..basin(&config, "b")
    };
    let start = Instant::now();

    let supervision = supervise(&config, &[a, b]);

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(supervision.records[0].state(), JobState::Terminated);
    // b was still waiting for its partition, it never started
    assert_eq!(supervision.records[1].history(), [JobState::Pending]);
    assert_eq!(
        supervision.outcome,
        Outcome::NotResubmitted {
            incomplete: vec!["a".into(), "b".into()]
        }
    );
}

#[test]
pub fn unpollable_jobs_fail() {
    let mut record = JobRecord::new("01".into(), 0, Some(Stage::Calibrate));
    record.transition(JobState::Running).unwrap();

    settle(&mut record, Err(io::Error::new(io::ErrorKind::Other, "no child"))).unwrap();

    assert_eq!(record.state(), JobState::Failed);
}

#[test]
pub fn mapped_gages_only_run_their_formulations() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "calibration", "30s", "exit 0", 4);
    config.formulation.groups = [
        ("base".to_owned(), vec!["CFE, T-route".to_owned()]),
        ("snow".to_owned(), vec!["NOM, CFE, T-route".to_owned()]),
    ]
    .into();
    config.formulation.mapping = [
        ("a".to_owned(), vec!["base".to_owned(), "snow".to_owned()]),
        ("b".to_owned(), vec!["base".to_owned()]),
    ]
    .into();
    let layouts = ExperimentLayout::for_config(&config);
    for layout in &layouts {
        prepare(layout, "a", 10, None);
        prepare(layout, "b", 10, None);
    }

    let supervision = supervise(&config, &[basin(&config, "a"), basin(&config, "b")]);

    let jobs: Vec<(&str, usize)> = supervision
        .records
        .iter()
        .map(|record| (record.basin_id.as_str(), record.layout))
        .collect();
    assert_eq!(jobs, vec![("a", 0), ("b", 0), ("a", 1)]);
    assert_eq!(
        supervision.outcome,
        Outcome::Stalled {
            incomplete: vec!["cfe/a".into(), "cfe/b".into(), "nom_cfe/a".into()]
        }
    );
}
