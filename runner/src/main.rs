mod command;
mod config;
mod executors;
mod generate;
mod layout;
mod meta;
mod partition;
mod registry;
mod status;
mod supervisor;
mod tracker;

use clap::{Args, Parser, Subcommand};
use config::{ConfigErrors, Phase, SandboxConfig};
use layout::ExperimentLayout;
use registry::RegistryError;
use std::{io, path::PathBuf, process::ExitCode, time::Duration};
use supervisor::{Outcome, SupervisorError, WallclockSupervisor};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_FAILURE: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_EMPTY_WORKLOAD: u8 = 3;
const EXIT_MISSING_EXECUTABLE: u8 = 4;
const EXIT_STALLED: u8 = 5;

/// Orchestrates basin simulation and calibration jobs within a wallclock budget
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sandbox configuration file
    #[arg(short, long, default_value = "sandbox.yaml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace), RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate configs for new basins only
    Generate,
    /// Run the configured task for basins that passed config generation
    Run(RunArgs),
    /// Generate configs, then run
    All(RunArgs),
    /// Print calibration and validation progress of every basin
    Status,
    /// Remove the output trees
    Clean {
        /// Confirm removal
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Wallclock budget of this invocation, e.g. "7h 30m"
    #[arg(long, value_parser = humantime::parse_duration)]
    wallclock: Option<Duration>,

    /// Number of basins running side by side, 0 for one per cpu
    #[arg(long)]
    basins_in_par: Option<usize>,

    /// Do not resubmit the launcher for incomplete basins
    #[arg(long)]
    no_resubmit: bool,
}

impl Commands {
    fn phase(&self) -> Phase {
        match self {
            Self::Generate => Phase::Generate,
            Self::Run(_) => Phase::Run,
            Self::All(_) => Phase::All,
            Self::Status => Phase::Status,
            Self::Clean { .. } => Phase::Clean,
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// exit code of a failed preflight, missing executables only win if nothing else is wrong
fn config_exit_code(errors: &[ConfigErrors]) -> u8 {
    if errors
        .iter()
        .all(|error| matches!(error, ConfigErrors::MissingExecutable { .. }))
    {
        EXIT_MISSING_EXECUTABLE
    } else {
        EXIT_INVALID_CONFIG
    }
}

fn registry_exit_code(error: &RegistryError) -> u8 {
    match error {
        RegistryError::NoBasinsFound(_) => EXIT_EMPTY_WORKLOAD,
        _ => EXIT_FAILURE,
    }
}

fn supervisor_exit_code(error: &SupervisorError) -> u8 {
    match error {
        SupervisorError::Registry(error) => registry_exit_code(error),
        SupervisorError::NoEligibleBasins(_) => EXIT_EMPTY_WORKLOAD,
        _ => EXIT_FAILURE,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    ExitCode::from(run(cli))
}

fn run(cli: Cli) -> u8 {
    let mut config = match SandboxConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load {}: {error}", cli.config.display());
            return EXIT_INVALID_CONFIG;
        }
    };

    let phase = cli.command.phase();
    let mut resubmit = true;

    if let Commands::Run(args) | Commands::All(args) = &cli.command {
        if let Some(wallclock) = args.wallclock {
            config.launcher.wallclock = wallclock;
        }
        if let Some(basins_in_par) = args.basins_in_par {
            config.formulation.basins_in_par = basins_in_par;
        }
        resubmit = !args.no_resubmit;
    }

    if let Err(errors) = config.preflight_checks(phase) {
        error!("Found {} problem(s) in {}", errors.len(), cli.config.display());
        return config_exit_code(&errors);
    }

    let layouts = ExperimentLayout::for_config(&config);

    match cli.command {
        Commands::Clean { yes } => run_clean(&config, &layouts, yes),
        Commands::Status => run_status(&config, &layouts),
        Commands::Generate => run_generate(&config, &layouts),
        Commands::Run(_) | Commands::All(_) => {
            match WallclockSupervisor::new(&config, phase, resubmit).run() {
                Ok(supervision) => match supervision.outcome {
                    Outcome::Complete => 0,
                    Outcome::Resubmitted { submission, .. } => {
                        info!(submission = %submission, "Launcher resubmitted");
                        0
                    }
                    Outcome::NotResubmitted { .. } => 0,
                    Outcome::Stalled { .. } => EXIT_STALLED,
                },
                Err(error) => {
                    error!(error = ?error, "{error}");
                    supervisor_exit_code(&error)
                }
            }
        }
    }
}

fn discover(config: &SandboxConfig) -> Result<Vec<registry::Basin>, u8> {
    registry::discover(&config.general.input_dir, &config.simulation.gage_ids).map_err(|error| {
        error!(error = ?error, "{error}");
        registry_exit_code(&error)
    })
}

fn run_generate(config: &SandboxConfig, layouts: &[ExperimentLayout]) -> u8 {
    let basins = match discover(config) {
        Ok(basins) => basins,
        Err(code) => return code,
    };

    match generate::generate_pending(config, layouts, &basins) {
        Ok(_) => 0,
        Err(error) => {
            error!(error = ?error, "{error}");
            EXIT_FAILURE
        }
    }
}

fn run_status(config: &SandboxConfig, layouts: &[ExperimentLayout]) -> u8 {
    let basins = match discover(config) {
        Ok(basins) => basins,
        Err(code) => return code,
    };

    match status::report(&mut io::stdout().lock(), &basins, layouts) {
        Ok(()) => 0,
        Err(error) => {
            error!(error = ?error, "{error}");
            EXIT_FAILURE
        }
    }
}

fn run_clean(config: &SandboxConfig, layouts: &[ExperimentLayout], yes: bool) -> u8 {
    if !yes {
        warn!("Refusing to remove output trees without --yes");
        return EXIT_INVALID_CONFIG;
    }

    let mut code = 0;

    for layout in layouts {
        match layout.clean(&config.general.input_dir) {
            Ok(true) => info!("Removed {}", layout.root().display()),
            Ok(false) => info!("Nothing to remove at {}", layout.root().display()),
            Err(error) => {
                error!(error = ?error, "Failed to clean {}: {error}", layout.root().display());
                code = EXIT_FAILURE;
            }
        }
    }

    code
}
