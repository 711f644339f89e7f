use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use log::{info, LevelFilter};
use simplelog::{ColorChoice, SimpleLogger, TermLogger, TerminalMode};

mod coverage;
mod errors;
mod profiles;
mod utils;

use crate::errors::Result;

/// Developer task selected by the first command line argument.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Task {
    Coverage,
    ProfileTests,
}

impl Task {
    const ALL: [(Self, &'static str, &'static str); 2] = [
        (
            Self::Coverage,
            "coverage",
            "collect code coverage of the library tests",
        ),
        (
            Self::ProfileTests,
            "profile-tests",
            "load the test profiles, then run the library tests under them",
        ),
    ];

    fn from_arg(arg: &OsString) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_task, name, _help)| arg == name)
            .map(|&(task, _name, _help)| task)
    }
}

pub(crate) struct Config {
    /// Arguments following the task name, passed on to the test binaries.
    target_args: Vec<OsString>,
    workspace_dir: &'static Path,
    coverage_dir: PathBuf,
    coverage_profdata: PathBuf,
    profiles_dir: PathBuf,
}

impl Config {
    fn new(target_args: Vec<OsString>) -> Self {
        // The xtask crate is a direct child of the workspace root.
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let workspace_dir = manifest_dir.parent().unwrap_or(manifest_dir);

        let target_dir = workspace_dir.join("target");
        let coverage_dir = target_dir.join("coverage");

        Self {
            target_args,
            workspace_dir,
            coverage_profdata: coverage_dir.join("coverage.profdata"),
            coverage_dir,
            profiles_dir: target_dir.join("apparmor-profiles"),
        }
    }
}

fn init_logging() -> Result<()> {
    let config = simplelog::Config::default();
    let level = LevelFilter::Debug;

    TermLogger::init(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto)
        .or_else(|_err| SimpleLogger::init(level, config))
        .map_err(Into::into)
}

fn usage() {
    eprintln!("Usage: cargo xtask <task> [arguments passed to the tests...]");
    eprintln!("Tasks:");
    for (_task, name, help) in &Task::ALL {
        eprintln!("    {:<16}{}.", name, help);
    }
}

fn main() -> Result<()> {
    let mut args = env::args_os().skip(1);
    let task = match args.next().as_ref().and_then(Task::from_arg) {
        Some(task) => task,
        None => {
            usage();
            return Ok(());
        }
    };

    init_logging()?;
    let config = Config::new(args.collect());

    match task {
        Task::Coverage => coverage::coverage(&config)?,
        Task::ProfileTests => profiles::profile_tests(&config)?,
    }

    info!("Done.");
    Ok(())
}
