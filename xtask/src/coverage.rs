use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;

use log::{debug, info};

use crate::errors::{Error, Result};
use crate::utils::*;
use crate::Config;

// https://doc.rust-lang.org/rustc/instrument-coverage.html

const COVERAGE_ENV: [(&str, &str); 4] = [
    ("RUST_BACKTRACE", "1"),
    ("CARGO_INCREMENTAL", "0"),
    ("RUSTFLAGS", "-Cinstrument-coverage"),
    ("RUSTDOCFLAGS", "-Cinstrument-coverage"),
];

pub(crate) fn coverage(config: &Config) -> Result<()> {
    let coverage_dir = config.coverage_dir.to_str().ok_or_else(|| {
        let err = std::io::ErrorKind::InvalidData.into();
        Error::from_io_path("std::path::Path::to_str()", &config.coverage_dir, err)
    })?;

    let llvm_cov_common_args: [&str; 8] = [
        "--Xdemangler",
        "rustfilt",
        "--ignore-filename-regex",
        r#"/\.cargo/registry/"#,
        "--ignore-filename-regex",
        r#"/rustc/"#,
        "--ignore-filename-regex",
        &format!("^{}/|/xtask/|/tests.rs$", coverage_dir),
    ];

    rustfilt_version(config)?;

    let sys_root = sys_root_of_toolchain(config)?;

    let mut result = find_executable_file(&sys_root, "llvm-profdata");
    if result.is_err() {
        info!("Installing component 'llvm-tools-preview'...");
        rustup(&["--quiet", "component", "add", "llvm-tools-preview"])?;

        result = find_executable_file(&sys_root, "llvm-profdata");
    }
    let llvm_profdata = result?;
    let llvm_cov = find_executable_file(&sys_root, "llvm-cov")?;

    fs::create_dir_all(&config.coverage_dir).map_err(|err| {
        Error::from_io_path("std::fs::create_dir_all()", &config.coverage_dir, err)
    })?;

    info!("Cleaning up old coverage files...");
    for path in list_files(&config.coverage_dir, "profraw")? {
        let _ignored = fs::remove_file(&path);
    }

    info!("Building coverage binaries...");
    let mut cmd = coverage_cargo_test(config, coverage_dir);
    cmd.env("LLVM_PROFILE_FILE", "/dev/null");
    let tests_paths = build_test_binaries(config, &mut cmd, "")?;

    info!("Running coverage binaries...");
    let mut cmd = coverage_cargo_test(config, coverage_dir);
    cmd.env("LLVM_PROFILE_FILE", config.coverage_dir.join("%m.profraw"))
        .args(&config.target_args);
    run_cmd(cmd, "cargo")?;

    merge_coverage_profraw_files(config, &llvm_profdata)?;

    export_coverage_lcov(config, &llvm_cov, &llvm_cov_common_args, &tests_paths)?;
    export_coverage_html(config, &llvm_cov, &llvm_cov_common_args, &tests_paths)
}

fn coverage_cargo_test(config: &Config, coverage_dir: &str) -> process::Command {
    let mut cmd = process::Command::new(env!("CARGO"));
    cmd.current_dir(config.workspace_dir)
        .envs(COVERAGE_ENV.iter().map(|&(k, v)| (k, OsStr::new(v))))
        .args(["test", "--package", "apparmor", "--tests"])
        .args(["--target-dir", coverage_dir]);
    cmd
}

fn rustfilt_version(config: &Config) -> Result<()> {
    let mut cmd = process::Command::new("rustfilt");
    cmd.stdout(process::Stdio::null()).arg("--version");

    let mut result = run_cmd(cmd, "rustfilt");
    if result.is_err() {
        info!("Installing 'rustfilt'...");
        cargo_command(config, &["--quiet", "install", "rustfilt"])?;

        let mut cmd = process::Command::new("rustfilt");
        cmd.stdout(process::Stdio::null()).arg("--version");
        result = run_cmd(cmd, "rustfilt");
    }
    result
}

fn merge_coverage_profraw_files(config: &Config, llvm_profdata: &Path) -> Result<()> {
    info!("Merging coverage data...");

    let profraw_files = list_files(&config.coverage_dir, "profraw")?;

    let mut cmd = process::Command::new(llvm_profdata);
    cmd.args(["merge", "--sparse", "--output"])
        .arg(&config.coverage_profdata)
        .args(&profraw_files);
    run_cmd(cmd, "llvm-profdata")
}

fn export_coverage_lcov(
    config: &Config,
    llvm_cov: &Path,
    llvm_cov_common_args: &[&str],
    tests_paths: &[PathBuf],
) -> Result<()> {
    info!("Exporting coverage LCOV...");

    let lcov_path = config.coverage_dir.join("lcov.info");
    let lcov_info = File::create(&lcov_path)
        .map_err(|err| Error::from_io_path("std::fs::File::create()", &lcov_path, err))?;

    let mut cmd = process::Command::new(llvm_cov);
    cmd.stdout(lcov_info)
        .args(["export", "--format", "lcov"])
        .args(llvm_cov_common_args)
        .arg("--instr-profile")
        .arg(&config.coverage_profdata);
    for path in tests_paths {
        cmd.arg("--object").arg(path);
    }
    run_cmd(cmd, "llvm-cov")
}

fn export_coverage_html(
    config: &Config,
    llvm_cov: &Path,
    llvm_cov_common_args: &[&str],
    tests_paths: &[PathBuf],
) -> Result<()> {
    info!("Exporting coverage HTML...");

    let mut cmd = process::Command::new(llvm_cov);
    cmd.args(["show", "--format", "html"])
        .args(["--show-line-counts-or-regions", "--show-instantiations"])
        .args(llvm_cov_common_args)
        .arg("--instr-profile")
        .arg(&config.coverage_profdata)
        .arg("--output-dir")
        .arg(&config.coverage_dir);
    for path in tests_paths {
        cmd.arg("--object").arg(path);
    }
    run_cmd(cmd, "llvm-cov")
}

fn sys_root_of_toolchain(config: &Config) -> Result<PathBuf> {
    let mut cmd = process::Command::new("rustc");
    cmd.current_dir(config.workspace_dir)
        .stdout(process::Stdio::piped())
        .args(["--print", "sysroot"]);

    debug!("Running: {:?}", cmd);
    let output = cmd
        .spawn()
        .and_then(process::Child::wait_with_output)
        .map_err(|err| Error::from_io("std::process::Command::spawn()", err))?;
    if !output.status.success() {
        return Err(Error::command_failed("rustc"));
    }

    let mut bytes = output.stdout;
    if let Some(line_len) = bytes
        .split(|&c| c == b'\n' || c == b'\r')
        .next()
        .map(<[u8]>::len)
    {
        bytes.truncate(line_len); // Keep only the first line.
    }

    Ok(pathbuf_from_vec(bytes))
}
