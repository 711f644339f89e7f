use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::{fs, io, process};

use log::{debug, info};

use crate::errors::{Error, Result};
use crate::Config;

pub(crate) fn run_cmd(mut cmd: process::Command, name: &str) -> Result<()> {
    debug!("Running: {:?}", &cmd);

    let status = cmd
        .status()
        .map_err(|err| Error::from_io("std::process::Command::status()", err))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::command_failed(name))
    }
}

pub(crate) fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let read_dir_err = |err| Error::from_io_path("std::fs::read_dir()", dir, err);

    let mut result = Vec::with_capacity(16);
    for r_entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = r_entry.map_err(read_dir_err)?;
        let file_type = entry.file_type().map_err(read_dir_err)?;
        let file_name = PathBuf::from(entry.file_name());
        if file_type.is_file() && file_name.extension() == Some(OsStr::new(extension)) {
            result.push(entry.path());
        }
    }
    Ok(result)
}

pub(crate) fn find_executable_file(dir: &Path, file_name: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == file_name)
        .find(|e| {
            e.metadata()
                .map_or(false, |m| m.permissions().mode() & 0o111 != 0)
        })
        .map(walkdir::DirEntry::into_path)
        .ok_or_else(|| {
            let err = io::ErrorKind::NotFound.into();
            Error::from_io_path("walkdir::WalkDir::new()", dir.join(file_name), err)
        })
}

#[cfg(unix)]
pub(crate) fn pathbuf_from_vec(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(OsString::from_vec(bytes))
}

#[derive(Debug, serde_derive::Deserialize)]
struct CargoTestMessageTarget {
    name: String,
}

#[derive(Debug, serde_derive::Deserialize)]
struct CargoTestMessageProfile {
    test: bool,
}

#[derive(Debug, serde_derive::Deserialize)]
struct CargoTestMessage {
    target: CargoTestMessageTarget,
    profile: CargoTestMessageProfile,
    filenames: Vec<PathBuf>,
}

/// Build test binaries without running them, and return their paths.
///
/// Only binaries of targets named `target_name` are returned, unless it is
/// empty.
pub(crate) fn build_test_binaries(
    config: &Config,
    cargo: &mut process::Command,
    target_name: &str,
) -> Result<Vec<PathBuf>> {
    cargo
        .current_dir(config.workspace_dir)
        .stdout(process::Stdio::piped())
        .args(["--no-run", "--message-format=json"]);

    debug!("Running: {:?}", cargo);
    let output = cargo
        .spawn()
        .and_then(process::Child::wait_with_output)
        .map_err(|err| Error::from_io("std::process::Command::spawn()", err))?;

    if output.status.success() {
        Ok(test_binaries_from_cargo_test_messages(&output.stdout, target_name))
    } else {
        Err(Error::command_failed("cargo"))
    }
}

fn test_binaries_from_cargo_test_messages(bytes: &[u8], target_name: &str) -> Vec<PathBuf> {
    bytes
        .split(|&c| c == b'\r' || c == b'\n')
        .filter_map(|line| serde_json::from_slice::<CargoTestMessage>(line).ok())
        .filter(|obj| obj.profile.test)
        .filter(|obj| target_name.is_empty() || obj.target.name == target_name)
        .flat_map(|obj| obj.filenames)
        .collect()
}

pub(crate) fn cargo_command(config: &Config, args: &[&str]) -> Result<()> {
    info!("cargo '{}'...", args.join("' '"));

    let mut cmd = process::Command::new(env!("CARGO"));
    cmd.current_dir(config.workspace_dir)
        .env("RUST_BACKTRACE", "1")
        .args(args);
    run_cmd(cmd, "cargo")
}

pub(crate) fn rustup(args: &[&str]) -> Result<()> {
    let mut cmd = process::Command::new("rustup");
    cmd.args(args);
    run_cmd(cmd, "rustup")
}
