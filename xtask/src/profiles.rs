use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use log::info;

use crate::errors::{Error, Result};
use crate::utils::*;
use crate::Config;

/// Profiles confining the library test binary.
///
/// The hats and transition targets are the ones the confined tests expect.
fn render_profiles(test_binaries: &[PathBuf]) -> String {
    const HARNESS_RULES: &str = "    file,\n    network,\n    unix,\n    signal,\n    capability,\n";

    let mut text = String::from("abi <abi/3.0>,\n\n");
    for (index, binary) in test_binaries.iter().enumerate() {
        let name = if index == 0 {
            "apparmor_test".to_owned()
        } else {
            format!("apparmor_test_{}", index)
        };

        let _ignored = write!(
            text,
            "profile {} \"{}\" {{\n{}\n    change_profile -> apparmor_test_target,\n    \
             change_profile -> example_profile,\n    change_profile -> example_peer_profile,\n\n    \
             ^hat_c {{\n{}    }}\n}}\n\n",
            name,
            binary.display(),
            HARNESS_RULES,
            HARNESS_RULES,
        );
    }

    for name in ["apparmor_test_target", "example_profile", "example_peer_profile"] {
        let _ignored = write!(text, "profile {} {{\n{}}}\n\n", name, HARNESS_RULES);
    }
    text
}

fn load_profiles(path: &Path) -> Result<()> {
    info!("Loading test profiles from '{}'...", path.display());

    let mut cmd = process::Command::new("apparmor_parser");
    cmd.arg("--replace").arg(path);
    run_cmd(cmd, "apparmor_parser")
}

/// Run the library tests confined by the test profiles.
///
/// Loading profiles needs administrative privileges.
pub(crate) fn profile_tests(config: &Config) -> Result<()> {
    info!("Building test binaries...");
    let mut cmd = process::Command::new(env!("CARGO"));
    cmd.args(["test", "--package", "apparmor", "--lib"]);
    let test_binaries = build_test_binaries(config, &mut cmd, "apparmor")?;
    if test_binaries.is_empty() {
        return Err(Error::NoTestBinary { package: "apparmor" });
    }

    fs::create_dir_all(&config.profiles_dir).map_err(|err| {
        Error::from_io_path("std::fs::create_dir_all()", &config.profiles_dir, err)
    })?;

    let profiles_path = config.profiles_dir.join("apparmor-tests");
    fs::write(&profiles_path, render_profiles(&test_binaries))
        .map_err(|err| Error::from_io_path("std::fs::write()", &profiles_path, err))?;
    load_profiles(&profiles_path)?;

    for binary in &test_binaries {
        info!("Running '{}'...", binary.display());

        let mut cmd = process::Command::new(binary);
        cmd.current_dir(config.workspace_dir)
            .env("RUST_BACKTRACE", "1")
            .env("APPARMOR_TEST_PROFILES", "1")
            .args(&config.target_args);
        run_cmd(cmd, "test binary")?;
    }
    Ok(())
}
