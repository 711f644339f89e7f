
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::{fs, io, ptr};

use crate::errors::{Error, Request, Result};
use crate::utils::*;

/// Directory holding the parameters of the AppArmor kernel module.
pub const MODULE_PARAMETERS_DIR: &str = "/sys/module/apparmor/parameters";

/// Parameter of the AppArmor kernel module.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ModuleParameter {
    /// AppArmor is enabled.
    Enabled,
    /// AppArmor is available in the running kernel.
    Available,
}

impl ModuleParameter {
    /// Return the name of the parameter file.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Available => "available",
        }
    }

    /// Return the path of the parameter file.
    #[must_use]
    pub fn path(self) -> PathBuf {
        Path::new(MODULE_PARAMETERS_DIR).join(self.name())
    }
}

/// Return whether a parameter of the AppArmor kernel module is set.
///
/// A parameter file that does not exist is reported as not set.
pub fn module_parameter(parameter: ModuleParameter) -> Result<bool> {
    let path = parameter.path();
    match fs::read(&path) {
        Ok(value) => Ok(value.first() == Some(&b'Y')),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::from_io_path("std::fs::read()", path, err)),
    }
}

/// Return the directory where the AppArmor interface file system is mounted.
///
/// See: `aa_find_mountpoint()`.
#[doc(alias = "aa_find_mountpoint")]
pub fn mount_point() -> Result<PathBuf> {
    crate::ensure_kernel_support("aa_find_mountpoint()")?;
    let aa_find_mountpoint = NativeFunctions::get().aa_find_mountpoint;

    let mut c_path: *mut c_char = ptr::null_mut();
    let r = ret_val_to_result(unsafe { aa_find_mountpoint(&mut c_path) });

    r.map_err(|err| Error::from_native("aa_find_mountpoint()", Request::Other, err))
        .and_then(|_| {
            CAllocatedBlock::new(c_path)
                .map(|c_path| c_str_to_path(c_path.as_c_str()).to_path_buf())
                .ok_or_else(|| Error::unexpected_data("aa_find_mountpoint()"))
        })
}
