#![cfg(all(target_os = "linux", not(target_env = "kernel")))]
#![doc(html_root_url = "https://docs.rs/apparmor/0.1.0")]

/*!
# 🛡️ Safe Rust bindings for AppArmor confinement transitions

AppArmor is a Mandatory Access Control for Linux, confining tasks to
kernel-loaded profiles.

This crate lets a thread narrow its own confinement by pushing and popping
*hats*, irreversibly transition to another profile, and query the confinement
label and mode of itself, of another task, or of the peer of a connected
local socket.

All confinement state lives in the kernel, attached to the **calling thread**.
Two threads of the same process may run under different confinements, and a
transition in one thread has no effect on any other thread.

⚠️ This crate is Linux-specific. Building it for non-Linux platforms, or for
the Linux kernel, results in an empty crate.

## ⚓ Run time requirements

The native `libapparmor` library is loaded at run time.
If the library cannot be loaded, or AppArmor is not enabled in the running
kernel, then every operation fails with [`errors::ErrorKind::Unsupported`].

## 🎩 Hats and magic tokens

A hat is pushed with a caller-chosen, non-zero magic token, and only that
token pops it. The [`magic`] module generates and stores such tokens, and the
[`hat`] module scopes hat confinement to a guard or to a closure.

```no_run
use apparmor::{change_hat, Confinement};

let token = apparmor::magic::generate()?;
change_hat(Some("restricted_hat"), token)?;
// ... confined work ...
change_hat(None, token)?;

let confinement = Confinement::current()?;
println!("{}", confinement);
# Ok::<(), apparmor::errors::Error>(())
```

[official AppArmor documentation]: https://apparmor.net/
*/

//
// https://rust-lang.github.io/api-guidelines/checklist.html
//

#![warn(missing_docs)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_ulong};
use std::os::unix::io::AsRawFd;
use std::{fmt, io, ptr};

#[cfg(test)]
mod tests;

/// Errors.
pub mod errors;
/// Scoped hat confinement.
pub mod hat;
/// Magic tokens guarding hat transitions.
pub mod magic;
/// AppArmor kernel interface paths.
pub mod path;
/// Utilities.
pub mod utils;

use errors::{Error, Request, Result};
use utils::*;

/// Support of AppArmor in the running kernel.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KernelSupport {
    /// AppArmor is unsupported, disabled, or `libapparmor` is unavailable.
    Unsupported,
    /// AppArmor is enabled.
    AppArmor,
}

/// Determine the support of AppArmor in the running kernel.
///
/// AppArmor is reported as supported when its interface file system is
/// mounted, and also when it is enabled but its interface cannot be reached
/// by the calling task, e.g., in a container without `securityfs`.
///
/// See: `aa_is_enabled()`.
#[must_use]
pub fn kernel_support() -> KernelSupport {
    let aa_is_enabled = NativeFunctions::get().aa_is_enabled;
    if unsafe { aa_is_enabled() } == 1 {
        KernelSupport::AppArmor
    } else {
        kernel_support_from_errno(io::Error::last_os_error().raw_os_error())
    }
}

/// Interpret the `errno` set by `aa_is_enabled()` when it returns zero.
fn kernel_support_from_errno(errno: Option<c_int>) -> KernelSupport {
    match errno {
        // Enabled, but the interface is not mounted, or cannot be read.
        Some(libc::ENOENT) | Some(libc::EPERM) | Some(libc::EACCES) => KernelSupport::AppArmor,
        _ => KernelSupport::Unsupported,
    }
}

/// Fail with [`errors::ErrorKind::Unsupported`] unless AppArmor is supported.
///
/// Must run before any native call: when AppArmor is absent, another
/// security module may answer it.
pub(crate) fn ensure_kernel_support(operation: &'static str) -> Result<()> {
    match kernel_support() {
        KernelSupport::AppArmor => Ok(()),
        KernelSupport::Unsupported => Err(Error::unsupported(operation)),
    }
}

/// How violations of a confinement policy are handled.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConfinementMode {
    /// No mode is reported, e.g., for an unconfined task.
    Unset,
    /// Violations are blocked.
    Enforce,
    /// Violations are only logged.
    Complain,
    /// A mode not known by this crate, such as `kill` or `user`.
    Other,
}

impl ConfinementMode {
    fn from_bytes(mode: Option<&[u8]>) -> Self {
        match mode {
            None | Some(b"") => Self::Unset,
            Some(b"enforce") => Self::Enforce,
            Some(b"complain") => Self::Complain,
            Some(_) => Self::Other,
        }
    }
}

/// Confinement label and mode of a task.
///
/// The label and the mode are read from one buffer allocated by
/// `libapparmor` for this instance alone, and released when it is dropped.
pub struct Confinement {
    label: CAllocatedBlock<c_char>,
    mode: Option<ptr::NonNull<c_char>>,
}

// `mode` points into the block owned by `label`, which is never mutated.
unsafe impl Send for Confinement {}
unsafe impl Sync for Confinement {}

impl Confinement {
    /// Return the confinement of the calling thread.
    ///
    /// See: `aa_getcon()`.
    #[doc(alias = "aa_getcon")]
    pub fn current() -> Result<Self> {
        ensure_kernel_support("aa_getcon()")?;
        let aa_getcon = NativeFunctions::get().aa_getcon;

        let mut label: *mut c_char = ptr::null_mut();
        let mut mode: *mut c_char = ptr::null_mut();
        let r = ret_val_to_result(unsafe { aa_getcon(&mut label, &mut mode) });

        r.map_err(|err| Error::from_native("aa_getcon()", Request::Other, err))
            .and_then(|_size| Self::from_parts("aa_getcon()", label, mode))
    }

    /// Return the confinement of the task identified by `process_id`.
    ///
    /// See: `aa_gettaskcon()`.
    #[doc(alias = "aa_gettaskcon")]
    pub fn of_task(process_id: libc::pid_t) -> Result<Self> {
        ensure_kernel_support("aa_gettaskcon()")?;
        let aa_gettaskcon = NativeFunctions::get().aa_gettaskcon;

        let mut label: *mut c_char = ptr::null_mut();
        let mut mode: *mut c_char = ptr::null_mut();
        let r = ret_val_to_result(unsafe { aa_gettaskcon(process_id, &mut label, &mut mode) });

        r.map_err(|err| Error::from_native_pid("aa_gettaskcon()", process_id, err))
            .and_then(|_size| Self::from_parts("aa_gettaskcon()", label, mode))
    }

    /// Return the confinement of the peer of a connected local socket.
    ///
    /// The result is a snapshot taken at call time; the peer may change its
    /// confinement afterwards. The socket is only borrowed.
    ///
    /// See: `aa_getpeercon()`.
    #[doc(alias = "aa_getpeercon")]
    pub fn of_peer_socket<T>(socket: &T) -> Result<Self>
    where
        T: AsRawFd,
    {
        let fd = socket.as_raw_fd();
        ensure_kernel_support("aa_getpeercon()")?;
        let aa_getpeercon = NativeFunctions::get().aa_getpeercon;

        let mut label: *mut c_char = ptr::null_mut();
        let mut mode: *mut c_char = ptr::null_mut();
        let r = ret_val_to_result(unsafe { aa_getpeercon(fd, &mut label, &mut mode) });

        r.map_err(|err| Error::from_native("aa_getpeercon()", Request::Other, err))
            .and_then(|_size| Self::from_parts("aa_getpeercon()", label, mode))
    }

    /// Return the confinement label.
    #[must_use]
    pub fn label(&self) -> &CStr {
        self.label.as_c_str()
    }

    /// Return the confinement label, as UTF-8.
    pub fn label_str(&self) -> Result<&str> {
        self.label().to_str().map_err(Into::into)
    }

    /// Return the confinement mode, if one is reported.
    #[must_use]
    pub fn mode(&self) -> Option<&CStr> {
        self.mode
            .map(|mode| unsafe { CStr::from_ptr(mode.as_ptr()) })
            .filter(|mode| !mode.to_bytes().is_empty())
    }

    /// Return the confinement mode, as UTF-8, if one is reported.
    pub fn mode_str(&self) -> Result<Option<&str>> {
        self.mode()
            .map(|mode| mode.to_str().map_err(Into::into))
            .transpose()
    }

    /// Return how violations of the label's policy are handled.
    #[must_use]
    pub fn mode_kind(&self) -> ConfinementMode {
        ConfinementMode::from_bytes(self.mode().map(CStr::to_bytes))
    }

    /// Return `true` if the label designates no confinement.
    #[must_use]
    pub fn is_unconfined(&self) -> bool {
        self.label().to_bytes() == b"unconfined"
    }

    /// Return the managed raw pointer to the label.
    #[must_use]
    pub fn as_ptr(&self) -> *const c_char {
        self.label.as_ptr()
    }

    /// Copy the label and the mode into owned strings.
    pub fn to_owned_parts(&self) -> Result<(String, Option<String>)> {
        let label = self.label_str()?.to_owned();
        let mode = self.mode_str()?.map(String::from);
        Ok((label, mode))
    }

    fn from_parts(proc_name: &'static str, label: *mut c_char, mode: *mut c_char) -> Result<Self> {
        // The mode, if any, lies in the label's buffer, so only the label is freed.
        CAllocatedBlock::new(label)
            .map(|label| Self {
                label,
                mode: ptr::NonNull::new(mode),
            })
            .ok_or_else(|| Error::unexpected_data(proc_name))
    }
}

impl fmt::Debug for Confinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confinement")
            .field("label", &self.label())
            .field("mode", &self.mode())
            .finish()
    }
}

impl fmt::Display for Confinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.label().to_string_lossy();
        match self.mode() {
            Some(mode) => write!(f, "{} ({})", label, mode.to_string_lossy()),
            None => write!(f, "{}", label),
        }
    }
}

/// Split a confinement string of the form `label (mode)` into its label and
/// mode.
///
/// A trailing new line is ignored. `unconfined` has no mode.
pub fn split_confinement(confinement: &str) -> Result<(&str, Option<&str>)> {
    let op = "split_confinement()";
    let confinement = confinement.strip_suffix('\n').unwrap_or(confinement);
    if confinement.is_empty() {
        return Err(Error::invalid_input(op));
    }

    if confinement == "unconfined" {
        return Ok((confinement, None));
    }

    let parsed = confinement
        .strip_suffix(')')
        .and_then(|s| s.rfind('(').map(|index| (&s[..index], &s[index + 1..])))
        .filter(|(label, _mode)| label.ends_with(char::is_whitespace))
        .map(|(label, mode)| (label.trim_end(), mode))
        .filter(|(label, mode)| !label.is_empty() && !mode.is_empty());

    match parsed {
        Some((label, mode)) => Ok((label, Some(mode))),
        None => Err(Error::invalid_argument(op, confinement)),
    }
}

fn native_magic_token(proc_name: &'static str, magic_token: u64) -> Result<c_ulong> {
    if magic_token == 0 {
        Err(Error::invalid_input(proc_name))
    } else {
        c_ulong::try_from(magic_token).map_err(|_r| Error::invalid_input(proc_name))
    }
}

/// Change the hat of the calling thread.
///
/// With a hat name, push that hat, binding `magic_token` to the push.
/// With `None` or an empty name, pop the most recently pushed hat, which
/// succeeds only if `magic_token` matches the token of that push.
///
/// The magic token must not be zero.
///
/// See: `aa_change_hat()`.
#[doc(alias = "aa_change_hat")]
pub fn change_hat(hat: Option<&str>, magic_token: u64) -> Result<()> {
    let proc_name = "aa_change_hat()";
    let token = native_magic_token(proc_name, magic_token)?;
    let hat = hat.filter(|hat| !hat.is_empty());
    let c_hat = hat.map(str_to_c_string).transpose()?;
    let c_hat_ptr = c_hat.as_ref().map_or(ptr::null(), |c_hat| c_hat.as_ptr());
    ensure_kernel_support(proc_name)?;
    let aa_change_hat = NativeFunctions::get().aa_change_hat;

    let r = ret_val_to_result(unsafe { aa_change_hat(c_hat_ptr, token) });

    r.map(drop).map_err(|err| match hat {
        Some(hat) => Error::from_native_name(proc_name, Request::HatPush, hat, err),
        None => Error::from_native(proc_name, Request::HatPop, err),
    })
}

/// Push the first hat of `hats` that the kernel accepts, trying them in
/// order.
///
/// If no candidate is accepted, the error of the last attempt is returned.
/// The magic token must not be zero.
///
/// See: `aa_change_hatv()`.
#[doc(alias = "aa_change_hatv")]
pub fn change_hat_vector<S>(hats: &[S], magic_token: u64) -> Result<()>
where
    S: AsRef<str>,
{
    let proc_name = "aa_change_hatv()";
    let token = native_magic_token(proc_name, magic_token)?;
    if let Some(hat) = hats.iter().map(AsRef::as_ref).find(|hat| hat.is_empty()) {
        return Err(Error::invalid_argument(proc_name, hat));
    }

    let c_hats = CStringArray::new(hats)?;
    if c_hats.len() == 0 {
        return Err(Error::invalid_input(proc_name));
    }
    ensure_kernel_support(proc_name)?;
    let aa_change_hatv = NativeFunctions::get().aa_change_hatv;

    let r = ret_val_to_result(unsafe { aa_change_hatv(c_hats.as_ptr(), token) });

    r.map(drop).map_err(|err| {
        let names: Vec<&str> = hats.iter().map(AsRef::as_ref).collect();
        Error::from_native_name(proc_name, Request::HatPush, names.join(", "), err)
    })
}

fn change_profile_with(
    proc: unsafe extern "C" fn(*const c_char) -> c_int,
    proc_name: &'static str,
    profile: &str,
) -> Result<()> {
    if profile.is_empty() {
        return Err(Error::invalid_input(proc_name));
    }
    let c_profile = str_to_c_string(profile)?;
    ensure_kernel_support(proc_name)?;

    let r = ret_val_to_result(unsafe { proc(c_profile.as_ptr()) });

    r.map(drop)
        .map_err(|err| Error::from_native_name(proc_name, Request::Other, profile, err))
}

/// Transition the calling thread to `profile`.
///
/// This is one-way: no prior state is saved, and no hat pop undoes it.
///
/// See: `aa_change_profile()`.
#[doc(alias = "aa_change_profile")]
pub fn change_profile(profile: &str) -> Result<()> {
    let proc = NativeFunctions::get().aa_change_profile;
    change_profile_with(proc, "aa_change_profile()", profile)
}

/// Stack `profile` onto the confinement of the calling thread.
///
/// Like [`change_profile`], this is one-way.
///
/// See: `aa_stack_profile()`.
#[doc(alias = "aa_stack_profile")]
pub fn stack_profile(profile: &str) -> Result<()> {
    let proc = NativeFunctions::get().aa_stack_profile;
    change_profile_with(proc, "aa_stack_profile()", profile)
}
