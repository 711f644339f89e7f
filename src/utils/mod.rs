
use std::ffi::{CStr, CString, OsStr};
use std::marker::PhantomData;
use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::path::Path;
use std::{io, mem, ptr};

use once_cell::sync::OnceCell;

use crate::errors::{Error, Result};

pub(crate) fn str_to_c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_r| Error::invalid_argument("CString::new()", s))
}

#[cfg(unix)]
pub(crate) fn c_str_to_path(c_path: &CStr) -> &Path {
    use std::os::unix::ffi::OsStrExt;

    Path::new(OsStr::from_bytes(c_path.to_bytes()))
}

/// Check the return value of a native call, capturing `errno` on failure.
///
/// Call this in the statement right after the native call: anything in
/// between may overwrite `errno`.
pub(crate) fn ret_val_to_result(result: c_int) -> io::Result<c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// A null-terminated array of C strings, as expected by `aa_change_hatv()`.
#[derive(Debug)]
pub(crate) struct CStringArray {
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

impl CStringArray {
    pub(crate) fn new<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let strings = items
            .iter()
            .map(|s| str_to_c_string(s.as_ref()))
            .collect::<Result<Vec<CString>>>()?;

        let pointers = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(Some(ptr::null()))
            .collect();

        Ok(Self {
            _strings: strings,
            pointers,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.pointers.len() - 1
    }

    pub(crate) fn as_ptr(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }
}

/// An owned block of memory, allocated with [`libc::malloc`].
#[derive(Debug)]
pub struct CAllocatedBlock<T> {
    pub(crate) pointer: ptr::NonNull<T>,
    _phantom_data: PhantomData<T>,
}

// The block is exclusively owned, and only ever read through shared references.
unsafe impl<T: Send> Send for CAllocatedBlock<T> {}
unsafe impl<T: Sync> Sync for CAllocatedBlock<T> {}

impl<T> CAllocatedBlock<T> {
    pub(crate) fn new(pointer: *mut T) -> Option<Self> {
        ptr::NonNull::new(pointer).map(|pointer| Self {
            pointer,
            _phantom_data: PhantomData,
        })
    }

    /// Return the managed raw pointer.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }
}

impl CAllocatedBlock<c_char> {
    /// Return the managed null-terminated C string.
    #[must_use]
    pub fn as_c_str(&self) -> &CStr {
        unsafe { CStr::from_ptr(self.pointer.as_ptr()) }
    }
}

impl<T> Drop for CAllocatedBlock<T> {
    fn drop(&mut self) {
        let pointer = self.pointer.as_ptr();
        self.pointer = ptr::NonNull::dangling();
        unsafe { libc::free(pointer.cast()) };
    }
}

type LabelQuery = unsafe extern "C" fn(*mut *mut c_char, *mut *mut c_char) -> c_int;
type TaskLabelQuery =
    unsafe extern "C" fn(libc::pid_t, *mut *mut c_char, *mut *mut c_char) -> c_int;
type PeerLabelQuery = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

/// Holds addresses of the `libapparmor` functions used by this crate.
///
/// Each function missing from the loaded library, or every function when the
/// library cannot be loaded, is replaced by a stand-in failing with `ENOSYS`.
#[derive(Debug)]
pub(crate) struct NativeFunctions {
    pub(crate) aa_is_enabled: unsafe extern "C" fn() -> c_int,

    pub(crate) aa_change_hat: unsafe extern "C" fn(*const c_char, c_ulong) -> c_int,

    pub(crate) aa_change_hatv: unsafe extern "C" fn(*const *const c_char, c_ulong) -> c_int,

    pub(crate) aa_change_profile: unsafe extern "C" fn(*const c_char) -> c_int,

    /// Since version 2.11
    pub(crate) aa_stack_profile: unsafe extern "C" fn(*const c_char) -> c_int,

    pub(crate) aa_getcon: LabelQuery,

    pub(crate) aa_gettaskcon: TaskLabelQuery,

    pub(crate) aa_getpeercon: PeerLabelQuery,

    pub(crate) aa_find_mountpoint: unsafe extern "C" fn(*mut *mut c_char) -> c_int,
}

/// Addresses of functions implemented by `libapparmor`.
pub(crate) static NATIVE_FN: OnceCell<NativeFunctions> = OnceCell::new();

impl Default for NativeFunctions {
    fn default() -> Self {
        Self {
            aa_is_enabled: Self::not_impl_aa_is_enabled,
            aa_change_hat: Self::not_impl_aa_change_hat,
            aa_change_hatv: Self::not_impl_aa_change_hatv,
            aa_change_profile: Self::not_impl_name_only,
            aa_stack_profile: Self::not_impl_name_only,
            aa_getcon: Self::not_impl_aa_getcon,
            aa_gettaskcon: Self::not_impl_aa_gettaskcon,
            aa_getpeercon: Self::not_impl_aa_getpeercon,
            aa_find_mountpoint: Self::not_impl_aa_find_mountpoint,
        }
    }
}

impl NativeFunctions {
    pub(crate) fn get() -> &'static Self {
        NATIVE_FN.get_or_init(Self::initialize)
    }

    fn initialize() -> Self {
        let mut r = Self::default();
        let lib_handle = Self::get_libapparmor_handle();
        if !lib_handle.is_null() {
            r.load_functions_addresses(lib_handle)
        }
        Error::clear_errno();
        r
    }

    fn get_libapparmor_handle() -> *mut c_void {
        // The handle is never closed: the functions stay in use until exit.
        let flags = libc::RTLD_NOW | libc::RTLD_LOCAL | libc::RTLD_NODELETE;
        for &lib_name in &["libapparmor.so.1\0", "libapparmor.so\0"] {
            let lib_handle = unsafe { libc::dlopen(lib_name.as_ptr().cast(), flags) };
            if !lib_handle.is_null() {
                return lib_handle;
            }
        }
        ptr::null_mut()
    }

    fn symbol(lib_handle: *mut c_void, c_name: &'static str) -> Option<*mut c_void> {
        let f = unsafe { libc::dlsym(lib_handle, c_name.as_ptr().cast()) };
        (!f.is_null()).then_some(f)
    }

    fn load_functions_addresses(&mut self, lib_handle: *mut c_void) {
        if let Some(f) = Self::symbol(lib_handle, "aa_is_enabled\0") {
            self.aa_is_enabled = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_change_hat\0") {
            self.aa_change_hat = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_change_hatv\0") {
            self.aa_change_hatv = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_change_profile\0") {
            self.aa_change_profile = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_stack_profile\0") {
            self.aa_stack_profile = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_getcon\0") {
            self.aa_getcon = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_gettaskcon\0") {
            self.aa_gettaskcon = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_getpeercon\0") {
            self.aa_getpeercon = unsafe { mem::transmute(f) };
        }

        if let Some(f) = Self::symbol(lib_handle, "aa_find_mountpoint\0") {
            self.aa_find_mountpoint = unsafe { mem::transmute(f) };
        }
    }

    unsafe extern "C" fn not_impl_aa_is_enabled() -> c_int {
        Error::set_errno(libc::ENOSYS);
        0
    }

    unsafe extern "C" fn not_impl_aa_change_hat(_hat: *const c_char, _token: c_ulong) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_aa_change_hatv(
        _hats: *const *const c_char,
        _token: c_ulong,
    ) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_name_only(_name: *const c_char) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_aa_getcon(
        _label: *mut *mut c_char,
        _mode: *mut *mut c_char,
    ) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_aa_gettaskcon(
        _target: libc::pid_t,
        _label: *mut *mut c_char,
        _mode: *mut *mut c_char,
    ) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_aa_getpeercon(
        _fd: c_int,
        _label: *mut *mut c_char,
        _mode: *mut *mut c_char,
    ) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }

    unsafe extern "C" fn not_impl_aa_find_mountpoint(_mount_point: *mut *mut c_char) -> c_int {
        Error::set_errno(libc::ENOSYS);
        -1
    }
}
