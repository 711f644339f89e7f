
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::raw::{c_char, c_long};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use std::{fs, io, mem, thread};

use log::debug;

use crate::errors::{Error, Result};
use crate::utils::str_to_c_string;

/// Draw a magic token from the kernel random number generator.
///
/// The returned token is never zero.
///
/// See: `getrandom()`.
pub fn generate() -> Result<u64> {
    loop {
        let mut buffer = [0_u8; mem::size_of::<u64>()];
        let r = unsafe { libc::getrandom(buffer.as_mut_ptr().cast(), buffer.len(), 0) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::from_io("getrandom()", err));
            }
        } else if r as usize == buffer.len() {
            let token = u64::from_be_bytes(buffer);
            if token != 0 {
                return Ok(token);
            }
        }
    }
}

/// Read a magic token from `source`.
///
/// The first eight bytes are interpreted as a big-endian integer, which must
/// not be zero.
pub fn generate_from<R: Read + ?Sized>(source: &mut R) -> Result<u64> {
    let mut buffer = [0_u8; mem::size_of::<u64>()];
    source
        .read_exact(&mut buffer)
        .map_err(|err| Error::from_io("std::io::Read::read_exact()", err))?;

    match u64::from_be_bytes(buffer) {
        0 => Err(Error::InvalidMagicToken("0".into())),
        token => Ok(token),
    }
}

fn format_token(magic_token: u64) -> String {
    format!("{:x}", magic_token)
}

fn parse_token(s: &str) -> Result<u64> {
    match u64::from_str_radix(s.trim(), 16) {
        Ok(token) if token != 0 => Ok(token),
        _ => Err(Error::InvalidMagicToken(s.into())),
    }
}

/// Place where a magic token is kept while a hat is pushed.
///
/// A hat should be denied access to the store of its own token.
pub trait TokenStore {
    /// Store `magic_token`, replacing any previous token.
    fn set(&self, magic_token: u64) -> Result<()>;

    /// Return the stored token, failing if none is stored.
    fn get(&self) -> Result<u64>;

    /// Remove the stored token, if any.
    fn clear(&self) -> Result<()>;
}

/// Token kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    magic_token: AtomicU64,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn set(&self, magic_token: u64) -> Result<()> {
        if magic_token == 0 {
            return Err(Error::InvalidMagicToken("0".into()));
        }
        self.magic_token.store(magic_token, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self) -> Result<u64> {
        match self.magic_token.load(Ordering::SeqCst) {
            0 => Err(Error::from_io(
                "MemoryTokenStore::get()",
                io::ErrorKind::NotFound.into(),
            )),
            token => Ok(token),
        }
    }

    fn clear(&self) -> Result<()> {
        self.magic_token.store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// Token kept as hexadecimal text in a file readable only by its owner.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Create a store using the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Return the path of the file holding the token.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn set(&self, magic_token: u64) -> Result<()> {
        if magic_token == 0 {
            return Err(Error::InvalidMagicToken("0".into()));
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .and_then(|mut file| file.write_all(format_token(magic_token).as_bytes()))
            .map_err(|err| Error::from_io_path("FileTokenStore::set()", &self.path, err))
    }

    fn get(&self) -> Result<u64> {
        let text = fs::read_to_string(&self.path)
            .map_err(|err| Error::from_io_path("FileTokenStore::get()", &self.path, err))?;
        parse_token(&text)
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(Error::from_io_path("FileTokenStore::clear()", &self.path, err))
            }
            _ => Ok(()),
        }
    }
}

const KEY_SPEC_THREAD_KEYRING: c_long = -1;
const KEYCTL_GET_KEYRING_ID: c_long = 0;
const KEYCTL_UNLINK: c_long = 9;
const KEYCTL_SEARCH: c_long = 10;
const KEYCTL_READ: c_long = 11;
const KEYCTL_SET_TIMEOUT: c_long = 15;

const KEY_TYPE_USER: &str = "user\0";

/// Options of a [`KeyringTokenStore`].
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct KeyringOptions {
    /// Suffix of the key description, distinguishing stores of one process.
    pub name: String,
    /// Seconds after which a stored token expires; zero means never.
    pub timeout_seconds: u32,
}

enum KeyringCommand {
    Set(u64, mpsc::Sender<Result<()>>),
    Get(mpsc::Sender<Result<u64>>),
    Clear(mpsc::Sender<Result<()>>),
}

/// Token kept in the kernel thread keyring of a dedicated thread.
///
/// Only that thread can reach the key, so the token is neither in process
/// memory nor in the file system while a hat is pushed.
#[derive(Debug)]
pub struct KeyringTokenStore {
    commands: Mutex<Option<mpsc::Sender<KeyringCommand>>>,
    owner: Option<thread::JoinHandle<()>>,
}

impl KeyringTokenStore {
    /// Start the keyring owner thread.
    ///
    /// Fails if the kernel keyring is unavailable, e.g., when filtered by a
    /// `seccomp` policy.
    pub fn new(options: KeyringOptions) -> Result<Self> {
        let description = str_to_c_string(&format!("apparmor_magic_{}", options.name))?;
        let (commands, receiver) = mpsc::channel();
        let (init_sender, init_receiver) = mpsc::channel();

        let owner = thread::Builder::new()
            .name("apparmor-keyring".into())
            .spawn(move || {
                let r = keyctl(&[KEYCTL_GET_KEYRING_ID, KEY_SPEC_THREAD_KEYRING, 1])
                    .map(drop)
                    .map_err(|err| Error::from_io("keyctl(KEYCTL_GET_KEYRING_ID)", err));
                let failed = r.is_err();
                let _ignored = init_sender.send(r);
                if !failed {
                    let mut keyring = ThreadKeyring {
                        description,
                        timeout_seconds: options.timeout_seconds,
                        key: None,
                    };
                    keyring.serve(&receiver);
                }
            })
            .map_err(|err| Error::from_io("std::thread::Builder::spawn()", err))?;

        let init_result = init_receiver.recv().unwrap_or_else(|_| {
            let err = io::ErrorKind::BrokenPipe.into();
            Err(Error::from_io("KeyringTokenStore::new()", err))
        });

        let store = Self {
            commands: Mutex::new(Some(commands)),
            owner: Some(owner),
        };
        init_result.map(|()| store)
    }

    fn request<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(mpsc::Sender<Result<T>>) -> KeyringCommand,
    ) -> Result<T> {
        let (sender, receiver) = mpsc::channel();
        {
            let commands = self
                .commands
                .lock()
                .map_err(|_r| Error::LockPoisoned { operation })?;

            commands
                .as_ref()
                .and_then(|commands| commands.send(command(sender)).ok())
                .ok_or_else(|| Error::from_io(operation, io::ErrorKind::BrokenPipe.into()))?;
        }

        receiver
            .recv()
            .unwrap_or_else(|_| Err(Error::from_io(operation, io::ErrorKind::BrokenPipe.into())))
    }
}

impl TokenStore for KeyringTokenStore {
    fn set(&self, magic_token: u64) -> Result<()> {
        if magic_token == 0 {
            return Err(Error::InvalidMagicToken("0".into()));
        }
        self.request("KeyringTokenStore::set()", |reply| {
            KeyringCommand::Set(magic_token, reply)
        })
    }

    fn get(&self) -> Result<u64> {
        self.request("KeyringTokenStore::get()", KeyringCommand::Get)
    }

    fn clear(&self) -> Result<()> {
        self.request("KeyringTokenStore::clear()", KeyringCommand::Clear)
    }
}

impl Drop for KeyringTokenStore {
    fn drop(&mut self) {
        // Closing the channel stops the owner thread, and its keyring with it.
        match self.commands.get_mut() {
            Ok(commands) => drop(commands.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }

        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                debug!("Keyring owner thread panicked");
            }
        }
    }
}

fn keyctl(args: &[c_long]) -> io::Result<c_long> {
    let mut a = [0 as c_long; 5];
    a[..args.len()].copy_from_slice(args);
    let r = unsafe { libc::syscall(libc::SYS_keyctl, a[0], a[1], a[2], a[3], a[4]) };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r)
    }
}

fn key_not_found(operation: &'static str, err: io::Error) -> Error {
    if err.raw_os_error() == Some(libc::ENOKEY) {
        Error::from_io(operation, io::ErrorKind::NotFound.into())
    } else {
        Error::from_io(operation, err)
    }
}

/// State of the keyring owner thread.
struct ThreadKeyring {
    description: CString,
    timeout_seconds: u32,
    key: Option<c_long>,
}

impl ThreadKeyring {
    fn serve(&mut self, receiver: &mpsc::Receiver<KeyringCommand>) {
        for command in receiver {
            // A reply that cannot be sent means the requester is gone.
            match command {
                KeyringCommand::Set(magic_token, reply) => {
                    let _ignored = reply.send(self.set(magic_token));
                }
                KeyringCommand::Get(reply) => {
                    let _ignored = reply.send(self.get());
                }
                KeyringCommand::Clear(reply) => {
                    let _ignored = reply.send(self.clear());
                }
            }
        }
    }

    fn find_key(&self, operation: &'static str) -> Result<c_long> {
        if let Some(key) = self.key {
            return Ok(key);
        }

        let key_type: *const c_char = KEY_TYPE_USER.as_ptr().cast();
        keyctl(&[
            KEYCTL_SEARCH,
            KEY_SPEC_THREAD_KEYRING,
            key_type as c_long,
            self.description.as_ptr() as c_long,
            0,
        ])
        .map_err(|err| key_not_found(operation, err))
    }

    fn set(&mut self, magic_token: u64) -> Result<()> {
        let payload = format_token(magic_token);
        let key_type: *const c_char = KEY_TYPE_USER.as_ptr().cast();
        let r = unsafe {
            libc::syscall(
                libc::SYS_add_key,
                key_type,
                self.description.as_ptr(),
                payload.as_ptr(),
                payload.len(),
                KEY_SPEC_THREAD_KEYRING,
            )
        };
        if r < 0 {
            return Err(Error::from_io("add_key()", io::Error::last_os_error()));
        }
        self.key = Some(r);

        if self.timeout_seconds != 0 {
            let timeout = c_long::try_from(self.timeout_seconds).map_err(|_r| {
                let err = io::ErrorKind::InvalidInput.into();
                Error::from_io("keyctl(KEYCTL_SET_TIMEOUT)", err)
            })?;
            keyctl(&[KEYCTL_SET_TIMEOUT, r, timeout])
                .map_err(|err| Error::from_io("keyctl(KEYCTL_SET_TIMEOUT)", err))?;
        }
        Ok(())
    }

    fn get(&self) -> Result<u64> {
        let key = self.find_key("keyctl(KEYCTL_SEARCH)")?;

        let mut buffer = [0_u8; 32];
        let size = keyctl(&[
            KEYCTL_READ,
            key,
            buffer.as_mut_ptr() as c_long,
            buffer.len() as c_long,
        ])
        .map_err(|err| key_not_found("keyctl(KEYCTL_READ)", err))?;

        let size = usize::try_from(size)?;
        let text = buffer
            .get(..size)
            .ok_or_else(|| Error::InvalidMagicToken(format!("<{} bytes>", size)))?;
        parse_token(std::str::from_utf8(text)?)
    }

    fn clear(&mut self) -> Result<()> {
        let r = match self.find_key("keyctl(KEYCTL_SEARCH)") {
            Ok(key) => keyctl(&[KEYCTL_UNLINK, key, KEY_SPEC_THREAD_KEYRING])
                .map(drop)
                .map_err(|err| key_not_found("keyctl(KEYCTL_UNLINK)", err)),
            Err(err) => Err(err),
        };
        self.key = None;

        match r {
            Err(err) if err.kind() == crate::errors::ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }
}
