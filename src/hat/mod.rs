#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::{panic, thread};

use log::warn;

use crate::{change_hat, Confinement};
use crate::errors::{Error, Result};
use crate::magic::TokenStore;

/// Hat pushed onto the confinement of the calling thread, popped when left
/// or dropped.
///
/// The magic token is fetched from the store on entry and again on exit, and
/// is not retained in between.
///
/// A scope is bound to the thread that entered it.
#[derive(Debug)]
#[must_use = "dropping the scope immediately leaves the hat"]
pub struct HatScope<'s, S: TokenStore + ?Sized> {
    hat: String,
    store: &'s S,
    active: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'s, S: TokenStore + ?Sized> HatScope<'s, S> {
    /// Push `hat` with the token currently held by `store`.
    ///
    /// If the calling thread is already confined to `hat`, then nothing is
    /// pushed, and leaving the scope pops nothing. Otherwise, the hat is
    /// pushed, and the confinement is checked to be that hat; if it is not,
    /// the push is undone and this fails with [`ErrorKind::NotFound`].
    ///
    /// [`ErrorKind::NotFound`]: crate::errors::ErrorKind::NotFound
    pub fn enter(hat: &str, store: &'s S) -> Result<Self> {
        if hat.is_empty() {
            return Err(Error::invalid_argument("HatScope::enter()", hat));
        }

        let magic_token = store.get()?;

        let active = !is_confined_to(hat)?;
        if active {
            change_hat(Some(hat), magic_token)?;

            if !is_confined_to(hat)? {
                if let Err(err) = change_hat(None, magic_token) {
                    warn!("Failed to leave unexpected hat instead of '{}': {}", hat, err);
                }
                return Err(Error::hat_not_entered("HatScope::enter()", hat));
            }
        }

        Ok(Self {
            hat: hat.into(),
            store,
            active,
            _not_send: PhantomData,
        })
    }

    /// Return the name of the hat.
    #[must_use]
    pub fn hat(&self) -> &str {
        &self.hat
    }

    /// Return `true` if this scope pushed the hat, and will pop it.
    #[must_use]
    pub fn pushed(&self) -> bool {
        self.active
    }

    /// Pop the hat, if this scope pushed it.
    pub fn leave(mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        change_hat(None, self.store.get()?)
    }
}

/// Return `true` if the label of the calling thread designates `hat`.
fn is_confined_to(hat: &str) -> Result<bool> {
    let current = Confinement::current()?;
    Ok(label_designates_hat(current.label().to_bytes(), hat))
}

fn label_designates_hat(label: &[u8], hat: &str) -> bool {
    label
        .strip_suffix(hat.as_bytes())
        .map_or(false, |profile| profile.ends_with(b"//"))
}

impl<'s, S: TokenStore + ?Sized> Drop for HatScope<'s, S> {
    fn drop(&mut self) {
        if self.active {
            let r = self.store.get().and_then(|token| change_hat(None, token));
            if let Err(err) = r {
                warn!("Failed to leave hat '{}': {}", self.hat, err);
            }
        }
    }
}

/// Run `f` on a new thread confined to `hat`, then pop the hat and return the
/// result of `f`.
///
/// If the hat cannot be pushed, then `f` is not run. If the hat cannot be
/// popped, then the error is returned, and the thread, which holds the
/// confinement, ends anyway.
///
/// A panic in `f` is resumed on the calling thread.
pub fn with_hat<S, F, R>(hat: &str, store: &S, f: F) -> Result<R>
where
    S: TokenStore + Sync + ?Sized,
    F: FnOnce() -> R + Send,
    R: Send,
{
    if hat.is_empty() {
        return Err(Error::invalid_argument("hat::with_hat()", hat));
    }

    thread::scope(|scope| {
        let confined = thread::Builder::new()
            .name(format!("hat-{}", hat))
            .spawn_scoped(scope, || {
                let hat_scope = HatScope::enter(hat, store)?;
                let r = f();
                hat_scope.leave().map(|()| r)
            })
            .map_err(|err| Error::from_io("std::thread::Builder::spawn_scoped()", err))?;

        confined
            .join()
            .unwrap_or_else(|payload| panic::resume_unwind(payload))
    })
}
