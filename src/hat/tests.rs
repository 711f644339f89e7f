#![cfg(all(test, target_os = "linux", not(target_env = "kernel")))]

use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::ErrorKind;
use crate::magic::{MemoryTokenStore, TokenStore};

fn test_profiles_are_loaded() -> bool {
    std::env::var_os("APPARMOR_TEST_PROFILES").map_or(false, |v| v == "1")
}

fn is_unconfined() -> bool {
    crate::Confinement::current().map_or(true, |current| current.is_unconfined())
}

#[test]
fn enter_rejects_empty_hat() {
    let store = MemoryTokenStore::new();
    store.set(0x1234).unwrap();

    let err = super::HatScope::enter("", &store).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn label_designates_hat() {
    assert!(super::label_designates_hat(b"/usr/bin/app//hat_c", "hat_c"));
    assert!(super::label_designates_hat(b"app//outer//hat_c", "hat_c"));

    assert!(!super::label_designates_hat(b"/usr/bin/app", "hat_c"));
    assert!(!super::label_designates_hat(b"/usr/bin/app//that_c", "hat_c"));
    assert!(!super::label_designates_hat(b"/usr/bin/app//hat_c//inner", "hat_c"));
    assert!(!super::label_designates_hat(b"hat_c", "hat_c"));
    assert!(!super::label_designates_hat(b"unconfined", "hat_c"));
}

#[test]
fn enter_needs_a_stored_token() {
    let store = MemoryTokenStore::new();
    let err = super::HatScope::enter("some_hat", &store).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn enter_fails_when_unconfined() {
    if !is_unconfined() {
        return;
    }

    let store = MemoryTokenStore::new();
    store.set(crate::magic::generate().unwrap()).unwrap();
    super::HatScope::enter("some_hat", &store).unwrap_err();
}

#[test]
fn with_hat_does_not_run_closure_when_push_fails() {
    if !is_unconfined() {
        return;
    }

    let store = MemoryTokenStore::new();
    store.set(0x5eed).unwrap();
    let ran = AtomicBool::new(false);

    let r = super::with_hat("some_hat", &store, || ran.store(true, Ordering::SeqCst));
    r.unwrap_err();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn with_hat_rejects_empty_hat() {
    let store = MemoryTokenStore::new();
    store.set(0x5eed).unwrap();

    let err = super::with_hat("", &store, || ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn with_hat_runs_closure_inside_hat() {
    if !test_profiles_are_loaded() {
        return;
    }

    let store = MemoryTokenStore::new();
    store.set(crate::magic::generate().unwrap()).unwrap();
    let outside = crate::Confinement::current().unwrap();

    let label = super::with_hat("hat_c", &store, || {
        crate::Confinement::current()
            .unwrap()
            .label_str()
            .unwrap()
            .to_owned()
    })
    .unwrap();
    assert!(label.ends_with("//hat_c"));

    let after = crate::Confinement::current().unwrap();
    assert_eq!(outside.label(), after.label());
}

#[test]
fn scope_leaves_hat() {
    if !test_profiles_are_loaded() {
        return;
    }

    std::thread::spawn(|| {
        let store = MemoryTokenStore::new();
        store.set(crate::magic::generate().unwrap()).unwrap();
        let outside = crate::Confinement::current().unwrap();

        let scope = super::HatScope::enter("hat_c", &store).unwrap();
        assert_eq!(scope.hat(), "hat_c");
        let _ignored = format!("{:?}", &scope);
        scope.leave().unwrap();
        assert_eq!(crate::Confinement::current().unwrap().label(), outside.label());

        {
            let _scope = super::HatScope::enter("hat_c", &store).unwrap();
        }
        assert_eq!(crate::Confinement::current().unwrap().label(), outside.label());
    })
    .join()
    .unwrap();
}

#[test]
fn scope_inside_same_hat_pushes_nothing() {
    if !test_profiles_are_loaded() {
        return;
    }

    std::thread::spawn(|| {
        let store = MemoryTokenStore::new();
        store.set(crate::magic::generate().unwrap()).unwrap();
        let outside = crate::Confinement::current().unwrap();

        let outer = super::HatScope::enter("hat_c", &store).unwrap();
        assert!(outer.pushed());

        let inner = super::HatScope::enter("hat_c", &store).unwrap();
        assert!(!inner.pushed());
        inner.leave().unwrap();

        let inside = crate::Confinement::current().unwrap();
        assert!(inside.label_str().unwrap().ends_with("//hat_c"));

        outer.leave().unwrap();
        assert_eq!(crate::Confinement::current().unwrap().label(), outside.label());
    })
    .join()
    .unwrap();
}

#[test]
fn scope_is_not_entered_for_missing_hat() {
    if !test_profiles_are_loaded() {
        return;
    }

    std::thread::spawn(|| {
        let store = MemoryTokenStore::new();
        store.set(crate::magic::generate().unwrap()).unwrap();
        let outside = crate::Confinement::current().unwrap();

        let err = super::HatScope::enter("missing_hat", &store).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(crate::Confinement::current().unwrap().label(), outside.label());
    })
    .join()
    .unwrap();
}
