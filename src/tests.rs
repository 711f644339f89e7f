#![cfg(all(test, target_os = "linux", not(target_env = "kernel")))]

use std::os::raw::c_int;
use std::os::unix::net::{UnixListener, UnixStream};
use std::{env, io, thread};

use assert_matches::assert_matches;
use serial_test::serial;

use crate::errors::{Error, ErrorKind, Request};
use crate::{ConfinementMode, KernelSupport};

fn apparmor_is_supported() -> bool {
    crate::kernel_support() == KernelSupport::AppArmor
}

fn current_thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[test]
fn error_kind_from_errno() {
    use ErrorKind::*;

    for &(errno, request, kind) in &[
        (libc::ENOSYS, Request::Other, Unsupported),
        (libc::ENOPROTOOPT, Request::Other, Unsupported),
        (libc::EINVAL, Request::HatPush, InvalidArgument),
        (libc::ENOTSOCK, Request::Other, InvalidArgument),
        (libc::EBADF, Request::Other, InvalidArgument),
        (libc::EACCES, Request::HatPush, PermissionDenied),
        (libc::EPERM, Request::Other, PermissionDenied),
        (libc::EACCES, Request::HatPop, TokenMismatch),
        (libc::EPERM, Request::HatPop, TokenMismatch),
        (libc::ENOENT, Request::Other, NotFound),
        (libc::ENOMEM, Request::Other, ResourceExhausted),
        (libc::ERANGE, Request::Other, ResourceExhausted),
        (libc::EIO, Request::Other, Unknown),
        (libc::EEXIST, Request::HatPop, Unknown),
    ] {
        assert_eq!(ErrorKind::from_errno(errno, request), kind, "errno {}", errno);
    }
}

#[test]
fn error_kind_classify() {
    let err = io::Error::from_raw_os_error(libc::ENOSYS);
    assert_eq!(ErrorKind::classify(&err, Request::Other), ErrorKind::Unsupported);

    let err = io::Error::from_raw_os_error(libc::EACCES);
    let kind = ErrorKind::classify(&err, Request::HatPop);
    if apparmor_is_supported() {
        assert_eq!(kind, ErrorKind::TokenMismatch);
    } else {
        assert_eq!(kind, ErrorKind::Unsupported);
    }

    let err = io::Error::from(io::ErrorKind::InvalidData);
    let kind = ErrorKind::classify(&err, Request::Other);
    assert!(kind == ErrorKind::Unknown || kind == ErrorKind::Unsupported);
}

#[test]
fn error_display() {
    let err = Error::from_native_name(
        "aa_change_hat()",
        Request::HatPush,
        "some_hat",
        io::Error::from_raw_os_error(libc::ENOSYS),
    );
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(
        err.to_string(),
        "aa_change_hat() failed with 'some_hat': AppArmor is unsupported"
    );
    assert_eq!(
        err.io_source().and_then(io::Error::raw_os_error),
        Some(libc::ENOSYS)
    );

    let err = Error::unsupported("aa_getcon()");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(err.to_string(), "aa_getcon() failed: AppArmor is unsupported");

    let err = Error::invalid_input("aa_change_hatv()");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.to_string(), "aa_change_hatv() failed: invalid argument");

    let err = Error::from_io_path("x", "/a/b", io::ErrorKind::NotFound.into());
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "x failed on path '/a/b'");

    let err = Error::InvalidMagicToken("zz".into());
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.io_source().is_none());
}

#[test]
fn ret_val_to_result_captures_errno() {
    crate::errors::Error::set_errno(libc::EACCES);
    let err = crate::utils::ret_val_to_result(-1).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    crate::errors::Error::clear_errno();

    assert_eq!(crate::utils::ret_val_to_result(0).unwrap(), 0);
    assert_eq!(crate::utils::ret_val_to_result(42).unwrap(), 42);
}

#[test]
fn split_confinement() {
    for &(input, label, mode) in &[
        ("unconfined", "unconfined", None),
        ("unconfined\n", "unconfined", None),
        ("/path/to/executable (complain)", "/path/to/executable", Some("complain")),
        ("/path/to/executable (enforce)\n", "/path/to/executable", Some("enforce")),
        (
            "/path/to/executable//profile (complain)",
            "/path/to/executable//profile",
            Some("complain"),
        ),
        ("with (paren) (enforce)", "with (paren)", Some("enforce")),
        ("spaced   (kill)", "spaced", Some("kill")),
    ] {
        assert_eq!(
            super::split_confinement(input).unwrap(),
            (label, mode),
            "{:?}",
            input
        );
    }

    for &input in &["", "\n", "label", "label(enforce)", " (enforce)", "label ()"] {
        let err = super::split_confinement(input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{:?}", input);
    }
}

#[test]
fn confinement_mode_from_bytes() {
    assert_eq!(ConfinementMode::from_bytes(None), ConfinementMode::Unset);
    assert_eq!(ConfinementMode::from_bytes(Some(&b""[..])), ConfinementMode::Unset);
    assert_eq!(
        ConfinementMode::from_bytes(Some(&b"enforce"[..])),
        ConfinementMode::Enforce
    );
    assert_eq!(
        ConfinementMode::from_bytes(Some(&b"complain"[..])),
        ConfinementMode::Complain
    );
    assert_eq!(ConfinementMode::from_bytes(Some(&b"kill"[..])), ConfinementMode::Other);
}

#[test]
fn confinement_from_parts_rejects_null_label() {
    let err = super::Confinement::from_parts("xyz", std::ptr::null_mut(), std::ptr::null_mut())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
}

#[test]
fn change_hat_rejects_invalid_arguments() {
    let err = super::change_hat(Some("hat"), 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_hat(None, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_hat(Some("abc\0xyz"), 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_matches!(err, Error::Confinement1Name { .. });
}

#[test]
fn change_hat_vector_rejects_invalid_arguments() {
    let no_hats: [&str; 0] = [];
    let err = super::change_hat_vector(&no_hats, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_hat_vector(&["a", "", "b"], 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_hat_vector(&["a", "b\0c"], 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_hat_vector(&["a".to_owned()], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn change_profile_rejects_invalid_arguments() {
    let err = super::change_profile("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::change_profile("abc\0xyz").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = super::stack_profile("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn kernel_support_from_errno() {
    use KernelSupport::*;

    for &(errno, support) in &[
        (Some(libc::ENOENT), AppArmor),
        (Some(libc::EPERM), AppArmor),
        (Some(libc::EACCES), AppArmor),
        (Some(libc::ENOSYS), Unsupported),
        (Some(libc::ECANCELED), Unsupported),
        (Some(libc::ENOMEM), Unsupported),
        (Some(0), Unsupported),
        (None, Unsupported),
    ] {
        assert_eq!(super::kernel_support_from_errno(errno), support, "{:?}", errno);
    }
}

#[test]
#[serial]
fn every_operation_is_unsupported_without_apparmor() {
    if apparmor_is_supported() {
        return;
    }

    let (s1, _s2) = socketpair::socketpair_stream().unwrap();

    let results = [
        super::change_hat(Some("some_hat"), 0x1234).map(drop),
        super::change_hat(None, 0x1234).map(drop),
        super::change_hat_vector(&["a", "b", "c"], 0x1234).map(drop),
        super::change_profile("some_profile").map(drop),
        super::stack_profile("some_profile").map(drop),
        super::Confinement::current().map(drop),
        super::Confinement::of_task(current_thread_id()).map(drop),
        super::Confinement::of_peer_socket(&s1).map(drop),
        crate::path::mount_point().map(drop),
    ];

    for r in results {
        assert_eq!(r.unwrap_err().kind(), ErrorKind::Unsupported);
    }
}

#[test]
fn confinement_current() {
    let r = super::Confinement::current();
    if !apparmor_is_supported() {
        assert_eq!(r.unwrap_err().kind(), ErrorKind::Unsupported);
        return;
    }

    let confinement = r.unwrap();
    assert!(!confinement.as_ptr().is_null());
    assert!(!confinement.label().to_bytes().is_empty());
    let (label, mode) = confinement.to_owned_parts().unwrap();
    assert_eq!(label, confinement.label_str().unwrap());
    assert_eq!(mode.as_deref(), confinement.mode_str().unwrap());
    if confinement.is_unconfined() {
        assert_eq!(confinement.mode_kind(), ConfinementMode::Unset);
        assert_eq!(confinement.to_string(), "unconfined");
    }
    let _ignored = format!("{:?}", &confinement);
}

#[test]
fn confinement_current_copies_are_independent() {
    let (first, second) = match (
        super::Confinement::current(),
        super::Confinement::current(),
    ) {
        (Ok(first), Ok(second)) => (first, second),
        _ => return,
    };

    assert_ne!(first.as_ptr(), second.as_ptr());
    assert_eq!(first.label(), second.label());
    assert_eq!(first.mode(), second.mode());

    let expected = second.to_owned_parts().unwrap();
    drop(first);
    assert_eq!(second.to_owned_parts().unwrap(), expected);
}

#[test]
fn confinement_of_task() {
    let current = super::Confinement::current();
    let task = super::Confinement::of_task(current_thread_id());

    match (current, task) {
        (Ok(current), Ok(task)) => {
            assert_eq!(current.label(), task.label());
            assert_eq!(current.mode(), task.mode());
        }

        (Err(_), Err(err)) => assert_eq!(err.kind(), ErrorKind::Unsupported),

        (current, task) => panic!("{:?} != {:?}", current, task),
    }

    if apparmor_is_supported() {
        let err = super::Confinement::of_task(libc::pid_t::MAX).unwrap_err();
        assert_matches!(err, Error::Confinement1Process { .. });
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[test]
fn confinement_of_peer_socket() {
    let (s1, s2) = socketpair::socketpair_stream().unwrap();

    for socket in &[&s1, &s2] {
        match super::Confinement::of_peer_socket(*socket) {
            Ok(peer) => {
                let current = super::Confinement::current().unwrap();
                assert_eq!(peer.label(), current.label());
            }

            // Some kernels do not label `socketpair()` peers.
            Err(err) => assert!(
                err.kind() == ErrorKind::Unsupported || err.kind() == ErrorKind::InvalidArgument,
                "{:?}",
                err
            ),
        }
    }
}

#[test]
fn confinement_of_non_socket() {
    let file = tempfile::tempfile().unwrap();
    let err = super::Confinement::of_peer_socket(&file).unwrap_err();
    let kind = err.kind();
    assert!(
        kind == ErrorKind::InvalidArgument || kind == ErrorKind::Unsupported,
        "{:?}",
        err
    );
}

#[test]
fn change_hat_fails_when_unconfined() {
    let current = match super::Confinement::current() {
        Ok(current) if current.is_unconfined() => current,
        _ => return,
    };

    super::change_hat(Some("no_such_hat"), 0x5eed).unwrap_err();

    let after = super::Confinement::current().unwrap();
    assert_eq!(current.label(), after.label());
}

//
// The following tests need AppArmor test profiles to be loaded, and the test
// binary to run under `apparmor_test`, in enforce mode:
//
//     profile apparmor_test /path/to/test/binary {
//         # ...rules needed by the test harness...
//         ^hat_c { }
//         change_profile -> apparmor_test_target,
//         change_profile -> example_profile,
//         change_profile -> example_peer_profile,
//     }
//     profile apparmor_test_target { }
//     profile example_profile { }
//     profile example_peer_profile { }
//
// They run only when `APPARMOR_TEST_PROFILES=1`.
//

fn test_profiles_are_loaded() -> bool {
    env::var_os("APPARMOR_TEST_PROFILES").map_or(false, |v| v == "1")
}

fn in_new_thread<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    thread::scope(|scope| scope.spawn(f).join().unwrap())
}

#[test]
#[serial]
fn hat_push_pop_restores_label() {
    if !test_profiles_are_loaded() {
        return;
    }

    in_new_thread(|| {
        let before = super::Confinement::current().unwrap();
        let token = crate::magic::generate().unwrap();

        super::change_hat(Some("hat_c"), token).unwrap();
        let inside = super::Confinement::current().unwrap();
        assert!(inside.label_str().unwrap().ends_with("//hat_c"));

        // The hat of this thread is not visible from another thread.
        let other = in_new_thread(|| super::Confinement::current().unwrap().to_owned_parts());
        assert_eq!(other.unwrap().0, before.label_str().unwrap());

        super::change_hat(None, token).unwrap();
        let after = super::Confinement::current().unwrap();
        assert_eq!(before.label(), after.label());
        assert_eq!(before.mode(), after.mode());
    });
}

#[test]
#[serial]
fn hat_vector_selects_first_acceptable_hat() {
    if !test_profiles_are_loaded() {
        return;
    }

    in_new_thread(|| {
        let before = super::Confinement::current().unwrap();
        let token = crate::magic::generate().unwrap();
        let hats = ["missing_a", "missing_b", "hat_c", "missing_d", "missing_e"];

        super::change_hat_vector(&hats, token).unwrap();
        let inside = super::Confinement::current().unwrap();
        assert!(inside.label_str().unwrap().ends_with("//hat_c"));

        super::change_hat(None, token).unwrap();
        let after = super::Confinement::current().unwrap();
        assert_eq!(before.label(), after.label());

        let err = super::change_hat_vector(&["missing_a", "missing_b"], token).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::Unsupported);
    });
}

#[test]
#[serial]
fn profile_change_is_not_undone_by_hat_pop() {
    if !test_profiles_are_loaded() {
        return;
    }

    in_new_thread(|| {
        super::change_profile("apparmor_test_target").unwrap();
        let target = super::Confinement::current().unwrap();
        assert_eq!(target.label_str().unwrap(), "apparmor_test_target");

        // No hat is pushed, so there is nothing to return to.
        if let Err(err) = super::change_hat(None, 0x0bad_cafe) {
            assert_ne!(err.kind(), ErrorKind::Unsupported);
        }
        let after = super::Confinement::current().unwrap();
        assert_eq!(after.label(), target.label());
    });
}

/// Exit status of a child that pushed a hat then popped it with a wrong token.
const POP_REFUSED_INSIDE_HAT: c_int = 3;

fn pop_with_wrong_token() -> c_int {
    let token = crate::magic::generate().map_or(0x5eed, |token| token | 0b10);
    if super::change_hat(Some("hat_c"), token).is_err() {
        return 2;
    }

    match super::change_hat(None, token ^ 1) {
        Ok(()) => 0,

        Err(err) if err.kind() == ErrorKind::TokenMismatch => {
            let still_inside = super::Confinement::current()
                .map_or(false, |current| current.label().to_bytes().ends_with(b"//hat_c"));
            if still_inside {
                POP_REFUSED_INSIDE_HAT
            } else {
                5
            }
        }

        Err(_) => 4,
    }
}

#[test]
#[serial]
fn hat_pop_with_wrong_token_is_refused() {
    if !test_profiles_are_loaded() {
        return;
    }

    // The kernel may kill the task, so the attempt runs in a child process.
    let _support = super::kernel_support();
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "{}", io::Error::last_os_error());
    if pid == 0 {
        let status = pop_with_wrong_token();
        unsafe { libc::_exit(status) };
    }

    let mut status: c_int = 0;
    let r = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(r, pid, "{}", io::Error::last_os_error());

    if libc::WIFSIGNALED(status) {
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
    } else {
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), POP_REFUSED_INSIDE_HAT);
    }
}

#[test]
#[serial]
fn peer_confinement_is_exchanged_over_local_socket() {
    if !test_profiles_are_loaded() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("peer.sock");
    let listener_path = socket_path.clone();
    let (ready_sender, ready_receiver) = std::sync::mpsc::channel();

    let server = thread::spawn(move || {
        super::change_profile("example_profile").unwrap();
        let listener = UnixListener::bind(&listener_path).unwrap();
        ready_sender.send(()).unwrap();
        let (stream, _address) = listener.accept().unwrap();
        super::Confinement::of_peer_socket(&stream)
            .unwrap()
            .to_owned_parts()
            .unwrap()
    });

    let client = thread::spawn(move || {
        super::change_profile("example_peer_profile").unwrap();
        ready_receiver.recv().unwrap();
        let stream = UnixStream::connect(&socket_path).unwrap();
        super::Confinement::of_peer_socket(&stream)
            .unwrap()
            .to_owned_parts()
            .unwrap()
    });

    let (client_label, client_mode) = server.join().unwrap();
    let (server_label, server_mode) = client.join().unwrap();

    assert_eq!(client_label, "example_peer_profile");
    assert_eq!(server_label, "example_profile");
    for mode in &[client_mode, server_mode] {
        assert!(
            mode.as_deref() == Some("enforce") || mode.as_deref() == Some("complain"),
            "{:?}",
            mode
        );
    }
}
