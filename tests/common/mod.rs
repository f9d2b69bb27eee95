#![allow(dead_code)]

use std::path::PathBuf;

/// Whether this kernel lets an unprivileged process create a user
/// namespace. Checked in a forked child so the test process is untouched.
pub fn user_namespaces_available() -> bool {
    use nix::sched::{unshare, CloneFlags};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = if unshare(CloneFlags::CLONE_NEWUSER).is_ok() { 0 } else { 1 };
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            matches!(waitpid(child, None), Ok(WaitStatus::Exited(_, 0)))
        }
        Err(_) => false,
    }
}

/// A root filesystem to run overlay tests against, from `ROOTBOX_TEST_ROOTFS`
pub fn test_rootfs() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("ROOTBOX_TEST_ROOTFS")?);
    path.join("bin/sh").exists().then_some(path)
}

/// Snapshot of the host mount table
pub fn mount_table() -> String {
    std::fs::read_to_string("/proc/self/mounts").unwrap_or_default()
}
