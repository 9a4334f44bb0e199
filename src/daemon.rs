use std::env;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;

use anyhow::{Context, Result};

/// Detach from the controlling terminal: double fork with an intervening
/// `setsid`, chdir to the working directory, umask 022, and stdio
/// redirected to /dev/null.
///
/// Must run before any threads are spawned (in particular before the
/// async runtime is built).
pub fn daemonize() -> Result<()> {
    // Resolved up front, re-asserted after the forks so relative paths
    // keep resolving from where the process was launched.
    let cwd = env::current_dir().context("resolve working directory")?;

    fork_and_exit_parent().context("first fork")?;

    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error()).context("setsid");
    }

    fork_and_exit_parent().context("second fork")?;

    let cwd = CString::new(cwd.as_os_str().as_bytes()).context("working directory path")?;
    if unsafe { libc::chdir(cwd.as_ptr()) } == -1 {
        return Err(io::Error::last_os_error()).context("chdir to working directory");
    }

    unsafe { libc::umask(0o022) };

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for fd in 0..=2 {
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error()).context("redirect stdio");
        }
    }

    Ok(())
}

/// Fork; the parent exits 0, the child continues.
fn fork_and_exit_parent() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error().into()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}
