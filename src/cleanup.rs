//! Best-effort teardown of still-running instances at process exit.
//!
//! `start()` registers an entry (working tree, later the child pid) and
//! `stop()` deregisters it, so an explicit stop never races the exit
//! hook. Whatever is still registered when the process exits normally is
//! terminated and its working tree removed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

/// Handle for one registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token(u64);

struct Entry {
    token: Token,
    pid: Option<i32>,
    rundir: PathBuf,
}

static ENTRIES: Mutex<Vec<Entry>> = Mutex::new(Vec::new());
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static INSTALL: Once = Once::new();

fn entries() -> MutexGuard<'static, Vec<Entry>> {
    ENTRIES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a working tree for exit cleanup. The pid is attached later,
/// once the child is spawned.
pub(crate) fn register(rundir: PathBuf) -> Token {
    INSTALL.call_once(install_exit_hook);
    let token = Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
    entries().push(Entry {
        token,
        pid: None,
        rundir,
    });
    token
}

/// Attach or clear the child pid of a registered instance.
pub(crate) fn set_pid(token: Token, pid: Option<i32>) {
    if let Some(entry) = entries().iter_mut().find(|e| e.token == token) {
        entry.pid = pid;
    }
}

/// Remove an instance from the registry. Called on explicit stop so the
/// exit hook cannot terminate the same child twice.
pub(crate) fn unregister(token: Token) {
    entries().retain(|e| e.token != token);
}

#[cfg(unix)]
fn install_exit_hook() {
    unsafe {
        nix::libc::atexit(exit_hook);
    }
}

// Without atexit the Drop impl on the controller is the only cleanup.
#[cfg(not(unix))]
fn install_exit_hook() {}

#[cfg(unix)]
extern "C" fn exit_hook() {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    let leftover = match ENTRIES.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
    };
    for entry in leftover {
        if let Some(pid) = entry.pid {
            let pid = Pid::from_raw(pid);
            let _ = kill(pid, Signal::SIGTERM);
            let _ = waitpid(pid, None);
        }
        let _ = std::fs::remove_dir_all(&entry.rundir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_bookkeeping() {
        let token = register(PathBuf::from("/nonexistent/slapd-test-0"));
        assert!(entries().iter().any(|e| e.token == token));

        set_pid(token, Some(12345));
        assert_eq!(
            entries().iter().find(|e| e.token == token).unwrap().pid,
            Some(12345)
        );

        set_pid(token, None);
        assert_eq!(
            entries().iter().find(|e| e.token == token).unwrap().pid,
            None
        );

        unregister(token);
        assert!(!entries().iter().any(|e| e.token == token));
        // A second unregister is harmless.
        unregister(token);
    }
}
