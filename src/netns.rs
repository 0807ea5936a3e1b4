//! Scoped entry into a network namespace.
//!
//! `setns(2)` only affects the calling thread. Everything spawned from that
//! thread while the guard is held (including `ip` child processes) runs in
//! the target namespace.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::NetnsError;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Holds the thread in a network namespace until left or dropped.
pub struct NetnsGuard {
    original: File,
    target: PathBuf,
    restored: bool,
}

impl NetnsGuard {
    /// Switch the current thread into the namespace at `path`
    pub fn enter(path: &Path) -> Result<Self, NetnsError> {
        let original = open_netns(Path::new(THREAD_NETNS))?;
        let target = open_netns(path)?;

        setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|source| {
            NetnsError::Enter {
                path: path.to_path_buf(),
                source,
            }
        })?;
        debug!(netns = %path.display(), "Entered network namespace");

        Ok(Self {
            original,
            target: path.to_path_buf(),
            restored: false,
        })
    }

    /// Return to the original namespace, reporting failure
    pub fn leave(mut self) -> Result<(), NetnsError> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), NetnsError> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        setns(self.original.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(NetnsError::Restore)?;
        debug!(netns = %self.target.display(), "Left network namespace");
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!(netns = %self.target.display(), error = %e, "Failed to restore network namespace");
        }
    }
}

/// Run `f` with the current thread inside `path`
pub fn in_netns<T, E, F>(path: &Path, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<NetnsError>,
{
    let guard = NetnsGuard::enter(path)?;
    let result = f();
    guard.leave()?;
    result
}

/// Open a namespace file, distinguishing a missing namespace
pub fn open_netns(path: &Path) -> Result<File, NetnsError> {
    File::open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            NetnsError::NotFound(path.to_path_buf())
        } else {
            NetnsError::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
