//! Resolve the executable image of a process from procfs.
//!
//! The identity of a binary is the `(device, inode)` of the file as seen
//! through `/proc/<pid>/root`, so processes in other mount namespaces resolve
//! to the same identity as long as they run the same file.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use regex::Regex;

use crate::config::ManagerConfig;
use crate::domain::{BinaryId, ManagerError, Pid};

/// Executable image of a live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    pub id: BinaryId,
    /// Target of `/proc/<pid>/exe`, in the process's own mount namespace
    pub exe_path: PathBuf,
    /// `<proc_root>/<pid>/root/<exe_path>`, openable from our namespace
    pub host_path: PathBuf,
}

/// Outcome of [`BinaryResolver::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(ResolvedBinary),
    /// The executable belongs to tlsprobe itself
    Excluded,
    /// Process is gone or its executable cannot be read
    NotFound,
}

/// Binary identity resolver with the self-instrumentation filter
#[derive(Debug)]
pub struct BinaryResolver {
    proc_root: PathBuf,
    retry_window: Duration,
    retry_sleep: Duration,
    exclude: Regex,
}

impl BinaryResolver {
    /// # Errors
    /// Fails if the configured exclusion pattern does not compile.
    pub fn new(config: &ManagerConfig) -> Result<Self, ManagerError> {
        Ok(Self {
            proc_root: config.proc_root.clone(),
            retry_window: config.resolve_retry_window,
            retry_sleep: config.resolve_retry_sleep,
            exclude: config.exclude_regex()?,
        })
    }

    /// Resolve the executable of `pid`.
    ///
    /// Right after an exec notification procfs may not have published the
    /// `exe` link yet, so reading it is retried for the configured window.
    #[must_use]
    pub fn resolve(&self, pid: Pid) -> Resolution {
        let pid_dir = self.proc_root.join(pid.0.to_string());

        let Some(exe_path) = self.read_exe_link(&pid_dir.join("exe")) else {
            return Resolution::NotFound;
        };

        if self.is_excluded(&exe_path) {
            debug!("ignoring {pid}, it is an internal component ({})", exe_path.display());
            return Resolution::Excluded;
        }

        let host_path = namespaced_path(&pid_dir, &exe_path);
        match fs::metadata(&host_path) {
            Ok(meta) => Resolution::Found(ResolvedBinary {
                id: BinaryId::from_metadata(&meta),
                exe_path,
                host_path,
            }),
            Err(e) => {
                debug!("could not stat binary path {}: {e}", host_path.display());
                Resolution::NotFound
            }
        }
    }

    /// True if `path` names one of our own executables
    #[must_use]
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.is_match(&path.to_string_lossy())
    }

    fn read_exe_link(&self, exe_link: &Path) -> Option<PathBuf> {
        let deadline = Instant::now() + self.retry_window;
        loop {
            match fs::read_link(exe_link) {
                Ok(path) => return Some(path),
                Err(_) if Instant::now() < deadline => thread::sleep(self.retry_sleep),
                Err(_) => return None,
            }
        }
    }
}

/// Path of `exe_path` as seen through the process's root directory
fn namespaced_path(pid_dir: &Path, exe_path: &Path) -> PathBuf {
    let relative = exe_path.strip_prefix("/").unwrap_or(exe_path);
    pid_dir.join("root").join(relative)
}
