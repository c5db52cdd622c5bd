//! [`ProcessEventSource`] that polls procfs
//!
//! Every `poll_interval` the set of `(pid, start_time)` pairs under the proc
//! root is compared against the previous poll. New pairs are reported as
//! execs and vanished pairs as exits, so a recycled pid shows up as an exit
//! followed by an exec.
//!
//! `execve` keeps both the pid and the start time, so the target of
//! `/proc/<pid>/exe` is tracked too: when it changes for the same pair, an
//! exec is reported without an exit.
//!
//! Short-lived processes that start and exit between two polls are never
//! seen, which is harmless for instrumentation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};

use super::{ProcessCallback, ProcessEventSource, Subscribers, Subscription};
use crate::config::ManagerConfig;
use crate::domain::{ManagerError, Pid};

/// What a poll remembers about one process
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcEntry {
    start_time: u64,
    /// `None` for kernel threads and while the link is unreadable
    exe: Option<PathBuf>,
}

struct Worker {
    done: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ProcPoller {
    proc_root: PathBuf,
    poll_interval: Duration,
    scan_existing: bool,
    exec: Subscribers,
    exit: Subscribers,
    worker: Mutex<Option<Worker>>,
}

impl ProcPoller {
    #[must_use]
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            poll_interval: config.poll_interval,
            scan_existing: config.scan_existing,
            exec: Subscribers::new(),
            exit: Subscribers::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the polling thread
    ///
    /// Subscribe first: with `scan_existing` the first poll reports every
    /// running process, and events are not replayed to late subscribers.
    ///
    /// # Errors
    /// Returns [`ManagerError::AlreadyStarted`] on a second call, or
    /// [`ManagerError::Io`] if the proc root is unreadable or the thread
    /// cannot be spawned.
    pub fn start(&self) -> Result<(), ManagerError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(ManagerError::AlreadyStarted);
        }

        let initial = if self.scan_existing { HashMap::new() } else { snapshot(&self.proc_root)? };

        let (done_tx, done_rx) = bounded::<()>(0);
        let proc_root = self.proc_root.clone();
        let interval = self.poll_interval;
        let exec = self.exec.clone();
        let exit = self.exit.clone();

        let handle = thread::Builder::new().name("tlsprobe-procfs".into()).spawn(move || {
            let mut known = initial;
            let ticker = tick(interval);
            poll_once(&proc_root, &mut known, &exec, &exit);
            loop {
                select! {
                    recv(done_rx) -> _ => break,
                    recv(ticker) -> _ => poll_once(&proc_root, &mut known, &exec, &exit),
                }
            }
            debug!("procfs poller stopped");
        })?;

        *worker = Some(Worker { done: done_tx, handle });
        Ok(())
    }
}

impl ProcessEventSource for ProcPoller {
    fn subscribe_exec(&self, callback: ProcessCallback) -> Result<Subscription, ManagerError> {
        Ok(self.exec.add(callback))
    }

    fn subscribe_exit(&self, callback: ProcessCallback) -> Result<Subscription, ManagerError> {
        Ok(self.exit.add(callback))
    }

    fn find_dead_processes(&self, pids: &HashSet<Pid>) -> HashSet<Pid> {
        pids.iter().copied().filter(|&pid| !is_alive(&self.proc_root, pid)).collect()
    }

    fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Worker { done, handle }) = worker {
            drop(done);
            if handle.join().is_err() {
                warn!("procfs poller thread panicked");
            }
        }
    }
}

/// Diff the current process table against `known` and report changes
fn poll_once(
    proc_root: &Path,
    known: &mut HashMap<Pid, ProcEntry>,
    exec: &Subscribers,
    exit: &Subscribers,
) {
    let mut current = match snapshot(proc_root) {
        Ok(current) => current,
        Err(e) => {
            warn!("failed to scan {}: {e}", proc_root.display());
            return;
        }
    };

    for (pid, entry) in known.iter() {
        if current.get(pid).map(|now| now.start_time) != Some(entry.start_time) {
            exit.notify(*pid);
        }
    }
    for (pid, entry) in &mut current {
        match known.get(pid) {
            Some(before) if before.start_time == entry.start_time => {
                if entry.exe.is_none() {
                    // Unreadable for now, do not mistake it for a new image later
                    entry.exe.clone_from(&before.exe);
                } else if entry.exe != before.exe {
                    debug!("{pid} executed {:?}", entry.exe);
                    exec.notify(*pid);
                }
            }
            _ => exec.notify(*pid),
        }
    }
    *known = current;
}

/// Start time and executable of every process under `proc_root`
fn snapshot(proc_root: &Path) -> std::io::Result<HashMap<Pid, ProcEntry>> {
    let mut processes = HashMap::new();
    for entry in fs::read_dir(proc_root)?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        // Process may exit between readdir and read
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(start_time) = parse_start_time(&stat) {
            let exe = fs::read_link(entry.path().join("exe")).ok();
            processes.insert(Pid(pid), ProcEntry { start_time, exe });
        }
    }
    Ok(processes)
}

fn is_alive(proc_root: &Path, pid: Pid) -> bool {
    let stat_path = proc_root.join(pid.0.to_string()).join("stat");
    match fs::read_to_string(stat_path) {
        Ok(stat) => parse_state(&stat) != Some('Z'),
        Err(_) => false,
    }
}

/// Fields of `/proc/<pid>/stat` after the `(comm)` field, which may contain spaces
fn fields_after_comm(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    let close = stat.rfind(')')?;
    Some(stat[close + 1..].split_whitespace())
}

/// Field 3: process state
fn parse_state(stat: &str) -> Option<char> {
    fields_after_comm(stat)?.next()?.chars().next()
}

/// Field 22: start time in clock ticks since boot
fn parse_start_time(stat: &str) -> Option<u64> {
    // fields after comm start at field 3
    fields_after_comm(stat)?.nth(22 - 3)?.parse().ok()
}
